//! Refuses to start over a half-finished upgrade.
//!
//! A ledger reading `started` means a previous run died somewhere between
//! creating the helper container and writing `done`. The data directory may
//! be in either layout at that point, so the gate never resumes. It prints
//! the commands that put the directories back and fails.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use pgshift_core::models::suffixed_path;
use pgshift_core::{Error, Result, UpgradeStatus, VersionPair};

use crate::host_path::HostPathResolver;
use crate::ledger::{self, LedgerEntry};
use crate::version;

/// Layout of the data directory left behind by an interrupted upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    /// `<data>` already holds the new cluster, `<data>-<old>` the old one.
    Swapped,
    /// `<data>` still holds the old cluster; `<data>-<new>` may exist.
    NotSwapped,
    /// The version marker could not be read.
    Unknown,
}

impl SwapState {
    /// Infer the layout from the on-disk marker of `data_path`.
    #[must_use]
    pub fn detect(data_path: &Path, pair: &VersionPair) -> Self {
        match version::read_version(data_path) {
            Ok(on_disk) if on_disk == pair.new => Self::Swapped,
            Ok(_) => Self::NotSwapped,
            Err(_) => Self::Unknown,
        }
    }
}

fn swapped_commands(host_data: &Path, host_upgrade_dir: &Path, pair: &VersionPair) -> Vec<String> {
    vec![
        format!(
            "mv {} {}",
            host_data.display(),
            backup_path(host_data, pair).display()
        ),
        format!(
            "mv {} {}",
            suffixed_path(host_data, &pair.old).display(),
            host_data.display()
        ),
        format!("rm -rf {}", host_upgrade_dir.display()),
    ]
}

fn not_swapped_commands(
    host_data: &Path,
    host_upgrade_dir: &Path,
    pair: &VersionPair,
) -> Vec<String> {
    vec![
        format!(
            "mv {} {}",
            suffixed_path(host_data, &pair.new).display(),
            backup_path(host_data, pair).display()
        ),
        format!("rm -rf {}", host_upgrade_dir.display()),
    ]
}

/// `<data>-<new>.bak`, where the partial new cluster is parked.
fn backup_path(host_data: &Path, pair: &VersionPair) -> PathBuf {
    suffixed_path(host_data, &format!("{}.bak", pair.new))
}

/// Operator instructions for an interrupted `pair` upgrade.
///
/// Both command sequences are always listed. The one matching `state` comes
/// first and is marked as such.
#[must_use]
pub fn remediation_text(
    state: SwapState,
    host_data: &Path,
    host_upgrade_dir: &Path,
    pair: &VersionPair,
) -> String {
    let swapped = (
        "If the data directory was already swapped",
        swapped_commands(host_data, host_upgrade_dir, pair),
    );
    let not_swapped = (
        "If the data directory was not swapped yet",
        not_swapped_commands(host_data, host_upgrade_dir, pair),
    );
    let ordered = match state {
        SwapState::Swapped => [swapped, not_swapped],
        SwapState::NotSwapped | SwapState::Unknown => [not_swapped, swapped],
    };

    let mut text = format!(
        "An upgrade of the internal database from {} to {} was interrupted.\n\
         Inspect the directories and run one of these sequences on the host, then restart:\n",
        pair.old, pair.new
    );
    for (index, (label, commands)) in ordered.iter().enumerate() {
        let marker = if index == 0 && state != SwapState::Unknown {
            " (matches the current layout)"
        } else {
            ""
        };
        let _ = writeln!(text, "\n{label}{marker}:");
        for command in commands {
            let _ = writeln!(text, "  $ {command}");
        }
    }
    text
}

/// Checks every upgrade ledger next to the data directory.
#[derive(Debug, Clone)]
pub struct RecoveryGate {
    data_path: PathBuf,
    expected: String,
}

impl RecoveryGate {
    #[must_use]
    pub fn new(data_path: impl Into<PathBuf>, expected: impl Into<String>) -> Self {
        Self {
            data_path: data_path.into(),
            expected: expected.into(),
        }
    }

    fn data_parent(&self) -> &Path {
        self.data_path.parent().unwrap_or_else(|| Path::new("/"))
    }

    /// Fail with [`Error::InterruptedUpgrade`] when an upgrade to the
    /// expected version was left `started`. Mutates nothing.
    ///
    /// `resolver` turns the paths in the remediation text into host paths;
    /// if that fails, container paths are printed instead.
    pub fn check(&self, resolver: &HostPathResolver<'_>) -> Result<()> {
        let parent = self.data_parent();
        let mut interrupted: Option<LedgerEntry> = None;
        for entry in ledger::discover_all(parent)? {
            if entry.status != UpgradeStatus::Started {
                continue;
            }
            if entry.pair.new == self.expected {
                if interrupted.is_none() {
                    interrupted = Some(entry);
                }
            } else {
                tracing::warn!(
                    ledger = %entry.ledger.path().display(),
                    pair = %entry.pair,
                    "ignoring interrupted upgrade to a version this build does not run"
                );
            }
        }
        let Some(entry) = interrupted else {
            return Ok(());
        };

        let host_parent = resolver.resolve(parent).unwrap_or_else(|e| {
            tracing::warn!(
                error = %e,
                "could not resolve host paths, remediation uses container paths"
            );
            parent.to_path_buf()
        });
        let host_data = host_parent.join(self.data_path.file_name().unwrap_or_default());
        let host_upgrade_dir = host_parent.join(entry.pair.upgrade_dir_name());
        let state = SwapState::detect(&self.data_path, &entry.pair);

        let remediation = remediation_text(state, &host_data, &host_upgrade_dir, &entry.pair);
        tracing::error!(
            ledger = %entry.ledger.path().display(),
            layout = ?state,
            "interrupted database upgrade detected\n{remediation}"
        );
        Err(Error::InterruptedUpgrade { remediation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> VersionPair {
        VersionPair::new("9.6", "11")
    }

    #[test]
    fn not_swapped_sequence_moves_the_partial_cluster_aside() {
        let text = remediation_text(
            SwapState::NotSwapped,
            Path::new("/host/data/postgresql"),
            Path::new("/host/data/.9.6-to-11-upgrade"),
            &pair(),
        );
        let first = text.split("\n\n").nth(1).expect("first sequence");
        assert!(first.contains("(matches the current layout)"), "{text}");
        assert!(first.contains("$ mv /host/data/postgresql-11 /host/data/postgresql-11.bak"));
        assert!(first.contains("$ rm -rf /host/data/.9.6-to-11-upgrade"));
    }

    #[test]
    fn swapped_sequence_restores_the_old_cluster() {
        let text = remediation_text(
            SwapState::Swapped,
            Path::new("/host/data/postgresql"),
            Path::new("/host/data/.9.6-to-11-upgrade"),
            &pair(),
        );
        let first = text.split("\n\n").nth(1).expect("first sequence");
        assert!(first.starts_with("If the data directory was already swapped"));
        assert!(first.contains("$ mv /host/data/postgresql /host/data/postgresql-11.bak"));
        assert!(first.contains("$ mv /host/data/postgresql-9.6 /host/data/postgresql"));
    }

    #[test]
    fn unknown_layout_lists_both_without_a_preference() {
        let text = remediation_text(
            SwapState::Unknown,
            Path::new("/d/postgresql"),
            Path::new("/d/.9.6-to-11-upgrade"),
            &pair(),
        );
        assert!(!text.contains("matches the current layout"));
        assert!(text.contains("already swapped"));
        assert!(text.contains("not swapped yet"));
    }

    #[test]
    fn swap_state_follows_the_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("postgresql");
        assert_eq!(SwapState::detect(&data, &pair()), SwapState::Unknown);

        std::fs::create_dir_all(&data).expect("mkdir");
        std::fs::write(data.join("PG_VERSION"), "9.6\n").expect("write");
        assert_eq!(SwapState::detect(&data, &pair()), SwapState::NotSwapped);

        std::fs::write(data.join("PG_VERSION"), "11\n").expect("write");
        assert_eq!(SwapState::detect(&data, &pair()), SwapState::Swapped);
    }
}
