//! Data model shared by the upgrade pipeline.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// File name of the ledger inside a scratch workspace.
pub const LEDGER_FILE_NAME: &str = "status";

/// File name of the version marker inside a data directory.
pub const VERSION_MARKER_FILE_NAME: &str = "PG_VERSION";

/// Persisted upgrade progress for one version pair.
///
/// An absent ledger file is [`UpgradeStatus::Empty`]; the two other variants
/// are the only values ever written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpgradeStatus {
    Empty,
    Started,
    Done,
}

impl UpgradeStatus {
    /// Parse persisted ledger contents. Only `started` and `done` (after
    /// trimming) are accepted; everything else, including an empty file, is
    /// rejected.
    #[must_use]
    pub fn parse_persisted(raw: &str) -> Option<Self> {
        match raw.trim() {
            "started" => Some(Self::Started),
            "done" => Some(Self::Done),
            _ => None,
        }
    }

    /// The literal written to the ledger file, or `None` for `Empty`, which is
    /// represented by the file's absence.
    #[must_use]
    pub const fn persisted(self) -> Option<&'static str> {
        match self {
            Self::Empty => None,
            Self::Started => Some("started"),
            Self::Done => Some("done"),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Started => "started",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for UpgradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An (on-disk version, runtime version) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VersionPair {
    pub old: String,
    pub new: String,
}

impl VersionPair {
    #[must_use]
    pub fn new(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }

    /// Exact string equality; no semantic version parsing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.old == self.new
    }

    /// Name of the scratch workspace that also keys this pair's ledger,
    /// e.g. `.9.6-to-11-upgrade`.
    #[must_use]
    pub fn upgrade_dir_name(&self) -> String {
        format!(".{}-to-{}-upgrade", self.old, self.new)
    }

    /// Inverse of [`VersionPair::upgrade_dir_name`].
    #[must_use]
    pub fn from_upgrade_dir_name(name: &str) -> Option<Self> {
        let inner = name.strip_prefix('.')?.strip_suffix("-upgrade")?;
        let (old, new) = inner.split_once("-to-")?;
        if old.is_empty() || new.is_empty() {
            return None;
        }
        Some(Self::new(old, new))
    }

    /// Version-pair tagged helper image, e.g. `tianon/postgres-upgrade:9.6-to-11`.
    #[must_use]
    pub fn helper_image(&self, repo: &str) -> String {
        format!("{repo}:{}-to-{}", self.old, self.new)
    }
}

impl fmt::Display for VersionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.old, self.new)
    }
}

/// A `(container path, host path)` relationship discovered by inspecting
/// the running container. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountBinding {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl MountBinding {
    /// Parse a `source:destination[:options]` bind string.
    #[must_use]
    pub fn parse_bind(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, ':');
        let source = parts.next().filter(|s| !s.is_empty())?;
        let destination = parts.next().filter(|s| !s.is_empty())?;
        Some(Self {
            source: PathBuf::from(source),
            destination: PathBuf::from(destination),
        })
    }
}

/// Append `-<suffix>` to the last component of `path`
/// (`/data/postgresql` + `9.6` ⇒ `/data/postgresql-9.6`).
#[must_use]
pub fn suffixed_path(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push("-");
    raw.push(suffix);
    PathBuf::from(raw)
}

/// The ephemeral unit of work handed to the upgrade runner.
#[derive(Debug, Clone)]
pub struct UpgradeJob {
    pub pair: VersionPair,
    /// Data directory as seen from this container.
    pub data_path: PathBuf,
    /// Host-visible parent of the data directory.
    pub host_data_parent: PathBuf,
    pub image: String,
    /// Scratch workspace as seen from this container.
    pub work_dir: PathBuf,
}

impl UpgradeJob {
    /// Host-visible path of the data directory.
    #[must_use]
    pub fn host_data_path(&self) -> PathBuf {
        self.host_data_parent.join(file_name_of(&self.data_path))
    }

    #[must_use]
    pub fn host_work_dir(&self) -> PathBuf {
        self.host_data_parent.join(file_name_of(&self.work_dir))
    }

    /// Where the old data directory is moved once the upgrade succeeds.
    #[must_use]
    pub fn old_backup_path(&self) -> PathBuf {
        suffixed_path(&self.data_path, &self.pair.old)
    }

    /// Where the helper writes the upgraded cluster (local view).
    #[must_use]
    pub fn new_data_path(&self) -> PathBuf {
        suffixed_path(&self.data_path, &self.pair.new)
    }

    #[must_use]
    pub fn host_new_data_path(&self) -> PathBuf {
        suffixed_path(&self.host_data_path(), &self.pair.new)
    }
}

fn file_name_of(path: &Path) -> &std::ffi::OsStr {
    path.file_name().unwrap_or(path.as_os_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn persisted_status_accepts_only_known_literals() {
        assert_eq!(
            UpgradeStatus::parse_persisted("started\n"),
            Some(UpgradeStatus::Started)
        );
        assert_eq!(
            UpgradeStatus::parse_persisted("  done "),
            Some(UpgradeStatus::Done)
        );
        assert_eq!(UpgradeStatus::parse_persisted(""), None);
        assert_eq!(UpgradeStatus::parse_persisted("Started"), None);
        assert_eq!(UpgradeStatus::parse_persisted("finished"), None);
    }

    #[test]
    fn empty_status_is_never_persisted() {
        assert_eq!(UpgradeStatus::Empty.persisted(), None);
        assert_eq!(UpgradeStatus::Started.persisted(), Some("started"));
        assert_eq!(UpgradeStatus::Done.persisted(), Some("done"));
    }

    #[test]
    fn upgrade_dir_name_round_trips() {
        let pair = VersionPair::new("9.6", "11");
        assert_eq!(pair.upgrade_dir_name(), ".9.6-to-11-upgrade");
        assert_eq!(
            VersionPair::from_upgrade_dir_name(".9.6-to-11-upgrade"),
            Some(pair)
        );
        assert_eq!(VersionPair::from_upgrade_dir_name("9.6-to-11-upgrade"), None);
        assert_eq!(VersionPair::from_upgrade_dir_name(".-to-11-upgrade"), None);
        assert_eq!(VersionPair::from_upgrade_dir_name(".postgresql"), None);
    }

    #[test]
    fn helper_image_is_tagged_with_the_pair() {
        let pair = VersionPair::new("9.6", "11");
        assert_eq!(pair.helper_image("helper-image"), "helper-image:9.6-to-11");
    }

    #[test]
    fn parse_bind_keeps_source_and_destination() {
        let bind = MountBinding::parse_bind("/host/data:/data:rw").expect("bind");
        assert_eq!(bind.source, PathBuf::from("/host/data"));
        assert_eq!(bind.destination, PathBuf::from("/data"));
        assert!(MountBinding::parse_bind("/only-source").is_none());
        assert!(MountBinding::parse_bind(":/data").is_none());
    }

    #[test]
    fn job_paths_follow_the_data_directory() {
        let job = UpgradeJob {
            pair: VersionPair::new("9.6", "11"),
            data_path: PathBuf::from("/data/postgresql"),
            host_data_parent: PathBuf::from("/srv/app/data"),
            image: "helper-image:9.6-to-11".into(),
            work_dir: PathBuf::from("/data/.9.6-to-11-upgrade"),
        };
        assert_eq!(job.host_data_path(), PathBuf::from("/srv/app/data/postgresql"));
        assert_eq!(
            job.host_work_dir(),
            PathBuf::from("/srv/app/data/.9.6-to-11-upgrade")
        );
        assert_eq!(job.old_backup_path(), PathBuf::from("/data/postgresql-9.6"));
        assert_eq!(job.new_data_path(), PathBuf::from("/data/postgresql-11"));
        assert_eq!(
            job.host_new_data_path(),
            PathBuf::from("/srv/app/data/postgresql-11")
        );
    }

    proptest! {
        #[test]
        fn dir_name_parse_inverts_render(
            old in "[0-9]{1,2}(\\.[0-9]{1,2})?",
            new in "[0-9]{1,2}(\\.[0-9]{1,2})?",
        ) {
            let pair = VersionPair::new(old, new);
            prop_assert_eq!(
                VersionPair::from_upgrade_dir_name(&pair.upgrade_dir_name()),
                Some(pair)
            );
        }
    }
}
