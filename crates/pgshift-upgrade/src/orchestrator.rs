//! Top-level upgrade sequence: gate, version check, runner.

use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};

use pgshift_core::models::suffixed_path;
use pgshift_core::{Config, Error, Result, UpgradeJob, UpgradeStatus, VersionPair};
use pgshift_runtime::ContainerRuntime;
use serde::Serialize;

use crate::exec::PrivilegedExecutor;
use crate::host_path::HostPathResolver;
use crate::ledger::{self, Ledger};
use crate::output::OutputSink;
use crate::probe::EnvironmentProbe;
use crate::recovery::RecoveryGate;
use crate::runner::UpgradeRunner;
use crate::version;

/// Result of a successful [`Orchestrator::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpgradeOutcome {
    /// On-disk and expected versions already match; nothing was touched.
    UpToDate { version: String },
    Upgraded { from: String, to: String },
}

impl fmt::Display for UpgradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate { version } => write!(f, "database is up to date (version {version})"),
            Self::Upgraded { from, to } => write!(f, "database upgraded from {from} to {to}"),
        }
    }
}

/// One ledger in a [`StatusReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerReport {
    pub from: String,
    pub to: String,
    pub status: UpgradeStatus,
    pub path: PathBuf,
}

/// Read-only snapshot of the data directory and its upgrade ledgers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub data_path: PathBuf,
    pub on_disk_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_error: Option<String>,
    pub expected_version: String,
    pub upgrade_needed: bool,
    /// A ledger targeting the expected version reads `started`.
    pub interrupted: bool,
    pub ledgers: Vec<LedgerReport>,
}

impl StatusReport {
    /// Plain-text rendering for terminals.
    #[must_use]
    pub fn render(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "data:      {}", self.data_path.display());
        match (&self.on_disk_version, &self.version_error) {
            (Some(v), _) => {
                let _ = writeln!(text, "on disk:   {v}");
            }
            (None, Some(e)) => {
                let _ = writeln!(text, "on disk:   unknown ({e})");
            }
            (None, None) => {
                let _ = writeln!(text, "on disk:   unknown");
            }
        }
        let _ = writeln!(text, "expected:  {}", self.expected_version);
        let state = if self.interrupted {
            "interrupted upgrade, manual recovery required"
        } else if self.upgrade_needed {
            "upgrade pending"
        } else {
            "up to date"
        };
        let _ = writeln!(text, "state:     {state}");
        if self.ledgers.is_empty() {
            let _ = writeln!(text, "ledgers:   none");
        } else {
            let _ = writeln!(text, "ledgers:");
            for l in &self.ledgers {
                let _ = writeln!(
                    text,
                    "  {} -> {}  {:<8} {}",
                    l.from,
                    l.to,
                    l.status.as_str(),
                    l.path.display()
                );
            }
        }
        text
    }
}

/// Wires configuration and collaborators into the upgrade sequence.
pub struct Orchestrator<'a> {
    pub(crate) config: &'a Config,
    runtime: &'a dyn ContainerRuntime,
    pub(crate) executor: &'a dyn PrivilegedExecutor,
    probe: &'a dyn EnvironmentProbe,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(
        config: &'a Config,
        runtime: &'a dyn ContainerRuntime,
        executor: &'a dyn PrivilegedExecutor,
        probe: &'a dyn EnvironmentProbe,
    ) -> Self {
        Self {
            config,
            runtime,
            executor,
            probe,
        }
    }

    fn resolver(&self) -> HostPathResolver<'_> {
        HostPathResolver::new(self.runtime, self.probe)
    }

    /// Refuse to continue past a `started` ledger for the expected version.
    pub(crate) fn check_recovery_gate(&self) -> Result<()> {
        RecoveryGate::new(self.config.pg_data_path(), &self.config.pg_version)
            .check(&self.resolver())
    }

    /// Bring the data directory to the expected version.
    ///
    /// Equal versions return [`UpgradeOutcome::UpToDate`] without writing a
    /// ledger or contacting the runtime beyond the gate.
    pub fn run(&self) -> Result<UpgradeOutcome> {
        let data_path = self.config.pg_data_path();
        self.check_recovery_gate()?;

        let pair = version::detect(&data_path, &self.config.pg_version)?;
        if pair.is_noop() {
            tracing::info!(version = %pair.new, "database version matches, no upgrade needed");
            return Ok(UpgradeOutcome::UpToDate { version: pair.new });
        }

        let job = self.plan(pair, data_path)?;
        let ledger = Ledger::new(&job.work_dir);
        let mut out = OutputSink::from_config(self.config);
        UpgradeRunner::new(self.config, self.runtime, self.executor).run(&job, &ledger, &mut out)?;
        Ok(UpgradeOutcome::Upgraded {
            from: job.pair.old,
            to: job.pair.new,
        })
    }

    /// Check preconditions and resolve host paths for an upgrade of
    /// `data_path`. Mutates nothing.
    pub fn plan(&self, pair: VersionPair, data_path: PathBuf) -> Result<UpgradeJob> {
        for target in [
            suffixed_path(&data_path, &pair.old),
            suffixed_path(&data_path, &pair.new),
        ] {
            if target.exists() {
                return Err(Error::StaleArtifact { path: target });
            }
        }

        let parent = data_parent(&data_path).to_path_buf();
        let host_data_parent = self.resolver().resolve(&parent)?;
        let image = pair.helper_image(&self.config.helper_image_repo);
        let work_dir = parent.join(pair.upgrade_dir_name());
        Ok(UpgradeJob {
            pair,
            data_path,
            host_data_parent,
            image,
            work_dir,
        })
    }

    /// Describe the on-disk state without changing it.
    pub fn status(&self) -> Result<StatusReport> {
        let data_path = self.config.pg_data_path();
        let expected = self.config.pg_version.clone();
        let (on_disk_version, version_error) = match version::read_version(&data_path) {
            Ok(v) => (Some(v), None),
            Err(e) => (None, Some(e.to_string())),
        };

        let ledgers: Vec<LedgerReport> = ledger::discover_all(data_parent(&data_path))?
            .into_iter()
            .map(|entry| LedgerReport {
                path: entry.ledger.path(),
                from: entry.pair.old,
                to: entry.pair.new,
                status: entry.status,
            })
            .collect();
        let interrupted = ledgers
            .iter()
            .any(|l| l.to == expected && l.status == UpgradeStatus::Started);
        let upgrade_needed = on_disk_version.as_deref().is_some_and(|v| v != expected);

        Ok(StatusReport {
            data_path,
            on_disk_version,
            version_error,
            expected_version: expected,
            upgrade_needed,
            interrupted,
            ledgers,
        })
    }
}

fn data_parent(data_path: &Path) -> &Path {
    data_path.parent().unwrap_or_else(|| Path::new("/"))
}
