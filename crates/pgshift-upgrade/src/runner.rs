//! Drives one upgrade attempt from workspace creation to the `done` ledger.

use std::fmt;
use std::fs;
use std::io::Write as _;
use std::path::Path;

use pgshift_core::{Config, Error, Result, UpgradeJob, UpgradeStatus};
use pgshift_runtime::{BindSpec, ContainerRuntime, ContainerSpec, helper_container_name};

use crate::exec::{CommandPlan, CommandStep, PrivilegedExecutor, as_user};
use crate::ledger::Ledger;
use crate::output::OutputSink;
use crate::recovery::{SwapState, remediation_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Pulling,
    Running,
    Logging,
    Finalizing,
    Done,
    Failed,
}

impl RunnerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pulling => "pulling",
            Self::Running => "running",
            Self::Logging => "logging",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The helper container definition for `job`.
///
/// Binds the scratch workspace at the helper's working directory, the old
/// cluster at `<data_root>/<old>/data` and the (not yet existing) new
/// cluster directory at `<data_root>/<new>/data`.
#[must_use]
pub fn helper_container_spec(config: &Config, job: &UpgradeJob, name: String) -> ContainerSpec {
    let version_data = |version: &str| config.helper_data_root.join(version).join("data");
    ContainerSpec {
        name,
        image: job.image.clone(),
        working_dir: config.helper_workdir.clone(),
        binds: vec![
            BindSpec::new(job.host_work_dir(), &config.helper_workdir),
            BindSpec::new(job.host_data_path(), version_data(&job.pair.old)),
            BindSpec::new(job.host_new_data_path(), version_data(&job.pair.new)),
        ],
    }
}

pub struct UpgradeRunner<'a> {
    config: &'a Config,
    runtime: &'a dyn ContainerRuntime,
    executor: &'a dyn PrivilegedExecutor,
    state: RunnerState,
}

impl<'a> UpgradeRunner<'a> {
    #[must_use]
    pub fn new(
        config: &'a Config,
        runtime: &'a dyn ContainerRuntime,
        executor: &'a dyn PrivilegedExecutor,
    ) -> Self {
        Self {
            config,
            runtime,
            executor,
            state: RunnerState::Idle,
        }
    }

    #[must_use]
    pub const fn state(&self) -> RunnerState {
        self.state
    }

    fn enter(&mut self, state: RunnerState) {
        tracing::debug!(from = %self.state, to = %state, "upgrade runner");
        self.state = state;
    }

    /// Run `job` to completion.
    ///
    /// The ledger reads `started` before the helper container exists and
    /// `done` only once the swapped cluster is owned and optimized. On any
    /// failure the runner ends in [`RunnerState::Failed`], the ledger is
    /// left at `started` and the pre-swap layout is restored.
    pub fn run(&mut self, job: &UpgradeJob, ledger: &Ledger, out: &mut OutputSink) -> Result<()> {
        let result = self.drive(job, ledger, out);
        match &result {
            Ok(()) => self.enter(RunnerState::Done),
            Err(e) => {
                tracing::error!(phase = %self.state, error = %e, "database upgrade failed");
                self.enter(RunnerState::Failed);
            }
        }
        result
    }

    fn drive(&mut self, job: &UpgradeJob, ledger: &Ledger, out: &mut OutputSink) -> Result<()> {
        fs::create_dir_all(&job.work_dir)?;
        ledger.write(UpgradeStatus::Started)?;
        tracing::info!(
            from = %job.pair.old,
            to = %job.pair.new,
            "upgrading the internal database, do not interrupt this operation"
        );

        self.enter(RunnerState::Pulling);
        tracing::info!(image = %job.image, "pulling upgrade helper image");
        self.runtime
            .pull_image(&job.image, out)
            .map_err(|e| e.into_error("pull"))?;

        self.enter(RunnerState::Running);
        let spec = helper_container_spec(self.config, job, helper_container_name());
        let name = spec.name.clone();
        let id = self
            .runtime
            .create_container(&spec)
            .map_err(|e| e.into_error("create"))?;
        self.runtime
            .start_container(&id)
            .map_err(|e| e.into_error("start"))?;
        tracing::info!(container = %name, "upgrade helper started");
        let waited = self.runtime.wait_container(&id);

        self.enter(RunnerState::Logging);
        let logs = self.runtime.fetch_logs(&id, out);
        let status = match waited {
            Ok(status) => status,
            Err(e) => {
                if let Err(log_err) = logs {
                    tracing::warn!(error = %log_err, "could not collect helper logs");
                }
                return Err(container_failed(&name, format!("wait failed: {e}"), out));
            }
        };
        if !status.success() {
            if let Err(log_err) = logs {
                tracing::warn!(error = %log_err, "could not collect helper logs");
            }
            return Err(container_failed(&name, status.to_string(), out));
        }
        logs.map_err(|e| e.into_error("logs"))?;
        tracing::info!(container = %name, "upgrade helper finished");

        self.enter(RunnerState::Finalizing);
        self.finalize(job, out)?;

        // Until `done` is durable the swapped layout must not outlive the run.
        if let Err(e) = ledger.write(UpgradeStatus::Done) {
            return Err(roll_back(job, "recording the finished upgrade", e.to_string(), out));
        }
        tracing::info!(from = %job.pair.old, to = %job.pair.new, "database upgrade complete");
        Ok(())
    }

    /// Swap the clusters, re-own the new one and run the optimize script.
    /// A failure after the swap moves both directories back.
    fn finalize(&self, job: &UpgradeJob, out: &mut OutputSink) -> Result<()> {
        let data = &job.data_path;
        let old_backup = job.old_backup_path();
        let new_data = job.new_data_path();

        if !new_data.is_dir() {
            return Err(finalize_failed(
                "locating the upgraded cluster",
                format!("{} does not exist", new_data.display()),
                out,
            ));
        }

        rename(data, &old_backup)
            .map_err(|reason| finalize_failed("moving the old cluster aside", reason, out))?;
        if let Err(reason) = rename(&new_data, data) {
            return Err(roll_back(job, "moving the upgraded cluster into place", reason, out));
        }

        let user = &self.config.db_system_user;
        let chown = CommandPlan::new()
            .step(CommandStep::new("chown").arg("-R").arg(user).path_arg(data))
            .in_dir(&job.work_dir);
        if let Err(e) = self.executor.run(&chown, out) {
            return Err(roll_back(job, "fixing ownership", e.to_string(), out));
        }

        // The optimize script picks up the *.sql and *.sh files pg_upgrade
        // left in the workspace, so it runs from there.
        let optimize = CommandPlan::new()
            .step(as_user(
                &self.config.privilege_wrapper,
                user,
                CommandStep::new(self.config.optimize_script.display().to_string()).path_arg(data),
            ))
            .in_dir(&job.work_dir);
        if let Err(e) = self.executor.run(&optimize, out) {
            return Err(roll_back(job, "running the optimize script", e.to_string(), out));
        }
        Ok(())
    }
}

/// Restore the pre-swap layout after a failed finalization step.
fn roll_back(job: &UpgradeJob, step: &'static str, reason: String, out: &mut OutputSink) -> Error {
    match restore_layout(&job.data_path, &job.old_backup_path(), &job.new_data_path()) {
        Ok(()) => {
            tracing::warn!(step, "finalization failed, moved the old cluster back into place");
            finalize_failed(step, reason, out)
        }
        Err(rollback) => {
            let remediation = remediation_text(
                SwapState::Swapped,
                &job.host_data_path(),
                &job.host_work_dir(),
                &job.pair,
            );
            tracing::error!(
                step,
                error = %rollback,
                "could not restore the old cluster\n{remediation}"
            );
            finalize_failed(step, format!("{reason}; rollback also failed: {rollback}"), out)
        }
    }
}

fn restore_layout(
    data: &Path,
    old_backup: &Path,
    new_data: &Path,
) -> std::result::Result<(), String> {
    if data.exists() && !new_data.exists() {
        rename(data, new_data)?;
    }
    rename(old_backup, data)
}

fn rename(from: &Path, to: &Path) -> std::result::Result<(), String> {
    tracing::debug!(from = %from.display(), to = %to.display(), "rename");
    fs::rename(from, to)
        .map_err(|e| format!("mv {} {}: {e}", from.display(), to.display()))
}

fn container_failed(name: &str, reason: String, out: &mut OutputSink) -> Error {
    let _ = out.flush();
    Error::UpgradeContainerFailed {
        container: name.to_string(),
        reason,
        output: out.contents(),
    }
}

fn finalize_failed(step: &'static str, reason: String, out: &mut OutputSink) -> Error {
    let _ = out.flush();
    Error::Finalize {
        step,
        reason,
        output: out.contents(),
    }
}
