//! Prepares the managed database before the service starts: fresh
//! initialization on first boot, ownership repair and upgrade afterwards.

use std::fs;
use std::path::{Path, PathBuf};

use pgshift_core::{Config, Error, Result};

use crate::exec::{CommandPlan, CommandStep, as_user};
use crate::orchestrator::{Orchestrator, UpgradeOutcome};
use crate::output::OutputSink;

/// Server log used while the freshly initialized cluster is briefly started.
const INIT_LOG_PATH: &str = "/tmp/pgsql.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preparation {
    /// `PGHOST`/`PGDATASOURCE` is set; the managed database is not used.
    External,
    /// A new cluster was created at `path`.
    Initialized { path: PathBuf },
    Existing(UpgradeOutcome),
}

/// Commands creating a new cluster with the configured database.
#[must_use]
pub fn init_plan(config: &Config, path: &Path) -> CommandPlan {
    let user = &config.db_system_user;
    let wrap = |step: CommandStep| as_user(&config.privilege_wrapper, user, step);
    CommandPlan::new()
        .step(CommandStep::new("mkdir").arg("-p").path_arg(path))
        .step(CommandStep::new("chown").arg(user).path_arg(path))
        .step(wrap(
            CommandStep::new("initdb").arg("-D").path_arg(path).arg("--nosync"),
        ))
        .step(wrap(
            CommandStep::new("pg_ctl")
                .arg("-D")
                .path_arg(path)
                .args(["-o -c listen_addresses=127.0.0.1", "-l", INIT_LOG_PATH, "-w", "start"]),
        ))
        .step(wrap(CommandStep::new("createdb").arg(&config.database_name)))
        .step(wrap(
            CommandStep::new("pg_ctl")
                .arg("-D")
                .path_arg(path)
                .args(["-m", "fast", "-l", INIT_LOG_PATH, "-w", "stop"]),
        ))
}

/// `mkdir -p <dir>` and `chown -R <user> <dir>`.
fn own_dir_plan(config: &Config, dir: &Path, create: bool) -> CommandPlan {
    let mut plan = CommandPlan::new();
    if create {
        plan = plan.step(CommandStep::new("mkdir").arg("-p").path_arg(dir));
    }
    plan.step(
        CommandStep::new("chown")
            .arg("-R")
            .arg(&config.db_system_user)
            .path_arg(dir),
    )
}

impl Orchestrator<'_> {
    /// Make the managed database ready to serve.
    pub fn prepare(&self) -> Result<Preparation> {
        let config = self.config;
        if config.external_database {
            tracing::info!("external database configured, skipping local setup");
            return Ok(Preparation::External);
        }
        // Nothing below may touch the filesystem while an upgrade is unresolved.
        self.check_recovery_gate()?;

        self.run_plan(
            &own_dir_plan(config, &config.run_dir, true),
            "preparing the socket directory",
        )?;

        let path = config.pg_data_path();
        match fs::metadata(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "initializing the internal database");
                if let Err(e) =
                    self.run_plan(&init_plan(config, &path), "initializing the database")
                {
                    if let Err(cleanup) = fs::remove_dir_all(&path)
                        && cleanup.kind() != std::io::ErrorKind::NotFound
                    {
                        tracing::warn!(
                            path = %path.display(),
                            error = %cleanup,
                            "could not remove the partially initialized data directory"
                        );
                    }
                    return Err(e);
                }
                Ok(Preparation::Initialized { path })
            }
            Err(e) => Err(e.into()),
            Ok(_) => {
                // The volume owner may have changed between restarts.
                self.run_plan(
                    &own_dir_plan(config, &path, false),
                    "adjusting data directory ownership",
                )?;
                self.run().map(Preparation::Existing)
            }
        }
    }

    fn run_plan(&self, plan: &CommandPlan, what: &str) -> Result<()> {
        let mut out = OutputSink::from_config(self.config);
        self.executor.run(plan, &mut out).map_err(|e| {
            tracing::error!(error = %e, "{what} failed");
            Error::Bootstrap {
                reason: format!("{what}: {e}"),
                output: out.contents(),
            }
        })
    }
}
