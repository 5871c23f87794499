//! In-place major-version upgrade of the managed PostgreSQL data directory.
//!
//! The sequence is driven by [`Orchestrator`]:
//!
//! 1. [`RecoveryGate`] refuses to continue over a ledger left at `started`.
//! 2. [`version::detect`] compares the on-disk marker with the expected
//!    version; equal versions end the run.
//! 3. [`HostPathResolver`] maps the data directory to its host path.
//! 4. [`UpgradeRunner`] records `started`, runs the helper container,
//!    swaps the clusters and records `done`.

#![forbid(unsafe_code)]

pub mod bootstrap;
pub mod exec;
pub mod host_path;
pub mod ledger;
pub mod orchestrator;
pub mod output;
pub mod probe;
pub mod recovery;
pub mod runner;
pub mod version;

pub use bootstrap::Preparation;
pub use exec::{CommandPlan, CommandStep, ExecFailure, PrivilegedExecutor, ShellExecutor};
pub use host_path::HostPathResolver;
pub use ledger::{Ledger, LedgerEntry};
pub use orchestrator::{LedgerReport, Orchestrator, StatusReport, UpgradeOutcome};
pub use output::OutputSink;
pub use probe::{EnvironmentProbe, ProcProbe, StaticProbe, probe_from_config};
pub use recovery::{RecoveryGate, SwapState};
pub use runner::{RunnerState, UpgradeRunner};
