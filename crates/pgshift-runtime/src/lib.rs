//! Container runtime adapter for pgshift.
//!
//! The upgrade pipeline needs exactly six runtime operations: pull, create,
//! start, wait, logs, and inspect. They are modelled by [`ContainerRuntime`]
//! so the pipeline can be driven by the Docker CLI in production and by a
//! scripted fake in tests. Every call blocks until the runtime answers; no
//! call is retried.

#![forbid(unsafe_code)]

pub mod docker;
pub mod inspect;

use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;

use chrono::Utc;
use pgshift_core::MountBinding;
use thiserror::Error;

pub use docker::DockerCli;
pub use inspect::parse_inspect;

/// Errors raised by a runtime backend.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to launch {bin}: {source}")]
    Launch {
        bin: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with status {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("unexpected output from `{command}`: {detail}")]
    UnexpectedOutput { command: String, detail: String },

    #[error("I/O error while streaming runtime output: {0}")]
    Io(#[from] io::Error),
}

impl RuntimeError {
    /// Attach the operation name and convert into the pipeline error.
    #[must_use]
    pub fn into_error(self, op: &'static str) -> pgshift_core::Error {
        pgshift_core::Error::runtime(op, self.to_string())
    }
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// One `source:target` bind mount for the helper container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    /// Host-visible path.
    pub source: PathBuf,
    /// Path inside the helper container.
    pub target: PathBuf,
}

impl BindSpec {
    #[must_use]
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for BindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source.display(), self.target.display())
    }
}

/// Everything needed to create the helper container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub working_dir: PathBuf,
    pub binds: Vec<BindSpec>,
}

/// Terminal exit status reported by `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(pub i64);

impl ExitStatus {
    #[must_use]
    pub const fn success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit status {}", self.0)
    }
}

/// Bind and mount metadata of an inspected container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMounts {
    /// Raw `HostConfig.Binds` entries (`source:destination[:options]`).
    pub binds: Vec<String>,
    /// `Mounts` entries.
    pub mounts: Vec<MountBinding>,
}

/// The subset of a container runtime the upgrade pipeline relies on.
pub trait ContainerRuntime {
    /// Pull `image`, copying progress output into `out`.
    fn pull_image(&self, image: &str, out: &mut dyn Write) -> RuntimeResult<()>;

    /// Create (but do not start) a container; returns its id.
    fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    fn start_container(&self, id: &str) -> RuntimeResult<()>;

    /// Block until the container is no longer running.
    fn wait_container(&self, id: &str) -> RuntimeResult<ExitStatus>;

    /// Copy the container's combined stdout/stderr into `out`.
    fn fetch_logs(&self, id: &str, out: &mut dyn Write) -> RuntimeResult<()>;

    fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerMounts>;
}

/// Unique-enough name for a helper container, e.g. `pgshift-upgrade-1718000000`.
#[must_use]
pub fn helper_container_name() -> String {
    format!("pgshift-upgrade-{}", Utc::now().timestamp())
}
