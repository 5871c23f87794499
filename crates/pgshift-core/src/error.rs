//! Error types for pgshift
//!
//! Every variant aborts the startup sequence. Nothing here is retried.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for pgshift operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pgshift
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Unknown state
    // ==========================================================================
    #[error("Cannot determine on-disk database version at {}: {reason}", path.display())]
    VersionUnknown { path: PathBuf, reason: String },

    #[error("Unrecognized upgrade ledger value {value:?} in {}", path.display())]
    InvalidLedgerState { path: PathBuf, value: String },

    #[error("Failed to read upgrade ledger {}: {source}", path.display())]
    LedgerRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write upgrade ledger {}: {source}", path.display())]
    LedgerWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==========================================================================
    // Environment discovery
    // ==========================================================================
    #[error("Couldn't find host mountpoint of {} on container {container:?}", path.display())]
    HostPathNotFound { path: PathBuf, container: String },

    #[error("Failed to determine running container id: {0}")]
    ContainerIdUnavailable(String),

    // ==========================================================================
    // Interrupted prior run
    // ==========================================================================
    #[error("Interrupted internal database upgrade detected")]
    InterruptedUpgrade { remediation: String },

    // ==========================================================================
    // External operations
    // ==========================================================================
    #[error("Upgrade container {container:?} failed: {reason}")]
    UpgradeContainerFailed {
        container: String,
        reason: String,
        output: String,
    },

    #[error("Container runtime {op} failed: {message}")]
    Runtime { op: &'static str, message: String },

    #[error("Upgrade failed while {step}: {reason}")]
    Finalize {
        step: &'static str,
        reason: String,
        output: String,
    },

    #[error("Setting up the database failed: {reason}")]
    Bootstrap { reason: String, output: String },

    #[error("Refusing to upgrade: {} already exists", path.display())]
    StaleArtifact { path: PathBuf },

    // ==========================================================================
    // I/O Errors
    // ==========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable code for the error.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::VersionUnknown { .. } => "VERSION_UNKNOWN",
            Self::InvalidLedgerState { .. } => "INVALID_LEDGER_STATE",
            Self::LedgerRead { .. } | Self::LedgerWrite { .. } => "LEDGER_IO",
            Self::HostPathNotFound { .. } => "HOST_PATH_NOT_FOUND",
            Self::ContainerIdUnavailable(_) => "CONTAINER_ID_UNAVAILABLE",
            Self::InterruptedUpgrade { .. } => "INTERRUPTED_UPGRADE",
            Self::UpgradeContainerFailed { .. } => "UPGRADE_CONTAINER_FAILED",
            Self::Runtime { .. } => "RUNTIME_ERROR",
            Self::Finalize { .. } => "FINALIZE_FAILED",
            Self::Bootstrap { .. } => "BOOTSTRAP_FAILED",
            Self::StaleArtifact { .. } => "STALE_ARTIFACT",
            Self::Io(_) => "OS_ERROR",
            Self::Serialization(_) => "TYPE_ERROR",
        }
    }

    /// The phase that was running when the error occurred.
    #[must_use]
    pub fn phase(&self) -> &'static str {
        match self {
            Self::InterruptedUpgrade { .. } => "recovery-gate",
            Self::VersionUnknown { .. } => "version-reader",
            Self::InvalidLedgerState { .. }
            | Self::LedgerRead { .. }
            | Self::LedgerWrite { .. } => "ledger",
            Self::HostPathNotFound { .. } | Self::ContainerIdUnavailable(_) => "host-path",
            Self::Runtime { op, .. } => match *op {
                "pull" => "pulling",
                "logs" => "logging",
                "inspect" => "host-path",
                _ => "running",
            },
            Self::UpgradeContainerFailed { .. } => "running",
            Self::Finalize { .. } | Self::StaleArtifact { .. } => "finalizing",
            Self::Bootstrap { .. } => "bootstrap",
            Self::Io(_) | Self::Serialization(_) => "internal",
        }
    }

    /// Diagnostic output captured from the failing external operation.
    #[must_use]
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::UpgradeContainerFailed { output, .. }
            | Self::Finalize { output, .. }
            | Self::Bootstrap { output, .. } => Some(output.as_str()).filter(|s| !s.is_empty()),
            _ => None,
        }
    }

    /// Operator commands that restore a consistent state, if any.
    #[must_use]
    pub fn remediation(&self) -> Option<&str> {
        match self {
            Self::InterruptedUpgrade { remediation } => Some(remediation),
            _ => None,
        }
    }

    pub fn runtime(op: &'static str, message: impl Into<String>) -> Self {
        Self::Runtime {
            op,
            message: message.into(),
        }
    }
}
