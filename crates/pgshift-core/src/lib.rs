//! Core types, configuration, and errors for pgshift
//!
//! This crate provides:
//! - Configuration management (`Config`, environment parsing)
//! - The upgrade data model (`UpgradeStatus`, `VersionPair`, `MountBinding`, `UpgradeJob`)
//! - The shared error taxonomy

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod models;

// Re-export key types for convenience
pub use config::{BootstrapSummary, Config};
pub use error::{Error, Result};
pub use models::{MountBinding, UpgradeJob, UpgradeStatus, VersionPair};
