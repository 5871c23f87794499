//! Reads the version marker persisted in the data directory.

use std::fs;
use std::path::Path;

use pgshift_core::models::VERSION_MARKER_FILE_NAME;
use pgshift_core::{Error, Result, VersionPair};

/// Read the trimmed on-disk format version of the data directory.
///
/// A missing, unreadable, or blank marker is [`Error::VersionUnknown`]: we
/// cannot decide whether an upgrade is needed without it.
pub fn read_version(data_path: &Path) -> Result<String> {
    let marker = data_path.join(VERSION_MARKER_FILE_NAME);
    let raw = fs::read_to_string(&marker).map_err(|e| Error::VersionUnknown {
        path: marker.clone(),
        reason: e.to_string(),
    })?;
    let version = raw.trim();
    if version.is_empty() {
        return Err(Error::VersionUnknown {
            path: marker,
            reason: "version marker is empty".into(),
        });
    }
    Ok(version.to_string())
}

/// Pair the on-disk version with the version the runtime expects.
pub fn detect(data_path: &Path, expected: &str) -> Result<VersionPair> {
    let on_disk = read_version(data_path)?;
    Ok(VersionPair::new(on_disk, expected.trim()))
}
