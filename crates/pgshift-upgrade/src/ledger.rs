//! Durable upgrade status ledger.
//!
//! One ledger lives in each upgrade workspace
//! (`<data_dir>/.<old>-to-<new>-upgrade/status`). Its content is exactly
//! `started` or `done`; an absent file means no upgrade was ever attempted.

use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use pgshift_core::models::LEDGER_FILE_NAME;
use pgshift_core::{Error, Result, UpgradeStatus, VersionPair};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    dir: PathBuf,
}

impl Ledger {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The ledger of the `pair` workspace under `data_parent`.
    #[must_use]
    pub fn for_pair(data_parent: &Path, pair: &VersionPair) -> Self {
        Self::new(data_parent.join(pair.upgrade_dir_name()))
    }

    /// The workspace directory holding the ledger.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(LEDGER_FILE_NAME)
    }

    /// Current status. An absent file (or workspace) reads as
    /// [`UpgradeStatus::Empty`].
    pub fn read(&self) -> Result<UpgradeStatus> {
        let path = self.path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(UpgradeStatus::Empty),
            Err(source) => return Err(Error::LedgerRead { path, source }),
        };
        UpgradeStatus::parse_persisted(&raw).ok_or_else(|| Error::InvalidLedgerState {
            path,
            value: raw.trim().to_string(),
        })
    }

    /// Durably record `status`. Writing [`UpgradeStatus::Empty`] removes the
    /// ledger file.
    pub fn write(&self, status: UpgradeStatus) -> Result<()> {
        let path = self.path();
        let result = match status.persisted() {
            Some(value) => fs::create_dir_all(&self.dir)
                .and_then(|()| atomic_write_bytes(&path, value.as_bytes())),
            None => match fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
        };
        result.map_err(|source| Error::LedgerWrite {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), status = %status, "ledger updated");
        Ok(())
    }
}

/// A ledger found by [`discover_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub pair: VersionPair,
    pub ledger: Ledger,
    pub status: UpgradeStatus,
}

/// Every upgrade workspace directly under `data_parent`, sorted by directory
/// name. A missing `data_parent` yields no entries.
pub fn discover_all(data_parent: &Path) -> Result<Vec<LedgerEntry>> {
    let entries = match fs::read_dir(data_parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(pair) = name.to_str().and_then(VersionPair::from_upgrade_dir_name) else {
            continue;
        };
        let ledger = Ledger::new(entry.path());
        let status = ledger.read()?;
        found.push(LedgerEntry {
            pair,
            ledger,
            status,
        });
    }
    found.sort_by(|a, b| a.ledger.dir.cmp(&b.ledger.dir));
    Ok(found)
}

/// Workspaces under `data_parent` whose upgrade targets `new_version`.
pub fn discover(data_parent: &Path, new_version: &str) -> Result<Vec<LedgerEntry>> {
    let mut found = discover_all(data_parent)?;
    found.retain(|entry| entry.pair.new == new_version);
    Ok(found)
}

/// Write `data` to `path` via a synced temp file and a rename, so a crash
/// leaves either the old or the new content.
fn atomic_write_bytes(path: &Path, data: &[u8]) -> io::Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_path = parent.join(format!(".tmp-{}-{seq}-{LEDGER_FILE_NAME}", std::process::id()));
    let mut f = fs::File::create(&tmp_path)?;
    f.write_all(data)?;
    f.sync_data()?;
    fs::rename(&tmp_path, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp_path);
    })
}
