//! Discovers the id of the container this process runs in.

use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

use pgshift_core::{Config, Error, Result};
use regex::Regex;

static CONTAINER_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9a-f]{64}").expect("valid container id regex"));

static MOUNTINFO_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/containers/([0-9a-f]{64})/").expect("valid mountinfo regex")
});

/// Source of this process's container id.
pub trait EnvironmentProbe {
    fn container_id(&self) -> Result<String>;
}

/// A fixed container id (from `CONTAINER_ID`, or a test).
#[derive(Debug, Clone)]
pub struct StaticProbe(pub String);

impl EnvironmentProbe for StaticProbe {
    fn container_id(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Reads the id from `/proc/self/cgroup`, falling back to
/// `/proc/self/mountinfo` on cgroup v2 hosts.
#[derive(Debug, Clone)]
pub struct ProcProbe {
    cgroup_path: PathBuf,
    mountinfo_path: PathBuf,
}

impl ProcProbe {
    #[must_use]
    pub fn new(cgroup_path: impl Into<PathBuf>, mountinfo_path: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_path: cgroup_path.into(),
            mountinfo_path: mountinfo_path.into(),
        }
    }
}

impl EnvironmentProbe for ProcProbe {
    fn container_id(&self) -> Result<String> {
        let cgroup = fs::read_to_string(&self.cgroup_path).map_err(|e| {
            Error::ContainerIdUnavailable(format!(
                "failed to read {}: {e}",
                self.cgroup_path.display()
            ))
        })?;
        if let Some(id) = id_from_cgroup(&cgroup) {
            return Ok(id);
        }

        tracing::debug!(
            path = %self.mountinfo_path.display(),
            "cgroup file has no container path, trying mountinfo"
        );
        let mountinfo = fs::read_to_string(&self.mountinfo_path).unwrap_or_default();
        id_from_mountinfo(&mountinfo).ok_or_else(|| {
            Error::ContainerIdUnavailable(format!(
                "failed to parse {} (first line {:?})",
                self.cgroup_path.display(),
                cgroup.lines().next().unwrap_or_default()
            ))
        })
    }
}

/// Select the probe implied by `config`.
#[must_use]
pub fn probe_from_config(config: &Config) -> Box<dyn EnvironmentProbe> {
    match &config.container_id {
        Some(id) => Box::new(StaticProbe(id.clone())),
        None => Box::new(ProcProbe::new(&config.cgroup_path, &config.mountinfo_path)),
    }
}

/// `11:hugetlb:/docker/<id>` ⇒ `<id>`.
///
/// The path after the second `/` of the first line is the id. When that path
/// embeds a 64-hex-digit id (systemd slices, nested runtimes) only the id is
/// returned.
#[must_use]
pub fn id_from_cgroup(contents: &str) -> Option<String> {
    let line = contents.lines().next()?;
    let mut parts = line.splitn(3, '/');
    let (_, _, tail) = (parts.next()?, parts.next()?, parts.next()?);
    let tail = tail.trim();
    if tail.is_empty() {
        return None;
    }
    Some(
        CONTAINER_ID_RE
            .find(tail)
            .map_or_else(|| tail.to_string(), |m| m.as_str().to_string()),
    )
}

#[must_use]
pub fn id_from_mountinfo(contents: &str) -> Option<String> {
    MOUNTINFO_ID_RE
        .captures(contents)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
