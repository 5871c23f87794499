//! Maps a path inside this container to the path the host sees.
//!
//! The helper container is created by the host's runtime, so its bind
//! sources must be host paths. Only exact mount points are resolved; a path
//! nested below a mount point is not translated.

use std::path::{Path, PathBuf};

use pgshift_core::{Error, MountBinding, Result};
use pgshift_runtime::{ContainerMounts, ContainerRuntime};

use crate::probe::EnvironmentProbe;

/// Find the host source of `container_path` among `mounts`.
///
/// `HostConfig.Binds` entries are consulted first, then `Mounts`.
#[must_use]
pub fn find_host_path(mounts: &ContainerMounts, container_path: &Path) -> Option<PathBuf> {
    mounts
        .binds
        .iter()
        .filter_map(|raw| MountBinding::parse_bind(raw))
        .chain(mounts.mounts.iter().cloned())
        .find(|binding| binding.destination == container_path)
        .map(|binding| binding.source)
}

pub struct HostPathResolver<'a> {
    runtime: &'a dyn ContainerRuntime,
    probe: &'a dyn EnvironmentProbe,
}

impl<'a> HostPathResolver<'a> {
    #[must_use]
    pub fn new(runtime: &'a dyn ContainerRuntime, probe: &'a dyn EnvironmentProbe) -> Self {
        Self { runtime, probe }
    }

    /// Resolve `container_path` by inspecting the running container.
    pub fn resolve(&self, container_path: &Path) -> Result<PathBuf> {
        let container = self.probe.container_id()?;
        let mounts = self
            .runtime
            .inspect_container(&container)
            .map_err(|e| e.into_error("inspect"))?;
        let host = find_host_path(&mounts, container_path).ok_or_else(|| {
            Error::HostPathNotFound {
                path: container_path.to_path_buf(),
                container: container.clone(),
            }
        })?;
        tracing::debug!(
            container = %container,
            path = %container_path.display(),
            host = %host.display(),
            "resolved host path"
        );
        Ok(host)
    }
}
