//! Parsing of `docker inspect` output.

use std::path::PathBuf;

use pgshift_core::MountBinding;
use serde::Deserialize;

use crate::{ContainerMounts, RuntimeError, RuntimeResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    #[serde(default)]
    host_config: Option<InspectedHostConfig>,
    #[serde(default)]
    mounts: Option<Vec<InspectedMount>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedHostConfig {
    #[serde(default)]
    binds: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedMount {
    #[serde(default)]
    source: String,
    #[serde(default)]
    destination: String,
}

/// Parse the JSON array printed by `docker inspect <id>`.
pub fn parse_inspect(json: &str) -> RuntimeResult<ContainerMounts> {
    let containers: Vec<InspectedContainer> =
        serde_json::from_str(json).map_err(|e| RuntimeError::UnexpectedOutput {
            command: "docker inspect".into(),
            detail: e.to_string(),
        })?;
    let Some(container) = containers.into_iter().next() else {
        return Err(RuntimeError::UnexpectedOutput {
            command: "docker inspect".into(),
            detail: "no container in inspect output".into(),
        });
    };

    let binds = container
        .host_config
        .and_then(|hc| hc.binds)
        .unwrap_or_default();
    let mounts = container
        .mounts
        .unwrap_or_default()
        .into_iter()
        .filter(|m| !m.source.is_empty() && !m.destination.is_empty())
        .map(|m| MountBinding {
            source: PathBuf::from(m.source),
            destination: PathBuf::from(m.destination),
        })
        .collect();

    Ok(ContainerMounts { binds, mounts })
}
