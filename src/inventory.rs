//! Container inventory on the remote host.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{DiscoveryError, MountNotFoundError};
use crate::remote::{sh_quote, RemoteSession};
use crate::types::ContainerDescriptor;

const LIST_FORMAT: &str = "{{.ID}}|{{.Names}}|{{.Image}}";
const MOUNTS_FORMAT: &str = "{{.Id}}|{{json .Mounts}}";

#[derive(Debug, Deserialize)]
struct MountEntry {
    #[serde(rename = "Source", default)]
    source: Option<String>,
    #[serde(rename = "Destination", default)]
    destination: Option<String>,
}

/// Result of matching a role token against the scanned containers.
#[derive(Debug, PartialEq, Eq)]
pub enum AutoSelection<'a> {
    Unique(&'a ContainerDescriptor),
    /// Several names match; the user has to choose.
    Ambiguous(Vec<&'a ContainerDescriptor>),
    NoMatch,
}

impl<'a> AutoSelection<'a> {
    pub fn selected(&self) -> Option<&'a ContainerDescriptor> {
        match self {
            AutoSelection::Unique(c) => Some(c),
            _ => None,
        }
    }
}

/// Lists running containers with their mount tables.
pub async fn scan(
    remote: &dyn RemoteSession,
    runtime: &str,
    timeout: Duration,
) -> Result<Vec<ContainerDescriptor>, DiscoveryError> {
    let list_command = format!("{} ps --format {}", runtime, sh_quote(LIST_FORMAT));
    let output = remote.execute(&list_command, timeout).await?;
    if !output.success() {
        return Err(DiscoveryError::Command {
            command: list_command,
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    if !output.stderr.trim().is_empty() {
        warn!(stderr = %output.stderr.trim(), "Container listing wrote to stderr");
    }

    let mut containers = parse_container_list(&output.stdout)?;
    if containers.is_empty() {
        return Err(DiscoveryError::Empty);
    }

    let ids: Vec<String> = containers.iter().map(|c| sh_quote(&c.id)).collect();
    let inspect_command = format!(
        "{} inspect --format {} {}",
        runtime,
        sh_quote(MOUNTS_FORMAT),
        ids.join(" ")
    );
    let output = remote.execute(&inspect_command, timeout).await?;
    if !output.success() {
        return Err(DiscoveryError::Command {
            command: inspect_command,
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }

    let mounts = parse_mount_tables(&output.stdout)?;
    for container in &mut containers {
        // `ps` prints the short id, `inspect` the full one.
        if let Some((_, table)) = mounts.iter().find(|(full_id, _)| full_id.starts_with(&container.id)) {
            container.mounts = table.clone();
        } else {
            debug!(container = %container.name, "No mount information returned");
        }
    }

    info!(count = containers.len(), "Scanned running containers");
    Ok(containers)
}

/// Parses `id|name|image` lines. Blank lines are ignored.
pub fn parse_container_list(output: &str) -> Result<Vec<ContainerDescriptor>, DiscoveryError> {
    let mut containers = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.splitn(3, '|').collect();
        if parts.len() != 3 || parts.iter().take(2).any(|p| p.trim().is_empty()) {
            return Err(DiscoveryError::Unparseable {
                line: line.to_string(),
                reason: "expected id|name|image".to_string(),
            });
        }

        containers.push(ContainerDescriptor::new(
            parts[0].trim(),
            parts[1].trim(),
            parts[2].trim(),
        ));
    }
    Ok(containers)
}

/// Parses `full-id|<mounts json>` lines into id -> (destination -> source).
pub fn parse_mount_tables(output: &str) -> Result<Vec<(String, BTreeMap<String, String>)>, DiscoveryError> {
    let mut tables = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((id, json)) = line.split_once('|') else {
            return Err(DiscoveryError::Unparseable {
                line: line.to_string(),
                reason: "expected id|mounts".to_string(),
            });
        };

        let entries: Option<Vec<MountEntry>> =
            serde_json::from_str(json).map_err(|e| DiscoveryError::Unparseable {
                line: line.to_string(),
                reason: e.to_string(),
            })?;

        let table = entries
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| match (m.destination, m.source) {
                (Some(dest), Some(src)) if !dest.is_empty() && !src.is_empty() => Some((dest, src)),
                _ => None,
            })
            .collect();

        tables.push((id.trim().to_string(), table));
    }
    Ok(tables)
}

/// Case-insensitive substring match of `role` against container names.
///
/// Only a unique match is auto-selected.
pub fn auto_select<'a>(containers: &'a [ContainerDescriptor], role: &str) -> AutoSelection<'a> {
    let role = role.trim().to_lowercase();
    if role.is_empty() {
        return AutoSelection::NoMatch;
    }

    let matches: Vec<&ContainerDescriptor> = containers
        .iter()
        .filter(|c| c.name.to_lowercase().contains(&role))
        .collect();

    match matches.len() {
        0 => AutoSelection::NoMatch,
        1 => AutoSelection::Unique(matches[0]),
        _ => AutoSelection::Ambiguous(matches),
    }
}

/// Exact (case-sensitive) lookup by container name or id.
pub fn find_by_name<'a>(containers: &'a [ContainerDescriptor], name: &str) -> Option<&'a ContainerDescriptor> {
    containers.iter().find(|c| c.name == name || c.id == name)
}

pub fn resolve_mount<'a>(
    descriptor: &'a ContainerDescriptor,
    container_path: &str,
) -> Result<&'a str, MountNotFoundError> {
    descriptor.resolve_mount(container_path)
}
