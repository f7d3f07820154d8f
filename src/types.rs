use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::{BackupError, MountNotFoundError};
use crate::events::LogLine;

/// A running container as seen at scan time.
///
/// This is a snapshot: the container may have been restarted or removed
/// since, which the executor re-checks before touching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub id: String,
    pub name: String,
    pub image: String,
    /// container-internal path -> host path
    pub mounts: BTreeMap<String, String>,
}

impl ContainerDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            image: image.into(),
            mounts: BTreeMap::new(),
        }
    }

    pub fn with_mount(mut self, container_path: impl Into<String>, host_path: impl Into<String>) -> Self {
        self.mounts.insert(container_path.into(), host_path.into());
        self
    }

    /// Host path backing `container_path`, ignoring a trailing slash on either side.
    pub fn resolve_mount(&self, container_path: &str) -> Result<&str, MountNotFoundError> {
        let wanted = normalize(container_path);
        self.mounts
            .iter()
            .find(|(destination, _)| normalize(destination) == wanted)
            .map(|(_, source)| source.as_str())
            .ok_or_else(|| MountNotFoundError {
                container: self.name.clone(),
                path: container_path.to_string(),
            })
    }

    pub fn display(&self) -> String {
        format!("{} ({})", self.name, self.image)
    }
}

fn normalize(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOptions {
    pub include_other_files: bool,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Prepare,
    DumpDatabase,
    CopyMedia,
    CopyOther,
    Archive,
    Download,
    Cleanup,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Prepare => "prepare",
            StepKind::DumpDatabase => "dump-database",
            StepKind::CopyMedia => "copy-media",
            StepKind::CopyOther => "copy-other",
            StepKind::Archive => "archive",
            StepKind::Download => "download",
            StepKind::Cleanup => "cleanup",
        }
    }

    /// Human name used in user-facing failure messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            StepKind::Prepare => "preparation",
            StepKind::DumpDatabase => "database dump",
            StepKind::CopyMedia => "media copy",
            StepKind::CopyOther => "other files copy",
            StepKind::Archive => "archive creation",
            StepKind::Download => "archive download",
            StepKind::Cleanup => "remote cleanup",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of remote work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub kind: StepKind,
    pub commands: Vec<String>,
    pub artifact: Option<String>,
}

/// Ordered, immutable list of steps for one run.
///
/// The last step is always [`StepKind::Cleanup`].
#[derive(Debug, Clone)]
pub struct BackupPlan {
    pub(crate) backup_name: String,
    pub(crate) temp_dir: String,
    pub(crate) remote_archive: String,
    pub(crate) local_archive: PathBuf,
    pub(crate) db_container: ContainerDescriptor,
    pub(crate) app_container: ContainerDescriptor,
    pub(crate) steps: Vec<Step>,
}

impl BackupPlan {
    pub fn backup_name(&self) -> &str {
        &self.backup_name
    }

    pub fn temp_dir(&self) -> &str {
        &self.temp_dir
    }

    pub fn remote_archive(&self) -> &str {
        &self.remote_archive
    }

    pub fn local_archive(&self) -> &PathBuf {
        &self.local_archive
    }

    pub fn db_container(&self) -> &ContainerDescriptor {
        &self.db_container
    }

    pub fn app_container(&self) -> &ContainerDescriptor {
        &self.app_container
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Every step except the trailing cleanup.
    pub fn work_steps(&self) -> &[Step] {
        match self.steps.split_last() {
            Some((last, rest)) if last.kind == StepKind::Cleanup => rest,
            _ => &self.steps,
        }
    }

    pub fn step_kinds(&self) -> Vec<StepKind> {
        self.steps.iter().map(|s| s.kind).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::PartialFailure => "partial-failure",
            RunStatus::Failure => "failure",
        }
    }
}

/// Terminal record of one run.
#[derive(Debug)]
pub struct BackupResult {
    pub status: RunStatus,
    /// Set once the archive step completed; the archive stays on the host until explicitly deleted.
    pub archive_remote_path: Option<String>,
    pub archive_local_path: Option<PathBuf>,
    pub log: Vec<LogLine>,
    pub error: Option<BackupError>,
    pub cleanup_error: Option<BackupError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BackupResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Step the run failed in, if any.
    pub fn failed_step(&self) -> Option<StepKind> {
        self.error.as_ref().and_then(|e| e.step())
    }
}

/// Where the application controller is in its connect, scan, back up cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppState {
    Disconnected,
    Connected,
    ContainersScanned,
    BackingUp,
    Completed(RunStatus),
    Error(String),
}
