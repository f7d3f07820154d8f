//! Removal of remote run artifacts.
//!
//! Both operations only ever touch paths inside the configured temp root that
//! carry the backup name prefix. Removing something already gone is a success.

use std::time::Duration;

use tracing::info;

use crate::error::{StepExecutionError, StepFailure};
use crate::remote::{sh_quote, RemoteSession};
use crate::settings::BackupProfile;
use crate::types::StepKind;

const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Where this tool is allowed to delete things on the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupScope {
    tmp_root: String,
    name_prefix: String,
}

impl CleanupScope {
    pub fn new(tmp_root: impl Into<String>, name_prefix: impl Into<String>) -> Self {
        let tmp_root = tmp_root.into();
        Self {
            tmp_root: tmp_root.trim_end_matches('/').to_string(),
            name_prefix: name_prefix.into(),
        }
    }

    pub fn from_profile(profile: &BackupProfile) -> Self {
        Self::new(&profile.remote_tmp_root, &profile.name_prefix)
    }

    /// Final path component when `path` is a direct child of the temp root carrying the prefix.
    fn entry_name<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.tmp_root.is_empty() || self.name_prefix.is_empty() {
            return None;
        }
        let name = path.strip_prefix(&self.tmp_root)?.strip_prefix('/')?;
        let valid = name.starts_with(&self.name_prefix)
            && name.len() > self.name_prefix.len()
            && !name.contains('/')
            && !name.contains("..");
        valid.then_some(name)
    }

    pub fn allows_temp_dir(&self, path: &str) -> bool {
        self.entry_name(path).is_some_and(|name| !name.ends_with(ARCHIVE_SUFFIX))
    }

    pub fn allows_archive(&self, path: &str) -> bool {
        self.entry_name(path).is_some_and(|name| name.ends_with(ARCHIVE_SUFFIX))
    }
}

pub fn remove_dir_command(path: &str) -> String {
    format!("rm -rf {}", sh_quote(path))
}

pub fn remove_file_command(path: &str) -> String {
    format!("rm -f {}", sh_quote(path))
}

/// Removes the run's temp directory. Called by the executor at the end of every run.
pub async fn remove_temp_dir(
    remote: &dyn RemoteSession,
    scope: &CleanupScope,
    path: &str,
    timeout: Duration,
) -> Result<(), StepExecutionError> {
    if !scope.allows_temp_dir(path) {
        return Err(unsafe_path(path));
    }
    run_removal(remote, &remove_dir_command(path), timeout).await?;
    info!(path = %path, "Removed remote temp directory");
    Ok(())
}

/// Removes a downloaded archive from the host. Only ever called on explicit request.
pub async fn remove_remote_archive(
    remote: &dyn RemoteSession,
    scope: &CleanupScope,
    path: &str,
    timeout: Duration,
) -> Result<(), StepExecutionError> {
    if !scope.allows_archive(path) {
        return Err(unsafe_path(path));
    }
    run_removal(remote, &remove_file_command(path), timeout).await?;
    info!(path = %path, "Removed remote archive");
    Ok(())
}

fn unsafe_path(path: &str) -> StepExecutionError {
    StepExecutionError::new(
        StepKind::Cleanup,
        StepFailure::UnsafePath {
            path: path.to_string(),
        },
    )
}

async fn run_removal(
    remote: &dyn RemoteSession,
    command: &str,
    timeout: Duration,
) -> Result<(), StepExecutionError> {
    let output = remote
        .execute(command, timeout)
        .await
        .map_err(|e| StepExecutionError::new(StepKind::Cleanup, e))?;
    if !output.success() {
        return Err(StepExecutionError::new(
            StepKind::Cleanup,
            StepFailure::NonZeroExit {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            },
        ));
    }
    Ok(())
}
