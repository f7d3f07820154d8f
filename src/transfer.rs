//! Pulls the finished archive to local storage and checks it arrived whole.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{TransferError, TransferIntegrityError};
use crate::remote::{sh_quote, CommandOutput, ProgressFn, RemoteSession};

/// Command printing the size in bytes of a remote file.
pub fn size_command(path: &str) -> String {
    format!("stat -c %s {}", sh_quote(path))
}

/// Reads the size out of the output of [`size_command`].
pub fn parse_size(path: &str, output: &CommandOutput) -> Result<u64, TransferError> {
    if !output.success() {
        return Err(TransferError::RemoteSize {
            path: path.to_string(),
            detail: format!("stat exited with status {}: {}", output.exit_code, output.stderr.trim()),
        });
    }

    output
        .stdout
        .trim()
        .parse::<u64>()
        .map_err(|e| TransferError::RemoteSize {
            path: path.to_string(),
            detail: format!("unexpected stat output {:?}: {e}", output.stdout.trim()),
        })
}

/// Size in bytes of a regular file on the remote host.
pub async fn remote_file_size(
    remote: &dyn RemoteSession,
    path: &str,
    timeout: Duration,
) -> Result<u64, TransferError> {
    let output = remote.execute(&size_command(path), timeout).await?;
    parse_size(path, &output)
}

/// Downloads `remote_path` to `local_path`.
///
/// The remote size is read before the transfer starts and compared with the
/// local file afterwards. The remote archive is never touched.
pub async fn download(
    remote: &dyn RemoteSession,
    remote_path: &str,
    local_path: &Path,
    progress: Option<ProgressFn>,
    timeout: Duration,
) -> Result<PathBuf, TransferError> {
    let expected = remote_file_size(remote, remote_path, timeout).await?;
    fetch(remote, remote_path, local_path, expected, progress).await
}

/// Streams `remote_path` whose size was already read as `expected`, then verifies the local copy.
pub async fn fetch(
    remote: &dyn RemoteSession,
    remote_path: &str,
    local_path: &Path,
    expected: u64,
    progress: Option<ProgressFn>,
) -> Result<PathBuf, TransferError> {
    info!(remote = %remote_path, bytes = expected, "Starting archive download");
    if let Err(e) = remote.download(remote_path, local_path, progress).await {
        discard_partial(local_path).await;
        return Err(e.into());
    }

    let actual = tokio::fs::metadata(local_path)
        .await
        .map_err(|source| TransferError::Local {
            path: local_path.to_path_buf(),
            source,
        })?
        .len();

    if actual != expected {
        warn!(
            local = %local_path.display(),
            expected,
            actual,
            "Downloaded archive size mismatch"
        );
        discard_partial(local_path).await;
        return Err(TransferIntegrityError {
            remote_path: remote_path.to_string(),
            local_path: local_path.to_path_buf(),
            expected,
            actual,
        }
        .into());
    }

    Ok(local_path.to_path_buf())
}

/// An incomplete archive must not pass for a usable backup.
async fn discard_partial(local_path: &Path) {
    match tokio::fs::remove_file(local_path).await {
        Ok(()) => warn!(local = %local_path.display(), "Removed incomplete archive"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(local = %local_path.display(), error = %e, "Failed to remove incomplete archive"),
    }
}
