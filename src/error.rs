//! Error types for every stage of a backup run.
//!
//! Nothing below the executor swallows an error: each component returns one of
//! these and the executor is the only place that turns a step failure into a
//! cleanup action.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::StepKind;

/// Failure to establish the SSH session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("authentication failed for {username}@{host}: {detail}")]
    Auth {
        host: String,
        username: String,
        detail: String,
    },
    #[error("connection to {host}:{port} timed out")]
    Timeout { host: String, port: u16 },
    #[error("host {host}:{port} is unreachable: {detail}")]
    Unreachable {
        host: String,
        port: u16,
        detail: String,
    },
    #[error("invalid connection target: {0}")]
    InvalidTarget(String),
    #[error("failed to launch ssh: {0}")]
    Launch(#[source] std::io::Error),
}

/// Transport-level failure on an established session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session to {target} is closed")]
    Closed { target: String },
    #[error("command timed out after {}s: {command}", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
    #[error("transfer of {path} stalled: no data for {}s", .idle.as_secs())]
    Stalled { path: String, idle: Duration },
    #[error("transfer of {path} failed with exit status {exit_code}: {stderr}")]
    TransferFailed {
        path: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("`{command}` exited with status {exit_code}: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("no running containers found")]
    Empty,
    #[error("unparseable container listing {line:?}: {reason}")]
    Unparseable { line: String, reason: String },
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("container {container} has no mount for {path}")]
pub struct MountNotFoundError {
    pub container: String,
    pub path: String,
}

/// Raised before any remote mutation happens.
#[derive(Debug, Error)]
pub enum PlanValidationError {
    #[error("no {0} container selected")]
    MissingContainer(&'static str),
    #[error(transparent)]
    UnresolvedMount(#[from] MountNotFoundError),
    #[error("destination {} does not exist or is not a directory", .0.display())]
    DestinationMissing(PathBuf),
    #[error("destination {} is not writable: {source}", .path.display())]
    DestinationNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
#[error("downloaded archive {} is {actual} bytes, expected {expected} bytes (remote copy kept at {remote_path})", .local_path.display())]
pub struct TransferIntegrityError {
    pub remote_path: String,
    pub local_path: PathBuf,
    pub expected: u64,
    pub actual: u64,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("could not determine size of remote file {path}: {detail}")]
    RemoteSize { path: String, detail: String },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("failed to inspect local file {}: {source}", .path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Integrity(#[from] TransferIntegrityError),
}

/// Why a single step did not complete.
#[derive(Debug, Error)]
pub enum StepFailure {
    #[error("`{command}` exited with status {exit_code}{}", stderr_suffix(.stderr))]
    NonZeroExit {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("refusing to remove {path}: outside the backup working area")]
    UnsafePath { path: String },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

#[derive(Debug, Error)]
#[error("{} failed: {cause}", .step.display_name())]
pub struct StepExecutionError {
    pub step: StepKind,
    #[source]
    pub cause: StepFailure,
}

impl StepExecutionError {
    pub fn new(step: StepKind, cause: impl Into<StepFailure>) -> Self {
        Self {
            step,
            cause: cause.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("a backup run is already active on this session")]
pub struct BusyError;

/// Top-level error surfaced to callers and stored in `BackupResult`.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    PlanValidation(#[from] PlanValidationError),
    #[error(transparent)]
    StepExecution(#[from] StepExecutionError),
    #[error("archive download failed integrity check: {0}")]
    TransferIntegrity(#[from] TransferIntegrityError),
    #[error(transparent)]
    Busy(#[from] BusyError),
    #[error("backup cancelled before {}", .before.display_name())]
    Cancelled { before: StepKind },
}

impl BackupError {
    /// Logical step the error belongs to, when it belongs to one.
    pub fn step(&self) -> Option<StepKind> {
        match self {
            BackupError::StepExecution(e) => Some(e.step),
            BackupError::TransferIntegrity(_) => Some(StepKind::Download),
            BackupError::Cancelled { before } => Some(*before),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupError::Cancelled { .. })
    }
}

impl From<TransferError> for BackupError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Integrity(e) => BackupError::TransferIntegrity(e),
            other => BackupError::StepExecution(StepExecutionError::new(StepKind::Download, other)),
        }
    }
}
