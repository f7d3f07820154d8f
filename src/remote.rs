//! Remote session: one authenticated SSH connection to the backup host.
//!
//! The transport is the system OpenSSH client. `connect` starts a control
//! master and every later command or transfer is multiplexed over its
//! socket, so a whole backup run travels over a single session.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as AsyncCommand;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, SessionError};

const CHUNK_SIZE: usize = 64 * 1024;
const SSH_ERROR_EXIT: i32 = 255;

/// Called with the cumulative number of bytes moved so far.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// `user@host:port`, for log messages.
    fn target(&self) -> String;

    /// Runs `command` through the remote shell. A non-zero exit is returned, not raised.
    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, SessionError>;

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressFn>,
    ) -> Result<u64, SessionError>;

    async fn download(
        &self,
        remote_path: &str,
        local_path: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<u64, SessionError>;

    /// Safe to call more than once.
    async fn disconnect(&self) -> Result<(), SessionError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl ConnectParams {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
        }
    }

    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    /// A transfer aborts when no bytes move for this long.
    pub transfer_stall_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            transfer_stall_timeout: Duration::from_secs(60),
        }
    }
}

/// Quotes `value` for a POSIX shell unless it only holds shell-safe characters.
pub fn sh_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Maps a failed `ssh` invocation onto a connection cause.
pub fn classify_ssh_failure(params: &ConnectParams, stderr: &str) -> ConnectionError {
    let lower = stderr.to_lowercase();
    let detail = stderr.trim().to_string();

    if lower.contains("permission denied")
        || lower.contains("too many authentication failures")
        || lower.contains("host key verification failed")
        || lower.contains("no supported authentication methods")
    {
        ConnectionError::Auth {
            host: params.host.clone(),
            username: params.username.clone(),
            detail,
        }
    } else if lower.contains("timed out") {
        ConnectionError::Timeout {
            host: params.host.clone(),
            port: params.port,
        }
    } else {
        ConnectionError::Unreachable {
            host: params.host.clone(),
            port: params.port,
            detail,
        }
    }
}

/// [`RemoteSession`] backed by an OpenSSH control master.
pub struct SshSession {
    params: ConnectParams,
    config: SessionConfig,
    control_path: PathBuf,
    // Owns the directory holding the control socket.
    control_dir: Option<TempDir>,
    closed: AtomicBool,
    exec_lock: Mutex<()>,
}

impl SshSession {
    pub async fn connect(params: ConnectParams, config: SessionConfig) -> Result<Self, ConnectionError> {
        if params.host.trim().is_empty() {
            return Err(ConnectionError::InvalidTarget("host is empty".to_string()));
        }
        if params.username.trim().is_empty() {
            return Err(ConnectionError::InvalidTarget("username is empty".to_string()));
        }

        let control_dir = tempfile::Builder::new()
            .prefix("homebox-backup-ssh")
            .tempdir()
            .map_err(ConnectionError::Launch)?;
        let control_path = control_dir.path().join("master.sock");

        info!(host = %params.target(), "Opening SSH control master");

        let mut command = AsyncCommand::new("ssh");
        command
            .arg("-M")
            .arg("-S")
            .arg(&control_path)
            .args(["-o", "ControlPersist=yes"])
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args([
                "-o".to_string(),
                format!("ConnectTimeout={}", config.connect_timeout.as_secs().max(1)),
            ])
            .args(["-p".to_string(), params.port.to_string()])
            .args(["-l", params.username.as_str()])
            .arg(&params.host)
            .arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // With ControlPersist the master detaches onto /dev/null once `true`
        // has run, so this returns as soon as authentication is settled.
        let output = match tokio::time::timeout(
            config.connect_timeout + Duration::from_secs(5),
            command.output(),
        )
        .await
        {
            Ok(result) => result.map_err(ConnectionError::Launch)?,
            Err(_) => {
                return Err(ConnectionError::Timeout {
                    host: params.host.clone(),
                    port: params.port,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(host = %params.target(), stderr = %stderr.trim(), "SSH connect failed");
            return Err(classify_ssh_failure(&params, &stderr));
        }

        info!(host = %params.target(), "Connected");
        Ok(Self {
            params,
            config,
            control_path,
            control_dir: Some(control_dir),
            closed: AtomicBool::new(false),
            exec_lock: Mutex::new(()),
        })
    }

    pub fn params(&self) -> &ConnectParams {
        &self.params
    }

    fn closed_error(&self) -> SessionError {
        SessionError::Closed {
            target: self.params.target(),
        }
    }

    /// `ssh` invocation that rides on the control master.
    fn ssh(&self, remote_command: &str) -> AsyncCommand {
        let mut command = AsyncCommand::new("ssh");
        command
            .arg("-S")
            .arg(&self.control_path)
            .args(["-o", "ControlMaster=no"])
            .args(["-o", "BatchMode=yes"])
            .args(["-p".to_string(), self.params.port.to_string()])
            .args(["-l", self.params.username.as_str()])
            .arg(&self.params.host)
            .arg("--")
            .arg(remote_command)
            .kill_on_drop(true);
        command
    }

    async fn master_alive(&self) -> bool {
        let status = AsyncCommand::new("ssh")
            .arg("-S")
            .arg(&self.control_path)
            .args(["-O", "check"])
            .args(["-l", self.params.username.as_str()])
            .arg(&self.params.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        matches!(status, Ok(s) if s.success())
    }

    async fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(self.closed_error())
        } else {
            Ok(())
        }
    }

    /// Exit 255 is ssh's own failure code; it means a transport problem when the master is gone.
    async fn check_transport(&self, exit_code: i32) -> Result<(), SessionError> {
        if exit_code == SSH_ERROR_EXIT && !self.master_alive().await {
            self.closed.store(true, Ordering::SeqCst);
            return Err(self.closed_error());
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn target(&self) -> String {
        self.params.target()
    }

    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, SessionError> {
        let _guard = self.exec_lock.lock().await;
        self.ensure_open().await?;

        debug!(command = %command, "Executing remote command");
        let child = self
            .ssh(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SessionError::io("failed to spawn ssh", e))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| SessionError::io("failed to wait for ssh", e))?,
            // The child is dropped here, and kill_on_drop reaps it.
            Err(_) => {
                return Err(SessionError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        self.check_transport(exit_code).await?;

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressFn>,
    ) -> Result<u64, SessionError> {
        let _guard = self.exec_lock.lock().await;
        self.ensure_open().await?;

        let mut source = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| SessionError::io(format!("failed to open {}", local_path.display()), e))?;

        let mut child = self
            .ssh(&format!("cat > {}", sh_quote(remote_path)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SessionError::io("failed to spawn ssh", e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::io("ssh stdin unavailable", std::io::ErrorKind::BrokenPipe.into()))?;

        let idle = self.config.transfer_stall_timeout;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let read = source
                .read(&mut buf)
                .await
                .map_err(|e| SessionError::io("failed to read local file", e))?;
            if read == 0 {
                break;
            }
            match tokio::time::timeout(idle, stdin.write_all(&buf[..read])).await {
                Ok(result) => result.map_err(|e| SessionError::io("failed to write to ssh", e))?,
                Err(_) => {
                    return Err(SessionError::Stalled {
                        path: remote_path.to_string(),
                        idle,
                    })
                }
            }
            total += read as u64;
            if let Some(progress) = &progress {
                progress(total);
            }
        }
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SessionError::io("failed to wait for ssh", e))?;
        let exit_code = output.status.code().unwrap_or(-1);
        self.check_transport(exit_code).await?;
        if exit_code != 0 {
            return Err(SessionError::TransferFailed {
                path: remote_path.to_string(),
                exit_code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(remote = %remote_path, bytes = total, "Upload complete");
        Ok(total)
    }

    async fn download(
        &self,
        remote_path: &str,
        local_path: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<u64, SessionError> {
        let _guard = self.exec_lock.lock().await;
        self.ensure_open().await?;

        let mut child = self
            .ssh(&format!("cat {}", sh_quote(remote_path)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SessionError::io("failed to spawn ssh", e))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::io("ssh stdout unavailable", std::io::ErrorKind::BrokenPipe.into()))?;

        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| SessionError::io(format!("failed to create {}", local_path.display()), e))?;

        let idle = self.config.transfer_stall_timeout;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let read = match tokio::time::timeout(idle, stdout.read(&mut buf)).await {
                Ok(result) => result.map_err(|e| SessionError::io("failed to read from ssh", e))?,
                Err(_) => {
                    return Err(SessionError::Stalled {
                        path: remote_path.to_string(),
                        idle,
                    })
                }
            };
            if read == 0 {
                break;
            }
            file.write_all(&buf[..read])
                .await
                .map_err(|e| SessionError::io(format!("failed to write {}", local_path.display()), e))?;
            total += read as u64;
            if let Some(progress) = &progress {
                progress(total);
            }
        }
        file.flush()
            .await
            .map_err(|e| SessionError::io(format!("failed to flush {}", local_path.display()), e))?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SessionError::io("failed to wait for ssh", e))?;
        let exit_code = output.status.code().unwrap_or(-1);
        self.check_transport(exit_code).await?;
        if exit_code != 0 {
            return Err(SessionError::TransferFailed {
                path: remote_path.to_string(),
                exit_code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(remote = %remote_path, local = %local_path.display(), bytes = total, "Download complete");
        Ok(total)
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        let _guard = self.exec_lock.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let status = AsyncCommand::from(master_exit_command(&self.control_path, &self.params))
            .status()
            .await;
        if let Err(e) = status {
            // The master may already be gone; the session is closed either way.
            warn!(error = %e, "Failed to stop SSH control master");
        }
        info!(host = %self.params.target(), "Disconnected");
        Ok(())
    }
}

/// `ssh -O exit` against the session's control master.
fn master_exit_command(control_path: &Path, params: &ConnectParams) -> std::process::Command {
    let mut command = std::process::Command::new("ssh");
    command
        .arg("-S")
        .arg(control_path)
        .args(["-O", "exit"])
        .args(["-l", params.username.as_str()])
        .arg(&params.host)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    command
}

/// Sessions should be closed with [`RemoteSession::disconnect`]. A session
/// dropped while open stops its master in the background so the drop never
/// blocks the caller.
impl Drop for SshSession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(host = %self.params.target(), "SSH session dropped without disconnect");
        // The socket directory has to outlive the `-O exit` request.
        let control_dir = self.control_dir.take();
        match master_exit_command(&self.control_path, &self.params).spawn() {
            Ok(mut child) => {
                std::thread::spawn(move || {
                    let _ = child.wait();
                    drop(control_dir);
                });
            }
            Err(e) => warn!(error = %e, "Failed to stop SSH control master"),
        }
    }
}
