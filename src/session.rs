use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{BusyError, ConnectionError};
use crate::remote::{ConnectParams, RemoteSession, SessionConfig, SshSession};

/// Shared handle to a connected session.
///
/// Clones share the same connection and the same run slot: only one backup
/// run may hold the slot at a time.
#[derive(Clone)]
pub struct Session {
    remote: Arc<dyn RemoteSession>,
    run_active: Arc<AtomicBool>,
}

impl Session {
    pub fn new(remote: Arc<dyn RemoteSession>) -> Self {
        Self {
            remote,
            run_active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteSession> {
        &self.remote
    }

    pub fn target(&self) -> String {
        self.remote.target()
    }

    pub fn is_busy(&self) -> bool {
        self.run_active.load(Ordering::SeqCst)
    }

    /// Claims the run slot, failing immediately if another run holds it.
    pub fn try_begin_run(&self) -> Result<RunGuard, BusyError> {
        self.run_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| {
                warn!(host = %self.remote.target(), "Rejected backup run: session busy");
                BusyError
            })?;
        debug!(host = %self.remote.target(), "Run slot acquired");
        Ok(RunGuard {
            flag: self.run_active.clone(),
        })
    }
}

/// Releases the run slot when dropped.
pub struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Opens sessions; the seam lets the application run against a simulated host.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Session, ConnectionError>;
}

pub struct SshConnector {
    config: SessionConfig,
}

impl SshConnector {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Session, ConnectionError> {
        let ssh = SshSession::connect(params.clone(), self.config).await?;
        Ok(Session::new(Arc::new(ssh)))
    }
}
