use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::cleanup::{self, CleanupScope};
use crate::error::PlanValidationError;
use crate::executor::{Executor, RunHandle};
use crate::inventory;
use crate::plan::PlanBuilder;
use crate::session::{Connector, Session};
use crate::settings::Settings;
use crate::state::backup_flow::{BackupFlow, ContainerRole};
use crate::types::{AppState, BackupPlan, BackupResult, RunStatus};

pub struct App {
    pub state: AppState,
    pub settings: Settings,
    /// Settings are written back here after a successful connect or backup.
    pub settings_path: Option<PathBuf>,
    pub dry_run_mode: bool,
    pub connector: Box<dyn Connector>,
    pub session: Option<Session>,
    pub flow: BackupFlow,
}

impl App {
    pub fn new(connector: Box<dyn Connector>, settings: Settings, dry_run_mode: bool) -> Self {
        Self {
            state: AppState::Disconnected,
            settings,
            settings_path: None,
            dry_run_mode,
            connector,
            session: None,
            flow: BackupFlow::new(),
        }
    }

    pub fn with_settings_path(mut self, path: PathBuf) -> Self {
        self.settings_path = Some(path);
        self
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            self.disconnect().await;
        }

        let params = self.settings.connect_params();
        match self.connector.connect(&params).await {
            Ok(session) => {
                info!(host = %session.target(), "Session established");
                self.session = Some(session);
                self.state = AppState::Connected;
                self.save_settings();
            }
            Err(e) => {
                self.state = AppState::Error(format!("Connection failed: {}", e));
            }
        }
        Ok(())
    }

    pub async fn scan_containers(&mut self) -> Result<()> {
        let session = self.session.clone().context("Not connected")?;
        let profile = &self.settings.profile;

        match inventory::scan(&**session.remote(), &profile.runtime, profile.command_timeout()).await {
            Ok(containers) => {
                self.flow.apply_scan(containers, profile);
                self.state = AppState::ContainersScanned;
            }
            Err(e) => {
                self.flow.apply_scan(Vec::new(), profile);
                self.state = AppState::Error(format!("Container scan failed: {}", e));
            }
        }
        Ok(())
    }

    pub fn select_app(&mut self, index: usize) -> bool {
        self.flow.select(ContainerRole::App, index)
    }

    pub fn select_db(&mut self, index: usize) -> bool {
        self.flow.select(ContainerRole::Database, index)
    }

    pub fn build_plan(&self) -> std::result::Result<BackupPlan, PlanValidationError> {
        PlanBuilder::new(self.settings.profile.clone()).build(
            self.flow.selected(ContainerRole::Database),
            self.flow.selected(ContainerRole::App),
            &self.settings.backup_options(),
        )
    }

    /// Builds a fresh plan and starts it on a background task.
    pub fn start_backup(&mut self) -> Result<RunHandle> {
        if self.dry_run_mode {
            bail!("Dry-run mode: backup not executed");
        }
        let session = self.session.clone().context("Not connected")?;

        let plan = match self.build_plan() {
            Ok(plan) => plan,
            Err(e) => {
                self.state = AppState::Error(format!("Cannot start backup: {}", e));
                return Err(e.into());
            }
        };

        let handle = Executor::new(session, &self.settings.profile).start(plan)?;
        self.flow.last_result = None;
        self.flow.remote_archive_deleted = false;
        self.state = AppState::BackingUp;
        Ok(handle)
    }

    pub fn finish_backup(&mut self, result: BackupResult) {
        let status = result.status;
        if status == RunStatus::Success {
            self.save_settings();
        }
        self.flow.last_result = Some(result);
        self.state = AppState::Completed(status);
    }

    /// Removes the last run's archive from the host. Only after a successful download.
    pub async fn delete_server_backup(&mut self) -> Result<()> {
        let session = self.session.clone().context("Not connected")?;
        let downloaded = self
            .flow
            .last_result
            .as_ref()
            .is_some_and(|r| r.archive_local_path.is_some());
        if !downloaded {
            bail!("No downloaded backup to remove from the server");
        }
        let archive = self
            .flow
            .remote_archive()
            .context("Remote archive already removed")?
            .to_string();

        let profile = &self.settings.profile;
        cleanup::remove_remote_archive(
            &**session.remote(),
            &CleanupScope::from_profile(profile),
            &archive,
            profile.command_timeout(),
        )
        .await?;
        self.flow.remote_archive_deleted = true;
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.remote().disconnect().await {
                warn!(error = %e, "Disconnect failed");
            }
        }
        self.state = AppState::Disconnected;
    }

    fn save_settings(&self) {
        if let Some(path) = &self.settings_path {
            if let Err(e) = self.settings.save_to(path) {
                warn!(error = %e, "Failed to save settings");
            }
        }
    }
}
