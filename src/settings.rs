//! Persisted user settings, stored in `<config dir>/homebox-backup/settings.json`.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::remote::{ConnectParams, SessionConfig};
use crate::types::BackupOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub port: u16,
    pub username: String,
    pub backup_other: bool,
    pub save_path: PathBuf,
    pub profile: BackupProfile,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            backup_other: false,
            save_path: default_save_path(),
            profile: BackupProfile::default(),
        }
    }
}

/// Where things live on the backup host and how long to wait for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupProfile {
    /// Name token used to auto-select the application container
    pub app_role: String,
    /// Name token used to auto-select the database container
    pub db_role: String,
    /// Container runtime CLI on the host
    pub runtime: String,
    pub db_name: String,
    pub db_user: String,
    /// Data mount inside the application container
    pub data_path: String,
    /// Media directory relative to the data mount
    pub media_dir: String,
    pub remote_tmp_root: String,
    pub name_prefix: String,
    pub command_timeout_secs: u64,
    pub transfer_stall_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for BackupProfile {
    fn default() -> Self {
        Self {
            app_role: "homebox".to_string(),
            db_role: "postgres".to_string(),
            runtime: "docker".to_string(),
            db_name: "homebox".to_string(),
            db_user: "homebox".to_string(),
            data_path: "/data".to_string(),
            media_dir: "attachments".to_string(),
            remote_tmp_root: "/tmp".to_string(),
            name_prefix: "homebox_backup".to_string(),
            command_timeout_secs: 600,
            transfer_stall_secs: 60,
            connect_timeout_secs: 15,
        }
    }
}

impl BackupProfile {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            transfer_stall_timeout: Duration::from_secs(self.transfer_stall_secs.max(1)),
        }
    }
}

// Older settings files store the port as a string.
fn port_from_number_or_string<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn default_save_path() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Settings {
    /// Default settings file location
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("homebox-backup");
        Ok(config_dir.join("settings.json"))
    }

    /// Load settings; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;

        let settings: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?;

        Ok(settings)
    }

    /// Save settings, creating the parent directory if needed
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create settings directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write settings file {}", path.display()))?;

        Ok(())
    }

    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams::new(self.host.trim(), self.port, self.username.trim())
    }

    pub fn backup_options(&self) -> BackupOptions {
        BackupOptions {
            include_other_files: self.backup_other,
            destination: self.save_path.clone(),
        }
    }
}
