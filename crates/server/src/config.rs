//! Server configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::hypervisor::VcenterCredentials;
use vmcaptain_common::{Error, Result};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub listen: String,

    /// SQLite user store path
    pub db_path: PathBuf,

    /// Which hypervisor backend to talk to
    pub backend: BackendKind,

    /// Default vCenter connection
    pub vcenter: VcenterConfig,

    /// Session lifetimes
    pub sessions: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".to_string(),
            db_path: vmcaptain_common::default_db_path(),
            backend: BackendKind::default(),
            vcenter: VcenterConfig::default(),
            sessions: SessionConfig::default(),
        }
    }
}

/// Hypervisor backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// vSphere Automation REST API
    Vsphere,
    /// In-memory demo fleet
    Simulated,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Vsphere
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Vsphere => write!(f, "vsphere"),
            BackendKind::Simulated => write!(f, "simulated"),
        }
    }
}

/// Default vCenter connection parameters. Each may be overridden per
/// connect request.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VcenterConfig {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ignore_ssl: bool,
}

impl std::fmt::Debug for VcenterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcenterConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ignore_ssl", &self.ignore_ssl)
            .finish()
    }
}

/// Connect request overrides; anything left `None` comes from config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectParams {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ignore_ssl: Option<bool>,
}

impl VcenterConfig {
    /// Merge request overrides over the configured defaults.
    pub fn resolve(&self, params: &ConnectParams) -> Result<VcenterCredentials> {
        fn pick(primary: &Option<String>, fallback: &Option<String>) -> Option<String> {
            primary
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .or_else(|| fallback.as_deref().filter(|s| !s.trim().is_empty()))
                .map(str::to_string)
        }

        let url = pick(&params.url, &self.url);
        let username = pick(&params.username, &self.username);
        let password = pick(&params.password, &self.password);

        match (url, username, password) {
            (Some(url), Some(username), Some(password)) => Ok(VcenterCredentials {
                url,
                username,
                password,
                ignore_ssl: params.ignore_ssl.unwrap_or(false) || self.ignore_ssl,
            }),
            _ => Err(Error::InvalidConfig(
                "Missing required connection parameters".to_string(),
            )),
        }
    }
}

/// Session lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Console login session lifetime
    pub login_ttl_secs: i64,

    /// Hypervisor session lifetime
    pub vcenter_ttl_secs: u64,

    /// How often expired sessions are swept
    pub purge_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            login_ttl_secs: 60 * 60 * 12,
            vcenter_ttl_secs: 60 * 60 * 24,
            purge_interval_secs: 60 * 10,
        }
    }
}

impl ServerConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        vmcaptain_common::default_store_path().join("server.toml")
    }
}
