//! CLI configuration
//!
//! Read from `~/.dotlocal/config.yml`; a missing file means defaults.

use anyhow::{Context, Result};
use dotlocal_control::ManagerConfig;
use dotlocal_system::default_hosts_path;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// One listener per tunnel
    #[default]
    Dedicated,
    /// All tunnels behind one listener, routed by Host
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub mode: ProxyMode,
    pub http_port: u16,
    pub https_port: u16,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Dedicated,
            http_port: 80,
            https_port: 443,
        }
    }
}

/// A tunnel declared in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEntry {
    pub domain: String,
    pub port: u16,
    #[serde(default)]
    pub https: bool,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Defaults to `~/.dotlocal/certs`
    pub certs_dir: Option<PathBuf>,
    /// Defaults to the OS hosts file
    pub hosts_file: Option<PathBuf>,
    pub bind_ip: IpAddr,
    pub backend_host: String,
    pub dial_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub proxy: ProxySettings,
    pub tunnels: Vec<TunnelEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            certs_dir: None,
            hosts_file: None,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            backend_host: "127.0.0.1".to_string(),
            dial_timeout_secs: 5,
            response_timeout_secs: 10,
            shutdown_timeout_secs: 5,
            proxy: ProxySettings::default(),
            tunnels: Vec::new(),
        }
    }
}

/// `~/.dotlocal`, or `.dotlocal` when there is no home directory
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".dotlocal"))
        .unwrap_or_else(|| PathBuf::from(".dotlocal"))
}

impl Config {
    pub fn default_path() -> PathBuf {
        data_dir().join("config.yml")
    }

    /// Load `path`, or the default location when `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_path);

        if !path.exists() {
            return Ok(Self::default());
        }

        let yaml = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&yaml)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.certs_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("certs"))
    }

    pub fn hosts_path(&self) -> PathBuf {
        self.hosts_file.clone().unwrap_or_else(default_hosts_path)
    }

    pub fn enabled_tunnels(&self) -> impl Iterator<Item = &TunnelEntry> {
        self.tunnels.iter().filter(|t| t.enabled)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            bind_ip: self.bind_ip,
            backend_host: self.backend_host.clone(),
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            ..ManagerConfig::default()
        }
    }
}
