//! Persisted tunnel set, used by `dotlocal resume`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedTunnel {
    pub domain: String,
    pub port: u16,
    #[serde(default)]
    pub https: bool,
    /// Listen port the tunnel was started with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_port: Option<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    tunnels: Vec<SavedTunnel>,
}

/// YAML file holding the tunnels started from this machine
pub struct TunnelStore {
    path: PathBuf,
}

impl TunnelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        crate::config::data_dir().join("tunnels.yml")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved tunnels sorted by domain; empty when nothing was saved yet
    pub fn load(&self) -> Result<Vec<SavedTunnel>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let yaml = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {}", self.path.display()))?;
        let state: StateFile = serde_yaml::from_str(&yaml)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))?;

        let mut tunnels = state.tunnels;
        tunnels.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(tunnels)
    }

    fn save_all(&self, tunnels: Vec<SavedTunnel>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let yaml = serde_yaml::to_string(&StateFile { tunnels })
            .context("Failed to serialize tunnel state")?;
        fs::write(&self.path, yaml)
            .with_context(|| format!("Failed to write state file: {}", self.path.display()))?;
        Ok(())
    }

    /// Insert or replace the entry for `tunnel.domain`
    pub fn upsert(&self, tunnel: SavedTunnel) -> Result<()> {
        let mut tunnels = self.load()?;
        tunnels.retain(|t| t.domain != tunnel.domain);
        tunnels.push(tunnel);
        self.save_all(tunnels)
    }

    /// Returns whether an entry was removed
    pub fn remove(&self, domain: &str) -> Result<bool> {
        let mut tunnels = self.load()?;
        let before = tunnels.len();
        tunnels.retain(|t| t.domain != domain);

        if tunnels.len() == before {
            return Ok(false);
        }
        self.save_all(tunnels)?;
        Ok(true)
    }
}
