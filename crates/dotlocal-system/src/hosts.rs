//! Hosts file editor

use crate::SystemError;
use async_trait::async_trait;
use dotlocal_control::{BoxError, HostsBackup, HostsFile};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const LOOPBACK: &str = "127.0.0.1";

/// Location of the OS hosts file
pub fn default_hosts_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
        PathBuf::from("/etc/hosts")
    }
}

/// [`HostsFile`] backed by a file on disk
///
/// Entries are matched on whole host-name fields, so removing `app.local`
/// never touches a line for `myapp.local`.
#[derive(Debug, Clone)]
pub struct SystemHostsFile {
    path: PathBuf,
    backup_dir: PathBuf,
}

impl Default for SystemHostsFile {
    fn default() -> Self {
        Self::new(default_hosts_path())
    }
}

impl SystemHostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_dir: std::env::temp_dir(),
        }
    }

    /// Directory receiving the recovery copy written by `backup`
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<String, SystemError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SystemError::io(&self.path, e))
    }

    async fn write(&self, content: &[u8]) -> Result<(), SystemError> {
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| SystemError::io(&self.path, e))
    }

    pub async fn add_entry(&self, domain: &str) -> Result<bool, SystemError> {
        check_host_name(domain)?;

        let mut content = self.read().await?;
        if content.lines().any(|line| maps(line, domain)) {
            debug!("{} already present in {}", domain, self.path.display());
            return Ok(false);
        }

        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&format!("{}\t{}\n", LOOPBACK, domain));
        self.write(content.as_bytes()).await?;

        info!("Added {} to {}", domain, self.path.display());
        Ok(true)
    }

    pub async fn remove_entry(&self, domain: &str) -> Result<bool, SystemError> {
        let content = self.read().await?;

        let kept: String = content
            .split_inclusive('\n')
            .filter(|line| !maps(line, domain))
            .collect();
        if kept.len() == content.len() {
            return Ok(false);
        }

        self.write(kept.as_bytes()).await?;
        info!("Removed {} from {}", domain, self.path.display());
        Ok(true)
    }

    pub async fn snapshot(&self) -> Result<HostsBackup, SystemError> {
        let content = tokio::fs::read(&self.path)
            .await
            .map_err(|e| SystemError::io(&self.path, e))?;

        let copy = self
            .backup_dir
            .join(format!("hosts.backup.{}", chrono::Utc::now().timestamp()));
        let backup = match tokio::fs::write(&copy, &content).await {
            Ok(()) => {
                info!("Backed up {} to {}", self.path.display(), copy.display());
                HostsBackup::new(content).with_saved_copy(copy)
            }
            Err(e) => {
                warn!("Could not write hosts backup copy to {}: {}", copy.display(), e);
                HostsBackup::new(content)
            }
        };
        Ok(backup)
    }

    pub async fn restore_snapshot(&self, backup: &HostsBackup) -> Result<(), SystemError> {
        self.write(backup.content()).await?;
        info!("Restored {}", self.path.display());

        if let Some(copy) = backup.saved_copy() {
            if let Err(e) = tokio::fs::remove_file(copy).await {
                debug!("Could not remove {}: {}", copy.display(), e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HostsFile for SystemHostsFile {
    async fn update(&self, domain: &str) -> Result<(), BoxError> {
        self.add_entry(domain).await?;
        Ok(())
    }

    async fn remove(&self, domain: &str) -> Result<(), BoxError> {
        self.remove_entry(domain).await?;
        Ok(())
    }

    async fn backup(&self) -> Result<HostsBackup, BoxError> {
        Ok(self.snapshot().await?)
    }

    async fn restore(&self, backup: &HostsBackup) -> Result<(), BoxError> {
        Ok(self.restore_snapshot(backup).await?)
    }
}

/// Whether a hosts line lists `domain` among its host names
fn maps(line: &str, domain: &str) -> bool {
    let entry = line.split('#').next().unwrap_or_default();
    entry
        .split_whitespace()
        .skip(1)
        .any(|name| name.eq_ignore_ascii_case(domain))
}

fn check_host_name(domain: &str) -> Result<(), SystemError> {
    if domain.is_empty() || domain.chars().any(|c| c.is_whitespace() || c == '#') {
        return Err(SystemError::InvalidHostName(domain.to_string()));
    }
    Ok(())
}
