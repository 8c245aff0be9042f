//! Side-effect collaborators injected into the manager
//!
//! Implementations live outside this crate (see `dotlocal-system`); tests use
//! in-memory doubles.

use async_trait::async_trait;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Error type returned by collaborator implementations
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Local network discovery (mDNS-style advertisement of `domain -> port`)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, domain: &str, port: u16) -> Result<(), BoxError>;

    async fn unregister(&self, domain: &str) -> Result<(), BoxError>;

    /// Address other devices on the network should use to reach this host
    fn outbound_ip(&self) -> IpAddr;
}

/// System name-resolution override file
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostsFile: Send + Sync {
    /// Map `domain` to the loopback address
    async fn update(&self, domain: &str) -> Result<(), BoxError>;

    async fn remove(&self, domain: &str) -> Result<(), BoxError>;

    /// Snapshot the current content
    async fn backup(&self) -> Result<HostsBackup, BoxError>;

    /// Write a snapshot back
    async fn restore(&self, backup: &HostsBackup) -> Result<(), BoxError>;
}

/// Opaque snapshot of a hosts file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostsBackup {
    content: Vec<u8>,
    saved_copy: Option<PathBuf>,
}

impl HostsBackup {
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            saved_copy: None,
        }
    }

    /// Record where an on-disk copy of the snapshot was written
    pub fn with_saved_copy(mut self, path: PathBuf) -> Self {
        self.saved_copy = Some(path);
        self
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn saved_copy(&self) -> Option<&Path> {
        self.saved_copy.as_deref()
    }
}
