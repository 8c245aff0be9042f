//! Host-based routing for the shared proxy listener
//!
//! Routes are keyed by domain and stored under both the suffixed
//! (`app.local`) and bare (`app`) form so a request naming either one
//! resolves to the same backend.

pub mod host;
pub mod table;

pub use host::{normalize_host, strip_port};
pub use table::RouteTable;

use thiserror::Error;

/// Default reserved local suffix
pub const DEFAULT_SUFFIX: &str = ".local";

/// Backend target for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Canonical domain, always carrying the local suffix
    pub domain: String,
    pub target_host: String,
    pub target_port: u16,
    /// Whether the tunnel behind this route was started with HTTPS
    pub use_https: bool,
}

impl Route {
    pub fn new(domain: impl Into<String>, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            domain: domain.into(),
            target_host: target_host.into(),
            target_port,
            use_https: false,
        }
    }

    pub fn with_https(mut self, use_https: bool) -> Self {
        self.use_https = use_https;
        self
    }

    /// `host:port` authority of the backend
    pub fn target_authority(&self) -> String {
        if self.target_host.contains(':') && !self.target_host.starts_with('[') {
            format!("[{}]:{}", self.target_host, self.target_port)
        } else {
            format!("{}:{}", self.target_host, self.target_port)
        }
    }
}

/// Route table errors
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no route for host '{0}'")]
    NotFound(String),

    #[error("route already exists for '{0}'")]
    AlreadyExists(String),

    #[error("invalid route domain '{0}'")]
    InvalidDomain(String),
}
