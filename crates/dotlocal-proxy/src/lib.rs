//! Reverse proxy for local tunnels
//!
//! A [`Dispatcher`] forwards HTTP requests to a backend, either to the one
//! backend of a dedicated tunnel or to whatever the [`RouteTable`] maps the
//! request's Host to. [`ProxyServer`] runs the accept loop (plain or TLS) in
//! front of a dispatcher and [`SharedProxy`] bundles the multiplexed
//! listeners used when many tunnels share one port.
//!
//! [`RouteTable`]: dotlocal_router::RouteTable

pub mod dispatch;
pub mod forward;
pub mod server;
pub mod shared;
pub mod tls;

pub use dispatch::{ClientInfo, DispatchMode, Dispatcher, ProxyBody};
pub use server::ProxyServer;
pub use shared::{SharedProxy, SharedProxyConfig};
pub use tls::{server_config, sni_server_config, SniResolver};

use dotlocal_router::Route;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Default bound on dialing a backend
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a backend producing response headers
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Ports below 1024 require elevated privileges\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to connect to backend {target}: {reason}")]
    ConnectionFailed { target: String, reason: String },

    #[error("Timed out after {timeout:?} connecting to backend {target}")]
    ConnectTimeout { target: String, timeout: Duration },

    #[error("Timed out after {timeout:?} waiting for backend {target} to respond")]
    ResponseTimeout { target: String, timeout: Duration },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Listener on {addr} failed: {reason}")]
    ListenerFailed { addr: SocketAddr, reason: String },
}

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Bound on establishing the TCP connection to a backend
    pub dial_timeout: Duration,
    /// Bound on the backend answering once connected
    pub response_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

/// Backend a request is forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub host: String,
    pub port: u16,
}

impl Backend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl From<&Route> for Backend {
    fn from(route: &Route) -> Self {
        Self::new(route.target_host.clone(), route.target_port)
    }
}
