//! Manager configuration

use dotlocal_proxy::{ProxyConfig, DEFAULT_DIAL_TIMEOUT, DEFAULT_RESPONSE_TIMEOUT};
use dotlocal_router::DEFAULT_SUFFIX;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Address dedicated listeners bind to
    pub bind_ip: IpAddr,
    /// Host backends are reached on
    pub backend_host: String,
    /// Reserved local suffix appended to every domain
    pub suffix: String,
    pub dial_timeout: Duration,
    /// Bound on a connected backend producing response headers
    pub response_timeout: Duration,
    /// Bound on each discovery registrar call
    pub registrar_timeout: Duration,
    /// Grace period before a listener is force-closed
    pub shutdown_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            backend_host: "127.0.0.1".to_string(),
            suffix: DEFAULT_SUFFIX.to_string(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            registrar_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ManagerConfig {
    pub(crate) fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            dial_timeout: self.dial_timeout,
            response_timeout: self.response_timeout,
        }
    }
}
