//! Shared multiplexed listeners dispatching by Host / SNI

use crate::dispatch::Dispatcher;
use crate::server::ProxyServer;
use crate::tls::{sni_server_config, SniResolver};
use crate::{ProxyConfig, ProxyError};
use dotlocal_cert::Certificate;
use dotlocal_router::RouteTable;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SharedProxyConfig {
    pub http_addr: SocketAddr,
    /// HTTPS listener, terminated with per-domain certificates
    pub https_addr: Option<SocketAddr>,
    pub proxy: ProxyConfig,
}

impl Default for SharedProxyConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            https_addr: None,
            proxy: ProxyConfig::default(),
        }
    }
}

/// One HTTP (and optionally one HTTPS) listener serving every route
pub struct SharedProxy {
    routes: Arc<RouteTable>,
    certs: Arc<SniResolver>,
    http: ProxyServer,
    https: Option<ProxyServer>,
}

impl SharedProxy {
    /// Bind the shared listeners in front of `routes`
    pub async fn start(
        config: SharedProxyConfig,
        routes: Arc<RouteTable>,
    ) -> Result<Self, ProxyError> {
        let dispatcher = Dispatcher::shared(routes.clone(), config.proxy.clone());
        let certs = Arc::new(SniResolver::new());

        let http = ProxyServer::bind(config.http_addr, None, dispatcher.clone()).await?;

        let https = match config.https_addr {
            Some(addr) => {
                let tls = sni_server_config(certs.clone())?;
                match ProxyServer::bind(addr, Some(tls), dispatcher).await {
                    Ok(server) => Some(server),
                    Err(e) => {
                        if let Err(shutdown_err) = http.shutdown(Duration::from_secs(1)).await {
                            warn!("Failed to close HTTP listener: {}", shutdown_err);
                        }
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        info!(
            "Shared proxy started (http: {}, https: {})",
            http.local_addr(),
            https
                .as_ref()
                .map(|s| s.local_addr().to_string())
                .unwrap_or_else(|| "disabled".to_string())
        );

        Ok(Self {
            routes,
            certs,
            http,
            https,
        })
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http.local_addr()
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https.as_ref().map(|s| s.local_addr())
    }

    /// Externally reachable port for a tunnel of the given scheme
    pub fn port_for(&self, use_https: bool) -> Option<u16> {
        if use_https {
            self.https_addr().map(|addr| addr.port())
        } else {
            Some(self.http_addr().port())
        }
    }

    /// Serve `cert` for its domain on the HTTPS listener
    pub fn install_certificate(&self, cert: &Certificate) -> Result<(), ProxyError> {
        if self.https.is_none() {
            return Err(ProxyError::TlsError(format!(
                "shared proxy has no HTTPS listener for {}",
                cert.domain
            )));
        }
        self.certs.insert(cert)
    }

    pub fn remove_certificate(&self, domain: &str) -> bool {
        self.certs.remove(domain)
    }

    pub fn has_certificate(&self, domain: &str) -> bool {
        self.certs.contains(domain)
    }

    /// Close both listeners
    pub async fn shutdown(&self, grace: Duration) -> Result<(), ProxyError> {
        let http = self.http.shutdown(grace).await;
        let https = match &self.https {
            Some(server) => server.shutdown(grace).await.map(|_| ()),
            None => Ok(()),
        };
        http?;
        https
    }
}
