//! Tunnel Manager: start/stop orchestration with rollback

use crate::collaborators::{BoxError, HostsBackup, HostsFile, Registrar};
use crate::config::ManagerConfig;
use crate::domain::normalize_domain;
use crate::error::{StepFailure, TunnelError};
use crate::rollback::Compensations;
use crate::tunnel::{Tunnel, TunnelState};
use dotlocal_cert::{Certificate, CertificateProvider};
use dotlocal_proxy::{server_config, Backend, Dispatcher, ProxyError, ProxyServer, SharedProxy};
use dotlocal_router::Route;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How tunnels accept inbound traffic
#[derive(Clone)]
pub enum ListenMode {
    /// Each tunnel binds its own listener on its own port
    Dedicated,
    /// Every tunnel is a route on one shared proxy
    Shared(Arc<SharedProxy>),
}

impl ListenMode {
    pub fn is_shared(&self) -> bool {
        matches!(self, ListenMode::Shared(_))
    }
}

/// A running tunnel as reported by [`TunnelManager::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSummary {
    pub domain: String,
    pub backend_port: u16,
    pub use_https: bool,
}

#[derive(Default)]
struct ManagerState {
    tunnels: HashMap<String, Tunnel>,
    /// Hosts content captured before this manager first modified it
    hosts_backup: Option<HostsBackup>,
}

/// Owns every tunnel and serializes their lifecycle
///
/// Start and stop run under one exclusive lock, so concurrent callers never
/// see a tunnel half registered.
pub struct TunnelManager {
    config: ManagerConfig,
    mode: ListenMode,
    certs: Arc<CertificateProvider>,
    registrar: Arc<dyn Registrar>,
    hosts: Arc<dyn HostsFile>,
    state: RwLock<ManagerState>,
}

impl TunnelManager {
    pub fn new(
        config: ManagerConfig,
        mode: ListenMode,
        certs: Arc<CertificateProvider>,
        registrar: Arc<dyn Registrar>,
        hosts: Arc<dyn HostsFile>,
    ) -> Self {
        Self {
            config,
            mode,
            certs,
            registrar,
            hosts,
            state: RwLock::new(ManagerState::default()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn mode(&self) -> &ListenMode {
        &self.mode
    }

    /// Expose `domain` and forward its traffic to `backend_port`
    ///
    /// Either every step succeeds and the tunnel is Running, or whatever was
    /// already set up is undone before the error is returned.
    pub async fn start(
        &self,
        domain: &str,
        backend_port: i32,
        use_https: bool,
        http_port: i32,
        https_port: i32,
    ) -> Result<(), TunnelError> {
        let backend_port = validate_port("backend port", backend_port)?;
        let (http_port, https_port) = if use_https {
            (lenient_port(http_port), validate_port("https port", https_port)?)
        } else {
            (validate_port("http port", http_port)?, lenient_port(https_port))
        };
        let domain = normalize_domain(domain, &self.config.suffix)?;

        let mut state = self.state.write().await;
        if state.tunnels.contains_key(&domain) {
            return Err(TunnelError::AlreadyExists(domain));
        }

        let (http_port, https_port) = match &self.mode {
            ListenMode::Dedicated => (http_port, https_port),
            ListenMode::Shared(proxy) => (
                proxy.http_addr().port(),
                proxy.https_addr().map(|addr| addr.port()).unwrap_or(0),
            ),
        };
        let mut tunnel = Tunnel::new(domain.clone(), backend_port, use_https, http_port, https_port);
        tunnel.transition(TunnelState::Starting)?;

        info!(
            "Starting tunnel {} -> {}:{} ({})",
            domain,
            self.config.backend_host,
            backend_port,
            if use_https { "https" } else { "http" }
        );

        if use_https {
            tunnel.set_certificate(self.ensure_certificate(&domain).await?);
        }

        let mut undo = Compensations::new();
        match self
            .bring_up(&mut tunnel, &mut state.hosts_backup, &mut undo)
            .await
        {
            Ok(()) => {
                undo.commit();
                info!(
                    "Tunnel {} running, reachable at {}:{}",
                    domain,
                    self.registrar.outbound_ip(),
                    tunnel.listen_port()
                );
                state.tunnels.insert(domain, tunnel);
                Ok(())
            }
            Err(cause) => {
                warn!("Failed to start tunnel {}: {}", domain, cause);
                let failures = undo.rollback().await;
                tunnel.take_listener();
                let _ = tunnel.transition(TunnelState::Stopped);
                tunnel.mark_done();

                if failures.is_empty() {
                    Err(cause)
                } else {
                    Err(TunnelError::RollbackFailed {
                        cause: Box::new(cause),
                        failures,
                    })
                }
            }
        }
    }

    async fn ensure_certificate(&self, domain: &str) -> Result<Certificate, TunnelError> {
        let certs = self.certs.clone();
        let name = domain.to_string();
        let result = tokio::task::spawn_blocking(move || certs.ensure(&name)).await;

        match result {
            Ok(Ok(cert)) => {
                debug!(
                    "Certificate for {} valid for {} more day(s)",
                    domain,
                    cert.days_until_expiry()
                );
                Ok(cert)
            }
            Ok(Err(e)) => Err(TunnelError::Certificate {
                domain: domain.to_string(),
                source: Box::new(e),
            }),
            Err(e) => Err(TunnelError::Certificate {
                domain: domain.to_string(),
                source: Box::new(e),
            }),
        }
    }

    /// Listener or route, hosts entry, discovery; each success pushes its undo
    async fn bring_up(
        &self,
        tunnel: &mut Tunnel,
        hosts_backup: &mut Option<HostsBackup>,
        undo: &mut Compensations,
    ) -> Result<(), TunnelError> {
        let domain = tunnel.domain().to_string();

        let discovery_port = match &self.mode {
            ListenMode::Dedicated => {
                self.bind_listener(tunnel, undo).await?;
                self.add_hosts_entry(&domain, hosts_backup, undo).await?;
                tunnel.listen_port()
            }
            ListenMode::Shared(proxy) => self.add_route(tunnel, proxy, undo)?,
        };

        let registered = timeout(
            self.config.registrar_timeout,
            self.registrar.register(&domain, discovery_port),
        )
        .await;
        match registered {
            Ok(Ok(())) => {}
            Ok(Err(source)) => return Err(TunnelError::Discovery { domain, source }),
            Err(_) => {
                return Err(TunnelError::Discovery {
                    domain,
                    source: format!("timed out after {:?}", self.config.registrar_timeout)
                        .into(),
                })
            }
        }
        tunnel.set_discovery_port(discovery_port);
        debug!("Registered {} for discovery on port {}", tunnel.domain(), discovery_port);

        tunnel.transition(TunnelState::Running)
    }

    async fn bind_listener(
        &self,
        tunnel: &mut Tunnel,
        undo: &mut Compensations,
    ) -> Result<(), TunnelError> {
        let domain = tunnel.domain().to_string();
        let listener_error = |source: ProxyError| TunnelError::Listener {
            domain: domain.clone(),
            source,
        };

        let tls = match tunnel.certificate() {
            Some(cert) => Some(server_config(cert).map_err(listener_error)?),
            None => None,
        };
        let addr = SocketAddr::new(self.config.bind_ip, tunnel.listen_port());
        let backend = Backend::new(self.config.backend_host.clone(), tunnel.backend_port());
        let dispatcher = Dispatcher::dedicated(backend, self.config.proxy_config());

        let server = ProxyServer::bind(addr, tls, dispatcher)
            .await
            .map_err(listener_error)?;
        let server = Arc::new(server);
        tunnel.set_listener(server.clone());

        let grace = self.config.shutdown_timeout;
        undo.push("close listener", move || async move {
            server.shutdown(grace).await.map(|_| ()).map_err(BoxError::from)
        });
        Ok(())
    }

    async fn add_hosts_entry(
        &self,
        domain: &str,
        hosts_backup: &mut Option<HostsBackup>,
        undo: &mut Compensations,
    ) -> Result<(), TunnelError> {
        if hosts_backup.is_none() {
            let backup = self.hosts.backup().await.map_err(TunnelError::HostsBackup)?;
            debug!("Captured hosts file backup ({} bytes)", backup.content().len());
            *hosts_backup = Some(backup);
        }

        self.hosts
            .update(domain)
            .await
            .map_err(|source| TunnelError::HostsUpdate {
                domain: domain.to_string(),
                source,
            })?;

        let hosts = self.hosts.clone();
        let domain = domain.to_string();
        undo.push("remove hosts entry", move || async move {
            hosts.remove(&domain).await
        });
        Ok(())
    }

    /// Returns the shared port the tunnel is reachable on
    fn add_route(
        &self,
        tunnel: &Tunnel,
        proxy: &Arc<SharedProxy>,
        undo: &mut Compensations,
    ) -> Result<u16, TunnelError> {
        let domain = tunnel.domain().to_string();
        let listener_error = |source: ProxyError| TunnelError::Listener {
            domain: domain.clone(),
            source,
        };

        let port = proxy.port_for(tunnel.use_https()).ok_or_else(|| {
            listener_error(ProxyError::TlsError(
                "shared proxy has no HTTPS listener".to_string(),
            ))
        })?;

        if let Some(cert) = tunnel.certificate() {
            proxy.install_certificate(cert).map_err(listener_error)?;
            let proxy = proxy.clone();
            let name = domain.clone();
            undo.push("remove certificate", move || async move {
                proxy.remove_certificate(&name);
                Ok::<(), BoxError>(())
            });
        }

        let route = Route::new(
            domain.clone(),
            self.config.backend_host.clone(),
            tunnel.backend_port(),
        )
        .with_https(tunnel.use_https());
        proxy
            .routes()
            .add(route)
            .map_err(|source| TunnelError::Route {
                domain: domain.clone(),
                source,
            })?;

        let routes = proxy.routes().clone();
        undo.push("remove route", move || async move {
            routes.remove(&domain).map(|_| ()).map_err(BoxError::from)
        });
        Ok(port)
    }

    /// Tear down one tunnel; accepts the domain with or without the suffix
    pub async fn stop(&self, domain: &str) -> Result<(), TunnelError> {
        let name = normalize_domain(domain, &self.config.suffix)
            .map_err(|_| TunnelError::NotFound(domain.trim().to_string()))?;

        let mut state = self.state.write().await;
        let mut tunnel = state
            .tunnels
            .remove(&name)
            .ok_or_else(|| TunnelError::NotFound(name.clone()))?;

        let failures = self.teardown(&mut tunnel).await;
        drop(state);

        if failures.is_empty() {
            info!("Tunnel {} stopped", name);
            Ok(())
        } else {
            Err(TunnelError::Teardown {
                domain: name,
                failures,
            })
        }
    }

    /// Stop every tunnel, then restore the hosts file from the backup
    pub async fn stop_all(&self) -> Result<(), TunnelError> {
        let mut state = self.state.write().await;

        let mut domains: Vec<String> = state.tunnels.keys().cloned().collect();
        domains.sort();
        info!("Stopping {} tunnel(s)", domains.len());

        let mut failures = Vec::new();
        for domain in domains {
            let Some(mut tunnel) = state.tunnels.remove(&domain) else {
                continue;
            };
            for failure in self.teardown(&mut tunnel).await {
                failures.push(StepFailure {
                    step: format!("{} for {}", failure.step, domain),
                    error: failure.error,
                });
            }
        }

        if let Some(backup) = state.hosts_backup.take() {
            match self.hosts.restore(&backup).await {
                Ok(()) => info!("Restored hosts file"),
                Err(e) => {
                    warn!("Failed to restore hosts file: {}", e);
                    failures.push(StepFailure::new("restore hosts file", e));
                    // Keep it so a later shutdown can retry
                    state.hosts_backup = Some(backup);
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TunnelError::Shutdown { failures })
        }
    }

    /// Best-effort: every step runs even if an earlier one failed
    async fn teardown(&self, tunnel: &mut Tunnel) -> Vec<StepFailure> {
        let domain = tunnel.domain().to_string();
        let mut failures = Vec::new();

        if let Err(e) = tunnel.transition(TunnelState::Stopping) {
            warn!("{}", e);
        }

        if let Some(listener) = tunnel.take_listener() {
            match listener.shutdown(self.config.shutdown_timeout).await {
                Ok(true) => {}
                Ok(false) => warn!("Listener for {} was force-closed", domain),
                Err(e) => failures.push(StepFailure::new("close listener", e)),
            }
        }

        if tunnel.discovery_port().is_some() {
            let unregistered =
                timeout(self.config.registrar_timeout, self.registrar.unregister(&domain)).await;
            match unregistered {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(StepFailure::new("unregister discovery", e)),
                Err(_) => failures.push(StepFailure::new(
                    "unregister discovery",
                    format!("timed out after {:?}", self.config.registrar_timeout),
                )),
            }
        }

        match &self.mode {
            ListenMode::Dedicated => {
                if let Err(e) = self.hosts.remove(&domain).await {
                    failures.push(StepFailure::new("remove hosts entry", e));
                }
            }
            ListenMode::Shared(proxy) => {
                if let Err(e) = proxy.routes().remove(&domain) {
                    failures.push(StepFailure::new("remove route", e));
                }
                if tunnel.use_https() {
                    proxy.remove_certificate(&domain);
                }
            }
        }

        if let Err(e) = tunnel.transition(TunnelState::Stopped) {
            warn!("{}", e);
        }
        tunnel.mark_done();

        failures
    }

    /// Running tunnels, sorted by domain
    pub async fn list(&self) -> Vec<TunnelSummary> {
        let mut tunnels: Vec<TunnelSummary> = {
            let state = self.state.read().await;
            state
                .tunnels
                .values()
                .filter(|t| t.state() == TunnelState::Running)
                .map(Tunnel::summary)
                .collect()
        };
        tunnels.sort_by(|a, b| a.domain.cmp(&b.domain));
        tunnels
    }

    pub async fn is_running(&self, domain: &str) -> bool {
        let Ok(name) = normalize_domain(domain, &self.config.suffix) else {
            return false;
        };
        self.state
            .read()
            .await
            .tunnels
            .get(&name)
            .is_some_and(|t| t.state() == TunnelState::Running)
    }

    pub async fn has_hosts_backup(&self) -> bool {
        self.state.read().await.hosts_backup.is_some()
    }
}

fn validate_port(field: &'static str, port: i32) -> Result<u16, TunnelError> {
    match u16::try_from(port) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(TunnelError::invalid(
            field,
            format!("{} is not in 1-65535", port),
        )),
    }
}

/// Ports the tunnel does not listen on are recorded but not enforced
fn lenient_port(port: i32) -> u16 {
    u16::try_from(port).unwrap_or(0)
}
