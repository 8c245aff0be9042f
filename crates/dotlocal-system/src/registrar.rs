//! Discovery registrar
//!
//! Each registered domain is published as an `_http._tcp` service plus an
//! address record for the domain itself, so other machines on the LAN can
//! resolve `name.local`. Without a responder the registrar only tracks the
//! domains it was given.

use crate::SystemError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dotlocal_control::{BoxError, Registrar};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tracing::{debug, info, warn};

/// DNS-SD service type the tunnels are published under
pub const SERVICE_TYPE: &str = "_http._tcp.local.";

const MDNS_SUFFIX: &str = ".local";

#[derive(Debug, Clone)]
struct Advertisement {
    port: u16,
    /// Full DNS-SD name when the domain was announced on the network
    fullname: Option<String>,
}

/// Keeps the `domain -> port` pairs advertised on the local network
#[derive(Default)]
pub struct LocalRegistrar {
    entries: DashMap<String, Advertisement>,
    responder: Option<ServiceDaemon>,
}

impl LocalRegistrar {
    /// Registrar that tracks domains without announcing them
    pub fn new() -> Self {
        Self::default()
    }

    /// Registrar backed by a multicast DNS responder
    pub fn with_mdns() -> Result<Self, SystemError> {
        let daemon = ServiceDaemon::new()?;
        Ok(Self {
            entries: DashMap::new(),
            responder: Some(daemon),
        })
    }

    pub fn announces(&self) -> bool {
        self.responder.is_some()
    }

    pub fn port_of(&self, domain: &str) -> Option<u16> {
        self.entries.get(domain).map(|entry| entry.value().port)
    }

    /// Snapshot of every registered domain
    pub fn entries(&self) -> BTreeMap<String, u16> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().port))
            .collect()
    }

    fn advertise(&self, domain: &str, port: u16) -> Result<(), SystemError> {
        match self.entries.entry(domain.to_string()) {
            Entry::Occupied(existing) if existing.get().port != port => {
                Err(SystemError::RegistrationConflict {
                    domain: domain.to_string(),
                    existing: existing.get().port,
                    requested: port,
                })
            }
            Entry::Occupied(_) => {
                debug!("{} already registered on port {}", domain, port);
                Ok(())
            }
            Entry::Vacant(slot) => {
                let fullname = self.publish(domain, port)?;
                slot.insert(Advertisement { port, fullname });
                Ok(())
            }
        }
    }

    /// Announce `domain` when a responder is running and the name is mDNS-resolvable
    fn publish(&self, domain: &str, port: u16) -> Result<Option<String>, SystemError> {
        let Some(daemon) = &self.responder else {
            info!("Registered {} on port {} (not announced, no mDNS responder)", domain, port);
            return Ok(None);
        };
        let Some(instance) = domain.strip_suffix(MDNS_SUFFIX) else {
            info!("Registered {} on port {} (not a {} name, not announced)", domain, port, MDNS_SUFFIX);
            return Ok(None);
        };

        let ip = outbound_ip();
        let host_name = format!("{}.", domain);
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            instance,
            &host_name,
            ip.to_string().as_str(),
            port,
            &[("path", "/")][..],
        )?;
        let fullname = service.get_fullname().to_string();
        daemon.register(service)?;

        info!("Announcing {} via mDNS at {}:{}", domain, ip, port);
        Ok(Some(fullname))
    }
}

#[async_trait]
impl Registrar for LocalRegistrar {
    async fn register(&self, domain: &str, port: u16) -> Result<(), BoxError> {
        self.advertise(domain, port)?;
        Ok(())
    }

    async fn unregister(&self, domain: &str) -> Result<(), BoxError> {
        let Some((_, advertisement)) = self.entries.remove(domain) else {
            debug!("{} was not registered", domain);
            return Ok(());
        };

        if let (Some(daemon), Some(fullname)) = (&self.responder, &advertisement.fullname) {
            daemon.unregister(fullname).map_err(SystemError::from)?;
            info!("Stopped announcing {} (port {})", domain, advertisement.port);
        } else {
            info!("Unregistered {} (port {})", domain, advertisement.port);
        }
        Ok(())
    }

    fn outbound_ip(&self) -> IpAddr {
        outbound_ip()
    }
}

impl Drop for LocalRegistrar {
    fn drop(&mut self) {
        if let Some(daemon) = self.responder.take() {
            if let Err(e) = daemon.shutdown() {
                warn!("Failed to stop mDNS responder: {}", e);
            }
        }
    }
}

/// Address of the interface that routes to the wider network
///
/// Connecting a UDP socket only selects a route; no packet is sent.
pub fn outbound_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        socket.connect(SocketAddr::from(([8, 8, 8, 8], 80)))?;
        Ok(socket.local_addr()?.ip())
    };

    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}
