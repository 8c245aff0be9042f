//! TLS server configuration for tunnel listeners

use crate::ProxyError;
use dashmap::DashMap;
use dotlocal_cert::Certificate;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::sync::Arc;
use tracing::{debug, trace};

/// ALPN protocols offered to clients
const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

fn builder() -> Result<rustls::ConfigBuilder<ServerConfig, rustls::WantsVerifier>, ProxyError> {
    ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::TlsError(format!("Failed to configure TLS versions: {}", e)))
}

fn with_alpn(mut config: ServerConfig) -> Arc<ServerConfig> {
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

/// Server config presenting a single certificate (dedicated HTTPS tunnel)
pub fn server_config(cert: &Certificate) -> Result<Arc<ServerConfig>, ProxyError> {
    let config = builder()?
        .with_no_client_auth()
        .with_single_cert(cert.cert_chain.clone(), cert.private_key.clone_key())
        .map_err(|e| {
            ProxyError::TlsError(format!("Invalid certificate for {}: {}", cert.domain, e))
        })?;

    Ok(with_alpn(config))
}

/// Server config choosing the certificate by SNI (shared HTTPS listener)
pub fn sni_server_config(resolver: Arc<SniResolver>) -> Result<Arc<ServerConfig>, ProxyError> {
    let config = builder()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    Ok(with_alpn(config))
}

/// Certificates keyed by server name
///
/// Handshakes naming a domain without an installed certificate fail.
#[derive(Debug, Default)]
pub struct SniResolver {
    certs: DashMap<String, Arc<CertifiedKey>>,
}

impl SniResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the certificate for `cert.domain`, replacing any previous one
    pub fn insert(&self, cert: &Certificate) -> Result<(), ProxyError> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&cert.private_key)
            .map_err(|e| {
                ProxyError::TlsError(format!("Unsupported key for {}: {}", cert.domain, e))
            })?;
        let certified = CertifiedKey::new(cert.cert_chain.clone(), signing_key);

        debug!("Installing TLS certificate for {}", cert.domain);
        self.certs
            .insert(cert.domain.to_ascii_lowercase(), Arc::new(certified));
        Ok(())
    }

    pub fn remove(&self, domain: &str) -> bool {
        self.certs.remove(&domain.to_ascii_lowercase()).is_some()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.certs.contains_key(&domain.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?.to_ascii_lowercase();
        trace!("Resolving certificate for SNI {}", name);
        self.certs.get(&name).map(|entry| entry.value().clone())
    }
}
