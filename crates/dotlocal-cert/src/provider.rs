//! Generate-or-reuse certificate provider

use crate::storage::CertificateStore;
use crate::{generate_for_domain, CertError, Certificate};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Validity of generated certificates, in days
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

/// Suffix stripped from a domain to derive its bare alias
const LOCAL_SUFFIX: &str = ".local";

/// Produces a certificate for a domain, generating it on first use
///
/// Calls are blocking file-system and crypto work; async callers should run
/// them on a blocking thread.
#[derive(Debug, Clone)]
pub struct CertificateProvider {
    store: CertificateStore,
    extra_names: Vec<String>,
    extra_ips: Vec<IpAddr>,
    validity_days: u32,
}

impl CertificateProvider {
    pub fn new(certs_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: CertificateStore::new(certs_dir),
            extra_names: Vec::new(),
            extra_ips: Vec::new(),
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }

    /// Additional DNS names added to every generated certificate
    pub fn with_extra_names(mut self, names: Vec<String>) -> Self {
        self.extra_names = names;
        self
    }

    /// Additional IP addresses (e.g. LAN address) added to every generated certificate
    pub fn with_extra_ips(mut self, ips: Vec<IpAddr>) -> Self {
        self.extra_ips = ips;
        self
    }

    pub fn with_validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    pub fn certs_dir(&self) -> &Path {
        self.store.dir()
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    /// Return the certificate for `domain`, generating and persisting it if needed
    ///
    /// Existing files are reused as long as they parse. Files that exist but
    /// cannot be loaded are reported and left untouched.
    pub fn ensure(&self, domain: &str) -> Result<Certificate, CertError> {
        if domain.trim().is_empty() {
            return Err(CertError::InvalidDomain(domain.to_string()));
        }

        if let Some(cert) = self.store.load(domain)? {
            if cert.is_expired() {
                warn!(
                    "Certificate for {} expired on {}; delete {} to regenerate it",
                    domain,
                    cert.not_after,
                    self.store.dir().display()
                );
            }
            return Ok(cert);
        }

        info!("Generating self-signed certificate for {}", domain);

        let mut names = Vec::with_capacity(self.extra_names.len() + 1);
        if let Some(bare) = domain.strip_suffix(LOCAL_SUFFIX) {
            if !bare.is_empty() {
                names.push(bare.to_string());
            }
        }
        names.extend(self.extra_names.iter().cloned());

        let generated = generate_for_domain(domain, &names, &self.extra_ips, self.validity_days)?;
        self.store.save(domain, &generated)?;

        self.store.load(domain)?.ok_or_else(|| CertError::Corrupt {
            path: self.store.dir().to_path_buf(),
            reason: format!("certificate for {} vanished after being written", domain),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_domain_rejected() {
        let dir = TempDir::new().unwrap();
        let provider = CertificateProvider::new(dir.path());

        assert!(matches!(
            provider.ensure("  "),
            Err(CertError::InvalidDomain(_))
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_builder() {
        let provider = CertificateProvider::new("/tmp/x")
            .with_extra_names(vec!["dev.box".to_string()])
            .with_validity_days(30);

        assert_eq!(provider.certs_dir(), Path::new("/tmp/x"));
        assert_eq!(provider.validity_days, 30);
        assert_eq!(provider.extra_names, vec!["dev.box".to_string()]);
    }

    #[test]
    fn test_short_validity() {
        let dir = TempDir::new().unwrap();
        let provider = CertificateProvider::new(dir.path()).with_validity_days(10);

        let cert = provider.ensure("short.local").unwrap();
        assert!(cert.days_until_expiry() <= 10);
        assert!(cert.days_until_expiry() >= 9);
    }
}
