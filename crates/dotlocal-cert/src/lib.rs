//! Certificate provisioning for local tunnel domains
//!
//! Generates a self-signed certificate the first time a domain is seen and
//! reuses the pair persisted on disk on every later request.

pub mod provider;
pub mod self_signed;
pub mod storage;

pub use provider::{CertificateProvider, DEFAULT_VALIDITY_DAYS};
pub use self_signed::{generate_for_domain, SelfSignedCertificate, SelfSignedError};
pub use storage::CertificateStore;

use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::PathBuf;
use thiserror::Error;

/// Certificate provisioning errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("invalid certificate domain '{0}'")]
    InvalidDomain(String),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate material at {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("found {present} but {missing} is missing")]
    IncompletePair { present: PathBuf, missing: PathBuf },

    #[error("certificate generation failed: {0}")]
    Generation(#[from] SelfSignedError),
}

/// A certificate chain with its private key, bound to one domain
#[derive(Debug)]
pub struct Certificate {
    pub domain: String,
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    /// Certificate file contents exactly as stored on disk
    pub cert_pem: Vec<u8>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Certificate {
    /// Check if the certificate is past its validity window
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.not_after
    }

    /// Days until expiry (negative once expired)
    pub fn days_until_expiry(&self) -> i64 {
        (self.not_after - Utc::now()).num_days()
    }
}

impl Clone for Certificate {
    fn clone(&self) -> Self {
        Self {
            domain: self.domain.clone(),
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
            cert_pem: self.cert_pem.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
        }
    }
}
