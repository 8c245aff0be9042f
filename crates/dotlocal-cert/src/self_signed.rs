//! Self-signed certificate generation for local domains
//!
//! Certificates produced here are meant for `.local` development hosts only.
//! **DO NOT use in production** - browsers will (rightly) warn about them.

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SelfSignedError {
    #[error("invalid subject alternative name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),
}

/// A freshly generated certificate and private key, PEM encoded
pub struct SelfSignedCertificate {
    /// Certificate in PEM format (text)
    pub pem_cert: String,

    /// Private key in PEM format (PKCS#8)
    pub pem_key: String,
}

impl SelfSignedCertificate {
    /// Save certificate and key to PEM files
    ///
    /// The key file is created owner-readable only on Unix.
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.pem_cert)?;
        write_private(key_path, self.pem_key.as_bytes())
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

/// Generate a self-signed server certificate for `domain`
///
/// The SAN list always contains `domain`, then every entry of `extra_names`,
/// `localhost`, the loopback addresses and every entry of `extra_ips`, so the
/// same certificate works from other devices on the local network.
///
/// # Example
/// ```no_run
/// use dotlocal_cert::generate_for_domain;
///
/// let cert = generate_for_domain("app.local", &["app".to_string()], &[], 365).unwrap();
/// assert!(cert.pem_cert.contains("BEGIN CERTIFICATE"));
/// ```
pub fn generate_for_domain(
    domain: &str,
    extra_names: &[String],
    extra_ips: &[IpAddr],
    validity_days: u32,
) -> Result<SelfSignedCertificate, SelfSignedError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    dn.push(DnType::OrganizationName, "dotlocal development");
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;

    let mut names: Vec<&str> = vec![domain];
    names.extend(extra_names.iter().map(String::as_str));
    names.push("localhost");

    let mut sans = Vec::with_capacity(names.len() + extra_ips.len() + 2);
    for name in names {
        let san = SanType::DnsName(Ia5String::try_from(name).map_err(|e| {
            SelfSignedError::InvalidName {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?);
        if !sans.contains(&san) {
            sans.push(san);
        }
    }

    let loopback = [
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(Ipv6Addr::LOCALHOST),
    ];
    for ip in loopback.iter().chain(extra_ips.iter()) {
        let san = SanType::IpAddress(*ip);
        if !sans.contains(&san) {
            sans.push(san);
        }
    }
    params.subject_alt_names = sans;

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(i64::from(validity_days));

    // Random serial number so regenerated certificates never collide in browser caches
    params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

    let key_pair =
        KeyPair::generate().map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| SelfSignedError::SigningFailed(e.to_string()))?;

    Ok(SelfSignedCertificate {
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}
