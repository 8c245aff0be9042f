//! Host-system collaborators for the tunnel manager
//!
//! [`SystemHostsFile`] edits the OS hosts file, [`LocalRegistrar`] announces
//! tunnel domains over multicast DNS (or only tracks them when no responder
//! could be started), and
//! [`has_elevated_privileges`] tells the CLI whether privileged ports can be
//! bound.

pub mod hosts;
pub mod privilege;
pub mod registrar;

pub use hosts::{default_hosts_path, SystemHostsFile};
pub use privilege::{has_elevated_privileges, is_privileged_port};
pub use registrar::LocalRegistrar;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{0}' cannot be written to the hosts file")]
    InvalidHostName(String),

    #[error("{domain} is already advertised on port {existing}, refusing port {requested}")]
    RegistrationConflict {
        domain: String,
        existing: u16,
        requested: u16,
    },

    #[error("mDNS responder error: {0}")]
    Mdns(#[from] mdns_sd::Error),
}

impl SystemError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SystemError::Io {
            path: path.into(),
            source,
        }
    }
}
