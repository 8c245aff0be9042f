//! Tunnel lifecycle errors

use crate::collaborators::BoxError;
use crate::tunnel::TunnelState;
use dotlocal_proxy::ProxyError;
use dotlocal_router::RouteError;
use std::fmt;
use thiserror::Error;

/// Broad class of a [`TunnelError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any side effect; safe to retry with fixed input
    Validation,
    /// Certificate or listener could not be set up
    Provisioning,
    /// Hosts file or discovery registration failed after the listener existed
    Registration,
    /// One or more cleanup steps failed
    Teardown,
    NotFound,
}

/// A cleanup step that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: String,
    pub error: String,
}

impl StepFailure {
    pub fn new(step: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            step: step.into(),
            error: error.to_string(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to {}: {}", self.step, self.error)
    }
}

fn join(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("tunnel for domain {0} already exists")]
    AlreadyExists(String),

    #[error("failed to ensure certificate for {domain}: {source}")]
    Certificate {
        domain: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to start listener for {domain}: {source}")]
    Listener {
        domain: String,
        #[source]
        source: ProxyError,
    },

    #[error("failed to add route for {domain}: {source}")]
    Route {
        domain: String,
        #[source]
        source: RouteError,
    },

    #[error("failed to back up hosts file: {0}")]
    HostsBackup(#[source] BoxError),

    #[error("failed to update hosts file for {domain}: {source}")]
    HostsUpdate {
        domain: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to register domain {domain} for discovery: {source}")]
    Discovery {
        domain: String,
        #[source]
        source: BoxError,
    },

    #[error("tunnel {domain} cannot move from {from:?} to {to:?}")]
    InvalidState {
        domain: String,
        from: TunnelState,
        to: TunnelState,
    },

    #[error("{cause}; rollback was incomplete: {}", join(.failures))]
    RollbackFailed {
        cause: Box<TunnelError>,
        failures: Vec<StepFailure>,
    },

    #[error("tunnel for domain {0} does not exist")]
    NotFound(String),

    #[error("errors while stopping {domain}: {}", join(.failures))]
    Teardown {
        domain: String,
        failures: Vec<StepFailure>,
    },

    #[error("errors during shutdown: {}", join(.failures))]
    Shutdown { failures: Vec<StepFailure> },
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::InvalidInput { .. } | TunnelError::AlreadyExists(_) => {
                ErrorKind::Validation
            }
            TunnelError::Certificate { .. }
            | TunnelError::Listener { .. }
            | TunnelError::Route { .. }
            | TunnelError::InvalidState { .. } => ErrorKind::Provisioning,
            TunnelError::HostsBackup(_)
            | TunnelError::HostsUpdate { .. }
            | TunnelError::Discovery { .. } => ErrorKind::Registration,
            TunnelError::RollbackFailed { cause, .. } => cause.kind(),
            TunnelError::NotFound(_) => ErrorKind::NotFound,
            TunnelError::Teardown { .. } | TunnelError::Shutdown { .. } => ErrorKind::Teardown,
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        TunnelError::InvalidInput {
            field,
            reason: reason.into(),
        }
    }
}
