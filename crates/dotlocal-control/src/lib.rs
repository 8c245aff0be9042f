//! Tunnel lifecycle orchestration
//!
//! [`TunnelManager`] owns every running [`Tunnel`] and drives the start/stop
//! state machine: certificate, listener or route, hosts entry, discovery
//! registration. A start that fails part-way undoes the steps it already
//! completed, so callers only ever observe a tunnel fully up or fully gone.

pub mod collaborators;
pub mod config;
pub mod domain;
pub mod error;
pub mod manager;
pub mod rollback;
pub mod tunnel;

pub use collaborators::{BoxError, HostsBackup, HostsFile, Registrar};
pub use config::ManagerConfig;
pub use domain::normalize_domain;
pub use error::{ErrorKind, StepFailure, TunnelError};
pub use manager::{ListenMode, TunnelManager, TunnelSummary};
pub use rollback::Compensations;
pub use tunnel::{DoneSignal, Tunnel, TunnelState};
