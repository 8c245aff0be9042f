//! dotlocal CLI support: configuration file and persisted tunnel state

pub mod config;
pub mod state;
