//! Core connectivity layer for the Workbench SQL client.
//!
//! This crate reaches MySQL and PostgreSQL servers, optionally through an SSH
//! tunnel, behind one adapter interface:
//!
//! - **error**: Error taxonomy distinguishing which leg of a connection failed
//! - **models**: Profiles, query results and catalog descriptors
//! - **services**: Tunnels, engine adapters, the connection facade and registry
//! - **config**: Runtime settings and the data directory
//! - **logging**: Structured logging setup

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;

#[cfg(test)]
mod verification_tests;

pub use config::RuntimeConfig;
pub use error::{ErrorKind, TunnelError, WorkbenchError, WorkbenchResult};
pub use models::{
    CatalogKind, CatalogObject, ColumnInfo, ConnectionOptions, ConnectionProfile,
    ConnectionStatus, EngineKind, QueryOutcome, QueryResult, Row, SshAuthMethod, SshTunnelConfig,
    Value,
};
pub use services::{create_adapter, Connection, ConnectionRegistry, DatabaseAdapter, WorkerPool};
