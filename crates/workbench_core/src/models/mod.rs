//! Data models for the Workbench connectivity layer.
//!
//! - `profile` - ConnectionProfile, EngineKind, SSH settings, ConnectionOptions
//! - `connection` - ConnectionStatus
//! - `catalog` - CatalogObject, CatalogKind, SchemaRef
//! - `query` - QueryResult, QueryOutcome, ColumnInfo, Row, Value

pub mod catalog;
pub mod connection;
pub mod profile;
pub mod query;

pub use catalog::{CatalogKind, CatalogObject, SchemaRef};
pub use connection::ConnectionStatus;
pub use profile::{
    ConnectionOptions, ConnectionProfile, ConnectionProfileBuilder, EngineKind, SshAuthMethod,
    SshTunnelConfig,
};
pub use query::{ColumnInfo, QueryOutcome, QueryResult, Row, Value};
