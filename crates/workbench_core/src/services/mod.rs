//! Backend services for the Workbench SQL client.
//!
//! This module contains the service layer:
//! - `tunnel` - SSH port forwarding with russh
//! - `adapter` - Engine capability set and the adapter factory
//! - `mysql` / `postgres` - Engine adapters on mysql_async and tokio-postgres
//! - `connection` - Serialized facade over one adapter
//! - `registry` - Named connections sharing a worker pool
//! - `worker` - Bounded worker pool for engine calls

pub mod adapter;
pub mod connection;
pub mod mysql;
pub mod postgres;
pub mod registry;
pub mod tunnel;
pub mod worker;

pub use adapter::{create_adapter, DatabaseAdapter};
pub use connection::Connection;
pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;
pub use registry::{order_user_schemas_first, ConnectionRegistry};
pub use tunnel::{Tunnel, TunnelState};
pub use worker::WorkerPool;
