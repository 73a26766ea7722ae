//! Connection facade: one named connection, its adapter and its status.
//!
//! Every adapter call goes through a FIFO mutex, so at most one operation is in
//! flight per connection and waiting callers are served in the order they
//! arrived. The work itself runs on the shared [`WorkerPool`]:
//! - `async` methods wait for it without blocking the caller
//! - `*_sync` methods block the calling thread until it completes

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{ErrorKind, WorkbenchResult};
use crate::models::{CatalogObject, ConnectionProfile, ConnectionStatus, EngineKind, QueryResult};
use crate::services::adapter::{create_adapter, DatabaseAdapter};
use crate::services::registry::order_user_schemas_first;
use crate::services::tunnel::TunnelState;
use crate::services::worker::WorkerPool;

type AdapterGuard = OwnedMutexGuard<Box<dyn DatabaseAdapter>>;

#[derive(Debug, Default)]
struct ConnectionState {
    status: ConnectionStatus,
    connected_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// A named database connection.
pub struct Connection {
    id: Uuid,
    name: String,
    profile: ConnectionProfile,
    adapter: Arc<Mutex<Box<dyn DatabaseAdapter>>>,
    state: RwLock<ConnectionState>,
    workers: Arc<WorkerPool>,
}

impl Connection {
    /// Create a disconnected connection with the adapter for the profile's engine.
    pub fn new(name: impl Into<String>, profile: ConnectionProfile, workers: Arc<WorkerPool>) -> Self {
        let adapter = create_adapter(profile.clone());
        Self::with_adapter(name, adapter, workers)
    }

    /// Create a connection around an existing adapter.
    pub fn with_adapter(
        name: impl Into<String>,
        adapter: Box<dyn DatabaseAdapter>,
        workers: Arc<WorkerPool>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            profile: adapter.profile().clone(),
            adapter: Arc::new(Mutex::new(adapter)),
            state: RwLock::new(ConnectionState::default()),
            workers,
        }
    }

    // ========== State Queries ==========

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub fn engine(&self) -> EngineKind {
        self.profile.engine
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.read().status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().status.is_connected()
    }

    /// When the current session was opened.
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().connected_at
    }

    /// Message of the most recent connect failure.
    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }

    /// State of the SSH tunnel, if the profile uses one.
    pub async fn tunnel_state(&self) -> Option<TunnelState> {
        self.adapter.lock().await.tunnel_state()
    }

    // ========== Operations ==========

    /// Connect, returning whether a session is now open.
    pub async fn connect(&self) -> bool {
        self.state.write().status = ConnectionStatus::Connecting;
        tracing::info!(connection = %self.name, engine = ?self.engine(), "Connecting");

        let result = self
            .dispatch(|mut adapter| async move {
                let result = adapter.connect().await;
                (adapter, result)
            })
            .await
            .and_then(|result| result);

        let mut state = self.state.write();
        match result {
            Ok(()) => {
                state.status = ConnectionStatus::Connected;
                state.connected_at = Some(Utc::now());
                state.last_error = None;
                true
            }
            Err(e) => {
                tracing::error!(connection = %self.name, error = %e, "Connect failed");
                let recoverable =
                    !matches!(e.kind(), ErrorKind::Validation | ErrorKind::AuthenticationFailed);
                state.status = ConnectionStatus::error(e.to_string(), recoverable);
                state.connected_at = None;
                state.last_error = Some(e.to_string());
                false
            }
        }
    }

    pub fn connect_sync(&self) -> bool {
        self.workers.block_on(self.connect())
    }

    /// Close the session and tunnel. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        let result = self
            .dispatch(|mut adapter| async move {
                adapter.disconnect().await;
                (adapter, ())
            })
            .await;
        if let Err(e) = result {
            tracing::error!(connection = %self.name, error = %e, "Disconnect failed");
        }

        let mut state = self.state.write();
        state.status = ConnectionStatus::Disconnected;
        state.connected_at = None;
    }

    pub fn disconnect_sync(&self) {
        self.workers.block_on(self.disconnect())
    }

    /// Run one statement. Failures come back as an error-variant result.
    pub async fn execute_query(&self, sql: &str, fetch_results: bool) -> QueryResult {
        let sql = sql.to_owned();
        self.dispatch(move |mut adapter| async move {
            let result = adapter.execute_query(&sql, fetch_results).await;
            (adapter, result)
        })
        .await
        .unwrap_or_else(|e| QueryResult::failed(&e, Duration::ZERO))
    }

    pub fn execute_query_sync(&self, sql: &str, fetch_results: bool) -> QueryResult {
        self.workers.block_on(self.execute_query(sql, fetch_results))
    }

    /// List databases. MySQL system schemas are moved after user schemas.
    pub async fn list_databases(&self) -> WorkbenchResult<Vec<CatalogObject>> {
        let databases = self
            .dispatch(|mut adapter| async move {
                let result = adapter.list_databases().await;
                (adapter, result)
            })
            .await??;

        Ok(match self.engine() {
            EngineKind::MySql => order_user_schemas_first(databases),
            EngineKind::PostgreSql => databases,
        })
    }

    pub fn list_databases_sync(&self) -> WorkbenchResult<Vec<CatalogObject>> {
        self.workers.block_on(self.list_databases())
    }

    pub async fn list_schemas(&self, database: &str) -> WorkbenchResult<Vec<CatalogObject>> {
        let database = database.to_owned();
        self.dispatch(move |mut adapter| async move {
            let result = adapter.list_schemas(&database).await;
            (adapter, result)
        })
        .await?
    }

    pub fn list_schemas_sync(&self, database: &str) -> WorkbenchResult<Vec<CatalogObject>> {
        self.workers.block_on(self.list_schemas(database))
    }

    pub async fn list_tables(&self, schema_ref: &str) -> WorkbenchResult<Vec<CatalogObject>> {
        let schema_ref = schema_ref.to_owned();
        self.dispatch(move |mut adapter| async move {
            let result = adapter.list_tables(&schema_ref).await;
            (adapter, result)
        })
        .await?
    }

    pub fn list_tables_sync(&self, schema_ref: &str) -> WorkbenchResult<Vec<CatalogObject>> {
        self.workers.block_on(self.list_tables(schema_ref))
    }

    pub async fn list_columns(
        &self,
        schema_ref: &str,
        table: &str,
    ) -> WorkbenchResult<Vec<CatalogObject>> {
        let schema_ref = schema_ref.to_owned();
        let table = table.to_owned();
        self.dispatch(move |mut adapter| async move {
            let result = adapter.list_columns(&schema_ref, &table).await;
            (adapter, result)
        })
        .await?
    }

    pub fn list_columns_sync(
        &self,
        schema_ref: &str,
        table: &str,
    ) -> WorkbenchResult<Vec<CatalogObject>> {
        self.workers.block_on(self.list_columns(schema_ref, table))
    }

    /// Check the profile: connects if needed, runs `SELECT 1 as test`, and
    /// restores the previous connection state.
    pub async fn test_connection(&self) -> (bool, String) {
        self.dispatch(|mut adapter| async move {
            let result = adapter.test_connection().await;
            (adapter, result)
        })
        .await
        .unwrap_or_else(|e| (false, format!("Connection test failed: {e}")))
    }

    pub fn test_connection_sync(&self) -> (bool, String) {
        self.workers.block_on(self.test_connection())
    }

    // ========== Dispatch ==========

    /// Take the adapter lock in arrival order, then run `op` on the worker pool.
    async fn dispatch<T, F, Fut>(&self, op: F) -> WorkbenchResult<T>
    where
        F: FnOnce(AdapterGuard) -> Fut,
        Fut: Future<Output = (AdapterGuard, T)> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.adapter.clone().lock_owned().await;
        let (guard, value) = self.workers.run(op(guard)).await?;
        let still_connected = guard.is_connected();
        drop(guard);

        if !still_connected {
            let mut state = self.state.write();
            if state.status.is_connected() {
                tracing::warn!(connection = %self.name, "Session lost");
                state.status = ConnectionStatus::error("Connection lost", true);
                state.connected_at = None;
            }
        }
        Ok(value)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("engine", &self.engine())
            .field("status", &self.status())
            .finish()
    }
}
