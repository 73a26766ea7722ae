//! Directory of named connections.
//!
//! The registry is an ordinary value: construct one, share it behind an `Arc`,
//! and call [`ConnectionRegistry::disconnect_all`] before dropping it.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::error::{WorkbenchError, WorkbenchResult};
use crate::models::{CatalogObject, ConnectionProfile};
use crate::services::connection::Connection;
use crate::services::mysql::MYSQL_SYSTEM_SCHEMAS;
use crate::services::worker::WorkerPool;

/// Move MySQL system schemas after user schemas, keeping relative order in both groups.
pub fn order_user_schemas_first(databases: Vec<CatalogObject>) -> Vec<CatalogObject> {
    let (system, mut user): (Vec<_>, Vec<_>) = databases
        .into_iter()
        .partition(|db| MYSQL_SYSTEM_SCHEMAS.contains(&db.name.as_str()));
    user.extend(system);
    user
}

/// Named connections sharing one worker pool.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    workers: Arc<WorkerPool>,
}

impl ConnectionRegistry {
    /// Create a registry with the default runtime configuration.
    pub fn new() -> WorkbenchResult<Self> {
        Self::with_config(&RuntimeConfig::default())
    }

    pub fn with_config(config: &RuntimeConfig) -> WorkbenchResult<Self> {
        let workers = Arc::new(WorkerPool::from_config(config)?);
        Ok(Self::with_workers(workers))
    }

    pub fn with_workers(workers: Arc<WorkerPool>) -> Self {
        Self { connections: RwLock::new(HashMap::new()), workers }
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    /// Register a connection without connecting it.
    ///
    /// A connection already registered under `name` is replaced and
    /// disconnected in the background.
    pub fn add(&self, name: impl Into<String>, profile: ConnectionProfile) -> Arc<Connection> {
        let name = name.into();
        let connection = Arc::new(Connection::new(name.clone(), profile, self.workers.clone()));
        let previous = self.connections.write().insert(name.clone(), connection.clone());

        tracing::info!(connection = %name, engine = ?connection.engine(), "Connection registered");

        if let Some(previous) = previous {
            tracing::debug!(connection = %name, "Replacing existing connection");
            self.workers.spawn(async move { previous.disconnect().await });
        }
        connection
    }

    pub fn get(&self, name: &str) -> WorkbenchResult<Arc<Connection>> {
        self.connections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| WorkbenchError::connection_not_found(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connections.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Disconnect and discard a connection.
    pub async fn remove(&self, name: &str) -> WorkbenchResult<()> {
        let connection = self
            .connections
            .write()
            .remove(name)
            .ok_or_else(|| WorkbenchError::connection_not_found(name))?;

        connection.disconnect().await;
        tracing::info!(connection = %name, "Connection removed");
        Ok(())
    }

    pub fn remove_sync(&self, name: &str) -> WorkbenchResult<()> {
        self.workers.block_on(self.remove(name))
    }

    /// Disconnect and discard every connection.
    pub async fn disconnect_all(&self) {
        let connections: Vec<Arc<Connection>> =
            self.connections.write().drain().map(|(_, connection)| connection).collect();
        let count = connections.len();

        for connection in connections {
            connection.disconnect().await;
        }
        tracing::info!(count, "All connections closed");
    }

    pub fn disconnect_all_sync(&self) {
        self.workers.block_on(self.disconnect_all())
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.names())
            .field("workers", &self.workers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EngineKind;

    fn names(objects: &[CatalogObject]) -> Vec<&str> {
        objects.iter().map(|o| o.name.as_str()).collect()
    }

    fn profile(name: &str, engine: EngineKind) -> ConnectionProfile {
        ConnectionProfile::new(name, engine, "localhost")
    }

    #[test]
    fn system_schemas_follow_user_schemas() {
        let listed: Vec<_> = [
            "information_schema",
            "shop",
            "mysql",
            "analytics",
            "performance_schema",
            "sys",
            "audit",
        ]
        .into_iter()
        .map(CatalogObject::schema)
        .collect();

        let ordered = order_user_schemas_first(listed);
        assert_eq!(
            names(&ordered),
            ["shop", "analytics", "audit", "information_schema", "mysql", "performance_schema", "sys"]
        );
    }

    #[test]
    fn ordering_handles_only_system_schemas() {
        let listed: Vec<_> = ["sys", "mysql"].into_iter().map(CatalogObject::schema).collect();
        assert_eq!(names(&order_user_schemas_first(listed)), ["sys", "mysql"]);
        assert!(order_user_schemas_first(Vec::new()).is_empty());
    }

    #[test]
    fn add_does_not_connect() {
        let registry = ConnectionRegistry::new().unwrap();
        let connection = registry.add("local", profile("local", EngineKind::MySql));
        assert!(!connection.is_connected());
        assert!(connection.status().is_disconnected());
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("local"));
    }

    #[test]
    fn get_returns_the_same_connection() {
        let registry = ConnectionRegistry::new().unwrap();
        let added = registry.add("pg", profile("pg", EngineKind::PostgreSql));
        let fetched = registry.get("pg").unwrap();
        assert_eq!(added.id(), fetched.id());
        assert_eq!(fetched.engine(), EngineKind::PostgreSql);
    }

    #[test]
    fn missing_name_is_not_found() {
        let registry = ConnectionRegistry::new().unwrap();
        let err = registry.get("nope").unwrap_err();
        assert!(matches!(err, WorkbenchError::ConnectionNotFound { ref name } if name == "nope"));
        assert!(registry.remove_sync("nope").is_err());
    }

    #[test]
    fn add_replaces_existing_name() {
        let registry = ConnectionRegistry::new().unwrap();
        let first = registry.add("main", profile("main", EngineKind::MySql));
        let second = registry.add("main", profile("main", EngineKind::PostgreSql));
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("main").unwrap().engine(), EngineKind::PostgreSql);
    }

    #[test]
    fn remove_discards_connection() {
        let registry = ConnectionRegistry::new().unwrap();
        registry.add("a", profile("a", EngineKind::MySql));
        registry.add("b", profile("b", EngineKind::PostgreSql));
        assert_eq!(registry.names(), ["a", "b"]);

        registry.remove_sync("a").unwrap();
        assert_eq!(registry.names(), ["b"]);
        assert!(registry.get("a").is_err());
    }

    #[test]
    fn disconnect_all_clears_registry() {
        let registry = ConnectionRegistry::with_config(&RuntimeConfig::default().with_worker_threads(1))
            .unwrap();
        let kept = registry.add("a", profile("a", EngineKind::MySql));
        registry.add("b", profile("b", EngineKind::PostgreSql));

        registry.disconnect_all_sync();
        assert!(registry.is_empty());
        assert!(kept.status().is_disconnected());
    }

    #[test]
    fn connections_have_independent_adapters() {
        let registry = ConnectionRegistry::new().unwrap();
        let a = registry.add("one", profile("same", EngineKind::PostgreSql));
        let b = registry.add("two", profile("same", EngineKind::PostgreSql));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.profile().name, b.profile().name);
        assert_eq!(registry.workers().worker_threads(), 2);
    }
}
