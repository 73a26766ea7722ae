//! The engine capability set and the factory that picks an implementation.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::error::{WorkbenchError, WorkbenchResult};
use crate::models::{CatalogObject, ConnectionProfile, EngineKind, QueryOutcome, QueryResult};
use crate::services::mysql::MySqlAdapter;
use crate::services::postgres::PostgresAdapter;
use crate::services::tunnel::{Tunnel, TunnelState, TUNNEL_BIND_HOST};

/// Statement used to prove a session is usable.
pub const TEST_QUERY: &str = "SELECT 1 as test";

/// Notice returned for blank statements instead of a round trip.
pub const EMPTY_STATEMENT_NOTICE: &str = "Nothing to execute";

/// Operations every engine supports.
///
/// Adapters own their engine handle and optional tunnel exclusively. Failures
/// are converted into [`WorkbenchError`] or an error-variant [`QueryResult`]
/// before they leave an adapter.
#[async_trait]
pub trait DatabaseAdapter: Send {
    fn engine(&self) -> EngineKind;

    fn profile(&self) -> &ConnectionProfile;

    fn is_connected(&self) -> bool;

    /// State of the SSH tunnel, if the profile uses one.
    fn tunnel_state(&self) -> Option<TunnelState>;

    /// Open the tunnel (if configured) and the engine session.
    ///
    /// Connecting an already connected adapter is a no-op. On failure every
    /// partially opened resource is released.
    async fn connect(&mut self) -> WorkbenchResult<()>;

    /// Close the engine session, then the tunnel. Idempotent.
    async fn disconnect(&mut self);

    async fn execute_query(&mut self, sql: &str, fetch_results: bool) -> QueryResult;

    async fn list_databases(&mut self) -> WorkbenchResult<Vec<CatalogObject>>;

    async fn list_schemas(&mut self, database: &str) -> WorkbenchResult<Vec<CatalogObject>>;

    /// Tables and views of a schema. `schema_ref` may be `db.schema` where the
    /// engine has databases above schemas.
    async fn list_tables(&mut self, schema_ref: &str) -> WorkbenchResult<Vec<CatalogObject>>;

    async fn list_columns(
        &mut self,
        schema_ref: &str,
        table: &str,
    ) -> WorkbenchResult<Vec<CatalogObject>>;

    /// Check that a session can be opened and answers a trivial query.
    ///
    /// An adapter that was disconnected is left disconnected afterwards.
    async fn test_connection(&mut self) -> (bool, String) {
        let was_connected = self.is_connected();
        if !was_connected {
            if let Err(e) = self.connect().await {
                return (false, format!("Connection failed: {e}"));
            }
        }

        let result = self.execute_query(TEST_QUERY, true).await;

        if !was_connected {
            self.disconnect().await;
        }

        match result.outcome {
            QueryOutcome::Rows { .. } => (true, "Connection successful".to_string()),
            QueryOutcome::Error { message, .. } => {
                (false, format!("Connection test failed: {message}"))
            }
            _ => (false, "Connection test failed: no rows returned".to_string()),
        }
    }
}

/// Build the adapter for a profile's engine.
pub fn create_adapter(profile: ConnectionProfile) -> Box<dyn DatabaseAdapter> {
    match profile.engine {
        EngineKind::MySql => Box::new(MySqlAdapter::new(profile)),
        EngineKind::PostgreSql => Box::new(PostgresAdapter::new(profile)),
    }
}

/// Where the engine driver should connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Resolve the engine endpoint, opening an SSH tunnel when the profile asks for one.
pub(crate) async fn open_endpoint(
    profile: &ConnectionProfile,
) -> WorkbenchResult<(Endpoint, Option<Tunnel>)> {
    match profile.ssh_tunnel()? {
        None => Ok((Endpoint { host: profile.host.clone(), port: profile.port }, None)),
        Some(ssh) => {
            let mut tunnel = Tunnel::new(
                ssh,
                profile.host.clone(),
                profile.port,
                profile.options.tunnel_timeout(),
            );
            let local_port = tunnel.open().await?;
            Ok((Endpoint { host: TUNNEL_BIND_HOST.to_string(), port: local_port }, Some(tunnel)))
        }
    }
}

/// Close and drop a tunnel slot.
pub(crate) async fn close_tunnel(slot: &mut Option<Tunnel>) {
    if let Some(mut tunnel) = slot.take() {
        tunnel.close().await;
    }
}

/// Log a failed teardown step. The resource is discarded either way.
pub(crate) fn log_teardown<E: std::fmt::Display>(step: &'static str, result: Result<(), E>) {
    if let Err(e) = result {
        tracing::warn!(step, error = %e, "Teardown step failed");
    }
}

/// Bound an engine round trip, classifying expiry as a network failure.
pub(crate) async fn bounded<F, T, E>(limit: Duration, what: &str, future: F) -> WorkbenchResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<WorkbenchError>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(WorkbenchError::network(format!(
            "{what} timed out after {}s",
            limit.as_secs()
        ))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use parking_lot::Mutex;
    use std::io::Write;
    use std::net::{Ipv4Addr, TcpListener};
    use std::sync::Arc;

    /// A local port with nothing listening on it.
    pub fn refused_port() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Run `f` with a thread-local subscriber and return what it logged.
    pub fn capture_logs(f: impl FnOnce()) -> String {
        let buffer = SharedBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buffer.0.lock().clone();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{capture_logs, refused_port};
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Instant;

    fn unreachable_profile(engine: EngineKind) -> ConnectionProfile {
        ConnectionProfile::builder(engine)
            .name("offline")
            .host("127.0.0.1")
            .port(refused_port())
            .username("app")
            .password("secret")
            .build()
            .unwrap()
    }

    #[test]
    fn factory_picks_adapter_by_engine() {
        for engine in [EngineKind::MySql, EngineKind::PostgreSql] {
            let adapter = create_adapter(unreachable_profile(engine));
            assert_eq!(adapter.engine(), engine);
            assert!(!adapter.is_connected());
            assert_eq!(adapter.tunnel_state(), None);
        }
    }

    #[tokio::test]
    async fn test_connection_reports_unreachable_host() {
        for engine in [EngineKind::MySql, EngineKind::PostgreSql] {
            let mut adapter = create_adapter(unreachable_profile(engine));
            let started = Instant::now();
            let (ok, message) = adapter.test_connection().await;
            assert!(!ok);
            assert!(message.starts_with("Connection failed"), "{engine}: {message}");
            assert!(started.elapsed() < Duration::from_secs(10));
            assert!(!adapter.is_connected());
        }
    }

    #[tokio::test]
    async fn connect_failure_is_network_error() {
        for engine in [EngineKind::MySql, EngineKind::PostgreSql] {
            let mut adapter = create_adapter(unreachable_profile(engine));
            let err = adapter.connect().await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NetworkUnreachable, "{engine}: {err}");
        }
    }

    #[tokio::test]
    async fn tunnel_failure_leaves_nothing_open() {
        let profile = ConnectionProfile::builder(EngineKind::PostgreSql)
            .name("bastion")
            .host("db.internal")
            .ssh("127.0.0.1", "deploy")
            .ssh_port(refused_port())
            .ssh_password("pw")
            .build()
            .unwrap();
        let mut adapter = create_adapter(profile);

        let err = adapter.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkUnreachable);
        assert!(err.to_string().contains("Cannot connect to SSH server"), "{err}");
        assert!(!adapter.is_connected());
        assert_eq!(adapter.tunnel_state(), None);
    }

    #[tokio::test]
    async fn disconnected_adapter_answers_not_connected() {
        for engine in [EngineKind::MySql, EngineKind::PostgreSql] {
            let mut adapter = create_adapter(unreachable_profile(engine));
            let result = adapter.execute_query("SELECT 1", true).await;
            assert_eq!(result.error_kind(), Some(ErrorKind::NotConnected));
            assert_eq!(result.elapsed, Duration::ZERO);

            let err = adapter.list_databases().await.unwrap_err();
            assert!(matches!(err, WorkbenchError::NotConnected));
            adapter.disconnect().await;
            adapter.disconnect().await;
        }
    }

    #[test]
    fn failed_teardown_is_logged() {
        let logged = capture_logs(|| {
            log_teardown("forwarding check channel close", Err::<(), _>("channel already closed"));
            log_teardown::<String>("session disconnect", Ok(()));
        });
        assert!(logged.contains("Teardown step failed"), "{logged}");
        assert!(logged.contains("forwarding check channel close"), "{logged}");
        assert!(logged.contains("channel already closed"), "{logged}");
        assert!(!logged.contains("session disconnect"), "{logged}");
    }

    #[tokio::test]
    async fn invalid_profile_fails_before_network() {
        let mut profile = unreachable_profile(EngineKind::MySql);
        profile.ssh_username = Some("deploy".into());
        let mut adapter = create_adapter(profile);
        let err = adapter.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
