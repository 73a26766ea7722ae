//! Behavioural checks across the service layer that need no live server.
//!
//! Covered here:
//! - Profiles without SSH never open a tunnel; failed connects leave no tunnel behind
//! - Tunnelled engines connect to the tunnel's loopback port
//! - `disconnect` is idempotent at the adapter, facade and registry level
//! - MySQL database ordering and PostgreSQL internal-schema filtering
//! - Unreachable hosts fail within the connect timeout
//! - Concurrent statements on one connection never interleave
//! - Connection failures name the leg that failed, and passwords stay out of logs

#[cfg(test)]
mod tests {
    use crate::error::{AuthLeg, ErrorKind, TunnelError, WorkbenchError};
    use crate::models::{CatalogObject, ConnectionProfile, EngineKind, QueryOutcome};
    use crate::services::adapter::open_endpoint;
    use crate::services::adapter::test_support::refused_port;
    use crate::services::connection::tests::ScriptedAdapter;
    use crate::services::postgres::{is_internal_schema, INTERNAL_SCHEMAS};
    use crate::services::tunnel::test_support::{
        spawn_echo_server, spawn_hangup_server, spawn_ssh_server, SSH_PASSWORD, SSH_USERNAME,
    };
    use crate::services::tunnel::{TunnelState, TUNNEL_BIND_HOST};
    use crate::services::{
        create_adapter, order_user_schemas_first, Connection, ConnectionRegistry, WorkerPool,
    };
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn direct_profile(engine: EngineKind) -> ConnectionProfile {
        ConnectionProfile::builder(engine)
            .name("direct")
            .host("127.0.0.1")
            .port(refused_port())
            .username("app")
            .password("hunter2")
            .build()
            .unwrap()
    }

    // =========================================================================
    // Tunnel ownership
    // =========================================================================

    #[tokio::test]
    async fn direct_profile_never_opens_tunnel() {
        for engine in [EngineKind::MySql, EngineKind::PostgreSql] {
            let profile = direct_profile(engine);
            assert!(!profile.uses_ssh());
            assert!(profile.ssh_tunnel().unwrap().is_none());

            let mut adapter = create_adapter(profile);
            let _ = adapter.connect().await;
            assert_eq!(adapter.tunnel_state(), None);
        }
    }

    #[tokio::test]
    async fn broken_ssh_handshake_leaves_no_tunnel() {
        // Accepts TCP and answers with something that is not an SSH banner.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ssh_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            }
        });

        for engine in [EngineKind::MySql, EngineKind::PostgreSql] {
            let profile = ConnectionProfile::builder(engine)
                .name("bastion")
                .host("db.internal")
                .ssh("127.0.0.1", "deploy")
                .ssh_port(ssh_port)
                .ssh_password("pw")
                .build()
                .unwrap();
            let mut adapter = create_adapter(profile);

            let err = adapter.connect().await.unwrap_err();
            assert_ne!(err.kind(), ErrorKind::Validation, "{engine}: {err}");
            assert!(!adapter.is_connected());
            assert_eq!(adapter.tunnel_state(), None);
        }
    }

    fn tunnelled_profile(engine: EngineKind, ssh_port: u16, db_port: u16) -> ConnectionProfile {
        ConnectionProfile::builder(engine)
            .name("tunnelled")
            .host("127.0.0.1")
            .port(db_port)
            .username("app")
            .password("hunter2")
            .ssh("127.0.0.1", SSH_USERNAME)
            .ssh_port(ssh_port)
            .ssh_password(SSH_PASSWORD)
            .connect_timeout_secs(3)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn tunnelled_endpoint_is_the_loopback_port() {
        let ssh = spawn_ssh_server().await;
        let db_port = spawn_echo_server().await;

        for engine in [EngineKind::MySql, EngineKind::PostgreSql] {
            let profile = tunnelled_profile(engine, ssh.port, db_port);
            let (endpoint, tunnel) = open_endpoint(&profile).await.unwrap();
            let mut tunnel = tunnel.unwrap();

            assert_eq!(endpoint.host, TUNNEL_BIND_HOST);
            assert_ne!(endpoint.port, db_port);
            assert_eq!(tunnel.state(), TunnelState::Open { local_port: endpoint.port });
            tunnel.close().await;
            assert_eq!(tunnel.state(), TunnelState::Closed);
        }
        assert_eq!(ssh.sessions_opened(), 2);
        assert!(ssh.wait_until_idle(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn engine_failure_behind_open_tunnel_closes_it() {
        let ssh = spawn_ssh_server().await;
        let db_port = spawn_hangup_server().await;

        for engine in [EngineKind::MySql, EngineKind::PostgreSql] {
            let mut adapter = create_adapter(tunnelled_profile(engine, ssh.port, db_port));

            let err = adapter.connect().await.unwrap_err();
            assert_ne!(err.kind(), ErrorKind::Validation, "{engine}: {err}");
            assert_ne!(err.kind(), ErrorKind::TunnelFailed, "{engine}: {err}");
            assert!(!adapter.is_connected());
            assert_eq!(adapter.tunnel_state(), None);
        }
        assert_eq!(ssh.sessions_opened(), 2);
        assert!(ssh.wait_until_idle(Duration::from_secs(2)).await);
    }

    // =========================================================================
    // Disconnect idempotence
    // =========================================================================

    #[tokio::test]
    async fn adapter_disconnect_twice_is_quiet() {
        for engine in [EngineKind::MySql, EngineKind::PostgreSql] {
            let mut adapter = create_adapter(direct_profile(engine));
            adapter.disconnect().await;
            assert!(!adapter.is_connected());
            adapter.disconnect().await;
            assert!(!adapter.is_connected());

            let result = adapter.execute_query("SELECT 1", true).await;
            assert_eq!(result.error_kind(), Some(ErrorKind::NotConnected));
        }
    }

    #[test]
    fn facade_disconnect_twice_is_quiet() {
        let workers = Arc::new(WorkerPool::new(1).unwrap());
        let adapter = ScriptedAdapter::new(EngineKind::PostgreSql, Duration::ZERO);
        let connection = Connection::with_adapter("scripted", Box::new(adapter), workers);

        assert!(connection.connect_sync());
        connection.disconnect_sync();
        connection.disconnect_sync();
        assert!(connection.status().is_disconnected());
        assert!(connection.connected_at().is_none());
    }

    // =========================================================================
    // Catalog ordering and filtering
    // =========================================================================

    #[test]
    fn mysql_system_schemas_sort_last_stably() {
        let listed = [
            "zeta",
            "sys",
            "alpha",
            "information_schema",
            "mysql",
            "beta",
            "performance_schema",
        ];
        let ordered =
            order_user_schemas_first(listed.into_iter().map(CatalogObject::schema).collect());
        let names: Vec<&str> = ordered.iter().map(|o| o.name.as_str()).collect();

        assert_eq!(&names[..3], ["zeta", "alpha", "beta"]);
        assert_eq!(&names[3..], ["sys", "information_schema", "mysql", "performance_schema"]);
    }

    #[test]
    fn postgres_internal_schemas_are_filtered() {
        for name in INTERNAL_SCHEMAS {
            assert!(is_internal_schema(name), "{name}");
        }
        for name in ["public", "app", "pg_catalog_backup", "information", "PG_CATALOG"] {
            assert!(!is_internal_schema(name), "{name}");
        }
    }

    // =========================================================================
    // Timeouts
    // =========================================================================

    #[test]
    fn unreachable_test_connection_returns_within_timeout() {
        let registry = ConnectionRegistry::new().unwrap();
        for engine in [EngineKind::MySql, EngineKind::PostgreSql] {
            let name = format!("offline-{engine}");
            let connection = registry.add(name, direct_profile(engine));

            let started = Instant::now();
            let (ok, message) = connection.test_connection_sync();
            assert!(!ok);
            assert!(message.contains("failed"), "{message}");
            assert!(started.elapsed() <= connection.profile().options.connect_timeout());
        }
        registry.disconnect_all_sync();
    }

    #[tokio::test]
    async fn silent_server_hits_connect_timeout() {
        // Accepts TCP and never speaks.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let profile = ConnectionProfile::builder(EngineKind::MySql)
            .name("silent")
            .host("127.0.0.1")
            .port(port)
            .username("app")
            .connect_timeout_secs(1)
            .build()
            .unwrap();
        let mut adapter = create_adapter(profile);

        let started = Instant::now();
        let err = adapter.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkUnreachable, "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    #[test]
    fn statements_from_many_threads_never_overlap() {
        let workers = Arc::new(WorkerPool::new(4).unwrap());
        let adapter = ScriptedAdapter::new(EngineKind::MySql, Duration::from_millis(5));
        let log = adapter.log.clone();
        let connection = Arc::new(Connection::with_adapter("shared", Box::new(adapter), workers));
        assert!(connection.connect_sync());

        let threads: Vec<_> = (0..6)
            .map(|i| {
                let connection = connection.clone();
                thread::spawn(move || connection.execute_query_sync(&format!("q{i}"), true))
            })
            .collect();
        for handle in threads {
            let result = handle.join().unwrap();
            assert!(matches!(result.outcome, QueryOutcome::Affected { .. }));
        }

        let log = log.lock().clone();
        assert_eq!(log.len(), 12);
        for pair in log.chunks(2) {
            let statement = pair[0].strip_prefix("start ").unwrap();
            assert_eq!(pair[1], format!("end {statement}"));
        }
    }

    // =========================================================================
    // Error reporting
    // =========================================================================

    #[test]
    fn failures_name_the_leg_that_failed() {
        let ssh_auth: WorkbenchError = TunnelError::AuthenticationFailed {
            username: "deploy".into(),
            host: "bastion".into(),
            reason: "publickey rejected".into(),
        }
        .into();
        let ssh_transport: WorkbenchError = TunnelError::TransportUnreachable {
            host: "bastion".into(),
            port: 22,
            reason: "connection refused".into(),
        }
        .into();
        let db_auth = WorkbenchError::authentication(AuthLeg::Database, "access denied");
        let engine = WorkbenchError::engine("syntax error", Some("42601".into()));

        assert!(ssh_auth.to_string().starts_with("SSH authentication failed"));
        assert!(ssh_transport.to_string().contains("Cannot connect to SSH server"));
        assert!(db_auth.to_string().starts_with("Database authentication failed"));
        assert_eq!(engine.engine_code(), Some("42601"));

        let messages = [&ssh_auth, &ssh_transport, &db_auth, &engine].map(|e| e.to_string());
        for (i, a) in messages.iter().enumerate() {
            for b in &messages[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_ne!(ssh_auth.hint(), db_auth.hint());
    }

    #[test]
    fn passwords_stay_out_of_debug_output() {
        let profile = ConnectionProfile::builder(EngineKind::PostgreSql)
            .name("secret")
            .host("db")
            .username("app")
            .password("db-hunter2")
            .ssh("bastion", "deploy")
            .ssh_password("ssh-hunter2")
            .build()
            .unwrap();

        let rendered = format!("{profile:?} {:?}", profile.ssh_tunnel().unwrap());
        assert!(!rendered.contains("db-hunter2"));
        assert!(!rendered.contains("ssh-hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
