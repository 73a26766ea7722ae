//! SSH tunnel: local port forwarding through a bastion host.
//!
//! A [`Tunnel`] owns one SSH session and one loopback listener. Each accepted
//! local connection gets its own `direct-tcpip` channel to the database host.

use async_trait::async_trait;
use russh::client;
use russh_keys::key::KeyPair;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;
use crate::models::{SshAuthMethod, SshTunnelConfig};
use crate::services::adapter::log_teardown;

/// Loopback address the tunnel listens on.
pub const TUNNEL_BIND_HOST: &str = "127.0.0.1";

/// Lifecycle of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Connecting,
    Open { local_port: u16 },
    Closed,
}

/// SSH client handler for russh.
struct TunnelClientHandler;

#[async_trait]
impl client::Handler for TunnelClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are accepted on first use; known_hosts checking is not implemented.
        Ok(true)
    }
}

type SessionHandle = Arc<client::Handle<TunnelClientHandler>>;

/// A forwarded local port reaching `remote_host:remote_port` through SSH.
pub struct Tunnel {
    config: SshTunnelConfig,
    remote_host: String,
    remote_port: u16,
    handshake_timeout: Duration,
    state: TunnelState,
    session: Option<SessionHandle>,
    forwarder: Option<JoinHandle<()>>,
    cancel_token: CancellationToken,
}

impl Tunnel {
    pub fn new(
        config: SshTunnelConfig,
        remote_host: impl Into<String>,
        remote_port: u16,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            config,
            remote_host: remote_host.into(),
            remote_port,
            handshake_timeout,
            state: TunnelState::Idle,
            session: None,
            forwarder: None,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Local port to point the engine driver at, while open.
    pub fn local_port(&self) -> Option<u16> {
        match self.state {
            TunnelState::Open { local_port } => Some(local_port),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.local_port().is_some()
    }

    /// Establish the SSH session and start forwarding.
    ///
    /// Returns the local port on success. On any failure everything partially
    /// opened is torn down before the error is returned.
    pub async fn open(&mut self) -> Result<u16, TunnelError> {
        if let TunnelState::Open { local_port } = self.state {
            return Ok(local_port);
        }

        tracing::info!(
            ssh_host = %self.config.host,
            ssh_port = self.config.port,
            remote = %format!("{}:{}", self.remote_host, self.remote_port),
            "Opening SSH tunnel"
        );
        self.state = TunnelState::Connecting;

        match self.establish().await {
            Ok(local_port) => {
                self.state = TunnelState::Open { local_port };
                tracing::info!(local_port, ssh_host = %self.config.host, "SSH tunnel open");
                Ok(local_port)
            }
            Err(e) => {
                tracing::warn!(ssh_host = %self.config.host, error = %e, "SSH tunnel failed");
                self.close().await;
                Err(e)
            }
        }
    }

    async fn establish(&mut self) -> Result<u16, TunnelError> {
        let handle = match tokio::time::timeout(self.handshake_timeout, self.connect_session()).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(self.unreachable(format!(
                    "handshake timed out after {}s",
                    self.handshake_timeout.as_secs()
                )))
            }
        };
        let session: SessionHandle = Arc::new(handle);
        self.session = Some(session.clone());

        self.check_forwarding(&session).await?;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| self.unreachable(format!("failed to bind local port: {e}")))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| self.unreachable(format!("failed to read local port: {e}")))?
            .port();

        self.cancel_token = CancellationToken::new();
        self.forwarder = Some(tokio::spawn(run_forwarder(
            listener,
            session,
            self.remote_host.clone(),
            self.remote_port,
            self.cancel_token.clone(),
        )));

        Ok(local_port)
    }

    async fn connect_session(&self) -> Result<client::Handle<TunnelClientHandler>, TunnelError> {
        let config = Arc::new(client::Config::default());

        let mut handle = client::connect(
            config,
            (self.config.host.as_str(), self.config.port),
            TunnelClientHandler,
        )
        .await
        .map_err(|e| self.unreachable(e.to_string()))?;

        let authenticated = match &self.config.auth {
            SshAuthMethod::Password(password) => handle
                .authenticate_password(self.config.username.as_str(), password.as_str())
                .await
                .map_err(|e| self.unreachable(format!("password authentication aborted: {e}")))?,
            SshAuthMethod::KeyFile(path) => {
                let key = load_private_key(path)
                    .await
                    .map_err(|reason| self.auth_failed(reason))?;
                handle
                    .authenticate_publickey(self.config.username.as_str(), key)
                    .await
                    .map_err(|e| self.unreachable(format!("key authentication aborted: {e}")))?
            }
        };

        if !authenticated {
            return Err(self.auth_failed("credentials rejected by server".to_string()));
        }

        tracing::debug!(
            username = %self.config.username,
            ssh_host = %self.config.host,
            "SSH authentication successful"
        );
        Ok(handle)
    }

    /// Open and close one channel so a server that forbids forwarding fails
    /// here instead of on the first engine connection.
    async fn check_forwarding(&self, session: &SessionHandle) -> Result<(), TunnelError> {
        let channel = session
            .channel_open_direct_tcpip(
                self.remote_host.as_str(),
                u32::from(self.remote_port),
                TUNNEL_BIND_HOST,
                0,
            )
            .await
            .map_err(|e| TunnelError::ChannelRejected {
                target: format!("{}:{}", self.remote_host, self.remote_port),
                reason: e.to_string(),
            })?;
        log_teardown("SSH forwarding check channel close", channel.close().await);
        Ok(())
    }

    /// Stop forwarding and end the SSH session.
    ///
    /// Safe to call in any state and more than once. Failures are logged.
    pub async fn close(&mut self) {
        self.cancel_token.cancel();

        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        if let Some(session) = self.session.take() {
            if let Err(e) = session
                .disconnect(russh::Disconnect::ByApplication, "tunnel closed", "en")
                .await
            {
                tracing::warn!(ssh_host = %self.config.host, error = %e, "SSH disconnect failed");
            }
        }

        if let TunnelState::Open { local_port } = self.state {
            tracing::info!(local_port, ssh_host = %self.config.host, "SSH tunnel closed");
        }
        self.state = TunnelState::Closed;
    }

    fn unreachable(&self, reason: String) -> TunnelError {
        TunnelError::TransportUnreachable {
            host: self.config.host.clone(),
            port: self.config.port,
            reason,
        }
    }

    fn auth_failed(&self, reason: String) -> TunnelError {
        TunnelError::AuthenticationFailed {
            username: self.config.username.clone(),
            host: self.config.host.clone(),
            reason,
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("ssh_host", &self.config.host)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("state", &self.state)
            .finish()
    }
}

/// Load a private key from a file.
async fn load_private_key(path: &Path) -> Result<Arc<KeyPair>, String> {
    let key_data = tokio::fs::read(path)
        .await
        .map_err(|e| format!("cannot read key file {}: {e}", path.display()))?;

    let key = russh_keys::decode_secret_key(&String::from_utf8_lossy(&key_data), None)
        .map_err(|e| format!("cannot parse key file {}: {e}", path.display()))?;

    Ok(Arc::new(key))
}

async fn run_forwarder(
    listener: TcpListener,
    session: SessionHandle,
    remote_host: String,
    remote_port: u16,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((local_stream, peer_addr)) => {
                        tracing::trace!(%peer_addr, "Tunnel connection accepted");
                        let session = session.clone();
                        let remote_host = remote_host.clone();
                        let cancel = cancel_token.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                forward_connection(local_stream, session, &remote_host, remote_port, cancel).await
                            {
                                tracing::warn!(error = %e, "Tunnel forwarding error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept tunnel connection");
                    }
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }
}

async fn forward_connection(
    mut local_stream: TcpStream,
    session: SessionHandle,
    remote_host: &str,
    remote_port: u16,
    cancel_token: CancellationToken,
) -> Result<(), russh::Error> {
    let channel = session
        .channel_open_direct_tcpip(remote_host, u32::from(remote_port), TUNNEL_BIND_HOST, 0)
        .await?;

    let mut channel = channel.into_stream();
    let mut buf_local = [0u8; 8192];
    let mut buf_remote = [0u8; 8192];

    loop {
        tokio::select! {
            n = local_stream.read(&mut buf_local) => {
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if channel.write_all(&buf_local[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            n = channel.read(&mut buf_remote) => {
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if local_stream.write_all(&buf_remote[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use russh::server::{self, Auth, Msg, Session};
    use russh::Channel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    pub const SSH_USERNAME: &str = "deploy";
    pub const SSH_PASSWORD: &str = "s3cret";
    /// Forwarding to this host is refused by [`spawn_ssh_server`].
    pub const FORBIDDEN_HOST: &str = "forbidden.invalid";

    /// Handle to an in-process SSH server.
    pub struct SshServer {
        pub port: u16,
        opened: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    impl SshServer {
        pub fn sessions_opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        pub fn sessions_closed(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }

        /// Wait until at least one session was accepted and every one has ended.
        pub async fn wait_until_idle(&self, limit: Duration) -> bool {
            let deadline = Instant::now() + limit;
            loop {
                let opened = self.sessions_opened();
                if opened > 0 && self.sessions_closed() == opened {
                    return true;
                }
                if Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    struct ForwardingHandler;

    #[async_trait]
    impl server::Handler for ForwardingHandler {
        type Error = russh::Error;

        async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
            if user == SSH_USERNAME && password == SSH_PASSWORD {
                Ok(Auth::Accept)
            } else {
                Ok(Auth::Reject { proceed_with_methods: None })
            }
        }

        async fn channel_open_direct_tcpip(
            &mut self,
            channel: Channel<Msg>,
            host_to_connect: &str,
            port_to_connect: u32,
            _originator_address: &str,
            _originator_port: u32,
            _session: &mut Session,
        ) -> Result<bool, Self::Error> {
            if host_to_connect == FORBIDDEN_HOST {
                return Ok(false);
            }
            let Ok(port) = u16::try_from(port_to_connect) else {
                return Ok(false);
            };
            let target = format!("{host_to_connect}:{port}");
            tokio::spawn(async move {
                match TcpStream::connect(target).await {
                    Ok(mut upstream) => {
                        let mut stream = channel.into_stream();
                        let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
                    }
                    Err(_) => {
                        let _ = channel.close().await;
                    }
                }
            });
            Ok(true)
        }
    }

    /// SSH server accepting [`SSH_USERNAME`]/[`SSH_PASSWORD`] and forwarding
    /// `direct-tcpip` channels to any reachable host.
    pub async fn spawn_ssh_server() -> SshServer {
        let config = Arc::new(server::Config {
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![KeyPair::generate_ed25519()],
            ..Default::default()
        });
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let (accepted, ended) = (opened.clone(), closed.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let config = config.clone();
                let (accepted, ended) = (accepted.clone(), ended.clone());
                tokio::spawn(async move {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    if let Ok(session) = server::run_stream(config, socket, ForwardingHandler).await {
                        let _ = session.await;
                    }
                    ended.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        SshServer { port, opened, closed }
    }

    /// TCP server echoing every byte back.
    pub async fn spawn_echo_server() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        port
    }

    /// TCP server that hangs up on every connection.
    pub async fn spawn_hangup_server() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });
        port
    }
}
