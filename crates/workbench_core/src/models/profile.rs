//! Connection profiles: what the UI hands over when it asks for a connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{WorkbenchError, WorkbenchResult};

/// Database engine a profile targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "postgresql")]
    PostgreSql,
}

impl EngineKind {
    /// Convert to string representation for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::PostgreSql => "postgresql",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mysql" | "mariadb" => Some(Self::MySql),
            "postgresql" | "postgres" | "pg" => Some(Self::PostgreSql),
            _ => None,
        }
    }

    /// Well-known server port.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::MySql => 3306,
            Self::PostgreSql => 5432,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MySql => write!(f, "MySQL"),
            Self::PostgreSql => write!(f, "PostgreSQL"),
        }
    }
}

/// SSH authentication method.
#[derive(Clone, PartialEq, Eq)]
pub enum SshAuthMethod {
    /// Private key authentication
    KeyFile(PathBuf),
    /// Password authentication
    Password(String),
}

impl fmt::Debug for SshAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Self::Password(_) => f.debug_tuple("Password").field(&"<redacted>").finish(),
        }
    }
}

/// SSH tunnel settings derived from a profile's `ssh_*` fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTunnelConfig {
    /// SSH server hostname
    pub host: String,
    /// SSH server port (default 22)
    pub port: u16,
    /// SSH username
    pub username: String,
    /// Authentication method
    pub auth: SshAuthMethod,
}

/// Timeouts and session settings applied to every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Engine connect timeout in seconds
    pub connect_timeout_secs: u32,
    /// Per-statement read timeout in seconds
    pub read_timeout_secs: u32,
    /// Per-statement write timeout in seconds
    pub write_timeout_secs: u32,
    /// SSH handshake and authentication timeout in seconds
    pub tunnel_timeout_secs: u32,
    /// Application name reported to the server
    pub application_name: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            tunnel_timeout_secs: 10,
            application_name: "Workbench".to_string(),
        }
    }
}

impl ConnectionOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.connect_timeout_secs))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.read_timeout_secs))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.write_timeout_secs))
    }

    pub fn tunnel_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.tunnel_timeout_secs))
    }

    /// Upper bound for a single statement round trip.
    pub fn statement_timeout(&self) -> Duration {
        self.read_timeout().max(self.write_timeout())
    }
}

fn default_ssh_port() -> u16 {
    22
}

/// Connection parameters for one database.
///
/// Field names match the saved-connections JSON the settings layer writes, so a
/// profile can be deserialized directly from it. The password is not part of
/// the `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Display name
    pub name: String,
    /// Target engine
    #[serde(rename = "database_type")]
    pub engine: EngineKind,
    /// Server hostname or IP
    pub host: String,
    /// Server port
    pub port: u16,
    /// Login username
    #[serde(default)]
    pub username: String,
    /// Login password
    #[serde(default)]
    pub password: String,
    /// Initial database (PostgreSQL) or schema (MySQL)
    #[serde(default)]
    pub default_schema: Option<String>,
    /// TLS preference from the saved-connections file. Carried so it survives
    /// a load/save round trip; connections are made without TLS.
    #[serde(default)]
    pub use_ssl: bool,
    /// SSH bastion host
    #[serde(default)]
    pub ssh_hostname: Option<String>,
    /// SSH bastion port
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// SSH username
    #[serde(default)]
    pub ssh_username: Option<String>,
    /// Private key for SSH authentication
    #[serde(default)]
    pub ssh_key_file: Option<PathBuf>,
    /// Password for SSH authentication
    #[serde(default)]
    pub ssh_password: Option<String>,
    /// Timeouts and session settings
    #[serde(default)]
    pub options: ConnectionOptions,
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("name", &self.name)
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("default_schema", &self.default_schema)
            .field("ssh_hostname", &self.ssh_hostname)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_username", &self.ssh_username)
            .field("ssh_key_file", &self.ssh_key_file)
            .field("ssh_password", &self.ssh_password.as_ref().map(|_| "<redacted>"))
            .field("options", &self.options)
            .finish()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

impl ConnectionProfile {
    /// Create a new profile with the engine's default port.
    pub fn new(name: impl Into<String>, engine: EngineKind, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine,
            host: host.into(),
            port: engine.default_port(),
            username: String::new(),
            password: String::new(),
            default_schema: None,
            use_ssl: false,
            ssh_hostname: None,
            ssh_port: default_ssh_port(),
            ssh_username: None,
            ssh_key_file: None,
            ssh_password: None,
            options: ConnectionOptions::default(),
        }
    }

    /// Create a builder for complex configurations.
    pub fn builder(engine: EngineKind) -> ConnectionProfileBuilder {
        ConnectionProfileBuilder::new(engine)
    }

    /// Whether any SSH field is set.
    pub fn uses_ssh(&self) -> bool {
        non_empty(&self.ssh_hostname).is_some()
            || non_empty(&self.ssh_username).is_some()
            || non_empty(&self.ssh_password).is_some()
            || self.ssh_key_file.as_ref().is_some_and(|p| !p.as_os_str().is_empty())
    }

    /// The database or schema to open initially, if one is configured.
    pub fn default_schema(&self) -> Option<&str> {
        non_empty(&self.default_schema)
    }

    /// Validate the profile before any network activity.
    pub fn validate(&self) -> WorkbenchResult<()> {
        if self.name.trim().is_empty() {
            return Err(WorkbenchError::validation("Name is required"));
        }
        if self.host.trim().is_empty() {
            return Err(WorkbenchError::validation("Host is required"));
        }
        if self.port == 0 {
            return Err(WorkbenchError::validation("Port must be non-zero"));
        }
        if self.uses_ssh() {
            if non_empty(&self.ssh_hostname).is_none() {
                return Err(WorkbenchError::validation("SSH host is required for SSH tunneling"));
            }
            if non_empty(&self.ssh_username).is_none() {
                return Err(WorkbenchError::validation(
                    "SSH username is required for SSH tunneling",
                ));
            }
            if self.ssh_port == 0 {
                return Err(WorkbenchError::validation("SSH port must be non-zero"));
            }
        }
        Ok(())
    }

    /// SSH tunnel settings, when the profile asks for a tunnel.
    ///
    /// A key file takes precedence over a password when both are set.
    pub fn ssh_tunnel(&self) -> WorkbenchResult<Option<SshTunnelConfig>> {
        if !self.uses_ssh() {
            return Ok(None);
        }
        self.validate()?;

        let auth = match (&self.ssh_key_file, non_empty(&self.ssh_password)) {
            (Some(path), _) if !path.as_os_str().is_empty() => SshAuthMethod::KeyFile(path.clone()),
            (_, Some(password)) => SshAuthMethod::Password(password.to_string()),
            _ => {
                return Err(WorkbenchError::validation(
                    "SSH tunneling needs a key file or a password",
                ))
            }
        };

        Ok(Some(SshTunnelConfig {
            host: self.ssh_hostname.clone().unwrap_or_default(),
            port: self.ssh_port,
            username: self.ssh_username.clone().unwrap_or_default(),
            auth,
        }))
    }

    /// Get the display connection string (without password).
    pub fn display_url(&self) -> String {
        let database = self.default_schema().unwrap_or_default();
        format!(
            "{}://{}@{}:{}/{}",
            self.engine.as_str(),
            self.username,
            self.host,
            self.port,
            database
        )
    }
}

/// Builder for ConnectionProfile.
#[derive(Debug)]
pub struct ConnectionProfileBuilder {
    profile: ConnectionProfile,
}

impl ConnectionProfileBuilder {
    fn new(engine: EngineKind) -> Self {
        Self { profile: ConnectionProfile::new("", engine, "localhost") }
    }

    /// Set the profile name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.profile.name = name.into();
        self
    }

    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.profile.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.profile.port = port;
        self
    }

    /// Set the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.profile.username = username.into();
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.profile.password = password.into();
        self
    }

    /// Set the initial database or schema.
    pub fn default_schema(mut self, schema: impl Into<String>) -> Self {
        self.profile.default_schema = Some(schema.into());
        self
    }

    /// Route the connection through an SSH bastion.
    pub fn ssh(mut self, host: impl Into<String>, username: impl Into<String>) -> Self {
        self.profile.ssh_hostname = Some(host.into());
        self.profile.ssh_username = Some(username.into());
        self
    }

    /// Set the SSH port.
    pub fn ssh_port(mut self, port: u16) -> Self {
        self.profile.ssh_port = port;
        self
    }

    /// Set key-based SSH authentication.
    pub fn ssh_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.profile.ssh_key_file = Some(path.into());
        self
    }

    /// Set password-based SSH authentication.
    pub fn ssh_password(mut self, password: impl Into<String>) -> Self {
        self.profile.ssh_password = Some(password.into());
        self
    }

    /// Set connection options.
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.profile.options = options;
        self
    }

    /// Set the engine connect timeout.
    pub fn connect_timeout_secs(mut self, secs: u32) -> Self {
        self.profile.options.connect_timeout_secs = secs;
        self
    }

    /// Build and validate the profile.
    pub fn build(self) -> WorkbenchResult<ConnectionProfile> {
        self.profile.validate()?;
        Ok(self.profile)
    }
}
