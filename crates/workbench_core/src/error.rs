//! Error types for the Workbench connectivity layer.
//!
//! Every engine, tunnel, and registry failure is converted into a [`WorkbenchError`]
//! before it crosses an adapter boundary. Raw driver errors never escape.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type WorkbenchResult<T> = Result<T, WorkbenchError>;

/// Which leg of a connection rejected the credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthLeg {
    /// The SSH bastion rejected the tunnel credentials.
    Ssh,
    /// The database server rejected the login.
    Database,
}

impl std::fmt::Display for AuthLeg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ssh => write!(f, "SSH"),
            Self::Database => write!(f, "Database"),
        }
    }
}

/// Coarse classification of a failure, carried by error-variant query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthenticationFailed,
    NetworkUnreachable,
    TunnelFailed,
    EngineError,
    NotConnected,
    NotFound,
    Validation,
    Internal,
}

/// Main error type for the connectivity layer.
#[derive(Debug, Error)]
pub enum WorkbenchError {
    /// Credentials were rejected by the SSH server or the database.
    #[error("{leg} authentication failed: {message}")]
    Authentication {
        /// Which side rejected the login.
        leg: AuthLeg,
        /// Human-readable error message.
        message: String,
    },

    /// A host could not be reached, refused the connection, or timed out.
    #[error("Network unreachable: {message}")]
    NetworkUnreachable {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The SSH tunnel failed after the session was established.
    #[error("SSH tunnel error: {message}")]
    Tunnel {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// The engine rejected a statement or catalog query.
    #[error("{message}")]
    Engine {
        /// Engine error message.
        message: String,
        /// Engine error code (SQLSTATE for PostgreSQL, numeric code for MySQL).
        code: Option<String>,
    },

    /// An operation needed a live engine handle and there was none.
    #[error("Not connected to database")]
    NotConnected,

    /// No connection is registered under the given name.
    #[error("Connection not found: {name}")]
    ConnectionNotFound {
        /// Requested connection name.
        name: String,
    },

    /// A profile or argument failed validation.
    #[error("Validation error: {message}")]
    Validation {
        /// Human-readable error message.
        message: String,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl WorkbenchError {
    // ========== Constructors ==========

    /// Create an authentication error for the given leg.
    pub fn authentication(leg: AuthLeg, message: impl Into<String>) -> Self {
        Self::Authentication { leg, message: message.into() }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkUnreachable { message: message.into(), source: None }
    }

    /// Create a network error with source.
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::NetworkUnreachable { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a tunnel error.
    pub fn tunnel(message: impl Into<String>) -> Self {
        Self::Tunnel { message: message.into(), hint: None }
    }

    /// Create an engine error.
    pub fn engine(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Engine { message: message.into(), code }
    }

    /// Create a not-found error for a registry lookup.
    pub fn connection_not_found(name: impl Into<String>) -> Self {
        Self::ConnectionNotFound { name: name.into() }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    // ========== Methods ==========

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication { .. } => ErrorKind::AuthenticationFailed,
            Self::NetworkUnreachable { .. } => ErrorKind::NetworkUnreachable,
            Self::Tunnel { .. } => ErrorKind::TunnelFailed,
            Self::Engine { .. } => ErrorKind::EngineError,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::ConnectionNotFound { .. } => ErrorKind::NotFound,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "Authentication",
            Self::NetworkUnreachable { .. } => "Network",
            Self::Tunnel { .. } => "SSH",
            Self::Engine { .. } => "Query",
            Self::NotConnected => "Connection",
            Self::ConnectionNotFound { .. } => "Registry",
            Self::Validation { .. } => "Validation",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Authentication { leg: AuthLeg::Ssh, .. } => {
                Some("Check SSH username, password or key file")
            }
            Self::Authentication { leg: AuthLeg::Database, .. } => {
                Some("Check database username and password")
            }
            Self::NetworkUnreachable { .. } => Some("Check that the server is running and reachable"),
            Self::Tunnel { hint, .. } => hint.as_deref(),
            Self::Engine { .. } => None,
            Self::NotConnected => Some("Connect before running statements"),
            Self::ConnectionNotFound { .. } => None,
            Self::Validation { .. } => None,
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Get the engine error code (if applicable).
    pub fn engine_code(&self) -> Option<&str> {
        match self {
            Self::Engine { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Failure while establishing an SSH tunnel.
///
/// The three cases are kept apart so the UI can tell a rejected login from an
/// unreachable bastion.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("SSH authentication failed for {username}@{host}: {reason}")]
    AuthenticationFailed { username: String, host: String, reason: String },

    #[error("Cannot connect to SSH server {host}:{port}: {reason}")]
    TransportUnreachable { host: String, port: u16, reason: String },

    #[error("SSH server refused forwarding to {target}: {reason}")]
    ChannelRejected { target: String, reason: String },
}

// ========== Error Conversions ==========

impl From<TunnelError> for WorkbenchError {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::AuthenticationFailed { .. } => {
                WorkbenchError::authentication(AuthLeg::Ssh, err.to_string())
            }
            TunnelError::TransportUnreachable { .. } => {
                WorkbenchError::network_with_source(err.to_string(), err)
            }
            TunnelError::ChannelRejected { .. } => WorkbenchError::Tunnel {
                message: err.to_string(),
                hint: Some("Check that the SSH server allows TCP forwarding".to_string()),
            },
        }
    }
}

/// Convert from tokio_postgres::Error to WorkbenchError.
impl From<tokio_postgres::Error> for WorkbenchError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let code_str = db_err.code().code();
            return match code_str {
                "28P01" | "28000" => WorkbenchError::authentication(AuthLeg::Database, message),
                _ if code_str.starts_with("08") => {
                    WorkbenchError::network_with_source(message, err)
                }
                _ => WorkbenchError::engine(message, Some(code_str.to_string())),
            };
        }

        if err.is_closed() {
            return WorkbenchError::network_with_source("Connection closed", err);
        }

        WorkbenchError::network_with_source(err.to_string(), err)
    }
}

/// Convert from mysql_async::Error to WorkbenchError.
impl From<mysql_async::Error> for WorkbenchError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Server(server) => match server.code {
                // ER_DBACCESS_DENIED_ERROR, ER_ACCESS_DENIED_ERROR, ER_ACCESS_DENIED_NO_PASSWORD_ERROR
                1044 | 1045 | 1698 => {
                    WorkbenchError::authentication(AuthLeg::Database, server.message)
                }
                code => WorkbenchError::engine(server.message, Some(code.to_string())),
            },
            mysql_async::Error::Io(io) => WorkbenchError::network_with_source(io.to_string(), io),
            mysql_async::Error::Driver(driver) => WorkbenchError::engine(driver.to_string(), None),
            other => WorkbenchError::engine(other.to_string(), None),
        }
    }
}

/// Convert from std::io::Error to WorkbenchError.
impl From<std::io::Error> for WorkbenchError {
    fn from(err: std::io::Error) -> Self {
        WorkbenchError::network_with_source(err.to_string(), err)
    }
}
