//! Error types for SQLProxy operations.

use std::fmt;

/// The primary error type for all SQLProxy operations.
#[derive(Debug)]
pub enum Error {
    /// Link-level errors (transport, closed link, authentication)
    Connection(ConnectionError),
    /// Protocol errors (wire-level)
    Protocol(ProtocolError),
    /// Pool errors
    Pool(PoolError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors outside of a link (listener, config files)
    Io(std::io::Error),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish the upstream connection
    Connect,
    /// Upstream refused the TCP connection
    Refused,
    /// Socket read/write failed or was short; the link is dead
    Transport,
    /// Operation attempted on a link that is already closed
    Closed,
    /// Upstream rejected the credentials during a real handshake
    Authentication,
    /// Handshake replay requested before any real handshake succeeded
    NotAuthenticated,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// No link became available within the wait timeout
    Exhausted,
    /// Pool has been shut down
    Closed,
    /// Configuration error
    Config,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a transport error wrapping an I/O failure.
    pub fn transport(message: impl Into<String>, source: std::io::Error) -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Transport,
            message: message.into(),
            source: Some(Box::new(source)),
        })
    }

    /// Build an error for an operation on a closed link.
    pub fn closed(message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Closed,
            message: message.into(),
            source: None,
        })
    }

    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// The connection error kind, if this is a link-level error.
    pub fn connection_kind(&self) -> Option<ConnectionErrorKind> {
        match self {
            Error::Connection(c) => Some(c.kind),
            _ => None,
        }
    }

    /// The pool error kind, if this is a pool error.
    pub fn pool_kind(&self) -> Option<PoolErrorKind> {
        match self {
            Error::Pool(p) => Some(p.kind),
            _ => None,
        }
    }

    /// Did a socket read or write fail?
    pub fn is_transport(&self) -> bool {
        matches!(self.connection_kind(), Some(ConnectionErrorKind::Transport))
            || matches!(self, Error::Io(_))
    }

    /// Did the upstream reject authentication?
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self.connection_kind(),
            Some(ConnectionErrorKind::Authentication)
        )
    }

    /// Did a pool acquisition time out?
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self.pool_kind(), Some(PoolErrorKind::Exhausted))
    }

    /// Is this a retryable error (pool exhausted, upstream unreachable)?
    ///
    /// The proxy does not retry; a refused client is told whether trying
    /// again later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::Exhausted),
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect | ConnectionErrorKind::Refused
            ),
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for SQLProxy operations.
pub type Result<T> = std::result::Result<T, Error>;
