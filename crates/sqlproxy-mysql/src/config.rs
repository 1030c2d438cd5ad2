//! Upstream server configuration.
//!
//! [`UpstreamConfig`] names the one MySQL server the proxy talks to, and
//! [`UpstreamConnector`] dials it on behalf of the pool.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use sqlproxy_core::error::{ConnectionError, ConnectionErrorKind};
use sqlproxy_core::{Connector, Error, Result};

use crate::link::BackendLink;

/// Upstream MySQL server address and dial options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 3306)
    pub port: u16,
    /// Timeout for establishing the TCP connection
    pub connect_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl UpstreamConfig {
    /// Create a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hostname.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Get the socket address string for connection.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            // bare IPv6 literal
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = self
            .socket_addr()
            .to_socket_addrs()
            .map_err(|e| {
                Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Connect,
                    message: format!("Failed to resolve {}: {}", self.socket_addr(), e),
                    source: Some(Box::new(e)),
                })
            })?
            .collect();
        if addrs.is_empty() {
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("No addresses found for {}", self.socket_addr()),
                source: None,
            }));
        }
        Ok(addrs)
    }
}

/// Opens unauthenticated [`BackendLink`]s to the upstream server.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    config: UpstreamConfig,
}

impl UpstreamConnector {
    pub fn new(config: UpstreamConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }
}

impl Connector for UpstreamConnector {
    type Connection = BackendLink;

    /// Dial each resolved address in turn; the last failure is reported.
    fn connect(&self) -> Result<BackendLink> {
        let mut last_error = None;

        for addr in self.config.resolve()? {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    let link = BackendLink::new(stream);
                    tracing::debug!(link_id = link.id(), %addr, "opened upstream link");
                    return Ok(link);
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "upstream dial failed");
                    last_error = Some(e);
                }
            }
        }

        let e = last_error.unwrap_or_else(|| std::io::Error::other("no address to dial"));
        let kind = if e.kind() == std::io::ErrorKind::ConnectionRefused {
            ConnectionErrorKind::Refused
        } else {
            ConnectionErrorKind::Connect
        };
        Err(Error::Connection(ConnectionError {
            kind,
            message: format!("Failed to connect to {}: {}", self.config.socket_addr(), e),
            source: Some(Box::new(e)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_config_builder() {
        let config = UpstreamConfig::new()
            .host("db.internal")
            .port(3307)
            .connect_timeout(Duration::from_secs(2));

        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 3307);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.socket_addr(), "db.internal:3307");
    }

    #[test]
    fn test_config_defaults() {
        let config = UpstreamConfig::default();
        assert_eq!(config.socket_addr(), "127.0.0.1:3306");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_ipv6_socket_addr() {
        assert_eq!(UpstreamConfig::new().host("::1").socket_addr(), "[::1]:3306");
        assert_eq!(UpstreamConfig::new().host("[::1]").socket_addr(), "[::1]:3306");
    }

    #[test]
    fn test_connect_opens_unauthenticated_link() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = UpstreamConnector::new(UpstreamConfig::new().port(port));

        let link = connector.connect().unwrap();
        assert!(!link.is_authenticated());
        assert!(!link.is_closed());
        assert_eq!(link.peer().map(|a| a.port()), Some(port));
    }

    #[test]
    fn test_connect_refused() {
        // Grab a free port, then release it so nothing is listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let connector = UpstreamConnector::new(UpstreamConfig::new().port(port));

        let err = connector.connect().unwrap_err();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Refused));
        assert!(err.is_retryable());
    }
}
