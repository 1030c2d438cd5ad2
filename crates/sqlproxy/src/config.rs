//! Proxy configuration.
//!
//! Settings come from three layers, lowest priority first: built-in
//! defaults, an optional JSON file, and command-line flags (which may in
//! turn be fed from environment variables).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlproxy_core::error::ConfigError;
use sqlproxy_core::{Error, Result};
use sqlproxy_mysql::UpstreamConfig;
use sqlproxy_pool::PoolConfig;

/// Complete proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Address the proxy listens on
    pub listen: String,
    /// Upstream MySQL host
    pub upstream_host: String,
    /// Upstream MySQL port
    pub upstream_port: u16,
    /// Maximum number of upstream connections (idle + in use)
    pub pool_max_size: usize,
    /// Idle time after which a pooled connection is discarded, in seconds
    pub max_lifetime_secs: u64,
    /// How long a client waits for a free upstream connection, in milliseconds
    pub wait_timeout_ms: u64,
    /// Upstream TCP connect timeout, in seconds
    pub connect_timeout_secs: u64,
    /// Log at debug level unless `RUST_LOG` says otherwise
    pub debug: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3307".to_string(),
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 3306,
            pool_max_size: 10,
            max_lifetime_secs: 1800,
            wait_timeout_ms: 30_000,
            connect_timeout_secs: 10,
            debug: false,
        }
    }
}

impl ProxyConfig {
    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("Failed to read {}: {}", path.display(), e),
                source: Some(Box::new(e)),
            })
        })?;
        Self::from_json(&text).map_err(|e| match e {
            Error::Config(mut inner) => {
                inner.message = format!("{}: {}", path.display(), inner.message);
                Error::Config(inner)
            }
            other => other,
        })
    }

    /// Parse a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("Invalid configuration: {}", e),
                source: Some(Box::new(e)),
            })
        })
    }

    /// Apply command-line overrides on top of this configuration.
    pub fn merge(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(listen) = &overrides.listen {
            self.listen.clone_from(listen);
        }
        if let Some(host) = &overrides.host {
            self.upstream_host.clone_from(host);
        }
        if let Some(port) = overrides.port {
            self.upstream_port = port;
        }
        if let Some(size) = overrides.pool_size {
            self.pool_max_size = size;
        }
        if let Some(secs) = overrides.max_lifetime {
            self.max_lifetime_secs = secs;
        }
        if let Some(ms) = overrides.wait_timeout {
            self.wait_timeout_ms = ms;
        }
        if let Some(secs) = overrides.connect_timeout {
            self.connect_timeout_secs = secs;
        }
        self.debug |= overrides.debug;
        self
    }

    /// Reject settings the proxy cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool_max_size == 0 {
            return Err(Error::config("pool_max_size must be at least 1"));
        }
        if self.wait_timeout_ms == 0 {
            return Err(Error::config("wait_timeout_ms must be greater than zero"));
        }
        if self.upstream_host.trim().is_empty() {
            return Err(Error::config("upstream_host must not be empty"));
        }
        if self.listen.trim().is_empty() {
            return Err(Error::config("listen must not be empty"));
        }
        Ok(())
    }

    /// Settings for the upstream connection pool.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new(self.pool_max_size)
            .acquire_timeout(self.wait_timeout_ms)
            .max_lifetime(self.max_lifetime_secs.saturating_mul(1000))
    }

    /// Settings for dialing the upstream server.
    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig::new()
            .host(self.upstream_host.clone())
            .port(self.upstream_port)
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }
}

/// Per-field overrides taken from the command line.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigOverrides {
    /// Address to listen on, e.g. 0.0.0.0:3307
    #[arg(long, env = "SQLPROXY_LISTEN")]
    pub listen: Option<String>,

    /// Upstream MySQL host
    #[arg(long, env = "SQLPROXY_HOST")]
    pub host: Option<String>,

    /// Upstream MySQL port
    #[arg(long, env = "SQLPROXY_PORT")]
    pub port: Option<u16>,

    /// Maximum number of pooled upstream connections
    #[arg(long, env = "SQLPROXY_POOL_SIZE")]
    pub pool_size: Option<usize>,

    /// Seconds an idle upstream connection is kept
    #[arg(long, env = "SQLPROXY_MAX_LIFETIME")]
    pub max_lifetime: Option<u64>,

    /// Milliseconds a client waits for a free upstream connection
    #[arg(long, env = "SQLPROXY_WAIT_TIMEOUT")]
    pub wait_timeout: Option<u64>,

    /// Seconds allowed for connecting to the upstream server
    #[arg(long, env = "SQLPROXY_CONNECT_TIMEOUT")]
    pub connect_timeout: Option<u64>,

    /// Enable debug logging
    #[arg(long, env = "SQLPROXY_DEBUG")]
    pub debug: bool,
}
