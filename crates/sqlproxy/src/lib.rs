//! SQLProxy: a pooling MySQL wire-protocol proxy.
//!
//! Clients connect to the proxy as if it were the MySQL server. The proxy
//! keeps a bounded pool of upstream connections; the first client to use a
//! pooled connection logs in for real, and later clients are answered with
//! a replay of that login while the upstream socket stays authenticated.
//! Queries and results are relayed byte for byte.
//!
//! # Crates
//!
//! - `sqlproxy-core`: error types and the pooled-resource traits
//! - `sqlproxy-mysql`: packet framing, backend links, upstream connector
//! - `sqlproxy-pool`: the bounded blocking pool
//! - `sqlproxy` (this crate): configuration, the session dispatcher and
//!   the `sqlproxy` binary
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlproxy::{Proxy, ProxyConfig};
//!
//! let config = ProxyConfig::load("sqlproxy.json")?;
//! let proxy = Proxy::bind(&config)?;
//! let handle = proxy.handle();
//! std::thread::spawn(move || proxy.serve());
//! // ...
//! handle.shutdown();
//! ```

pub mod config;
pub mod proxy;

pub use config::{ConfigOverrides, ProxyConfig};
pub use proxy::{Proxy, ProxyHandle, handle_session};

pub use sqlproxy_core::{Error, Result};
pub use sqlproxy_mysql::{BackendLink, UpstreamConfig, UpstreamConnector};
pub use sqlproxy_pool::{Pool, PoolConfig, PoolStats};
