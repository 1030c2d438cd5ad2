//! MySQL wire-protocol plumbing for SQLProxy.
//!
//! This crate holds everything the proxy needs to sit between MySQL
//! clients and one upstream server without understanding SQL:
//!
//! - Packet framing with sequence numbers, including logical packets
//!   split across several 16MB frames
//! - Packet classification by leading marker byte
//! - [`BackendLink`]: a framed TCP endpoint that can run a real handshake
//!   once and replay it to later clients
//! - Response relay that knows where a result set ends
//! - [`UpstreamConnector`] so the pool can open new upstream links
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlproxy_mysql::{UpstreamConfig, UpstreamConnector};
//! use sqlproxy_pool::{Pool, PoolConfig};
//!
//! let connector = UpstreamConnector::new(UpstreamConfig::new().host("db").port(3306));
//! let pool = Pool::new(PoolConfig::new(10), connector)?;
//! let mut backend = pool.acquire()?;
//! backend.authenticate(&mut client)?;
//! ```

pub mod config;
pub mod link;
pub mod protocol;
pub mod relay;

pub use config::{UpstreamConfig, UpstreamConnector};
pub use link::{AuthState, BackendLink};
pub use protocol::{Packet, PacketKind, Origin};
pub use relay::{RelayStep, ResponseTracker, ResultFraming};
