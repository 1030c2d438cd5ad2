//! Core types and traits for SQLProxy.
//!
//! This crate provides the pieces shared by the protocol, pool and proxy
//! crates:
//!
//! - `Error` and its kind-tagged payloads, used by every crate
//! - `Reusable` and `Connector` traits describing what the pool manages

pub mod error;
pub mod pool;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, PoolError, PoolErrorKind,
    ProtocolError, Result,
};
pub use pool::{Connector, Reusable};
