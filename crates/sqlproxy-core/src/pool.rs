//! Traits describing resources that can be pooled.
//!
//! The pool crate is written against these traits rather than a concrete
//! socket type, so the same pool manages real upstream links in the proxy
//! and in-memory stand-ins in tests.

use std::time::Duration;

use crate::error::Result;

/// A connection that can be checked out, returned and eventually discarded.
pub trait Reusable: Send {
    /// Has the connection been closed (explicitly or by a transport failure)?
    fn is_closed(&self) -> bool;

    /// Has the connection gone unused for at least `max_age`?
    fn is_expired(&self, max_age: Duration) -> bool;

    /// Record that the connection was just returned to rotation.
    fn refresh_used_time(&mut self);

    /// Close the underlying stream. Closing twice is a no-op.
    fn close(&mut self);
}

/// Opens new connections for a pool.
pub trait Connector: Send + Sync + 'static {
    /// The connection type produced.
    type Connection: Reusable + 'static;

    /// Open and return a fresh, unauthenticated connection.
    fn connect(&self) -> Result<Self::Connection>;
}
