//! Connection pooling for SQLProxy.
//!
//! The pool owns a bounded set of connections to one upstream. Callers
//! check a connection out with [`Pool::acquire`] and get it back inside a
//! [`PooledConnection`] guard; dropping the guard returns the connection.
//!
//! Invariant: `outstanding + idle <= max_connections` at every point where
//! the state lock is released. Connections that are closed or have gone
//! unused for longer than `max_lifetime` are discarded instead of being
//! put back into rotation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sqlproxy_core::error::{PoolError, PoolErrorKind};
use sqlproxy_core::{Connector, Error, Result, Reusable};

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections allowed (idle + checked out)
    pub max_connections: usize,
    /// Maximum time to wait for a connection in milliseconds
    pub acquire_timeout_ms: u64,
    /// Maximum time a connection may sit unused before it is discarded, in milliseconds
    pub max_lifetime_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_ms: 30_000, // 30 seconds
            max_lifetime_ms: 1_800_000, // 30 minutes
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Set max lifetime.
    pub fn max_lifetime(mut self, ms: u64) -> Self {
        self.max_lifetime_ms = ms;
        self
    }

    /// Acquire timeout as a `Duration`.
    pub fn acquire_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Max lifetime as a `Duration`.
    pub fn max_lifetime_duration(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections (active + idle)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of checked-out connections
    pub active_connections: usize,
    /// Number of callers blocked in `acquire`
    pub pending_requests: usize,
}

struct PoolState<T> {
    idle: VecDeque<T>,
    outstanding: usize,
    waiters: usize,
    closed: bool,
}

struct PoolShared<C: Connector> {
    config: PoolConfig,
    connector: C,
    state: Mutex<PoolState<C::Connection>>,
    available: Condvar,
}

impl<C: Connector> PoolShared<C> {
    fn release(&self, mut conn: C::Connection) {
        let max_lifetime = self.config.max_lifetime_duration();
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);

        if state.closed || conn.is_closed() || conn.is_expired(max_lifetime) {
            drop(state);
            conn.close();
            tracing::debug!("Discarded returned connection");
        } else {
            conn.refresh_used_time();
            state.idle.push_back(conn);
            tracing::trace!(idle = state.idle.len(), "Connection returned to pool");
            drop(state);
        }

        // Either a connection or a free slot just became available.
        self.available.notify_one();
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }
}

/// A bounded, blocking connection pool.
pub struct Pool<C: Connector> {
    shared: Arc<PoolShared<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Pool<C> {
    /// Create a new connection pool. No connections are opened until needed.
    pub fn new(config: PoolConfig, connector: C) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(Error::Pool(PoolError {
                kind: PoolErrorKind::Config,
                message: "max_connections must be at least 1".to_string(),
                source: None,
            }));
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(config.max_connections),
                    outstanding: 0,
                    waiters: 0,
                    closed: false,
                }),
                available: Condvar::new(),
                config,
                connector,
            }),
        })
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            total_connections: state.outstanding + state.idle.len(),
            idle_connections: state.idle.len(),
            active_connections: state.outstanding,
            pending_requests: state.waiters,
        }
    }

    /// Check if the pool is at capacity.
    pub fn at_capacity(&self) -> bool {
        let state = self.shared.state.lock();
        state.outstanding + state.idle.len() >= self.shared.config.max_connections
    }

    /// Has `shutdown` been called?
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Check out a connection.
    ///
    /// Reuses the most recently returned idle connection that has not
    /// expired; otherwise opens a new one if there is capacity; otherwise
    /// blocks until a connection or slot is released. Fails with
    /// `PoolErrorKind::Exhausted` once the acquire timeout elapses.
    pub fn acquire(&self) -> Result<PooledConnection<C>> {
        let config = &self.shared.config;
        let max_lifetime = config.max_lifetime_duration();
        let deadline = Instant::now() + config.acquire_timeout_duration();
        let mut timed_out = false;

        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(pool_closed());
            }

            while let Some(mut conn) = state.idle.pop_back() {
                if conn.is_closed() || conn.is_expired(max_lifetime) {
                    conn.close();
                    tracing::debug!("Discarded expired idle connection");
                    continue;
                }
                state.outstanding += 1;
                return Ok(PooledConnection::new(Arc::clone(&self.shared), conn));
            }

            if state.outstanding < config.max_connections {
                state.outstanding += 1;
                drop(state);
                return self.open_reserved();
            }

            // A release can race the deadline; the loop above gets one more
            // look at the state before giving up.
            if timed_out {
                tracing::warn!(
                    max_connections = config.max_connections,
                    timeout_ms = config.acquire_timeout_ms,
                    "Connection pool exhausted"
                );
                return Err(Error::Pool(PoolError {
                    kind: PoolErrorKind::Exhausted,
                    message: format!(
                        "no connection available within {}ms ({} in use)",
                        config.acquire_timeout_ms, state.outstanding
                    ),
                    source: None,
                }));
            }

            state.waiters += 1;
            timed_out = self
                .shared
                .available
                .wait_until(&mut state, deadline)
                .timed_out();
            state.waiters -= 1;
        }
    }

    /// Close every idle connection and refuse further acquisitions.
    ///
    /// Connections currently checked out are closed when they are released.
    pub fn shutdown(&self) {
        let idle = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };

        let count = idle.len();
        for mut conn in idle {
            conn.close();
        }
        self.shared.available.notify_all();
        tracing::info!(closed_idle = count, "Connection pool shut down");
    }

    fn open_reserved(&self) -> Result<PooledConnection<C>> {
        match self.shared.connector.connect() {
            Ok(conn) => {
                tracing::debug!("Opened new pooled connection");
                Ok(PooledConnection::new(Arc::clone(&self.shared), conn))
            }
            Err(e) => {
                self.shared.release_slot();
                Err(e)
            }
        }
    }
}

fn pool_closed() -> Error {
    Error::Pool(PoolError {
        kind: PoolErrorKind::Closed,
        message: "connection pool is shut down".to_string(),
        source: None,
    })
}

/// A connection borrowed from the pool.
///
/// Dereferences to the connection. Dropping the guard (or calling
/// [`PooledConnection::release`]) hands it back to the pool, which decides
/// whether to keep or discard it.
pub struct PooledConnection<C: Connector> {
    pool: Arc<PoolShared<C>>,
    conn: Option<C::Connection>,
}

impl<C: Connector> PooledConnection<C> {
    fn new(pool: Arc<PoolShared<C>>, conn: C::Connection) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    /// Return the connection to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Close the connection and return its slot to the pool.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.close();
        }
    }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("present", &self.conn.is_some())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> std::ops::Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("pooled connection is present until drop")
    }
}

impl<C: Connector> std::ops::DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("pooled connection is present until drop")
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
