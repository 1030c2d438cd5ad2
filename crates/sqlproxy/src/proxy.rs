//! Session dispatcher.
//!
//! [`Proxy`] owns the listening socket and the upstream pool. Every
//! accepted client gets its own thread running [`handle_session`], which
//! borrows one pooled upstream link for the lifetime of the client
//! connection.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use sqlproxy_core::{Error, Result};
use sqlproxy_mysql::protocol::{Packet, PacketWriter};
use sqlproxy_mysql::{BackendLink, UpstreamConnector};
use sqlproxy_pool::Pool;

use crate::config::ProxyConfig;

/// Pause after a failed `accept` so a persistent error (fd exhaustion)
/// does not spin the accept loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A bound proxy, ready to serve.
#[derive(Debug)]
pub struct Proxy {
    listener: TcpListener,
    local_addr: SocketAddr,
    pool: Pool<UpstreamConnector>,
    shutdown: Arc<AtomicBool>,
}

/// Stops a running [`Proxy`] from another thread.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    local_addr: SocketAddr,
    pool: Pool<UpstreamConnector>,
    shutdown: Arc<AtomicBool>,
}

impl Proxy {
    /// Validate `config`, bind the listener and create the upstream pool.
    ///
    /// No upstream connection is opened until the first client arrives.
    pub fn bind(config: &ProxyConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.listen)?;
        let local_addr = listener.local_addr()?;
        let pool = Pool::new(
            config.pool_config(),
            UpstreamConnector::new(config.upstream_config()),
        )?;

        Ok(Self {
            listener,
            local_addr,
            pool,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn pool(&self) -> &Pool<UpstreamConnector> {
        &self.pool
    }

    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            local_addr: self.local_addr,
            pool: self.pool.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Accept clients until [`ProxyHandle::shutdown`] is called.
    pub fn serve(self) -> Result<()> {
        tracing::info!(listen = %self.local_addr, "proxy listening");

        for incoming in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match incoming {
                Ok(stream) => self.spawn_session(stream),
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }

        self.pool.shutdown();
        tracing::info!(listen = %self.local_addr, "proxy stopped");
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream) {
        stream.set_nodelay(true).ok();
        let peer = stream.peer_addr().ok();
        let pool = self.pool.clone();
        let spawned = thread::Builder::new()
            .name("sqlproxy-session".to_string())
            .spawn(move || handle_session(&pool, stream));
        if let Err(e) = spawned {
            tracing::warn!(peer = ?peer, error = %e, "failed to spawn session thread");
        }
    }
}

impl ProxyHandle {
    /// Stop accepting clients and shut the pool down.
    ///
    /// Sessions already running finish normally; their upstream links are
    /// closed when they are returned.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.shutdown();

        // Wake the accept loop so it notices the flag.
        let mut wake = self.local_addr;
        if wake.ip().is_unspecified() {
            wake.set_ip(match wake.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        if let Err(e) = TcpStream::connect_timeout(&wake, Duration::from_secs(1)) {
            tracing::debug!(error = %e, "could not wake accept loop");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Serve one client connection to completion.
pub fn handle_session(pool: &Pool<UpstreamConnector>, stream: TcpStream) {
    let mut client = BackendLink::new(stream);
    let client_id = client.id();
    tracing::debug!(client_id, peer = ?client.peer(), "client connected");

    match run_session(pool, &mut client) {
        Ok(()) => tracing::debug!(client_id, "session finished"),
        Err(e) => tracing::warn!(client_id, error = %e, "session ended with error"),
    }
    client.close();
}

fn run_session(pool: &Pool<UpstreamConnector>, client: &mut BackendLink) -> Result<()> {
    if pool.at_capacity() {
        tracing::debug!(client_id = client.id(), "pool at capacity, waiting for a free link");
    }
    let mut backend = match pool.acquire() {
        Ok(backend) => backend,
        Err(e) => {
            refuse_client(client, &e);
            return Err(e);
        }
    };
    let link_id = backend.id();
    let replayed = backend.is_authenticated();

    if let Err(e) = backend.authenticate(client) {
        // A half-finished upstream login leaves the link unusable.
        if !replayed {
            backend.close();
        }
        return Err(e);
    }
    tracing::debug!(client_id = client.id(), link_id, replayed, "client authenticated");

    let outcome = relay_commands(&mut backend, client);

    // The next client must not inherit uncommitted work.
    if !backend.is_closed() && backend.in_transaction() {
        tracing::warn!(link_id, "client left a transaction open, closing upstream link");
        backend.close();
    }
    outcome
}

/// Forward client commands and their responses until the client quits.
fn relay_commands(backend: &mut BackendLink, client: &mut BackendLink) -> Result<()> {
    let link_id = backend.id();
    loop {
        let packet = client.read_packet()?;
        if packet.is_quit() {
            tracing::debug!(client_id = client.id(), link_id, "client quit");
            return Ok(());
        }

        let command = packet.command();
        tracing::debug!(client_id = client.id(), link_id, command = ?command, "forwarding command");
        backend.write_packet(&packet)?;

        if command.is_some_and(|c| !c.expects_response()) {
            continue;
        }
        if let Err(e) = backend.relay_response_for(client, command) {
            // The rest of the response is still in flight upstream.
            backend.close();
            return Err(e);
        }
    }
}

/// Answer a client that cannot get an upstream link with an ERR packet in
/// place of the greeting.
fn refuse_client(client: &mut BackendLink, cause: &Error) {
    let packet: Packet = if cause.is_pool_exhausted() {
        PacketWriter::err(1040, "08004", "Too many connections").into_packet(0)
    } else if cause.is_retryable() {
        let message = format!("Upstream unavailable: {}", cause);
        PacketWriter::err(2003, "HY000", &message).into_packet(0)
    } else {
        PacketWriter::err(1053, "08S01", "Server shutdown in progress").into_packet(0)
    };
    tracing::debug!(
        client_id = client.id(),
        retryable = cause.is_retryable(),
        "refusing client"
    );
    if let Err(e) = client.write_packet(&packet) {
        tracing::debug!(client_id = client.id(), error = %e, "could not notify client");
    }
}
