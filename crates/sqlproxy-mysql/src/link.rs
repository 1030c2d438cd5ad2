//! Framed MySQL endpoints.
//!
//! A [`BackendLink`] wraps one TCP socket and speaks packets over it. The
//! proxy uses the same type for both ends of a session: the accepted client
//! socket and the pooled upstream socket.
//!
//! An upstream link authenticates exactly once. The first client that gets
//! it runs the real exchange through the proxy; the greeting and the final
//! OK are cached, and every later client is answered from that cache while
//! the upstream socket stays logged in.

// MySQL protocol uses well-defined packet sizes that fit in u32 (max 16MB)
#![allow(clippy::cast_possible_truncation)]

use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use sqlproxy_core::error::{ConnectionError, ConnectionErrorKind, ProtocolError};
use sqlproxy_core::{Error, Result, Reusable};

use crate::protocol::{
    Command, Origin, Packet, PacketKind, PacketReader, PacketWriter, capabilities, encode_packet,
    read_packet, server_status,
};
use crate::relay::{RelayStep, ResponseTracker, ResultFraming};

/// Upper bound on server packets in one authentication exchange.
///
/// caching_sha2_password needs at most four (more-data, key, switch, OK);
/// anything longer means the two ends have lost sync.
const MAX_AUTH_ROUNDS: usize = 8;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Authentication state of an upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No client has logged in through this link yet
    Unauthenticated,
    /// Logged in; greeting and OK are cached for replay
    Authenticated,
}

/// One framed TCP endpoint.
pub struct BackendLink {
    /// Process-unique id, used to correlate log lines
    id: u64,
    /// Buffered socket; writes go through `get_mut`
    stream: BufReader<TcpStream>,
    peer: Option<SocketAddr>,
    state: AuthState,
    /// Server greeting from the real handshake
    handshake: Option<Packet>,
    /// Final OK from the real handshake
    auth_ok: Option<Packet>,
    /// Result of the most recent rejected handshake
    auth_failure: Option<Packet>,
    framing: ResultFraming,
    /// Status word of the last completed response
    status_flags: u16,
    used_at: Instant,
    closed: bool,
}

impl std::fmt::Debug for BackendLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendLink")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("framing", &self.framing)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl BackendLink {
    /// Wrap a connected socket.
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            stream: BufReader::new(stream),
            peer,
            state: AuthState::Unauthenticated,
            handshake: None,
            auth_ok: None,
            auth_failure: None,
            framing: ResultFraming::default(),
            status_flags: 0,
            used_at: Instant::now(),
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address, if the socket reported one.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// Result-set framing negotiated by the first client.
    pub fn framing(&self) -> ResultFraming {
        self.framing
    }

    /// Cached server greeting, once authenticated.
    pub fn handshake(&self) -> Option<&Packet> {
        self.handshake.as_ref()
    }

    /// The ERR packet of the last rejected real handshake.
    pub fn auth_failure(&self) -> Option<&Packet> {
        self.auth_failure.as_ref()
    }

    /// Is the upstream session inside an open transaction?
    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    /// Read one logical packet.
    pub fn read_packet(&mut self) -> Result<Packet> {
        if self.closed {
            return Err(Error::closed(format!("Link {} is closed", self.id)));
        }
        match read_packet(&mut self.stream) {
            Ok(packet) => {
                tracing::trace!(
                    link_id = self.id,
                    seq = packet.sequence_id,
                    len = packet.payload.len(),
                    "read packet"
                );
                Ok(packet)
            }
            Err(e) => {
                self.close();
                Err(Error::transport(
                    format!("Failed to read packet on link {}: {}", self.id, e),
                    e,
                ))
            }
        }
    }

    /// Write one logical packet, split into frames as needed, and flush.
    pub fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        if self.closed {
            return Err(Error::closed(format!("Link {} is closed", self.id)));
        }
        let bytes = encode_packet(packet);
        let stream = self.stream.get_mut();
        if let Err(e) = stream.write_all(&bytes).and_then(|()| stream.flush()) {
            self.close();
            return Err(Error::transport(
                format!("Failed to write packet on link {}: {}", self.id, e),
                e,
            ));
        }
        tracing::trace!(
            link_id = self.id,
            seq = packet.sequence_id,
            len = packet.payload.len(),
            "wrote packet"
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True once the link has gone unused for at least `max_age`.
    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.used_at.elapsed() >= max_age
    }

    pub fn refresh_used_time(&mut self) {
        self.used_at = Instant::now();
    }

    /// Shut the socket down. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // The peer may already be gone.
        let _ = self.stream.get_ref().shutdown(Shutdown::Both);
        tracing::trace!(link_id = self.id, "link closed");
    }

    /// Log `client` in through this upstream link.
    ///
    /// Runs the real exchange the first time and replays the cached one
    /// afterwards.
    pub fn authenticate(&mut self, client: &mut BackendLink) -> Result<()> {
        match self.state {
            AuthState::Unauthenticated => self.first_handshake(client),
            AuthState::Authenticated => self.fake_handshake(client),
        }
    }

    /// Relay a complete authentication exchange between `client` and the
    /// upstream, caching the greeting and the final OK.
    ///
    /// On an ERR from upstream the packet is forwarded to the client,
    /// remembered in [`auth_failure`](Self::auth_failure), and the link
    /// stays unauthenticated.
    pub fn first_handshake(&mut self, client: &mut BackendLink) -> Result<()> {
        let greeting = self.read_packet()?;
        client.write_packet(&greeting)?;
        if greeting.is_err() {
            return Err(self.reject(greeting));
        }

        let response = client.read_packet()?;
        let client_caps = client_capabilities(&response)?;
        if client_caps & capabilities::CLIENT_SSL != 0 {
            return Err(refuse_ssl(client, &response));
        }
        self.write_packet(&response)?;

        let server_caps = greeting_capabilities(&greeting);
        let framing = negotiated_framing(server_caps, client_caps);

        for _ in 0..MAX_AUTH_ROUNDS {
            let reply = self.read_packet()?;
            client.write_packet(&reply)?;

            match reply.classify(Origin::Server) {
                PacketKind::Ok => {
                    self.status_flags = PacketReader::new(&reply.payload)
                        .parse_status_flags()
                        .unwrap_or(0);
                    self.handshake = Some(greeting);
                    self.auth_ok = Some(reply);
                    self.auth_failure = None;
                    self.framing = framing;
                    self.state = AuthState::Authenticated;
                    tracing::debug!(
                        link_id = self.id,
                        framing = ?framing,
                        "upstream authenticated"
                    );
                    return Ok(());
                }
                PacketKind::Err => return Err(self.reject(reply)),
                _ => {}
            }

            // Fast-auth success is followed directly by the final OK.
            if reply.is_fast_auth_success() {
                continue;
            }
            let more = client.read_packet()?;
            self.write_packet(&more)?;
        }

        Err(protocol_error(format!(
            "Authentication did not finish within {} rounds",
            MAX_AUTH_ROUNDS
        )))
    }

    /// Answer `client` from the cached handshake without touching upstream.
    pub fn fake_handshake(&mut self, client: &mut BackendLink) -> Result<()> {
        let (Some(greeting), Some(auth_ok)) = (self.handshake.as_ref(), self.auth_ok.as_ref())
        else {
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::NotAuthenticated,
                message: format!("Link {} has no cached handshake to replay", self.id),
                source: None,
            }));
        };

        client.write_packet(greeting)?;
        let response = client.read_packet()?;
        let client_caps = client_capabilities(&response)?;
        if client_caps & capabilities::CLIENT_SSL != 0 {
            return Err(refuse_ssl(client, &response));
        }

        let framing = negotiated_framing(greeting_capabilities(greeting), client_caps);
        if framing != self.framing {
            tracing::warn!(
                link_id = self.id,
                link_framing = ?self.framing,
                client_framing = ?framing,
                "client capabilities differ from the session it is reusing"
            );
        }

        let mut reply = auth_ok.clone();
        reply.sequence_id = response.sequence_id.wrapping_add(1);
        client.write_packet(&reply)
    }

    /// Forward one complete command response from this link to `client`.
    pub fn relay_response(&mut self, client: &mut BackendLink) -> Result<()> {
        self.relay_response_for(client, None)
    }

    /// Like [`relay_response`](Self::relay_response), for a response whose
    /// shape depends on the command that was sent.
    pub fn relay_response_for(
        &mut self,
        client: &mut BackendLink,
        command: Option<Command>,
    ) -> Result<()> {
        let mut tracker = ResponseTracker::for_command(self.framing, command);
        let mut packets = 0usize;

        loop {
            let packet = self.read_packet()?;
            client.write_packet(&packet)?;
            packets += 1;

            match tracker.advance(&packet) {
                RelayStep::Continue => {}
                RelayStep::LocalInfile => self.forward_local_infile(client)?,
                RelayStep::Done => break,
            }
        }

        if let Some(status) = tracker.last_status() {
            self.status_flags = status;
        }
        tracing::trace!(link_id = self.id, packets, "response relayed");
        Ok(())
    }

    /// Copy the client's file contents upstream, up to and including the
    /// empty packet that ends them.
    fn forward_local_infile(&mut self, client: &mut BackendLink) -> Result<()> {
        loop {
            let chunk = client.read_packet()?;
            self.write_packet(&chunk)?;
            if chunk.payload.is_empty() {
                return Ok(());
            }
        }
    }

    fn reject(&mut self, packet: Packet) -> Error {
        let detail = PacketReader::new(&packet.payload)
            .parse_err_packet()
            .map_or_else(|| "malformed error packet".to_string(), |err| err.to_string());
        self.auth_failure = Some(packet);
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Authentication,
            message: format!("Authentication failed: {}", detail),
            source: None,
        })
    }
}

impl Reusable for BackendLink {
    fn is_closed(&self) -> bool {
        BackendLink::is_closed(self)
    }

    fn is_expired(&self, max_age: Duration) -> bool {
        BackendLink::is_expired(self, max_age)
    }

    fn refresh_used_time(&mut self) {
        BackendLink::refresh_used_time(self);
    }

    fn close(&mut self) {
        BackendLink::close(self);
    }
}

/// Capability word at the start of a client's handshake response.
fn client_capabilities(response: &Packet) -> Result<u32> {
    PacketReader::new(&response.payload)
        .read_u32_le()
        .ok_or_else(|| {
            Error::Protocol(ProtocolError {
                message: "Handshake response too short".to_string(),
                raw_data: Some(response.payload.clone()),
                source: None,
            })
        })
}

/// Capability flags advertised in a protocol 10 greeting.
///
/// An unparsable greeting is treated as advertising everything, leaving
/// the client's flags in charge.
fn greeting_capabilities(greeting: &Packet) -> u32 {
    let mut reader = PacketReader::new(&greeting.payload);
    let Some(lower) = lower_capabilities(&mut reader) else {
        return u32::MAX;
    };
    // charset and status precede the upper half
    let upper = if reader.skip(3) {
        reader.read_u16_le().unwrap_or(0)
    } else {
        0
    };
    u32::from(lower) | (u32::from(upper) << 16)
}

fn lower_capabilities(reader: &mut PacketReader<'_>) -> Option<u16> {
    reader.read_u8()?;
    reader.read_null_terminated()?;
    // connection id, first scramble part, filler
    if !reader.skip(4 + 8 + 1) {
        return None;
    }
    reader.read_u16_le()
}

fn negotiated_framing(server_caps: u32, client_caps: u32) -> ResultFraming {
    let caps = server_caps & client_caps;
    let wanted = capabilities::CLIENT_PROTOCOL_41 | capabilities::CLIENT_DEPRECATE_EOF;
    if caps & wanted == wanted {
        ResultFraming::DeprecateEof
    } else {
        ResultFraming::Classic
    }
}

/// Tell a client asking for TLS that it is not available.
fn refuse_ssl(client: &mut BackendLink, request: &Packet) -> Error {
    let reply = PacketWriter::err(1043, "08S01", "SSL connections are not supported by this proxy")
        .into_packet(request.sequence_id.wrapping_add(1));
    // The client is dropped right after; a failed write changes nothing.
    let _ = client.write_packet(&reply);
    protocol_error("Client requested SSL")
}

fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: None,
        source: None,
    })
}
