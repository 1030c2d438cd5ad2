//! MySQL wire protocol framing.
//!
//! MySQL packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! Maximum frame payload is 2^24 - 1 (16MB - 1). Larger logical packets
//! are split into multiple frames, and a logical packet whose length is an
//! exact multiple of the maximum is followed by an empty frame.
//!
//! The proxy never interprets query text or row contents. It only looks at
//! frame headers and the leading marker byte of a payload.

pub mod reader;
pub mod writer;

pub use reader::{ErrPacket, PacketReader, read_packet};
pub use writer::{PacketWriter, encode_packet};

/// Maximum payload size for a single MySQL frame (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Capability flags the proxy inspects in a client's handshake response.
pub mod capabilities {
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;
}

/// Server status flags carried by OK and EOF packets.
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
}

/// Leading payload bytes with a reserved meaning.
pub mod marker {
    pub const OK: u8 = 0x00;
    pub const QUIT: u8 = 0x01;
    pub const AUTH_MORE_DATA: u8 = 0x01;
    pub const LOCAL_INFILE: u8 = 0xFB;
    pub const EOF: u8 = 0xFE;
    pub const ERR: u8 = 0xFF;

    /// Second byte of an `AUTH_MORE_DATA` packet meaning "fast auth succeeded".
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
}

/// MySQL command codes (COM_xxx), used to label client commands in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Quit connection
    Quit = 0x01,
    /// Switch database
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    /// List fields in table (deprecated)
    FieldList = 0x04,
    /// Statistics
    Statistics = 0x09,
    /// Ping server
    Ping = 0x0e,
    /// Change user
    ChangeUser = 0x11,
    /// Prepare statement
    StmtPrepare = 0x16,
    /// Execute prepared statement
    StmtExecute = 0x17,
    /// Send long data for prepared statement
    StmtSendLongData = 0x18,
    /// Close prepared statement
    StmtClose = 0x19,
    /// Reset prepared statement
    StmtReset = 0x1a,
    /// Set option
    SetOption = 0x1b,
    /// Fetch cursor rows
    StmtFetch = 0x1c,
    /// Reset connection
    ResetConnection = 0x1f,
}

impl Command {
    /// Decode a command byte. Unknown codes yield `None`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        let command = match byte {
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x09 => Command::Statistics,
            0x0e => Command::Ping,
            0x11 => Command::ChangeUser,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1f => Command::ResetConnection,
            _ => return None,
        };
        Some(command)
    }

    /// Does the server answer this command at all?
    ///
    /// `COM_STMT_CLOSE` and `COM_STMT_SEND_LONG_DATA` are fire-and-forget.
    pub fn expects_response(self) -> bool {
        !matches!(
            self,
            Command::Quit | Command::StmtClose | Command::StmtSendLongData
        )
    }
}

/// A MySQL frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a packet header from 4 bytes.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        Self {
            payload_length,
            sequence_id: bytes[3],
        }
    }

    /// Encode the header to 4 bytes.
    pub fn to_bytes(&self) -> [u8; 4] {
        let [b0, b1, b2, _] = self.payload_length.to_le_bytes();
        [b0, b1, b2, self.sequence_id]
    }
}

/// Which side of the session produced a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Sent by the database server
    Server,
    /// Sent by a database client
    Client,
}

/// Control-flow classification of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// OK packet (0x00)
    Ok,
    /// Error packet (0xFF)
    Err,
    /// EOF packet (0xFE with payload < 9 bytes)
    Eof,
    /// COM_QUIT from a client (0x01)
    Quit,
    /// Anything else: column definitions, rows, handshake data, commands
    Other,
}

impl PacketKind {
    /// Classify a packet from its first payload byte.
    pub fn from_first_byte(byte: u8, payload_len: usize, origin: Origin) -> Self {
        match origin {
            Origin::Server => match byte {
                marker::OK => PacketKind::Ok,
                marker::ERR => PacketKind::Err,
                marker::EOF if payload_len < 9 => PacketKind::Eof,
                _ => PacketKind::Other,
            },
            Origin::Client => match byte {
                marker::QUIT => PacketKind::Quit,
                _ => PacketKind::Other,
            },
        }
    }
}

/// A logical packet, independent of how many frames carried it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    /// Sequence id of the first frame
    pub sequence_id: u8,
    /// Reassembled payload
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a packet from a sequence id and payload.
    pub fn new(sequence_id: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// First payload byte, if any.
    pub fn first_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Classify this packet. Empty payloads are always `Other`.
    pub fn classify(&self, origin: Origin) -> PacketKind {
        self.first_byte().map_or(PacketKind::Other, |byte| {
            PacketKind::from_first_byte(byte, self.payload.len(), origin)
        })
    }

    pub fn is_ok(&self) -> bool {
        self.classify(Origin::Server) == PacketKind::Ok
    }

    pub fn is_err(&self) -> bool {
        self.classify(Origin::Server) == PacketKind::Err
    }

    pub fn is_eof(&self) -> bool {
        self.classify(Origin::Server) == PacketKind::Eof
    }

    pub fn is_quit(&self) -> bool {
        self.classify(Origin::Client) == PacketKind::Quit
    }

    /// A `0xFE` packet that fits in one frame.
    ///
    /// With `CLIENT_DEPRECATE_EOF` this is the OK packet closing a result
    /// set. A row cannot start with `0xFE` unless it spans multiple frames.
    pub fn is_eof_header_ok(&self) -> bool {
        self.first_byte() == Some(marker::EOF) && self.payload.len() < MAX_PACKET_SIZE
    }

    /// `LOCAL INFILE` request sent in place of a result set header.
    pub fn is_local_infile_request(&self) -> bool {
        self.first_byte() == Some(marker::LOCAL_INFILE)
    }

    /// `AuthMoreData` announcing that the cached credentials were accepted.
    pub fn is_fast_auth_success(&self) -> bool {
        self.payload.as_slice() == [marker::AUTH_MORE_DATA, marker::FAST_AUTH_SUCCESS]
    }

    /// The command this client packet carries, if recognized.
    pub fn command(&self) -> Option<Command> {
        self.first_byte().and_then(Command::from_u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_roundtrip() {
        let header = PacketHeader {
            payload_length: 0x0012_3456,
            sequence_id: 7,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes, [0x56, 0x34, 0x12, 7]);
        assert_eq!(PacketHeader::from_bytes(&bytes), header);
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn test_packet_header_max_size() {
        let header = PacketHeader {
            payload_length: MAX_PACKET_SIZE as u32,
            sequence_id: 255,
        };
        assert_eq!(header.to_bytes(), [0xFF, 0xFF, 0xFF, 255]);
    }

    #[test]
    fn test_server_classification() {
        let server = |payload: Vec<u8>| Packet::new(1, payload).classify(Origin::Server);
        assert_eq!(server(vec![0x00, 0, 0, 2, 0, 0, 0]), PacketKind::Ok);
        assert_eq!(server(vec![0xFF, 0x15, 0x04]), PacketKind::Err);
        assert_eq!(server(vec![0xFE, 0, 0, 2, 0]), PacketKind::Eof);
        assert_eq!(server(vec![0xFE; 20]), PacketKind::Other);
        assert_eq!(server(vec![0x03, b'd', b'e', b'f']), PacketKind::Other);
        assert_eq!(server(vec![0x01]), PacketKind::Other);
    }

    #[test]
    fn test_empty_payload_is_other() {
        let empty = Packet::new(3, Vec::new());
        assert_eq!(empty.classify(Origin::Server), PacketKind::Other);
        assert_eq!(empty.classify(Origin::Client), PacketKind::Other);
        assert!(!empty.is_quit());
    }

    #[test]
    fn test_client_classification() {
        assert!(Packet::new(0, vec![0x01]).is_quit());
        let select = Packet::new(0, b"\x03SELECT 1".to_vec());
        assert_eq!(select.classify(Origin::Client), PacketKind::Other);
        // OK/ERR markers mean nothing in the client direction.
        assert_eq!(Packet::new(0, vec![0x00]).classify(Origin::Client), PacketKind::Other);
        assert_eq!(Packet::new(0, vec![0xFF]).classify(Origin::Client), PacketKind::Other);
    }

    #[test]
    fn test_marker_helpers() {
        assert!(Packet::new(2, vec![0xFB, b'/', b't']).is_local_infile_request());
        assert!(Packet::new(2, vec![0x01, 0x03]).is_fast_auth_success());
        assert!(!Packet::new(2, vec![0x01, 0x04]).is_fast_auth_success());
        assert!(Packet::new(5, vec![0xFE, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0]).is_eof_header_ok());
        assert!(!Packet::new(5, vec![0x00]).is_eof_header_ok());
    }

    #[test]
    fn test_command_decoding() {
        assert_eq!(Packet::new(0, b"\x03SELECT 1".to_vec()).command(), Some(Command::Query));
        assert_eq!(Command::from_u8(0x01), Some(Command::Quit));
        assert_eq!(Command::from_u8(0xEE), None);
        assert!(Command::Query.expects_response());
        assert!(!Command::StmtClose.expects_response());
        assert!(!Command::StmtSendLongData.expects_response());
    }
}
