//! MySQL packet reading utilities.
//!
//! [`read_packet`] pulls one logical packet off a byte stream, joining
//! split frames. [`PacketReader`] is a cursor over a payload, used for the
//! few fields the proxy needs: server status words and error details.

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read};

use crate::protocol::{MAX_PACKET_SIZE, Packet, PacketHeader, marker};

/// Read one logical packet from `stream`.
///
/// A frame carrying exactly `MAX_PACKET_SIZE` bytes is continued by the
/// next frame; continuation sequence ids are discarded. A short read on
/// any header or body fails with `UnexpectedEof`, after which the stream
/// position is undefined.
pub fn read_packet<R: Read>(stream: &mut R) -> io::Result<Packet> {
    let header = read_header(stream)?;
    let mut payload = Vec::new();
    let mut frame_len = header.payload_length as usize;

    loop {
        if frame_len > 0 {
            let start = payload.len();
            payload.resize(start + frame_len, 0);
            stream.read_exact(&mut payload[start..])?;
        }
        if frame_len < MAX_PACKET_SIZE {
            break;
        }
        frame_len = read_header(stream)?.payload_length as usize;
    }

    Ok(Packet {
        sequence_id: header.sequence_id,
        payload,
    })
}

fn read_header<R: Read>(stream: &mut R) -> io::Result<PacketHeader> {
    let mut header_buf = [0u8; PacketHeader::SIZE];
    stream.read_exact(&mut header_buf)?;
    Ok(PacketHeader::from_bytes(&header_buf))
}

/// Parsed Error packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    /// Error code
    pub error_code: u16,
    /// SQL state (5 characters)
    pub sql_state: String,
    /// Error message
    pub error_message: String,
}

impl std::fmt::Display for ErrPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sql_state.is_empty() {
            write!(f, "{}: {}", self.error_code, self.error_message)
        } else {
            write!(
                f,
                "{} ({}): {}",
                self.error_code, self.sql_state, self.error_message
            )
        }
    }
}

/// A reader for MySQL protocol data.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Create a new reader from a byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Get remaining bytes in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    /// Read a u16 (little-endian).
    pub fn read_u16_le(&mut self) -> Option<u16> {
        let bytes = self.read_bytes(2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read a u32 (little-endian).
    pub fn read_u32_le(&mut self) -> Option<u32> {
        let bytes = self.read_bytes(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a length-encoded integer.
    ///
    /// - 0x00-0xFA: 1-byte value
    /// - 0xFC: 2-byte value follows
    /// - 0xFD: 3-byte value follows
    /// - 0xFE: 8-byte value follows
    /// - 0xFB, 0xFF: not an integer
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Some(u64::from(first)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => {
                let bytes = self.read_bytes(3)?;
                Some(u64::from(bytes[0]) | (u64::from(bytes[1]) << 8) | (u64::from(bytes[2]) << 16))
            }
            0xFE => {
                let bytes = self.read_bytes(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Some(u64::from_le_bytes(buf))
            }
            0xFB | 0xFF => None,
        }
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    /// Read bytes up to a NUL terminator, consuming the terminator.
    pub fn read_null_terminated(&mut self) -> Option<&'a [u8]> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let end = rest.iter().position(|&b| b == 0)?;
        self.pos += end + 1;
        Some(&rest[..end])
    }

    /// Read remaining data as a string.
    pub fn read_rest_string(&mut self) -> String {
        let s = String::from_utf8_lossy(&self.data[self.pos..]).into_owned();
        self.pos = self.data.len();
        s
    }

    /// Skip a number of bytes.
    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() >= n {
            self.pos += n;
            true
        } else {
            false
        }
    }

    /// Parse the server status word of an OK or EOF packet.
    ///
    /// EOF packet: `0xFE`, warnings (2), status (2).
    /// OK packet: `0x00` or `0xFE`, affected rows (lenenc),
    /// last insert id (lenenc), status (2), warnings (2), info.
    /// A short `0xFE` packet is read as EOF, a longer one as OK.
    pub fn parse_status_flags(&mut self) -> Option<u16> {
        match self.read_u8()? {
            marker::EOF if self.remaining() < 8 => {
                self.skip(2).then_some(())?;
                self.read_u16_le()
            }
            marker::OK | marker::EOF => {
                self.read_lenenc_int()?;
                self.read_lenenc_int()?;
                self.read_u16_le()
            }
            _ => None,
        }
    }

    /// Parse an Error packet from the current position.
    ///
    /// ERR packet format (protocol 4.1+):
    /// - 0xFF header
    /// - error_code: 2 bytes
    /// - '#' marker
    /// - sql_state: 5 bytes
    /// - error_message: rest of packet
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        if self.peek() == Some(marker::ERR) {
            self.skip(1);
        }

        let error_code = self.read_u16_le()?;

        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1);
            String::from_utf8_lossy(self.read_bytes(5)?).into_owned()
        } else {
            String::new()
        };

        let error_message = self.read_rest_string();

        Some(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }
}
