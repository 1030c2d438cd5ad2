//! MySQL packet writing utilities.
//!
//! [`encode_packet`] turns a logical packet into wire frames.
//! [`PacketWriter`] builds payloads field by field; the proxy itself only
//! forwards payloads it has read, so the builder mostly serves tools and
//! tests that need to speak the protocol.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{MAX_PACKET_SIZE, Packet, PacketHeader};

/// Encode a logical packet as one or more frames.
///
/// Payloads longer than `MAX_PACKET_SIZE` are split; the first frame
/// carries the packet's sequence id and each following frame increments it.
/// When the payload length is a multiple of `MAX_PACKET_SIZE` (zero
/// included) the last frame is empty, so the reader can tell "exactly full
/// and done" from "more follows".
pub fn encode_packet(packet: &Packet) -> Vec<u8> {
    let payload = packet.payload.as_slice();
    let frames = payload.len() / MAX_PACKET_SIZE + 1;
    let mut result = Vec::with_capacity(payload.len() + frames * PacketHeader::SIZE);
    let mut sequence_id = packet.sequence_id;

    for chunk in payload.chunks(MAX_PACKET_SIZE) {
        let header = PacketHeader {
            payload_length: chunk.len() as u32,
            sequence_id,
        };
        result.extend_from_slice(&header.to_bytes());
        result.extend_from_slice(chunk);
        sequence_id = sequence_id.wrapping_add(1);
    }

    if payload.len() % MAX_PACKET_SIZE == 0 {
        let header = PacketHeader {
            payload_length: 0,
            sequence_id,
        };
        result.extend_from_slice(&header.to_bytes());
    }

    result
}

/// A writer for MySQL protocol data.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    /// Create a new writer with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a new writer with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Get the buffer as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and wrap the buffer in a packet.
    pub fn into_packet(self, sequence_id: u8) -> Packet {
        Packet::new(sequence_id, self.buffer)
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.push(value);
        self
    }

    /// Write a u16 (little-endian).
    pub fn write_u16_le(&mut self, value: u16) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a u32 (little-endian).
    pub fn write_u32_le(&mut self, value: u32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a length-encoded integer.
    pub fn write_lenenc_int(&mut self, value: u64) -> &mut Self {
        if value < 251 {
            self.write_u8(value as u8);
        } else if value < 0x10000 {
            self.write_u8(0xFC);
            self.write_u16_le(value as u16);
        } else if value < 0x0100_0000 {
            self.write_u8(0xFD);
            self.buffer.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
        } else {
            self.write_u8(0xFE);
            self.buffer.extend_from_slice(&value.to_le_bytes());
        }
        self
    }

    /// Write a length-encoded string.
    pub fn write_lenenc_string(&mut self, s: &str) -> &mut Self {
        self.write_lenenc_int(s.len() as u64);
        self.buffer.extend_from_slice(s.as_bytes());
        self
    }

    /// Write a null-terminated string.
    pub fn write_null_string(&mut self, s: &str) -> &mut Self {
        self.buffer.extend_from_slice(s.as_bytes());
        self.buffer.push(0);
        self
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(data);
        self
    }

    /// Build an OK packet payload.
    pub fn ok(affected_rows: u64, status_flags: u16) -> Self {
        let mut writer = Self::with_capacity(16);
        writer
            .write_u8(0x00)
            .write_lenenc_int(affected_rows)
            .write_lenenc_int(0)
            .write_u16_le(status_flags)
            .write_u16_le(0);
        writer
    }

    /// Build an ERR packet payload (protocol 4.1 format).
    pub fn err(error_code: u16, sql_state: &str, message: &str) -> Self {
        let mut writer = Self::with_capacity(9 + message.len());
        writer
            .write_u8(0xFF)
            .write_u16_le(error_code)
            .write_u8(b'#')
            .write_bytes(sql_state.as_bytes())
            .write_bytes(message.as_bytes());
        writer
    }

    /// Build a classic EOF packet payload.
    pub fn eof(status_flags: u16) -> Self {
        let mut writer = Self::with_capacity(5);
        writer.write_u8(0xFE).write_u16_le(0).write_u16_le(status_flags);
        writer
    }
}
