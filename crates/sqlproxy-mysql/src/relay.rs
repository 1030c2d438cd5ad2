//! Response termination tracking.
//!
//! A command's response is relayed packet by packet until the tracker
//! says it is complete. In the classic text protocol a result set is
//!
//! ```text
//! [column count] [column def]... [EOF] [row]... [EOF]
//! ```
//!
//! so the first EOF ends the column definitions and the second ends the
//! rows. An OK or ERR in place of the column count ends the response right
//! away, and an ERR anywhere aborts the result set.
//!
//! A few commands answer in other shapes. `COM_STMT_PREPARE` returns a
//! `0x00` header followed by parameter and column definition blocks;
//! `COM_FIELD_LIST` and `COM_STMT_FETCH` return only the second half of a
//! result set.

use crate::protocol::{Command, Origin, Packet, PacketKind, PacketReader, marker, server_status};

/// How the server frames result sets on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultFraming {
    /// EOF packets after column definitions and after rows
    #[default]
    Classic,
    /// `CLIENT_DEPRECATE_EOF`: no EOF after column definitions, rows end
    /// with an OK packet carrying the `0xFE` header
    DeprecateEof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Columns,
    Rows,
    /// Waiting for STMT_PREPARE_OK
    PrepareHeader,
    /// Inside a prepared statement's definition block
    Definitions { remaining: u16, next: u16 },
    /// Waiting for the EOF closing a definition block
    DefinitionsEof { next: u16 },
}

/// What to do after forwarding a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStep {
    /// More packets belong to this response
    Continue,
    /// The server asked for a local file; the client's file packets must be
    /// forwarded before the server answers again
    LocalInfile,
    /// The response is complete
    Done,
}

/// Tracks where a response stream is, one packet at a time.
#[derive(Debug, Clone)]
pub struct ResponseTracker {
    framing: ResultFraming,
    phase: Phase,
    last_status: Option<u16>,
}

impl ResponseTracker {
    pub fn new(framing: ResultFraming) -> Self {
        Self::for_command(framing, None)
    }

    /// Tracker for the response to `command`.
    pub fn for_command(framing: ResultFraming, command: Option<Command>) -> Self {
        let phase = match command {
            Some(Command::StmtPrepare) => Phase::PrepareHeader,
            Some(Command::FieldList | Command::StmtFetch) => Phase::Rows,
            _ => Phase::Header,
        };
        Self {
            framing,
            phase,
            last_status: None,
        }
    }

    /// Status word of the most recent OK/EOF that closed a result.
    pub fn last_status(&self) -> Option<u16> {
        self.last_status
    }

    /// Feed the next server packet.
    pub fn advance(&mut self, packet: &Packet) -> RelayStep {
        let kind = packet.classify(Origin::Server);
        if kind == PacketKind::Err {
            return RelayStep::Done;
        }

        match self.phase {
            Phase::Header => {
                if kind == PacketKind::Ok {
                    return self.finish_result(packet);
                }
                if packet.is_local_infile_request() {
                    return RelayStep::LocalInfile;
                }
                match (self.framing, kind) {
                    // A bare EOF up front counts as the end of column definitions.
                    (ResultFraming::Classic, PacketKind::Eof) => self.phase = Phase::Rows,
                    (ResultFraming::DeprecateEof, _) if packet.is_eof_header_ok() => {
                        return self.finish_result(packet);
                    }
                    _ => self.phase = Phase::Columns,
                }
                RelayStep::Continue
            }
            Phase::PrepareHeader => match prepare_counts(packet) {
                Some((columns, params)) => self.start_block(params, columns),
                None => RelayStep::Done,
            },
            Phase::Definitions { remaining, next } => {
                if remaining > 1 {
                    self.phase = Phase::Definitions {
                        remaining: remaining - 1,
                        next,
                    };
                    return RelayStep::Continue;
                }
                match self.framing {
                    ResultFraming::Classic => {
                        self.phase = Phase::DefinitionsEof { next };
                        RelayStep::Continue
                    }
                    ResultFraming::DeprecateEof => self.start_block(next, 0),
                }
            }
            Phase::DefinitionsEof { next } => self.start_block(next, 0),
            Phase::Columns | Phase::Rows => match self.framing {
                ResultFraming::Classic => {
                    if kind != PacketKind::Eof {
                        return RelayStep::Continue;
                    }
                    if self.phase == Phase::Columns {
                        self.phase = Phase::Rows;
                        return RelayStep::Continue;
                    }
                    self.finish_result(packet)
                }
                ResultFraming::DeprecateEof => {
                    if packet.is_eof_header_ok() {
                        self.finish_result(packet)
                    } else {
                        RelayStep::Continue
                    }
                }
            },
        }
    }

    /// Expect `current` definitions, then a block of `next`.
    fn start_block(&mut self, current: u16, next: u16) -> RelayStep {
        if current == 0 {
            if next == 0 {
                self.phase = Phase::Header;
                return RelayStep::Done;
            }
            return self.start_block(next, 0);
        }
        self.phase = Phase::Definitions {
            remaining: current,
            next,
        };
        RelayStep::Continue
    }

    fn finish_result(&mut self, packet: &Packet) -> RelayStep {
        self.last_status = PacketReader::new(&packet.payload).parse_status_flags();
        self.phase = Phase::Header;
        match self.last_status {
            Some(status) if status & server_status::SERVER_MORE_RESULTS_EXISTS != 0 => {
                RelayStep::Continue
            }
            _ => RelayStep::Done,
        }
    }
}

/// Column and parameter counts of a STMT_PREPARE_OK packet.
///
/// Layout: `0x00`, statement id (4), columns (2), params (2), filler,
/// warnings.
fn prepare_counts(packet: &Packet) -> Option<(u16, u16)> {
    let mut reader = PacketReader::new(&packet.payload);
    if reader.read_u8()? != marker::OK || !reader.skip(4) {
        return None;
    }
    let columns = reader.read_u16_le()?;
    let params = reader.read_u16_le()?;
    Some((columns, params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketWriter;
    use crate::protocol::server_status::{SERVER_MORE_RESULTS_EXISTS, SERVER_STATUS_AUTOCOMMIT};

    fn column_count(n: u8) -> Packet {
        Packet::new(1, vec![n])
    }

    fn column_def(name: &str) -> Packet {
        let mut writer = PacketWriter::new();
        writer
            .write_lenenc_string("def")
            .write_lenenc_string("db")
            .write_lenenc_string("t")
            .write_lenenc_string("t")
            .write_lenenc_string(name)
            .write_lenenc_string(name);
        writer.into_packet(2)
    }

    fn row(values: &[&str]) -> Packet {
        let mut writer = PacketWriter::new();
        for value in values {
            writer.write_lenenc_string(value);
        }
        writer.into_packet(5)
    }

    fn eof(status: u16) -> Packet {
        PacketWriter::eof(status).into_packet(4)
    }

    fn deprecate_eof_ok(status: u16) -> Packet {
        let mut writer = PacketWriter::new();
        writer
            .write_u8(0xFE)
            .write_lenenc_int(0)
            .write_lenenc_int(0)
            .write_u16_le(status)
            .write_u16_le(0);
        writer.into_packet(6)
    }

    /// Feed packets until `Done`, returning how many were consumed.
    fn consumed(tracker: &mut ResponseTracker, packets: &[Packet]) -> usize {
        for (i, packet) in packets.iter().enumerate() {
            if tracker.advance(packet) == RelayStep::Done {
                return i + 1;
            }
        }
        packets.len()
    }

    #[test]
    fn test_ok_ends_response() {
        let mut tracker = ResponseTracker::new(ResultFraming::Classic);
        let ok = PacketWriter::ok(3, SERVER_STATUS_AUTOCOMMIT).into_packet(1);
        assert_eq!(tracker.advance(&ok), RelayStep::Done);
        assert_eq!(tracker.last_status(), Some(SERVER_STATUS_AUTOCOMMIT));
    }

    #[test]
    fn test_err_ends_response() {
        let mut tracker = ResponseTracker::new(ResultFraming::Classic);
        let err = PacketWriter::err(1064, "42000", "syntax").into_packet(1);
        assert_eq!(tracker.advance(&err), RelayStep::Done);
    }

    #[test]
    fn test_result_set_stops_after_second_eof() {
        let packets = vec![
            column_count(2),
            column_def("id"),
            column_def("name"),
            eof(SERVER_STATUS_AUTOCOMMIT),
            row(&["1", "alice"]),
            row(&["2", "bob"]),
            eof(SERVER_STATUS_AUTOCOMMIT),
            // belongs to the next command
            PacketWriter::ok(0, 0).into_packet(1),
        ];
        let mut tracker = ResponseTracker::new(ResultFraming::Classic);
        assert_eq!(consumed(&mut tracker, &packets), 7);
    }

    #[test]
    fn test_columns_then_eofs_without_count() {
        let packets = vec![
            column_def("a"),
            eof(0),
            row(&["x"]),
            eof(0),
            row(&["never read"]),
        ];
        let mut tracker = ResponseTracker::new(ResultFraming::Classic);
        assert_eq!(consumed(&mut tracker, &packets), 4);
    }

    #[test]
    fn test_err_mid_rows_stops_immediately() {
        let packets = vec![
            column_count(1),
            column_def("a"),
            eof(0),
            row(&["1"]),
            PacketWriter::err(1317, "70100", "interrupted").into_packet(5),
            eof(0),
        ];
        let mut tracker = ResponseTracker::new(ResultFraming::Classic);
        assert_eq!(consumed(&mut tracker, &packets), 5);
    }

    #[test]
    fn test_empty_first_column_is_row_data() {
        let packets = vec![
            column_count(1),
            column_def("note"),
            eof(0),
            row(&[""]),
            row(&["x"]),
            eof(0),
        ];
        assert_eq!(packets[3].first_byte(), Some(0x00));
        let mut tracker = ResponseTracker::new(ResultFraming::Classic);
        assert_eq!(consumed(&mut tracker, &packets), 6);
    }

    #[test]
    fn test_deprecate_eof_result_set() {
        let packets = vec![
            column_count(1),
            column_def("a"),
            row(&["1"]),
            row(&[""]),
            deprecate_eof_ok(SERVER_STATUS_AUTOCOMMIT),
            row(&["next command"]),
        ];
        let mut tracker = ResponseTracker::new(ResultFraming::DeprecateEof);
        assert_eq!(consumed(&mut tracker, &packets), 5);
        assert_eq!(tracker.last_status(), Some(SERVER_STATUS_AUTOCOMMIT));
    }

    #[test]
    fn test_multi_results_continue() {
        let packets = vec![
            column_count(1),
            column_def("a"),
            eof(0),
            row(&["1"]),
            eof(SERVER_MORE_RESULTS_EXISTS),
            column_count(1),
            column_def("b"),
            eof(0),
            row(&["2"]),
            eof(SERVER_MORE_RESULTS_EXISTS),
            PacketWriter::ok(0, 0).into_packet(1),
        ];
        let mut tracker = ResponseTracker::new(ResultFraming::Classic);
        assert_eq!(consumed(&mut tracker, &packets), 11);
    }

    #[test]
    fn test_ok_with_more_results_continues() {
        let mut tracker = ResponseTracker::new(ResultFraming::Classic);
        let first = PacketWriter::ok(1, SERVER_MORE_RESULTS_EXISTS).into_packet(1);
        let second = PacketWriter::ok(1, SERVER_STATUS_AUTOCOMMIT).into_packet(2);
        assert_eq!(tracker.advance(&first), RelayStep::Continue);
        assert_eq!(tracker.advance(&second), RelayStep::Done);
    }

    #[test]
    fn test_local_infile_request() {
        let mut tracker = ResponseTracker::new(ResultFraming::Classic);
        let request = Packet::new(1, b"\xFB/tmp/data.csv".to_vec());
        assert_eq!(tracker.advance(&request), RelayStep::LocalInfile);
        let ok = PacketWriter::ok(10, 0).into_packet(4);
        assert_eq!(tracker.advance(&ok), RelayStep::Done);
    }

    fn prepare_ok(stmt_id: u32, columns: u16, params: u16) -> Packet {
        let mut writer = PacketWriter::new();
        writer
            .write_u8(0x00)
            .write_u32_le(stmt_id)
            .write_u16_le(columns)
            .write_u16_le(params)
            .write_u8(0)
            .write_u16_le(0);
        writer.into_packet(1)
    }

    #[test]
    fn test_prepare_reads_both_definition_blocks() {
        let packets = vec![
            prepare_ok(1, 1, 2),
            column_def("?"),
            column_def("?"),
            eof(0),
            column_def("id"),
            eof(0),
            PacketWriter::ok(0, 0).into_packet(1),
        ];
        let mut tracker =
            ResponseTracker::for_command(ResultFraming::Classic, Some(Command::StmtPrepare));
        assert_eq!(consumed(&mut tracker, &packets), 6);
    }

    #[test]
    fn test_prepare_without_definitions_is_one_packet() {
        let mut tracker =
            ResponseTracker::for_command(ResultFraming::Classic, Some(Command::StmtPrepare));
        assert_eq!(tracker.advance(&prepare_ok(7, 0, 0)), RelayStep::Done);
    }

    #[test]
    fn test_prepare_statement_id_is_not_a_status_word() {
        // 0x0008_0000 would read as SERVER_MORE_RESULTS_EXISTS if taken as OK status.
        let packets = vec![prepare_ok(0x0008_0000, 0, 1), column_def("?"), eof(0)];
        let mut tracker =
            ResponseTracker::for_command(ResultFraming::Classic, Some(Command::StmtPrepare));
        assert_eq!(consumed(&mut tracker, &packets), 3);
        assert_eq!(tracker.last_status(), None);
    }

    #[test]
    fn test_prepare_with_deprecate_eof_has_no_block_eofs() {
        let packets = vec![
            prepare_ok(2, 2, 1),
            column_def("?"),
            column_def("a"),
            column_def("b"),
            row(&["next command"]),
        ];
        let mut tracker =
            ResponseTracker::for_command(ResultFraming::DeprecateEof, Some(Command::StmtPrepare));
        assert_eq!(consumed(&mut tracker, &packets), 4);
    }

    #[test]
    fn test_prepare_error() {
        let mut tracker =
            ResponseTracker::for_command(ResultFraming::Classic, Some(Command::StmtPrepare));
        let err = PacketWriter::err(1146, "42S02", "no such table").into_packet(1);
        assert_eq!(tracker.advance(&err), RelayStep::Done);
    }

    #[test]
    fn test_field_list_ends_at_single_eof() {
        let packets = vec![column_def("id"), column_def("name"), eof(0), row(&["next"])];
        let mut tracker =
            ResponseTracker::for_command(ResultFraming::Classic, Some(Command::FieldList));
        assert_eq!(consumed(&mut tracker, &packets), 3);
    }

    #[test]
    fn test_fetch_rows_end_at_eof() {
        let packets = vec![Packet::new(1, vec![0x00, 0x00, 0x01]), eof(0)];
        let mut tracker =
            ResponseTracker::for_command(ResultFraming::Classic, Some(Command::StmtFetch));
        assert_eq!(consumed(&mut tracker, &packets), 2);
    }
}
