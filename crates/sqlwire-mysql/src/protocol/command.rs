//! Command encoder.
//!
//! Pure serialization of client requests. Every builder returns a [`Packet`]
//! at sequence 0, since each command opens a fresh sequence; nothing here
//! touches the network.
//!
//! # Prepared statements
//!
//! 1. COM_STMT_PREPARE: server answers with statement id, parameter and
//!    column counts, then the parameter and column definitions.
//! 2. COM_STMT_EXECUTE: statement id plus binary parameters; the answer is
//!    an OK or a binary-protocol result set.
//! 3. COM_STMT_CLOSE: no server response.

use super::{Command, PacketWriter};
use crate::types::{encode_binary_value, param_type};
use sqlwire_core::Value;

/// An outgoing protocol packet before framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence number of the first frame
    pub sequence_id: u8,
    /// Unframed payload
    pub payload: Vec<u8>,
}

impl Packet {
    fn command(command: Command, body: &[u8]) -> Self {
        let mut writer = PacketWriter::with_capacity(1 + body.len());
        writer.write_u8(command as u8);
        writer.write_bytes(body);
        Self {
            sequence_id: 0,
            payload: writer.into_bytes(),
        }
    }

    /// The command byte, if the payload is not empty.
    pub fn command_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// COM_QUERY with the statement text.
pub fn encode_query(sql: &str) -> Packet {
    Packet::command(Command::Query, sql.as_bytes())
}

pub fn encode_ping() -> Packet {
    Packet::command(Command::Ping, &[])
}

pub fn encode_quit() -> Packet {
    Packet::command(Command::Quit, &[])
}

/// COM_INIT_DB switching the default schema.
pub fn encode_init_db(database: &str) -> Packet {
    Packet::command(Command::InitDb, database.as_bytes())
}

/// COM_PROCESS_KILL for the given connection id.
pub fn encode_process_kill(connection_id: u32) -> Packet {
    Packet::command(Command::ProcessKill, &connection_id.to_le_bytes())
}

pub fn encode_reset_connection() -> Packet {
    Packet::command(Command::ResetConnection, &[])
}

pub fn encode_stmt_prepare(sql: &str) -> Packet {
    Packet::command(Command::StmtPrepare, sql.as_bytes())
}

/// Build COM_STMT_EXECUTE.
///
/// Layout:
/// - command byte (0x17)
/// - statement id (4 bytes)
/// - cursor flags (1 byte, always CURSOR_TYPE_NO_CURSOR)
/// - iteration count (4 bytes, always 1)
/// - when there are parameters: NULL bitmap, new-params-bound flag,
///   two type bytes per parameter, then the non-NULL values
pub fn encode_stmt_execute(statement_id: u32, params: &[Value]) -> Packet {
    let mut writer = PacketWriter::with_capacity(16 + params.len() * 16);
    writer.write_u8(Command::StmtExecute as u8);
    writer.write_u32_le(statement_id);
    writer.write_u8(0x00);
    writer.write_u32_le(1);

    if !params.is_empty() {
        let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
        for (i, param) in params.iter().enumerate() {
            if param.is_null() {
                null_bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        writer.write_bytes(&null_bitmap);

        writer.write_u8(1);
        for param in params {
            let (field_type, unsigned) = param_type(param);
            writer.write_u8(field_type as u8);
            writer.write_u8(if unsigned { 0x80 } else { 0x00 });
        }

        for param in params {
            encode_binary_value(&mut writer, param);
        }
    }

    Packet {
        sequence_id: 0,
        payload: writer.into_bytes(),
    }
}

pub fn encode_stmt_close(statement_id: u32) -> Packet {
    Packet::command(Command::StmtClose, &statement_id.to_le_bytes())
}
