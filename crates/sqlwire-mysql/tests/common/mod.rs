//! Scripted in-memory server for protocol tests.
//!
//! The server side is written up front as a byte script; whatever the
//! client writes is captured for inspection.

#![allow(dead_code)]

use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use sqlwire_mysql::protocol::{PacketWriter, capabilities, charset};
use sqlwire_mysql::{MySqlConfig, MySqlConnection};

/// Shared view of the bytes the client wrote.
#[derive(Clone, Default)]
pub struct Written(Arc<Mutex<Vec<u8>>>);

impl Written {
    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// Client packets as (sequence, payload), one entry per frame.
    pub fn frames(&self) -> Vec<(u8, Vec<u8>)> {
        let bytes = self.0.lock().unwrap();
        let mut frames = Vec::new();
        let mut rest = bytes.as_slice();
        while rest.len() >= 4 {
            let len = usize::from(rest[0]) | usize::from(rest[1]) << 8 | usize::from(rest[2]) << 16;
            frames.push((rest[3], rest[4..4 + len].to_vec()));
            rest = &rest[4 + len..];
        }
        frames
    }

    /// Frames written after the first `skip` frames.
    pub fn frames_after(&self, skip: usize) -> Vec<(u8, Vec<u8>)> {
        self.frames().into_iter().skip(skip).collect()
    }
}

pub struct MockStream {
    input: Cursor<Vec<u8>>,
    written: Written,
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub const SCRAMBLE: &[u8; 20] = b"abcdefghijklmnopqrst";

/// Column shape for scripted result sets.
pub struct Col {
    pub name: &'static str,
    pub type_code: u8,
    pub flags: u16,
    pub charset: u16,
}

impl Col {
    pub const fn new(name: &'static str, type_code: u8) -> Self {
        Self {
            name,
            type_code,
            flags: 0,
            charset: 45,
        }
    }

    pub fn unsigned(mut self) -> Self {
        self.flags |= 32;
        self
    }

    pub fn binary(mut self) -> Self {
        self.charset = 63;
        self
    }
}

pub fn greeting(caps: u32, plugin: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string("8.0.36-test");
    w.write_u32_le(7);
    w.write_bytes(&SCRAMBLE[..8]);
    w.write_u8(0);
    w.write_u16_le((caps & 0xFFFF) as u16);
    w.write_u8(charset::UTF8MB4_0900_AI_CI);
    w.write_u16_le(2);
    w.write_u16_le((caps >> 16) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(&SCRAMBLE[8..]);
    w.write_u8(0);
    w.write_null_string(plugin);
    w.into_bytes()
}

pub fn ok_packet(affected_rows: u64, last_insert_id: u64, status: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_lenenc_int(affected_rows);
    w.write_lenenc_int(last_insert_id);
    w.write_u16_le(status);
    w.write_u16_le(0);
    w.into_bytes()
}

pub fn err_packet(code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFF);
    w.write_u16_le(code);
    w.write_u8(b'#');
    w.write_bytes(sqlstate.as_bytes());
    w.write_bytes(message.as_bytes());
    w.into_bytes()
}

pub fn column_def(col: &Col) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for part in ["def", "test", "t", "t", col.name, col.name] {
        w.write_lenenc_string(part);
    }
    w.write_lenenc_int(0x0c);
    w.write_u16_le(col.charset);
    w.write_u32_le(255);
    w.write_u8(col.type_code);
    w.write_u16_le(col.flags);
    w.write_u8(0);
    w.write_zeros(2);
    w.into_bytes()
}

/// Text protocol row; `None` is NULL.
pub fn text_row(values: &[Option<&str>]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for value in values {
        match value {
            Some(v) => w.write_lenenc_string(v),
            None => w.write_u8(0xFB),
        }
    }
    w.into_bytes()
}

/// Builds the server side of a conversation.
pub struct Script {
    bytes: Vec<u8>,
    deprecate_eof: bool,
    seq: u8,
}

impl Script {
    /// Greeting plus auth OK, advertising LOCAL INFILE and DEPRECATE_EOF.
    pub fn handshake() -> Self {
        Self::handshake_with(capabilities::CLIENT_DEPRECATE_EOF)
    }

    /// Greeting plus auth OK with the default flags and `extra`.
    pub fn handshake_with(extra: u32) -> Self {
        let caps = capabilities::DEFAULT_CLIENT_FLAGS
            | capabilities::CLIENT_CONNECT_WITH_DB
            | capabilities::CLIENT_LOCAL_FILES
            | capabilities::CLIENT_MULTI_STATEMENTS
            | extra;
        let mut script = Self {
            bytes: Vec::new(),
            deprecate_eof: caps & capabilities::CLIENT_DEPRECATE_EOF != 0,
            seq: 0,
        };
        script.push(0, &greeting(caps, "mysql_native_password"));
        script.push(2, &ok_packet(0, 0, 2));
        script
    }

    /// Append one server frame at an explicit sequence number.
    pub fn push(&mut self, seq: u8, payload: &[u8]) -> &mut Self {
        let len = payload.len();
        self.bytes.extend_from_slice(&[len as u8, (len >> 8) as u8, (len >> 16) as u8, seq]);
        self.bytes.extend_from_slice(payload);
        self.seq = seq.wrapping_add(1);
        self
    }

    /// Start the response to a new command (first server frame is seq 1).
    pub fn respond(&mut self, payload: &[u8]) -> &mut Self {
        self.push(1, payload)
    }

    /// Continue the current response at the next sequence number.
    pub fn then(&mut self, payload: &[u8]) -> &mut Self {
        let seq = self.seq;
        self.push(seq, payload)
    }

    /// Skip sequence numbers consumed by client frames.
    pub fn client_frames(&mut self, count: usize) -> &mut Self {
        self.seq = self.seq.wrapping_add((count % 256) as u8);
        self
    }

    fn end_packet(&self, status: u16) -> Vec<u8> {
        if self.deprecate_eof {
            let mut ok = ok_packet(0, 0, status);
            ok[0] = 0xFE;
            ok
        } else {
            let mut w = PacketWriter::new();
            w.write_u8(0xFE);
            w.write_u16_le(0);
            w.write_u16_le(status);
            w.into_bytes()
        }
    }

    /// Column definitions (and EOF when not deprecated) after a header.
    pub fn columns(&mut self, cols: &[Col]) -> &mut Self {
        for col in cols {
            self.then(&column_def(col));
        }
        if !self.deprecate_eof {
            let eof = self.end_packet(2);
            self.then(&eof);
        }
        self
    }

    /// A full text result set answering a new command.
    pub fn result_set(&mut self, cols: &[Col], rows: &[Vec<Option<&str>>]) -> &mut Self {
        self.respond(&[cols.len() as u8]);
        self.result_body(cols, rows, 2)
    }

    /// Columns, rows and terminator of a result set whose header was sent.
    pub fn result_body(&mut self, cols: &[Col], rows: &[Vec<Option<&str>>], status: u16) -> &mut Self {
        self.columns(cols);
        for row in rows {
            self.then(&text_row(row));
        }
        let end = self.end_packet(status);
        self.then(&end)
    }

    pub fn connect(&self, config: MySqlConfig) -> (MySqlConnection<MockStream>, Written) {
        let written = Written::default();
        let stream = MockStream {
            input: Cursor::new(self.bytes.clone()),
            written: written.clone(),
        };
        let conn = MySqlConnection::establish(stream, config).expect("handshake");
        (conn, written)
    }
}

pub fn config() -> MySqlConfig {
    MySqlConfig::new().user("root").password("pw").database("test")
}
