//! LOCAL INFILE handling.
//!
//! During `LOAD DATA LOCAL INFILE` the server answers the query with a 0xFB
//! packet naming a file, and the client must send the file back before the
//! real result arrives. The exchange always completes the same way whatever
//! happens locally:
//!
//! 1. zero or more data packets, each at most `infile_chunk_size` bytes
//! 2. one empty packet
//! 3. the server's OK or ERR, which is always read
//!
//! Skipping any of these leaves unread bytes on the wire and desyncs the
//! connection, so refusal and missing files still send the empty packet.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use sqlwire_core::{
    Error, LocalInfileError, LocalInfileErrorKind, ProtocolError, ProtocolErrorKind, Result,
    ServerError,
};

use crate::config::MySqlConfig;
use crate::protocol::OkPacket;
use crate::protocol::result::{decode_err, decode_ok};
use crate::stream::PacketStream;

/// Which filenames the server may request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LocalInfilePolicy {
    /// Refuse every request
    DenyAll,
    /// Serve any file the server names
    #[default]
    AllowAll,
    /// Serve files under these directories
    AllowDirectories(Vec<PathBuf>),
    /// Serve exactly these files
    AllowFiles(Vec<PathBuf>),
}

impl LocalInfilePolicy {
    /// Check whether `filename` may be sent.
    ///
    /// Paths containing `..` never match a directory rule.
    pub fn check(&self, filename: &str) -> bool {
        let path = Path::new(filename);
        match self {
            Self::DenyAll => false,
            Self::AllowAll => true,
            Self::AllowDirectories(dirs) => {
                !path.components().any(|c| matches!(c, Component::ParentDir))
                    && dirs.iter().any(|dir| path.starts_with(dir))
            }
            Self::AllowFiles(files) => files.iter().any(|file| file == path),
        }
    }
}

/// Source of the bytes sent for a LOCAL INFILE request.
pub trait InfileProvider: Send + Sync {
    /// Open the named resource.
    ///
    /// `io::ErrorKind::NotFound` is reported to the caller as
    /// `LocalInfileErrorKind::NotFound`; other errors as `Io`.
    fn open(&self, filename: &str) -> io::Result<Box<dyn Read + '_>>;
}

/// Reads requested files from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSystemProvider;

impl InfileProvider for FileSystemProvider {
    fn open(&self, filename: &str) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(File::open(filename)?))
    }
}

impl fmt::Debug for dyn InfileProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InfileProvider")
    }
}

/// Answer a LOCAL INFILE request.
///
/// Returns the server's OK after a successful upload. Local failures come
/// back as `Error::LocalInfile` carrying the server's reply; a server ERR
/// after a complete upload comes back as `Error::Server`. Names that are not
/// valid UTF-8 are refused rather than rewritten.
#[tracing::instrument(level = "debug", skip_all, fields(filename = %String::from_utf8_lossy(raw_filename), bytes = tracing::field::Empty))]
pub fn handle_local_infile<S: Read + Write>(
    stream: &mut PacketStream<S>,
    raw_filename: &[u8],
    config: &MySqlConfig,
) -> Result<OkPacket> {
    let Ok(filename) = std::str::from_utf8(raw_filename) else {
        let lossy = String::from_utf8_lossy(raw_filename);
        tracing::warn!(filename = %lossy, "refusing LOCAL INFILE request for non UTF-8 name");
        return abort(stream, &lossy, LocalInfileErrorKind::Denied, None);
    };
    if !config.local_infile || !config.local_infile_policy.check(filename) {
        tracing::warn!(filename, "refusing LOCAL INFILE request");
        return abort(stream, filename, LocalInfileErrorKind::Denied, None);
    }

    let provider = config.provider();
    let mut reader = match provider.open(filename) {
        Ok(reader) => reader,
        Err(e) => {
            let kind = if e.kind() == io::ErrorKind::NotFound {
                LocalInfileErrorKind::NotFound
            } else {
                LocalInfileErrorKind::Io
            };
            tracing::debug!(filename, error = %e, "LOCAL INFILE open failed");
            return abort(stream, filename, kind, Some(e));
        }
    };

    let mut chunk = vec![0u8; config.effective_chunk_size()];
    let mut sent = 0usize;
    loop {
        let n = match read_full(&mut reader, &mut chunk) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(filename, error = %e, sent, "LOCAL INFILE read failed");
                return abort(stream, filename, LocalInfileErrorKind::Io, Some(e));
            }
        };
        if n == 0 {
            break;
        }
        stream.write_packet(&chunk[..n])?;
        sent += n;
    }
    tracing::Span::current().record("bytes", sent);

    stream.write_packet(&[])?;
    match read_reply(stream)? {
        Ok(ok) => Ok(ok),
        Err(server) => Err(Error::Server(server)),
    }
}

/// Fill `buf` as far as the source allows; 0 means end of input.
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Terminate the transfer early and report why, with the server's reply.
fn abort<S: Read + Write>(
    stream: &mut PacketStream<S>,
    filename: &str,
    kind: LocalInfileErrorKind,
    source: Option<io::Error>,
) -> Result<OkPacket> {
    stream.write_packet(&[])?;
    let server = read_reply(stream)?.err();
    Err(Error::LocalInfile(LocalInfileError {
        kind,
        filename: filename.to_string(),
        server,
        source: source.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
    }))
}

/// Read the OK/ERR that closes a LOCAL INFILE exchange.
fn read_reply<S: Read + Write>(
    stream: &mut PacketStream<S>,
) -> Result<std::result::Result<OkPacket, ServerError>> {
    let payload = stream.read_packet()?;
    match payload.first() {
        Some(0x00) => Ok(Ok(decode_ok(&payload)?)),
        Some(0xFF) => Ok(Err(decode_err(&payload)?.into_server_error())),
        _ => Err(Error::Protocol(ProtocolError {
            kind: ProtocolErrorKind::UnexpectedPacket,
            message: "expected OK or ERR after LOCAL INFILE data".to_string(),
            raw_data: Some(payload),
        })),
    }
}
