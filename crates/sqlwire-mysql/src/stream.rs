//! Packet framer.
//!
//! Splits outgoing payloads into frames of at most [`MAX_PACKET_SIZE`]
//! bytes and reassembles incoming ones. A payload whose length is an exact
//! multiple of the maximum is followed by an empty frame, so a reader always
//! knows where the logical packet ends.
//!
//! Both directions share one sequence counter. It restarts at 0 with every
//! command and wraps modulo 256; a frame arriving with any other sequence
//! number is a desync and the connection cannot continue.

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read, Write};

use sqlwire_core::{
    Error, ProtocolError, ProtocolErrorKind, Result, TransportError, TransportErrorKind,
};

use crate::protocol::{MAX_PACKET_SIZE, Packet, PacketHeader};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// One physical frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence_id: u8,
    pub payload: Vec<u8>,
    /// False when a continuation frame follows
    pub is_last: bool,
}

/// Map an I/O error to a transport error.
pub(crate) fn io_error(context: &str, err: io::Error) -> Error {
    let kind = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportErrorKind::Timeout,
        io::ErrorKind::ConnectionRefused => TransportErrorKind::Refused,
        _ => TransportErrorKind::Disconnected,
    };
    Error::Transport(TransportError {
        kind,
        message: format!("{context}: {err}"),
        source: Some(Box::new(err)),
    })
}

/// Framed, sequence-checked transport over any byte stream.
#[derive(Debug)]
pub struct PacketStream<S> {
    stream: S,
    sequence_id: u8,
    buf: Vec<u8>,
    pos: usize,
}

impl<S: Read + Write> PacketStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            sequence_id: 0,
            buf: Vec::with_capacity(READ_BUFFER_SIZE),
            pos: 0,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Sequence number expected on the next frame, in either direction.
    pub fn sequence_id(&self) -> u8 {
        self.sequence_id
    }

    /// Start a new command sequence.
    pub fn reset_sequence(&mut self) {
        self.sequence_id = 0;
    }

    fn read_exact_buffered(&mut self, out: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.pos == self.buf.len() {
                // Large payloads skip the buffer
                if out.len() - filled >= READ_BUFFER_SIZE {
                    self.stream.read_exact(&mut out[filled..])?;
                    return Ok(());
                }
                self.buf.resize(READ_BUFFER_SIZE, 0);
                let n = loop {
                    match self.stream.read(&mut self.buf) {
                        Ok(n) => break n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            self.buf.clear();
                            self.pos = 0;
                            return Err(e);
                        }
                    }
                };
                self.buf.truncate(n);
                self.pos = 0;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    ));
                }
            }
            let take = (self.buf.len() - self.pos).min(out.len() - filled);
            out[filled..filled + take].copy_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
            filled += take;
        }
        Ok(())
    }

    /// Read one physical frame, checking its sequence number.
    pub fn read_frame(&mut self) -> Result<Frame> {
        let mut header = [0u8; PacketHeader::SIZE];
        self.read_exact_buffered(&mut header)
            .map_err(|e| io_error("failed to read packet header", e))?;
        let header = PacketHeader::from_bytes(&header);

        if header.sequence_id != self.sequence_id {
            return Err(Error::Protocol(ProtocolError {
                kind: ProtocolErrorKind::SequenceMismatch {
                    expected: self.sequence_id,
                    actual: header.sequence_id,
                },
                message: format!(
                    "packet sequence out of order: expected {}, got {}",
                    self.sequence_id, header.sequence_id
                ),
                raw_data: None,
            }));
        }
        self.sequence_id = self.sequence_id.wrapping_add(1);

        let len = header.payload_length as usize;
        let mut payload = vec![0u8; len];
        self.read_exact_buffered(&mut payload)
            .map_err(|e| io_error("failed to read packet payload", e))?;

        tracing::trace!(seq = header.sequence_id, len, "read frame");
        Ok(Frame {
            sequence_id: header.sequence_id,
            payload,
            is_last: len < MAX_PACKET_SIZE,
        })
    }

    /// Read one logical packet, joining continuation frames.
    pub fn read_packet(&mut self) -> Result<Vec<u8>> {
        let first = self.read_frame()?;
        if first.is_last {
            return Ok(first.payload);
        }
        let mut payload = first.payload;
        loop {
            let frame = self.read_frame()?;
            payload.extend_from_slice(&frame.payload);
            if frame.is_last {
                return Ok(payload);
            }
        }
    }

    /// Write one logical packet, splitting it into frames as needed.
    pub fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let mut out = Vec::with_capacity(payload.len().min(MAX_PACKET_SIZE) + PacketHeader::SIZE);
        let mut rest = payload;
        loop {
            let (chunk, tail) = rest.split_at(rest.len().min(MAX_PACKET_SIZE));
            self.push_frame(&mut out, chunk);
            rest = tail;
            if chunk.len() < MAX_PACKET_SIZE {
                break;
            }
            self.flush_frames(&mut out)?;
        }
        self.flush_frames(&mut out)
    }

    fn push_frame(&mut self, out: &mut Vec<u8>, chunk: &[u8]) {
        let header = PacketHeader {
            payload_length: chunk.len() as u32,
            sequence_id: self.sequence_id,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(chunk);
        tracing::trace!(seq = self.sequence_id, len = chunk.len(), "write frame");
        self.sequence_id = self.sequence_id.wrapping_add(1);
    }

    fn flush_frames(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        self.stream
            .write_all(out)
            .map_err(|e| io_error("failed to write packet", e))?;
        out.clear();
        self.stream
            .flush()
            .map_err(|e| io_error("failed to flush stream", e))
    }

    /// Send a command packet, starting from its own sequence number.
    pub fn send(&mut self, packet: &Packet) -> Result<()> {
        self.sequence_id = packet.sequence_id;
        self.write_packet(&packet.payload)
    }
}
