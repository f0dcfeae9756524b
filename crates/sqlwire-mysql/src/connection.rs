//! MySQL connection.
//!
//! A connection owns the transport and the packet sequence counter, runs the
//! handshake once, and then serves one command at a time. Cursors borrow it
//! mutably for the duration of a statement.
//!
//! The connection tracks what is still pending on the wire. While rows or
//! further result sets are unread, new commands are refused with
//! `CursorStateError::Busy` before anything is written. Any transport,
//! protocol or authentication fault marks the connection `Broken`, after
//! which every command fails with `TransportErrorKind::Unusable`.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use sqlwire_core::{
    AuthError, AuthErrorKind, CursorStateError, CursorStateErrorKind, Error, ProtocolError,
    ProtocolErrorKind, Result, Row, TransportError, TransportErrorKind, Value,
};

use crate::auth::{AuthPlugin, caching_sha2, rsa_encrypt_password};
use crate::config::MySqlConfig;
use crate::cursor::{Cursor, CursorKind};
use crate::infile::handle_local_infile;
use crate::protocol::command::{self, encode_stmt_close, encode_stmt_prepare};
use crate::protocol::handshake::{AuthSwitchRequest, HandshakeResponse, ServerHandshake};
use crate::protocol::result::{
    ResultHeader, RowPacket, StmtPrepareOk, decode_err, decode_ok, decode_result_header,
    decode_row_packet, decode_terminator, parse_column_def, parse_stmt_prepare_ok,
};
use crate::protocol::{EofPacket, OkPacket, Packet, capabilities, server_status};
use crate::stream::{PacketStream, io_error};
use crate::types::ColumnDef;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the server greeting
    Connecting,
    /// Exchanging credentials
    Authenticating,
    /// Ready for a new command
    Ready,
    /// Rows of the current result set are still on the wire
    StreamingRows,
    /// Another result set follows the one just finished
    MoreResults,
    /// A fatal fault left the wire in an unknown state
    Broken,
    /// Closed by the caller
    Closed,
}

/// What the handshake established.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// Server-assigned connection id (target of `KILL`)
    pub connection_id: u32,
    pub server_version: String,
    /// Capabilities the server advertised
    pub server_capabilities: u32,
    /// Capabilities in effect for this session
    pub capabilities: u32,
    pub charset: u8,
    /// Plugin that completed authentication
    pub auth_plugin: String,
    pub user: String,
    pub database: Option<String>,
}

impl SessionInfo {
    /// Whether result sets end with an OK packet instead of EOF.
    pub fn deprecate_eof(&self) -> bool {
        self.capabilities & capabilities::CLIENT_DEPRECATE_EOF != 0
    }

    pub fn local_infile(&self) -> bool {
        self.capabilities & capabilities::CLIENT_LOCAL_FILES != 0
    }
}

/// Outcome of reading a command response header.
#[derive(Debug)]
pub(crate) enum QueryResult {
    /// No result set
    Done(OkPacket),
    /// Column definitions of a result set whose rows follow
    ResultSet(Vec<ColumnDef>),
}

/// One step of row iteration.
#[derive(Debug)]
pub(crate) enum Fetched {
    Row(Vec<Value>),
    End(EofPacket),
}

pub(crate) fn state_error(kind: CursorStateErrorKind, message: impl Into<String>) -> Error {
    Error::CursorState(CursorStateError {
        kind,
        message: message.into(),
    })
}

fn unexpected(message: impl Into<String>, payload: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        kind: ProtocolErrorKind::UnexpectedPacket,
        message: message.into(),
        raw_data: Some(payload.to_vec()),
    })
}

/// MySQL connection over any byte stream (TCP by default).
pub struct MySqlConnection<S: Read + Write = TcpStream> {
    stream: PacketStream<S>,
    config: MySqlConfig,
    session: SessionInfo,
    state: ConnectionState,
    status_flags: u16,
}

impl<S: Read + Write> std::fmt::Debug for MySqlConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("state", &self.state)
            .field("connection_id", &self.session.connection_id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.session.database)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection<TcpStream> {
    /// Open a TCP connection and authenticate.
    #[tracing::instrument(level = "debug", skip(config), fields(host = %config.host, port = config.port))]
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        let stream = open_tcp(&config)?;
        let mut conn = Self::establish(stream, config)?;

        let tcp = conn.stream.get_ref();
        tcp.set_read_timeout(conn.config.read_timeout)
            .map_err(|e| io_error("failed to set read timeout", e))?;
        tcp.set_write_timeout(conn.config.write_timeout)
            .map_err(|e| io_error("failed to set write timeout", e))?;

        tracing::debug!(
            connection_id = conn.session.connection_id,
            server_version = %conn.session.server_version,
            "connected"
        );
        Ok(conn)
    }

    /// Replace this connection with a freshly authenticated one.
    ///
    /// Whatever was pending on the old socket is discarded.
    pub fn reconnect(&mut self) -> Result<()> {
        let fresh = Self::connect(self.config.clone())?;
        let old = std::mem::replace(self, fresh);
        drop(old.stream.into_inner());
        Ok(())
    }
}

fn open_tcp(config: &MySqlConfig) -> Result<TcpStream> {
    let addr = config.socket_addr();
    let addrs = addr.to_socket_addrs().map_err(|e| {
        Error::Transport(TransportError {
            kind: TransportErrorKind::Connect,
            message: format!("failed to resolve {addr}: {e}"),
            source: Some(Box::new(e)),
        })
    })?;

    let mut last_error = None;
    for candidate in addrs {
        match TcpStream::connect_timeout(&candidate, config.connect_timeout) {
            Ok(stream) => {
                stream
                    .set_nodelay(true)
                    .map_err(|e| io_error("failed to set TCP_NODELAY", e))?;
                stream
                    .set_read_timeout(Some(config.connect_timeout))
                    .map_err(|e| io_error("failed to set read timeout", e))?;
                stream
                    .set_write_timeout(Some(config.connect_timeout))
                    .map_err(|e| io_error("failed to set write timeout", e))?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(match last_error {
        Some(e) => {
            let kind = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                TransportErrorKind::Refused
            } else {
                TransportErrorKind::Connect
            };
            Error::Transport(TransportError {
                kind,
                message: format!("failed to connect to {addr}: {e}"),
                source: Some(Box::new(e)),
            })
        }
        None => Error::Transport(TransportError {
            kind: TransportErrorKind::Connect,
            message: format!("{addr} resolved to no addresses"),
            source: None,
        }),
    })
}

impl<S: Read + Write> MySqlConnection<S> {
    /// Run the handshake over an already-open transport.
    pub fn establish(stream: S, config: MySqlConfig) -> Result<Self> {
        let mut conn = Self {
            stream: PacketStream::new(stream),
            config,
            session: SessionInfo::default(),
            state: ConnectionState::Connecting,
            status_flags: 0,
        };
        if let Err(e) = conn.handshake() {
            conn.state = ConnectionState::Broken;
            return Err(e);
        }
        conn.state = ConnectionState::Ready;
        Ok(conn)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether new commands can be issued now.
    pub fn is_usable(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn connection_id(&self) -> u32 {
        self.session.connection_id
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    /// Server status flags from the last OK or EOF.
    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    /// A cursor of the configured default kind (buffered).
    pub fn cursor(&mut self) -> Cursor<'_, S> {
        Cursor::new(self, CursorKind::Buffered)
    }

    pub fn buffered_cursor(&mut self) -> Cursor<'_, S> {
        Cursor::new(self, CursorKind::Buffered)
    }

    pub fn streaming_cursor(&mut self) -> Cursor<'_, S> {
        Cursor::new(self, CursorKind::Streaming)
    }

    /// Run a statement and collect its rows.
    ///
    /// Statements without a result set return no rows.
    pub fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
        let mut cursor = self.buffered_cursor();
        cursor.execute(sql)?;
        if cursor.columns().is_empty() {
            return Ok(Vec::new());
        }
        cursor.fetch_all()
    }

    pub fn query_one(&mut self, sql: &str) -> Result<Option<Row>> {
        Ok(self.query(sql)?.into_iter().next())
    }

    /// Run a statement and return the affected row count.
    pub fn execute(&mut self, sql: &str) -> Result<u64> {
        let mut cursor = self.buffered_cursor();
        cursor.execute(sql)?;
        Ok(cursor.row_count().unwrap_or(0))
    }

    pub fn ping(&mut self) -> Result<()> {
        self.simple_command(&command::encode_ping()).map(|_| ())
    }

    /// Change the default database.
    pub fn select_db(&mut self, database: &str) -> Result<()> {
        self.simple_command(&command::encode_init_db(database))?;
        self.session.database = Some(database.to_string());
        Ok(())
    }

    /// Reset session state (variables, temporary tables, transactions)
    /// without re-authenticating.
    pub fn reset(&mut self) -> Result<()> {
        self.simple_command(&command::encode_reset_connection())
            .map(|_| ())
    }

    /// Kill another connection by id.
    pub fn kill(&mut self, connection_id: u32) -> Result<()> {
        self.simple_command(&command::encode_process_kill(connection_id))
            .map(|_| ())
    }

    /// Send COM_QUIT and close.
    #[tracing::instrument(level = "debug", skip(self), fields(connection_id = self.session.connection_id))]
    pub fn close(mut self) -> Result<()> {
        if matches!(self.state, ConnectionState::Ready) {
            if let Err(e) = self.stream.send(&command::encode_quit()) {
                tracing::debug!(error = %e, "COM_QUIT failed");
            }
        }
        self.state = ConnectionState::Closed;
        Ok(())
    }

    fn handshake(&mut self) -> Result<()> {
        let payload = self.stream.read_packet()?;
        if payload.first() == Some(&0xFF) {
            return Err(Error::Server(decode_err(&payload)?.into_server_error()));
        }
        let greeting = ServerHandshake::parse(&payload)?;
        if greeting.capabilities & capabilities::CLIENT_PROTOCOL_41 == 0 {
            return Err(Error::Protocol(ProtocolError {
                kind: ProtocolErrorKind::UnexpectedPacket,
                message: "server does not support protocol 4.1".to_string(),
                raw_data: None,
            }));
        }

        let capabilities = self.config.capability_flags() & greeting.capabilities;
        self.session = SessionInfo {
            connection_id: greeting.connection_id,
            server_version: greeting.server_version.clone(),
            server_capabilities: greeting.capabilities,
            capabilities,
            charset: self.config.charset,
            auth_plugin: greeting.auth_plugin.clone(),
            user: self.config.user.clone(),
            database: self.config.database.clone(),
        };
        self.status_flags = greeting.status_flags;
        self.state = ConnectionState::Authenticating;

        let plugin =
            AuthPlugin::negotiate(&greeting.auth_plugin, self.config.allow_cleartext_password)?;
        let password = self.config.password.clone().unwrap_or_default();
        let auth_response = plugin.initial_response(
            &password,
            &greeting.auth_data,
            self.config.server_public_key.as_deref(),
        )?;

        let response = HandshakeResponse {
            capabilities,
            max_packet_size: self.config.max_packet_size,
            charset: self.config.charset,
            user: &self.config.user,
            auth_response: &auth_response,
            database: self.config.database.as_deref(),
            auth_plugin: plugin.name(),
            attributes: &self.config.attributes,
        }
        .encode();
        self.stream.write_packet(&response)?;

        self.authenticate(plugin, greeting.auth_data, &password)
    }

    /// Drive the exchange after the handshake response until OK or ERR.
    fn authenticate(&mut self, mut plugin: AuthPlugin, mut seed: Vec<u8>, password: &str) -> Result<()> {
        loop {
            let payload = self.stream.read_packet()?;
            match payload.first() {
                Some(0x00) => {
                    let ok = decode_ok(&payload)?;
                    self.status_flags = ok.status_flags;
                    self.session.auth_plugin = plugin.name().to_string();
                    tracing::debug!(plugin = plugin.name(), "authenticated");
                    return Ok(());
                }
                Some(0xFF) => {
                    let err = decode_err(&payload)?;
                    return Err(Error::Auth(AuthError {
                        kind: AuthErrorKind::Rejected,
                        message: err.error_message,
                        code: Some(err.error_code),
                    }));
                }
                Some(0xFE) => {
                    let switch = AuthSwitchRequest::parse(&payload)?;
                    tracing::debug!(from = plugin.name(), to = %switch.plugin, "auth switch");
                    plugin =
                        AuthPlugin::negotiate(&switch.plugin, self.config.allow_cleartext_password)?;
                    seed = switch.auth_data;
                    let response = plugin.initial_response(
                        password,
                        &seed,
                        self.config.server_public_key.as_deref(),
                    )?;
                    self.stream.write_packet(&response)?;
                }
                Some(0x01) => self.auth_more_data(plugin, &seed, password, &payload[1..])?,
                _ => return Err(unexpected("unexpected packet during authentication", &payload)),
            }
        }
    }

    /// Handle an AuthMoreData (0x01) packet.
    fn auth_more_data(
        &mut self,
        plugin: AuthPlugin,
        seed: &[u8],
        password: &str,
        data: &[u8],
    ) -> Result<()> {
        match (plugin, data.first()) {
            (AuthPlugin::CachingSha2Password, Some(&caching_sha2::FAST_AUTH_SUCCESS)) => Ok(()),
            (AuthPlugin::CachingSha2Password, Some(&caching_sha2::PERFORM_FULL_AUTH)) => {
                let key = match self.config.server_public_key.clone() {
                    Some(key) => key,
                    None => {
                        self.stream
                            .write_packet(&[caching_sha2::REQUEST_PUBLIC_KEY])?;
                        let reply = self.stream.read_packet()?;
                        match reply.split_first() {
                            Some((0x01, key)) => key.to_vec(),
                            _ => return Err(unexpected("expected server public key", &reply)),
                        }
                    }
                };
                let encrypted = rsa_encrypt_password(password, seed, &key)?;
                self.stream.write_packet(&encrypted)?;
                Ok(())
            }
            // The key we asked for by sending 0x01
            (AuthPlugin::Sha256Password, Some(_)) => {
                let encrypted = rsa_encrypt_password(password, seed, data)?;
                self.stream.write_packet(&encrypted)?;
                Ok(())
            }
            _ => Err(unexpected(
                format!("unexpected auth data for {}", plugin.name()),
                data,
            )),
        }
    }

    /// Mark the connection broken when `result` is a fatal fault.
    fn tracked<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() && self.state != ConnectionState::Broken {
                tracing::warn!(
                    connection_id = self.session.connection_id,
                    error = %e,
                    "connection marked broken"
                );
                self.state = ConnectionState::Broken;
            }
        }
        result
    }

    /// Check that a new command may start.
    fn ready_for_command(&self) -> Result<()> {
        match self.state {
            ConnectionState::Ready => Ok(()),
            ConnectionState::StreamingRows | ConnectionState::MoreResults => Err(state_error(
                CursorStateErrorKind::Busy,
                "previous result has not been fully read",
            )),
            ConnectionState::Closed => Err(state_error(
                CursorStateErrorKind::ConnectionClosed,
                "connection is closed",
            )),
            ConnectionState::Broken | ConnectionState::Connecting | ConnectionState::Authenticating => {
                Err(Error::Transport(TransportError {
                    kind: TransportErrorKind::Unusable,
                    message: "connection is unusable after an earlier failure".to_string(),
                    source: None,
                }))
            }
        }
    }

    /// Start a command: check state, then write the packet from sequence 0.
    pub(crate) fn send_command(&mut self, packet: &Packet) -> Result<()> {
        self.ready_for_command()?;
        let result = self.stream.send(packet);
        self.tracked(result)
    }

    /// Commands answered with a single OK or ERR.
    fn simple_command(&mut self, packet: &Packet) -> Result<OkPacket> {
        self.send_command(packet)?;
        let result = self.read_ok_reply();
        self.tracked(result)
    }

    fn read_ok_reply(&mut self) -> Result<OkPacket> {
        let payload = self.stream.read_packet()?;
        match payload.first() {
            Some(0x00) => {
                let ok = decode_ok(&payload)?;
                self.status_flags = ok.status_flags;
                Ok(ok)
            }
            Some(0xFF) => Err(Error::Server(decode_err(&payload)?.into_server_error())),
            _ => Err(unexpected("expected OK or ERR", &payload)),
        }
    }

    /// Read the response header of a command or of the next result set.
    pub(crate) fn read_result(&mut self, sql: Option<&str>) -> Result<QueryResult> {
        let result = self.read_result_inner(sql);
        self.tracked(result)
    }

    fn read_result_inner(&mut self, sql: Option<&str>) -> Result<QueryResult> {
        let payload = self.stream.read_packet()?;
        match decode_result_header(&payload)? {
            ResultHeader::Ok(ok) => {
                self.finish_result(ok.status_flags);
                Ok(QueryResult::Done(ok))
            }
            ResultHeader::Err(err) => {
                self.state = ConnectionState::Ready;
                let mut error = err.into_server_error();
                if let Some(sql) = sql {
                    error = error.with_sql(sql);
                }
                Err(Error::Server(error))
            }
            // Refused when not negotiated; the handler still answers the server
            ResultHeader::LocalInfile(filename) => {
                match handle_local_infile(&mut self.stream, &filename, &self.config) {
                    Ok(ok) => {
                        self.finish_result(ok.status_flags);
                        Ok(QueryResult::Done(ok))
                    }
                    Err(e) => {
                        if !e.is_fatal() {
                            self.state = ConnectionState::Ready;
                        }
                        Err(match e {
                            Error::Server(server) => match sql {
                                Some(sql) => Error::Server(server.with_sql(sql)),
                                None => Error::Server(server),
                            },
                            other => other,
                        })
                    }
                }
            }
            ResultHeader::ColumnCount(count) => {
                let columns = self.read_column_defs(count)?;
                self.state = ConnectionState::StreamingRows;
                Ok(QueryResult::ResultSet(columns))
            }
        }
    }

    fn finish_result(&mut self, status_flags: u16) {
        self.status_flags = status_flags;
        self.state = if status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0 {
            ConnectionState::MoreResults
        } else {
            ConnectionState::Ready
        };
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_column_defs(&mut self, count: u64) -> Result<Vec<ColumnDef>> {
        let mut columns = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            let payload = self.stream.read_packet()?;
            columns.push(parse_column_def(&payload)?);
        }
        self.read_metadata_eof()?;
        Ok(columns)
    }

    /// Consume the EOF after a metadata block when CLIENT_DEPRECATE_EOF is off.
    fn read_metadata_eof(&mut self) -> Result<()> {
        if self.session.deprecate_eof() {
            return Ok(());
        }
        let payload = self.stream.read_packet()?;
        match decode_terminator(&payload, false)? {
            Some(_) => Ok(()),
            None => Err(unexpected("expected EOF after column definitions", &payload)),
        }
    }

    /// Read one row of the current result set.
    pub(crate) fn read_row(&mut self, columns: &[ColumnDef], binary: bool) -> Result<Fetched> {
        let result = self.read_row_inner(columns, binary);
        self.tracked(result)
    }

    fn read_row_inner(&mut self, columns: &[ColumnDef], binary: bool) -> Result<Fetched> {
        if self.state != ConnectionState::StreamingRows {
            return Err(state_error(
                CursorStateErrorKind::Exhausted,
                "no rows pending on the connection",
            ));
        }
        let payload = self.stream.read_packet()?;
        match decode_row_packet(&payload, columns, binary, self.session.deprecate_eof())? {
            RowPacket::Row(values) => Ok(Fetched::Row(values)),
            RowPacket::End(eof) => {
                self.finish_result(eof.status_flags);
                Ok(Fetched::End(eof))
            }
            RowPacket::Err(err) => {
                self.state = ConnectionState::Ready;
                Err(Error::Server(err.into_server_error()))
            }
        }
    }

    /// Discard the unread rows of the current result set.
    ///
    /// Returns how many rows were skipped.
    pub(crate) fn drain_rows(&mut self) -> Result<u64> {
        let result = self.drain_rows_inner();
        self.tracked(result)
    }

    fn drain_rows_inner(&mut self) -> Result<u64> {
        let mut discarded = 0;
        while self.state == ConnectionState::StreamingRows {
            let payload = self.stream.read_packet()?;
            if let Some(eof) = decode_terminator(&payload, self.session.deprecate_eof())? {
                self.finish_result(eof.status_flags);
            } else if payload.first() == Some(&0xFF) {
                self.state = ConnectionState::Ready;
                return Err(Error::Server(decode_err(&payload)?.into_server_error()));
            } else {
                discarded += 1;
            }
        }
        Ok(discarded)
    }

    /// Read and discard every result set still pending.
    pub(crate) fn discard_pending_results(&mut self) -> Result<()> {
        loop {
            match self.state {
                ConnectionState::StreamingRows => {
                    self.drain_rows()?;
                }
                ConnectionState::MoreResults => {
                    self.read_result(None)?;
                }
                _ => return Ok(()),
            }
        }
    }

    /// COM_STMT_PREPARE, consuming the parameter and column metadata.
    pub(crate) fn prepare(&mut self, sql: &str) -> Result<StmtPrepareOk> {
        self.send_command(&encode_stmt_prepare(sql))?;
        let result = self.read_prepare_response(sql);
        self.tracked(result)
    }

    fn read_prepare_response(&mut self, sql: &str) -> Result<StmtPrepareOk> {
        let payload = self.stream.read_packet()?;
        if payload.first() == Some(&0xFF) {
            let err = decode_err(&payload)?.into_server_error().with_sql(sql);
            return Err(Error::Server(err));
        }
        let prepared = parse_stmt_prepare_ok(&payload)?;
        for count in [prepared.num_params, prepared.num_columns] {
            if count == 0 {
                continue;
            }
            for _ in 0..count {
                let payload = self.stream.read_packet()?;
                parse_column_def(&payload)?;
            }
            self.read_metadata_eof()?;
        }
        Ok(prepared)
    }

    /// COM_STMT_CLOSE; the server sends no reply.
    pub(crate) fn close_statement(&mut self, statement_id: u32) -> Result<()> {
        self.send_command(&encode_stmt_close(statement_id))
    }

    #[cfg(test)]
    pub(crate) fn force_state(&mut self, state: ConnectionState) {
        self.state = state;
    }
}

/// Cancel the statement running on `connection_id`.
///
/// Opens a second connection with `config` and issues `KILL QUERY`; the
/// target connection stays open and its statement fails with an
/// interrupted error.
pub fn cancel_query(config: &MySqlConfig, connection_id: u32) -> Result<()> {
    let mut conn = MySqlConnection::connect(config.clone())?;
    tracing::debug!(target_connection = connection_id, "cancelling query");
    conn.execute(&format!("KILL QUERY {connection_id}"))?;
    conn.close()
}
