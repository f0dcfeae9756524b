//! Cursors.
//!
//! A cursor runs one statement at a time on a borrowed connection. Both
//! kinds share one state machine and differ only in when rows leave the
//! wire:
//!
//! - **Buffered** reads the whole result set during `execute`.
//! - **Streaming** reads one row per fetch and keeps the connection busy
//!   until the set is exhausted or the cursor is closed.
//!
//! Closing (or dropping) a cursor drains whatever is still pending so the
//! next command on the connection starts on a clean wire.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use sqlwire_core::{ColumnInfo, CursorStateErrorKind, Error, Result, Row, TypeError, Value};

use crate::connection::{ConnectionState, Fetched, MySqlConnection, QueryResult, state_error};
use crate::protocol::command::{encode_query, encode_stmt_execute};
use crate::protocol::{EofPacket, OkPacket};
use crate::types::{ColumnDef, interpolate_params};

/// How rows are pulled from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    Buffered,
    Streaming,
}

/// Cursor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Nothing executed yet, or the last statement failed
    Idle,
    /// Command sent, response header not yet read
    Executing,
    /// Rows still unread on the wire
    StreamingRows,
    /// All rows of the current result are off the wire
    Exhausted,
    Closed,
}

/// What `execute` produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Statement without a result set
    Affected { rows: u64, last_insert_id: u64 },
    /// A result set with this many columns
    ResultSet { columns: usize },
}

/// Execution context for one statement at a time.
pub struct Cursor<'c, S: Read + Write = TcpStream> {
    conn: &'c mut MySqlConnection<S>,
    kind: CursorKind,
    state: CursorState,
    columns: Vec<ColumnDef>,
    column_info: Arc<ColumnInfo>,
    rows: VecDeque<Row>,
    binary: bool,
    has_result_set: bool,
    end_reported: bool,
    fetched: u64,
    row_count: Option<u64>,
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
    statement_id: Option<u32>,
}

impl<S: Read + Write> std::fmt::Debug for Cursor<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("columns", &self.columns.len())
            .field("buffered_rows", &self.rows.len())
            .finish_non_exhaustive()
    }
}

impl<'c, S: Read + Write> Cursor<'c, S> {
    pub(crate) fn new(conn: &'c mut MySqlConnection<S>, kind: CursorKind) -> Self {
        Self {
            conn,
            kind,
            state: CursorState::Idle,
            columns: Vec::new(),
            column_info: Arc::new(ColumnInfo::new(Vec::new())),
            rows: VecDeque::new(),
            binary: false,
            has_result_set: false,
            end_reported: false,
            fetched: 0,
            row_count: None,
            affected_rows: 0,
            last_insert_id: 0,
            warnings: 0,
            statement_id: None,
        }
    }

    pub fn kind(&self) -> CursorKind {
        self.kind
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// The connection this cursor runs on.
    pub fn connection(&self) -> &MySqlConnection<S> {
        self.conn
    }

    /// Column definitions of the current result set (empty without one).
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Rows in the current result, or affected rows for statements without
    /// one. `None` while a streaming result is still being read.
    pub fn row_count(&self) -> Option<u64> {
        self.row_count
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    /// Warning count reported at the end of the current result.
    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    /// Run a statement over the text protocol.
    #[tracing::instrument(level = "debug", skip(self), fields(connection_id = self.conn.connection_id(), kind = ?self.kind))]
    pub fn execute(&mut self, sql: &str) -> Result<ExecuteOutcome> {
        self.begin()?;
        let result = self
            .conn
            .send_command(&encode_query(sql))
            .and_then(|()| self.conn.read_result(Some(sql)));
        self.load(result, false)
    }

    /// Run a statement with `?` placeholders filled in client-side.
    ///
    /// Values are escaped and quoted; the statement still travels over the
    /// text protocol.
    pub fn execute_with(&mut self, sql: &str, params: &[Value]) -> Result<ExecuteOutcome> {
        let Some(interpolated) = interpolate_params(sql, params) else {
            return Err(param_count_error(sql, params.len()));
        };
        self.execute(&interpolated)
    }

    /// Prepare, execute over the binary protocol, and close the statement
    /// once its results are read.
    #[tracing::instrument(level = "debug", skip(self, params), fields(connection_id = self.conn.connection_id(), params = params.len()))]
    pub fn execute_prepared(&mut self, sql: &str, params: &[Value]) -> Result<ExecuteOutcome> {
        self.begin()?;
        let prepared = match self.conn.prepare(sql) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.state = CursorState::Idle;
                return Err(e);
            }
        };
        self.statement_id = Some(prepared.statement_id);

        if usize::from(prepared.num_params) != params.len() {
            self.state = CursorState::Idle;
            self.release_statement()?;
            return Err(param_count_error(sql, params.len()));
        }

        let result = self
            .conn
            .send_command(&encode_stmt_execute(prepared.statement_id, params))
            .and_then(|()| self.conn.read_result(Some(sql)));
        self.load(result, true)
    }

    /// Fetch the next row of the current result set.
    ///
    /// `Ok(None)` marks the end of the set; fetching again after that fails
    /// with `CursorStateErrorKind::Exhausted`.
    pub fn fetch_one(&mut self) -> Result<Option<Row>> {
        self.check_fetchable()?;
        if let Some(row) = self.rows.pop_front() {
            return Ok(Some(row));
        }
        if self.state != CursorState::StreamingRows {
            self.end_reported = true;
            return Ok(None);
        }

        match self.conn.read_row(&self.columns, self.binary) {
            Ok(Fetched::Row(values)) => {
                self.fetched += 1;
                Ok(Some(Row::with_columns(Arc::clone(&self.column_info), values)))
            }
            Ok(Fetched::End(eof)) => {
                self.finish_rows(eof)?;
                self.end_reported = true;
                Ok(None)
            }
            Err(e) => {
                self.state = CursorState::Exhausted;
                self.end_reported = true;
                Err(e)
            }
        }
    }

    /// Fetch up to `n` rows; fewer means the set ended.
    pub fn fetch_many(&mut self, n: usize) -> Result<Vec<Row>> {
        self.check_fetchable()?;
        let mut rows = Vec::with_capacity(n.min(1024));
        while rows.len() < n {
            match self.fetch_one()? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    /// Take every remaining row. Buffered cursors only.
    pub fn fetch_all(&mut self) -> Result<Vec<Row>> {
        if self.kind != CursorKind::Buffered {
            return Err(state_error(
                CursorStateErrorKind::BufferedOnly,
                "fetch_all requires a buffered cursor",
            ));
        }
        self.check_fetchable()?;
        self.end_reported = true;
        Ok(self.rows.drain(..).collect())
    }

    /// Advance to the next result set of a multi-result response.
    ///
    /// Unread rows of the current set are discarded. Returns `false` when no
    /// further result follows.
    pub fn next_set(&mut self) -> Result<bool> {
        match self.state {
            CursorState::Closed => {
                return Err(state_error(CursorStateErrorKind::Closed, "cursor is closed"));
            }
            CursorState::Idle | CursorState::Executing => return Ok(false),
            CursorState::StreamingRows => {
                self.conn.drain_rows()?;
                self.state = CursorState::Exhausted;
            }
            CursorState::Exhausted => {}
        }

        if self.conn.state() != ConnectionState::MoreResults {
            return Ok(false);
        }
        let binary = self.binary;
        self.reset_result();
        self.state = CursorState::Executing;
        let result = self.conn.read_result(None);
        self.load(result, binary)?;
        Ok(true)
    }

    /// Release the connection, draining anything still on the wire.
    #[tracing::instrument(level = "debug", skip(self), fields(connection_id = self.conn.connection_id()))]
    pub fn close(&mut self) -> Result<()> {
        let previous = std::mem::replace(&mut self.state, CursorState::Closed);
        self.rows.clear();
        // Only a cursor that produced a result owns what is pending
        if matches!(previous, CursorState::Closed | CursorState::Idle) {
            return Ok(());
        }

        let drained = self.conn.drain_rows();
        let pending = drained.and_then(|discarded| {
            if discarded > 0 {
                tracing::debug!(discarded, "discarded unread rows");
            }
            self.conn.discard_pending_results()
        });
        let released = self.release_statement();
        pending.and(released)
    }

    /// Prepare for a new statement on this cursor.
    fn begin(&mut self) -> Result<()> {
        match self.state {
            CursorState::Closed => {
                return Err(state_error(CursorStateErrorKind::Closed, "cursor is closed"));
            }
            CursorState::StreamingRows => {
                return Err(state_error(
                    CursorStateErrorKind::Busy,
                    "streaming result has unread rows",
                ));
            }
            CursorState::Idle | CursorState::Executing | CursorState::Exhausted => {}
        }
        // Leftover result sets of the previous statement
        if self.conn.state() == ConnectionState::MoreResults {
            self.conn.discard_pending_results()?;
            self.release_statement()?;
        }
        self.reset_result();
        self.state = CursorState::Executing;
        Ok(())
    }

    fn reset_result(&mut self) {
        self.columns.clear();
        self.column_info = Arc::new(ColumnInfo::new(Vec::new()));
        self.rows.clear();
        self.has_result_set = false;
        self.end_reported = false;
        self.fetched = 0;
        self.row_count = None;
        self.affected_rows = 0;
        self.last_insert_id = 0;
        self.warnings = 0;
    }

    /// Apply a response header to the cursor.
    fn load(&mut self, result: Result<QueryResult>, binary: bool) -> Result<ExecuteOutcome> {
        let outcome = match result {
            Ok(QueryResult::Done(ok)) => self.load_ok(&ok),
            Ok(QueryResult::ResultSet(columns)) => self.load_result_set(columns, binary),
            Err(e) => Err(e),
        };
        if outcome.is_err() {
            self.state = CursorState::Idle;
            if let Err(e) = self.release_statement() {
                tracing::debug!(error = %e, "failed to close prepared statement");
            }
        }
        outcome
    }

    fn load_ok(&mut self, ok: &OkPacket) -> Result<ExecuteOutcome> {
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        self.warnings = ok.warnings;
        self.row_count = Some(ok.affected_rows);
        self.state = CursorState::Exhausted;
        self.release_statement()?;
        Ok(ExecuteOutcome::Affected {
            rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
        })
    }

    fn load_result_set(&mut self, columns: Vec<ColumnDef>, binary: bool) -> Result<ExecuteOutcome> {
        let names = columns.iter().map(|c| c.name.clone()).collect();
        self.column_info = Arc::new(ColumnInfo::new(names));
        self.columns = columns;
        self.binary = binary;
        self.has_result_set = true;
        self.state = CursorState::StreamingRows;

        if self.kind == CursorKind::Buffered {
            loop {
                match self.conn.read_row(&self.columns, binary)? {
                    Fetched::Row(values) => {
                        self.rows
                            .push_back(Row::with_columns(Arc::clone(&self.column_info), values));
                        self.fetched += 1;
                    }
                    Fetched::End(eof) => {
                        self.finish_rows(eof)?;
                        break;
                    }
                }
            }
            tracing::debug!(rows = self.fetched, "buffered result set");
        }

        Ok(ExecuteOutcome::ResultSet {
            columns: self.columns.len(),
        })
    }

    fn finish_rows(&mut self, eof: EofPacket) -> Result<()> {
        self.warnings = eof.warnings;
        self.row_count = Some(self.fetched);
        self.state = CursorState::Exhausted;
        self.release_statement()
    }

    fn check_fetchable(&self) -> Result<()> {
        match self.state {
            CursorState::Closed => Err(state_error(CursorStateErrorKind::Closed, "cursor is closed")),
            CursorState::Idle | CursorState::Executing => Err(state_error(
                CursorStateErrorKind::NoResultSet,
                "no statement has been executed",
            )),
            _ if !self.has_result_set => Err(state_error(
                CursorStateErrorKind::NoResultSet,
                "statement did not produce a result set",
            )),
            _ if self.end_reported => Err(state_error(
                CursorStateErrorKind::Exhausted,
                "result set already fully fetched",
            )),
            _ => Ok(()),
        }
    }

    /// Close the prepared statement once the wire is idle.
    fn release_statement(&mut self) -> Result<()> {
        if self.conn.state() != ConnectionState::Ready {
            return Ok(());
        }
        match self.statement_id.take() {
            Some(id) => self.conn.close_statement(id),
            None => Ok(()),
        }
    }
}

fn param_count_error(sql: &str, given: usize) -> Error {
    Error::Type(TypeError {
        expected: "one parameter per placeholder",
        actual: format!("{given} parameters for: {sql}"),
        column: None,
    })
}

impl<S: Read + Write> Iterator for Cursor<'_, S> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.fetch_one() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => None,
            Err(Error::CursorState(e)) if e.kind == CursorStateErrorKind::Exhausted => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl<S: Read + Write> Drop for Cursor<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to drain cursor on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MySqlConfig;
    use crate::protocol::handshake::tests::sample_greeting;
    use crate::protocol::result::tests::column_def_payload;
    use crate::stream::tests::{Duplex, frame};

    const OK: &[u8] = &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
    const END: &[u8] = &[0xFE, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];

    /// A connected session followed by one scripted command response.
    fn conn_with_response(packets: &[Vec<u8>]) -> MySqlConnection<Duplex> {
        let mut input = frame(0, &sample_greeting("mysql_native_password"));
        input.extend(frame(2, OK));
        for (seq, payload) in packets.iter().enumerate() {
            input.extend(frame(u8::try_from(seq + 1).unwrap(), payload));
        }
        let config = MySqlConfig::new().user("app").password("pw");
        MySqlConnection::establish(Duplex::new(input), config).unwrap()
    }

    fn result_set(rows: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut packets = vec![vec![0x01], column_def_payload("n", 0x08, 0)];
        packets.extend(rows.iter().map(|r| r.to_vec()));
        packets.push(END.to_vec());
        packets
    }

    #[test]
    fn test_buffered_fetch_all() {
        let mut conn = conn_with_response(&result_set(&[b"\x011", b"\x012"]));
        let mut cursor = conn.buffered_cursor();
        assert_eq!(
            cursor.execute("SELECT n").unwrap(),
            ExecuteOutcome::ResultSet { columns: 1 }
        );
        assert_eq!(cursor.state(), CursorState::Exhausted);
        assert_eq!(cursor.row_count(), Some(2));
        let rows = cursor.fetch_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get_named::<i64>("n").unwrap(), 2);
        drop(cursor);
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_streaming_fetch_one_until_end() {
        let mut conn = conn_with_response(&result_set(&[b"\x017", b"\x018"]));
        let mut cursor = conn.streaming_cursor();
        cursor.execute("SELECT n").unwrap();
        assert_eq!(cursor.state(), CursorState::StreamingRows);
        assert_eq!(cursor.row_count(), None);

        assert_eq!(cursor.fetch_one().unwrap().unwrap().get(0), Some(&Value::Int(7)));
        assert_eq!(cursor.fetch_one().unwrap().unwrap().get(0), Some(&Value::Int(8)));
        assert!(cursor.fetch_one().unwrap().is_none());
        assert_eq!(cursor.row_count(), Some(2));

        match cursor.fetch_one() {
            Err(Error::CursorState(e)) => assert_eq!(e.kind, CursorStateErrorKind::Exhausted),
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_streaming_rejects_fetch_all() {
        let mut conn = conn_with_response(&result_set(&[b"\x011"]));
        let mut cursor = conn.streaming_cursor();
        cursor.execute("SELECT n").unwrap();
        match cursor.fetch_all() {
            Err(Error::CursorState(e)) => assert_eq!(e.kind, CursorStateErrorKind::BufferedOnly),
            other => panic!("expected buffered-only, got {other:?}"),
        }
    }

    #[test]
    fn test_reexecute_while_streaming_is_busy() {
        let mut conn = conn_with_response(&result_set(&[b"\x011", b"\x012"]));
        let mut cursor = conn.streaming_cursor();
        cursor.execute("SELECT n").unwrap();
        let written = cursor.connection().get_ref().output.len();
        match cursor.execute("SELECT 2") {
            Err(Error::CursorState(e)) => assert_eq!(e.kind, CursorStateErrorKind::Busy),
            other => panic!("expected busy, got {other:?}"),
        }
        assert_eq!(cursor.connection().get_ref().output.len(), written);
        assert_eq!(cursor.state(), CursorState::StreamingRows);
    }

    #[test]
    fn test_close_drains_rows() {
        let mut conn = conn_with_response(&result_set(&[b"\x011", b"\x012", b"\x013"]));
        {
            let mut cursor = conn.streaming_cursor();
            cursor.execute("SELECT n").unwrap();
            cursor.fetch_one().unwrap();
            cursor.close().unwrap();
            assert_eq!(cursor.state(), CursorState::Closed);
        }
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_fetch_without_execute() {
        let mut conn = conn_with_response(&[]);
        let mut cursor = conn.cursor();
        match cursor.fetch_one() {
            Err(Error::CursorState(e)) => assert_eq!(e.kind, CursorStateErrorKind::NoResultSet),
            other => panic!("expected no result set, got {other:?}"),
        }
    }

    #[test]
    fn test_execute_ok_result() {
        let ok = vec![0x00, 0x03, 0x07, 0x02, 0x00, 0x00, 0x00];
        let mut conn = conn_with_response(&[ok]);
        let mut cursor = conn.cursor();
        assert_eq!(
            cursor.execute("UPDATE t SET a = 1").unwrap(),
            ExecuteOutcome::Affected {
                rows: 3,
                last_insert_id: 7
            }
        );
        assert_eq!(cursor.row_count(), Some(3));
        assert!(cursor.columns().is_empty());
    }

    #[test]
    fn test_server_error_keeps_connection_ready() {
        let err = b"\xFF\x7A\x04#42S02Table 'test.missing' doesn't exist".to_vec();
        let mut conn = conn_with_response(&[err]);
        match conn.query("SELECT * FROM missing") {
            Err(Error::Server(e)) => {
                assert_eq!(e.code, 1146);
                assert_eq!(e.sql.as_deref(), Some("SELECT * FROM missing"));
            }
            other => panic!("expected server error, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_execute_with_param_mismatch() {
        let mut conn = conn_with_response(&[]);
        let mut cursor = conn.cursor();
        let err = cursor
            .execute_with("SELECT ?, ?", &[Value::Int(1)])
            .unwrap_err();
        assert!(matches!(err, Error::Type(_)));
        assert_eq!(cursor.state(), CursorState::Idle);
    }
}
