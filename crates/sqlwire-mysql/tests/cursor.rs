//! Cursor and connection behavior against a scripted server.

mod common;

use common::{Col, Script, config, err_packet, ok_packet};
use sqlwire_core::{CursorStateErrorKind, ProtocolErrorKind, TransportErrorKind};
use sqlwire_mysql::protocol::PacketWriter;
use sqlwire_mysql::protocol::server_status::SERVER_MORE_RESULTS_EXISTS;
use sqlwire_mysql::{ConnectionState, CursorState, Error, ExecuteOutcome, Value};

const LONGLONG: u8 = 0x08;
const VAR_STRING: u8 = 0xFD;
const BLOB: u8 = 0xFC;

fn numbers(n: usize) -> Vec<Vec<Option<&'static str>>> {
    const DIGITS: [&str; 10] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];
    (0..n).map(|i| vec![Some(DIGITS[i % 10])]).collect()
}

#[test]
fn buffered_cursor_materializes_rows() {
    let mut script = Script::handshake();
    script.result_set(
        &[Col::new("id", LONGLONG), Col::new("name", VAR_STRING)],
        &[
            vec![Some("1"), Some("alice")],
            vec![Some("2"), Some("bob")],
        ],
    );
    let (mut conn, _) = script.connect(config());

    let mut cursor = conn.buffered_cursor();
    assert_eq!(
        cursor.execute("SELECT id, name FROM users").unwrap(),
        ExecuteOutcome::ResultSet { columns: 2 }
    );
    assert_eq!(cursor.state(), CursorState::Exhausted);
    assert_eq!(cursor.row_count(), Some(2));
    assert_eq!(cursor.connection().state(), ConnectionState::Ready);

    let rows = cursor.fetch_all().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get_named::<i64>("id").unwrap(), 1);
    assert_eq!(rows[1].get_named::<String>("name").unwrap(), "bob");
}

#[test]
fn null_is_distinct_from_zero_and_empty() {
    let mut script = Script::handshake();
    script.result_set(
        &[
            Col::new("a", VAR_STRING),
            Col::new("b", VAR_STRING),
            Col::new("c", LONGLONG),
            Col::new("d", LONGLONG),
        ],
        &[vec![None, Some(""), Some("0"), None]],
    );
    let (mut conn, _) = script.connect(config());

    let row = conn.query_one("SELECT a, b, c, d").unwrap().unwrap();
    assert_eq!(
        row.into_values(),
        vec![Value::Null, Value::Text(String::new()), Value::Int(0), Value::Null]
    );
}

#[test]
fn wide_integers_and_binary_columns() {
    let mut script = Script::handshake();
    script.result_set(
        &[
            Col::new("big", LONGLONG).unsigned(),
            Col::new("neg", LONGLONG),
            Col::new("body", BLOB),
            Col::new("raw", BLOB).binary(),
        ],
        &[vec![
            Some("18446744073709551615"),
            Some("-9223372036854775808"),
            Some("text body"),
            Some("\x01\x02"),
        ]],
    );
    let (mut conn, _) = script.connect(config());

    let values = conn.query_one("SELECT ...").unwrap().unwrap().into_values();
    assert_eq!(values[0], Value::UInt(u64::MAX));
    assert_eq!(values[1], Value::Int(i64::MIN));
    assert_eq!(values[2], Value::Text("text body".to_string()));
    assert_eq!(values[3], Value::Bytes(vec![1, 2]));
}

#[test]
fn streaming_cursor_pulls_rows_lazily() {
    let mut script = Script::handshake();
    script.result_set(&[Col::new("n", LONGLONG)], &numbers(3));
    let (mut conn, _) = script.connect(config());

    let mut cursor = conn.streaming_cursor();
    cursor.execute("SELECT n FROM t").unwrap();
    assert_eq!(cursor.state(), CursorState::StreamingRows);
    assert_eq!(cursor.connection().state(), ConnectionState::StreamingRows);

    let first = cursor.fetch_many(2).unwrap();
    assert_eq!(first.len(), 2);
    let rest: Vec<_> = cursor.by_ref().collect::<Result<_, _>>().unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].get(0), Some(&Value::Int(2)));
    assert_eq!(cursor.row_count(), Some(3));
    assert_eq!(cursor.connection().state(), ConnectionState::Ready);
}

#[test]
fn close_drains_unread_rows_before_next_statement() {
    let mut script = Script::handshake();
    script.result_set(&[Col::new("n", LONGLONG)], &numbers(50));
    script.result_set(&[Col::new("answer", LONGLONG)], &[vec![Some("42")]]);
    let (mut conn, _) = script.connect(config());

    let mut cursor = conn.streaming_cursor();
    cursor.execute("SELECT n FROM big").unwrap();
    assert!(cursor.fetch_one().unwrap().is_some());
    cursor.close().unwrap();
    assert_eq!(cursor.state(), CursorState::Closed);
    drop(cursor);

    assert_eq!(conn.state(), ConnectionState::Ready);
    let row = conn.query_one("SELECT 42").unwrap().unwrap();
    assert_eq!(row.get_named::<i64>("answer").unwrap(), 42);
}

#[test]
fn dropping_a_streaming_cursor_drains_it() {
    let mut script = Script::handshake();
    script.result_set(&[Col::new("n", LONGLONG)], &numbers(10));
    script.respond(&ok_packet(1, 0, 2));
    let (mut conn, _) = script.connect(config());

    {
        let mut cursor = conn.streaming_cursor();
        cursor.execute("SELECT n FROM t").unwrap();
    }
    assert_eq!(conn.execute("DELETE FROM t WHERE n = 1").unwrap(), 1);
}

#[test]
fn busy_connection_sends_nothing() {
    let mut script = Script::handshake();
    script.result_set(&[Col::new("n", LONGLONG)], &numbers(5));
    let (mut conn, written) = script.connect(config());

    let mut cursor = conn.streaming_cursor();
    cursor.execute("SELECT n FROM t").unwrap();
    let before = written.len();

    match cursor.execute("SELECT 1") {
        Err(Error::CursorState(e)) => assert_eq!(e.kind, CursorStateErrorKind::Busy),
        other => panic!("expected busy, got {other:?}"),
    }
    assert_eq!(written.len(), before);

    // A leaked cursor still pins the connection
    std::mem::forget(cursor);
    match conn.query("SELECT 1") {
        Err(Error::CursorState(e)) => assert_eq!(e.kind, CursorStateErrorKind::Busy),
        other => panic!("expected busy, got {other:?}"),
    }
    assert!(matches!(conn.ping(), Err(Error::CursorState(_))));
    assert_eq!(written.len(), before);
    assert_eq!(conn.state(), ConnectionState::StreamingRows);
}

#[test]
fn sequence_desync_breaks_the_connection() {
    let mut script = Script::handshake();
    script.push(5, &ok_packet(0, 0, 2));
    let (mut conn, written) = script.connect(config());

    match conn.execute("DO 1") {
        Err(Error::Protocol(e)) => assert_eq!(
            e.kind,
            ProtocolErrorKind::SequenceMismatch {
                expected: 1,
                actual: 5
            }
        ),
        other => panic!("expected desync, got {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Broken);
    assert!(!conn.is_usable());

    let before = written.len();
    match conn.ping() {
        Err(Error::Transport(e)) => assert_eq!(e.kind, TransportErrorKind::Unusable),
        other => panic!("expected unusable, got {other:?}"),
    }
    assert_eq!(written.len(), before);
}

#[test]
fn malformed_column_count_is_fatal() {
    let mut script = Script::handshake();
    script.respond(&[0x02, 0x00]);
    let (mut conn, _) = script.connect(config());

    let err = conn.query("SELECT 1").unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(conn.state(), ConnectionState::Broken);
}

#[test]
fn server_error_mid_stream_leaves_connection_usable() {
    let mut script = Script::handshake();
    script
        .respond(&[1])
        .columns(&[Col::new("n", LONGLONG)])
        .then(&common::text_row(&[Some("1")]))
        .then(&err_packet(1317, "70100", "Query execution was interrupted"));
    script.respond(&ok_packet(0, 0, 2));
    let (mut conn, _) = script.connect(config());

    {
        let mut cursor = conn.streaming_cursor();
        cursor.execute("SELECT SLEEP(100)").unwrap();
        assert!(cursor.fetch_one().unwrap().is_some());
        match cursor.fetch_one() {
            Err(Error::Server(e)) => assert_eq!(e.code, 1317),
            other => panic!("expected interrupted, got {other:?}"),
        }
    }
    assert_eq!(conn.state(), ConnectionState::Ready);
    conn.ping().unwrap();
}

#[test]
fn statement_error_keeps_connection_ready() {
    let mut script = Script::handshake();
    script.respond(&err_packet(1064, "42000", "You have an error in your SQL syntax"));
    script.respond(&ok_packet(0, 0, 2));
    let (mut conn, _) = script.connect(config());

    let err = conn.execute("SELEC 1").unwrap_err();
    assert!(err.is_operational());
    assert!(!err.is_fatal());
    assert_eq!(err.sqlstate(), Some("42000"));
    conn.ping().unwrap();
}

#[test]
fn multiple_result_sets() {
    let more = SERVER_MORE_RESULTS_EXISTS | 2;
    let mut script = Script::handshake();
    script
        .respond(&[1])
        .result_body(&[Col::new("a", LONGLONG)], &[vec![Some("1")]], more)
        .then(&[1])
        .result_body(&[Col::new("b", LONGLONG)], &[vec![Some("2")], vec![Some("3")]], 2);
    let (mut conn, _) = script.connect(config());

    let mut cursor = conn.buffered_cursor();
    cursor.execute("SELECT 1 AS a; SELECT 2 AS b UNION SELECT 3").unwrap();
    assert_eq!(cursor.fetch_all().unwrap().len(), 1);
    assert_eq!(cursor.connection().state(), ConnectionState::MoreResults);

    assert!(cursor.next_set().unwrap());
    assert_eq!(cursor.columns()[0].name, "b");
    assert_eq!(cursor.fetch_all().unwrap().len(), 2);
    assert!(!cursor.next_set().unwrap());
    assert_eq!(cursor.connection().state(), ConnectionState::Ready);
}

#[test]
fn pending_result_sets_are_discarded_on_drop() {
    let more = SERVER_MORE_RESULTS_EXISTS | 2;
    let mut script = Script::handshake();
    script
        .respond(&[1])
        .result_body(&[Col::new("a", LONGLONG)], &numbers(4), more)
        .then(&ok_packet(3, 0, more))
        .then(&[1])
        .result_body(&[Col::new("b", LONGLONG)], &numbers(2), 2);
    script.respond(&ok_packet(0, 0, 2));
    let (mut conn, _) = script.connect(config());

    {
        let mut cursor = conn.streaming_cursor();
        cursor.execute("CALL three_results()").unwrap();
        cursor.fetch_one().unwrap();
    }
    assert_eq!(conn.state(), ConnectionState::Ready);
    conn.ping().unwrap();
}

#[test]
fn eof_terminated_result_sets() {
    let mut script = Script::handshake_with(0);
    script.result_set(&[Col::new("n", LONGLONG)], &numbers(2));
    let (mut conn, _) = script.connect(config());
    assert!(!conn.session().deprecate_eof());

    let rows = conn.query("SELECT n FROM t").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(conn.state(), ConnectionState::Ready);
}

/// A DEPRECATE_EOF terminator carrying an info string.
fn ok_terminator_with_info() -> Vec<u8> {
    let mut ok = ok_packet(0, 0, 2);
    ok[0] = 0xFE;
    ok.extend_from_slice(b"Rows matched: 2  Changed: 0  Warnings: 0");
    ok
}

#[test]
fn ok_terminator_with_info_ends_the_result_set() {
    let mut script = Script::handshake();
    script
        .respond(&[1])
        .columns(&[Col::new("n", LONGLONG)])
        .then(&common::text_row(&[Some("1")]))
        .then(&ok_terminator_with_info());
    script.respond(&ok_packet(0, 0, 2));
    let (mut conn, _) = script.connect(config());

    {
        let mut cursor = conn.streaming_cursor();
        cursor.execute("SELECT n FROM t").unwrap();
        assert!(cursor.fetch_one().unwrap().is_some());
        assert!(cursor.fetch_one().unwrap().is_none());
        assert_eq!(cursor.row_count(), Some(1));
    }
    assert_eq!(conn.state(), ConnectionState::Ready);
    conn.ping().unwrap();
}

#[test]
fn close_drains_through_ok_terminator_with_info() {
    let mut script = Script::handshake();
    script
        .respond(&[1])
        .columns(&[Col::new("n", LONGLONG)])
        .then(&common::text_row(&[Some("1")]))
        .then(&common::text_row(&[Some("2")]))
        .then(&ok_terminator_with_info());
    script.respond(&ok_packet(0, 0, 2));
    let (mut conn, _) = script.connect(config());

    let mut cursor = conn.streaming_cursor();
    cursor.execute("SELECT n FROM t").unwrap();
    cursor.close().unwrap();
    drop(cursor);

    assert_eq!(conn.state(), ConnectionState::Ready);
    conn.ping().unwrap();
}

#[test]
fn prepared_statement_uses_binary_protocol() {
    let mut script = Script::handshake();

    let mut prepare_ok = PacketWriter::new();
    prepare_ok.write_u8(0x00);
    prepare_ok.write_u32_le(9);
    prepare_ok.write_u16_le(1);
    prepare_ok.write_u16_le(1);
    prepare_ok.write_u8(0);
    prepare_ok.write_u16_le(0);
    script
        .respond(prepare_ok.as_bytes())
        .columns(&[Col::new("?", LONGLONG)])
        .columns(&[Col::new("answer", LONGLONG)]);

    let mut row = vec![0x00, 0x00];
    row.extend_from_slice(&42i64.to_le_bytes());
    script
        .respond(&[1])
        .columns(&[Col::new("answer", LONGLONG)])
        .then(&row)
        .then(&[0xFE, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
    let (mut conn, written) = script.connect(config());
    let handshake_frames = written.frames().len();

    let mut cursor = conn.buffered_cursor();
    cursor
        .execute_prepared("SELECT ? + 1 AS answer", &[Value::Int(41)])
        .unwrap();
    let rows = cursor.fetch_all().unwrap();
    assert_eq!(rows[0].get(0), Some(&Value::Int(42)));
    drop(cursor);

    let commands: Vec<u8> = written
        .frames_after(handshake_frames)
        .iter()
        .map(|(_, payload)| payload[0])
        .collect();
    // COM_STMT_PREPARE, COM_STMT_EXECUTE, COM_STMT_CLOSE
    assert_eq!(commands, vec![0x16, 0x17, 0x19]);
}

#[test]
fn client_side_interpolation_escapes_values() {
    let mut script = Script::handshake();
    script.respond(&ok_packet(1, 0, 2));
    let (mut conn, written) = script.connect(config());
    let skip = written.frames().len();

    let mut cursor = conn.cursor();
    cursor
        .execute_with(
            "UPDATE users SET name = ? WHERE id = ?",
            &[Value::Text("O'Brien".to_string()), Value::Int(7)],
        )
        .unwrap();
    drop(cursor);

    let (seq, payload) = &written.frames_after(skip)[0];
    assert_eq!(*seq, 0);
    assert_eq!(payload[0], 0x03);
    assert_eq!(
        std::str::from_utf8(&payload[1..]).unwrap(),
        "UPDATE users SET name = 'O''Brien' WHERE id = 7"
    );
}

#[test]
fn fetch_after_close_is_a_programming_error() {
    let mut script = Script::handshake();
    script.result_set(&[Col::new("n", LONGLONG)], &numbers(1));
    let (mut conn, _) = script.connect(config());

    let mut cursor = conn.buffered_cursor();
    cursor.execute("SELECT n").unwrap();
    cursor.close().unwrap();
    let err = cursor.fetch_one().unwrap_err();
    assert!(err.is_programming());
    match err {
        Error::CursorState(e) => assert_eq!(e.kind, CursorStateErrorKind::Closed),
        other => panic!("expected closed, got {other:?}"),
    }
}
