//! Result decoder.
//!
//! A command response starts with a header packet that is one of: OK, ERR,
//! a column count, or a LOCAL INFILE request. A column count is followed by
//! that many column definitions, an EOF (unless CLIENT_DEPRECATE_EOF was
//! negotiated), then rows until an EOF/OK terminator or an ERR.
//!
//! Every malformed or truncated packet here is a [`ProtocolError`], which is
//! fatal to the connection.

use sqlwire_core::{ProtocolError, ProtocolErrorKind, Value};

use super::{EofPacket, ErrPacket, MAX_PACKET_SIZE, OkPacket, PacketReader};
use crate::types::{ColumnDef, FieldType, decode_binary_value, decode_text_value};

/// Decoded first packet of a command response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultHeader {
    /// Statement finished without a result set
    Ok(OkPacket),
    /// Statement failed
    Err(ErrPacket),
    /// A result set with this many columns follows
    ColumnCount(u64),
    /// The server wants the named local file (raw bytes as sent)
    LocalInfile(Vec<u8>),
}

pub(crate) fn malformed(message: impl Into<String>, raw: &[u8]) -> ProtocolError {
    ProtocolError {
        kind: ProtocolErrorKind::Malformed,
        message: message.into(),
        raw_data: Some(raw.to_vec()),
    }
}

/// Parse an ERR payload.
pub fn decode_err(payload: &[u8]) -> Result<ErrPacket, ProtocolError> {
    PacketReader::new(payload)
        .parse_err_packet()
        .ok_or_else(|| malformed("truncated ERR packet", payload))
}

/// Parse an OK payload (0x00, or 0xFE when it stands in for EOF).
pub fn decode_ok(payload: &[u8]) -> Result<OkPacket, ProtocolError> {
    PacketReader::new(payload)
        .parse_ok_packet()
        .ok_or_else(|| malformed("truncated OK packet", payload))
}

/// Classify the first packet of a command response.
pub fn decode_result_header(payload: &[u8]) -> Result<ResultHeader, ProtocolError> {
    match payload.first() {
        None => Err(malformed("empty result header", payload)),
        Some(0x00) => decode_ok(payload).map(ResultHeader::Ok),
        Some(0xFF) => decode_err(payload).map(ResultHeader::Err),
        Some(0xFB) => Ok(ResultHeader::LocalInfile(payload[1..].to_vec())),
        Some(_) => {
            let mut reader = PacketReader::new(payload);
            match reader.read_lenenc_int() {
                Some(count) if count > 0 && reader.is_empty() => {
                    Ok(ResultHeader::ColumnCount(count))
                }
                _ => Err(malformed("invalid column count", payload)),
            }
        }
    }
}

/// Parse a column definition (Protocol::ColumnDefinition41).
pub fn parse_column_def(payload: &[u8]) -> Result<ColumnDef, ProtocolError> {
    let mut reader = PacketReader::new(payload);
    let mut string = |what: &str| {
        reader
            .read_lenenc_string()
            .ok_or_else(|| malformed(format!("column definition missing {what}"), payload))
    };

    let _catalog = string("catalog")?;
    let schema = string("schema")?;
    let table = string("table")?;
    let org_table = string("org_table")?;
    let name = string("name")?;
    let org_name = string("org_name")?;

    let (charset, column_length, type_code, flags, decimals) = read_fixed_fields(&mut reader)
        .ok_or_else(|| malformed("column definition truncated", payload))?;

    Ok(ColumnDef {
        schema,
        table,
        org_table,
        name,
        org_name,
        charset,
        column_length,
        column_type: FieldType::from_u8(type_code),
        type_code,
        flags,
        decimals,
    })
}

fn read_fixed_fields(reader: &mut PacketReader<'_>) -> Option<(u16, u32, u8, u16, u8)> {
    let _len = reader.read_lenenc_int()?;
    let charset = reader.read_u16_le()?;
    let column_length = reader.read_u32_le()?;
    let type_code = reader.read_u8()?;
    let flags = reader.read_u16_le()?;
    let decimals = reader.read_u8()?;
    Some((charset, column_length, type_code, flags, decimals))
}

/// One packet read while iterating rows.
#[derive(Debug, Clone, PartialEq)]
pub enum RowPacket {
    /// A data row
    Row(Vec<Value>),
    /// End of the result set
    End(EofPacket),
    /// The server aborted the result set
    Err(ErrPacket),
}

/// Check whether a row-phase packet is a terminator.
///
/// Without CLIENT_DEPRECATE_EOF the terminator is a 0xFE packet shorter than
/// 9 bytes. With it, the terminator is an OK packet carrying the 0xFE header,
/// which may hold an info string or session state, so any 0xFE packet under
/// `MAX_PACKET_SIZE` ends the set. A row whose first value has an 8-byte
/// length prefix is always at least that long.
pub fn decode_terminator(
    payload: &[u8],
    deprecate_eof: bool,
) -> Result<Option<EofPacket>, ProtocolError> {
    let limit = if deprecate_eof { MAX_PACKET_SIZE } else { 9 };
    if payload.first() != Some(&0xFE) || payload.len() >= limit {
        return Ok(None);
    }
    let eof = if deprecate_eof {
        let ok = decode_ok(payload)?;
        EofPacket {
            warnings: ok.warnings,
            status_flags: ok.status_flags,
        }
    } else {
        PacketReader::new(payload)
            .parse_eof_packet()
            .unwrap_or(EofPacket {
                warnings: 0,
                status_flags: 0,
            })
    };
    Ok(Some(eof))
}

/// Classify a row-phase packet, decoding it if it is a row.
pub fn decode_row_packet(
    payload: &[u8],
    columns: &[ColumnDef],
    binary: bool,
    deprecate_eof: bool,
) -> Result<RowPacket, ProtocolError> {
    if let Some(eof) = decode_terminator(payload, deprecate_eof)? {
        return Ok(RowPacket::End(eof));
    }
    if payload.first() == Some(&0xFF) {
        return decode_err(payload).map(RowPacket::Err);
    }
    let values = if binary {
        decode_binary_row(payload, columns)?
    } else {
        decode_text_row(payload, columns)?
    };
    Ok(RowPacket::Row(values))
}

/// Decode a text protocol row: one length-encoded string per column, with
/// 0xFB marking NULL.
pub fn decode_text_row(payload: &[u8], columns: &[ColumnDef]) -> Result<Vec<Value>, ProtocolError> {
    let mut reader = PacketReader::new(payload);
    let mut values = Vec::with_capacity(columns.len());

    for column in columns {
        if reader.peek() == Some(0xFB) {
            reader.skip(1);
            values.push(Value::Null);
            continue;
        }
        let data = reader.read_lenenc_slice().ok_or_else(|| {
            malformed(format!("truncated text row at column '{}'", column.name), payload)
        })?;
        values.push(decode_text_value(column, data));
    }

    if !reader.is_empty() {
        return Err(malformed("trailing bytes after text row", payload));
    }
    Ok(values)
}

/// Decode a binary protocol row.
///
/// Layout: 0x00 header, NULL bitmap of `(n + 7 + 2) / 8` bytes with bit
/// offset 2, then the non-NULL values.
pub fn decode_binary_row(
    payload: &[u8],
    columns: &[ColumnDef],
) -> Result<Vec<Value>, ProtocolError> {
    let mut reader = PacketReader::new(payload);
    if reader.read_u8() != Some(0x00) {
        return Err(malformed("binary row missing 0x00 header", payload));
    }

    let bitmap_len = (columns.len() + 7 + 2) / 8;
    let bitmap = reader
        .read_bytes(bitmap_len)
        .ok_or_else(|| malformed("truncated NULL bitmap", payload))?;

    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
            continue;
        }
        let value = decode_binary_value(&mut reader, column).ok_or_else(|| {
            malformed(
                format!("truncated or invalid binary value at column '{}'", column.name),
                payload,
            )
        })?;
        values.push(value);
    }
    Ok(values)
}

/// Response to COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

/// Parse COM_STMT_PREPARE_OK: 0x00, statement id, column count, parameter
/// count, filler, warning count.
pub fn parse_stmt_prepare_ok(payload: &[u8]) -> Result<StmtPrepareOk, ProtocolError> {
    read_prepare_ok(&mut PacketReader::new(payload))
        .ok_or_else(|| malformed("invalid COM_STMT_PREPARE response", payload))
}

fn read_prepare_ok(reader: &mut PacketReader<'_>) -> Option<StmtPrepareOk> {
    if reader.read_u8()? != 0x00 {
        return None;
    }
    let statement_id = reader.read_u32_le()?;
    let num_columns = reader.read_u16_le()?;
    let num_params = reader.read_u16_le()?;
    reader.skip(1);
    let warnings = reader.read_u16_le().unwrap_or(0);
    Some(StmtPrepareOk {
        statement_id,
        num_columns,
        num_params,
        warnings,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::PacketWriter;
    use crate::types::column_flags;

    pub(crate) fn column_def_payload(name: &str, type_code: u8, flags: u16) -> Vec<u8> {
        let mut w = PacketWriter::new();
        for part in ["def", "test", "t", "t", name, name] {
            w.write_lenenc_string(part);
        }
        w.write_lenenc_int(0x0c);
        w.write_u16_le(45);
        w.write_u32_le(11);
        w.write_u8(type_code);
        w.write_u16_le(flags);
        w.write_u8(0);
        w.write_zeros(2);
        w.into_bytes()
    }

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("a", FieldType::Long),
            ColumnDef::new("b", FieldType::VarString),
            ColumnDef::new("c", FieldType::LongLong).with_flags(column_flags::UNSIGNED),
        ]
    }

    #[test]
    fn test_result_header_variants() {
        assert!(matches!(
            decode_result_header(&[0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00]),
            Ok(ResultHeader::Ok(ok)) if ok.affected_rows == 1
        ));
        assert!(matches!(
            decode_result_header(b"\xFF\x15\x04#28000denied"),
            Ok(ResultHeader::Err(err)) if err.error_code == 1045
        ));
        assert_eq!(
            decode_result_header(&[0x03]).unwrap(),
            ResultHeader::ColumnCount(3)
        );
        assert_eq!(
            decode_result_header(b"\xFBsecrets.txt").unwrap(),
            ResultHeader::LocalInfile(b"secrets.txt".to_vec())
        );
    }

    #[test]
    fn test_bad_column_count_is_malformed() {
        let payloads: [&[u8]; 3] = [&[], &[0xFC, 0x01], &[0x02, 0x00]];
        for payload in payloads {
            let err = decode_result_header(payload).unwrap_err();
            assert_eq!(err.kind, ProtocolErrorKind::Malformed);
        }
    }

    #[test]
    fn test_parse_column_def() {
        let payload = column_def_payload("id", 0x03, column_flags::NOT_NULL);
        let column = parse_column_def(&payload).unwrap();
        assert_eq!(column.name, "id");
        assert_eq!(column.schema, "test");
        assert_eq!(column.column_type, FieldType::Long);
        assert_eq!(column.charset, 45);
        assert!(!column.is_nullable());

        assert!(parse_column_def(&payload[..payload.len() - 6]).is_err());
    }

    #[test]
    fn test_unknown_type_code_kept() {
        let column = parse_column_def(&column_def_payload("g", 0x42, 0)).unwrap();
        assert_eq!(column.column_type, FieldType::String);
        assert_eq!(column.type_code, 0x42);
    }

    #[test]
    fn test_decode_text_row_with_null() {
        let payload = b"\x0242\xFB\x0218";
        let values = decode_text_row(payload, &columns()).unwrap();
        assert_eq!(values, vec![Value::Int(42), Value::Null, Value::UInt(18)]);
    }

    #[test]
    fn test_text_row_null_is_not_empty_string() {
        let cols = [ColumnDef::new("s", FieldType::VarString)];
        assert_eq!(decode_text_row(b"\x00", &cols).unwrap(), vec![Value::Text(String::new())]);
        assert_eq!(decode_text_row(b"\xFB", &cols).unwrap(), vec![Value::Null]);
    }

    #[test]
    fn test_truncated_text_row() {
        let err = decode_text_row(b"\x0242\x05ab", &columns()).unwrap_err();
        assert_eq!(err.kind, ProtocolErrorKind::Malformed);
    }

    #[test]
    fn test_decode_binary_row() {
        // columns: a=7, b=NULL, c=9
        let mut payload = vec![0x00, 0b0000_1000];
        payload.extend_from_slice(&7i32.to_le_bytes());
        payload.extend_from_slice(&9u64.to_le_bytes());
        let values = decode_binary_row(&payload, &columns()).unwrap();
        assert_eq!(values, vec![Value::Int(7), Value::Null, Value::UInt(9)]);

        assert!(decode_binary_row(&payload[..6], &columns()).is_err());
    }

    #[test]
    fn test_terminator_detection() {
        let eof = [0xFE, 0x00, 0x00, 0x22, 0x00];
        assert_eq!(
            decode_terminator(&eof, false).unwrap(),
            Some(EofPacket {
                warnings: 0,
                status_flags: 0x22
            })
        );

        let ok_as_eof = [0xFE, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00];
        let end = decode_terminator(&ok_as_eof, true).unwrap().unwrap();
        assert_eq!(end.status_flags, 2);
        assert_eq!(end.warnings, 1);

        // A long 0xFE packet is a row with an 8-byte length prefix
        let mut row = vec![0xFE];
        row.extend_from_slice(&[0; 9]);
        assert_eq!(decode_terminator(&row, false).unwrap(), None);
    }

    #[test]
    fn test_ok_terminator_with_info_string() {
        let mut ok = vec![0xFE, 0x00, 0x00, 0x22, 0x00, 0x00, 0x00];
        ok.extend_from_slice(b"Rows matched: 3  Changed: 0");
        let end = decode_terminator(&ok, true).unwrap().unwrap();
        assert_eq!(end.status_flags, 0x22);

        let cols = [ColumnDef::new("n", FieldType::LongLong)];
        let packet = decode_row_packet(&ok, &cols, false, true).unwrap();
        assert!(matches!(packet, RowPacket::End(eof) if eof.status_flags == 0x22));

        // Classic EOF framing still reads it as a row
        assert_eq!(decode_terminator(&ok, false).unwrap(), None);
    }

    #[test]
    fn test_row_packet_err() {
        let payload = b"\xFF\x25\x05#70100Query execution was interrupted";
        let packet = decode_row_packet(payload, &columns(), false, false).unwrap();
        assert!(matches!(packet, RowPacket::Err(e) if e.error_code == 1317));
    }

    #[test]
    fn test_binary_time_overflow_is_malformed() {
        let cols = [ColumnDef::new("t", FieldType::Time)];
        let payload = [0x00, 0x00, 8, 0, 0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3];
        let err = decode_binary_row(&payload, &cols).unwrap_err();
        assert_eq!(err.kind, ProtocolErrorKind::Malformed);
    }

    #[test]
    fn test_parse_stmt_prepare_ok() {
        let payload = [0x00, 1, 0, 0, 0, 2, 0, 3, 0, 0, 0, 0];
        let ok = parse_stmt_prepare_ok(&payload).unwrap();
        assert_eq!(ok.statement_id, 1);
        assert_eq!(ok.num_columns, 2);
        assert_eq!(ok.num_params, 3);
        assert!(parse_stmt_prepare_ok(&[0x00, 1]).is_err());
    }
}
