//! MySQL type system and type conversion.
//!
//! This module provides:
//! - MySQL field type codes and column flags
//! - Decoding of text and binary protocol values into [`Value`]
//! - Binary encoding of statement parameters
//! - SQL literal escaping for client-side parameter interpolation
//!
//! # Decoding policy
//!
//! Integers widen to `Int(i64)`, or `UInt(u64)` when the column carries the
//! UNSIGNED flag. DECIMAL keeps its text so no precision is lost. Dates and
//! times decode to their canonical text form in both protocols, so a value
//! reads the same whichever protocol fetched it.

#![allow(clippy::cast_possible_truncation)]

use std::fmt::Write as _;

use sqlwire_core::Value;

use crate::protocol::{PacketReader, PacketWriter, charset};

/// MySQL field type codes.
///
/// These are the `MYSQL_TYPE_*` constants from the MySQL C API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from its wire code.
    ///
    /// Codes this client does not know decode as strings; the raw code stays
    /// available on [`ColumnDef::type_code`].
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, FieldType::Float | FieldType::Double)
    }

    #[must_use]
    pub const fn is_decimal(self) -> bool {
        matches!(self, FieldType::Decimal | FieldType::NewDecimal)
    }

    #[must_use]
    pub const fn is_string(self) -> bool {
        matches!(
            self,
            FieldType::VarChar
                | FieldType::VarString
                | FieldType::String
                | FieldType::Enum
                | FieldType::Set
        )
    }

    /// Binary payloads: blobs, geometry and bit fields.
    #[must_use]
    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
                | FieldType::Bit
        )
    }

    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }

    /// SQL name of the type.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp | FieldType::Timestamp2 => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time | FieldType::Time2 => "TIME",
            FieldType::DateTime | FieldType::DateTime2 => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// Column descriptor from a result set.
///
/// Produced once per result set and shared by every row decoded from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Schema (database) name
    pub schema: String,
    /// Table name (or alias)
    pub table: String,
    /// Original table name
    pub org_table: String,
    /// Column name (or alias)
    pub name: String,
    /// Original column name
    pub org_name: String,
    /// Character set number
    pub charset: u16,
    /// Display length hint
    pub column_length: u32,
    /// Decoded column type
    pub column_type: FieldType,
    /// Raw type code as sent by the server
    pub type_code: u8,
    /// Column flags
    pub flags: u16,
    /// Decimal scale
    pub decimals: u8,
}

impl ColumnDef {
    /// Build a descriptor with just a name and type.
    ///
    /// Blob-like types get the binary charset, everything else utf8mb4.
    pub fn new(name: impl Into<String>, column_type: FieldType) -> Self {
        let charset = if column_type.is_blob() {
            charset::BINARY
        } else {
            charset::DEFAULT_CHARSET
        };
        Self {
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: name.into(),
            org_name: String::new(),
            charset: u16::from(charset),
            column_length: 0,
            column_type,
            type_code: column_type as u8,
            flags: 0,
            decimals: 0,
        }
    }

    /// Set flags (builder style).
    #[must_use]
    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn is_nullable(&self) -> bool {
        self.flags & column_flags::NOT_NULL == 0
    }

    #[must_use]
    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    #[must_use]
    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    /// Check if the column uses the binary charset.
    ///
    /// The BINARY flag alone is not enough: `_bin` collations set it on
    /// ordinary text columns.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        self.charset == charset::BINARY as u16
    }

    /// Whether values of this column decode to bytes rather than text.
    ///
    /// TEXT columns share the BLOB type codes and differ only in charset.
    #[must_use]
    pub const fn holds_bytes(&self) -> bool {
        match self.column_type {
            FieldType::Bit | FieldType::Geometry => true,
            ft if ft.is_blob() || ft.is_string() => self.is_binary(),
            _ => false,
        }
    }
}

/// Decode a text protocol value.
///
/// In the text protocol every non-NULL value arrives as a string; NULL is
/// handled by the row decoder before this is called.
pub fn decode_text_value(column: &ColumnDef, data: &[u8]) -> Value {
    let field_type = column.column_type;

    if column.holds_bytes() {
        return Value::Bytes(data.to_vec());
    }

    let text = String::from_utf8_lossy(data);

    if field_type.is_integer() {
        let parsed = if column.is_unsigned() {
            text.parse::<u64>().ok().map(Value::UInt)
        } else {
            text.parse::<i64>().ok().map(Value::Int)
        };
        return parsed.unwrap_or_else(|| Value::Text(text.into_owned()));
    }

    match field_type {
        FieldType::Float => text
            .parse::<f32>()
            .map_or_else(|_| Value::Text(text.into_owned()), Value::Float),
        FieldType::Double => text
            .parse::<f64>()
            .map_or_else(|_| Value::Text(text.into_owned()), Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text.into_owned()),
        FieldType::Json => serde_json::from_str(&text)
            .map_or_else(|_| Value::Text(text.into_owned()), Value::Json),
        FieldType::Null => Value::Null,
        _ => Value::Text(text.into_owned()),
    }
}

/// Decode one binary protocol value from a row payload.
///
/// Returns `None` when the payload is shorter than the type requires.
pub fn decode_binary_value(reader: &mut PacketReader<'_>, column: &ColumnDef) -> Option<Value> {
    let unsigned = column.is_unsigned();
    let value = match column.column_type {
        FieldType::Tiny => {
            let b = reader.read_u8()?;
            if unsigned {
                Value::UInt(u64::from(b))
            } else {
                Value::Int(i64::from(b as i8))
            }
        }
        FieldType::Short | FieldType::Year => {
            let v = reader.read_u16_le()?;
            if unsigned {
                Value::UInt(u64::from(v))
            } else {
                Value::Int(i64::from(v as i16))
            }
        }
        FieldType::Long | FieldType::Int24 => {
            let v = reader.read_u32_le()?;
            if unsigned {
                Value::UInt(u64::from(v))
            } else {
                Value::Int(i64::from(v as i32))
            }
        }
        FieldType::LongLong => {
            let v = reader.read_u64_le()?;
            if unsigned {
                Value::UInt(v)
            } else {
                Value::Int(v as i64)
            }
        }
        FieldType::Float => Value::Float(reader.read_f32_le()?),
        FieldType::Double => Value::Double(reader.read_f64_le()?),
        FieldType::Null => Value::Null,
        ft if ft.is_temporal() => {
            let len = usize::from(reader.read_u8()?);
            let data = reader.read_bytes(len)?;
            Value::Text(decode_binary_temporal(ft, data)?)
        }
        ft => {
            let data = reader.read_lenenc_slice()?;
            match ft {
                FieldType::Decimal | FieldType::NewDecimal => {
                    Value::Decimal(String::from_utf8_lossy(data).into_owned())
                }
                FieldType::Json => serde_json::from_slice(data)
                    .map_or_else(|_| Value::Bytes(data.to_vec()), Value::Json),
                _ if column.holds_bytes() => Value::Bytes(data.to_vec()),
                _ => Value::Text(String::from_utf8_lossy(data).into_owned()),
            }
        }
    };
    Some(value)
}

/// Render binary date/time components in the text protocol's format.
///
/// `None` when the components cannot form a value.
fn decode_binary_temporal(field_type: FieldType, data: &[u8]) -> Option<String> {
    let text = match field_type {
        FieldType::Time | FieldType::Time2 => {
            if data.len() < 8 {
                return Some("00:00:00".to_string());
            }
            let sign = if data[0] != 0 { "-" } else { "" };
            let days = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
            let hours = days.checked_mul(24)?.checked_add(u32::from(data[5]))?;
            let mut out = format!("{sign}{hours:02}:{:02}:{:02}", data[6], data[7]);
            if data.len() >= 12 {
                let micros = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
                let _ = write!(out, ".{micros:06}");
            }
            out
        }
        FieldType::Date | FieldType::NewDate => {
            if data.len() < 4 {
                return Some("0000-00-00".to_string());
            }
            let year = u16::from_le_bytes([data[0], data[1]]);
            format!("{year:04}-{:02}-{:02}", data[2], data[3])
        }
        _ => {
            if data.len() < 4 {
                return Some("0000-00-00 00:00:00".to_string());
            }
            let year = u16::from_le_bytes([data[0], data[1]]);
            let mut out = format!("{year:04}-{:02}-{:02}", data[2], data[3]);
            let (h, m, s) = if data.len() >= 7 {
                (data[4], data[5], data[6])
            } else {
                (0, 0, 0)
            };
            let _ = write!(out, " {h:02}:{m:02}:{s:02}");
            if data.len() >= 11 {
                let micros = u32::from_le_bytes([data[7], data[8], data[9], data[10]]);
                let _ = write!(out, ".{micros:06}");
            }
            out
        }
    };
    Some(text)
}

/// Wire type of a statement parameter: field type plus the unsigned marker.
pub fn param_type(value: &Value) -> (FieldType, bool) {
    match value {
        Value::Null => (FieldType::Null, false),
        Value::Int(_) => (FieldType::LongLong, false),
        Value::UInt(_) => (FieldType::LongLong, true),
        Value::Float(_) => (FieldType::Float, false),
        Value::Double(_) => (FieldType::Double, false),
        Value::Decimal(_) => (FieldType::NewDecimal, false),
        Value::Text(_) => (FieldType::VarString, false),
        Value::Bytes(_) => (FieldType::Blob, false),
        Value::Json(_) => (FieldType::Json, false),
    }
}

/// Encode a parameter value for the binary protocol.
///
/// NULL writes nothing; it is carried in the NULL bitmap instead.
pub fn encode_binary_value(writer: &mut PacketWriter, value: &Value) {
    match value {
        Value::Null => {}
        Value::Int(i) => writer.write_u64_le(*i as u64),
        Value::UInt(u) => writer.write_u64_le(*u),
        Value::Float(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Double(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Decimal(s) | Value::Text(s) => writer.write_lenenc_string(s),
        Value::Bytes(b) => writer.write_lenenc_bytes(b),
        Value::Json(j) => writer.write_lenenc_string(&j.to_string()),
    }
}

/// Escape a string as a quoted MySQL literal.
fn escape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => result.push_str("''"),
            '\\' => result.push_str("\\\\"),
            '\0' => result.push_str("\\0"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\x1a' => result.push_str("\\Z"),
            _ => result.push(ch),
        }
    }
    result.push('\'');
    result
}

/// Escape bytes as a hex literal.
fn escape_bytes(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2 + 3);
    result.push_str("X'");
    for byte in data {
        let _ = write!(result, "{byte:02X}");
    }
    result.push('\'');
    result
}

fn format_float(f: f64) -> String {
    if f.is_finite() {
        f.to_string()
    } else {
        // MySQL has no literal for NaN or infinity
        "NULL".to_string()
    }
}

/// Format a value as an escaped MySQL SQL literal.
pub fn format_value_for_sql(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => format_float(f64::from(*f)),
        Value::Double(f) => format_float(*f),
        Value::Decimal(s) => escape_string(s),
        Value::Text(s) => escape_string(s),
        Value::Bytes(b) => escape_bytes(b),
        Value::Json(j) => escape_string(&j.to_string()),
    }
}

/// Copy a quoted section verbatim, honoring doubled-quote escapes.
fn copy_quoted(
    quote: char,
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    out: &mut String,
) {
    out.push(quote);
    while let Some(ch) = chars.next() {
        out.push(ch);
        if ch == '\\' && quote != '`' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else if ch == quote {
            if chars.peek() == Some(&quote) {
                chars.next();
                out.push(quote);
            } else {
                break;
            }
        }
    }
}

/// Interpolate `?` placeholders with escaped literals.
///
/// Placeholders inside string literals and quoted identifiers are left
/// alone. Returns `None` when the placeholder count and parameter count
/// differ.
pub fn interpolate_params(sql: &str, params: &[Value]) -> Option<String> {
    let mut result = String::with_capacity(sql.len() + params.len() * 16);
    let mut chars = sql.chars().peekable();
    let mut next_param = params.iter();

    while let Some(ch) = chars.next() {
        match ch {
            '?' => result.push_str(&format_value_for_sql(next_param.next()?)),
            '\'' | '"' | '`' => copy_quoted(ch, &mut chars, &mut result),
            _ => result.push(ch),
        }
    }

    if next_param.next().is_some() {
        return None;
    }
    Some(result)
}
