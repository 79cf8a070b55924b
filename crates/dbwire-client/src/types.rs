//! Wire type system and value conversion.
//!
//! - field type codes carried in column definitions and bound parameters
//! - column definition parsing
//! - text and binary protocol value decoding
//! - binary parameter encoding
//! - SQL literal formatting and `?` interpolation for client-side prepare

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{PacketReader, PacketWriter};
use dbwire_core::Value;

/// Field type codes (`MYSQL_TYPE_*`).
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
    /// Parse a field type from a byte. Unknown codes are treated as strings.
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

    /// Check if this is a date/time type.
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

    /// Check if this is a binary/blob type.
    #[must_use]
    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
        )
    }

    /// Fixed width of the binary encoding, or `None` for length-prefixed values.
    #[must_use]
    pub const fn binary_width(self) -> Option<usize> {
        match self {
            FieldType::Tiny => Some(1),
            FieldType::Short | FieldType::Year => Some(2),
            FieldType::Long | FieldType::Int24 | FieldType::Float => Some(4),
            FieldType::LongLong | FieldType::Double => Some(8),
            FieldType::Null => Some(0),
            _ => None,
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
}

/// Column definition from a result set or prepare response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Schema (database) name
    pub schema: String,
    /// Table name (or alias)
    pub table: String,
    /// Column name (or alias)
    pub name: String,
    /// Original column name
    pub org_name: String,
    /// Character set number
    pub charset: u16,
    /// Column length
    pub column_length: u32,
    /// Column type
    pub column_type: FieldType,
    /// Column flags
    pub flags: u16,
    /// Number of decimals
    pub decimals: u8,
}

impl ColumnDef {
    /// Parse a column definition packet (protocol 4.1 layout).
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut reader = PacketReader::new(data);
        let _catalog = reader.read_lenenc_bytes()?;
        let schema = reader.read_lenenc_string()?;
        let table = reader.read_lenenc_string()?;
        let _org_table = reader.read_lenenc_bytes()?;
        let name = reader.read_lenenc_string()?;
        let org_name = reader.read_lenenc_string()?;
        // Length of the fixed-size block (always 0x0C)
        let _fixed_len = reader.read_lenenc_int()?;
        let charset = reader.read_u16_le()?;
        let column_length = reader.read_u32_le()?;
        let column_type = FieldType::from_u8(reader.read_u8()?);
        let flags = reader.read_u16_le()?;
        let decimals = reader.read_u8()?;

        Some(Self {
            schema,
            table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    /// Check if the column is unsigned.
    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    /// Check if the column holds binary (not character) data.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        self.flags & column_flags::BINARY != 0 || self.charset == 63
    }
}

/// Decode a text protocol value.
///
/// Every value arrives as a string; the column type decides how to parse it.
/// Unparsable numbers are kept as text rather than dropped.
pub fn decode_text_value(column: &ColumnDef, data: &[u8]) -> Value {
    let text = String::from_utf8_lossy(data);
    let unsigned = column.is_unsigned();

    match column.column_type {
        FieldType::Tiny if unsigned => text
            .parse::<u8>()
            .map_or_else(|_| Value::Text(text.to_string()), |v| Value::SmallInt(i16::from(v))),
        FieldType::Tiny => text
            .parse::<i8>()
            .map_or_else(|_| Value::Text(text.to_string()), Value::TinyInt),
        FieldType::Short | FieldType::Year if unsigned => text
            .parse::<u16>()
            .map_or_else(|_| Value::Text(text.to_string()), |v| Value::Int(i32::from(v))),
        FieldType::Short | FieldType::Year => text
            .parse::<i16>()
            .map_or_else(|_| Value::Text(text.to_string()), Value::SmallInt),
        FieldType::Long | FieldType::Int24 if unsigned => text
            .parse::<u32>()
            .map_or_else(|_| Value::Text(text.to_string()), |v| Value::BigInt(i64::from(v))),
        FieldType::Long | FieldType::Int24 => text
            .parse::<i32>()
            .map_or_else(|_| Value::Text(text.to_string()), Value::Int),
        FieldType::LongLong if unsigned => text
            .parse::<u64>()
            .map_or_else(|_| Value::Text(text.to_string()), Value::from_u64),
        FieldType::LongLong => text
            .parse::<i64>()
            .map_or_else(|_| Value::Text(text.to_string()), Value::BigInt),
        FieldType::Float => text
            .parse::<f32>()
            .map_or_else(|_| Value::Text(text.to_string()), Value::Float),
        FieldType::Double => text
            .parse::<f64>()
            .map_or_else(|_| Value::Text(text.to_string()), Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text.into_owned()),
        FieldType::Bit => Value::Bytes(data.to_vec()),
        t if t.is_blob() && column.is_binary() => Value::Bytes(data.to_vec()),
        FieldType::Json => serde_json::from_str(&text)
            .map_or_else(|_| Value::Text(text.to_string()), Value::Json),
        FieldType::Null => Value::Null,
        _ if column.charset == 63 => Value::Bytes(data.to_vec()),
        _ => Value::Text(text.into_owned()),
    }
}

/// Decode one binary protocol value starting at the front of `data`.
///
/// Returns the value and the number of bytes consumed, or `None` when the
/// row is shorter than the value's encoding.
pub fn decode_binary_value(column: &ColumnDef, data: &[u8]) -> Option<(Value, usize)> {
    let unsigned = column.is_unsigned();
    let field_type = column.column_type;

    if let Some(width) = field_type.binary_width() {
        let bytes = data.get(..width)?;
        let value = match field_type {
            FieldType::Tiny if unsigned => Value::SmallInt(i16::from(bytes[0])),
            FieldType::Tiny => Value::TinyInt(bytes[0] as i8),
            FieldType::Short | FieldType::Year => {
                let raw = u16::from_le_bytes([bytes[0], bytes[1]]);
                if unsigned {
                    Value::Int(i32::from(raw))
                } else {
                    Value::SmallInt(raw as i16)
                }
            }
            FieldType::Long | FieldType::Int24 => {
                let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if unsigned {
                    Value::BigInt(i64::from(raw))
                } else {
                    Value::Int(raw as i32)
                }
            }
            FieldType::Float => {
                Value::Float(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            FieldType::LongLong => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                if unsigned {
                    Value::from_u64(u64::from_le_bytes(raw))
                } else {
                    Value::BigInt(i64::from_le_bytes(raw))
                }
            }
            FieldType::Double => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Value::Double(f64::from_le_bytes(raw))
            }
            _ => Value::Null,
        };
        return Some((value, width));
    }

    if field_type.is_temporal() {
        let len = usize::from(*data.first()?);
        let body = data.get(1..=len)?;
        return Some((Value::Text(decode_binary_datetime(field_type, body)), len + 1));
    }

    let mut reader = PacketReader::new(data);
    let len = usize::try_from(reader.read_lenenc_int()?).ok()?;
    let header = data.len() - reader.remaining();
    let body = reader.read_bytes(len)?;
    // The string rules are identical to the text protocol's
    Some((decode_text_value(column, body), header + len))
}

/// Decode binary date/time values to their canonical text form.
fn decode_binary_datetime(field_type: FieldType, data: &[u8]) -> String {
    match field_type {
        FieldType::Date | FieldType::NewDate => {
            if data.len() >= 4 {
                let year = u16::from_le_bytes([data[0], data[1]]);
                format!("{year:04}-{:02}-{:02}", data[2], data[3])
            } else {
                "0000-00-00".to_string()
            }
        }

        FieldType::Time | FieldType::Time2 => {
            if data.len() >= 8 {
                let sign = if data[0] != 0 { "-" } else { "" };
                let days = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                let hours = days * 24 + u32::from(data[5]);
                let base = format!("{sign}{hours:02}:{:02}:{:02}", data[6], data[7]);
                if data.len() >= 12 {
                    let micros = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
                    format!("{base}.{micros:06}")
                } else {
                    base
                }
            } else {
                "00:00:00".to_string()
            }
        }

        _ => {
            if data.len() >= 4 {
                let year = u16::from_le_bytes([data[0], data[1]]);
                let (hour, minute, second) = if data.len() >= 7 {
                    (data[4], data[5], data[6])
                } else {
                    (0, 0, 0)
                };
                let base = format!(
                    "{year:04}-{:02}-{:02} {hour:02}:{minute:02}:{second:02}",
                    data[2], data[3]
                );
                if data.len() >= 11 {
                    let micros = u32::from_le_bytes([data[7], data[8], data[9], data[10]]);
                    format!("{base}.{micros:06}")
                } else {
                    base
                }
            } else {
                "0000-00-00 00:00:00".to_string()
            }
        }
    }
}

/// Type information sent alongside a bound binary parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamBinding {
    pub field_type: FieldType,
    pub unsigned: bool,
}

/// Encode a parameter value for the binary protocol.
///
/// NULL writes nothing (it travels in the NULL bitmap).
pub fn encode_binary_param(value: &Value, writer: &mut PacketWriter) -> ParamBinding {
    let signed = |field_type| ParamBinding {
        field_type,
        unsigned: false,
    };
    match value {
        Value::Null => signed(FieldType::Null),
        Value::Bool(b) => {
            writer.write_u8(u8::from(*b));
            signed(FieldType::Tiny)
        }
        Value::TinyInt(i) => {
            writer.write_u8(*i as u8);
            signed(FieldType::Tiny)
        }
        Value::SmallInt(i) => {
            writer.write_u16_le(*i as u16);
            signed(FieldType::Short)
        }
        Value::Int(i) => {
            writer.write_u32_le(*i as u32);
            signed(FieldType::Long)
        }
        Value::BigInt(i) => {
            writer.write_u64_le(*i as u64);
            signed(FieldType::LongLong)
        }
        Value::UnsignedBigInt(u) => {
            writer.write_u64_le(*u);
            ParamBinding {
                field_type: FieldType::LongLong,
                unsigned: true,
            }
        }
        Value::Float(f) => {
            writer.write_bytes(&f.to_le_bytes());
            signed(FieldType::Float)
        }
        Value::Double(f) => {
            writer.write_bytes(&f.to_le_bytes());
            signed(FieldType::Double)
        }
        Value::Decimal(s) => {
            writer.write_lenenc_string(s);
            signed(FieldType::NewDecimal)
        }
        Value::Text(s) => {
            writer.write_lenenc_string(s);
            signed(FieldType::VarString)
        }
        Value::Bytes(b) => {
            writer.write_lenenc_bytes(b);
            signed(FieldType::Blob)
        }
        Value::Json(j) => {
            writer.write_lenenc_string(&j.to_string());
            signed(FieldType::Json)
        }
    }
}

/// Quote a string literal.
///
/// With `no_backslash_escapes` (server status `NO_BACKSLASH_ESCAPES`) only
/// quotes are doubled; otherwise control characters are backslash-escaped.
pub fn escape_string(s: &str, no_backslash_escapes: bool) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => result.push_str("''"),
            _ if no_backslash_escapes => result.push(ch),
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

/// Hex-literal form of binary data.
fn escape_bytes(data: &[u8]) -> String {
    use std::fmt::Write as _;

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
        "NULL".to_string()
    }
}

/// Format a value as an SQL literal.
pub fn format_value_for_sql(value: &Value, no_backslash_escapes: bool) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::TinyInt(i) => i.to_string(),
        Value::SmallInt(i) => i.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::UnsignedBigInt(u) => u.to_string(),
        Value::Float(f) => format_float(f64::from(*f)),
        Value::Double(f) => format_float(*f),
        Value::Decimal(s) => escape_string(s, no_backslash_escapes),
        Value::Text(s) => escape_string(s, no_backslash_escapes),
        Value::Bytes(b) => escape_bytes(b),
        Value::Json(j) => escape_string(&j.to_string(), no_backslash_escapes),
    }
}

/// Split SQL at its `?` placeholders.
///
/// Placeholders inside quoted strings, quoted identifiers and comments are
/// not split on. The result always has one more fragment than there are
/// placeholders.
pub fn split_placeholders(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut fragments = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'?' => {
                fragments.push(&sql[start..i]);
                start = i + 1;
                i += 1;
            }
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\\' && quote != b'`' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == quote {
                        // Doubled quote stays inside the literal
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 2;
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-')
                && bytes.get(i + 2).is_none_or(|b| b.is_ascii_whitespace()) =>
            {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    fragments.push(&sql[start.min(sql.len())..]);
    fragments
}

/// Count the `?` placeholders in SQL.
pub fn count_placeholders(sql: &str) -> usize {
    split_placeholders(sql).len() - 1
}

/// Substitute parameters into `?` placeholders as SQL literals.
///
/// Returns `None` when the parameter count does not match.
pub fn interpolate_params(
    sql: &str,
    params: &[Value],
    no_backslash_escapes: bool,
) -> Option<String> {
    let fragments = split_placeholders(sql);
    if fragments.len() != params.len() + 1 {
        return None;
    }
    let mut result = String::with_capacity(sql.len() + params.len() * 8);
    for (fragment, param) in fragments.iter().zip(params) {
        result.push_str(fragment);
        result.push_str(&format_value_for_sql(param, no_backslash_escapes));
    }
    result.push_str(fragments[fragments.len() - 1]);
    Some(result)
}
