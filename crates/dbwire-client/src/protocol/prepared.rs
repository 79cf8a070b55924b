//! Prepared statement (binary protocol) packets.
//!
//! 1. **Prepare**: COM_STMT_PREPARE with the SQL text. The server answers
//!    with a statement id, parameter and column counts, then the parameter
//!    definitions and column definitions (each block followed by an EOF
//!    unless `CLIENT_DEPRECATE_EOF` was negotiated).
//! 2. **Execute**: COM_STMT_EXECUTE with the statement id and binary
//!    parameters. The response is an OK packet or a binary result set.
//! 3. **Close**: COM_STMT_CLOSE with the statement id. No response.
//!
//! Builders here return unframed payloads; the transport adds headers.

use super::{CommandCode, PacketWriter};
use crate::codec::CodecRegistry;
use dbwire_core::Value;

/// Response from COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    /// Server-assigned statement identifier
    pub statement_id: u32,
    /// Number of columns in result set (0 for non-SELECT)
    pub num_columns: u16,
    /// Number of parameters (placeholders) in the SQL
    pub num_params: u16,
    /// Number of warnings generated during prepare
    pub warnings: u16,
}

/// Build a COM_STMT_PREPARE payload.
pub fn build_stmt_prepare_packet(sql: &str) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(1 + sql.len());
    writer.write_u8(CommandCode::StmtPrepare as u8);
    writer.write_bytes(sql.as_bytes());
    writer.into_bytes()
}

/// Build a COM_STMT_EXECUTE payload.
///
/// Layout:
/// - command byte (0x17)
/// - statement id (4 bytes)
/// - flags (1 byte, 0x00 = no cursor)
/// - iteration count (4 bytes, always 1)
/// - NULL bitmap, new-params-bound flag, type pairs and values (only when
///   the statement has parameters)
///
/// Parameter types are always re-sent so a statement re-prepared after a
/// reconnect needs no per-handle type memory.
pub fn build_stmt_execute_packet(
    statement_id: u32,
    params: &[Value],
    codecs: &dyn CodecRegistry,
) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(16 + params.len() * 16);

    writer.write_u8(CommandCode::StmtExecute as u8);
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

        // New params bound
        writer.write_u8(1);

        let mut values = PacketWriter::with_capacity(params.len() * 8);
        for param in params {
            let binding = codecs.encode_binary(param, &mut values);
            writer.write_u8(binding.field_type as u8);
            writer.write_u8(if binding.unsigned { 0x80 } else { 0x00 });
        }
        writer.write_bytes(values.as_bytes());
    }

    writer.into_bytes()
}

/// Build a COM_STMT_CLOSE payload. The server sends no response.
pub fn build_stmt_close_packet(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(5);
    writer.write_u8(CommandCode::StmtClose as u8);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// Parse a COM_STMT_PREPARE_OK response.
///
/// - status 0x00 (1 byte)
/// - statement id (4 bytes)
/// - number of columns (2 bytes)
/// - number of parameters (2 bytes)
/// - reserved (1 byte)
/// - warning count (2 bytes)
pub fn parse_stmt_prepare_ok(data: &[u8]) -> Option<StmtPrepareOk> {
    if data.len() < 12 || data[0] != 0x00 {
        return None;
    }

    Some(StmtPrepareOk {
        statement_id: u32::from_le_bytes([data[1], data[2], data[3], data[4]]),
        num_columns: u16::from_le_bytes([data[5], data[6]]),
        num_params: u16::from_le_bytes([data[7], data[8]]),
        warnings: u16::from_le_bytes([data[10], data[11]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DefaultCodecs;
    use crate::types::FieldType;

    #[test]
    fn test_build_stmt_prepare_packet() {
        let payload = build_stmt_prepare_packet("SELECT ?");
        assert_eq!(payload[0], 0x16);
        assert_eq!(&payload[1..], b"SELECT ?");
    }

    #[test]
    fn test_build_stmt_execute_packet_no_params() {
        let payload = build_stmt_execute_packet(7, &[], &DefaultCodecs);
        assert_eq!(payload, vec![0x17, 7, 0, 0, 0, 0x00, 1, 0, 0, 0]);
    }

    #[test]
    fn test_build_stmt_execute_packet_with_params() {
        let params = [Value::Int(42), Value::Null, Value::Text("hi".to_string())];
        let payload = build_stmt_execute_packet(1, &params, &DefaultCodecs);

        // header: cmd + id + flags + iterations
        let rest = &payload[10..];
        // NULL bitmap: param 1 is null
        assert_eq!(rest[0], 0b0000_0010);
        // new params bound
        assert_eq!(rest[1], 1);
        // types
        assert_eq!(rest[2], FieldType::Long as u8);
        assert_eq!(rest[4], FieldType::Null as u8);
        assert_eq!(rest[6], FieldType::VarString as u8);
        // values: 42 as i32 LE, then lenenc "hi"
        assert_eq!(&rest[8..12], &42i32.to_le_bytes());
        assert_eq!(&rest[12..], &[2, b'h', b'i']);
    }

    #[test]
    fn test_build_stmt_close_packet() {
        assert_eq!(build_stmt_close_packet(0x0102_0304), vec![0x19, 4, 3, 2, 1]);
    }

    #[test]
    fn test_parse_stmt_prepare_ok() {
        let data = [0x00, 5, 0, 0, 0, 2, 0, 3, 0, 0x00, 1, 0];
        let ok = parse_stmt_prepare_ok(&data).unwrap();
        assert_eq!(ok.statement_id, 5);
        assert_eq!(ok.num_columns, 2);
        assert_eq!(ok.num_params, 3);
        assert_eq!(ok.warnings, 1);

        assert!(parse_stmt_prepare_ok(&data[..8]).is_none());
        let mut not_ok = data;
        not_ok[0] = 0xFF;
        assert!(parse_stmt_prepare_ok(&not_ok).is_none());
    }
}
