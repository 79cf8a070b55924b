//! Value codec registry.
//!
//! The engine never converts values itself; it asks the registry carried by
//! the [`Configuration`](crate::Configuration). Applications that need
//! custom column mappings supply their own registry, usually wrapping
//! [`DefaultCodecs`] and overriding a few column types.

use std::fmt::Debug;

use crate::protocol::PacketWriter;
use crate::types::{self, ColumnDef, ParamBinding};
use dbwire_core::Value;

/// Conversion between wire encodings and [`Value`]s.
pub trait CodecRegistry: Send + Sync + Debug {
    /// Decode one text-protocol column value (never NULL).
    fn decode_text(&self, column: &ColumnDef, data: &[u8]) -> Value;

    /// Decode one binary-protocol column value from the front of `data`,
    /// returning the value and the bytes consumed.
    fn decode_binary(&self, column: &ColumnDef, data: &[u8]) -> Option<(Value, usize)>;

    /// Encode a bound parameter for COM_STMT_EXECUTE.
    fn encode_binary(&self, value: &Value, writer: &mut PacketWriter) -> ParamBinding;

    /// Render a parameter as an SQL literal for client-side prepared
    /// statements.
    fn encode_literal(&self, value: &Value, no_backslash_escapes: bool) -> String;
}

/// The built-in codecs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCodecs;

impl CodecRegistry for DefaultCodecs {
    fn decode_text(&self, column: &ColumnDef, data: &[u8]) -> Value {
        types::decode_text_value(column, data)
    }

    fn decode_binary(&self, column: &ColumnDef, data: &[u8]) -> Option<(Value, usize)> {
        types::decode_binary_value(column, data)
    }

    fn encode_binary(&self, value: &Value, writer: &mut PacketWriter) -> ParamBinding {
        types::encode_binary_param(value, writer)
    }

    fn encode_literal(&self, value: &Value, no_backslash_escapes: bool) -> String {
        types::format_value_for_sql(value, no_backslash_escapes)
    }
}

/// Substitute parameters into `?` placeholders using a registry's literal
/// encoding. Returns `None` on a parameter count mismatch.
pub fn interpolate(
    codecs: &dyn CodecRegistry,
    sql: &str,
    params: &[Value],
    no_backslash_escapes: bool,
) -> Option<String> {
    let fragments = types::split_placeholders(sql);
    if fragments.len() != params.len() + 1 {
        return None;
    }
    let mut result = String::with_capacity(sql.len() + params.len() * 8);
    for (fragment, param) in fragments.iter().zip(params) {
        result.push_str(fragment);
        result.push_str(&codecs.encode_literal(param, no_backslash_escapes));
    }
    result.push_str(fragments[fragments.len() - 1]);
    Some(result)
}
