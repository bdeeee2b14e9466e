//! Column value conversion shared by the sqlx backends.

use serde::Serialize;
use serde_json::Value as JsonValue;

/// Nullable column into JSON.
pub(crate) fn column_value<T: Serialize>(value: Option<T>) -> JsonValue {
    value
        .and_then(|v| serde_json::to_value(v).ok())
        .unwrap_or(JsonValue::Null)
}

/// Binary column into JSON: UTF-8 payloads become strings, anything else an
/// array of byte values.
pub(crate) fn bytes_to_json(bytes: Vec<u8>) -> JsonValue {
    match String::from_utf8(bytes) {
        Ok(text) => JsonValue::String(text),
        Err(e) => JsonValue::Array(e.into_bytes().into_iter().map(JsonValue::from).collect()),
    }
}
