//! Payload decoding.

use serde_json::{Map, Value};

use crate::error::DecodeError;

/// Turns a raw notification payload into a field mapping.
#[cfg_attr(test, mockall::automock)]
pub trait PayloadDecoder: Send + Sync {
    /// Decode one payload.
    fn decode(&self, payload: &[u8]) -> Result<Map<String, Value>, DecodeError>;
}

/// Decodes UTF-8 text holding a JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl PayloadDecoder for JsonDecoder {
    fn decode(&self, payload: &[u8]) -> Result<Map<String, Value>, DecodeError> {
        let text = std::str::from_utf8(payload)?;

        match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => Ok(map),
            other => Err(DecodeError::NotAnObject {
                found: kind(&other),
            }),
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
