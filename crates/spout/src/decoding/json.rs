use serde_json::{Map, Value};

use super::{message, text};
use crate::error::DecodeError;

/// One JSON value per frame. Arrays yield one record per element; anything
/// that is not an object lands in `message`.
pub(super) fn decode(payload: &[u8], lossy: bool) -> Result<Vec<Map<String, Value>>, DecodeError> {
    let text = text(payload, lossy)?;
    // NDJSON streams routinely produce blank frames.
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let value: Value =
        serde_json::from_str(&text).map_err(|e| DecodeError::Json(e.to_string()))?;
    Ok(match value {
        Value::Array(items) => items.into_iter().map(into_fields).collect(),
        other => vec![into_fields(other)],
    })
}

fn into_fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(fields) => fields,
        other => message(other),
    }
}
