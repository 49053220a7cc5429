//! Native interchange formats.
//!
//! `native` frames are one bincode-encoded [`NativeEvent`]; text travels as
//! raw bytes so the `lossy` flag decides what happens to invalid UTF-8.
//! `native_json` frames are `{"log": {...}}` objects or arrays of them.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use super::text;
use crate::error::DecodeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NativeValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Array(Vec<NativeValue>),
    Object(BTreeMap<String, NativeValue>),
}

impl From<&str> for NativeValue {
    fn from(s: &str) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }
}

impl From<i64> for NativeValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NativeEvent {
    Log(BTreeMap<String, NativeValue>),
}

fn config() -> bincode::config::Configuration {
    bincode::config::standard()
}

/// Encode one event as a `native` frame payload.
pub fn encode_native(event: &NativeEvent) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(event, config())
}

pub(super) fn decode(payload: &[u8], lossy: bool) -> Result<Vec<Map<String, Value>>, DecodeError> {
    let (event, read): (NativeEvent, usize) =
        bincode::serde::decode_from_slice(payload, config())
            .map_err(|e| DecodeError::Native(e.to_string()))?;
    if read != payload.len() {
        return Err(DecodeError::Native(format!(
            "{} trailing bytes after event",
            payload.len() - read
        )));
    }

    let NativeEvent::Log(fields) = event;
    fields
        .into_iter()
        .map(|(key, value)| Ok((key, to_json(value, lossy)?)))
        .collect::<Result<Map<_, _>, DecodeError>>()
        .map(|fields| vec![fields])
}

fn to_json(value: NativeValue, lossy: bool) -> Result<Value, DecodeError> {
    Ok(match value {
        NativeValue::Null => Value::Null,
        NativeValue::Boolean(b) => Value::Bool(b),
        NativeValue::Integer(n) => Value::from(n),
        NativeValue::Float(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        NativeValue::Bytes(bytes) => Value::String(text(&bytes, lossy)?.into_owned()),
        NativeValue::Timestamp(ts) => {
            Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        NativeValue::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| to_json(item, lossy))
                .collect::<Result<_, _>>()?,
        ),
        NativeValue::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| Ok((k, to_json(v, lossy)?)))
                .collect::<Result<_, DecodeError>>()?,
        ),
    })
}

pub(super) fn decode_json(
    payload: &[u8],
    lossy: bool,
) -> Result<Vec<Map<String, Value>>, DecodeError> {
    let text = text(payload, lossy)?;
    let value: Value =
        serde_json::from_str(&text).map_err(|e| DecodeError::Json(e.to_string()))?;
    match value {
        Value::Array(items) => items.into_iter().map(log_fields).collect(),
        other => Ok(vec![log_fields(other)?]),
    }
}

fn log_fields(value: Value) -> Result<Map<String, Value>, DecodeError> {
    match value {
        Value::Object(mut object) => match object.remove("log") {
            Some(Value::Object(fields)) => Ok(fields),
            Some(_) => Err(DecodeError::Native("`log` must be an object".into())),
            None => Err(DecodeError::Native("unsupported event type".into())),
        },
        _ => Err(DecodeError::Native("expected an event object".into())),
    }
}
