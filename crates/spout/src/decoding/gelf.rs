//! GELF 1.1 payloads: one JSON object per frame.
//!
//! `version`, `host` and `short_message` are mandatory. Additional fields
//! must be `_`-prefixed, match `[\w.-]+`, must not be `_id`, and may only
//! hold strings or numbers.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use super::text;
use crate::error::DecodeError;

const VERSION: &str = "1.1";

fn invalid(msg: impl Into<String>) -> DecodeError {
    DecodeError::Gelf(msg.into())
}

fn required_str<'a>(object: &'a Map<String, Value>, key: &str) -> Result<&'a str, DecodeError> {
    match object.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(invalid(format!("`{key}` must be a string"))),
        None => Err(invalid(format!("missing mandatory field `{key}`"))),
    }
}

fn valid_additional_name(name: &str) -> bool {
    name.len() > 1
        && name != "_id"
        && name[1..]
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '-')
}

pub(super) fn decode(payload: &[u8], lossy: bool) -> Result<Vec<Map<String, Value>>, DecodeError> {
    let text = text(payload, lossy)?;
    let object = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(object)) => object,
        Ok(_) => return Err(invalid("payload is not a JSON object")),
        Err(e) => return Err(invalid(e.to_string())),
    };

    let version = required_str(&object, "version")?;
    if version != VERSION {
        tracing::debug!(version, "Unexpected GELF version, decoding anyway");
    }
    required_str(&object, "host")?;
    required_str(&object, "short_message")?;

    let mut fields = Map::new();
    for (key, value) in object {
        match key.as_str() {
            "short_message" => {
                fields.insert("message".to_string(), value);
            }
            "version" | "host" => {
                fields.insert(key, value);
            }
            "full_message" | "facility" | "file" => {
                if !matches!(value, Value::String(_) | Value::Null) {
                    return Err(invalid(format!("`{key}` must be a string")));
                }
                fields.insert(key, value);
            }
            "line" => {
                if !matches!(value, Value::Number(_) | Value::Null) {
                    return Err(invalid("`line` must be a number"));
                }
                fields.insert(key, value);
            }
            "level" => match value.as_u64() {
                Some(level) if level <= 7 => {
                    fields.insert(key, value);
                }
                _ => return Err(invalid("`level` must be a syslog severity 0-7")),
            },
            "timestamp" => {
                let seconds = value
                    .as_f64()
                    .ok_or_else(|| invalid("`timestamp` must be a number"))?;
                let whole = seconds.floor();
                let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
                let ts = DateTime::<Utc>::from_timestamp(whole as i64, nanos)
                    .ok_or_else(|| invalid("`timestamp` out of range"))?;
                fields.insert(key, Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)));
            }
            _ if key.starts_with('_') => {
                if !valid_additional_name(&key) {
                    return Err(invalid(format!("invalid additional field name `{key}`")));
                }
                if !matches!(value, Value::String(_) | Value::Number(_)) {
                    return Err(invalid(format!("additional field `{key}` must be a string or number")));
                }
                fields.insert(key, value);
            }
            _ => {
                tracing::trace!(field = %key, "Ignoring non-standard GELF field");
            }
        }
    }
    Ok(vec![fields])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_standard_and_additional_fields() {
        let payload = br#"{
            "version": "1.1",
            "host": "example.org",
            "short_message": "A short message",
            "full_message": "Backtrace here",
            "timestamp": 1385053862.5,
            "level": 1,
            "_user_id": 9001,
            "_some_info": "foo"
        }"#;
        let records = decode(payload, false).unwrap();
        insta::assert_json_snapshot!(records[0], @r#"
        {
          "_some_info": "foo",
          "_user_id": 9001,
          "full_message": "Backtrace here",
          "host": "example.org",
          "level": 1,
          "message": "A short message",
          "timestamp": "2013-11-21T17:11:02.500Z",
          "version": "1.1"
        }
        "#);
    }

    #[test]
    fn missing_mandatory_field_fails() {
        let err = decode(br#"{"version":"1.1","short_message":"m"}"#, true).unwrap_err();
        assert_eq!(err, DecodeError::Gelf("missing mandatory field `host`".into()));
    }

    #[test]
    fn id_is_reserved() {
        let err = decode(
            br#"{"version":"1.1","host":"h","short_message":"m","_id":"x"}"#,
            true,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::Gelf(_)));
    }

    #[test]
    fn additional_values_must_be_scalar() {
        let err = decode(
            br#"{"version":"1.1","host":"h","short_message":"m","_tags":["a"]}"#,
            true,
        )
        .unwrap_err();
        assert_eq!(err.reason(), "invalid_gelf");
    }

    #[test]
    fn level_out_of_range_fails() {
        assert!(decode(
            br#"{"version":"1.1","host":"h","short_message":"m","level":9}"#,
            true
        )
        .is_err());
    }

    #[test]
    fn non_object_fails() {
        assert!(decode(b"[1]", true).is_err());
    }
}
