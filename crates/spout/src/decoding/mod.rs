//! Payload decoding: one frame in, zero or more structured records out.
//!
//! A decode failure only ever affects its own frame.

mod gelf;
mod json;
mod native;
mod raw;
mod syslog;

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use native::{NativeEvent, NativeValue, encode_native};

use crate::error::DecodeError;
use crate::event::{DecodedRecord, Frame, RecordMetadata};
use crate::framing::FramingConfig;

fn default_lossy() -> bool {
    true
}

/// Codec as configured. Every codec carries the `lossy` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "codec", rename_all = "snake_case")]
pub enum CodecConfig {
    Bytes {
        #[serde(default = "default_lossy")]
        lossy: bool,
    },
    Json {
        #[serde(default = "default_lossy")]
        lossy: bool,
    },
    Gelf {
        #[serde(default = "default_lossy")]
        lossy: bool,
    },
    Syslog {
        #[serde(default = "default_lossy")]
        lossy: bool,
    },
    Native {
        #[serde(default = "default_lossy")]
        lossy: bool,
    },
    NativeJson {
        #[serde(default = "default_lossy")]
        lossy: bool,
    },
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self::Bytes { lossy: true }
    }
}

impl CodecConfig {
    pub fn kind(&self) -> CodecKind {
        match self {
            Self::Bytes { .. } => CodecKind::Bytes,
            Self::Json { .. } => CodecKind::Json,
            Self::Gelf { .. } => CodecKind::Gelf,
            Self::Syslog { .. } => CodecKind::Syslog,
            Self::Native { .. } => CodecKind::Native,
            Self::NativeJson { .. } => CodecKind::NativeJson,
        }
    }

    pub fn lossy(&self) -> bool {
        match *self {
            Self::Bytes { lossy }
            | Self::Json { lossy }
            | Self::Gelf { lossy }
            | Self::Syslog { lossy }
            | Self::Native { lossy }
            | Self::NativeJson { lossy } => lossy,
        }
    }

    /// Framing used when none is configured.
    pub fn default_framing(&self) -> FramingConfig {
        match self {
            Self::Native { .. } => FramingConfig::LengthDelimited,
            Self::Gelf { .. } => FramingConfig::CharacterDelimited {
                delimiter: '\0',
                max_length: None,
            },
            _ => FramingConfig::NewlineDelimited { max_length: None },
        }
    }

    pub fn build(&self) -> PayloadDecoder {
        PayloadDecoder {
            kind: self.kind(),
            lossy: self.lossy(),
        }
    }
}

/// Which codec produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    Bytes,
    Json,
    Gelf,
    Syslog,
    Native,
    NativeJson,
}

impl CodecKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bytes => "bytes",
            Self::Json => "json",
            Self::Gelf => "gelf",
            Self::Syslog => "syslog",
            Self::Native => "native",
            Self::NativeJson => "native_json",
        }
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stateless frame decoder. Decoding the same frame twice yields the same records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadDecoder {
    kind: CodecKind,
    lossy: bool,
}

impl PayloadDecoder {
    pub fn new(kind: CodecKind, lossy: bool) -> Self {
        Self { kind, lossy }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    pub fn lossy(&self) -> bool {
        self.lossy
    }

    pub fn decode(&self, frame: &Frame, received_at: DateTime<Utc>) -> Result<Records, DecodeError> {
        let payload = &frame.bytes[..];
        let fields = match self.kind {
            CodecKind::Bytes => raw::decode(payload, self.lossy)?,
            CodecKind::Json => json::decode(payload, self.lossy)?,
            CodecKind::Gelf => gelf::decode(payload, self.lossy)?,
            CodecKind::Syslog => syslog::decode(payload, self.lossy, received_at)?,
            CodecKind::Native => native::decode(payload, self.lossy)?,
            CodecKind::NativeJson => native::decode_json(payload, self.lossy)?,
        };
        Ok(Records {
            fields: fields.into_iter(),
            metadata: RecordMetadata {
                source: frame.source,
                codec: self.kind,
                received_at,
            },
        })
    }
}

/// Records decoded from one frame.
///
/// The codec parses the whole frame up front; each [`DecodedRecord`] is only
/// assembled, with its metadata, as it is pulled.
#[derive(Debug)]
pub struct Records {
    fields: std::vec::IntoIter<Map<String, Value>>,
    metadata: RecordMetadata,
}

impl Iterator for Records {
    type Item = DecodedRecord;

    fn next(&mut self) -> Option<DecodedRecord> {
        self.fields
            .next()
            .map(|fields| DecodedRecord::new(fields, self.metadata.clone()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.fields.size_hint()
    }
}

impl ExactSizeIterator for Records {}

/// Text view of a payload. Lossy mode substitutes U+FFFD for invalid sequences.
pub(crate) fn text(payload: &[u8], lossy: bool) -> Result<Cow<'_, str>, DecodeError> {
    if lossy {
        Ok(String::from_utf8_lossy(payload))
    } else {
        std::str::from_utf8(payload)
            .map(Cow::Borrowed)
            .map_err(|e| DecodeError::InvalidUtf8 {
                valid_up_to: e.valid_up_to(),
            })
    }
}

/// Single `message` field record, used for scalars and raw text.
pub(crate) fn message(value: impl Into<Value>) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("message".to_string(), value.into());
    fields
}

#[cfg(test)]
mod tests {
    use ::bytes::Bytes;

    use super::*;
    use crate::event::SourceTag;

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn frame(bytes: &'static [u8]) -> Frame {
        Frame::new(SourceTag::Stdout, Bytes::from_static(bytes))
    }

    #[test]
    fn lossy_defaults_to_true() {
        let config: CodecConfig = serde_json::from_str(r#"{"codec": "json"}"#).unwrap();
        assert_eq!(config, CodecConfig::Json { lossy: true });

        let config: CodecConfig =
            serde_json::from_str(r#"{"codec": "native_json", "lossy": false}"#).unwrap();
        assert_eq!(config.kind(), CodecKind::NativeJson);
        assert!(!config.lossy());
    }

    #[test]
    fn unknown_codec_is_rejected() {
        assert!(serde_json::from_str::<CodecConfig>(r#"{"codec": "protobuf"}"#).is_err());
    }

    #[test]
    fn default_framing_follows_codec() {
        assert_eq!(
            CodecConfig::Native { lossy: true }.default_framing(),
            FramingConfig::LengthDelimited
        );
        assert_eq!(
            CodecConfig::Gelf { lossy: true }.default_framing(),
            FramingConfig::CharacterDelimited {
                delimiter: '\0',
                max_length: None
            }
        );
        assert_eq!(
            CodecConfig::Syslog { lossy: true }.default_framing(),
            FramingConfig::NewlineDelimited { max_length: None }
        );
    }

    #[test]
    fn strict_bytes_rejects_invalid_utf8() {
        let decoder = CodecConfig::Bytes { lossy: false }.build();
        let err = decoder.decode(&frame(b"\xFF\xFE"), at()).unwrap_err();
        assert_eq!(err, DecodeError::InvalidUtf8 { valid_up_to: 0 });
    }

    #[test]
    fn lossy_bytes_substitutes_replacement_character() {
        let decoder = CodecConfig::Bytes { lossy: true }.build();
        let records: Vec<_> = decoder.decode(&frame(b"\xFF\xFE"), at()).unwrap().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("message"), Some(&Value::from("\u{FFFD}\u{FFFD}")));
    }

    #[test]
    fn metadata_records_source_and_codec() {
        let decoder = CodecConfig::Json { lossy: true }.build();
        let frame = Frame::new(SourceTag::Stderr, Bytes::from_static(br#"[{"a":1},{"a":2}]"#));
        let records: Vec<_> = decoder.decode(&frame, at()).unwrap().collect();
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.metadata.source, SourceTag::Stderr);
            assert_eq!(record.metadata.codec, CodecKind::Json);
            assert_eq!(record.metadata.received_at, at());
        }
    }

    #[test]
    fn decoding_is_idempotent() {
        let payloads: &[(CodecConfig, &'static [u8])] = &[
            (CodecConfig::Bytes { lossy: true }, b"plain \xF0 text"),
            (CodecConfig::Json { lossy: true }, br#"{"k":[1,2,{"n":null}]}"#),
            (
                CodecConfig::Gelf { lossy: true },
                br#"{"version":"1.1","host":"h","short_message":"m","_x":1}"#,
            ),
            (
                CodecConfig::Syslog { lossy: true },
                b"<34>1 2003-10-11T22:14:15.003Z mymachine su - ID47 - 'su root' failed",
            ),
            (CodecConfig::Syslog { lossy: true }, b"<13>Feb  5 17:32:18 host app[12]: hi"),
            (CodecConfig::NativeJson { lossy: true }, br#"{"log":{"message":"x"}}"#),
        ];

        for (config, payload) in payloads {
            let decoder = config.build();
            let first: Vec<_> = decoder.decode(&frame(payload), at()).unwrap().collect();
            let second: Vec<_> = decoder.decode(&frame(payload), at()).unwrap().collect();
            assert_eq!(first, second, "codec {}", config.kind());
            assert!(!first.is_empty());
        }
    }

    #[test]
    fn records_iterator_reports_exact_size() {
        let decoder = CodecConfig::Json { lossy: true }.build();
        let records = decoder.decode(&frame(b"[1,2,3]"), at()).unwrap();
        assert_eq!(records.len(), 3);
    }
}
