//! Data carried between pipeline stages.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::decoding::CodecKind;

/// Where a chunk of bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Stdout,
    Stderr,
    Subscription,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Subscription => "subscription",
        }
    }
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One read's worth of bytes.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub bytes: Bytes,
    pub source: SourceTag,
    pub received_at: DateTime<Utc>,
}

impl RawChunk {
    pub fn new(source: SourceTag, bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            source,
            received_at: Utc::now(),
        }
    }
}

/// One candidate event payload cut out of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub bytes: Bytes,
    pub source: SourceTag,
}

impl Frame {
    pub fn new(source: SourceTag, bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            source,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordMetadata {
    pub source: SourceTag,
    pub codec: CodecKind,
    pub received_at: DateTime<Utc>,
}

/// A structured record produced by a codec.
///
/// `metadata.source` always identifies the stream the record came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedRecord {
    pub fields: Map<String, Value>,
    pub metadata: RecordMetadata,
}

impl DecodedRecord {
    pub fn new(fields: Map<String, Value>, metadata: RecordMetadata) -> Self {
        Self { fields, metadata }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    /// Insert only when the payload did not already provide the field.
    pub fn insert_if_absent(&mut self, key: &str, value: impl Into<Value>) {
        if !self.fields.contains_key(key) {
            self.fields.insert(key.to_string(), value.into());
        }
    }

    /// Render as a single JSON object: payload fields plus the originating stream.
    pub fn to_json(&self) -> Value {
        let mut fields = self.fields.clone();
        fields
            .entry("stream")
            .or_insert_with(|| Value::String(self.metadata.source.as_str().to_string()));
        Value::Object(fields)
    }
}

/// Why a record left the main output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DropAnnotation {
    pub reason: String,
    pub message: String,
    pub component: String,
}

/// A record abandoned by the processing policy, forwarded to the dropped output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedRecord {
    pub record: DecodedRecord,
    pub dropped: DropAnnotation,
}

impl DroppedRecord {
    pub fn to_json(&self) -> Value {
        let mut value = self.record.to_json();
        if let Value::Object(ref mut map) = value
            && let Ok(annotation) = serde_json::to_value(&self.dropped)
        {
            map.insert("dropped".to_string(), annotation);
        }
        value
    }
}
