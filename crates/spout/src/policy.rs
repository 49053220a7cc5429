//! Per-record processing policy.
//!
//! An optional [`RecordTransform`] sees every decoded record. Its verdict plus
//! the [`DropPolicy`] flags decide whether the record (or its original) is
//! emitted, rerouted to the dropped output, or discarded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decoding::CodecKind;
use crate::error::DecodeError;
use crate::event::{DecodedRecord, DropAnnotation, DroppedRecord, Frame, RecordMetadata};

/// Verdict of a transform on one record.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    Keep(DecodedRecord),
    Error(String),
    Abort(String),
}

/// Downstream per-record logic. The pipeline only relies on its verdict.
pub trait RecordTransform: Send + Sync {
    fn transform(&self, record: &DecodedRecord) -> TransformOutcome;
}

impl<F> RecordTransform for F
where
    F: Fn(&DecodedRecord) -> TransformOutcome + Send + Sync,
{
    fn transform(&self, record: &DecodedRecord) -> TransformOutcome {
        self(record)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropPolicy {
    /// Drop records the transform failed on. Otherwise the original is emitted.
    #[serde(default)]
    pub drop_on_error: bool,
    /// Drop records the transform aborted on. Otherwise the original is emitted.
    #[serde(default = "default_true")]
    pub drop_on_abort: bool,
    /// Send dropped records, annotated, to the dropped output instead of discarding.
    #[serde(default)]
    pub reroute_dropped: bool,
}

impl Default for DropPolicy {
    fn default() -> Self {
        Self {
            drop_on_error: false,
            drop_on_abort: true,
            reroute_dropped: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Emit(DecodedRecord),
    Reroute(DroppedRecord),
    Discard,
}

impl DropPolicy {
    pub fn apply(
        &self,
        transform: Option<&dyn RecordTransform>,
        record: DecodedRecord,
        component: &str,
    ) -> Disposition {
        let Some(transform) = transform else {
            return Disposition::Emit(record);
        };

        let (reason, message, drop) = match transform.transform(&record) {
            TransformOutcome::Keep(transformed) => return Disposition::Emit(transformed),
            TransformOutcome::Error(message) => ("error", message, self.drop_on_error),
            TransformOutcome::Abort(message) => ("abort", message, self.drop_on_abort),
        };

        if !drop {
            tracing::debug!(reason, error = %message, "Transform failed, emitting original record");
            return Disposition::Emit(record);
        }
        self.dropped(record, reason, message, component)
    }

    /// A frame the codec rejected. Only surfaces when rerouting is enabled.
    pub fn decode_failure(
        &self,
        frame: &Frame,
        codec: CodecKind,
        error: &DecodeError,
        received_at: DateTime<Utc>,
        component: &str,
    ) -> Disposition {
        let mut fields = serde_json::Map::new();
        fields.insert(
            "message".to_string(),
            String::from_utf8_lossy(&frame.bytes).into_owned().into(),
        );
        let record = DecodedRecord::new(
            fields,
            RecordMetadata {
                source: frame.source,
                codec,
                received_at,
            },
        );
        self.dropped(record, error.reason(), error.to_string(), component)
    }

    fn dropped(
        &self,
        record: DecodedRecord,
        reason: &str,
        message: String,
        component: &str,
    ) -> Disposition {
        if !self.reroute_dropped {
            return Disposition::Discard;
        }
        Disposition::Reroute(DroppedRecord {
            record,
            dropped: DropAnnotation {
                reason: reason.to_string(),
                message,
                component: component.to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::{Map, Value};

    use super::*;
    use crate::event::SourceTag;

    fn record(message: &str) -> DecodedRecord {
        let mut fields = Map::new();
        fields.insert("message".into(), Value::from(message));
        DecodedRecord::new(
            fields,
            RecordMetadata {
                source: SourceTag::Stdout,
                codec: CodecKind::Bytes,
                received_at: Utc::now(),
            },
        )
    }

    fn verdict(record: &DecodedRecord) -> TransformOutcome {
        match record.get("message").and_then(Value::as_str) {
            Some("bad") => TransformOutcome::Error("cannot parse".into()),
            Some("stop") => TransformOutcome::Abort("aborted".into()),
            _ => {
                let mut kept = record.clone();
                kept.insert("seen", true);
                TransformOutcome::Keep(kept)
            }
        }
    }

    #[test]
    fn defaults() {
        let policy: DropPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, DropPolicy::default());
        assert!(!policy.drop_on_error);
        assert!(policy.drop_on_abort);
        assert!(!policy.reroute_dropped);
    }

    fn transform() -> Option<&'static dyn RecordTransform> {
        let transform: &'static dyn RecordTransform = &verdict;
        Some(transform)
    }

    #[test]
    fn without_transform_everything_is_emitted() {
        let policy = DropPolicy::default();
        let bad = record("bad");
        assert_eq!(policy.apply(None, bad.clone(), "exec"), Disposition::Emit(bad));
    }

    #[test]
    fn kept_record_is_the_transformed_one() {
        let policy = DropPolicy::default();
        match policy.apply(transform(), record("ok"), "exec") {
            Disposition::Emit(r) => assert_eq!(r.get("seen"), Some(&Value::Bool(true))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_emits_original_by_default() {
        let policy = DropPolicy::default();
        match policy.apply(transform(), record("bad"), "exec") {
            Disposition::Emit(r) => {
                assert_eq!(r.get("message"), Some(&Value::from("bad")));
                assert_eq!(r.get("seen"), None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn abort_discards_by_default() {
        let policy = DropPolicy::default();
        assert_eq!(
            policy.apply(transform(), record("stop"), "exec"),
            Disposition::Discard
        );
    }

    #[test]
    fn abort_kept_when_drop_on_abort_disabled() {
        let policy = DropPolicy {
            drop_on_abort: false,
            ..Default::default()
        };
        assert!(matches!(
            policy.apply(transform(), record("stop"), "exec"),
            Disposition::Emit(_)
        ));
    }

    #[test]
    fn rerouted_records_are_annotated() {
        let policy = DropPolicy {
            drop_on_error: true,
            reroute_dropped: true,
            ..Default::default()
        };
        let Disposition::Reroute(dropped) = policy.apply(transform(), record("bad"), "my_source")
        else {
            panic!("expected reroute");
        };
        assert_eq!(
            dropped.dropped,
            DropAnnotation {
                reason: "error".into(),
                message: "cannot parse".into(),
                component: "my_source".into(),
            }
        );
        assert_eq!(dropped.record.get("message"), Some(&Value::from("bad")));
    }

    #[test]
    fn decode_failures_reroute_raw_frame() {
        let policy = DropPolicy {
            reroute_dropped: true,
            ..Default::default()
        };
        let frame = Frame::new(SourceTag::Stderr, Bytes::from_static(b"{oops\xFF"));
        let error = DecodeError::Json("expected value".into());
        let Disposition::Reroute(dropped) =
            policy.decode_failure(&frame, CodecKind::Json, &error, Utc::now(), "exec")
        else {
            panic!("expected reroute");
        };
        assert_eq!(dropped.dropped.reason, "invalid_json");
        assert_eq!(dropped.record.get("message"), Some(&Value::from("{oops\u{FFFD}")));
        assert_eq!(dropped.record.metadata.source, SourceTag::Stderr);

        assert_eq!(
            DropPolicy::default().decode_failure(&frame, CodecKind::Json, &error, Utc::now(), "exec"),
            Disposition::Discard
        );
    }
}
