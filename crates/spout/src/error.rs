//! Error taxonomy.
//!
//! Everything except [`ConfigError`] is recovered locally: a bad frame or a
//! failed launch is reported and the stream keeps going.

use std::path::PathBuf;

/// Fatal configuration problems, surfaced before any stream processing begins.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("command must not be empty")]
    EmptyCommand,

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("delimiter {0:?} is not a single-byte ASCII character")]
    InvalidDelimiter(char),

    #[error("working directory {} does not exist or is not a directory", .0.display())]
    WorkingDirectory(PathBuf),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-frame framing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("frame of {length} bytes exceeds maximum of {max_length}")]
    FrameTooLarge { length: usize, max_length: usize },

    #[error("stream ended with {buffered} bytes of an incomplete frame")]
    TruncatedFrame { buffered: usize },

    #[error("malformed frame header, discarded {discarded} bytes: {reason}")]
    MalformedFraming { discarded: usize, reason: String },

    #[error("buffer budget exceeded, discarded {discarded} unresolved bytes")]
    BufferOverflow { discarded: usize },

    #[error("read failed: {0}")]
    Io(String),
}

impl From<std::io::Error> for FramingError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl FramingError {
    /// Frame-local errors leave the splitter positioned at the next frame.
    pub fn can_continue(&self) -> bool {
        !matches!(self, Self::Io(_))
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::TruncatedFrame { .. } => "truncated_frame",
            Self::MalformedFraming { .. } => "malformed_framing",
            Self::BufferOverflow { .. } => "buffer_overflow",
            Self::Io(_) => "io",
        }
    }
}

/// Codec rejected a frame's payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid UTF-8 at byte {valid_up_to}")]
    InvalidUtf8 { valid_up_to: usize },

    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("invalid GELF message: {0}")]
    Gelf(String),

    #[error("unparseable syslog message: {0}")]
    Syslog(String),

    #[error("invalid native payload: {0}")]
    Native(String),
}

impl DecodeError {
    /// Stable reason code used in logs, stats and dropped-record annotations.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidUtf8 { .. } => "invalid_utf8",
            Self::Json(_) => "invalid_json",
            Self::Gelf(_) => "invalid_gelf",
            Self::Syslog(_) => "invalid_syslog",
            Self::Native(_) => "invalid_native",
        }
    }
}

/// OS process API failures.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Coordinator lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0} output already taken")]
    OutputTaken(&'static str),
    #[error("source task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_reason_codes_are_stable() {
        assert_eq!(
            FramingError::FrameTooLarge {
                length: 4,
                max_length: 3
            }
            .reason(),
            "frame_too_large"
        );
        assert_eq!(
            FramingError::TruncatedFrame { buffered: 2 }.reason(),
            "truncated_frame"
        );
        assert!(FramingError::BufferOverflow { discarded: 1 }.can_continue());
        assert!(!FramingError::Io("closed".into()).can_continue());
    }

    #[test]
    fn decode_error_display_includes_position() {
        let err = DecodeError::InvalidUtf8 { valid_up_to: 3 };
        assert_eq!(err.to_string(), "invalid UTF-8 at byte 3");
        assert_eq!(err.reason(), "invalid_utf8");
    }

    #[test]
    fn config_error_messages() {
        assert_eq!(
            ConfigError::Zero {
                field: "exec_interval_secs"
            }
            .to_string(),
            "exec_interval_secs must be greater than zero"
        );
        assert_eq!(
            ConfigError::InvalidDelimiter('é').to_string(),
            "delimiter 'é' is not a single-byte ASCII character"
        );
    }
}
