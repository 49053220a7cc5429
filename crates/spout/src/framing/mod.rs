//! Frame splitting: raw byte chunks in, candidate event payloads out.
//!
//! Each strategy is a `tokio_util::codec::Decoder` over a `BytesMut`. The
//! [`StreamSplitter`] owns one stream's buffer, charges every buffered byte to
//! the shared [`BufferBudget`] and keeps decoding past recoverable errors.

mod character;
mod length;
mod octet;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::Decoder;

pub use character::CharacterDelimitedDecoder;
pub use length::LengthDelimitedDecoder;
pub use octet::OctetCountingDecoder;

use crate::budget::BufferBudget;
use crate::error::{ConfigError, FramingError};
use crate::event::{Frame, RawChunk, SourceTag};

/// Framing method as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum FramingConfig {
    /// Every read is one frame.
    Bytes,
    CharacterDelimited {
        delimiter: char,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
    },
    NewlineDelimited {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
    },
    /// 4-byte big-endian length prefix. The prefix value is never capped here;
    /// the buffer budget bounds it instead.
    LengthDelimited,
    OctetCounting {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
    },
}

fn check_max_length(max_length: Option<usize>) -> Result<Option<usize>, ConfigError> {
    match max_length {
        Some(0) => Err(ConfigError::Zero {
            field: "max_length",
        }),
        other => Ok(other),
    }
}

impl FramingConfig {
    /// Validate options and produce a fresh framer.
    pub fn build(&self) -> Result<Framer, ConfigError> {
        Ok(match self {
            Self::Bytes => Framer::Bytes,
            Self::CharacterDelimited {
                delimiter,
                max_length,
            } => {
                if !delimiter.is_ascii() {
                    return Err(ConfigError::InvalidDelimiter(*delimiter));
                }
                Framer::CharacterDelimited(CharacterDelimitedDecoder::new(
                    *delimiter as u8,
                    check_max_length(*max_length)?,
                ))
            }
            Self::NewlineDelimited { max_length } => Framer::CharacterDelimited(
                CharacterDelimitedDecoder::newline(check_max_length(*max_length)?),
            ),
            Self::LengthDelimited => Framer::LengthDelimited(LengthDelimitedDecoder::new()),
            Self::OctetCounting { max_length } => {
                Framer::OctetCounting(OctetCountingDecoder::new(check_max_length(*max_length)?))
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Bytes => "bytes",
            Self::CharacterDelimited { .. } => "character_delimited",
            Self::NewlineDelimited { .. } => "newline_delimited",
            Self::LengthDelimited => "length_delimited",
            Self::OctetCounting { .. } => "octet_counting",
        }
    }
}

/// A configured framing strategy with its in-progress state.
#[derive(Debug, Clone)]
pub enum Framer {
    Bytes,
    CharacterDelimited(CharacterDelimitedDecoder),
    LengthDelimited(LengthDelimitedDecoder),
    OctetCounting(OctetCountingDecoder),
}

impl Framer {
    fn is_discarding(&self) -> bool {
        match self {
            Self::Bytes => false,
            Self::CharacterDelimited(d) => d.is_discarding(),
            Self::LengthDelimited(d) => d.is_discarding(),
            Self::OctetCounting(d) => d.is_discarding(),
        }
    }

    /// Back to the start-of-frame state.
    fn reset(&mut self) {
        match self {
            Self::Bytes => {}
            Self::CharacterDelimited(d) => {
                *d = CharacterDelimitedDecoder::new(d.delimiter(), d.max_length())
            }
            Self::LengthDelimited(d) => *d = LengthDelimitedDecoder::new(),
            Self::OctetCounting(d) => *d = OctetCountingDecoder::new(d.max_length()),
        }
    }

    /// `lost` bytes at the current position were dropped; skip to the next boundary.
    fn desync(&mut self, lost: usize) {
        match self {
            Self::Bytes => {}
            Self::CharacterDelimited(d) => d.desync(),
            Self::LengthDelimited(d) => d.desync(lost),
            Self::OctetCounting(d) => d.desync(lost),
        }
    }
}

impl Decoder for Framer {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        match self {
            Self::Bytes => {
                if buf.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(buf.split().freeze()))
                }
            }
            Self::CharacterDelimited(d) => d.decode(buf),
            Self::LengthDelimited(d) => d.decode(buf),
            Self::OctetCounting(d) => d.decode(buf),
        }
    }
}

/// Output of one splitting step.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitEvent {
    Frame(Frame),
    Error(FramingError),
}

/// One stream's splitter: buffer, framer and a share of the budget.
pub struct StreamSplitter {
    framer: Framer,
    source: SourceTag,
    buf: BytesMut,
    budget: Arc<BufferBudget>,
}

impl StreamSplitter {
    pub fn new(framer: Framer, source: SourceTag, budget: Arc<BufferBudget>) -> Self {
        Self {
            framer,
            source,
            buf: BytesMut::new(),
            budget,
        }
    }

    pub fn source(&self) -> SourceTag {
        self.source
    }

    /// Bytes received but not yet resolved into a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn push_chunk(&mut self, chunk: &RawChunk, out: &mut Vec<SplitEvent>) {
        self.push(&chunk.bytes, out);
    }

    /// Append a read and extract every complete frame.
    ///
    /// Bytes are only appended after the budget grants them. When the budget
    /// is exhausted the oldest unresolved data (this stream's buffer) is
    /// discarded; if the buffer is already empty the bytes that do not fit are.
    pub fn push(&mut self, mut chunk: &[u8], out: &mut Vec<SplitEvent>) {
        if matches!(self.framer, Framer::Bytes) {
            if !chunk.is_empty() {
                out.push(SplitEvent::Frame(Frame::new(
                    self.source,
                    Bytes::copy_from_slice(chunk),
                )));
            }
            return;
        }

        while !chunk.is_empty() {
            let granted = self.budget.reserve_up_to(chunk.len());
            if granted == 0 {
                let discarded = if self.buf.is_empty() {
                    let dropped = chunk.len();
                    chunk = &[];
                    dropped
                } else {
                    let dropped = self.buf.len();
                    self.buf.clear();
                    self.budget.release(dropped);
                    dropped
                };
                self.framer.desync(discarded);
                tracing::warn!(
                    stream = %self.source,
                    discarded,
                    budget = self.budget.max(),
                    "Buffer budget exceeded, discarding unresolved bytes"
                );
                out.push(SplitEvent::Error(FramingError::BufferOverflow { discarded }));
                continue;
            }

            self.buf.extend_from_slice(&chunk[..granted]);
            chunk = &chunk[granted..];
            self.drain(out);
        }
    }

    fn drain(&mut self, out: &mut Vec<SplitEvent>) {
        loop {
            let before = self.buf.len();
            let result = self.framer.decode(&mut self.buf);
            let consumed = before - self.buf.len();
            self.budget.release(consumed);

            match result {
                Ok(Some(bytes)) => {
                    tracing::trace!(stream = %self.source, frame_len = bytes.len(), "Frame split");
                    out.push(SplitEvent::Frame(Frame::new(self.source, bytes)));
                }
                Ok(None) => break,
                Err(e) => {
                    let stop = !e.can_continue() || consumed == 0;
                    out.push(SplitEvent::Error(e));
                    if stop {
                        break;
                    }
                }
            }
        }
    }

    /// The stream ended. An incomplete tail is discarded and reported.
    pub fn finish(&mut self, out: &mut Vec<SplitEvent>) {
        let buffered = self.buf.len();
        let discarding = self.framer.is_discarding();
        self.buf.clear();
        self.budget.release(buffered);
        self.framer.reset();
        if buffered > 0 && !discarding {
            out.push(SplitEvent::Error(FramingError::TruncatedFrame { buffered }));
        }
    }
}

impl Drop for StreamSplitter {
    fn drop(&mut self) {
        self.budget.release(self.buf.len());
    }
}
