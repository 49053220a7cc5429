//! 4-byte big-endian length prefix framing.
//!
//! Same wire layout as `LengthDelimitedCodec` with a 4-byte length field, but
//! with explicit states so the splitter can skip the rest of a payload whose
//! beginning was discarded on overflow.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::FramingError;

const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Data(usize),
    Skip(usize),
}

#[derive(Debug, Clone)]
pub struct LengthDelimitedDecoder {
    state: State,
}

impl Default for LengthDelimitedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LengthDelimitedDecoder {
    pub fn new() -> Self {
        Self { state: State::Head }
    }

    pub fn is_discarding(&self) -> bool {
        matches!(self.state, State::Skip(_))
    }

    /// `lost` bytes at the current position were dropped.
    ///
    /// Mid-payload the remainder is skipped. A lost header cannot be recovered;
    /// the next bytes are read as a fresh header.
    pub fn desync(&mut self, lost: usize) {
        self.state = match self.state {
            State::Data(len) if lost < len => State::Skip(len - lost),
            State::Skip(remaining) if lost < remaining => State::Skip(remaining - lost),
            _ => State::Head,
        };
    }
}

impl Decoder for LengthDelimitedDecoder {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        loop {
            match self.state {
                State::Head => {
                    if buf.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let len = buf.get_u32() as usize;
                    tracing::trace!(frame_len = len, "Length prefix read");
                    self.state = State::Data(len);
                }
                State::Data(len) => {
                    // The prefix is untrusted; the buffer only grows as bytes arrive.
                    if buf.len() < len {
                        return Ok(None);
                    }
                    self.state = State::Head;
                    return Ok(Some(buf.split_to(len).freeze()));
                }
                State::Skip(remaining) => {
                    let n = remaining.min(buf.len());
                    buf.advance(n);
                    if n == remaining {
                        self.state = State::Head;
                    } else {
                        self.state = State::Skip(remaining - n);
                        return Ok(None);
                    }
                }
            }
        }
    }
}
