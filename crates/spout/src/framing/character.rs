//! Delimiter-scanning framer, also used for newline framing.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::FramingError;

#[derive(Debug, Clone)]
pub struct CharacterDelimitedDecoder {
    delimiter: u8,
    max_length: Option<usize>,
    /// Where the next scan starts; bytes before it are known delimiter-free.
    next_index: usize,
    /// Dropping bytes up to and including the next delimiter.
    discarding: bool,
}

impl CharacterDelimitedDecoder {
    pub fn new(delimiter: u8, max_length: Option<usize>) -> Self {
        Self {
            delimiter,
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    pub fn newline(max_length: Option<usize>) -> Self {
        Self::new(b'\n', max_length)
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    /// Bytes at the current position were dropped; skip to the next delimiter.
    pub fn desync(&mut self) {
        self.next_index = 0;
        self.discarding = true;
    }
}

impl Decoder for CharacterDelimitedDecoder {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        loop {
            let start = self.next_index.min(buf.len());
            let found = buf[start..]
                .iter()
                .position(|b| *b == self.delimiter)
                .map(|offset| start + offset);

            match found {
                Some(pos) => {
                    self.next_index = 0;

                    if self.discarding {
                        buf.advance(pos + 1);
                        self.discarding = false;
                        continue;
                    }

                    if let Some(max_length) = self.max_length
                        && pos > max_length
                    {
                        buf.advance(pos + 1);
                        return Err(FramingError::FrameTooLarge {
                            length: pos,
                            max_length,
                        });
                    }

                    let frame = buf.split_to(pos).freeze();
                    buf.advance(1);
                    return Ok(Some(frame));
                }
                None => {
                    if self.discarding {
                        buf.clear();
                        self.next_index = 0;
                        return Ok(None);
                    }

                    if let Some(max_length) = self.max_length
                        && buf.len() > max_length
                    {
                        let length = buf.len();
                        buf.clear();
                        self.next_index = 0;
                        self.discarding = true;
                        return Err(FramingError::FrameTooLarge { length, max_length });
                    }

                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }
}
