//! Octet-counted framing (RFC 6587 §3.4.1): `MSG-LEN SP MSG`.
//!
//! `MSG-LEN` is `NONZERO-DIGIT *DIGIT`. A header that does not match is a
//! malformed frame; the decoder drops bytes up to the next plausible
//! digit-space header and carries on from there.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::FramingError;

/// Headers longer than this cannot describe a frame we would ever buffer.
const MAX_HEADER_DIGITS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Payload(usize),
    Skip(usize),
    Resync,
}

enum Header {
    /// Length and number of header bytes including the space.
    Complete(usize, usize),
    Incomplete,
    Malformed(&'static str),
}

fn parse_header(buf: &[u8]) -> Header {
    match buf.first() {
        None => return Header::Incomplete,
        Some(b'1'..=b'9') => {}
        Some(_) => return Header::Malformed("length must start with a non-zero digit"),
    }

    let digits = buf.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits > MAX_HEADER_DIGITS {
        return Header::Malformed("length has too many digits");
    }
    match buf.get(digits) {
        None => Header::Incomplete,
        Some(b' ') => {
            let mut len: usize = 0;
            for b in &buf[..digits] {
                len = match len
                    .checked_mul(10)
                    .and_then(|n| n.checked_add((b - b'0') as usize))
                {
                    Some(n) => n,
                    None => return Header::Malformed("length overflows"),
                };
            }
            Header::Complete(len, digits + 1)
        }
        Some(_) => Header::Malformed("length not followed by a space"),
    }
}

/// Index of the next position that could begin a header, searching from `from`.
///
/// A candidate starts with a non-zero digit not preceded by another digit and
/// is followed by digits and a space, or by digits running to the end of the
/// buffer (the rest may arrive later).
fn find_header_start(buf: &[u8], from: usize) -> Option<usize> {
    (from..buf.len()).find(|&i| {
        if !matches!(buf[i], b'1'..=b'9') {
            return false;
        }
        if i > 0 && buf[i - 1].is_ascii_digit() {
            return false;
        }
        matches!(parse_header(&buf[i..]), Header::Complete(..) | Header::Incomplete)
    })
}

#[derive(Debug, Clone)]
pub struct OctetCountingDecoder {
    max_length: Option<usize>,
    state: State,
}

impl OctetCountingDecoder {
    pub fn new(max_length: Option<usize>) -> Self {
        Self {
            max_length,
            state: State::Header,
        }
    }

    pub fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    pub fn is_discarding(&self) -> bool {
        matches!(self.state, State::Skip(_) | State::Resync)
    }

    /// `lost` bytes at the current position were dropped.
    pub fn desync(&mut self, lost: usize) {
        self.state = match self.state {
            State::Payload(len) if lost < len => State::Skip(len - lost),
            State::Skip(remaining) if lost < remaining => State::Skip(remaining - lost),
            State::Payload(len) | State::Skip(len) if lost == len => State::Header,
            _ => State::Resync,
        };
    }

    /// Drop bytes up to the next header candidate. Returns the number dropped.
    fn resync(&mut self, buf: &mut BytesMut, from: usize) -> usize {
        match find_header_start(buf, from) {
            Some(start) => {
                buf.advance(start);
                self.state = State::Header;
                start
            }
            None => {
                let dropped = buf.len();
                buf.clear();
                self.state = State::Resync;
                dropped
            }
        }
    }
}

impl Decoder for OctetCountingDecoder {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        loop {
            match self.state {
                State::Header => match parse_header(buf) {
                    Header::Incomplete => return Ok(None),
                    Header::Complete(len, header_len) => {
                        buf.advance(header_len);
                        if let Some(max_length) = self.max_length
                            && len > max_length
                        {
                            self.state = State::Skip(len);
                            return Err(FramingError::FrameTooLarge {
                                length: len,
                                max_length,
                            });
                        }
                        self.state = State::Payload(len);
                    }
                    Header::Malformed(reason) => {
                        let discarded = self.resync(buf, 1);
                        return Err(FramingError::MalformedFraming {
                            discarded,
                            reason: reason.to_string(),
                        });
                    }
                },
                State::Payload(len) => {
                    if buf.len() < len {
                        return Ok(None);
                    }
                    self.state = State::Header;
                    return Ok(Some(buf.split_to(len).freeze()));
                }
                State::Skip(remaining) => {
                    let n = remaining.min(buf.len());
                    buf.advance(n);
                    if n < remaining {
                        self.state = State::Skip(remaining - n);
                        return Ok(None);
                    }
                    self.state = State::Header;
                }
                State::Resync => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let dropped = self.resync(buf, 0);
                    tracing::trace!(dropped, "Dropping bytes while resynchronizing");
                    if self.state == State::Resync {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut OctetCountingDecoder, buf: &mut BytesMut) -> Vec<Result<Bytes, FramingError>> {
        let mut out = Vec::new();
        loop {
            match decoder.decode(buf) {
                Ok(Some(frame)) => out.push(Ok(frame)),
                Ok(None) => break,
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }

    #[test]
    fn splits_counted_frames() {
        let mut decoder = OctetCountingDecoder::new(None);
        let mut buf = BytesMut::from(&b"5 hello6 world!"[..]);
        assert_eq!(
            drain(&mut decoder, &mut buf),
            vec![
                Ok(Bytes::from_static(b"hello")),
                Ok(Bytes::from_static(b"world!"))
            ]
        );
    }

    #[test]
    fn payload_may_contain_spaces_and_digits() {
        let mut decoder = OctetCountingDecoder::new(None);
        let mut buf = BytesMut::from(&b"11 12 34 56 78"[..]);
        assert_eq!(
            drain(&mut decoder, &mut buf),
            vec![Ok(Bytes::from_static(b"12 34 56 78"))]
        );
    }

    #[test]
    fn header_split_across_reads() {
        let mut decoder = OctetCountingDecoder::new(None);
        let mut buf = BytesMut::from(&b"1"[..]);
        assert!(drain(&mut decoder, &mut buf).is_empty());
        buf.extend_from_slice(b"2 hello");
        assert!(drain(&mut decoder, &mut buf).is_empty());
        buf.extend_from_slice(b", world");
        assert_eq!(
            drain(&mut decoder, &mut buf),
            vec![Ok(Bytes::from_static(b"hello, world"))]
        );
    }

    #[test]
    fn malformed_header_resyncs_to_next_candidate() {
        let mut decoder = OctetCountingDecoder::new(None);
        let mut buf = BytesMut::from(&b"xx3 abc2 hi"[..]);
        let out = drain(&mut decoder, &mut buf);
        assert_eq!(
            out,
            vec![
                Err(FramingError::MalformedFraming {
                    discarded: 2,
                    reason: "length must start with a non-zero digit".into()
                }),
                Ok(Bytes::from_static(b"abc")),
                Ok(Bytes::from_static(b"hi")),
            ]
        );
    }

    #[test]
    fn zero_length_is_malformed() {
        let mut decoder = OctetCountingDecoder::new(None);
        let mut buf = BytesMut::from(&b"0 4 good"[..]);
        let out = drain(&mut decoder, &mut buf);
        assert!(matches!(out[0], Err(FramingError::MalformedFraming { discarded: 2, .. })));
        assert_eq!(out[1], Ok(Bytes::from_static(b"good")));
    }

    #[test]
    fn garbage_without_candidate_is_dropped_until_one_arrives() {
        let mut decoder = OctetCountingDecoder::new(None);
        let mut buf = BytesMut::from(&b"abc"[..]);
        let out = drain(&mut decoder, &mut buf);
        assert_eq!(out.len(), 1);
        assert!(decoder.is_discarding());
        assert!(buf.is_empty());

        buf.extend_from_slice(b"more junk 2 ok");
        assert_eq!(drain(&mut decoder, &mut buf), vec![Ok(Bytes::from_static(b"ok"))]);
    }

    #[test]
    fn oversized_frame_is_skipped() {
        let mut decoder = OctetCountingDecoder::new(Some(4));
        let mut buf = BytesMut::from(&b"6 abc"[..]);
        assert_eq!(
            drain(&mut decoder, &mut buf),
            vec![Err(FramingError::FrameTooLarge {
                length: 6,
                max_length: 4
            })]
        );
        buf.extend_from_slice(b"def4 abcd");
        assert_eq!(drain(&mut decoder, &mut buf), vec![Ok(Bytes::from_static(b"abcd"))]);
    }

    #[test]
    fn frame_of_exactly_max_length_is_accepted() {
        let mut decoder = OctetCountingDecoder::new(Some(4));
        let mut buf = BytesMut::from(&b"4 abcd5 abcde2 ok"[..]);
        assert_eq!(
            drain(&mut decoder, &mut buf),
            vec![
                Ok(Bytes::from_static(b"abcd")),
                Err(FramingError::FrameTooLarge {
                    length: 5,
                    max_length: 4
                }),
                Ok(Bytes::from_static(b"ok")),
            ]
        );
    }

    #[test]
    fn desync_mid_payload_skips_remainder() {
        let mut decoder = OctetCountingDecoder::new(None);
        let mut buf = BytesMut::from(&b"10 abcd"[..]);
        assert!(drain(&mut decoder, &mut buf).is_empty());
        let lost = buf.len();
        buf.clear();
        decoder.desync(lost);

        buf.extend_from_slice(b"efghij3 xyz");
        assert_eq!(drain(&mut decoder, &mut buf), vec![Ok(Bytes::from_static(b"xyz"))]);
    }
}
