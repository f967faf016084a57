use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

use crate::{IngestError, RawRecord};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

pub const DEFAULT_MAX_RECORD_BYTES: usize = 8 << 20; // 8 MiB

/// Re-encodes a non-UTF-8 byte stream as UTF-8, chunk by chunk.
pub struct Utf8Transcoder {
    decoder: encoding_rs::Decoder,
    finished: bool,
}

impl Utf8Transcoder {
    pub fn new(encoding: &'static encoding_rs::Encoding) -> Self {
        Self {
            decoder: encoding.new_decoder_with_bom_removal(),
            finished: false,
        }
    }

    fn transcode(&mut self, src: &mut BytesMut, last: bool) -> Option<BytesMut> {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(src.len())
            .unwrap_or_else(|| src.len() * 3 + 16);
        let mut out = BytesMut::zeroed(capacity);
        // With replacement enabled the decoder always takes the whole input and
        // buffers a split multi-byte sequence internally.
        let (_result, read, written, _replaced) =
            self.decoder.decode_to_utf8(&src[..], &mut out[..], last);
        src.advance(read);
        out.truncate(written);
        (!out.is_empty()).then_some(out)
    }
}

impl Decoder for Utf8Transcoder {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        Ok(self.transcode(src, false))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.finished {
            buf.clear();
            return Ok(None);
        }
        self.finished = true;
        Ok(self.transcode(buf, true))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Open,
    FirstOrClose,
    Element,
    SeparatorOrClose,
    End,
}

impl Expect {
    fn describe(self) -> &'static str {
        match self {
            Expect::Open => "'['",
            Expect::FirstOrClose => "'{' or ']'",
            Expect::Element => "'{'",
            Expect::SeparatorOrClose => "',' or ']'",
            Expect::End => "end of stream",
        }
    }
}

/// Brace depth tracking for one `{...}` element, resumable across reads.
#[derive(Debug, Default)]
struct ElementScan {
    depth: usize,
    in_string: bool,
    escaped: bool,
    cursor: usize,
}

impl ElementScan {
    /// Length of the element once its closing brace has been seen.
    fn advance(&mut self, buf: &[u8]) -> Option<usize> {
        while self.cursor < buf.len() {
            let b = buf[self.cursor];
            self.cursor += 1;
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Some(self.cursor);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

/// Decodes a top-level JSON array of objects into one `RawRecord` per element
/// without holding more than the current element in memory.
#[derive(Debug)]
pub struct JsonArrayDecoder {
    expect: Expect,
    element: Option<ElementScan>,
    consumed: u64,
    max_record_bytes: usize,
}

impl JsonArrayDecoder {
    pub fn new(max_record_bytes: usize) -> Self {
        Self {
            expect: Expect::Open,
            element: None,
            consumed: 0,
            max_record_bytes,
        }
    }

    /// Bytes of the stream fully consumed so far.
    pub fn offset(&self) -> u64 {
        self.consumed
    }

    fn bump(&mut self, src: &mut BytesMut, n: usize) {
        src.advance(n);
        self.consumed += n as u64;
    }

    fn skip_whitespace(&mut self, src: &mut BytesMut) {
        let n = src
            .iter()
            .take_while(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
            .count();
        self.bump(src, n);
    }

    fn unexpected(&self, found: u8) -> IngestError {
        let found = if found.is_ascii_graphic() {
            format!("'{}'", found as char)
        } else {
            format!("byte 0x{found:02x}")
        };
        IngestError::Decode {
            offset: self.consumed,
            reason: format!("expected {}, found {found}", self.expect.describe()),
        }
    }
}

impl Default for JsonArrayDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORD_BYTES)
    }
}

impl Decoder for JsonArrayDecoder {
    type Item = RawRecord;
    type Error = IngestError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawRecord>, IngestError> {
        loop {
            if let Some(scan) = self.element.as_mut() {
                let Some(len) = scan.advance(&src[..]) else {
                    if src.len() > self.max_record_bytes {
                        return Err(IngestError::RecordTooLarge {
                            offset: self.consumed,
                            limit: self.max_record_bytes,
                        });
                    }
                    return Ok(None);
                };
                let offset = self.consumed;
                let bytes = src.split_to(len);
                self.consumed += len as u64;
                self.element = None;
                self.expect = Expect::SeparatorOrClose;
                return serde_json::from_slice::<RawRecord>(&bytes)
                    .map(Some)
                    .map_err(|source| IngestError::Record { offset, source });
            }

            if self.expect == Expect::Open && self.consumed == 0 {
                let partial_bom = !src.is_empty() && src.len() < UTF8_BOM.len();
                if partial_bom && UTF8_BOM.starts_with(&src[..]) {
                    return Ok(None);
                }
                if src.starts_with(UTF8_BOM) {
                    self.bump(src, UTF8_BOM.len());
                }
            }

            self.skip_whitespace(src);
            let Some(&b) = src.first() else {
                return Ok(None);
            };
            match (self.expect, b) {
                (Expect::Open, b'[') => {
                    self.bump(src, 1);
                    self.expect = Expect::FirstOrClose;
                }
                (Expect::FirstOrClose | Expect::SeparatorOrClose, b']') => {
                    self.bump(src, 1);
                    self.expect = Expect::End;
                }
                (Expect::FirstOrClose | Expect::Element, b'{') => {
                    self.element = Some(ElementScan::default());
                }
                (Expect::SeparatorOrClose, b',') => {
                    self.bump(src, 1);
                    self.expect = Expect::Element;
                }
                (_, other) => return Err(self.unexpected(other)),
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<RawRecord>, IngestError> {
        match self.decode(buf)? {
            Some(record) => Ok(Some(record)),
            None if self.expect == Expect::End && self.element.is_none() => Ok(None),
            None => Err(IngestError::Truncated {
                offset: self.consumed + buf.len() as u64,
            }),
        }
    }
}
