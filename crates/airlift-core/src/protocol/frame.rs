//! Incremental codec for the length-prefixed frame layer.
//!
//! Wire format:
//! ```text
//! <decimal-ASCII length><CR><LF><payload: exactly `length` bytes>
//! ```
//! repeated back to back. The length prefix is self-delimiting, so no
//! escaping is applied to the payload. There is no upper bound on the payload
//! length other than available memory.
//!
//! The decoder is fed raw chunks exactly as they arrive from the socket.
//! Two frames arriving in a single chunk and one frame spread over many
//! chunks are both ordinary cases, not edge cases, and both are covered by
//! the tests below.

use thiserror::Error;

/// Longest accepted header: a `u64` has at most 20 decimal digits. Anything
/// longer cannot be a valid length and is rejected before the buffer grows.
const MAX_HEADER_DIGITS: usize = 20;

/// Errors produced while decoding the frame layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The length prefix was empty, non-numeric, or too long to be a length.
    /// The decoder is poisoned afterwards; the connection's read loop must
    /// stop and the owner decides whether to drop the connection.
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),
}

/// Encodes one payload into a complete frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let header = payload.len().to_string();
    let mut buf = Vec::with_capacity(header.len() + 2 + payload.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(payload);
    buf
}

/// Incremental decoder for a stream of frames.
///
/// Call [`FrameDecoder::feed`] with each chunk read from the connection and
/// drain the returned iterator. State carries over between calls, so a frame
/// may complete many chunks after its header arrived.
///
/// Invariant: `received_bytes() <= expected_len()` at all times; both reset
/// and the assembly buffer is cleared the moment a payload is yielded.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Header bytes seen so far, including the trailing CR/LF once present.
    header: Vec<u8>,
    /// Payload length parsed from the current header; `None` while the
    /// header is still incomplete.
    expected: Option<usize>,
    /// Payload bytes assembled so far for the current frame.
    assembled: Vec<u8>,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` to the decoder and returns a draining iterator over
    /// the payloads completed by it — zero or more per call.
    ///
    /// A `FrameError` is yielded at most once; the decoder is poisoned from
    /// that point on and ignores further input.
    pub fn feed<'a, 'b>(&'a mut self, chunk: &'b [u8]) -> Completed<'a, 'b> {
        Completed {
            decoder: self,
            chunk,
            pos: 0,
        }
    }

    /// Length declared by the current frame's header, if one has been parsed.
    pub fn expected_len(&self) -> Option<usize> {
        self.expected
    }

    /// Payload bytes received so far for the current frame.
    pub fn received_bytes(&self) -> usize {
        self.assembled.len()
    }

    /// Fraction of the current frame received, 0.0–1.0.
    ///
    /// NaN for a zero-length frame (0/0); callers forward the value as-is,
    /// since progress is legitimately undefined for an empty transfer.
    pub fn progress(&self) -> f64 {
        match self.expected {
            Some(expected) => self.assembled.len() as f64 / expected as f64,
            None => 0.0,
        }
    }

    /// True once a malformed header has been seen. All further input is
    /// ignored.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn parse_header(&mut self) -> Result<usize, FrameError> {
        let digits = &self.header[..self.header.len() - 2];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(FrameError::MalformedHeader(format!(
                "length prefix is not a decimal number: {:?}",
                String::from_utf8_lossy(digits)
            )));
        }
        // All-digit input can still overflow; treat that as malformed too.
        let text = std::str::from_utf8(digits)
            .map_err(|_| FrameError::MalformedHeader("length prefix is not UTF-8".into()))?;
        text.parse::<usize>().map_err(|_| {
            FrameError::MalformedHeader(format!("length prefix out of range: {text}"))
        })
    }
}

/// Draining iterator returned by [`FrameDecoder::feed`].
///
/// Yields `Ok(payload)` for each frame completed within the fed chunk and
/// `Err` once if the header is malformed.
pub struct Completed<'a, 'b> {
    decoder: &'a mut FrameDecoder,
    chunk: &'b [u8],
    pos: usize,
}

impl Iterator for Completed<'_, '_> {
    type Item = Result<Vec<u8>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        let dec = &mut *self.decoder;
        if dec.poisoned {
            return None;
        }

        loop {
            match dec.expected {
                // Awaiting the header: consume bytes until CRLF.
                None => {
                    let byte = match self.chunk.get(self.pos) {
                        Some(b) => *b,
                        None => return None,
                    };
                    self.pos += 1;
                    dec.header.push(byte);

                    if dec.header.ends_with(b"\r\n") {
                        match dec.parse_header() {
                            Ok(len) => {
                                dec.header.clear();
                                dec.expected = Some(len);
                                dec.assembled = Vec::with_capacity(len.min(64 * 1024));
                            }
                            Err(e) => {
                                dec.poisoned = true;
                                return Some(Err(e));
                            }
                        }
                    } else if dec.header.len() > MAX_HEADER_DIGITS + 2 {
                        dec.poisoned = true;
                        return Some(Err(FrameError::MalformedHeader(format!(
                            "no delimiter within {} bytes",
                            MAX_HEADER_DIGITS + 2
                        ))));
                    }
                }

                // Header known: accumulate payload bytes.
                Some(expected) => {
                    let missing = expected - dec.assembled.len();
                    if missing > 0 {
                        let available = self.chunk.len() - self.pos;
                        if available == 0 {
                            return None;
                        }
                        let take = missing.min(available);
                        dec.assembled
                            .extend_from_slice(&self.chunk[self.pos..self.pos + take]);
                        self.pos += take;
                    }
                    if dec.assembled.len() == expected {
                        let payload = std::mem::take(&mut dec.assembled);
                        dec.expected = None;
                        return Some(Ok(payload));
                    }
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
