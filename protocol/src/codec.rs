//! Delimiter framing over a raw byte stream
//!
//! Frames are terminated by [`DELIMITER`]. A read may end mid-frame, so the
//! decoder keeps partial input buffered until the rest arrives. When the peer
//! closes the stream, whatever is left is emitted as a final frame even if
//! its delimiter never came.

use crate::error::ProtocolError;
use crate::message::Message;
use crate::{DEFAULT_MAX_FRAME_LEN, DELIMITER};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Decodes delimiter-terminated text frames and encodes [`Message`]s
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
    /// Where to resume the delimiter search in the buffered bytes
    next_index: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            next_index: 0,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn take_frame(&mut self, src: &mut BytesMut, len: usize) -> String {
        let frame = src.split_to(len);
        self.next_index = 0;
        String::from_utf8_lossy(&frame).into_owned()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER.as_bytes())
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        loop {
            let start = self.next_index.min(src.len());

            match find_delimiter(&src[start..]) {
                Some(offset) => {
                    let end = start + offset;
                    if end > self.max_frame_len {
                        return Err(ProtocolError::FrameTooLong {
                            max: self.max_frame_len,
                        });
                    }

                    let frame = self.take_frame(src, end);
                    src.advance(DELIMITER.len());

                    // Doubled delimiters carry nothing
                    if frame.is_empty() {
                        continue;
                    }
                    return Ok(Some(frame));
                }
                None => {
                    if src.len() > self.max_frame_len + DELIMITER.len() {
                        return Err(ProtocolError::FrameTooLong {
                            max: self.max_frame_len,
                        });
                    }

                    // A delimiter may straddle the next read
                    self.next_index = src.len().saturating_sub(DELIMITER.len() - 1);
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }

        let len = src.len();
        let remainder = self.take_frame(src, len);

        // Tolerate a delimiter whose trailing space never arrived
        let remainder = remainder
            .strip_suffix(DELIMITER.trim_end())
            .unwrap_or(&remainder);

        if remainder.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(remainder.to_string()))
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let frame = item.encode_frame();
        dst.reserve(frame.len());
        dst.put_slice(frame.as_bytes());
        Ok(())
    }
}
