//! Framed codec for bridge communication.
//!
//! Splits the byte stream on the end-of-value marker and hands each body to
//! the protocol parser. Works over any AsyncRead/AsyncWrite (pipes, stdio,
//! in-memory duplex streams).

use std::io;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{END_MARKER, Frame, Role};

/// Default upper bound for a single frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Codec for one end of the bridge.
///
/// Unrecognized, non-UTF-8 and oversized frames are skipped, never returned
/// as errors, so a confused peer cannot tear the bridge down.
#[derive(Debug)]
pub struct FrameCodec {
    role: Role,
    max_frame_len: usize,
    /// Offset into the buffer where the next marker search resumes.
    next_index: usize,
    /// Set while skipping the remainder of an oversized frame.
    discarding: bool,
}

impl FrameCodec {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            next_index: 0,
            discarding: false,
        }
    }

    pub fn host() -> Self {
        Self::new(Role::Host)
    }

    pub fn worker() -> Self {
        Self::new(Role::Worker)
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn find_marker(&mut self, src: &BytesMut) -> Option<usize> {
        let marker = END_MARKER.as_bytes();
        let start = self.next_index.min(src.len());
        match src[start..]
            .windows(marker.len())
            .position(|window| window == marker)
        {
            Some(offset) => {
                self.next_index = 0;
                Some(start + offset)
            }
            None => {
                // Resume just before the tail, which may hold a partial marker.
                self.next_index = src.len().saturating_sub(marker.len() - 1);
                None
            }
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = self.find_marker(src) else {
                if !self.discarding && src.len() > self.max_frame_len {
                    tracing::warn!(
                        buffered_bytes = src.len(),
                        max_frame_len = self.max_frame_len,
                        "Frame exceeds maximum length, discarding until next marker"
                    );
                    self.discarding = true;
                }
                if self.discarding {
                    // Keep only what could be the start of the marker.
                    let keep = END_MARKER.len() - 1;
                    if src.len() > keep {
                        src.advance(src.len() - keep);
                    }
                    self.next_index = 0;
                }
                return Ok(None);
            };

            let raw = src.split_to(pos + END_MARKER.len());
            if std::mem::take(&mut self.discarding) {
                tracing::debug!("Skipped tail of oversized frame");
                continue;
            }
            if pos > self.max_frame_len {
                tracing::warn!(
                    frame_len = pos,
                    max_frame_len = self.max_frame_len,
                    "Frame exceeds maximum length, discarding"
                );
                continue;
            }

            let body = &raw[..pos];
            let Ok(text) = std::str::from_utf8(body) else {
                tracing::debug!(frame_len = body.len(), "Dropping non-UTF-8 frame");
                continue;
            };
            // The newline after the previous marker arrives as a leading terminator.
            let text = text.trim_start_matches(['\r', '\n']);

            match Frame::parse(text, self.role) {
                Some(frame) => {
                    tracing::trace!(kind = frame.kind(), frame_len = body.len(), "Decoded frame");
                    return Ok(Some(frame));
                }
                None => {
                    tracing::debug!(frame_len = body.len(), "Ignoring unrecognized frame");
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.iter().any(|b| !b.is_ascii_whitespace()) {
            tracing::debug!(
                trailing_bytes = src.len(),
                "Stream ended inside a frame, dropping partial data"
            );
        }
        src.clear();
        self.next_index = 0;
        self.discarding = false;
        Ok(None)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut body = String::new();
        item.render(self.role, &mut body);
        let body_len = body.len();
        tracing::trace!(kind = item.kind(), frame_len = body_len, "Encoding frame");
        if body_len > 100_000 {
            tracing::info!(
                frame_len = body_len,
                frame_kb = body_len / 1024,
                "Large frame being encoded"
            );
        }

        dst.reserve(body_len + END_MARKER.len() + 1);
        dst.put_slice(body.as_bytes());
        dst.put_slice(END_MARKER.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
