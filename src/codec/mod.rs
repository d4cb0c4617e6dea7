//! Length-prefixed framing for the Riak protocol-buffers wire format
//!
//! `[u32 BE length][u8 message code][length - 1 body bytes]`, where the length
//! counts the code byte. A frame with length 1 carries no body.
pub mod pb;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RiakError, RiakResult};

/// Size of the length prefix plus the code byte
pub const HEADER_LEN: usize = 5;

/// Default receive buffer capacity
pub const DEFAULT_INITIAL_BUFFER: usize = 2 * 1024;
/// A drained buffer above this capacity is released back to the initial size
pub const DEFAULT_MAX_RETAINED_BUFFER: usize = 2 * 1024 * 1024;
/// Frames announcing more than this many bytes are rejected
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Message codes the core itself sends or interprets
pub mod codes {
    pub const ERROR_RESP: u8 = 0;
    pub const PING_REQ: u8 = 1;
    pub const PING_RESP: u8 = 2;
    pub const AUTH_REQ: u8 = 253;
    pub const AUTH_RESP: u8 = 254;
    pub const START_TLS: u8 = 255;
}

/// One decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    /// `None` for code-only messages
    pub body: Option<Bytes>,
}

impl Frame {
    pub fn new(code: u8, body: Option<Bytes>) -> Self {
        Self { code, body }
    }

    pub fn is_error(&self) -> bool {
        self.code == codes::ERROR_RESP
    }

    /// Number of bytes this frame occupies on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.body.as_ref().map_or(0, |b| b.len())
    }
}

/// Stateless frame encoder/decoder
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a message into a standalone buffer
    pub fn encode(code: u8, body: Option<&[u8]>) -> RiakResult<Bytes> {
        let body_len = body.map_or(0, |b| b.len());
        let mut out = BytesMut::with_capacity(HEADER_LEN + body_len);
        Self::encode_into(code, body, &mut out)?;
        Ok(out.freeze())
    }

    /// Append an encoded message to `out`
    pub fn encode_into(code: u8, body: Option<&[u8]>, out: &mut BytesMut) -> RiakResult<()> {
        Self::encode_into_limited(code, body, DEFAULT_MAX_FRAME_LEN, out)
    }

    /// Append an encoded message to `out`, refusing frames above `max_frame_len`
    ///
    /// Nothing is written when the frame is refused.
    pub fn encode_into_limited(
        code: u8,
        body: Option<&[u8]>,
        max_frame_len: usize,
        out: &mut BytesMut,
    ) -> RiakResult<()> {
        let body = body.unwrap_or(&[]);
        let length = body.len().saturating_add(1);
        let prefix = match u32::try_from(length) {
            Ok(prefix) if length <= max_frame_len => prefix,
            _ => {
                return Err(RiakError::FrameTooLarge {
                    length,
                    limit: max_frame_len,
                })
            }
        };

        out.reserve(HEADER_LEN + body.len());
        out.put_u32(prefix);
        out.put_u8(code);
        out.put_slice(body);
        Ok(())
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns `Ok(None)` without consuming anything when the frame is not
    /// complete yet.
    pub fn decode(buf: &mut BytesMut, max_frame_len: usize) -> RiakResult<Option<Frame>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length == 0 {
            return Err(RiakError::protocol("frame length of zero"));
        }
        if length > max_frame_len {
            return Err(RiakError::protocol(format!(
                "frame length {} exceeds limit {}",
                length, max_frame_len
            )));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        buf.advance(4);
        let code = buf.get_u8();
        let body = if length > 1 {
            Some(buf.split_to(length - 1).freeze())
        } else {
            None
        };

        Ok(Some(Frame { code, body }))
    }

    /// Decode as many complete frames as `buf` holds
    pub fn decode_all(buf: &mut BytesMut, max_frame_len: usize) -> RiakResult<Vec<Frame>> {
        let mut frames = Vec::new();
        while let Some(frame) = Self::decode(buf, max_frame_len)? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

/// Receive buffer owned by a single connection
///
/// Bytes read from the socket are appended here; complete frames are split
/// off the front and partial data stays buffered for the next read.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    initial_capacity: usize,
    max_retained: usize,
    max_frame_len: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_limits(
            DEFAULT_INITIAL_BUFFER,
            DEFAULT_MAX_RETAINED_BUFFER,
            DEFAULT_MAX_FRAME_LEN,
        )
    }

    pub fn with_limits(initial_capacity: usize, max_retained: usize, max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(initial_capacity),
            initial_capacity,
            max_retained,
            max_frame_len,
        }
    }

    /// Append raw bytes and extract every complete frame
    pub fn push(&mut self, data: &[u8]) -> RiakResult<Vec<Frame>> {
        self.buf.extend_from_slice(data);
        let frames = FrameCodec::decode_all(&mut self.buf, self.max_frame_len)?;
        self.compact();
        Ok(frames)
    }

    /// Extract the next complete frame, if any
    pub fn next_frame(&mut self) -> RiakResult<Option<Frame>> {
        let frame = FrameCodec::decode(&mut self.buf, self.max_frame_len)?;
        if frame.is_some() {
            self.compact();
        }
        Ok(frame)
    }

    /// Mutable access for `AsyncReadExt::read_buf`
    pub fn read_target(&mut self) -> &mut BytesMut {
        if self.buf.capacity() == self.buf.len() {
            self.buf.reserve(self.initial_capacity);
        }
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Drop all buffered bytes
    pub fn clear(&mut self) {
        self.buf.clear();
        self.compact();
    }

    fn compact(&mut self) {
        // After one oversized message the buffer would otherwise keep its peak size
        if self.buf.is_empty() && self.buf.capacity() > self.max_retained {
            self.buf = BytesMut::with_capacity(self.initial_capacity);
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
