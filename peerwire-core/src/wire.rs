//! Framing: 4-byte big-endian length prefix + payload.
//!
//! Length-prefixed framing gives unambiguous message boundaries regardless of
//! payload content, and tolerates the transport delivering bytes in arbitrary
//! chunk sizes.

const LEN_SIZE: usize = 4;

/// Default maximum payload length per frame.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Frame codec with a configured maximum payload length.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    pub fn new(max_frame_len: u32) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> u32 {
        self.max_frame_len
    }

    /// Encode one payload into a single frame: 4 bytes BE length + payload.
    /// Never produces partial output; oversize payloads fail before any write.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
        if payload.len() > self.max_frame_len as usize {
            return Err(FrameEncodeError::TooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }
        let len = payload.len() as u32;
        let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Decode one frame from the front of `bytes`. Returns the payload and the
    /// number of bytes consumed. Call with a partial buffer; `NeedMore` means
    /// the caller should retry after more data arrives.
    pub fn decode(&self, bytes: &[u8]) -> Result<(Vec<u8>, usize), FrameDecodeError> {
        if bytes.len() < LEN_SIZE {
            return Err(FrameDecodeError::NeedMore);
        }
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if len > self.max_frame_len {
            return Err(FrameDecodeError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let len = len as usize;
        if bytes.len() < LEN_SIZE + len {
            return Err(FrameDecodeError::NeedMore);
        }
        Ok((bytes[LEN_SIZE..LEN_SIZE + len].to_vec(), LEN_SIZE + len))
    }
}

/// Error encoding a payload into a frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameEncodeError {
    #[error("payload of {len} bytes exceeds maximum frame length {max}")]
    TooLarge { len: usize, max: u32 },
}

/// Error decoding a frame (need more bytes, or announced length over the maximum).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("announced frame length {len} exceeds maximum {max}")]
    TooLarge { len: u32, max: u32 },
}

/// Incremental decoder: accumulates transport bytes and yields whole frames.
#[derive(Debug)]
pub struct FrameDecoder {
    codec: FrameCodec,
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buf: Vec::new(),
        }
    }

    /// Append bytes read from the transport, in whatever chunk sizes it delivers.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, or `None` if more bytes are needed.
    /// A `TooLarge` error means the stream is no longer trustworthy.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameDecodeError> {
        match self.codec.decode(&self.buf) {
            Ok((payload, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(payload))
            }
            Err(FrameDecodeError::NeedMore) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// True when a partial frame is buffered; EOF at this point is truncation.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Consume the decoder, returning any bytes past the last decoded frame.
    pub fn into_remaining(self) -> Vec<u8> {
        self.buf
    }
}
