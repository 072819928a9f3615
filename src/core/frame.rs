//! Length-prefixed frame reassembly.
//!
//! A frame is `[u32 LE length][payload]`. The reader consumes the header as
//! soon as four bytes are buffered and then remembers how many payload bytes
//! are still owed, so a slow sender never causes the header to be re-parsed.

use crate::error::{ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the little-endian length prefix
pub const HEADER_LEN: usize = 4;

/// Incremental frame extractor fed from a byte buffer.
#[derive(Debug)]
pub struct FrameReader {
    /// Payload length of the frame whose header was already consumed
    pending: Option<usize>,
    max_payload: usize,
}

impl FrameReader {
    pub fn new(max_payload: usize) -> Self {
        Self {
            pending: None,
            max_payload,
        }
    }

    /// Payload bytes still owed by a partially received frame, if any.
    pub fn pending(&self) -> Option<usize> {
        self.pending
    }

    /// Pull one complete frame payload out of `buf`.
    ///
    /// Returns `Ok(None)` until the whole frame is buffered. A declared length
    /// above the configured maximum fails before anything is allocated.
    pub fn try_extract_frame(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        let len = match self.pending {
            Some(len) => len,
            None => {
                if buf.len() < HEADER_LEN {
                    return Ok(None);
                }
                let header = buf.split_to(HEADER_LEN);
                let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
                if len > self.max_payload {
                    return Err(ProtocolError::OversizedPacket(len));
                }
                self.pending = Some(len);
                len
            }
        };

        if buf.len() < len {
            buf.reserve(len - buf.len());
            return Ok(None);
        }

        self.pending = None;
        Ok(Some(buf.split_to(len).freeze()))
    }
}

/// Write `[u32 LE length][payload]` into `dst`.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::OversizedPacket(payload.len()))?;
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u32_le(len);
    dst.put_slice(payload);
    Ok(())
}

/// Frame a payload into a fresh buffer.
pub fn frame_bytes(payload: &[u8]) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_frame(payload, &mut dst)?;
    Ok(dst.freeze())
}
