use crate::core::frame::{encode_frame, FrameReader};
use crate::error::ProtocolError;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Tokio codec over the length-prefixed frame format.
///
/// Decoded items are raw payloads; inflating and unmarshaling is left to the
/// connection, which needs to see the bytes first to detect compression.
#[derive(Debug)]
pub struct FrameCodec {
    reader: FrameReader,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            reader: FrameReader::new(max_payload),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.reader.try_extract_frame(src)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst)
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(item, dst)
    }
}
