//! Video frame codec
//!
//! The node compresses frames before fan-out and decompresses them on
//! receipt. A frame that fails to decode is dropped by the caller.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MediaError;

/// Encoder/decoder for video frames
pub trait FrameCodec: Send + Sync {
    fn encode(&self, frame: &[u8]) -> Result<Bytes, MediaError>;

    /// `None` for corrupt or truncated input
    fn decode(&self, data: &[u8]) -> Option<Bytes>;
}

/// Uncompressed RGB24 frames behind a small header.
///
/// ```text
/// "RAWF" | width u16 LE | height u16 LE | width * height * 3 bytes
/// ```
pub struct RawFrameCodec {
    width: u16,
    height: u16,
}

const RAW_MAGIC: &[u8; 4] = b"RAWF";
const RAW_HEADER_SIZE: usize = 8;

impl RawFrameCodec {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    fn frame_len(width: u16, height: u16) -> usize {
        width as usize * height as usize * 3
    }
}

impl FrameCodec for RawFrameCodec {
    fn encode(&self, frame: &[u8]) -> Result<Bytes, MediaError> {
        let expected = Self::frame_len(self.width, self.height);
        if frame.len() != expected {
            return Err(MediaError::Encode(format!(
                "frame is {} bytes, expected {} for {}x{}",
                frame.len(),
                expected,
                self.width,
                self.height
            )));
        }

        let mut buf = BytesMut::with_capacity(RAW_HEADER_SIZE + frame.len());
        buf.put_slice(RAW_MAGIC);
        buf.put_u16_le(self.width);
        buf.put_u16_le(self.height);
        buf.put_slice(frame);
        Ok(buf.freeze())
    }

    fn decode(&self, data: &[u8]) -> Option<Bytes> {
        if data.len() < RAW_HEADER_SIZE || &data[..4] != RAW_MAGIC {
            return None;
        }

        let mut header = &data[4..RAW_HEADER_SIZE];
        let width = header.get_u16_le();
        let height = header.get_u16_le();

        let pixels = &data[RAW_HEADER_SIZE..];
        if pixels.len() != Self::frame_len(width, height) {
            return None;
        }
        Some(Bytes::copy_from_slice(pixels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let codec = RawFrameCodec::new(2, 2);
        let frame = vec![7u8; 12];
        let encoded = codec.encode(&frame).unwrap();
        assert_eq!(&encoded[..4], b"RAWF");
        assert_eq!(codec.decode(&encoded).unwrap().as_ref(), frame.as_slice());
    }

    #[test]
    fn test_wrong_frame_size_rejected() {
        let codec = RawFrameCodec::new(2, 2);
        assert!(matches!(codec.encode(&[0u8; 5]), Err(MediaError::Encode(_))));
    }

    #[test]
    fn test_corrupt_data_does_not_decode() {
        let codec = RawFrameCodec::new(2, 2);
        let encoded = codec.encode(&[1u8; 12]).unwrap();

        assert!(codec.decode(b"garbage").is_none());
        assert!(codec.decode(&encoded[..encoded.len() - 1]).is_none());

        let mut bad_magic = encoded.to_vec();
        bad_magic[0] = b'X';
        assert!(codec.decode(&bad_magic).is_none());
    }

    #[test]
    fn test_decodes_other_geometry() {
        // Peers may capture at a different size than we do
        let sender = RawFrameCodec::new(4, 1);
        let receiver = RawFrameCodec::new(2, 2);
        let encoded = sender.encode(&[3u8; 12]).unwrap();
        assert_eq!(receiver.decode(&encoded).unwrap().len(), 12);
    }
}
