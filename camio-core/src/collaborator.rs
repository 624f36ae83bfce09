//! Interfaces to the collaborators the session layer does not own:
//! image codec, camera frame source, renderer.

use crate::calibration::CalibrationPoints;
use crate::identity::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Compressed image encode/decode.
pub trait ImageCodec {
    type Image;

    /// `quality` in 0.0..=1.0.
    fn encode(&self, image: &Self::Image, quality: f32) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Image, CodecError>;
}

/// Produces frames on demand (the camera).
pub trait FrameSource {
    type Frame;

    fn capture(&mut self) -> Option<Self::Frame>;
}

/// Consumes decoded images and calibration points (the UI).
pub trait Renderer {
    type Image;

    fn show_image(&mut self, from: PeerId, image: &Self::Image);

    fn redraw(&mut self, points: &CalibrationPoints);
}

/// Reassembled bytes that do not decode as an image.
#[derive(Debug, thiserror::Error)]
#[error("invalid image blob from {peer} ({len} bytes): {source}")]
pub struct InvalidImageBlob {
    pub peer: PeerId,
    pub len: usize,
    #[source]
    pub source: CodecError,
}

/// Decode a completed blob. Failures are returned for logging; the caller drops the blob.
pub fn decode_blob<C: ImageCodec>(
    codec: &C,
    peer: PeerId,
    blob: &[u8],
) -> Result<C::Image, InvalidImageBlob> {
    codec.decode(blob).map_err(|source| InvalidImageBlob {
        peer,
        len: blob.len(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts blobs starting with the JPEG SOI marker.
    struct SoiCodec;

    impl ImageCodec for SoiCodec {
        type Image = usize;

        fn encode(&self, image: &usize, _quality: f32) -> Result<Vec<u8>, CodecError> {
            let mut out = vec![0xff, 0xd8];
            out.resize(*image, 0);
            Ok(out)
        }

        fn decode(&self, bytes: &[u8]) -> Result<usize, CodecError> {
            if bytes.starts_with(&[0xff, 0xd8]) {
                Ok(bytes.len())
            } else {
                Err(CodecError::Decode("missing SOI".into()))
            }
        }
    }

    #[test]
    fn decodes_valid_blob() {
        let blob = SoiCodec.encode(&16, 0.8).unwrap();
        assert_eq!(decode_blob(&SoiCodec, PeerId::random(), &blob).unwrap(), 16);
    }

    #[test]
    fn invalid_blob_reports_size() {
        let err = decode_blob(&SoiCodec, PeerId::random(), b"not an image").unwrap_err();
        assert_eq!(err.len, 12);
        assert!(matches!(err.source, CodecError::Decode(_)));
    }
}
