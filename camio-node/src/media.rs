//! Media collaborators for the node: JPEG codec, frame sources, a log-backed renderer and
//! the on-disk store for received images.

use std::path::{Path, PathBuf};

use camio_core::{
    CalibrationPoints, CodecError, FrameSize, FrameSource, ImageCodec, PeerId, Point, Renderer,
    Viewport,
};
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, DynamicImage, GenericImageView, Rgb, RgbImage};
use tracing::{debug, info, warn};

/// View the renderer maps points into.
const VIEW_SIZE: FrameSize = FrameSize {
    width: 1280.0,
    height: 720.0,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct JpegCodec;

impl ImageCodec for JpegCodec {
    type Image = DynamicImage;

    fn encode(&self, image: &DynamicImage, quality: f32) -> Result<Vec<u8>, CodecError> {
        let quality = (quality.clamp(0.0, 1.0) * 100.0).round().max(1.0) as u8;
        let rgb = image.to_rgb8();
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, CodecError> {
        image::load_from_memory(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Moving test pattern, for hosts without a camera.
pub struct SyntheticFrames {
    width: u32,
    height: u32,
    tick: u32,
}

impl SyntheticFrames {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tick: 0,
        }
    }
}

impl FrameSource for SyntheticFrames {
    type Frame = DynamicImage;

    fn capture(&mut self) -> Option<DynamicImage> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        let t = self.tick;
        self.tick = self.tick.wrapping_add(1);
        let (w, h) = (self.width, self.height);
        let img = RgbImage::from_fn(w, h, |x, y| {
            Rgb([
                ((x * 255 / w) as u8).wrapping_add(t as u8),
                (y * 255 / h) as u8,
                (t.wrapping_mul(3)) as u8,
            ])
        });
        Some(DynamicImage::ImageRgb8(img))
    }
}

/// Serves one still image as every frame.
pub struct StillFrame {
    image: DynamicImage,
}

impl StillFrame {
    pub fn open(path: &Path) -> Result<Self, image::ImageError> {
        Ok(Self {
            image: image::open(path)?,
        })
    }
}

impl FrameSource for StillFrame {
    type Frame = DynamicImage;

    fn capture(&mut self) -> Option<DynamicImage> {
        Some(self.image.clone())
    }
}

/// Frame source chosen from config.
pub fn frame_source(path: Option<&Path>) -> Box<dyn FrameSource<Frame = DynamicImage> + Send> {
    if let Some(path) = path {
        match StillFrame::open(path) {
            Ok(still) => {
                info!(path = %path.display(), "serving still image as camera");
                return Box::new(still);
            }
            Err(e) => warn!(
                path = %path.display(),
                error = %e,
                "cannot open frame image, using test pattern"
            ),
        }
    }
    Box::new(SyntheticFrames::new(640, 480))
}

/// Reports what a screen would show: the last image and the calibration overlay.
#[derive(Debug, Default)]
pub struct LogRenderer {
    last_image: Option<FrameSize>,
}

impl LogRenderer {
    fn viewport(&self, points: &CalibrationPoints) -> Option<Viewport> {
        let image = points.frame().or(self.last_image)?;
        Viewport::aspect_fit(VIEW_SIZE, image)
    }

    /// Map a tap on the view to image coordinates, with the image size it refers to.
    /// `None` with nothing displayed or for taps in the letterbox.
    pub fn map_tap(&self, points: &CalibrationPoints, tap: Point) -> Option<(Point, FrameSize)> {
        let viewport = self.viewport(points)?;
        viewport.view_to_image(tap).map(|p| (p, viewport.image()))
    }
}

impl Renderer for LogRenderer {
    type Image = DynamicImage;

    fn show_image(&mut self, from: PeerId, image: &DynamicImage) {
        let (width, height) = image.dimensions();
        self.last_image = Some(FrameSize {
            width: f64::from(width),
            height: f64::from(height),
        });
        info!(peer = %from, width, height, "image displayed");
    }

    fn redraw(&mut self, points: &CalibrationPoints) {
        let Some(viewport) = self.viewport(points) else {
            info!(points = points.len(), "calibration points (no image to map onto)");
            return;
        };
        let mapped: Vec<Point> = points
            .points()
            .iter()
            .map(|p| viewport.image_to_view(*p))
            .collect();
        info!(points = points.len(), scale = viewport.scale, "calibration overlay redrawn");
        for (p, v) in points.points().iter().zip(&mapped) {
            debug!(x = p.x, y = p.y, view_x = v.x, view_y = v.y, "point");
        }
    }
}

/// Writes received image blobs into a directory, numbered in arrival order.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Blocking; call from `spawn_blocking`.
    pub fn save(&self, from: PeerId, seq: u64, blob: &[u8]) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{from}-{seq:05}.jpg"));
        std::fs::write(&path, blob)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camio_core::collaborator::decode_blob;

    #[test]
    fn jpeg_round_trip_keeps_dimensions() {
        let mut source = SyntheticFrames::new(64, 48);
        let frame = source.capture().unwrap();
        let codec = JpegCodec;
        let blob = codec.encode(&frame, 0.25).unwrap();
        assert_eq!(&blob[..2], &[0xff, 0xd8]);
        let back = decode_blob(&codec, PeerId::random(), &blob).unwrap();
        assert_eq!(back.dimensions(), (64, 48));
    }

    #[test]
    fn lower_quality_is_smaller() {
        let frame = SyntheticFrames::new(160, 120).capture().unwrap();
        let small = JpegCodec.encode(&frame, 0.1).unwrap();
        let large = JpegCodec.encode(&frame, 0.95).unwrap();
        assert!(small.len() < large.len());
    }

    #[test]
    fn garbage_is_invalid_blob() {
        let err = decode_blob(&JpegCodec, PeerId::random(), b"Landmark Data:\n1,2").unwrap_err();
        assert!(matches!(err.source, CodecError::Decode(_)));
    }

    #[test]
    fn synthetic_frames_change() {
        let mut source = SyntheticFrames::new(8, 8);
        let a = source.capture().unwrap();
        let b = source.capture().unwrap();
        assert_ne!(a.to_rgb8().into_raw(), b.to_rgb8().into_raw());
        assert!(SyntheticFrames::new(0, 8).capture().is_none());
    }

    #[test]
    fn store_writes_blob() {
        let dir = std::env::temp_dir().join(format!("camio-store-{}", PeerId::random()));
        let store = ImageStore::new(&dir);
        let path = store.save(PeerId::random(), 1, b"\xff\xd8data").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"\xff\xd8data");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn taps_map_onto_displayed_image() {
        let mut renderer = LogRenderer::default();
        let points = CalibrationPoints::new();
        assert!(renderer.map_tap(&points, Point::new(640.0, 360.0)).is_none());

        renderer.show_image(PeerId::random(), &DynamicImage::new_rgb8(640, 480));
        let (at, frame) = renderer.map_tap(&points, Point::new(160.0, 0.0)).unwrap();
        assert_eq!(at, Point::new(0.0, 0.0));
        assert_eq!((frame.width, frame.height), (640.0, 480.0));
        assert_eq!(
            renderer.map_tap(&points, Point::new(1120.0, 720.0)).map(|(p, _)| p),
            Some(Point::new(640.0, 480.0))
        );
        assert!(renderer.map_tap(&points, Point::new(100.0, 100.0)).is_none());
    }
}
