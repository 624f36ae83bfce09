//! Calibration point set and image/view coordinate mapping.

use serde::{Deserialize, Serialize};

/// A 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Frame dimensions the points were annotated against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: f64,
    pub height: f64,
}

/// Ordered calibration points owned by the application; read by the renderer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationPoints {
    points: Vec<Point>,
    frame: Option<FrameSize>,
}

impl CalibrationPoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear, then append each point in order.
    pub fn replace(&mut self, points: impl IntoIterator<Item = Point>, frame: Option<FrameSize>) {
        self.points.clear();
        self.points.extend(points);
        self.frame = frame;
    }

    pub fn push(&mut self, p: Point) {
        self.points.push(p);
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.frame = None;
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn frame(&self) -> Option<FrameSize> {
        self.frame
    }

    /// Dimensions the points refer to, for sets captured locally.
    pub fn set_frame(&mut self, frame: Option<FrameSize>) {
        self.frame = frame;
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Aspect-fit placement of an image inside a view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub scale: f64,
    pub offset: Point,
    image: FrameSize,
}

impl Viewport {
    /// Scale the image to fit the view, preserving aspect ratio, centered.
    /// Returns `None` for degenerate (zero-sized) inputs.
    pub fn aspect_fit(view: FrameSize, image: FrameSize) -> Option<Self> {
        if view.width <= 0.0 || view.height <= 0.0 || image.width <= 0.0 || image.height <= 0.0 {
            return None;
        }
        let view_ratio = view.width / view.height;
        let image_ratio = image.width / image.height;
        let scale = if image_ratio > view_ratio {
            view.width / image.width
        } else {
            view.height / image.height
        };
        let offset = Point::new(
            (view.width - image.width * scale) / 2.0,
            (view.height - image.height * scale) / 2.0,
        );
        Some(Self {
            scale,
            offset,
            image,
        })
    }

    pub fn image(&self) -> FrameSize {
        self.image
    }

    pub fn image_to_view(&self, p: Point) -> Point {
        Point::new(
            p.x * self.scale + self.offset.x,
            p.y * self.scale + self.offset.y,
        )
    }

    /// `None` when the view point falls outside the drawn image (letterbox area).
    pub fn view_to_image(&self, p: Point) -> Option<Point> {
        let right = self.offset.x + self.image.width * self.scale;
        let bottom = self.offset.y + self.image.height * self.scale;
        if p.x < self.offset.x || p.x > right || p.y < self.offset.y || p.y > bottom {
            return None;
        }
        Some(Point::new(
            (p.x - self.offset.x) / self.scale,
            (p.y - self.offset.y) / self.scale,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_clears_first() {
        let mut set = CalibrationPoints::new();
        set.push(Point::new(1.0, 1.0));
        set.replace([Point::new(2.0, 3.0)], None);
        assert_eq!(set.points(), &[Point::new(2.0, 3.0)]);
    }

    #[test]
    fn wide_image_is_letterboxed() {
        let view = FrameSize {
            width: 400.0,
            height: 400.0,
        };
        let image = FrameSize {
            width: 800.0,
            height: 400.0,
        };
        let vp = Viewport::aspect_fit(view, image).unwrap();
        assert_eq!(vp.scale, 0.5);
        assert_eq!(vp.offset, Point::new(0.0, 100.0));
        assert_eq!(vp.image_to_view(Point::new(800.0, 400.0)), Point::new(400.0, 300.0));
        assert!(vp.view_to_image(Point::new(200.0, 50.0)).is_none());
        assert_eq!(
            vp.view_to_image(Point::new(200.0, 200.0)),
            Some(Point::new(400.0, 200.0))
        );
    }

    #[test]
    fn degenerate_sizes() {
        let zero = FrameSize {
            width: 0.0,
            height: 10.0,
        };
        let ok = FrameSize {
            width: 10.0,
            height: 10.0,
        };
        assert!(Viewport::aspect_fit(zero, ok).is_none());
        assert!(Viewport::aspect_fit(ok, zero).is_none());
    }
}
