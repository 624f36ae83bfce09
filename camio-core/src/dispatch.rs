//! Message classification for inbound session payloads.
//!
//! Wire convention:
//! - `[TAG_CHUNK]...`  chunk message (see `chunk`).
//! - `[TAG_TEXT]text`  control text; unknown text is reported, never buffered as image data.
//! - anything else     legacy untagged payload: control text if it decodes as UTF-8 and
//!   carries a known marker, raw chunk data otherwise.
//!
//! Control text is recognised by substring: `"Image, Please"` requests a frame,
//! `"Landmark Data:"` starts a calibration block whose following lines are `x y` pairs.

use tracing::warn;

use crate::calibration::{CalibrationPoints, FrameSize, Point};
use crate::chunk::{RawChunk, TAG_CHUNK};

/// Leading tag byte of a control text message.
pub const TAG_TEXT: u8 = 0x01;

pub const IMAGE_REQUEST_MARKER: &str = "Image, Please";
pub const CALIBRATION_MARKER: &str = "Landmark Data:";

/// Classified inbound payload. Every byte sequence maps to exactly one variant.
#[derive(Debug, PartialEq)]
pub enum Inbound<'a> {
    ImageRequest,
    CalibrationData(CalibrationData),
    RawChunk(RawChunk<'a>),
    /// Tagged control text with no known marker. Never image data.
    UnknownControl(&'a [u8]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationData {
    pub points: Vec<Point>,
    /// Dimensions from the marker line, when the sender included them.
    pub frame: Option<FrameSize>,
    /// Malformed lines that were skipped.
    pub skipped: usize,
}

/// A calibration line that is not a pair of numbers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalibrationParseError {
    #[error("expected two coordinates in {0:?}")]
    MissingCoordinate(String),
    #[error("invalid number in {0:?}")]
    InvalidNumber(String),
}

pub fn classify(bytes: &[u8]) -> Inbound<'_> {
    if bytes.first() == Some(&TAG_CHUNK) {
        if let chunk @ RawChunk::Framed { .. } = RawChunk::from_bytes(bytes) {
            return Inbound::RawChunk(chunk);
        }
    }
    if bytes.first() == Some(&TAG_TEXT) {
        let body = &bytes[1..];
        return std::str::from_utf8(body)
            .ok()
            .and_then(classify_text)
            .unwrap_or(Inbound::UnknownControl(body));
    }
    // Binary chunk data is expected to fail here; that is not an error.
    match std::str::from_utf8(bytes) {
        Ok(text) => classify_text(text).unwrap_or(Inbound::RawChunk(RawChunk::Untagged(bytes))),
        Err(_) => Inbound::RawChunk(RawChunk::Untagged(bytes)),
    }
}

fn classify_text<'a>(text: &str) -> Option<Inbound<'a>> {
    if text.contains(IMAGE_REQUEST_MARKER) {
        return Some(Inbound::ImageRequest);
    }
    if text.contains(CALIBRATION_MARKER) {
        return Some(Inbound::CalibrationData(parse_calibration(text)));
    }
    None
}

/// Parse a calibration block. Lines after the marker line are points; malformed lines are skipped.
pub fn parse_calibration(text: &str) -> CalibrationData {
    let mut lines = text.lines();
    let mut frame = None;
    for line in lines.by_ref() {
        if let Some(at) = line.find(CALIBRATION_MARKER) {
            let rest = line[at + CALIBRATION_MARKER.len()..].trim();
            if !rest.is_empty() {
                match parse_pair(rest) {
                    Ok((width, height)) => frame = Some(FrameSize { width, height }),
                    Err(e) => warn!(error = %e, "ignoring calibration frame size"),
                }
            }
            break;
        }
    }
    let mut points = Vec::new();
    let mut skipped = 0;
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_pair(line) {
            Ok((x, y)) => points.push(Point::new(x, y)),
            Err(e) => {
                warn!(error = %e, "skipping calibration line");
                skipped += 1;
            }
        }
    }
    CalibrationData {
        points,
        frame,
        skipped,
    }
}

/// Parse `"x y"` or `"x, y"`.
pub fn parse_pair(line: &str) -> Result<(f64, f64), CalibrationParseError> {
    let mut parts = line
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty());
    let (Some(x), Some(y)) = (parts.next(), parts.next()) else {
        return Err(CalibrationParseError::MissingCoordinate(line.to_string()));
    };
    let parse = |s: &str| {
        s.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| CalibrationParseError::InvalidNumber(line.to_string()))
    };
    Ok((parse(x)?, parse(y)?))
}

/// Control text message; `tagged = false` produces the legacy untagged form.
pub fn text_message(text: &str, tagged: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 1);
    if tagged {
        out.push(TAG_TEXT);
    }
    out.extend_from_slice(text.as_bytes());
    out
}

pub fn image_request_message(tagged: bool) -> Vec<u8> {
    text_message(IMAGE_REQUEST_MARKER, tagged)
}

/// `"Landmark Data: <w>, <h>\n"` then one `"<x>, <y>\n"` line per point.
pub fn calibration_message(points: &CalibrationPoints, tagged: bool) -> Vec<u8> {
    let mut text = String::from(CALIBRATION_MARKER);
    if let Some(frame) = points.frame() {
        text.push_str(&format!(" {}, {}", frame.width, frame.height));
    }
    text.push('\n');
    for p in points.points() {
        text.push_str(&format!("{}, {}\n", p.x, p.y));
    }
    text_message(&text, tagged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::split_into_chunks;

    #[test]
    fn image_request_tagged_and_legacy() {
        assert_eq!(classify(&image_request_message(true)), Inbound::ImageRequest);
        assert_eq!(classify(b"Image, Please"), Inbound::ImageRequest);
        assert_eq!(classify(b"hey, Image, Please!"), Inbound::ImageRequest);
    }

    #[test]
    fn calibration_block() {
        let got = classify(b"Landmark Data:\n10.0 20.0\n30.5 40.25\n");
        assert_eq!(
            got,
            Inbound::CalibrationData(CalibrationData {
                points: vec![Point::new(10.0, 20.0), Point::new(30.5, 40.25)],
                frame: None,
                skipped: 0,
            })
        );
    }

    #[test]
    fn calibration_comma_lines_and_frame_size() {
        let data = parse_calibration("Landmark Data: 640.0, 480.0\n1.5, 2.5\n\n3, 4\n");
        assert_eq!(
            data.frame,
            Some(FrameSize {
                width: 640.0,
                height: 480.0
            })
        );
        assert_eq!(data.points, vec![Point::new(1.5, 2.5), Point::new(3.0, 4.0)]);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let data = parse_calibration("Landmark Data:\n1 2\nbogus\n7\nNaN 1\n5 6\n");
        assert_eq!(data.points, vec![Point::new(1.0, 2.0), Point::new(5.0, 6.0)]);
        assert_eq!(data.skipped, 3);
    }

    #[test]
    fn calibration_message_parses_back() {
        let mut set = CalibrationPoints::new();
        set.replace(
            [Point::new(12.25, 8.0), Point::new(0.5, 99.0)],
            Some(FrameSize {
                width: 320.0,
                height: 240.0,
            }),
        );
        match classify(&calibration_message(&set, true)) {
            Inbound::CalibrationData(data) => {
                assert_eq!(data.points, set.points());
                assert_eq!(data.frame, set.frame());
            }
            other => panic!("expected calibration, got {:?}", other),
        }
    }

    #[test]
    fn binary_is_raw_chunk() {
        let jpeg_start = [0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10];
        assert_eq!(
            classify(&jpeg_start),
            Inbound::RawChunk(RawChunk::Untagged(&jpeg_start))
        );
    }

    #[test]
    fn unmarked_text_is_raw_chunk() {
        assert!(matches!(
            classify(b"hello there"),
            Inbound::RawChunk(RawChunk::Untagged(_))
        ));
        assert!(matches!(classify(&[]), Inbound::RawChunk(_)));
    }

    #[test]
    fn tagged_text_without_marker_is_not_chunk_data() {
        let msg = text_message("hello", true);
        assert_eq!(classify(&msg), Inbound::UnknownControl(&b"hello"[..]));
        assert!(matches!(
            classify(&[TAG_TEXT, 0xff, 0xfe]),
            Inbound::UnknownControl(_)
        ));
    }

    #[test]
    fn tagged_chunk_wins_over_text_markers() {
        // Chunk payload that happens to be valid UTF-8 containing a marker.
        let frames = split_into_chunks([b'a'; 16], b"Image, Please", 64);
        assert!(matches!(
            classify(&frames[0]),
            Inbound::RawChunk(RawChunk::Framed { .. })
        ));
    }
}
