//! Frame annotation and JPEG encoding for consumers.

use crate::types::BoundingBox;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use thiserror::Error;

pub const FACE_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
pub const MATCH_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const OBJECT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

const BOX_THICKNESS: u32 = 2;

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Draw a hollow box `BOX_THICKNESS` pixels wide; boxes outside the frame are ignored.
pub fn draw_box(frame: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let Some((x, y, w, h)) = bbox.clip_to(frame.width(), frame.height()) else {
        return;
    };
    for inset in 0..BOX_THICKNESS {
        if w <= inset * 2 || h <= inset * 2 {
            break;
        }
        let rect = Rect::at((x + inset) as i32, (y + inset) as i32)
            .of_size(w - inset * 2, h - inset * 2);
        draw_hollow_rect_mut(frame, rect, color);
    }
}

/// Encode a frame as baseline JPEG.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Bytes, AnnotateError> {
    let mut buf = Vec::with_capacity(frame.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).encode_image(frame)?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 1.0,
            class_id: 0,
            landmarks: None,
        }
    }

    #[test]
    fn test_draw_box_outline_only() {
        let mut frame = RgbImage::new(50, 50);
        draw_box(&mut frame, &bbox(10.0, 10.0, 20.0, 20.0), FACE_COLOR);
        assert_eq!(*frame.get_pixel(10, 10), FACE_COLOR);
        assert_eq!(*frame.get_pixel(11, 15), FACE_COLOR);
        assert_eq!(*frame.get_pixel(20, 20), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_box_outside_frame_is_noop() {
        let mut frame = RgbImage::new(20, 20);
        draw_box(&mut frame, &bbox(40.0, 40.0, 5.0, 5.0), FACE_COLOR);
        assert!(frame.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_encode_jpeg_roundtrip_dimensions() {
        let frame = RgbImage::from_pixel(32, 16, Rgb([10, 200, 30]));
        let jpeg = encode_jpeg(&frame, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
    }
}
