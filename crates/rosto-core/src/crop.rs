//! Region cropping and annotation.
//!
//! Crops are clamped to the source bounds rather than rejected; only a region
//! with nothing left after clamping is an error.

use crate::types::Detection;
use image::{imageops, Rgb, RgbImage};
use thiserror::Error;

/// Outline color for annotated regions.
const ANNOTATION_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const ANNOTATION_THICKNESS: u32 = 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CropError {
    #[error("region at ({x}, {y}) size {width}x{height} lies outside the {image_width}x{image_height} image")]
    OutOfBounds {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
    },
}

/// Pixel rectangle fully inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClampedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Intersect a detection with `[0, image_width) × [0, image_height)`.
pub fn clamp_region(detection: &Detection, image_width: u32, image_height: u32) -> Result<ClampedRect, CropError> {
    // i64 so that x + width cannot overflow for any i32/u32 input.
    let x0 = i64::from(detection.x).max(0);
    let y0 = i64::from(detection.y).max(0);
    let x1 = (i64::from(detection.x) + i64::from(detection.width)).min(i64::from(image_width));
    let y1 = (i64::from(detection.y) + i64::from(detection.height)).min(i64::from(image_height));

    if x1 <= x0 || y1 <= y0 {
        return Err(CropError::OutOfBounds {
            x: detection.x,
            y: detection.y,
            width: detection.width,
            height: detection.height,
            image_width,
            image_height,
        });
    }

    // All four values are within [0, u32::MAX] after clamping.
    Ok(ClampedRect {
        x: x0 as u32,
        y: y0 as u32,
        width: (x1 - x0) as u32,
        height: (y1 - y0) as u32,
    })
}

/// Crop the detection out of `image`, clamped to its bounds.
pub fn crop_region(image: &RgbImage, detection: &Detection) -> Result<RgbImage, CropError> {
    let rect = clamp_region(detection, image.width(), image.height())?;
    if rect.width != detection.width || rect.height != detection.height {
        tracing::debug!(
            x = detection.x,
            y = detection.y,
            width = detection.width,
            height = detection.height,
            clamped_width = rect.width,
            clamped_height = rect.height,
            "region clamped to image bounds"
        );
    }
    Ok(imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image())
}

/// Return a copy of `image` with every detection outlined.
///
/// Regions entirely outside the image are ignored.
pub fn draw_regions(image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut out = image.clone();
    for detection in detections {
        let Ok(rect) = clamp_region(detection, out.width(), out.height()) else {
            continue;
        };
        let x_end = rect.x + rect.width;
        let y_end = rect.y + rect.height;

        for y in rect.y..y_end {
            for x in rect.x..x_end {
                let on_edge = x < rect.x + ANNOTATION_THICKNESS
                    || y < rect.y + ANNOTATION_THICKNESS
                    || x + ANNOTATION_THICKNESS >= x_end
                    || y + ANNOTATION_THICKNESS >= y_end;
                if on_edge {
                    out.put_pixel(x, y, ANNOTATION_COLOR);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DetectionKind;

    fn det(x: i32, y: i32, w: u32, h: u32) -> Detection {
        Detection::new(x, y, w, h, DetectionKind::Face)
    }

    /// 100x80 image whose red channel encodes x and green encodes y.
    fn gradient() -> RgbImage {
        RgbImage::from_fn(100, 80, |x, y| Rgb([x as u8, y as u8, 0]))
    }

    #[test]
    fn test_crop_inside_bounds() {
        let crop = crop_region(&gradient(), &det(10, 20, 30, 15)).unwrap();
        assert_eq!(crop.dimensions(), (30, 15));
        assert_eq!(crop.get_pixel(0, 0), &Rgb([10, 20, 0]));
        assert_eq!(crop.get_pixel(29, 14), &Rgb([39, 34, 0]));
    }

    #[test]
    fn test_crop_clamps_right_edge() {
        let crop = crop_region(&gradient(), &det(80, 10, 50, 20)).unwrap();
        assert_eq!(crop.dimensions(), (20, 20));
        assert_eq!(crop.get_pixel(19, 0), &Rgb([99, 10, 0]));
    }

    #[test]
    fn test_crop_clamps_negative_origin() {
        let crop = crop_region(&gradient(), &det(-10, -5, 30, 30)).unwrap();
        assert_eq!(crop.dimensions(), (20, 25));
        assert_eq!(crop.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_crop_entirely_outside() {
        let err = crop_region(&gradient(), &det(150, 10, 40, 40)).unwrap_err();
        assert!(matches!(err, CropError::OutOfBounds { x: 150, image_width: 100, .. }));

        assert!(crop_region(&gradient(), &det(-50, 0, 50, 10)).is_err());
    }

    #[test]
    fn test_clamp_extreme_values_do_not_overflow() {
        let rect = clamp_region(&det(i32::MAX, 0, u32::MAX, 10), 100, 80);
        assert!(rect.is_err());
        let rect = clamp_region(&det(i32::MIN, 0, u32::MAX, 10), 100, 80).unwrap();
        assert_eq!(rect, ClampedRect { x: 0, y: 0, width: 100, height: 10 });
    }

    #[test]
    fn test_draw_regions_outlines_only() {
        let img = RgbImage::new(50, 50);
        let out = draw_regions(&img, &[det(10, 10, 20, 20)]);
        assert_eq!(out.get_pixel(10, 10), &ANNOTATION_COLOR);
        assert_eq!(out.get_pixel(29, 29), &ANNOTATION_COLOR);
        assert_eq!(out.get_pixel(11, 20), &ANNOTATION_COLOR);
        assert_eq!(out.get_pixel(20, 20), &Rgb([0, 0, 0]), "interior must stay untouched");
        assert_eq!(out.get_pixel(5, 5), &Rgb([0, 0, 0]));
        assert_eq!(img.get_pixel(10, 10), &Rgb([0, 0, 0]), "source must not be modified");
    }

    #[test]
    fn test_draw_regions_skips_outside() {
        let img = RgbImage::new(20, 20);
        let out = draw_regions(&img, &[det(100, 100, 10, 10)]);
        assert_eq!(out, img);
    }
}
