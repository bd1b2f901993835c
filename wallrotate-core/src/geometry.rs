//! Crop, rotation and scaling of decoded wallpapers.
//!
//! The pipeline always crops first, then rotates the cropped region about
//! its own centre, then scales to the display. Crop coordinates are
//! therefore interpreted against the unrotated source image.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use log::debug;

use crate::buffer::TrackedBuffer;
use crate::error::{Result, RotatorError};
use crate::model::CropRect;

/// Angles closer than this to a quarter turn are treated as exact.
const ANGLE_EPSILON: f32 = 0.001;

/// A crop window in pixel space, always inside the image and at least 1x1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelCrop {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelCrop {
    /// Map a normalized rectangle onto a `width` x `height` image.
    ///
    /// Edges are clamped into the image; an empty or inverted window
    /// collapses to a single pixel row/column instead of failing.
    pub fn from_normalized(rect: &CropRect, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(RotatorError::Decode(format!(
                "cannot crop a {}x{} image",
                width, height
            )));
        }
        let (x, w) = clamp_span(rect.left, rect.right, width);
        let (y, h) = clamp_span(rect.top, rect.bottom, height);
        Ok(PixelCrop {
            x,
            y,
            width: w,
            height: h,
        })
    }

    pub fn is_full(&self, width: u32, height: u32) -> bool {
        self.x == 0 && self.y == 0 && self.width == width && self.height == height
    }
}

fn clamp_span(start: f32, end: f32, extent: u32) -> (u32, u32) {
    // `as` saturates and maps NaN to 0.
    let start_px = ((start * extent as f32).floor() as u32).min(extent - 1);
    let end_px = ((end * extent as f32).floor() as u32).min(extent);
    let span = end_px.saturating_sub(start_px).clamp(1, extent - start_px);
    (start_px, span)
}

/// Quarter-turn classification of an angle in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Turn {
    None,
    Quarter,
    Half,
    ThreeQuarter,
    Arbitrary(f32),
}

fn classify(degrees: f32) -> Turn {
    if !degrees.is_finite() {
        return Turn::None;
    }
    let normalized = degrees.rem_euclid(360.0);
    let near = |target: f32| (normalized - target).abs() < ANGLE_EPSILON;
    if near(0.0) || near(360.0) {
        Turn::None
    } else if near(90.0) {
        Turn::Quarter
    } else if near(180.0) {
        Turn::Half
    } else if near(270.0) {
        Turn::ThreeQuarter
    } else {
        Turn::Arbitrary(normalized)
    }
}

/// Size of the axis-aligned box holding a `width` x `height` image rotated
/// by `degrees`.
pub fn rotated_bounds(width: u32, height: u32, degrees: f32) -> (u32, u32) {
    match classify(degrees) {
        Turn::None | Turn::Half => (width, height),
        Turn::Quarter | Turn::ThreeQuarter => (height, width),
        Turn::Arbitrary(angle) => {
            let (sin, cos) = angle.to_radians().sin_cos();
            let (w, h) = (width as f32, height as f32);
            let new_w = (w * cos.abs() + h * sin.abs()).round() as u32;
            let new_h = (w * sin.abs() + h * cos.abs()).round() as u32;
            (new_w.max(1), new_h.max(1))
        }
    }
}

pub fn crop(image: &DynamicImage, crop: PixelCrop) -> DynamicImage {
    image.crop_imm(crop.x, crop.y, crop.width, crop.height)
}

/// Rotate clockwise by `degrees` about the image centre.
///
/// Quarter turns are lossless. Any other angle is a pure affine rotation
/// into a canvas grown to the rotated bounding box; uncovered corners are
/// transparent.
pub fn rotate(image: &DynamicImage, degrees: f32) -> DynamicImage {
    match classify(degrees) {
        Turn::None => image.clone(),
        Turn::Quarter => image.rotate90(),
        Turn::Half => image.rotate180(),
        Turn::ThreeQuarter => image.rotate270(),
        Turn::Arbitrary(angle) => DynamicImage::ImageRgba8(rotate_affine(&image.to_rgba8(), angle)),
    }
}

fn rotate_affine(src: &RgbaImage, degrees: f32) -> RgbaImage {
    let (w, h) = src.dimensions();
    let (out_w, out_h) = rotated_bounds(w, h, degrees);
    let projection = Projection::translate(out_w as f32 / 2.0, out_h as f32 / 2.0)
        * Projection::rotate(degrees.to_radians())
        * Projection::translate(-(w as f32) / 2.0, -(h as f32) / 2.0);

    let mut out = RgbaImage::new(out_w, out_h);
    warp_into(
        src,
        &projection,
        Interpolation::Bilinear,
        Rgba([0, 0, 0, 0]),
        &mut out,
    );
    out
}

/// Resize to exactly `width` x `height`, ignoring aspect ratio.
pub fn scale(image: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    image.resize_exact(width, height, FilterType::Triangle)
}

/// Crop, rotate and scale `image` to exactly `target_width` x `target_height`.
///
/// Each stage replaces the previous buffer, which is released before the
/// next stage starts.
pub fn transform(
    image: TrackedBuffer,
    rect: &CropRect,
    rotation: f32,
    target_width: u32,
    target_height: u32,
) -> Result<TrackedBuffer> {
    if target_width == 0 || target_height == 0 {
        return Err(RotatorError::Decode(format!(
            "target size {}x{} has no area",
            target_width, target_height
        )));
    }

    let (width, height) = image.dimensions();
    let window = PixelCrop::from_normalized(rect, width, height)?;
    debug!(
        "Cropping {}x{} to x={}, y={}, w={}, h={}",
        width, height, window.x, window.y, window.width, window.height
    );
    let cropped = if window.is_full(width, height) {
        image
    } else {
        image.map(|img| crop(img, window))
    };

    let rotated = match classify(rotation) {
        Turn::None => cropped,
        _ => {
            let rotated = cropped.map(|img| rotate(img, rotation));
            debug!("Rotated by {} degrees to {:?}", rotation, rotated.dimensions());
            rotated
        }
    };

    if rotated.dimensions() == (target_width, target_height) {
        return Ok(rotated);
    }
    debug!(
        "Scaling {:?} to {}x{}",
        rotated.dimensions(),
        target_width,
        target_height
    );
    Ok(rotated.map(|img| scale(img, target_width, target_height)))
}
