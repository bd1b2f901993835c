//! In-memory collaborators for exercising the pipeline without a device.

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Mutex;

use crate::error::{RotatorError, SinkError};
use crate::model::ScreenTarget;
use crate::services::{ImageSource, WallpaperSink};

/// Encode a `width` x `height` gradient as PNG.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(gradient(width, height))
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encoding an in-memory PNG cannot fail");
    bytes
}

/// Encode a `width` x `height` gradient as baseline JPEG.
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgba8(gradient(width, height)).into_rgb8();
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .expect("encoding an in-memory JPEG cannot fail");
    bytes
}

fn gradient(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128, 255])
    })
}

/// Image source backed by a map of reference → encoded bytes.
#[derive(Debug, Default)]
pub struct MemoryImageSource {
    images: HashMap<String, Vec<u8>>,
    denied: Vec<String>,
}

impl MemoryImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, image_ref: &str, bytes: Vec<u8>) -> Self {
        self.images.insert(image_ref.to_string(), bytes);
        self
    }

    /// Make `image_ref` fail as if read permission had been revoked.
    pub fn deny(mut self, image_ref: &str) -> Self {
        self.denied.push(image_ref.to_string());
        self
    }
}

impl ImageSource for MemoryImageSource {
    fn open(&self, image_ref: &str) -> Result<Box<dyn Read + '_>, RotatorError> {
        if self.denied.iter().any(|d| d == image_ref) {
            return Err(RotatorError::access(image_ref, "permission denied"));
        }
        match self.images.get(image_ref) {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes.as_slice()))),
            None => Err(RotatorError::access(image_ref, "file not found")),
        }
    }
}

/// One accepted sink call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkCall {
    pub target: ScreenTarget,
    pub dimensions: (u32, u32),
}

#[derive(Debug, Default)]
struct SinkState {
    calls: Vec<SinkCall>,
    attempts: usize,
    failures: Vec<SinkError>,
    rejected_targets: Vec<ScreenTarget>,
}

/// Sink that records what it was asked to show and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingSink {
    state: Mutex<SinkState>,
    unsupported: Vec<ScreenTarget>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `target` as unavailable through [`WallpaperSink::supports`].
    pub fn without_target(mut self, target: ScreenTarget) -> Self {
        self.unsupported.push(target);
        self
    }

    /// Fail the next `count` calls with `error`.
    pub fn fail_next(&self, count: usize, error: SinkError) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.failures.extend(std::iter::repeat(error).take(count));
    }

    /// Fail every call for `target`.
    pub fn reject_target(&self, target: ScreenTarget) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.rejected_targets.push(target);
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).calls.clone()
    }

    /// Calls made, successful or not.
    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).attempts
    }
}

impl WallpaperSink for RecordingSink {
    fn apply_to_target(&self, buffer: &RgbaImage, target: ScreenTarget) -> Result<(), SinkError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.attempts += 1;
        if state.rejected_targets.contains(&target) {
            return Err(SinkError::Io(format!("{} rejected", target)));
        }
        if !state.failures.is_empty() {
            return Err(state.failures.remove(0));
        }
        state.calls.push(SinkCall {
            target,
            dimensions: buffer.dimensions(),
        });
        Ok(())
    }

    fn supports(&self, target: ScreenTarget) -> bool {
        !self.unsupported.contains(&target)
    }
}
