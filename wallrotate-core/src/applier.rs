//! Decode, transform and submit one wallpaper.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, ImageFormat, ImageReader, Limits, RgbImage, RgbaImage};
use jpeg_decoder::PixelFormat;
use log::{debug, info, warn};
use std::io::{Cursor, Read};
use std::time::Duration;

use crate::buffer::{BufferTracker, TrackedBuffer};
use crate::error::{Result, RotatorError, SinkError};
use crate::geometry;
use crate::model::{DisplayMetrics, ScreenTarget, WallpaperConfig};
use crate::sample::{calculate_sample_size, sampled_dimensions};
use crate::services::{ImageSource, WallpaperSink};

/// Upper bound on what the decoder may allocate for one image.
pub const DEFAULT_MAX_DECODE_BYTES: u64 = 512 * 1024 * 1024;

/// How often a rejected bitmap is re-submitted to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1,
        }
    }

    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Wait before attempt `attempt + 1`, given `attempt` already failed.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2,
        }
    }
}

/// What a successful application did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub original: (u32, u32),
    pub sample_size: u32,
    pub decoded: (u32, u32),
    pub output: (u32, u32),
    pub attempts: u32,
}

struct Rendered {
    original: (u32, u32),
    sample_size: u32,
    decoded: (u32, u32),
    buffer: TrackedBuffer,
}

/// Runs the decode → transform → submit pipeline for one config.
pub struct WallpaperApplier<I, W> {
    source: I,
    sink: W,
    retry: RetryPolicy,
    tracker: BufferTracker,
    max_decode_bytes: u64,
}

impl<I: ImageSource, W: WallpaperSink> WallpaperApplier<I, W> {
    pub fn new(source: I, sink: W) -> Self {
        Self {
            source,
            sink,
            retry: RetryPolicy::default(),
            tracker: BufferTracker::new(),
            max_decode_bytes: DEFAULT_MAX_DECODE_BYTES,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_decode_bytes(mut self, bytes: u64) -> Self {
        self.max_decode_bytes = bytes;
        self
    }

    pub fn tracker(&self) -> &BufferTracker {
        &self.tracker
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    /// Apply `config` to `target` at the display's exact size.
    ///
    /// Makes at most one successful sink call and never touches settings.
    /// All pixel buffers are released before this returns, on every path.
    pub fn apply(
        &self,
        config: &WallpaperConfig,
        target: ScreenTarget,
        display: DisplayMetrics,
    ) -> Result<ApplyReport> {
        let rendered = self.render(config, display)?;
        let output = rendered.buffer.dimensions();

        let attempts = self.submit(&rendered.buffer, target)?;
        drop(rendered.buffer);
        debug!(
            "Buffers alive after apply: {}, peak {} bytes",
            self.tracker.live(),
            self.tracker.peak_bytes()
        );
        info!("Applied wallpaper {} to {} screen", config.id, target);

        Ok(ApplyReport {
            original: rendered.original,
            sample_size: rendered.sample_size,
            decoded: rendered.decoded,
            output,
            attempts,
        })
    }

    /// Decode and transform `config` without submitting it.
    pub fn render_image(&self, config: &WallpaperConfig, display: DisplayMetrics) -> Result<RgbaImage> {
        let rendered = self.render(config, display)?;
        Ok(rendered.buffer.to_rgba8())
    }

    fn render(&self, config: &WallpaperConfig, display: DisplayMetrics) -> Result<Rendered> {
        let bytes = self.read_image(&config.image_ref)?;

        let (width, height) = probe_dimensions(&bytes)?;
        let sample_size = calculate_sample_size(width, height, display.width, display.height);
        let decoded = self.decode_sampled(&bytes, (width, height), sample_size)?;
        drop(bytes);
        let decoded_dims = decoded.dimensions();
        debug!(
            "Loaded {}: {}x{} sampled by {} to {}x{}",
            config.image_ref, width, height, sample_size, decoded_dims.0, decoded_dims.1
        );

        let buffer = geometry::transform(
            decoded,
            &config.crop_rect,
            config.rotation,
            display.width,
            display.height,
        )?;
        Ok(Rendered {
            original: (width, height),
            sample_size,
            decoded: decoded_dims,
            buffer,
        })
    }

    fn read_image(&self, image_ref: &str) -> Result<Vec<u8>> {
        let mut stream = self.source.open(image_ref)?;
        let mut bytes = Vec::new();
        stream
            .read_to_end(&mut bytes)
            .map_err(|e| RotatorError::access(image_ref, e))?;
        Ok(bytes)
    }

    fn decode_sampled(&self, bytes: &[u8], (width, height): (u32, u32), sample_size: u32) -> Result<TrackedBuffer> {
        let (sampled_w, sampled_h) = sampled_dimensions(width, height, sample_size);
        let decoded = match self.decode_scaled_jpeg(bytes, (sampled_w, sampled_h), sample_size)? {
            Some(scaled) => scaled,
            None => self.decode_full(bytes)?,
        };

        Ok(decoded.map(|img| {
            if img.dimensions() == (sampled_w, sampled_h) {
                DynamicImage::ImageRgba8(img.to_rgba8())
            } else {
                DynamicImage::ImageRgba8(img.resize_exact(sampled_w, sampled_h, FilterType::Triangle).into_rgba8())
            }
        }))
    }

    fn decode_full(&self, bytes: &[u8]) -> Result<TrackedBuffer> {
        let mut limits = Limits::default();
        limits.max_alloc = Some(self.max_decode_bytes);
        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| RotatorError::Decode(e.to_string()))?;
        reader.limits(limits);
        Ok(self.tracker.track(reader.decode()?))
    }

    /// JPEGs decode directly at 1/2, 1/4 or 1/8 scale, so the full-size
    /// bitmap is never allocated. Returns `None` for anything else.
    fn decode_scaled_jpeg(
        &self,
        bytes: &[u8],
        (width, height): (u32, u32),
        sample_size: u32,
    ) -> Result<Option<TrackedBuffer>> {
        if sample_size < 2 || image::guess_format(bytes).ok() != Some(ImageFormat::Jpeg) {
            return Ok(None);
        }
        let (Ok(req_w), Ok(req_h)) = (u16::try_from(width), u16::try_from(height)) else {
            return Ok(None);
        };

        let mut decoder = jpeg_decoder::Decoder::new(Cursor::new(bytes));
        let (out_w, out_h) = decoder
            .scale(req_w, req_h)
            .map_err(|e| RotatorError::Decode(e.to_string()))?;
        let channels: u64 = match decoder.info().map(|info| info.pixel_format) {
            Some(PixelFormat::RGB24) => 3,
            Some(PixelFormat::L8) => 1,
            // CMYK and 16-bit greyscale go through the generic decoder.
            _ => return Ok(None),
        };
        let (out_w, out_h) = (u32::from(out_w), u32::from(out_h));
        if u64::from(out_w) * u64::from(out_h) * channels > self.max_decode_bytes {
            return Err(RotatorError::Decode(format!(
                "{}x{} JPEG exceeds the {} byte decode limit",
                out_w, out_h, self.max_decode_bytes
            )));
        }

        let pixels = decoder.decode().map_err(|e| RotatorError::Decode(e.to_string()))?;
        let image = if channels == 3 {
            RgbImage::from_raw(out_w, out_h, pixels).map(DynamicImage::ImageRgb8)
        } else {
            GrayImage::from_raw(out_w, out_h, pixels).map(DynamicImage::ImageLuma8)
        };
        let image = image.ok_or_else(|| RotatorError::Decode("JPEG data does not match its header".to_string()))?;
        debug!("Decoded JPEG at reduced scale {}x{}", out_w, out_h);
        Ok(Some(self.tracker.track(image)))
    }

    fn submit(&self, buffer: &TrackedBuffer, target: ScreenTarget) -> Result<u32> {
        let converted;
        let rgba = match buffer.as_rgba8() {
            Some(rgba) => rgba,
            None => {
                converted = buffer.to_rgba8();
                &converted
            }
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.sink.apply_to_target(rgba, target) {
                Ok(()) => return Ok(attempt),
                Err(SinkError::Permission(reason)) => {
                    warn!("Permission denied for {} wallpaper: {}", target, reason);
                    return Err(RotatorError::Access {
                        image_ref: format!("{} wallpaper", target),
                        reason,
                    });
                }
                Err(err) if attempt >= max_attempts => {
                    return Err(RotatorError::Apply {
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    let wait = self.retry.backoff_after(attempt);
                    warn!(
                        "Attempt {}/{} to set {} wallpaper failed: {}; retrying in {:?}",
                        attempt, max_attempts, target, err, wait
                    );
                    if !wait.is_zero() {
                        std::thread::sleep(wait);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Header-only read of the image size.
pub fn probe_dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| RotatorError::Decode(e.to_string()))?;
    if reader.format().is_none() {
        return Err(RotatorError::Decode("unrecognised image format".to_string()));
    }
    Ok(reader.into_dimensions()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CropRect;
    use crate::testing::{jpeg_bytes, png_bytes, MemoryImageSource, RecordingSink};

    fn display(w: u32, h: u32) -> DisplayMetrics {
        DisplayMetrics::new(w, h).unwrap()
    }

    fn config(image_ref: &str) -> WallpaperConfig {
        WallpaperConfig::new(image_ref, CropRect::FULL, 0.0).with_id(1)
    }

    #[test]
    fn applies_at_display_size_with_sampling() {
        let source = MemoryImageSource::new().with_image("big.png", png_bytes(400, 300));
        let sink = RecordingSink::new();
        let applier = WallpaperApplier::new(&source, &sink);

        let report = applier.apply(&config("big.png"), ScreenTarget::Home, display(100, 75)).unwrap();
        assert_eq!(report.original, (400, 300));
        assert_eq!(report.sample_size, 4);
        assert_eq!(report.decoded, (100, 75));
        assert_eq!(report.output, (100, 75));
        assert_eq!(report.attempts, 1);

        let calls = sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].target, ScreenTarget::Home);
        assert_eq!(calls[0].dimensions, (100, 75));
        assert_eq!(applier.tracker().live(), 0);
    }

    #[test]
    fn crop_and_rotation_flow_into_output() {
        let source = MemoryImageSource::new().with_image("a.png", png_bytes(64, 32));
        let sink = RecordingSink::new();
        let applier = WallpaperApplier::new(&source, &sink);
        let cfg = WallpaperConfig::new("a.png", CropRect::new(0.0, 0.0, 0.5, 1.0), 90.0);

        let image = applier.render_image(&cfg, display(10, 30)).unwrap();
        assert_eq!(image.dimensions(), (10, 30));
        assert!(sink.calls().is_empty());
    }

    #[test]
    fn missing_image_is_access_error() {
        let source = MemoryImageSource::new();
        let sink = RecordingSink::new();
        let applier = WallpaperApplier::new(&source, &sink);
        let err = applier.apply(&config("nope.png"), ScreenTarget::Home, display(10, 10)).unwrap_err();
        assert!(matches!(err, RotatorError::Access { .. }));
        assert!(sink.calls().is_empty());
    }

    #[test]
    fn garbage_bytes_are_decode_error() {
        let source = MemoryImageSource::new().with_image("junk.png", b"definitely not an image".to_vec());
        let sink = RecordingSink::new();
        let applier = WallpaperApplier::new(&source, &sink);
        let err = applier.apply(&config("junk.png"), ScreenTarget::Home, display(10, 10)).unwrap_err();
        assert!(matches!(err, RotatorError::Decode(_)), "{:?}", err);
        assert_eq!(applier.tracker().live(), 0);
    }

    #[test]
    fn truncated_image_is_decode_error() {
        let mut bytes = png_bytes(32, 32);
        bytes.truncate(bytes.len() / 2);
        let source = MemoryImageSource::new().with_image("cut.png", bytes);
        let sink = RecordingSink::new();
        let applier = WallpaperApplier::new(&source, &sink);
        let err = applier.apply(&config("cut.png"), ScreenTarget::Lock, display(8, 8)).unwrap_err();
        assert!(matches!(err, RotatorError::Decode(_)), "{:?}", err);
        assert_eq!(applier.tracker().live(), 0);
    }

    #[test]
    fn sink_io_failures_are_retried_then_surfaced() {
        let source = MemoryImageSource::new().with_image("a.png", png_bytes(20, 20));
        let sink = RecordingSink::new();
        sink.fail_next(5, SinkError::Io("disk full".into()));
        let applier = WallpaperApplier::new(&source, &sink).with_retry(RetryPolicy::immediate(3));

        let err = applier.apply(&config("a.png"), ScreenTarget::Home, display(10, 10)).unwrap_err();
        match err {
            RotatorError::Apply { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sink.attempts(), 3);
        assert!(sink.calls().is_empty());
        // Nothing outlives a failed submission.
        assert_eq!(applier.tracker().live(), 0);
        assert!(applier.tracker().allocated() >= 2);
    }

    #[test]
    fn transient_sink_failure_recovers() {
        let source = MemoryImageSource::new().with_image("a.png", png_bytes(20, 20));
        let sink = RecordingSink::new();
        sink.fail_next(1, SinkError::Io("busy".into()));
        let applier = WallpaperApplier::new(&source, &sink).with_retry(RetryPolicy::immediate(3));

        let report = applier.apply(&config("a.png"), ScreenTarget::Home, display(10, 10)).unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(sink.calls().len(), 1);
    }

    #[test]
    fn permission_denied_is_not_retried() {
        let source = MemoryImageSource::new().with_image("a.png", png_bytes(20, 20));
        let sink = RecordingSink::new();
        sink.fail_next(1, SinkError::Permission("SET_WALLPAPER".into()));
        let applier = WallpaperApplier::new(&source, &sink).with_retry(RetryPolicy::immediate(3));

        let err = applier.apply(&config("a.png"), ScreenTarget::Lock, display(10, 10)).unwrap_err();
        assert!(matches!(err, RotatorError::Access { .. }));
        assert_eq!(sink.attempts(), 1);
        assert_eq!(applier.tracker().live(), 0);
    }

    #[test]
    fn backoff_grows_geometrically() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_after(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(2000));
        assert_eq!(RetryPolicy::none().backoff_after(1), Duration::ZERO);
    }

    #[test]
    fn decode_limit_rejects_oversized_images() {
        let source = MemoryImageSource::new().with_image("a.png", png_bytes(64, 64));
        let sink = RecordingSink::new();
        let applier = WallpaperApplier::new(&source, &sink).with_max_decode_bytes(16);
        let err = applier.apply(&config("a.png"), ScreenTarget::Home, display(10, 10)).unwrap_err();
        assert!(matches!(err, RotatorError::Decode(_)));
    }

    #[test]
    fn large_jpeg_is_decoded_at_reduced_scale() {
        let source = MemoryImageSource::new().with_image("big.jpg", jpeg_bytes(800, 600));
        let sink = RecordingSink::new();
        let applier = WallpaperApplier::new(&source, &sink);

        let report = applier.apply(&config("big.jpg"), ScreenTarget::Home, display(100, 75)).unwrap();
        assert_eq!(report.sample_size, 8);
        assert_eq!(report.decoded, (100, 75));
        assert_eq!(report.output, (100, 75));
        // A full-size RGB decode alone would be 800 * 600 * 3 bytes.
        assert!(applier.tracker().peak_bytes() < 800 * 600 * 3 / 4, "{}", applier.tracker().peak_bytes());
        assert_eq!(applier.tracker().live(), 0);
    }

    #[test]
    fn small_sample_jpeg_matches_sampled_dimensions() {
        let source = MemoryImageSource::new().with_image("odd.jpg", jpeg_bytes(203, 101));
        let sink = RecordingSink::new();
        let applier = WallpaperApplier::new(&source, &sink);

        let report = applier.apply(&config("odd.jpg"), ScreenTarget::Lock, display(50, 25)).unwrap();
        assert_eq!(report.sample_size, 4);
        assert_eq!(report.decoded, (50, 25));
        assert_eq!(sink.calls()[0].dimensions, (50, 25));
    }

    #[test]
    fn scaled_jpeg_still_honours_decode_limit() {
        let source = MemoryImageSource::new().with_image("big.jpg", jpeg_bytes(320, 240));
        let sink = RecordingSink::new();
        let applier = WallpaperApplier::new(&source, &sink).with_max_decode_bytes(64);
        let err = applier.apply(&config("big.jpg"), ScreenTarget::Home, display(40, 30)).unwrap_err();
        assert!(matches!(err, RotatorError::Decode(_)), "{:?}", err);
        assert!(sink.calls().is_empty());
    }
}
