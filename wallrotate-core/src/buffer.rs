//! Accounting for decoded pixel buffers.
//!
//! Every intermediate image of the apply pipeline is wrapped in a
//! [`TrackedBuffer`]. The tracker counts live buffers and their bytes, so a
//! run can assert that nothing outlived it, whichever step failed.

use image::{DynamicImage, GenericImageView};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Counters {
    live: AtomicUsize,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocated: AtomicUsize,
}

/// Shared counter of outstanding pixel buffers. Cloning shares the counts.
#[derive(Debug, Clone, Default)]
pub struct BufferTracker {
    counters: Arc<Counters>,
}

impl BufferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, image: DynamicImage) -> TrackedBuffer {
        let bytes = image.as_bytes().len();
        let c = &self.counters;
        c.live.fetch_add(1, Ordering::SeqCst);
        c.allocated.fetch_add(1, Ordering::SeqCst);
        let now = c.live_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        c.peak_bytes.fetch_max(now, Ordering::SeqCst);
        TrackedBuffer {
            image,
            bytes,
            tracker: self.clone(),
        }
    }

    /// Buffers currently alive.
    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn live_bytes(&self) -> usize {
        self.counters.live_bytes.load(Ordering::SeqCst)
    }

    /// Highest number of bytes held at once since creation.
    pub fn peak_bytes(&self) -> usize {
        self.counters.peak_bytes.load(Ordering::SeqCst)
    }

    /// Buffers handed out since creation.
    pub fn allocated(&self) -> usize {
        self.counters.allocated.load(Ordering::SeqCst)
    }

    fn release(&self, bytes: usize) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
        self.counters.live_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// A decoded image whose lifetime is reported to a [`BufferTracker`].
#[derive(Debug)]
pub struct TrackedBuffer {
    image: DynamicImage,
    bytes: usize,
    tracker: BufferTracker,
}

impl TrackedBuffer {
    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Derive a new tracked buffer from this one. `self` is released as
    /// soon as the derived buffer exists.
    pub fn map(self, f: impl FnOnce(&DynamicImage) -> DynamicImage) -> TrackedBuffer {
        let next = self.tracker.track(f(&self.image));
        drop(self);
        next
    }

    /// Like [`TrackedBuffer::map`] but for fallible steps. `self` is released
    /// on both outcomes.
    pub fn try_map<E>(
        self,
        f: impl FnOnce(&DynamicImage) -> Result<DynamicImage, E>,
    ) -> Result<TrackedBuffer, E> {
        let next = f(&self.image).map(|image| self.tracker.track(image));
        drop(self);
        next
    }
}

impl Deref for TrackedBuffer {
    type Target = DynamicImage;

    fn deref(&self) -> &DynamicImage {
        &self.image
    }
}

impl Drop for TrackedBuffer {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_releases_buffer() {
        let tracker = BufferTracker::new();
        {
            let buffer = tracker.track(DynamicImage::new_rgba8(4, 4));
            assert_eq!(buffer.dimensions(), (4, 4));
            assert_eq!(tracker.live(), 1);
            assert_eq!(tracker.live_bytes(), 64);
        }
        assert_eq!(tracker.live(), 0);
        assert_eq!(tracker.live_bytes(), 0);
        assert_eq!(tracker.peak_bytes(), 64);
    }

    #[test]
    fn map_releases_the_source() {
        let tracker = BufferTracker::new();
        let buffer = tracker.track(DynamicImage::new_rgba8(8, 8));
        let smaller = buffer.map(|img| img.crop_imm(0, 0, 2, 2));
        assert_eq!(tracker.live(), 1);
        assert_eq!(tracker.allocated(), 2);
        assert_eq!(smaller.dimensions(), (2, 2));
        // Source and crop were both alive for a moment.
        assert_eq!(tracker.peak_bytes(), 8 * 8 * 4 + 2 * 2 * 4);
    }

    #[test]
    fn failed_try_map_leaves_nothing_alive() {
        let tracker = BufferTracker::new();
        let buffer = tracker.track(DynamicImage::new_rgba8(2, 2));
        let result: Result<TrackedBuffer, &str> = buffer.try_map(|_| Err("boom"));
        assert!(result.is_err());
        assert_eq!(tracker.live(), 0);
    }
}
