// Service traits for the platform collaborators of the rotation pipeline
use anyhow::{Context, Result};
use directories::ProjectDirs;
use image::RgbaImage;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{RotatorError, SinkError};
use crate::model::{ScreenTarget, Trigger};

/// Key/value settings storage.
pub trait ConfigStore {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
    fn set(&mut self, key: &str, value: serde_json::Value) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// Resolves an opaque image reference to a readable byte stream.
pub trait ImageSource {
    fn open(&self, image_ref: &str) -> std::result::Result<Box<dyn Read + '_>, RotatorError>;
}

/// The platform service that actually changes a wallpaper.
pub trait WallpaperSink {
    /// Show `buffer` on `target`. The buffer is only borrowed for the call.
    fn apply_to_target(&self, buffer: &RgbaImage, target: ScreenTarget) -> std::result::Result<(), SinkError>;

    /// Whether this platform has a separate surface for `target`.
    fn supports(&self, _target: ScreenTarget) -> bool {
        true
    }
}

/// Host scheduling capability: periodic jobs and one-off triggers.
pub trait Scheduler {
    fn schedule_periodic(&self, interval: Duration) -> Result<()>;
    fn schedule_once(&self, trigger: Trigger, delay: Duration) -> Result<()>;
    fn cancel(&self) -> Result<()>;
}

impl<T: ImageSource + ?Sized> ImageSource for &T {
    fn open(&self, image_ref: &str) -> std::result::Result<Box<dyn Read + '_>, RotatorError> {
        (**self).open(image_ref)
    }
}

impl<T: WallpaperSink + ?Sized> WallpaperSink for &T {
    fn apply_to_target(&self, buffer: &RgbaImage, target: ScreenTarget) -> std::result::Result<(), SinkError> {
        (**self).apply_to_target(buffer, target)
    }

    fn supports(&self, target: ScreenTarget) -> bool {
        (**self).supports(target)
    }
}

impl<T: WallpaperSink + ?Sized> WallpaperSink for Arc<T> {
    fn apply_to_target(&self, buffer: &RgbaImage, target: ScreenTarget) -> std::result::Result<(), SinkError> {
        (**self).apply_to_target(buffer, target)
    }

    fn supports(&self, target: ScreenTarget) -> bool {
        (**self).supports(target)
    }
}

/// Project directories abstraction
#[derive(Debug, Clone)]
pub struct ProjectDirectories {
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl ProjectDirectories {
    pub fn new(config_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self { config_dir, cache_dir }
    }

    /// Platform directories for the application, created if missing.
    pub fn discover() -> Result<Self> {
        let proj_dirs = ProjectDirs::from("com", "wallrotate", "wallrotate")
            .context("Failed to get project directories")?;
        let dirs = Self::new(
            proj_dirs.config_dir().to_path_buf(),
            proj_dirs.cache_dir().to_path_buf(),
        );
        std::fs::create_dir_all(&dirs.config_dir)
            .with_context(|| format!("Failed to create {}", dirs.config_dir.display()))?;
        std::fs::create_dir_all(&dirs.cache_dir)
            .with_context(|| format!("Failed to create {}", dirs.cache_dir.display()))?;
        Ok(dirs)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }
}
