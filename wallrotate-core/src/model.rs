use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RotatorError;

/// Normalized crop window in source-image space, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl CropRect {
    pub const FULL: CropRect = CropRect {
        left: 0.0,
        top: 0.0,
        right: 1.0,
        bottom: 1.0,
    };

    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self { left, top, right, bottom }
    }

    /// All edges inside [0,1] with a positive width and height.
    pub fn is_valid(&self) -> bool {
        let in_range = |v: f32| (0.0..=1.0).contains(&v);
        in_range(self.left)
            && in_range(self.top)
            && in_range(self.right)
            && in_range(self.bottom)
            && self.left < self.right
            && self.top < self.bottom
    }
}

impl Default for CropRect {
    fn default() -> Self {
        CropRect::FULL
    }
}

impl FromStr for CropRect {
    type Err = String;

    /// Parses `left,top,right,bottom`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<f32> = s
            .split(',')
            .map(|p| p.trim().parse::<f32>())
            .collect::<Result<_, _>>()
            .map_err(|e| format!("invalid crop rect '{}': {}", s, e))?;
        match parts.as_slice() {
            [l, t, r, b] => {
                let rect = CropRect::new(*l, *t, *r, *b);
                if rect.is_valid() {
                    Ok(rect)
                } else {
                    Err(format!("crop rect '{}' must satisfy 0<=left<right<=1 and 0<=top<bottom<=1", s))
                }
            }
            _ => Err(format!("crop rect '{}' needs four comma separated values", s)),
        }
    }
}

/// One persisted wallpaper entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WallpaperConfig {
    pub image_ref: String,
    pub crop_rect: CropRect,
    #[serde(default)]
    pub rotation: f32,
    #[serde(default)]
    pub for_lock_screen: bool,
    #[serde(default)]
    pub for_home_screen: bool,
    pub id: i64,
}

impl WallpaperConfig {
    /// New entry stamped with the current time in milliseconds as its id.
    pub fn new(image_ref: impl Into<String>, crop_rect: CropRect, rotation: f32) -> Self {
        Self {
            image_ref: image_ref.into(),
            crop_rect,
            rotation,
            for_lock_screen: false,
            for_home_screen: true,
            id: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_targets(mut self, home: bool, lock: bool) -> Self {
        self.for_home_screen = home;
        self.for_lock_screen = lock;
        self
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn applies_to(&self, target: ScreenTarget) -> bool {
        match target {
            ScreenTarget::Home => self.for_home_screen,
            ScreenTarget::Lock => self.for_lock_screen,
        }
    }
}

/// Displayable surface a wallpaper is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenTarget {
    Home,
    Lock,
}

impl ScreenTarget {
    pub const ALL: [ScreenTarget; 2] = [ScreenTarget::Home, ScreenTarget::Lock];

    /// Suffix used for per-target settings keys.
    pub fn key(&self) -> &'static str {
        match self {
            ScreenTarget::Home => "home",
            ScreenTarget::Lock => "lock",
        }
    }
}

impl fmt::Display for ScreenTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationMode {
    #[default]
    Sequential,
    Random,
}

impl RotationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationMode::Sequential => "sequential",
            RotationMode::Random => "random",
        }
    }

    /// Unknown strings fall back to sequential.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl FromStr for RotationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(RotationMode::Sequential),
            "random" => Ok(RotationMode::Random),
            other => Err(format!("unknown rotation mode '{}'", other)),
        }
    }
}

impl fmt::Display for RotationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index value meaning "nothing applied yet".
pub const UNSET_INDEX: i64 = -1;

/// Rotation mode plus the last applied index per target.
///
/// Indices are positions within the target's filtered subset of configs,
/// so they are only meaningful against the list they were computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationState {
    pub mode: RotationMode,
    pub home_index: i64,
    pub lock_index: i64,
}

impl RotationState {
    pub fn new(mode: RotationMode) -> Self {
        Self {
            mode,
            home_index: UNSET_INDEX,
            lock_index: UNSET_INDEX,
        }
    }

    pub fn index_for(&self, target: ScreenTarget) -> i64 {
        match target {
            ScreenTarget::Home => self.home_index,
            ScreenTarget::Lock => self.lock_index,
        }
    }

    pub fn with_index(mut self, target: ScreenTarget, index: i64) -> Self {
        match target {
            ScreenTarget::Home => self.home_index = index,
            ScreenTarget::Lock => self.lock_index = index,
        }
        self
    }
}

impl Default for RotationState {
    fn default() -> Self {
        RotationState::new(RotationMode::default())
    }
}

/// Pixel size of the device display the wallpaper is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMetrics {
    pub width: u32,
    pub height: u32,
}

impl DisplayMetrics {
    pub fn new(width: u32, height: u32) -> Result<Self, RotatorError> {
        if width == 0 || height == 0 {
            return Err(RotatorError::InvalidDisplay { width, height });
        }
        Ok(Self { width, height })
    }
}

impl Default for DisplayMetrics {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// Event that asks for a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Periodic tick from the scheduler.
    Scheduled,
    /// Device start; the periodic job is re-registered and one rotation runs.
    Boot,
    /// User asked for the next wallpaper on every target.
    Manual,
    /// User asked for the next lock screen wallpaper only.
    LockScreenOnly,
    /// Screen unlocked; honoured only when change-on-unlock is enabled.
    Unlock,
}

impl Trigger {
    pub fn lock_only(&self) -> bool {
        matches!(self, Trigger::LockScreenOnly)
    }
}
