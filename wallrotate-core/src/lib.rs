pub mod applier;
pub mod buffer;
pub mod error;
pub mod geometry;
pub mod model;
pub mod orchestrator;
pub mod sample;
pub mod scheduler;
pub mod selector;
pub mod services;
pub mod source;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod wallpaper;

pub use applier::{ApplyReport, RetryPolicy, WallpaperApplier};
pub use error::{Result, RotatorError, SinkError};
pub use model::{
    CropRect, DisplayMetrics, RotationMode, RotationState, ScreenTarget, Trigger, WallpaperConfig,
};
pub use orchestrator::{
    JobResult, RotationReport, RotationStatus, Rotator, RotatorState, SkipReason, TargetStatus,
};
pub use scheduler::{RotationSlot, SlotJob, SlotRun, SubmitOutcome};
pub use services::{ConfigStore, ImageSource, ProjectDirectories, Scheduler, WallpaperSink};
pub use source::LocalImageSource;
pub use storage::{JsonFileStore, MemoryStore, Settings};
pub use wallpaper::DesktopWallpaperSink;
