use thiserror::Error;

/// Failures reported by a platform wallpaper sink.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The platform refused the call (missing wallpaper permission).
    #[error("wallpaper permission denied: {0}")]
    Permission(String),
    /// The platform accepted the call but failed to store or show the bitmap.
    #[error("wallpaper sink I/O failure: {0}")]
    Io(String),
}

/// Error taxonomy of the rotation pipeline.
#[derive(Debug, Clone, Error)]
pub enum RotatorError {
    /// Image unreadable: missing file, revoked permission, failed download.
    #[error("cannot access image {image_ref}: {reason}")]
    Access { image_ref: String, reason: String },

    /// Corrupt or unsupported image data, or a zero-area geometry.
    #[error("cannot decode image: {0}")]
    Decode(String),

    /// The sink kept rejecting the bitmap after every retry.
    #[error("failed to apply wallpaper after {attempts} attempt(s): {source}")]
    Apply { attempts: u32, source: SinkError },

    #[error("invalid display dimensions {width}x{height}")]
    InvalidDisplay { width: u32, height: u32 },

    /// The settings store could not be read or written.
    #[error("settings store error: {0}")]
    Store(String),

    /// The worker running the rotation panicked or was cancelled.
    #[error("rotation task interrupted: {0}")]
    Interrupted(String),
}

impl RotatorError {
    pub fn access(image_ref: &str, reason: impl ToString) -> Self {
        RotatorError::Access {
            image_ref: image_ref.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether running the same rotation again could succeed without user action.
    pub fn is_retriable(&self) -> bool {
        matches!(self, RotatorError::Apply { .. } | RotatorError::Store(_))
    }
}

impl From<image::ImageError> for RotatorError {
    fn from(err: image::ImageError) -> Self {
        RotatorError::Decode(err.to_string())
    }
}

impl From<anyhow::Error> for RotatorError {
    fn from(err: anyhow::Error) -> Self {
        RotatorError::Store(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, RotatorError>;
