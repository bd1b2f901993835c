use log::{debug, error};
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use crate::error::RotatorError;
use crate::services::ImageSource;

/// Reads images from local paths, `file://` URIs and `http(s)://` URLs.
#[derive(Debug, Clone, Default)]
pub struct LocalImageSource {
    /// Directory that relative paths are resolved against.
    base_dir: Option<PathBuf>,
}

impl LocalImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve_path(&self, image_ref: &str) -> PathBuf {
        let raw = image_ref.strip_prefix("file://").unwrap_or(image_ref);
        let path = PathBuf::from(raw);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }

    fn open_remote(&self, url: &str) -> Result<Box<dyn Read + '_>, RotatorError> {
        let response = attohttpc::get(url)
            .send()
            .map_err(|e| RotatorError::access(url, e))?;
        if !response.is_success() {
            return Err(RotatorError::access(url, format!("HTTP {}", response.status())));
        }
        let bytes = response.bytes().map_err(|e| RotatorError::access(url, e))?;
        debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(Box::new(io::Cursor::new(bytes)))
    }
}

impl ImageSource for LocalImageSource {
    fn open(&self, image_ref: &str) -> Result<Box<dyn Read + '_>, RotatorError> {
        if image_ref.starts_with("http://") || image_ref.starts_with("https://") {
            return self.open_remote(image_ref);
        }

        let path = self.resolve_path(image_ref);
        match File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) => {
                error!("Cannot open image {}: {}", path.display(), e);
                let reason = match e.kind() {
                    io::ErrorKind::NotFound => "file not found".to_string(),
                    io::ErrorKind::PermissionDenied => "permission denied".to_string(),
                    _ => e.to_string(),
                };
                Err(RotatorError::access(image_ref, reason))
            }
        }
    }
}
