use image::RgbaImage;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
#[cfg(target_os = "linux")]
use std::process::Command;

use crate::error::SinkError;
use crate::model::ScreenTarget;
use crate::services::WallpaperSink;

#[cfg(target_os = "linux")]
pub fn get_desktop_environment() -> String {
    if let Ok(desktop_session) = std::env::var("DESKTOP_SESSION") {
        let session = desktop_session.to_lowercase();
        if ["gnome", "unity", "cinnamon", "mate", "xfce4", "lxde", "fluxbox",
            "openbox", "jwm", "kde"].contains(&session.as_str()) {
            return session;
        }

        if session.contains("xfce") || session.starts_with("xubuntu") {
            return "xfce4".to_string();
        } else if session.starts_with("ubuntu") {
            return "gnome".to_string();
        } else if session.starts_with("lubuntu") {
            return "lxde".to_string();
        } else if session.starts_with("kubuntu") {
            return "kde".to_string();
        }
    }

    if std::env::var("KDE_FULL_SESSION").unwrap_or_default() == "true" {
        return "kde".to_string();
    }

    if std::env::var("GNOME_DESKTOP_SESSION_ID").is_ok() {
        return "gnome".to_string();
    }

    "unknown".to_string()
}

/// Desktop wallpaper sink.
///
/// The rendered buffer is written as a PNG into the cache directory and
/// handed to the desktop by path. Desktops have no separate lock screen
/// surface here, so only [`ScreenTarget::Home`] is supported.
#[derive(Debug, Clone)]
pub struct DesktopWallpaperSink {
    cache_dir: PathBuf,
}

impl DesktopWallpaperSink {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Where the buffer for `target` is written before it is applied.
    pub fn output_path(&self, target: ScreenTarget) -> PathBuf {
        self.cache_dir.join(format!("current-{}.png", target.key()))
    }

    fn write_buffer(&self, buffer: &RgbaImage, path: &Path) -> Result<(), SinkError> {
        std::fs::create_dir_all(&self.cache_dir).map_err(|e| map_io(&e))?;
        buffer
            .save(path)
            .map_err(|e| SinkError::Io(format!("failed to write {}: {}", path.display(), e)))
    }
}

fn map_io(e: &std::io::Error) -> SinkError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        SinkError::Permission(e.to_string())
    } else {
        SinkError::Io(e.to_string())
    }
}

impl WallpaperSink for DesktopWallpaperSink {
    fn apply_to_target(&self, buffer: &RgbaImage, target: ScreenTarget) -> Result<(), SinkError> {
        if !self.supports(target) {
            return Err(SinkError::Io(format!("{} screen is not available on this desktop", target)));
        }
        let path = self.output_path(target);
        self.write_buffer(buffer, &path)?;
        let file_loc = path.to_string_lossy();

        match wallpaper::set_from_path(&file_loc) {
            Ok(_) => {
                info!("Wallpaper set successfully to: {}", file_loc);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to set wallpaper: {}", e);
                set_wallpaper_fallback(&path)
            }
        }
    }

    fn supports(&self, target: ScreenTarget) -> bool {
        target == ScreenTarget::Home
    }
}

#[cfg(target_os = "linux")]
fn set_wallpaper_fallback(file_path: &Path) -> Result<(), SinkError> {
    let file_loc = file_path.to_string_lossy().to_string();
    let loc = file_loc.as_str();
    let uri = format!("file://{}", file_loc);
    let desktop_env = get_desktop_environment();

    let mut command = match desktop_env.as_str() {
        "gnome" | "unity" | "cinnamon" => {
            let mut cmd = Command::new("gsettings");
            cmd.args(["set", "org.gnome.desktop.background", "picture-uri", uri.as_str()]);
            cmd
        }
        "mate" => {
            let mut cmd = Command::new("gsettings");
            cmd.args(["set", "org.mate.background", "picture-filename", loc]);
            cmd
        }
        "xfce4" => {
            let mut cmd = Command::new("xfconf-query");
            cmd.args(["-c", "xfce4-desktop", "-p", "/backdrop/screen0/monitor0/image-path", "-s", loc]);
            cmd
        }
        "lxde" => {
            let mut cmd = Command::new("pcmanfm");
            cmd.args(["--set-wallpaper", loc, "--wallpaper-mode=stretch"]);
            cmd
        }
        "fluxbox" | "jwm" | "openbox" => {
            let mut cmd = Command::new("fbsetbg");
            cmd.arg(loc);
            cmd
        }
        _ => {
            error!("Desktop environment '{}' not supported", desktop_env);
            return Err(SinkError::Io(format!("desktop environment '{}' not supported", desktop_env)));
        }
    };

    let output = command.output().map_err(|e| map_io(&e))?;
    if output.status.success() {
        info!("Wallpaper set through {} fallback: {}", desktop_env, file_loc);
        Ok(())
    } else {
        Err(SinkError::Io(format!(
            "{} fallback exited with {}: {}",
            desktop_env,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[cfg(not(target_os = "linux"))]
fn set_wallpaper_fallback(file_path: &Path) -> Result<(), SinkError> {
    error!("No fallback available for {}", file_path.display());
    Err(SinkError::Io("wallpaper service failed and no fallback is available".to_string()))
}
