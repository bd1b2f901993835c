use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use std::path::{Path, PathBuf};
use wallrotate_core::*;

pub type CliRotator = Rotator<JsonFileStore, LocalImageSource, DesktopWallpaperSink>;

/// Settings editing and one-shot rotation on top of the JSON store.
pub struct WallCliApp {
    settings: Settings<JsonFileStore>,
    cache_dir: PathBuf,
    display: Option<DisplayMetrics>,
}

impl WallCliApp {
    /// Open the store at `store_path`, or the platform default.
    pub fn new(store_path: Option<PathBuf>, display: Option<DisplayMetrics>) -> Result<Self> {
        let dirs = ProjectDirectories::discover()?;
        let store = match store_path {
            Some(path) => JsonFileStore::open(path)?,
            None => JsonFileStore::open_default(&dirs)?,
        };
        Ok(Self::with_store(store, dirs.cache_dir, display))
    }

    pub fn with_store(store: JsonFileStore, cache_dir: PathBuf, display: Option<DisplayMetrics>) -> Self {
        Self {
            settings: Settings::new(store),
            cache_dir,
            display,
        }
    }

    pub fn settings(&self) -> &Settings<JsonFileStore> {
        &self.settings
    }

    fn display(&self) -> Result<DisplayMetrics> {
        match self.display {
            Some(display) => Ok(display),
            None => self.settings.display(),
        }
    }

    pub fn list(&self) -> Result<()> {
        let configs = self.settings.configs()?;
        let state = self.settings.rotation_state()?;
        println!(
            "Mode: {} | Interval: {} min | Change on unlock: {}",
            state.mode,
            self.settings.rotation_interval()?,
            if self.settings.change_on_unlock()? { "on" } else { "off" }
        );
        if configs.is_empty() {
            println!("No wallpapers configured. Add one with `wallcli add <image>`.");
            return Ok(());
        }

        for config in &configs {
            let added = DateTime::<Utc>::from_timestamp_millis(config.id)
                .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string());
            let targets = match (config.for_home_screen, config.for_lock_screen) {
                (true, true) => "home+lock",
                (true, false) => "home",
                (false, true) => "lock",
                (false, false) => "none",
            };
            let c = config.crop_rect;
            println!(
                "{}  [{:<9}] {}  crop {:.2},{:.2},{:.2},{:.2}  rot {:.0}°  (added {})",
                config.id, targets, config.image_ref, c.left, c.top, c.right, c.bottom, config.rotation, added
            );
        }
        Ok(())
    }

    /// Add a config. With neither target flag the entry goes to the home screen.
    pub fn add(
        &mut self,
        image: &str,
        crop: CropRect,
        rotation: f32,
        home: bool,
        lock: bool,
    ) -> Result<WallpaperConfig> {
        if !rotation.is_finite() {
            bail!("rotation must be a finite number of degrees");
        }
        let image_ref = resolve_image_ref(image)?;
        let home = home || !lock;

        let mut configs = self.settings.configs()?;
        let mut config = WallpaperConfig::new(image_ref, crop, rotation).with_targets(home, lock);
        // Ids are creation timestamps; two adds within a millisecond would collide.
        while configs.iter().any(|c| c.id == config.id) {
            config.id += 1;
        }
        configs.push(config.clone());
        self.settings.save_configs(&configs)?;
        log::info!("Added wallpaper config {} for {}", config.id, config.image_ref);
        Ok(config)
    }

    /// Returns false when no config has `id`.
    pub fn remove(&mut self, id: i64) -> Result<bool> {
        let mut configs = self.settings.configs()?;
        let before = configs.len();
        configs.retain(|c| c.id != id);
        if configs.len() == before {
            return Ok(false);
        }
        self.settings.save_configs(&configs)?;
        Ok(true)
    }

    pub fn set_mode(&mut self, mode: RotationMode) -> Result<()> {
        self.settings.set_rotation_mode(mode)
    }

    pub fn set_interval(&mut self, minutes: u32) -> Result<()> {
        if minutes == 0 {
            bail!("interval must be at least one minute");
        }
        self.settings.set_rotation_interval(minutes)
    }

    pub fn set_change_on_unlock(&mut self, enabled: bool) -> Result<()> {
        self.settings.set_change_on_unlock(enabled)
    }

    pub fn set_display(&mut self, display: DisplayMetrics) -> Result<()> {
        self.settings.set_display(display)
    }

    /// Render config `id` for the display and write it to `out` instead of applying it.
    pub fn preview(&self, id: i64, out: &Path) -> Result<()> {
        let configs = self.settings.configs()?;
        let config = configs
            .iter()
            .find(|c| c.id == id)
            .with_context(|| format!("No wallpaper config with id {}", id))?;
        let applier = WallpaperApplier::new(LocalImageSource::new(), DesktopWallpaperSink::new(&self.cache_dir));
        let rendered = applier.render_image(config, self.display()?)?;
        rendered
            .save_with_format(out, image::ImageFormat::Png)
            .with_context(|| format!("Failed to write {}", out.display()))?;
        Ok(())
    }

    pub fn into_rotator(self) -> CliRotator {
        let rotator = Rotator::new(
            self.settings.into_inner(),
            LocalImageSource::new(),
            DesktopWallpaperSink::new(self.cache_dir),
        );
        match self.display {
            Some(display) => rotator.with_display(display),
            None => rotator,
        }
    }
}

/// Local paths are stored absolute so the daemon can run from any directory.
fn resolve_image_ref(image: &str) -> Result<String> {
    if image.starts_with("http://") || image.starts_with("https://") || image.starts_with("file://") {
        return Ok(image.to_string());
    }
    let path = std::fs::canonicalize(image).with_context(|| format!("Cannot find image {}", image))?;
    Ok(path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_app(dir: &Path) -> WallCliApp {
        let store = JsonFileStore::open(dir.join("settings.json")).unwrap();
        WallCliApp::with_store(store, dir.join("cache"), Some(DisplayMetrics::new(20, 10).unwrap()))
    }

    fn write_png(path: &Path, width: u32, height: u32) {
        std::fs::write(path, wallrotate_core::testing::png_bytes(width, height)).unwrap();
    }

    #[test]
    fn add_defaults_to_home_and_remove_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("a.png");
        write_png(&image, 8, 8);
        let mut app = open_app(dir.path());

        let config = app
            .add(image.to_str().unwrap(), CropRect::FULL, 0.0, false, false)
            .unwrap();
        assert!(config.for_home_screen);
        assert!(!config.for_lock_screen);
        assert!(Path::new(&config.image_ref).is_absolute());

        let second = app
            .add(image.to_str().unwrap(), CropRect::FULL, 90.0, false, true)
            .unwrap();
        assert_ne!(config.id, second.id);
        assert!(!second.for_home_screen);
        assert_eq!(app.settings().configs().unwrap().len(), 2);

        assert!(app.remove(config.id).unwrap());
        assert!(!app.remove(config.id).unwrap());
        assert_eq!(app.settings().configs().unwrap(), vec![second]);
    }

    #[test]
    fn add_rejects_missing_images() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = open_app(dir.path());
        let missing = dir.path().join("missing.png");
        assert!(app.add(missing.to_str().unwrap(), CropRect::FULL, 0.0, true, false).is_err());
        assert!(app.settings().configs().unwrap().is_empty());
    }

    #[test]
    fn preview_writes_display_sized_png() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("a.png");
        write_png(&image, 64, 48);
        let mut app = open_app(dir.path());
        let config = app
            .add(image.to_str().unwrap(), CropRect::new(0.0, 0.0, 0.5, 0.5), 270.0, true, false)
            .unwrap();

        let out = dir.path().join("preview.png");
        app.preview(config.id, &out).unwrap();
        let written = image::open(&out).unwrap();
        assert_eq!((written.width(), written.height()), (20, 10));
        assert!(app.preview(config.id + 1, &out).is_err());
    }

    #[test]
    fn settings_commands_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = open_app(dir.path());
        app.set_mode(RotationMode::Random).unwrap();
        app.set_interval(15).unwrap();
        app.set_change_on_unlock(true).unwrap();
        assert!(app.set_interval(0).is_err());

        let reopened = open_app(dir.path());
        assert_eq!(reopened.settings().rotation_mode().unwrap(), RotationMode::Random);
        assert_eq!(reopened.settings().rotation_interval().unwrap(), 15);
        assert!(reopened.settings().change_on_unlock().unwrap());
    }
}
