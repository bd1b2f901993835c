use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::{DisplayMetrics, RotationMode, RotationState, ScreenTarget, WallpaperConfig, UNSET_INDEX};
use crate::services::{ConfigStore, ProjectDirectories};

pub const KEY_CONFIGS: &str = "configs";
pub const KEY_ROTATION_INTERVAL: &str = "rotation_interval";
pub const KEY_ROTATION_MODE: &str = "rotation_mode";
pub const KEY_CHANGE_ON_UNLOCK: &str = "change_on_unlock";
pub const KEY_DISPLAY_WIDTH: &str = "display_width";
pub const KEY_DISPLAY_HEIGHT: &str = "display_height";

pub const DEFAULT_ROTATION_INTERVAL_MINUTES: u32 = 60;

pub fn last_index_key(target: ScreenTarget) -> String {
    format!("last_index_{}", target.key())
}

/// Settings kept as one JSON object in a file.
///
/// Nothing is cached: every read goes to disk and every write reloads the
/// file, replaces one key and writes it back through a temporary sibling and
/// a rename. Several processes can share one file (the daemon and `add` from
/// another shell) without one writing back a stale copy of the others' keys.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            info!("Settings file {} does not exist yet", path.display());
        }
        let values = load(&path)?;
        debug!("Loaded {} settings from {}", values.len(), path.display());
        Ok(Self { path })
    }

    /// Store in the platform config directory.
    pub fn open_default(dirs: &ProjectDirectories) -> Result<Self> {
        Self::open(dirs.settings_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension(format!("json.{}.tmp", std::process::id()))
    }

    fn update(&self, edit: impl FnOnce(&mut Map<String, Value>) -> bool) -> Result<()> {
        let mut values = load(&self.path)?;
        if edit(&mut values) {
            self.write(&values)?;
        }
        Ok(())
    }

    fn write(&self, values: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let content = serde_json::to_string_pretty(values)?;
        let tmp = self.tmp_path();
        fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("Failed to replace {}", self.path.display()));
        }
        Ok(())
    }
}

fn load(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read settings from {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(&content)
        .with_context(|| format!("Failed to parse settings in {}", path.display()))?
    {
        Value::Object(map) => Ok(map),
        other => {
            warn!("Settings file {} holds {} instead of an object, treating it as empty", path.display(), type_name(&other));
            Ok(Map::new())
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl ConfigStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(load(&self.path)?.remove(key))
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.update(|values| {
            values.insert(key.to_string(), value);
            true
        })
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.update(|values| values.remove(key).is_some())
    }
}

/// In-memory store, for tests and previews.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: BTreeMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

impl<T: ConfigStore + ?Sized> ConfigStore for &mut T {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}

/// Typed view over a [`ConfigStore`].
#[derive(Debug)]
pub struct Settings<S> {
    store: S,
}

impl<S: ConfigStore> Settings<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => match serde_json::from_value(value) {
                Ok(parsed) => Ok(Some(parsed)),
                Err(e) => {
                    warn!("Ignoring malformed setting '{}': {}", key, e);
                    Ok(None)
                }
            },
        }
    }

    fn write<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).with_context(|| format!("Failed to serialize '{}'", key))?;
        self.store.set(key, value)
    }

    /// Stored wallpaper list. A malformed list is an error rather than an
    /// empty rotation.
    pub fn configs(&self) -> Result<Vec<WallpaperConfig>> {
        match self.store.get(KEY_CONFIGS)? {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value).context("Failed to parse stored wallpaper configs"),
        }
    }

    pub fn save_configs(&mut self, configs: &[WallpaperConfig]) -> Result<()> {
        info!("Saving {} wallpaper configs", configs.len());
        self.write(KEY_CONFIGS, &configs)
    }

    pub fn rotation_interval(&self) -> Result<u32> {
        Ok(self
            .read::<u32>(KEY_ROTATION_INTERVAL)?
            .unwrap_or(DEFAULT_ROTATION_INTERVAL_MINUTES)
            .max(1))
    }

    pub fn set_rotation_interval(&mut self, minutes: u32) -> Result<()> {
        self.write(KEY_ROTATION_INTERVAL, &minutes.max(1))
    }

    pub fn rotation_mode(&self) -> Result<RotationMode> {
        Ok(self
            .read::<String>(KEY_ROTATION_MODE)?
            .map(|s| RotationMode::parse_lenient(&s))
            .unwrap_or_default())
    }

    pub fn set_rotation_mode(&mut self, mode: RotationMode) -> Result<()> {
        self.write(KEY_ROTATION_MODE, &mode.as_str())
    }

    pub fn last_index(&self, target: ScreenTarget) -> Result<i64> {
        Ok(self.read::<i64>(&last_index_key(target))?.unwrap_or(UNSET_INDEX))
    }

    pub fn set_last_index(&mut self, target: ScreenTarget, index: i64) -> Result<()> {
        debug!("Persisting {} rotation index {}", target, index);
        self.write(&last_index_key(target), &index)
    }

    pub fn change_on_unlock(&self) -> Result<bool> {
        Ok(self.read::<bool>(KEY_CHANGE_ON_UNLOCK)?.unwrap_or(false))
    }

    pub fn set_change_on_unlock(&mut self, enabled: bool) -> Result<()> {
        self.write(KEY_CHANGE_ON_UNLOCK, &enabled)
    }

    pub fn display(&self) -> Result<DisplayMetrics> {
        let default = DisplayMetrics::default();
        let width = self.read::<u32>(KEY_DISPLAY_WIDTH)?.unwrap_or(default.width);
        let height = self.read::<u32>(KEY_DISPLAY_HEIGHT)?.unwrap_or(default.height);
        Ok(DisplayMetrics::new(width, height).unwrap_or(default))
    }

    pub fn set_display(&mut self, display: DisplayMetrics) -> Result<()> {
        self.write(KEY_DISPLAY_WIDTH, &display.width)?;
        self.write(KEY_DISPLAY_HEIGHT, &display.height)
    }

    pub fn rotation_state(&self) -> Result<RotationState> {
        Ok(RotationState {
            mode: self.rotation_mode()?,
            home_index: self.last_index(ScreenTarget::Home)?,
            lock_index: self.last_index(ScreenTarget::Lock)?,
        })
    }
}
