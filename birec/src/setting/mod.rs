//! Settings loading, persistence and patching.

mod models;

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::info;

pub use models::*;

/// Owns the settings file: loads it at startup, applies JSON patches from
/// the admin API, and writes the result back.
pub struct SettingsManager {
    path: PathBuf,
    settings: RwLock<Settings>,
}

impl SettingsManager {
    /// Load from `path`, creating the file with defaults when absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let settings = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let settings: Settings = toml::from_str(&text)?;
            settings.validate()?;
            settings
        } else {
            info!("settings file not found, creating {}", path.display());
            let settings = Settings::default();
            write_settings(&path, &settings)?;
            settings
        };

        Ok(Self {
            path,
            settings: RwLock::new(settings),
        })
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn task_settings(&self, room_id: u64) -> Option<TaskSettings> {
        self.settings
            .read()
            .tasks
            .iter()
            .find(|t| t.room_id == room_id)
            .cloned()
    }

    pub fn resolved_task_settings(&self, room_id: u64) -> Option<ResolvedTaskSettings> {
        let settings = self.settings.read();
        settings
            .tasks
            .iter()
            .find(|t| t.room_id == room_id)
            .map(|task| ResolvedTaskSettings::resolve(task, &settings))
    }

    /// Replace the whole settings value (validated) and persist.
    pub fn replace(&self, settings: Settings) -> Result<(), SettingsError> {
        settings.validate()?;
        write_settings(&self.path, &settings)?;
        *self.settings.write() = settings;
        Ok(())
    }

    /// Apply a partial JSON object onto the current settings, validate and
    /// persist. Returns the new value.
    pub fn apply_patch(&self, patch: &Value) -> Result<Settings, SettingsError> {
        let current = self.settings();
        let mut merged = serde_json::to_value(&current)
            .map_err(|e| SettingsError::Invalid(e.to_string()))?;
        merge_json(&mut merged, patch);

        let settings: Settings = serde_json::from_value(merged)
            .map_err(|e| SettingsError::Invalid(e.to_string()))?;
        self.replace(settings.clone())?;
        Ok(settings)
    }

    /// Patch the task entry of one room.
    pub fn apply_task_patch(
        &self,
        room_id: u64,
        patch: &Value,
    ) -> Result<TaskSettings, SettingsError> {
        let mut settings = self.settings();
        let task = settings
            .tasks
            .iter_mut()
            .find(|t| t.room_id == room_id)
            .ok_or_else(|| SettingsError::Invalid(format!("no task for room {room_id}")))?;

        let mut merged =
            serde_json::to_value(&*task).map_err(|e| SettingsError::Invalid(e.to_string()))?;
        merge_json(&mut merged, patch);
        let mut patched: TaskSettings = serde_json::from_value(merged)
            .map_err(|e| SettingsError::Invalid(e.to_string()))?;
        patched.room_id = room_id;
        *task = patched.clone();

        self.replace(settings)?;
        Ok(patched)
    }

    pub fn add_task(&self, task: TaskSettings) -> Result<(), SettingsError> {
        let mut settings = self.settings();
        settings.tasks.push(task);
        self.replace(settings)
    }

    pub fn remove_task(&self, room_id: u64) -> Result<(), SettingsError> {
        let mut settings = self.settings();
        settings.tasks.retain(|t| t.room_id != room_id);
        self.replace(settings)
    }
}

fn write_settings(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let text = toml::to_string_pretty(settings)?;
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Recursive JSON object merge; non-object values replace wholesale.
fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && patch_value.is_object() => {
                        merge_json(base_value, patch_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> (tempfile::TempDir, SettingsManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = SettingsManager::load(dir.path().join("settings.toml")).unwrap();
        (dir, manager)
    }

    #[test]
    fn test_load_creates_default_file() {
        let (dir, manager) = manager();
        assert!(dir.path().join("settings.toml").exists());
        assert_eq!(manager.settings(), Settings::default());
    }

    #[test]
    fn test_patch_updates_and_persists() {
        let (dir, manager) = manager();

        manager
            .apply_patch(&json!({"recorder": {"quality_number": 401}}))
            .unwrap();
        assert_eq!(manager.settings().recorder.quality_number, 401);

        // Reload from disk to verify persistence.
        let reloaded = SettingsManager::load(dir.path().join("settings.toml")).unwrap();
        assert_eq!(reloaded.settings().recorder.quality_number, 401);
    }

    #[test]
    fn test_invalid_patch_rejected_and_state_unchanged() {
        let (_dir, manager) = manager();
        let before = manager.settings();

        let result = manager.apply_patch(&json!({"recorder": {"quality_number": 42}}));
        assert!(result.is_err());
        assert_eq!(manager.settings(), before);
    }

    #[test]
    fn test_task_patch() {
        let (_dir, manager) = manager();
        manager
            .add_task(TaskSettings {
                room_id: 23058,
                ..Default::default()
            })
            .unwrap();

        let patched = manager
            .apply_task_patch(23058, &json!({"enable_recorder": false}))
            .unwrap();
        assert!(!patched.enable_recorder);
        assert!(patched.enable_monitor);
    }
}
