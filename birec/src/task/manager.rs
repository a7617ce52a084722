//! The task registry.
//!
//! Tasks are keyed by real room id; a short alias is resolved through the
//! playback API before insertion. Start/stop of all tasks fans out
//! concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use bili::api::{ApiHeaders, WebApi, build_client};
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{info, warn};

use crate::setting::{ResolvedTaskSettings, SettingsError, SettingsManager, TaskSettings};

use super::{Task, TaskStatus};

pub struct TaskManager {
    settings_manager: Arc<SettingsManager>,
    tasks: RwLock<HashMap<u64, Arc<Task>>>,
}

impl TaskManager {
    pub fn new(settings_manager: Arc<SettingsManager>) -> Arc<Self> {
        Arc::new(Self {
            settings_manager,
            tasks: RwLock::new(HashMap::new()),
        })
    }

    pub fn get(&self, room_id: u64) -> Option<Arc<Task>> {
        self.tasks.read().get(&room_id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Task>> {
        self.tasks.read().values().cloned().collect()
    }

    pub fn statuses(&self) -> Vec<TaskStatus> {
        let mut statuses: Vec<TaskStatus> = self.all().iter().map(|t| t.status()).collect();
        statuses.sort_by_key(|s| s.room_id);
        statuses
    }

    /// Resolve a possibly-short room id to the real one.
    pub async fn resolve_room_id(&self, room_id: u64) -> Result<u64, bili::ApiError> {
        let settings = self.settings_manager.settings();
        let webapi = WebApi::new(
            build_client(),
            ApiHeaders {
                user_agent: settings.header.user_agent.clone(),
                cookie: settings.header.cookie.clone(),
                referer: String::new(),
            },
        );
        let data = webapi.room_init(room_id).await?;
        data.get("room_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| bili::ApiError::Malformed("room_init without room_id".to_string()))
    }

    /// Create the tasks the settings file describes and start the enabled
    /// ones. Called once at startup.
    pub async fn load_all_tasks(self: &Arc<Self>) {
        let tasks = self.settings_manager.settings().tasks;
        let futures = tasks.into_iter().map(|task_settings| {
            let this = self.clone();
            async move {
                if let Err(e) = this.upsert_task(task_settings).await {
                    warn!("failed to load task: {e}");
                }
            }
        });
        join_all(futures).await;
    }

    /// Create (or reuse) the task for one settings entry and apply its
    /// enable flags.
    pub async fn upsert_task(
        self: &Arc<Self>,
        task_settings: TaskSettings,
    ) -> Result<Arc<Task>, SettingsError> {
        let room_id = task_settings.room_id;
        let resolved = {
            let settings = self.settings_manager.settings();
            ResolvedTaskSettings::resolve(&task_settings, &settings)
        };

        let task = {
            let existing = self.get(room_id);
            match existing {
                Some(task) => {
                    task.update_settings(resolved.clone());
                    task
                }
                None => {
                    let task = Task::new(resolved.clone()).await;
                    self.tasks.write().insert(room_id, task.clone());
                    info!(room_id, "task added");
                    task
                }
            }
        };

        if resolved.enable_monitor {
            task.enable_monitor().await;
        } else {
            task.disable_monitor().await;
        }
        if resolved.enable_recorder {
            task.enable_recorder().await;
        } else {
            task.disable_recorder(false).await;
        }

        Ok(task)
    }

    /// Add a brand-new task for `room_id_or_short`, resolving the alias and
    /// persisting it to the settings file.
    pub async fn add_task(self: &Arc<Self>, room_id_or_short: u64) -> Result<Arc<Task>, String> {
        let real_room_id = self
            .resolve_room_id(room_id_or_short)
            .await
            .map_err(|e| format!("cannot resolve room {room_id_or_short}: {e}"))?;

        if self.get(real_room_id).is_some() {
            return Err(format!("task for room {real_room_id} already exists"));
        }

        let task_settings = TaskSettings {
            room_id: real_room_id,
            ..Default::default()
        };
        self.settings_manager
            .add_task(task_settings.clone())
            .map_err(|e| e.to_string())?;
        self.upsert_task(task_settings)
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn remove_task(&self, room_id: u64) -> Result<(), String> {
        let task = self
            .tasks
            .write()
            .remove(&room_id)
            .ok_or_else(|| format!("no task for room {room_id}"))?;
        task.destroy().await;
        self.settings_manager
            .remove_task(room_id)
            .map_err(|e| e.to_string())
    }

    pub async fn start_all_tasks(&self) {
        let futures = self.all().into_iter().map(|task| async move {
            task.enable_monitor().await;
            task.enable_recorder().await;
        });
        join_all(futures).await;
    }

    pub async fn stop_all_tasks(&self, force: bool) {
        let futures = self.all().into_iter().map(|task| async move {
            task.disable_recorder(force).await;
            task.disable_monitor().await;
        });
        join_all(futures).await;
    }

    /// Push updated global settings into every task.
    pub fn apply_settings(&self) {
        let settings = self.settings_manager.settings();
        for task_settings in &settings.tasks {
            if let Some(task) = self.get(task_settings.room_id) {
                task.update_settings(ResolvedTaskSettings::resolve(task_settings, &settings));
            }
        }
    }

    /// Apply a patched per-task settings entry to the live task.
    pub async fn apply_task_settings(
        self: &Arc<Self>,
        room_id: u64,
    ) -> Result<(), SettingsError> {
        let Some(task_settings) = self.settings_manager.task_settings(room_id) else {
            return Err(SettingsError::Invalid(format!("no task for room {room_id}")));
        };
        self.upsert_task(task_settings).await?;
        Ok(())
    }
}
