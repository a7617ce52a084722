//! Settings model: the TOML file's sections and their validation bounds.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use bili::models::{QualityNumber, StreamFormat};

pub const MAX_TASKS: usize = 100;
pub const MAX_WEBHOOKS: usize = 50;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("settings serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub tasks: Vec<TaskSettings>,
    pub output: OutputSettings,
    pub logging: LoggingSettings,
    pub header: HeaderSettings,
    pub danmaku: DanmakuSettings,
    pub recorder: RecorderSettings,
    pub postprocessing: PostprocessingSettings,
    pub space: SpaceSettings,
    pub notifier: NotifierSettings,
    pub webhooks: Vec<WebhookSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskSettings {
    pub room_id: u64,
    pub enable_monitor: bool,
    pub enable_recorder: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<HeaderOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub danmaku: Option<DanmakuOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorder: Option<RecorderOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postprocessing: Option<PostprocessingOptions>,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            room_id: 0,
            enable_monitor: true,
            enable_recorder: true,
            output: None,
            header: None,
            danmaku: None,
            recorder: None,
            postprocessing: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputSettings {
    pub out_dir: PathBuf,
    pub path_template: String,
    /// Bytes; 0 disables the limit. Valid values: 0 or whole GiB up to 20.
    pub filesize_limit: u64,
    /// Seconds; 0 disables the limit. Valid values: 0 or whole hours up to 24.
    pub duration_limit: u64,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("."),
            path_template: "{roomid}/blive_{roomid}_{year}-{month}-{day}-{hour}{minute}{second}"
                .to_string(),
            filesize_limit: 0,
            duration_limit: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputOptions {
    pub out_dir: Option<PathBuf>,
    pub path_template: Option<String>,
    pub filesize_limit: Option<u64>,
    pub duration_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub log_dir: PathBuf,
    pub console_log_level: String,
    pub backup_count: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            console_log_level: "info".to_string(),
            backup_count: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeaderSettings {
    pub user_agent: String,
    pub cookie: String,
}

impl Default for HeaderSettings {
    fn default() -> Self {
        Self {
            user_agent: bili::api::DEFAULT_USER_AGENT.to_string(),
            cookie: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeaderOptions {
    pub user_agent: Option<String>,
    pub cookie: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DanmakuSettings {
    pub danmu_uname: bool,
    pub record_gift_send: bool,
    pub record_free_gifts: bool,
    pub record_guard_buy: bool,
    pub record_super_chat: bool,
    pub save_raw_danmaku: bool,
}

impl Default for DanmakuSettings {
    fn default() -> Self {
        Self {
            danmu_uname: false,
            record_gift_send: false,
            record_free_gifts: false,
            record_guard_buy: false,
            record_super_chat: false,
            save_raw_danmaku: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DanmakuOptions {
    pub danmu_uname: Option<bool>,
    pub record_gift_send: Option<bool>,
    pub record_free_gifts: Option<bool>,
    pub record_guard_buy: Option<bool>,
    pub record_super_chat: Option<bool>,
    pub save_raw_danmaku: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecorderSettings {
    pub quality_number: QualityNumber,
    pub stream_format: StreamFormat,
    /// Seconds without produced data before the recording counts as
    /// interrupted.
    pub disconnection_timeout: u64,
    /// Write buffer, bytes. Must be a power-of-two multiple within
    /// [4 KiB, 512 MiB].
    pub buffer_size: usize,
    pub save_cover: bool,
    /// CDN host preference fragments, earlier wins.
    pub stream_host_prefs: Vec<String>,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            quality_number: 10000,
            stream_format: StreamFormat::Flv,
            disconnection_timeout: 600,
            buffer_size: 8 * 1024,
            save_cover: false,
            stream_host_prefs: bili::live::DEFAULT_STREAM_HOST_PREFS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecorderOptions {
    pub quality_number: Option<QualityNumber>,
    pub stream_format: Option<StreamFormat>,
    pub disconnection_timeout: Option<u64>,
    pub buffer_size: Option<usize>,
    pub save_cover: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStrategy {
    #[default]
    Auto,
    Never,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostprocessingSettings {
    pub remux_to_mp4: bool,
    pub inject_extra_metadata: bool,
    pub delete_source: DeleteStrategy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostprocessingOptions {
    pub remux_to_mp4: Option<bool>,
    pub inject_extra_metadata: Option<bool>,
    pub delete_source: Option<DeleteStrategy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpaceSettings {
    /// Seconds between free-space polls.
    pub check_interval: u64,
    /// Bytes of free space below which recording is considered at risk.
    pub space_threshold: u64,
    /// Days to keep old recordings when reclaiming; 0 disables reclaiming.
    pub recycle_records: u64,
}

impl Default for SpaceSettings {
    fn default() -> Self {
        Self {
            check_interval: 60,
            space_threshold: GIB,
            recycle_records: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifierSettings {
    pub serverchan: ServerchanSettings,
    pub telegram: TelegramSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerchanSettings {
    pub enabled: bool,
    pub sendkey: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelegramSettings {
    pub enabled: bool,
    pub token: String,
    pub chat_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookSettings {
    pub url: String,
    /// Empty means every event type.
    pub event_types: Vec<String>,
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.tasks.len() > MAX_TASKS {
            return Err(SettingsError::Invalid(format!(
                "too many tasks: {} (max {MAX_TASKS})",
                self.tasks.len()
            )));
        }
        if self.webhooks.len() > MAX_WEBHOOKS {
            return Err(SettingsError::Invalid(format!(
                "too many webhooks: {} (max {MAX_WEBHOOKS})",
                self.webhooks.len()
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for task in &self.tasks {
            if task.room_id == 0 {
                return Err(SettingsError::Invalid("task with room_id 0".to_string()));
            }
            if !seen.insert(task.room_id) {
                return Err(SettingsError::Invalid(format!(
                    "duplicate task for room {}",
                    task.room_id
                )));
            }
            if let Some(recorder) = &task.recorder {
                if let Some(quality) = recorder.quality_number {
                    validate_quality(quality)?;
                }
                if let Some(buffer_size) = recorder.buffer_size {
                    validate_buffer_size(buffer_size)?;
                }
            }
            if let Some(output) = &task.output {
                if let Some(limit) = output.filesize_limit {
                    validate_filesize_limit(limit)?;
                }
                if let Some(limit) = output.duration_limit {
                    validate_duration_limit(limit)?;
                }
            }
        }

        validate_quality(self.recorder.quality_number)?;
        validate_buffer_size(self.recorder.buffer_size)?;
        validate_filesize_limit(self.output.filesize_limit)?;
        validate_duration_limit(self.output.duration_limit)?;

        for webhook in &self.webhooks {
            if url::Url::parse(&webhook.url).is_err() {
                return Err(SettingsError::Invalid(format!(
                    "invalid webhook url: {}",
                    webhook.url
                )));
            }
        }

        Ok(())
    }
}

fn validate_quality(quality: QualityNumber) -> Result<(), SettingsError> {
    if !bili::models::QUALITY_NUMBERS.contains(&quality) {
        return Err(SettingsError::Invalid(format!(
            "invalid quality_number: {quality}"
        )));
    }
    Ok(())
}

fn validate_filesize_limit(limit: u64) -> Result<(), SettingsError> {
    if limit == 0 {
        return Ok(());
    }
    if limit % GIB != 0 || !(1..=20).contains(&(limit / GIB)) {
        return Err(SettingsError::Invalid(format!(
            "filesize_limit must be 0 or 1..=20 GiB, got {limit}"
        )));
    }
    Ok(())
}

fn validate_duration_limit(limit: u64) -> Result<(), SettingsError> {
    if limit == 0 {
        return Ok(());
    }
    if limit % 3600 != 0 || !(1..=24).contains(&(limit / 3600)) {
        return Err(SettingsError::Invalid(format!(
            "duration_limit must be 0 or 1..=24 hours in seconds, got {limit}"
        )));
    }
    Ok(())
}

fn validate_buffer_size(size: usize) -> Result<(), SettingsError> {
    const MIN: usize = 4 * 1024;
    const MAX: usize = 512 * 1024 * 1024;
    if !(MIN..=MAX).contains(&size) || size % 2 != 0 {
        return Err(SettingsError::Invalid(format!(
            "buffer_size must be an even value within [4KiB, 512MiB], got {size}"
        )));
    }
    Ok(())
}

/// The settings bundles a task actually runs with, after laying the
/// per-task overrides over the global sections.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTaskSettings {
    pub room_id: u64,
    pub enable_monitor: bool,
    pub enable_recorder: bool,
    pub output: OutputSettings,
    pub header: HeaderSettings,
    pub danmaku: DanmakuSettings,
    pub recorder: RecorderSettings,
    pub postprocessing: PostprocessingSettings,
}

impl ResolvedTaskSettings {
    pub fn resolve(task: &TaskSettings, settings: &Settings) -> Self {
        let mut output = settings.output.clone();
        if let Some(options) = &task.output {
            if let Some(v) = &options.out_dir {
                output.out_dir = v.clone();
            }
            if let Some(v) = &options.path_template {
                output.path_template = v.clone();
            }
            if let Some(v) = options.filesize_limit {
                output.filesize_limit = v;
            }
            if let Some(v) = options.duration_limit {
                output.duration_limit = v;
            }
        }

        let mut header = settings.header.clone();
        if let Some(options) = &task.header {
            if let Some(v) = &options.user_agent {
                header.user_agent = v.clone();
            }
            if let Some(v) = &options.cookie {
                header.cookie = v.clone();
            }
        }

        let mut danmaku = settings.danmaku.clone();
        if let Some(options) = &task.danmaku {
            if let Some(v) = options.danmu_uname {
                danmaku.danmu_uname = v;
            }
            if let Some(v) = options.record_gift_send {
                danmaku.record_gift_send = v;
            }
            if let Some(v) = options.record_free_gifts {
                danmaku.record_free_gifts = v;
            }
            if let Some(v) = options.record_guard_buy {
                danmaku.record_guard_buy = v;
            }
            if let Some(v) = options.record_super_chat {
                danmaku.record_super_chat = v;
            }
            if let Some(v) = options.save_raw_danmaku {
                danmaku.save_raw_danmaku = v;
            }
        }

        let mut recorder = settings.recorder.clone();
        if let Some(options) = &task.recorder {
            if let Some(v) = options.quality_number {
                recorder.quality_number = v;
            }
            if let Some(v) = options.stream_format {
                recorder.stream_format = v;
            }
            if let Some(v) = options.disconnection_timeout {
                recorder.disconnection_timeout = v;
            }
            if let Some(v) = options.buffer_size {
                recorder.buffer_size = v;
            }
            if let Some(v) = options.save_cover {
                recorder.save_cover = v;
            }
        }

        let mut postprocessing = settings.postprocessing.clone();
        if let Some(options) = &task.postprocessing {
            if let Some(v) = options.remux_to_mp4 {
                postprocessing.remux_to_mp4 = v;
            }
            if let Some(v) = options.inject_extra_metadata {
                postprocessing.inject_extra_metadata = v;
            }
            if let Some(v) = options.delete_source {
                postprocessing.delete_source = v;
            }
        }

        Self {
            room_id: task.room_id,
            enable_monitor: task.enable_monitor,
            enable_recorder: task.enable_recorder,
            output,
            header,
            danmaku,
            recorder,
            postprocessing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_quality_bounds() {
        let mut settings = Settings::default();
        settings.recorder.quality_number = 401;
        settings.validate().unwrap();

        settings.recorder.quality_number = 123;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_filesize_limit_bounds() {
        let mut settings = Settings::default();
        settings.output.filesize_limit = GIB;
        settings.validate().unwrap();
        settings.output.filesize_limit = 20 * GIB;
        settings.validate().unwrap();

        settings.output.filesize_limit = 21 * GIB;
        assert!(settings.validate().is_err());
        settings.output.filesize_limit = GIB + 1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_duration_limit_bounds() {
        let mut settings = Settings::default();
        settings.output.duration_limit = 24 * 3600;
        settings.validate().unwrap();
        settings.output.duration_limit = 3601;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_duplicate_rooms_rejected() {
        let mut settings = Settings::default();
        settings.tasks = vec![
            TaskSettings {
                room_id: 1,
                ..Default::default()
            },
            TaskSettings {
                room_id: 1,
                ..Default::default()
            },
        ];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_task_overrides_shadow_globals() {
        let mut settings = Settings::default();
        settings.recorder.quality_number = 10000;
        let task = TaskSettings {
            room_id: 5,
            recorder: Some(RecorderOptions {
                quality_number: Some(401),
                ..Default::default()
            }),
            ..Default::default()
        };

        let resolved = ResolvedTaskSettings::resolve(&task, &settings);
        assert_eq!(resolved.recorder.quality_number, 401);
        // Untouched fields keep the global values.
        assert_eq!(
            resolved.recorder.buffer_size,
            settings.recorder.buffer_size
        );
    }

    #[test]
    fn test_toml_round_trip() {
        let mut settings = Settings::default();
        settings.tasks.push(TaskSettings {
            room_id: 23058,
            ..Default::default()
        });
        settings.webhooks.push(WebhookSettings {
            url: "https://example.com/hook".to_string(),
            event_types: vec!["LiveBeganEvent".to_string()],
        });

        let text = toml::to_string_pretty(&settings).unwrap();
        let parsed: Settings = toml::from_str(&text).unwrap();
        assert_eq!(parsed, settings);
    }
}
