//! End-to-end settings behavior: a realistic TOML file loads, per-task
//! overrides resolve over the globals, and API-style patches persist.

use birec::setting::{ResolvedTaskSettings, SettingsManager};
use serde_json::json;

const SAMPLE: &str = r#"
[[tasks]]
room_id = 23058

[[tasks]]
room_id = 92613
enable_recorder = false

[tasks.recorder]
quality_number = 401
save_cover = true

[output]
out_dir = "/tmp/rec"
path_template = "{roomid}/{year}-{month}-{day}/{uname}_{hour}{minute}{second}"
filesize_limit = 1073741824
duration_limit = 3600

[header]
user_agent = "test-agent"
cookie = "SESSDATA=abc; DedeUserID=42"

[recorder]
quality_number = 10000
stream_format = "flv"
disconnection_timeout = 600

[postprocessing]
remux_to_mp4 = true
delete_source = "auto"

[[webhooks]]
url = "https://example.com/hook"
event_types = ["LiveBeganEvent", "LiveEndedEvent"]
"#;

fn load(sample: &str) -> (tempfile::TempDir, SettingsManager) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.toml");
    std::fs::write(&path, sample).unwrap();
    let manager = SettingsManager::load(&path).unwrap();
    (dir, manager)
}

#[test]
fn sample_file_loads_and_resolves() {
    let (_dir, manager) = load(SAMPLE);
    let settings = manager.settings();

    assert_eq!(settings.tasks.len(), 2);
    assert_eq!(settings.output.filesize_limit, 1 << 30);
    assert!(settings.postprocessing.remux_to_mp4);
    assert_eq!(settings.webhooks[0].event_types.len(), 2);

    // Second task overrides the recorder section, first inherits globals.
    let first = ResolvedTaskSettings::resolve(&settings.tasks[0], &settings);
    assert_eq!(first.recorder.quality_number, 10000);
    assert!(first.enable_recorder);

    let second = ResolvedTaskSettings::resolve(&settings.tasks[1], &settings);
    assert_eq!(second.recorder.quality_number, 401);
    assert!(second.recorder.save_cover);
    assert!(!second.enable_recorder);
    // Untouched sections still come from the globals.
    assert_eq!(second.header.user_agent, "test-agent");
}

#[test]
fn patches_survive_reload() {
    let (dir, manager) = load(SAMPLE);

    manager
        .apply_patch(&json!({"output": {"duration_limit": 7200}}))
        .unwrap();
    manager
        .apply_task_patch(92613, &json!({"enable_recorder": true}))
        .unwrap();

    let reloaded = SettingsManager::load(dir.path().join("settings.toml")).unwrap();
    let settings = reloaded.settings();
    assert_eq!(settings.output.duration_limit, 7200);
    assert!(settings.tasks[1].enable_recorder);
}

#[test]
fn invalid_file_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.toml");
    std::fs::write(&path, "[recorder]\nquality_number = 123\n").unwrap();
    assert!(SettingsManager::load(&path).is_err());
}
