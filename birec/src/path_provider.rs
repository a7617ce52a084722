//! Output path construction.
//!
//! Combines the configured directory, the user's path template and the
//! room/streamer context into a concrete file path, avoiding collisions by
//! appending `_(n)` before the extension.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Datelike, Local, Timelike};
use pipeline_common::{PathTemplateError, expand_path_template};

/// Everything the template variables can refer to.
#[derive(Debug, Clone, Default)]
pub struct PathContext {
    pub room_id: u64,
    pub user_name: String,
    pub title: String,
    pub area_name: String,
    pub parent_area_name: String,
}

fn template_vars(context: &PathContext, time: DateTime<Local>) -> HashMap<&'static str, String> {
    HashMap::from([
        ("roomid", context.room_id.to_string()),
        ("uname", context.user_name.clone()),
        ("title", context.title.clone()),
        ("area", context.area_name.clone()),
        ("parent_area", context.parent_area_name.clone()),
        ("year", format!("{:04}", time.year())),
        ("month", format!("{:02}", time.month())),
        ("day", format!("{:02}", time.day())),
        ("hour", format!("{:02}", time.hour())),
        ("minute", format!("{:02}", time.minute())),
        ("second", format!("{:02}", time.second())),
    ])
}

/// Build `out_dir / expanded_template + .extension`, resolving collisions
/// with a `_(n)` suffix.
pub fn build_output_path(
    out_dir: &PathBuf,
    template: &str,
    context: &PathContext,
    time: DateTime<Local>,
    extension: &str,
) -> Result<PathBuf, PathTemplateError> {
    let relative = expand_path_template(template, &template_vars(context, time))?;
    let base = out_dir.join(relative);

    let mut candidate = base.with_extension(extension);
    let mut counter = 1;
    while candidate.exists() {
        let stem = base
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        candidate = base.with_file_name(format!("{stem}_({counter})")).with_extension(extension);
        counter += 1;
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn context() -> PathContext {
        PathContext {
            room_id: 23058,
            user_name: "somebody".to_string(),
            title: "a stream".to_string(),
            area_name: "area".to_string(),
            parent_area_name: "parent".to_string(),
        }
    }

    fn time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 7, 15, 21, 5, 9).unwrap()
    }

    #[test]
    fn test_variables_expanded() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_output_path(
            &dir.path().to_path_buf(),
            "{roomid}/{year}-{month}-{day}/{uname}_{hour}{minute}{second}",
            &context(),
            time(),
            "flv",
        )
        .unwrap();

        assert_eq!(
            path,
            dir.path()
                .join("23058/2024-07-15/somebody_210509.flv")
        );
    }

    #[test]
    fn test_collision_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        let first = build_output_path(
            &dir.path().to_path_buf(),
            "{roomid}",
            &context(),
            time(),
            "flv",
        )
        .unwrap();
        std::fs::create_dir_all(first.parent().unwrap()).unwrap();
        std::fs::write(&first, b"").unwrap();

        let second = build_output_path(
            &dir.path().to_path_buf(),
            "{roomid}",
            &context(),
            time(),
            "flv",
        )
        .unwrap();
        assert_eq!(second.file_name().unwrap(), "23058_(1).flv");

        std::fs::write(&second, b"").unwrap();
        let third = build_output_path(
            &dir.path().to_path_buf(),
            "{roomid}",
            &context(),
            time(),
            "flv",
        )
        .unwrap();
        assert_eq!(third.file_name().unwrap(), "23058_(2).flv");
    }
}
