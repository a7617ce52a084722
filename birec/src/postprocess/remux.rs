//! The ffmpeg remux step.
//!
//! `ffmpeg -i in.flv -i metadata -map_metadata 1 -c copy` with the SEI
//! filter that strips the user-data NAL units some providers inject.
//! Success requires a zero exit code and a stderr free of
//! "Non-monotonous DTS"; the latter downgrades the result to `Warned`.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum RemuxOutcome {
    Succeeded,
    Warned(String),
    Failed(String),
}

/// Parse a `time=HH:MM:SS.cc` fragment from an ffmpeg progress line.
fn parse_progress_time(line: &str) -> Option<f64> {
    let start = line.find("time=")? + 5;
    let rest = &line[start..];
    let end = rest.find(' ').unwrap_or(rest.len());
    let time = &rest[..end];

    let mut parts = time.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Run the remux, reporting progress in seconds of output written.
pub async fn remux_to_mp4(
    input: &Path,
    output: &Path,
    ffmetadata: &str,
    progress: impl Fn(f64) + Send + 'static,
) -> std::io::Result<RemuxOutcome> {
    let metadata_file = tempfile::NamedTempFile::new()?;
    std::fs::write(metadata_file.path(), ffmetadata)?;

    let mut child = Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-i")
        .arg(metadata_file.path())
        .args([
            "-map_metadata",
            "1",
            "-c",
            "copy",
            "-bsf:v",
            "filter_units=remove_types=12",
        ])
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stderr = child.stderr.take().expect("stderr piped");
    let mut lines = BufReader::new(stderr).lines();

    let mut collected = Vec::new();
    let mut non_monotonous = false;
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(seconds) = parse_progress_time(&line) {
            progress(seconds);
        }
        if line.contains("Non-monotonous DTS") {
            non_monotonous = true;
        }
        debug!("ffmpeg: {line}");
        collected.push(line);
        if collected.len() > 200 {
            collected.remove(0);
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        return Ok(RemuxOutcome::Failed(format!(
            "ffmpeg exited with {status}: {}",
            collected.last().cloned().unwrap_or_default()
        )));
    }
    if non_monotonous {
        return Ok(RemuxOutcome::Warned(
            "Non-monotonous DTS in output".to_string(),
        ));
    }
    Ok(RemuxOutcome::Succeeded)
}
