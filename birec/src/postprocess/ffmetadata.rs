//! ffmetadata file generation.
//!
//! ffmpeg's metadata file format: a magic first line, `key=value` pairs
//! with `= ; # \` and newline escaped by backslash, then `[CHAPTER]`
//! blocks. Chapters are derived from the non-seamless join points, so the
//! MP4 exposes one chapter per uninterrupted recording stretch.

use flv_fix::{JoinPoint, MetaData};

use super::PostprocessContext;

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '=' | ';' | '#' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\\n"),
            c => out.push(c),
        }
    }
    out
}

fn format_timestamp(ms: f64) -> String {
    let total_seconds = (ms / 1000.0) as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total_seconds / 3600,
        (total_seconds % 3600) / 60,
        total_seconds % 60
    )
}

/// Render the full ffmetadata document.
pub fn make_ffmetadata(
    context: &PostprocessContext,
    join_points: &[JoinPoint],
    metadata: &Option<MetaData>,
) -> String {
    let mut out = String::from(";FFMETADATA1\n");

    out.push_str(&format!("Title={}\n", escape(&context.title)));
    out.push_str(&format!("Artist={}\n", escape(&context.artist)));
    out.push_str(&format!("Date={}\n", escape(&context.date)));
    out.push_str(&format!("Description={}\n", escape(&context.description)));

    let comment = if join_points.is_empty() {
        "Recording is continuous, no stream interruptions.".to_string()
    } else {
        let mut lines = vec![format!(
            "Stream was interrupted and reconnected {} time(s):",
            join_points.len()
        )];
        for join_point in join_points {
            lines.push(format!(
                "{} @ {} (crc32 {})",
                if join_point.seamless {
                    "seamless"
                } else {
                    "lossy"
                },
                format_timestamp(join_point.timestamp_ms),
                join_point.crc32
            ));
        }
        lines.join("\\\n")
    };
    out.push_str(&format!("Comment={comment}\n"));

    // Chapters from non-seamless seams: each seam starts a new chapter.
    let duration_ms = metadata.as_ref().map(|m| m.duration * 1000.0).unwrap_or(0.0);
    let mut boundaries: Vec<f64> = vec![0.0];
    boundaries.extend(
        join_points
            .iter()
            .filter(|jp| !jp.seamless)
            .map(|jp| jp.timestamp_ms),
    );
    if duration_ms > 0.0 && boundaries.len() > 1 {
        for (index, window) in boundaries.windows(2).enumerate() {
            out.push_str(&format!(
                "[CHAPTER]\nTIMEBASE=1/1000\nSTART={}\nEND={}\ntitle=Part {}\n",
                window[0] as u64,
                window[1] as u64,
                index + 1
            ));
        }
        let last_start = *boundaries.last().expect("non-empty") as u64;
        out.push_str(&format!(
            "[CHAPTER]\nTIMEBASE=1/1000\nSTART={}\nEND={}\ntitle=Part {}\n",
            last_start,
            duration_ms as u64,
            boundaries.len()
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> PostprocessContext {
        PostprocessContext {
            title: "some; title=x".to_string(),
            artist: "somebody".to_string(),
            date: "2024-07-15T21:05:09+08:00".to_string(),
            description: "line one\nline two".to_string(),
        }
    }

    #[test]
    fn test_special_characters_escaped() {
        let text = make_ffmetadata(&context(), &[], &None);
        assert!(text.starts_with(";FFMETADATA1\n"));
        assert!(text.contains(r"Title=some\; title\=x"));
        assert!(text.contains("Description=line one\\\nline two"));
    }

    #[test]
    fn test_chapters_from_lossy_join_points() {
        let join_points = vec![
            JoinPoint {
                seamless: true,
                timestamp_ms: 60_000.0,
                crc32: "aa".to_string(),
            },
            JoinPoint {
                seamless: false,
                timestamp_ms: 120_000.0,
                crc32: "bb".to_string(),
            },
        ];
        let metadata = Some(MetaData {
            hasAudio: true,
            hasVideo: true,
            hasMetadata: true,
            hasKeyframes: true,
            canSeekToEnd: true,
            duration: 300.0,
            datasize: 0.0,
            filesize: 0.0,
            audiosize: None,
            audiocodecid: None,
            audiodatarate: None,
            audiosamplerate: None,
            audiosamplesize: None,
            stereo: None,
            videosize: 0.0,
            framerate: 30.0,
            videocodecid: 7.0,
            videodatarate: 0.0,
            width: 1920.0,
            height: 1080.0,
            lasttimestamp: 300.0,
            lastkeyframelocation: 0.0,
            lastkeyframetimestamp: 0.0,
            keyframes: Default::default(),
        });

        let text = make_ffmetadata(&context(), &join_points, &metadata);

        // One chapter boundary at the lossy seam only.
        assert_eq!(text.matches("[CHAPTER]").count(), 2);
        assert!(text.contains("START=0\nEND=120000\ntitle=Part 1"));
        assert!(text.contains("START=120000\nEND=300000\ntitle=Part 2"));
        // The comment mentions both seams.
        assert!(text.contains("2 time(s)"));
    }

    #[test]
    fn test_no_chapters_without_lossy_seams() {
        let join_points = vec![JoinPoint {
            seamless: true,
            timestamp_ms: 60_000.0,
            crc32: "aa".to_string(),
        }];
        let text = make_ffmetadata(&context(), &join_points, &None);
        assert_eq!(text.matches("[CHAPTER]").count(), 0);
    }
}
