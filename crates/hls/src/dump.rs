//! Raw-mode output: dump segments to disk and keep a local playlist.
//!
//! Each recording gets a directory with an `index.m3u8` mirroring the
//! source playlist but pointing at the locally dumped
//! `segments/<prefix>/<name>` files. The playlist gains `#EXT-X-ENDLIST`
//! when the recording closes so players treat it as a finished VOD.

use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::HlsError;
use crate::segment::SegmentData;

/// Segments are grouped into subdirectories by sequence prefix so a long
/// recording does not put tens of thousands of files into one directory.
fn segment_prefix(sequence: u64) -> String {
    format!("{:04}", sequence / 1000)
}

pub struct SegmentDumper {
    out_dir: PathBuf,
    playlist_path: PathBuf,
    target_duration: u64,
    media_sequence: Option<u64>,
    entries: Vec<String>,
    init_entry: Option<String>,
    finished: bool,
}

impl SegmentDumper {
    pub fn new(out_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(out_dir.join("segments"))?;
        let playlist_path = out_dir.join("index.m3u8");
        Ok(Self {
            out_dir,
            playlist_path,
            target_duration: 1,
            media_sequence: None,
            entries: Vec::new(),
            init_entry: None,
            finished: false,
        })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn playlist_path(&self) -> &Path {
        &self.playlist_path
    }

    pub fn handle(&mut self, data: &SegmentData) -> Result<(), HlsError> {
        match data {
            SegmentData::InitSection { name, payload } => {
                let rel = format!("segments/{name}");
                let path = self.out_dir.join(&rel);
                std::fs::write(&path, payload)?;
                debug!(path = %path.display(), "dumped init section");
                self.init_entry = Some(rel);
            }
            SegmentData::Segment { segment, payload } => {
                let rel = format!(
                    "segments/{}/{}",
                    segment_prefix(segment.sequence),
                    segment.name
                );
                let path = self.out_dir.join(&rel);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, payload)?;

                self.media_sequence.get_or_insert(segment.sequence);
                self.target_duration = self.target_duration.max(segment.duration.ceil() as u64);
                if segment.discontinuous {
                    self.entries.push("#EXT-X-DISCONTINUITY".to_string());
                }
                self.entries
                    .push(format!("#EXTINF:{:.3},{}", segment.duration, segment.title));
                self.entries.push(rel);

                self.write_playlist()?;
            }
        }
        Ok(())
    }

    /// Finalize the local playlist with ENDLIST.
    pub fn finish(&mut self) -> Result<(), HlsError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.write_playlist()
    }

    fn write_playlist(&self) -> Result<(), HlsError> {
        let mut out = Vec::new();
        writeln!(out, "#EXTM3U")?;
        writeln!(out, "#EXT-X-VERSION:7")?;
        writeln!(out, "#EXT-X-TARGETDURATION:{}", self.target_duration)?;
        writeln!(
            out,
            "#EXT-X-MEDIA-SEQUENCE:{}",
            self.media_sequence.unwrap_or(0)
        )?;
        if let Some(init) = &self.init_entry {
            writeln!(out, "#EXT-X-MAP:URI=\"{init}\"")?;
        }
        for entry in &self.entries {
            writeln!(out, "{entry}")?;
        }
        if self.finished {
            writeln!(out, "#EXT-X-ENDLIST")?;
        }

        // Write-then-rename keeps the playlist readable at every instant.
        let tmp = self.playlist_path.with_extension("m3u8.tmp");
        std::fs::write(&tmp, &out)?;
        std::fs::rename(&tmp, &self.playlist_path)?;
        Ok(())
    }
}

/// Drain segment data into the dumper until the source ends.
pub async fn run_segment_dumper(
    mut data_rx: mpsc::Receiver<SegmentData>,
    mut dumper: SegmentDumper,
    cancel: CancellationToken,
) -> Result<SegmentDumper, HlsError> {
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => {
                dumper.finish()?;
                return Err(HlsError::Cancelled);
            }
            data = data_rx.recv() => match data {
                Some(data) => data,
                None => {
                    dumper.finish()?;
                    return Ok(dumper);
                }
            },
        };

        if let Err(e) = dumper.handle(&data) {
            warn!("failed to dump segment: {e}");
            if matches!(e, HlsError::Io(_)) {
                dumper.finish().ok();
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use bytes::Bytes;
    use url::Url;

    fn segment(sequence: u64, discontinuous: bool) -> Segment {
        Segment {
            sequence,
            url: Url::parse(&format!("https://example.com/{sequence}.m4s")).unwrap(),
            name: format!("{sequence}.m4s"),
            duration: 1.0,
            init_url: None,
            init_name: None,
            title: "a|b".to_string(),
            discontinuous,
        }
    }

    #[test]
    fn test_dump_layout_and_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let mut dumper = SegmentDumper::new(dir.path()).unwrap();

        dumper
            .handle(&SegmentData::InitSection {
                name: "h123.m4s".to_string(),
                payload: Bytes::from_static(b"init"),
            })
            .unwrap();
        dumper
            .handle(&SegmentData::Segment {
                segment: segment(1500, false),
                payload: Bytes::from_static(b"body"),
            })
            .unwrap();
        dumper
            .handle(&SegmentData::Segment {
                segment: segment(1503, true),
                payload: Bytes::from_static(b"body2"),
            })
            .unwrap();
        dumper.finish().unwrap();

        assert!(dir.path().join("segments/h123.m4s").exists());
        assert!(dir.path().join("segments/0001/1500.m4s").exists());

        let playlist = std::fs::read_to_string(dir.path().join("index.m3u8")).unwrap();
        assert!(playlist.contains("#EXT-X-MAP:URI=\"segments/h123.m4s\""));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:1500"));
        assert!(playlist.contains("segments/0001/1500.m4s"));
        assert!(playlist.contains("#EXT-X-DISCONTINUITY"));
        assert!(playlist.trim_end().ends_with("#EXT-X-ENDLIST"));
    }
}
