//! Per-segment remuxing to FLV.
//!
//! Each fMP4 segment is prepended with its init section and piped through
//! `ffmpeg -c copy -f flv`; the resulting bytes are parsed into FLV items.
//! The segment parser deduplicates the header, metadata and sequence-header
//! tags ffmpeg regenerates for every segment, so consecutive segments read
//! as one continuous FLV stream and feed the normal repair chain. A
//! segment that fails to remux is logged and skipped.

use std::process::Stdio;

use bytes::Bytes;
use flv::data::FlvData;
use flv::parser::parse_all;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::HlsError;
use crate::segment::SegmentData;

/// Run ffmpeg over one in-memory segment and return the FLV bytes.
pub async fn remux_segment_to_flv(init: &[u8], body: &[u8]) -> Result<Vec<u8>, HlsError> {
    let mut child = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-xerror",
            "-i",
            "pipe:0",
            "-c",
            "copy",
            "-f",
            "flv",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdin = child.stdin.take().expect("stdin piped");
    let input = [init, body].concat();
    // A broken pipe here means ffmpeg rejected the input; the exit status
    // below carries the real error.
    let _ = stdin.write_all(&input).await;
    drop(stdin);

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HlsError::Remux(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}

/// Merges per-segment FLV outputs into one logical stream.
#[derive(Debug, Default)]
pub struct SegmentParser {
    header_emitted: bool,
    last_metadata: Option<Bytes>,
    last_video_sequence: Option<Bytes>,
    last_audio_sequence: Option<Bytes>,
}

impl SegmentParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset on discontinuity: the next segment starts a new sub-stream.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Parse one remuxed segment, dropping items that repeat what previous
    /// segments already carried.
    pub fn parse(&mut self, flv_bytes: &[u8]) -> Result<Vec<FlvData>, HlsError> {
        let items = parse_all(flv_bytes)
            .map_err(|e| HlsError::Remux(format!("remuxed FLV unparsable: {e}")))?;

        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match &item {
                FlvData::Header(_) => {
                    if !self.header_emitted {
                        self.header_emitted = true;
                        out.push(item);
                    }
                }
                FlvData::Tag(tag) => {
                    if tag.is_script_tag() {
                        if self.last_metadata.as_ref() == Some(&tag.data) {
                            continue;
                        }
                        self.last_metadata = Some(tag.data.clone());
                        out.push(item);
                    } else if tag.is_video_sequence_header() {
                        if self.last_video_sequence.as_ref() == Some(&tag.data) {
                            continue;
                        }
                        self.last_video_sequence = Some(tag.data.clone());
                        out.push(item);
                    } else if tag.is_audio_sequence_header() {
                        if self.last_audio_sequence.as_ref() == Some(&tag.data) {
                            continue;
                        }
                        self.last_audio_sequence = Some(tag.data.clone());
                        out.push(item);
                    } else {
                        out.push(item);
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Drain segment data, remux each segment, and emit FLV items into the
/// repair chain's input queue.
pub async fn run_segment_remuxer(
    mut data_rx: mpsc::Receiver<SegmentData>,
    flv_tx: mpsc::Sender<FlvData>,
    cancel: CancellationToken,
) -> Result<(), HlsError> {
    let mut parser = SegmentParser::new();
    let mut current_init: Option<Bytes> = None;

    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => return Err(HlsError::Cancelled),
            data = data_rx.recv() => match data {
                Some(data) => data,
                None => return Ok(()),
            },
        };

        match data {
            SegmentData::InitSection { name, payload } => {
                debug!(name, "init section updated");
                current_init = Some(payload);
            }
            SegmentData::Segment { segment, payload } => {
                if segment.discontinuous {
                    parser.reset();
                }

                let init = current_init.as_deref().unwrap_or(&[]);
                match remux_segment_to_flv(init, &payload).await {
                    Ok(flv_bytes) => match parser.parse(&flv_bytes) {
                        Ok(items) => {
                            for item in items {
                                if flv_tx.send(item).await.is_err() {
                                    return Err(HlsError::ChannelClosed);
                                }
                            }
                        }
                        Err(e) => {
                            warn!(sequence = segment.sequence, "{e}, skipping segment");
                        }
                    },
                    Err(e) => {
                        warn!(
                            sequence = segment.sequence,
                            "failed to remux segment: {e}, skipping"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use flv::header::FlvHeader;
    use flv::tag::{FlvTag, FlvTagType};
    use flv::writer::FlvWriter;

    fn flv_segment(seq_byte: u8, payload_bytes: &[u8]) -> Vec<u8> {
        let mut writer = FlvWriter::new(Vec::new());
        writer.write_header(&FlvHeader::new(false, true)).unwrap();
        writer
            .write_tag(&FlvTag {
                timestamp_ms: 0,
                stream_id: 0,
                tag_type: FlvTagType::Video,
                data: Bytes::from(vec![0x17, 0x00, 0x00, 0x00, 0x00, seq_byte]),
            })
            .unwrap();
        for (i, payload) in payload_bytes.iter().enumerate() {
            writer
                .write_tag(&FlvTag {
                    timestamp_ms: i as u32 * 33,
                    stream_id: 0,
                    tag_type: FlvTagType::Video,
                    data: Bytes::from(vec![0x27, 0x01, 0x00, 0x00, 0x00, *payload]),
                })
                .unwrap();
        }
        writer.into_inner()
    }

    #[test]
    fn test_cross_segment_dedup() {
        let mut parser = SegmentParser::new();

        let first = parser.parse(&flv_segment(0xAA, &[1, 2])).unwrap();
        // Header + sequence header + 2 data tags.
        assert_eq!(first.len(), 4);

        let second = parser.parse(&flv_segment(0xAA, &[3, 4])).unwrap();
        // Header and identical sequence header are dropped.
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(FlvData::is_tag));
    }

    #[test]
    fn test_changed_sequence_header_passes_through() {
        let mut parser = SegmentParser::new();
        parser.parse(&flv_segment(0xAA, &[1])).unwrap();

        let second = parser.parse(&flv_segment(0xBB, &[2])).unwrap();
        // New sequence header survives the dedup.
        assert_eq!(second.len(), 2);
        match &second[0] {
            FlvData::Tag(tag) => assert!(tag.is_video_sequence_header()),
            other => panic!("unexpected: {}", other.description()),
        }
    }

    #[test]
    fn test_reset_re_emits_everything() {
        let mut parser = SegmentParser::new();
        parser.parse(&flv_segment(0xAA, &[1])).unwrap();
        parser.reset();

        let after_reset = parser.parse(&flv_segment(0xAA, &[2])).unwrap();
        assert_eq!(after_reset.len(), 3);
        assert!(after_reset[0].is_header());
    }
}
