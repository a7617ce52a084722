//! # Prober Operator
//!
//! Reconstructs the first few items of every sub-stream as a tiny in-memory
//! FLV file and feeds it to `ffprobe` to learn the stream's codec profile.
//! The probe runs on its own thread so a slow or missing `ffprobe` binary
//! never stalls the recording chain.

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;

use flv::data::FlvData;
use flv::writer::FlvWriter;
use pipeline_common::{PipelineError, Processor, StreamerContext};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Number of items gathered per stream before probing.
const PROBE_ITEMS: usize = 10;

/// The subset of `ffprobe -show_format -show_streams` output we keep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamProfile {
    #[serde(default)]
    pub format: serde_json::Value,
    #[serde(default)]
    pub streams: Vec<serde_json::Value>,
}

pub type ProfileSink = Arc<dyn Fn(StreamProfile) + Send + Sync>;

pub struct ProberOperator {
    context: Arc<StreamerContext>,
    on_profile: ProfileSink,
    gathering: bool,
    gathered: Vec<FlvData>,
}

impl ProberOperator {
    pub fn new(context: Arc<StreamerContext>, on_profile: ProfileSink) -> Self {
        Self {
            context,
            on_profile,
            gathering: false,
            gathered: Vec::with_capacity(PROBE_ITEMS),
        }
    }

    fn do_probe(&mut self) {
        let mut writer = FlvWriter::new(Vec::new());
        let mut items = std::mem::take(&mut self.gathered).into_iter();

        match items.next() {
            Some(FlvData::Header(header)) => {
                if writer.write_header(&header).is_err() {
                    return;
                }
            }
            _ => return,
        }
        for item in items {
            if let FlvData::Tag(tag) = item {
                if writer.write_tag(&tag).is_err() {
                    return;
                }
            }
        }

        let bytes = writer.into_inner();
        let on_profile = self.on_profile.clone();
        let name = self.context.name.clone();

        std::thread::Builder::new()
            .name("StreamProber".to_string())
            .spawn(move || match ffprobe(&bytes) {
                Ok(profile) => on_profile(profile),
                Err(e) => warn!("{name} failed to probe stream: {e}"),
            })
            .ok();
    }
}

/// Run `ffprobe` over an in-memory buffer and parse its JSON report.
pub fn ffprobe(data: &[u8]) -> std::io::Result<StreamProfile> {
    let mut child = Command::new("ffprobe")
        .args([
            "-hide_banner",
            "-loglevel",
            "quiet",
            "-show_format",
            "-show_streams",
            "-print_format",
            "json",
            "pipe:0",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    // The probe input is tiny; write it whole and close stdin.
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(data);
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "ffprobe exited with {}",
            output.status
        )));
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Processor<FlvData> for ProberOperator {
    fn process(
        &mut self,
        input: FlvData,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        if input.is_header() {
            self.gathered.clear();
            self.gathering = true;
            debug!("{} gathering items for probing", self.context.name);
        }

        if self.gathering {
            self.gathered.push(input.clone());
            if self.gathered.len() >= PROBE_ITEMS {
                self.do_probe();
                self.gathering = false;
            }
        }

        output(input)
    }

    fn finish(
        &mut self,
        _output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        self.gathered.clear();
        self.gathering = false;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ProberOperator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use pipeline_common::test_context;

    #[test]
    fn test_items_pass_through_unchanged() {
        let mut operator =
            ProberOperator::new(test_context(), Arc::new(|_profile| {}));

        let input: Vec<FlvData> = std::iter::once(create_test_header())
            .chain((0..12).map(|i| create_video_tag(i * 33, i % 5 == 0)))
            .collect();

        let mut results = Vec::new();
        let mut sink = |item: FlvData| {
            results.push(item);
            Ok(())
        };
        for item in input.clone() {
            operator.process(item, &mut sink).unwrap();
        }
        operator.finish(&mut sink).unwrap();

        assert_eq!(results, input);
    }
}
