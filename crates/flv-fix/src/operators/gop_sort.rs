//! # GOP Sorting Operator
//!
//! Buffers tags until the next keyframe (or end-of-sequence) and re-orders
//! each group so audio tags follow the video tag they belong with: an audio
//! tag whose timestamp is >= a video tag's timestamp is placed immediately
//! after that video tag, keeping video order stable. Script tags are emitted
//! first in their original order.
//!
//! A tiny group (fewer than 10 tags) that carries both the AVC and AAC
//! sequence headers is collapsed to metadata + sequence headers only; such
//! groups appear when the server re-sends initialization data mid-stream.

use std::sync::Arc;

use flv::data::FlvData;
use flv::tag::FlvTag;
use pipeline_common::{PipelineError, Processor, StreamerContext};
use tracing::{debug, trace};

/// Groups smaller than this are checked for the headers-only shortcut.
const TAGS_BUFFER_SIZE: usize = 10;

pub struct GopSortOperator {
    context: Arc<StreamerContext>,
    gop_tags: Vec<FlvTag>,
}

impl GopSortOperator {
    pub fn new(context: Arc<StreamerContext>) -> Self {
        Self {
            context,
            gop_tags: Vec::new(),
        }
    }

    fn push_gop_tags(
        &mut self,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        if self.gop_tags.is_empty() {
            return Ok(());
        }

        trace!(
            "{} GOP tags: {}, total size: {}",
            self.context.name,
            self.gop_tags.len(),
            self.gop_tags.iter().map(|t| t.size()).sum::<usize>()
        );

        // Initialization-only groups: emit metadata + sequence headers, drop
        // the rest.
        if self.gop_tags.len() < TAGS_BUFFER_SIZE {
            let avc_header = self
                .gop_tags
                .iter()
                .find(|tag| tag.is_video_sequence_header())
                .cloned();
            let aac_header = self
                .gop_tags
                .iter()
                .find(|tag| tag.is_audio_sequence_header())
                .cloned();

            if let (Some(avc), Some(aac)) = (avc_header, aac_header) {
                if let Some(metadata) = self
                    .gop_tags
                    .iter()
                    .find(|tag| tag.is_script_tag())
                    .cloned()
                {
                    output(FlvData::Tag(metadata))?;
                }
                output(FlvData::Tag(avc))?;
                output(FlvData::Tag(aac))?;
                self.gop_tags.clear();
                return Ok(());
            }
        }

        let mut script_tags = Vec::new();
        let mut video_tags = Vec::new();
        let mut audio_tags = Vec::new();
        for tag in self.gop_tags.drain(..) {
            if tag.is_script_tag() {
                script_tags.push(tag);
            } else if tag.is_video_tag() {
                video_tags.push(tag);
            } else if tag.is_audio_tag() {
                audio_tags.push(tag);
            }
        }

        for tag in script_tags {
            output(FlvData::Tag(tag))?;
        }

        // Walk video tags from last to first, pulling in the audio tags with
        // timestamps >= the current video tag right behind it. Video order is
        // preserved; audio order within a slot is preserved too.
        let mut sorted: Vec<FlvTag> = Vec::with_capacity(video_tags.len() + audio_tags.len());
        let mut audio_idx = audio_tags.len();
        for video_tag in video_tags.into_iter().rev() {
            let video_ts = video_tag.timestamp_ms;
            sorted.insert(0, video_tag);
            while audio_idx > 0 && audio_tags[audio_idx - 1].timestamp_ms >= video_ts {
                sorted.insert(1, audio_tags[audio_idx - 1].clone());
                audio_idx -= 1;
            }
        }
        // Audio before the first video tag would be dropped by the loop
        // above; keep stray audio-only groups intact.
        for tag in audio_tags[..audio_idx].iter().rev() {
            sorted.insert(0, tag.clone());
        }

        for tag in sorted {
            output(FlvData::Tag(tag))?;
        }

        Ok(())
    }
}

impl Processor<FlvData> for GopSortOperator {
    fn process(
        &mut self,
        input: FlvData,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        match &input {
            FlvData::Header(_) => {
                self.push_gop_tags(output)?;
                debug!("{} reset GOP tags", self.context.name);
                output(input)
            }
            FlvData::Tag(tag) if tag.is_avc_end_of_sequence() => {
                self.push_gop_tags(output)?;
                output(input)
            }
            FlvData::Tag(tag) => {
                if tag.is_key_frame_nalu() {
                    self.push_gop_tags(output)?;
                }
                if let FlvData::Tag(tag) = input {
                    self.gop_tags.push(tag);
                }
                Ok(())
            }
        }
    }

    fn finish(
        &mut self,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        self.push_gop_tags(output)
    }

    fn name(&self) -> &'static str {
        "GopSortOperator"
    }
}
