//! # Split Operator
//!
//! Detects changed codec parameters mid-stream and turns the change into a
//! sub-stream boundary. Sequence headers and metadata tags are tracked per
//! stream; a repeated sequence header whose body differs byte-wise from the
//! last seen one marks the stream for splitting, and before the next data
//! tag the operator re-injects a header, the last metadata and the last
//! sequence headers so downstream treats what follows as a fresh stream.
//!
//! Repeated metadata and sequence-header tags are swallowed: only the first
//! occurrence per sub-stream is forwarded, later ones just refresh the
//! cached copies.

use std::sync::Arc;

use flv::data::FlvData;
use flv::header::FlvHeader;
use flv::tag::FlvTag;
use pipeline_common::{PipelineError, Processor, StreamerContext};
use tracing::{debug, info, warn};

struct StreamState {
    header: Option<FlvHeader>,
    metadata: Option<FlvTag>,
    audio_sequence_tag: Option<FlvTag>,
    video_sequence_tag: Option<FlvTag>,
    changed: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            header: None,
            metadata: None,
            audio_sequence_tag: None,
            video_sequence_tag: None,
            changed: false,
        }
    }
}

pub struct SplitOperator {
    context: Arc<StreamerContext>,
    state: StreamState,
}

impl SplitOperator {
    pub fn new(context: Arc<StreamerContext>) -> Self {
        Self {
            context,
            state: StreamState::new(),
        }
    }

    fn split_stream(
        &mut self,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        if let Some(header) = &self.state.header {
            output(FlvData::Header(header.clone()))?;
        }
        if let Some(metadata) = &self.state.metadata {
            output(FlvData::Tag(metadata.clone()))?;
        }
        if let Some(video_seq) = &self.state.video_sequence_tag {
            output(FlvData::Tag(video_seq.clone()))?;
        }
        if let Some(audio_seq) = &self.state.audio_sequence_tag {
            output(FlvData::Tag(audio_seq.clone()))?;
        }
        self.state.changed = false;
        info!("{} stream split on parameter change", self.context.name);
        Ok(())
    }
}

impl Processor<FlvData> for SplitOperator {
    fn process(
        &mut self,
        input: FlvData,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        match &input {
            FlvData::Header(header) => {
                self.state = StreamState::new();
                self.state.header = Some(header.clone());
                output(input)
            }
            FlvData::Tag(tag) => {
                if tag.is_script_tag() {
                    let had_previous = self.state.metadata.is_some();
                    self.state.metadata = Some(tag.clone());
                    if had_previous {
                        debug!("{} swallowed repeated metadata tag", self.context.name);
                        return Ok(());
                    }
                } else if tag.is_audio_sequence_header() {
                    if let Some(prev) = self.state.audio_sequence_tag.replace(tag.clone()) {
                        if !prev.body_equals(tag) {
                            warn!("{} audio parameters changed", self.context.name);
                            self.state.changed = true;
                        }
                        return Ok(());
                    }
                } else if tag.is_video_sequence_header() {
                    if let Some(prev) = self.state.video_sequence_tag.replace(tag.clone()) {
                        if !prev.body_equals(tag) {
                            warn!("{} video parameters changed", self.context.name);
                            self.state.changed = true;
                        }
                        return Ok(());
                    }
                } else if self.state.changed {
                    self.split_stream(output)?;
                }
                output(input)
            }
        }
    }

    fn finish(
        &mut self,
        _output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        self.state = StreamState::new();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SplitOperator"
    }
}
