//! # Correct Operator
//!
//! Re-bases the timeline of each sub-stream at zero. Script tags and
//! sequence headers ahead of the first data tag are pinned to 0; the first
//! data tag fixes the offset applied to everything after it. Runs directly
//! after the Cut and Limit operators so every file they open starts at
//! timestamp 0.

use std::sync::Arc;

use flv::data::FlvData;
use flv::tag::FlvTag;
use pipeline_common::{PipelineError, Processor, StreamerContext};
use tracing::debug;

pub struct CorrectOperator {
    context: Arc<StreamerContext>,
    delta: Option<i64>,
}

impl CorrectOperator {
    pub fn new(context: Arc<StreamerContext>) -> Self {
        Self {
            context,
            delta: None,
        }
    }
}

fn with_ts(tag: &FlvTag, timestamp_ms: u32) -> FlvTag {
    let mut out = tag.clone();
    out.timestamp_ms = timestamp_ms;
    out
}

impl Processor<FlvData> for CorrectOperator {
    fn process(
        &mut self,
        input: FlvData,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        match &input {
            FlvData::Header(_) => {
                self.delta = None;
                output(input)
            }
            FlvData::Tag(tag) => {
                if tag.is_script_tag() {
                    return output(FlvData::Tag(with_ts(tag, 0)));
                }

                match self.delta {
                    None => {
                        if tag.is_sequence_header() {
                            output(FlvData::Tag(with_ts(tag, 0)))
                        } else {
                            let delta = -(tag.timestamp_ms as i64);
                            debug!(
                                "{} first data tag at {}ms, timestamp delta: {}",
                                self.context.name, tag.timestamp_ms, delta
                            );
                            self.delta = Some(delta);
                            output(FlvData::Tag(with_ts(tag, 0)))
                        }
                    }
                    Some(delta) => {
                        let corrected = (tag.timestamp_ms as i64 + delta).max(0) as u32;
                        output(FlvData::Tag(with_ts(tag, corrected)))
                    }
                }
            }
        }
    }

    fn finish(
        &mut self,
        _output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        self.delta = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "CorrectOperator"
    }
}
