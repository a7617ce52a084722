//! # Tag Filter Operator
//!
//! Drops AVC end-of-sequence tags and tags of unknown type. End-of-sequence
//! markers appear whenever the server finalizes its side of the stream;
//! keeping them would terminate playback of the merged recording early.

use std::sync::Arc;

use flv::data::FlvData;
use flv::tag::FlvTagType;
use pipeline_common::{PipelineError, Processor, StreamerContext};
use tracing::debug;

pub struct TagFilterOperator {
    context: Arc<StreamerContext>,
    dropped: u64,
}

impl TagFilterOperator {
    pub fn new(context: Arc<StreamerContext>) -> Self {
        Self {
            context,
            dropped: 0,
        }
    }
}

impl Processor<FlvData> for TagFilterOperator {
    fn process(
        &mut self,
        input: FlvData,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        if let FlvData::Tag(tag) = &input {
            if tag.is_avc_end_of_sequence() {
                debug!(
                    "{} dropped AVC end-of-sequence tag at {}ms",
                    self.context.name, tag.timestamp_ms
                );
                self.dropped += 1;
                return Ok(());
            }
            if matches!(tag.tag_type, FlvTagType::Unknown(_)) {
                debug!(
                    "{} dropped tag of unknown type {} at {}ms",
                    self.context.name, tag.tag_type, tag.timestamp_ms
                );
                self.dropped += 1;
                return Ok(());
            }
        }
        output(input)
    }

    fn finish(
        &mut self,
        _output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        if self.dropped > 0 {
            debug!("{} dropped {} tags in total", self.context.name, self.dropped);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TagFilterOperator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use pipeline_common::test_context;

    #[test]
    fn test_end_of_sequence_dropped() {
        let mut operator = TagFilterOperator::new(test_context());
        let mut results = Vec::new();
        let mut sink = |item: FlvData| {
            results.push(item);
            Ok(())
        };

        for item in [
            create_test_header(),
            create_video_tag(0, true),
            create_avc_end_of_sequence(33),
            create_video_tag(66, false),
        ] {
            operator.process(item, &mut sink).unwrap();
        }
        operator.finish(&mut sink).unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|item| match item {
            FlvData::Tag(tag) => !tag.is_avc_end_of_sequence(),
            _ => true,
        }));
    }
}
