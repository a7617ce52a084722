//! # Defragment Operator
//!
//! Live streams sometimes deliver a header followed by only a handful of
//! tags before the connection drops and a new header arrives. Such stubs are
//! not worth keeping: downstream they would open (and immediately close) an
//! output file. This operator buffers the first items after each header and
//! discards the buffer if another header shows up before enough tags were
//! gathered.

use std::sync::Arc;

use flv::data::FlvData;
use pipeline_common::{PipelineError, Processor, StreamerContext};
use tracing::{debug, warn};

pub struct DefragmentOperator {
    context: Arc<StreamerContext>,
    min_tags: usize,
    gathering: bool,
    buffer: Vec<FlvData>,
}

impl DefragmentOperator {
    const MIN_TAGS_NUM: usize = 10;

    pub fn new(context: Arc<StreamerContext>) -> Self {
        Self::with_min_tags(context, Self::MIN_TAGS_NUM)
    }

    pub fn with_min_tags(context: Arc<StreamerContext>, min_tags: usize) -> Self {
        Self {
            context,
            min_tags,
            gathering: false,
            buffer: Vec::with_capacity(min_tags + 1),
        }
    }
}

impl Processor<FlvData> for DefragmentOperator {
    fn process(
        &mut self,
        input: FlvData,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        if input.is_header() {
            if !self.buffer.is_empty() {
                warn!(
                    "{} discarded {} fragmented items, total size: {}",
                    self.context.name,
                    self.buffer.len(),
                    self.buffer.iter().map(|d| d.size()).sum::<usize>(),
                );
                self.buffer.clear();
            }
            self.gathering = true;
            debug!("{} gathering items...", self.context.name);
        }

        if self.gathering {
            self.buffer.push(input);
            // Strictly more than min_tags items: the header plus min_tags tags.
            if self.buffer.len() > self.min_tags {
                for item in self.buffer.drain(..) {
                    output(item)?;
                }
                self.gathering = false;
                debug!(
                    "{} not a fragmented stream, stopped gathering",
                    self.context.name
                );
            }
        } else {
            output(input)?;
        }

        Ok(())
    }

    fn finish(
        &mut self,
        _output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        // Whatever is still buffered at end of stream never reached the
        // threshold; drop it as a fragment.
        if !self.buffer.is_empty() {
            warn!(
                "{} end of stream with only {} buffered items, discarding",
                self.context.name,
                self.buffer.len(),
            );
            self.buffer.clear();
        }
        self.gathering = false;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "DefragmentOperator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use flv::tag::FlvTagType;
    use pipeline_common::test_context;

    fn run(operator: &mut DefragmentOperator, input: Vec<FlvData>) -> Vec<FlvData> {
        let mut results = Vec::new();
        let mut sink = |item: FlvData| {
            results.push(item);
            Ok(())
        };
        for item in input {
            operator.process(item, &mut sink).unwrap();
        }
        operator.finish(&mut sink).unwrap();
        results
    }

    #[test]
    fn test_complete_stream_passes_through() {
        let mut operator = DefragmentOperator::new(test_context());

        let mut input = vec![create_test_header()];
        for i in 0..11 {
            input.push(create_video_tag(i, false));
        }

        let results = run(&mut operator, input);
        assert_eq!(results.len(), 12);
        assert!(results[0].is_header());
    }

    #[test]
    fn test_fragment_discarded_on_new_header() {
        let mut operator = DefragmentOperator::new(test_context());

        let mut input = vec![create_test_header()];
        for i in 0..5 {
            input.push(create_video_tag(i, false));
        }
        // Second header arrives before the first segment had enough tags.
        input.push(create_test_header());
        for i in 0..11 {
            input.push(create_video_tag(i, false));
        }

        let results = run(&mut operator, input);
        // Only the second segment survives: header + 11 tags.
        assert_eq!(results.len(), 12);
    }

    #[test]
    fn test_short_tail_discarded_at_end_of_stream() {
        let mut operator = DefragmentOperator::new(test_context());

        let mut input = vec![create_test_header()];
        for i in 0..5 {
            input.push(create_video_tag(i, false));
        }

        let results = run(&mut operator, input);
        assert!(results.is_empty());
    }

    #[test]
    fn test_items_after_threshold_flow_directly() {
        let mut operator = DefragmentOperator::new(test_context());

        let mut input = vec![create_test_header()];
        for i in 0..15 {
            input.push(create_video_tag(i, false));
        }
        input.push(create_audio_tag(100));

        let results = run(&mut operator, input);
        assert_eq!(results.len(), 17);
        match results.last().unwrap() {
            FlvData::Tag(tag) => assert_eq!(tag.tag_type, FlvTagType::Audio),
            other => panic!("unexpected item: {}", other.description()),
        }
    }
}
