//! # Limit Operator
//!
//! Enforces per-file size and duration limits. The check is predictive:
//! when the bytes (or seconds) accumulated so far plus the largest gap ever
//! observed between two keyframes would cross the limit, the stream is
//! split at the current keyframe by re-injecting the header, metadata and
//! sequence headers. Splitting only at keyframes keeps every produced file
//! independently decodable.

use std::sync::Arc;

use flv::data::FlvData;
use flv::header::FlvHeader;
use flv::tag::FlvTag;
use pipeline_common::{PipelineError, Processor, StreamerContext};
use tracing::{debug, info};

const BACK_POINTER_SIZE: u64 = 4;

pub struct LimitOperator {
    context: Arc<StreamerContext>,
    /// Limit in bytes; 0 disables the check.
    filesize_limit: u64,
    /// Limit in seconds; 0 disables the check.
    duration_limit: u64,

    filesize: u64,
    duration_s: f64,
    max_size_between_keyframes: u64,
    max_duration_between_keyframes: f64,
    first_keyframe: Option<(u64, u32)>, // (filesize at tag, timestamp)
    last_keyframe: Option<(u64, u32)>,
    last_header: Option<FlvHeader>,
    last_metadata: Option<FlvTag>,
    last_audio_sequence_header: Option<FlvTag>,
    last_video_sequence_header: Option<FlvTag>,
}

impl LimitOperator {
    pub fn new(context: Arc<StreamerContext>, filesize_limit: u64, duration_limit: u64) -> Self {
        Self {
            context,
            filesize_limit,
            duration_limit,
            filesize: 0,
            duration_s: 0.0,
            max_size_between_keyframes: 0,
            max_duration_between_keyframes: 0.0,
            first_keyframe: None,
            last_keyframe: None,
            last_header: None,
            last_metadata: None,
            last_audio_sequence_header: None,
            last_video_sequence_header: None,
        }
    }

    fn reset(&mut self) {
        self.filesize = 0;
        self.duration_s = 0.0;
        self.max_size_between_keyframes = 0;
        self.max_duration_between_keyframes = 0.0;
        self.first_keyframe = None;
        self.last_keyframe = None;
        self.last_header = None;
        self.last_metadata = None;
        self.last_audio_sequence_header = None;
        self.last_video_sequence_header = None;
    }

    fn update_meta_tags(&mut self, tag: &FlvTag) {
        if tag.is_script_tag() {
            self.last_metadata = Some(tag.clone());
        } else if tag.is_audio_sequence_header() {
            self.last_audio_sequence_header = Some(tag.clone());
        } else if tag.is_video_sequence_header() {
            self.last_video_sequence_header = Some(tag.clone());
        }
    }

    fn insert_header_and_tags(
        &mut self,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        let header = self
            .last_header
            .clone()
            .expect("limit split before any stream header");
        output(FlvData::Header(header.clone()))?;
        self.filesize = 9 + BACK_POINTER_SIZE;
        if let Some(metadata) = &self.last_metadata {
            output(FlvData::Tag(metadata.clone()))?;
            self.filesize += metadata.size() as u64 + BACK_POINTER_SIZE;
        }
        if let Some(video_seq) = &self.last_video_sequence_header {
            output(FlvData::Tag(video_seq.clone()))?;
            self.filesize += video_seq.size() as u64 + BACK_POINTER_SIZE;
        }
        if let Some(audio_seq) = &self.last_audio_sequence_header {
            output(FlvData::Tag(audio_seq.clone()))?;
            self.filesize += audio_seq.size() as u64 + BACK_POINTER_SIZE;
        }
        self.duration_s = 0.0;
        self.first_keyframe = self.last_keyframe;
        Ok(())
    }

    /// Returns true when the stream should be split at this tag.
    fn check_limits(&mut self, tag: &FlvTag) -> bool {
        self.filesize += tag.size() as u64 + BACK_POINTER_SIZE;

        if !tag.is_key_frame_nalu() {
            return false;
        }

        let here = (self.filesize, tag.timestamp_ms);
        if self.first_keyframe.is_none() {
            self.first_keyframe = Some(here);
        }

        if let Some((last_size, last_ts)) = self.last_keyframe {
            self.max_size_between_keyframes = self
                .max_size_between_keyframes
                .max(self.filesize.saturating_sub(last_size));
            self.max_duration_between_keyframes = self
                .max_duration_between_keyframes
                .max((tag.timestamp_ms.saturating_sub(last_ts)) as f64 / 1000.0);
        }
        self.last_keyframe = Some(here);
        self.duration_s =
            (tag.timestamp_ms - self.first_keyframe.expect("set above").1) as f64 / 1000.0;

        if self.filesize_limit > 0
            && self.filesize + self.max_size_between_keyframes >= self.filesize_limit
        {
            debug!(
                "{} file size will exceed the limit: {} + {}",
                self.context.name, self.filesize, self.max_size_between_keyframes
            );
            return true;
        }

        if self.duration_limit > 0
            && self.duration_s + self.max_duration_between_keyframes
                >= self.duration_limit as f64
        {
            debug!(
                "{} duration will exceed the limit: {} + {}",
                self.context.name, self.duration_s, self.max_duration_between_keyframes
            );
            return true;
        }

        false
    }
}

impl Processor<FlvData> for LimitOperator {
    fn process(
        &mut self,
        input: FlvData,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        match &input {
            FlvData::Header(header) => {
                self.reset();
                self.last_header = Some(header.clone());
                self.filesize += 9 + BACK_POINTER_SIZE;
                output(input)
            }
            FlvData::Tag(tag) => {
                self.update_meta_tags(tag);
                if self.check_limits(tag) {
                    info!(
                        "{} splitting stream at {}ms to stay under limits",
                        self.context.name, tag.timestamp_ms
                    );
                    self.insert_header_and_tags(output)?;
                }
                output(input)
            }
        }
    }

    fn finish(
        &mut self,
        _output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        self.reset();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LimitOperator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use pipeline_common::test_context;

    fn run(operator: &mut LimitOperator, input: Vec<FlvData>) -> Vec<FlvData> {
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
    fn test_no_limits_no_split() {
        let mut operator = LimitOperator::new(test_context(), 0, 0);
        let mut input = vec![create_test_header()];
        for i in 0..100 {
            input.push(create_video_tag(i * 33, i % 10 == 0));
        }
        let results = run(&mut operator, input);
        assert_eq!(results.iter().filter(|i| i.is_header()).count(), 1);
    }

    #[test]
    fn test_size_limit_splits_at_keyframe() {
        // Each video tag is 17 bytes on disk (11 header + 6 body) plus the
        // back pointer. With a tight limit the projected size crosses the
        // threshold quickly.
        let mut operator = LimitOperator::new(test_context(), 600, 0);

        let mut input = vec![
            create_test_header(),
            create_metadata_tag(0),
            create_video_sequence_header(0),
        ];
        for i in 0..40 {
            input.push(create_video_tag(i * 33, i % 5 == 0));
        }

        let results = run(&mut operator, input);
        let headers = results.iter().filter(|i| i.is_header()).count();
        assert!(headers > 1, "expected at least one split, got {headers}");

        // Every split re-starts with metadata + sequence header before data.
        let mut idx = 0;
        while idx < results.len() {
            if results[idx].is_header() {
                match &results[idx + 1] {
                    FlvData::Tag(tag) => assert!(tag.is_script_tag()),
                    other => panic!("unexpected: {}", other.description()),
                }
                match &results[idx + 2] {
                    FlvData::Tag(tag) => assert!(tag.is_video_sequence_header()),
                    other => panic!("unexpected: {}", other.description()),
                }
            }
            idx += 1;
        }
    }

    #[test]
    fn test_duration_limit_splits() {
        let mut operator = LimitOperator::new(test_context(), 0, 10);

        let mut input = vec![create_test_header(), create_video_sequence_header(0)];
        // Keyframe every 2 seconds for 40 seconds.
        for i in 0..20 {
            input.push(create_video_tag(i * 2000, true));
            input.push(create_video_tag(i * 2000 + 1000, false));
        }

        let results = run(&mut operator, input);
        assert!(results.iter().filter(|i| i.is_header()).count() >= 3);
    }
}
