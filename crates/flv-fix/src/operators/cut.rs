//! # Cut Operator
//!
//! Lets the outside world split the current output file on demand. A cut
//! request is honored at the next keyframe: the operator re-injects the
//! stream header, the last metadata and the last sequence headers ahead of
//! it, so the dumper rotates files without losing decoder state. Requests
//! are refused while the current segment is shorter than the minimum
//! duration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use flv::data::FlvData;
use flv::header::FlvHeader;
use flv::tag::FlvTag;
use pipeline_common::{PipelineError, Processor, StreamerContext};
use tracing::info;

const MIN_DURATION_MS: u32 = 5_000;

/// Shared trigger for cut requests, cloned out to the recorder and the
/// admin surface.
#[derive(Debug, Clone, Default)]
pub struct CutHandle {
    inner: Arc<CutShared>,
}

#[derive(Debug, Default)]
struct CutShared {
    triggered: AtomicBool,
    last_timestamp_ms: AtomicU32,
}

impl CutHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a cut would currently be accepted.
    pub fn can_cut_stream(&self) -> bool {
        !self.inner.triggered.load(Ordering::SeqCst)
            && self.inner.last_timestamp_ms.load(Ordering::SeqCst) >= MIN_DURATION_MS
    }

    /// Request a cut at the next keyframe. Returns false when refused.
    pub fn cut_stream(&self) -> bool {
        if !self.can_cut_stream() {
            return false;
        }
        self.inner.triggered.store(true, Ordering::SeqCst);
        true
    }

    fn take_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.inner.triggered.store(false, Ordering::SeqCst);
        self.inner.last_timestamp_ms.store(0, Ordering::SeqCst);
    }

    fn update_timestamp(&self, timestamp_ms: u32) {
        self.inner
            .last_timestamp_ms
            .store(timestamp_ms, Ordering::SeqCst);
    }
}

pub struct CutOperator {
    context: Arc<StreamerContext>,
    handle: CutHandle,
    last_header: Option<FlvHeader>,
    last_metadata: Option<FlvTag>,
    last_audio_sequence_header: Option<FlvTag>,
    last_video_sequence_header: Option<FlvTag>,
}

impl CutOperator {
    pub fn new(context: Arc<StreamerContext>, handle: CutHandle) -> Self {
        Self {
            context,
            handle,
            last_header: None,
            last_metadata: None,
            last_audio_sequence_header: None,
            last_video_sequence_header: None,
        }
    }

    fn reset(&mut self) {
        self.handle.clear();
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
            .expect("cut before any stream header");
        output(FlvData::Header(header))?;
        if let Some(metadata) = &self.last_metadata {
            output(FlvData::Tag(metadata.clone()))?;
        }
        if let Some(video_seq) = &self.last_video_sequence_header {
            output(FlvData::Tag(video_seq.clone()))?;
        }
        if let Some(audio_seq) = &self.last_audio_sequence_header {
            output(FlvData::Tag(audio_seq.clone()))?;
        }
        Ok(())
    }
}

impl Processor<FlvData> for CutOperator {
    fn process(
        &mut self,
        input: FlvData,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        match &input {
            FlvData::Header(header) => {
                self.reset();
                self.last_header = Some(header.clone());
                output(input)
            }
            FlvData::Tag(tag) => {
                self.update_meta_tags(tag);
                self.handle.update_timestamp(tag.timestamp_ms);

                if self.handle.take_triggered() && tag.is_key_frame_nalu() {
                    info!(
                        "{} cutting stream at {}ms",
                        self.context.name, tag.timestamp_ms
                    );
                    self.insert_header_and_tags(output)?;
                    self.handle.clear();
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
        "CutOperator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use pipeline_common::test_context;

    #[test]
    fn test_cut_refused_below_min_duration() {
        let handle = CutHandle::new();
        let mut operator = CutOperator::new(test_context(), handle.clone());
        let mut sink = |_item: FlvData| Ok(());

        operator.process(create_test_header(), &mut sink).unwrap();
        operator
            .process(create_video_tag(1000, true), &mut sink)
            .unwrap();

        assert!(!handle.cut_stream());
    }

    #[test]
    fn test_cut_honored_at_next_keyframe() {
        let handle = CutHandle::new();
        let mut operator = CutOperator::new(test_context(), handle.clone());
        let results = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let results_for_sink = results.clone();
        let mut sink = |item: FlvData| {
            results_for_sink.borrow_mut().push(item);
            Ok(())
        };

        operator.process(create_test_header(), &mut sink).unwrap();
        operator
            .process(create_metadata_tag(0), &mut sink)
            .unwrap();
        operator
            .process(create_video_sequence_header(0), &mut sink)
            .unwrap();
        operator
            .process(create_video_tag(0, true), &mut sink)
            .unwrap();
        operator
            .process(create_video_tag(6000, false), &mut sink)
            .unwrap();

        assert!(handle.cut_stream());
        // Inter frame: no cut yet.
        operator
            .process(create_video_tag(6033, false), &mut sink)
            .unwrap();
        assert_eq!(
            results.borrow().iter().filter(|i| i.is_header()).count(),
            1
        );

        // Keyframe: header + metadata + sequence header re-injected first.
        operator
            .process(create_video_tag(6066, true), &mut sink)
            .unwrap();
        assert_eq!(
            results.borrow().iter().filter(|i| i.is_header()).count(),
            2
        );

        let results = results.borrow();
        let header_pos = results.iter().rposition(|i| i.is_header()).unwrap();
        match &results[header_pos + 1] {
            FlvData::Tag(tag) => assert!(tag.is_script_tag()),
            other => panic!("unexpected: {}", other.description()),
        }
        match &results[header_pos + 2] {
            FlvData::Tag(tag) => assert!(tag.is_video_sequence_header()),
            other => panic!("unexpected: {}", other.description()),
        }
        match &results[header_pos + 3] {
            FlvData::Tag(tag) => assert!(tag.is_key_frame_nalu()),
            other => panic!("unexpected: {}", other.description()),
        }

        // The trigger is consumed.
        assert!(!handle.take_triggered());
    }
}
