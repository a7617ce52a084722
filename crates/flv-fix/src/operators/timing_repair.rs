//! # Timing Repair Operator
//!
//! Live servers produce streams whose tag timestamps rebound (jump
//! backwards) or gap (jump forwards) around reconnects and encoder hiccups.
//! This operator maintains a running correction delta per sub-stream:
//! whenever the incoming timestamp would violate per-type monotonicity or
//! exceed the expected inter-tag interval, the delta is recomputed so the
//! corrected timeline advances by exactly one frame/sample interval.
//!
//! Intervals are derived from metadata: the video interval from the `fps` /
//! `framerate` field (default 30), the audio interval from the nominal
//! 44 kHz AAC cadence. Cross-type continuity tolerates
//! `max(sound, video) interval + 1` milliseconds.

use std::sync::Arc;

use amf0::Amf0Value;
use flv::data::FlvData;
use flv::tag::FlvTag;
use pipeline_common::{PipelineError, Processor, StreamerContext};
use tracing::{debug, warn};

const DEFAULT_FRAME_RATE: f64 = 30.0;
const TOLERANCE_MS: i64 = 1;

/// The timestamp and kind of the most recent tag of one media type.
#[derive(Debug, Clone, Copy)]
struct LastTag {
    timestamp_ms: u32,
    is_sequence_header: bool,
}

impl LastTag {
    fn of(tag: &FlvTag) -> Self {
        Self {
            timestamp_ms: tag.timestamp_ms,
            is_sequence_header: tag.is_sequence_header(),
        }
    }
}

pub struct TimingRepairOperator {
    context: Arc<StreamerContext>,
    delta: i64,
    last_tag: Option<LastTag>,
    last_audio_tag: Option<LastTag>,
    last_video_tag: Option<LastTag>,
    video_frame_interval: i64,
    sound_sample_interval: i64,
}

fn video_interval_for(fps: f64) -> i64 {
    if fps <= 0.0 {
        return video_interval_for(DEFAULT_FRAME_RATE);
    }
    // 30 fps steps 33-34ms; use the nominal rounded interval.
    (1000.0 / fps).round().max(1.0) as i64
}

fn sound_interval() -> i64 {
    // Nominal AAC frame cadence at 44 kHz.
    (1000.0_f64 / 44.0).ceil() as i64
}

impl TimingRepairOperator {
    pub fn new(context: Arc<StreamerContext>) -> Self {
        Self {
            context,
            delta: 0,
            last_tag: None,
            last_audio_tag: None,
            last_video_tag: None,
            video_frame_interval: video_interval_for(DEFAULT_FRAME_RATE),
            sound_sample_interval: sound_interval(),
        }
    }

    fn reset(&mut self) {
        self.delta = 0;
        self.last_tag = None;
        self.last_audio_tag = None;
        self.last_video_tag = None;
        self.video_frame_interval = video_interval_for(DEFAULT_FRAME_RATE);
        self.sound_sample_interval = sound_interval();
    }

    fn update_parameters(&mut self, tag: &FlvTag) {
        let Ok(script) = tag.decode_script() else {
            return;
        };
        if !script.is_metadata() {
            return;
        }
        let Some(value) = script.value() else {
            return;
        };

        let fps = value
            .get("fps")
            .or_else(|| value.get("framerate"))
            .and_then(|v| match v {
                Amf0Value::Number(n) => Some(*n),
                Amf0Value::String(s) => s.parse::<f64>().ok(),
                _ => None,
            });

        if let Some(fps) = fps.filter(|fps| *fps > 0.0) {
            self.video_frame_interval = video_interval_for(fps);
            debug!(
                "{} frame rate: {}, video frame interval: {}",
                self.context.name, fps, self.video_frame_interval
            );
        }
    }

    fn expected_ts(&self, tag: &FlvTag) -> i64 {
        tag.timestamp_ms as i64 + self.delta
    }

    fn is_ts_rebounded(&self, tag: &FlvTag) -> bool {
        let last = if tag.is_audio_tag() {
            self.last_audio_tag
        } else if tag.is_video_tag() {
            self.last_video_tag
        } else {
            return false;
        };

        match last {
            None => false,
            Some(last) => {
                // Right after a sequence header the first data tag may share
                // its timestamp.
                if last.is_sequence_header {
                    self.expected_ts(tag) < last.timestamp_ms as i64
                } else {
                    self.expected_ts(tag) <= last.timestamp_ms as i64
                }
            }
        }
    }

    fn is_ts_incontinuous(&self, tag: &FlvTag) -> bool {
        match self.last_tag {
            None => false,
            Some(last) => {
                let max_interval = self.sound_sample_interval.max(self.video_frame_interval);
                self.expected_ts(tag) - last.timestamp_ms as i64 > max_interval + TOLERANCE_MS
            }
        }
    }

    /// Recompute the delta so this tag lands one interval after the last tag
    /// of its own type, falling back to the overall last tag when that would
    /// still not move forward.
    fn update_delta(&mut self, tag: &FlvTag) {
        let ts = tag.timestamp_ms as i64;

        if tag.is_video_tag() {
            if let Some(last_video) = self.last_video_tag {
                self.delta = last_video.timestamp_ms as i64 - ts + self.video_frame_interval;
            }
        } else if tag.is_audio_tag() {
            if let Some(last_audio) = self.last_audio_tag {
                self.delta = last_audio.timestamp_ms as i64 - ts + self.sound_sample_interval;
            }
        }

        if let Some(last) = self.last_tag {
            if ts + self.delta <= last.timestamp_ms as i64 {
                if tag.is_video_tag() {
                    self.delta = last.timestamp_ms as i64 - ts + self.video_frame_interval;
                } else if tag.is_audio_tag() {
                    self.delta = last.timestamp_ms as i64 - ts + self.sound_sample_interval;
                }
            }
        }
    }

    fn correct_ts(&self, tag: &FlvTag) -> FlvTag {
        if self.delta == 0 {
            return tag.clone();
        }
        let mut corrected = tag.clone();
        corrected.timestamp_ms = (tag.timestamp_ms as i64 + self.delta).max(0) as u32;
        corrected
    }

    fn update_last_tags(&mut self, tag: &FlvTag) {
        let entry = LastTag::of(tag);
        self.last_tag = Some(entry);
        if tag.is_audio_tag() {
            self.last_audio_tag = Some(entry);
        } else if tag.is_video_tag() {
            self.last_video_tag = Some(entry);
        }
    }
}

impl Processor<FlvData> for TimingRepairOperator {
    fn process(
        &mut self,
        input: FlvData,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        match &input {
            FlvData::Header(_) => {
                self.reset();
                output(input)
            }
            FlvData::Tag(tag) => {
                if tag.is_script_tag() {
                    self.update_parameters(tag);
                    return output(input);
                }

                if self.is_ts_rebounded(tag) {
                    self.update_delta(tag);
                    warn!(
                        "{} timestamp rebounded at {}ms, updated delta: {}",
                        self.context.name, tag.timestamp_ms, self.delta
                    );
                } else if self.is_ts_incontinuous(tag) {
                    self.update_delta(tag);
                    warn!(
                        "{} timestamp incontinuous at {}ms, updated delta: {}",
                        self.context.name, tag.timestamp_ms, self.delta
                    );
                }

                let corrected = self.correct_ts(tag);
                self.update_last_tags(&corrected);
                output(FlvData::Tag(corrected))
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
        "TimingRepairOperator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use pipeline_common::test_context;

    fn run(input: Vec<FlvData>) -> Vec<FlvData> {
        let mut operator = TimingRepairOperator::new(test_context());
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
    fn test_rebound_is_straightened_to_frame_cadence() {
        let input = vec![
            create_test_header(),
            create_video_tag(0, true),
            create_video_tag(33, false),
            create_video_tag(66, false),
            // Rebound: the server restarted its timeline.
            create_video_tag(10, false),
            create_video_tag(43, false),
        ];

        let results = run(input);
        assert_eq!(tag_timestamps(&results), vec![0, 33, 66, 99, 132]);
    }

    #[test]
    fn test_emitted_order_equals_input_order() {
        let input = vec![
            create_test_header(),
            create_video_tag(0, true),
            create_video_tag(33, false),
            create_video_tag(10, false),
        ];

        let results = run(input);
        // One output per input, same kinds in the same positions.
        assert_eq!(results.len(), 4);
        assert!(results[0].is_header());
        assert!(results[1..].iter().all(|i| i.is_tag()));
    }

    #[test]
    fn test_forward_jump_is_closed_up() {
        let input = vec![
            create_test_header(),
            create_video_tag(0, true),
            create_video_tag(33, false),
            // 5 second gap.
            create_video_tag(5033, false),
            create_video_tag(5066, false),
        ];

        let results = run(input);
        assert_eq!(tag_timestamps(&results), vec![0, 33, 66, 99]);
    }

    #[test]
    fn test_per_type_monotonicity_with_interleaved_audio() {
        let input = vec![
            create_test_header(),
            create_video_tag(0, true),
            create_audio_tag(5),
            create_video_tag(33, false),
            create_audio_tag(28),
            create_video_tag(66, false),
            create_audio_tag(51),
        ];

        let results = run(input);

        let mut last_audio = None;
        let mut last_video = None;
        for item in &results {
            if let FlvData::Tag(tag) = item {
                if tag.is_audio_tag() {
                    if let Some(prev) = last_audio {
                        assert!(tag.timestamp_ms > prev, "audio must be monotonic");
                    }
                    last_audio = Some(tag.timestamp_ms);
                } else if tag.is_video_tag() {
                    if let Some(prev) = last_video {
                        assert!(tag.timestamp_ms > prev, "video must be monotonic");
                    }
                    last_video = Some(tag.timestamp_ms);
                }
            }
        }
    }

    #[test]
    fn test_new_header_resets_delta() {
        let input = vec![
            create_test_header(),
            create_video_tag(0, true),
            create_video_tag(1000, false), // jump, builds a delta
            create_test_header(),
            create_video_tag(0, true),
            create_video_tag(33, false),
        ];

        let results = run(input);
        let timestamps = tag_timestamps(&results);
        // Second stream is untouched.
        assert_eq!(&timestamps[2..], &[0, 33]);
    }

    #[test]
    fn test_sequence_header_allows_equal_timestamp() {
        let input = vec![
            create_test_header(),
            create_video_sequence_header(0),
            create_video_tag(0, true),
            create_video_tag(33, false),
        ];

        let results = run(input);
        assert_eq!(tag_timestamps(&results), vec![0, 0, 33]);
    }
}
