//! # Concat Operator
//!
//! Stitches the streams produced by reconnects into one continuous stream.
//! When a new header arrives mid-session the operator gathers up to
//! 20 seconds of tags from the new stream and searches them for the tail of
//! what was already emitted (the last few tags, compared byte-wise). On a
//! match the overlapping tags are skipped and the timeline continues
//! seamlessly; otherwise the new tags are appended with a small gap. Either
//! way a synthetic `onJoinPoint` script tag is emitted right before the
//! first re-emitted data tag, recording whether the seam is lossless and
//! the CRC32 of the tag that follows it.
//!
//! If a sequence header changes while gathering, stitching is impossible;
//! the gathered stream is re-emitted as a genuine new stream.

use std::sync::Arc;

use bytes::Bytes;
use flv::data::FlvData;
use flv::header::FlvHeader;
use flv::tag::{FlvTag, FlvTagType};
use pipeline_common::{PipelineError, Processor, StreamerContext};
use tracing::{debug, info};

use crate::join_point::JoinPoint;

/// Tags compared to decide whether streams overlap.
const NUM_OF_LAST_TAGS: usize = 3;
/// How long the overlap may last, in timeline milliseconds.
const MAX_DURATION_MS: u32 = 20_000;
/// Timeline gap inserted when no overlap was found.
const MIN_INTERVAL_MS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Noop,
    Correct,
    Gather,
    Cancel,
    Concat,
    ConcatAndGather,
}

pub struct ConcatOperator {
    context: Arc<StreamerContext>,
    num_of_last_tags: usize,
    max_duration_ms: u32,
    delta: i64,
    action: Action,
    last_tags: Vec<FlvTag>,
    gathered_tags: Vec<FlvTag>,
    last_header: Option<FlvHeader>,
    last_audio_sequence_header: Option<FlvTag>,
    last_video_sequence_header: Option<FlvTag>,
}

impl ConcatOperator {
    pub fn new(context: Arc<StreamerContext>) -> Self {
        Self {
            context,
            num_of_last_tags: NUM_OF_LAST_TAGS,
            max_duration_ms: MAX_DURATION_MS,
            delta: 0,
            action: Action::Noop,
            last_tags: Vec::new(),
            gathered_tags: Vec::new(),
            last_header: None,
            last_audio_sequence_header: None,
            last_video_sequence_header: None,
        }
    }

    fn update_last_tags(&mut self, tag: &FlvTag) {
        self.last_tags.push(tag.clone());
        if self.last_tags.len() > self.num_of_last_tags {
            self.last_tags.remove(0);
        }
        if tag.is_audio_sequence_header() {
            self.last_audio_sequence_header = Some(tag.clone());
        } else if tag.is_video_sequence_header() {
            self.last_video_sequence_header = Some(tag.clone());
        }
    }

    fn gather_tag(&mut self, tag: &FlvTag) {
        if tag.is_audio_sequence_header() {
            match &self.last_audio_sequence_header {
                None => {
                    debug!(
                        "{} cancel concat: no previous audio sequence header",
                        self.context.name
                    );
                    self.action = Action::Cancel;
                }
                Some(prev) if !tag.body_equals(prev) => {
                    debug!(
                        "{} cancel concat: audio sequence header changed",
                        self.context.name
                    );
                    self.action = Action::Cancel;
                }
                _ => {}
            }
            self.last_audio_sequence_header = Some(tag.clone());
        } else if tag.is_video_sequence_header() {
            match &self.last_video_sequence_header {
                None => {
                    debug!(
                        "{} cancel concat: no previous video sequence header",
                        self.context.name
                    );
                    self.action = Action::Cancel;
                }
                Some(prev) if !tag.body_equals(prev) => {
                    debug!(
                        "{} cancel concat: video sequence header changed",
                        self.context.name
                    );
                    self.action = Action::Cancel;
                }
                _ => {}
            }
            self.last_video_sequence_header = Some(tag.clone());
        }
        self.gathered_tags.push(tag.clone());
    }

    fn has_gathering_completed(&self) -> bool {
        // Timestamps of the gathered stream start from 0 (the upstream fix
        // and correct operators guarantee it).
        self.gathered_tags
            .last()
            .is_some_and(|tag| tag.timestamp_ms >= self.max_duration_ms)
    }

    /// Find the gathered index holding the last already-emitted tag, with
    /// the preceding gathered tags matching the previously emitted ones.
    fn find_last_duplicated_tag(&self, tags: &[FlvTag]) -> Option<usize> {
        let last_out_tag = self.last_tags.last()?;

        for (idx, tag) in tags.iter().enumerate() {
            if !tag.body_equals(last_out_tag) {
                continue;
            }

            let window_start = idx.saturating_sub(self.last_tags.len() - 1);
            let window = &tags[window_start..idx];
            let matches = window
                .iter()
                .zip(self.last_tags[..self.last_tags.len() - 1].iter())
                .all(|(a, b)| a.body_equals(b));
            if !matches {
                continue;
            }

            debug!(
                "{} last duplicated tag found at index {}",
                self.context.name, idx
            );
            return Some(idx);
        }

        debug!("{} no duplicated tag found", self.context.name);
        None
    }

    fn correct_ts(&self, tag: &FlvTag) -> FlvTag {
        if self.delta == 0 {
            return tag.clone();
        }
        let mut out = tag.clone();
        out.timestamp_ms = (tag.timestamp_ms as i64 + self.delta).max(0) as u32;
        out
    }

    fn make_join_point_tag(&self, next_tag: &FlvTag, seamless: bool) -> FlvTag {
        let join_point = JoinPoint {
            seamless,
            timestamp_ms: next_tag.timestamp_ms as f64,
            crc32: format!("{:x}", next_tag.body_crc32()),
        };
        info!("{} join point: {}", self.context.name, join_point);
        FlvTag {
            timestamp_ms: next_tag.timestamp_ms,
            stream_id: 0,
            tag_type: FlvTagType::ScriptData,
            data: Bytes::from(join_point.to_script_bytes()),
        }
    }

    fn do_concat(
        &mut self,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        debug!(
            "{} concatenating: gathered {} tags, total size: {}",
            self.context.name,
            self.gathered_tags.len(),
            self.gathered_tags.iter().map(|t| t.size()).sum::<usize>()
        );

        let mut tags: Vec<FlvTag> = std::mem::take(&mut self.gathered_tags)
            .into_iter()
            .filter(|tag| !tag.is_script_tag() && !tag.is_sequence_header())
            .collect();

        if tags.is_empty() {
            return Ok(());
        }

        let seamless = match self.find_last_duplicated_tag(&tags) {
            Some(index) => {
                self.delta = self.last_tags.last().unwrap().timestamp_ms as i64
                    - tags[index].timestamp_ms as i64;
                tags.drain(..=index);
                true
            }
            None => {
                self.delta = self.last_tags.last().map_or(0, |t| t.timestamp_ms as i64)
                    - tags[0].timestamp_ms as i64
                    + MIN_INTERVAL_MS;
                false
            }
        };
        debug!(
            "{} updated delta: {}, seamless: {}",
            self.context.name, self.delta, seamless
        );

        if let Some(first) = tags.first() {
            let join_point_tag = self.make_join_point_tag(&self.correct_ts(first), seamless);
            output(FlvData::Tag(join_point_tag))?;
        }

        for tag in tags {
            let corrected = self.correct_ts(&tag);
            self.update_last_tags(&corrected);
            output(FlvData::Tag(corrected))?;
        }

        Ok(())
    }

    fn do_cancel(
        &mut self,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        debug!(
            "{} cancelling concat: re-emitting {} gathered tags as a new stream",
            self.context.name,
            self.gathered_tags.len()
        );
        let header = self
            .last_header
            .clone()
            .expect("cancel without a stream header");
        output(FlvData::Header(header))?;
        for tag in std::mem::take(&mut self.gathered_tags) {
            self.update_last_tags(&tag);
            output(FlvData::Tag(tag))?;
        }
        Ok(())
    }
}

impl Processor<FlvData> for ConcatOperator {
    fn process(
        &mut self,
        input: FlvData,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        match input {
            FlvData::Header(header) => {
                if self.last_header.is_none() {
                    debug!("{} first stream, no concat needed", self.context.name);
                    self.last_header = Some(header.clone());
                    self.action = Action::Noop;
                    output(FlvData::Header(header))
                } else {
                    debug!("{} gathering tags for deduplication", self.context.name);
                    self.last_header = Some(header);
                    self.action = if self.action == Action::Gather {
                        Action::ConcatAndGather
                    } else {
                        Action::Gather
                    };
                    Ok(())
                }
            }
            FlvData::Tag(tag) => {
                loop {
                    match self.action {
                        Action::Noop => {
                            self.update_last_tags(&tag);
                            output(FlvData::Tag(tag))?;
                            return Ok(());
                        }
                        Action::Correct => {
                            let corrected = self.correct_ts(&tag);
                            self.update_last_tags(&corrected);
                            output(FlvData::Tag(corrected))?;
                            return Ok(());
                        }
                        Action::Concat | Action::ConcatAndGather => {
                            let and_gather = self.action == Action::ConcatAndGather;
                            self.do_concat(output)?;
                            if and_gather {
                                self.action = Action::Gather;
                            } else {
                                self.action = Action::Correct;
                                return Ok(());
                            }
                        }
                        Action::Gather => {
                            self.gather_tag(&tag);
                            if self.action == Action::Cancel {
                                self.do_cancel(output)?;
                                self.action = Action::Noop;
                                return Ok(());
                            }
                            if self.has_gathering_completed() {
                                self.action = Action::Concat;
                                continue;
                            }
                            return Ok(());
                        }
                        Action::Cancel => unreachable!("cancel handled inside gather"),
                    }
                }
            }
        }
    }

    fn finish(
        &mut self,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        if self.action == Action::Gather {
            self.do_concat(output)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ConcatOperator"
    }
}
