//! # Analyser Operator
//!
//! Accumulates per-file statistics as tags flow by (tag counts, payload
//! sizes, keyframe index, real resolution from the AVC sequence header) and
//! publishes the resulting metadata whenever a sub-stream completes. The
//! published values feed the `.meta.json` sidecar and the post-recording
//! metadata injection.

use std::sync::Arc;

use flv::data::FlvData;
use flv::tag::FlvTag;
use pipeline_common::{PipelineError, Processor, StreamerContext};
use tracing::{debug, warn};

use crate::metadata::{KeyFrames, MetaData};

const BACK_POINTER_SIZE: u64 = 4;

/// Callback invoked with the final metadata of each completed sub-stream
/// (`None` when the stream was too broken to analyse).
pub type MetadataSink = Box<dyn Fn(Option<MetaData>) + Send>;

/// Callback invoked with the running duration, in seconds, on every tag.
pub type DurationSink = Box<dyn Fn(f64) + Send>;

#[derive(Default)]
struct Totals {
    num_of_tags: u64,
    num_of_audio_tags: u64,
    num_of_video_tags: u64,
    size_of_tags: u64,
    size_of_audio_tags: u64,
    size_of_video_tags: u64,
    size_of_audio_data: u64,
    size_of_video_data: u64,
    last_timestamp: u32,
    last_timestamp_of_audio: u32,
    last_timestamp_of_video: u32,
    keyframe_timestamps: Vec<u32>,
    keyframe_filepositions: Vec<u64>,
    resolution: Option<flv::Resolution>,
    header_size: u64,

    has_audio: bool,
    has_video: bool,
    audio_codec_id: f64,
    audio_sample_rate: f64,
    audio_sample_size: f64,
    stereo: bool,
    video_codec_id: f64,
}

pub struct AnalyserOperator {
    context: Arc<StreamerContext>,
    on_metadata: MetadataSink,
    on_duration: Option<DurationSink>,
    totals: Totals,
    stream_index: i64,
}

impl AnalyserOperator {
    pub fn new(context: Arc<StreamerContext>, on_metadata: MetadataSink) -> Self {
        Self {
            context,
            on_metadata,
            on_duration: None,
            totals: Totals::default(),
            stream_index: -1,
        }
    }

    pub fn with_duration_sink(mut self, on_duration: DurationSink) -> Self {
        self.on_duration = Some(on_duration);
        self
    }

    fn calc_file_size(&self) -> u64 {
        self.totals.header_size
            + BACK_POINTER_SIZE
            + self.totals.size_of_tags
            + self.totals.num_of_tags * BACK_POINTER_SIZE
    }

    fn calc_data_size(&self) -> u64 {
        self.totals.size_of_audio_tags
            + self.totals.num_of_audio_tags * BACK_POINTER_SIZE
            + self.totals.size_of_video_tags
            + self.totals.num_of_video_tags * BACK_POINTER_SIZE
    }

    fn calc_frame_rate(&self) -> f64 {
        if self.totals.last_timestamp_of_video == 0 {
            return 0.0;
        }
        self.totals.num_of_video_tags as f64 / self.totals.last_timestamp_of_video as f64 * 1000.0
    }

    fn calc_audio_data_rate(&self) -> f64 {
        if self.totals.last_timestamp_of_audio == 0 {
            return 0.0;
        }
        self.totals.size_of_audio_data as f64 * 8.0 / self.totals.last_timestamp_of_audio as f64
    }

    fn calc_video_data_rate(&self) -> f64 {
        if self.totals.last_timestamp_of_video == 0 {
            return 0.0;
        }
        self.totals.size_of_video_data as f64 * 8.0 / self.totals.last_timestamp_of_video as f64
    }

    fn make_metadata(&self) -> Option<MetaData> {
        if !self.totals.has_video {
            warn!("{} no video analysed, cannot make metadata", self.context.name);
            return None;
        }
        let resolution = self.totals.resolution?;
        let keyframes = KeyFrames {
            times: self
                .totals
                .keyframe_timestamps
                .iter()
                .map(|t| *t as f64 / 1000.0)
                .collect(),
            filepositions: self
                .totals
                .keyframe_filepositions
                .iter()
                .map(|p| *p as f64)
                .collect(),
        };
        let last_keyframe_ts = *self.totals.keyframe_timestamps.last()?;

        let (
            audiosize,
            audiocodecid,
            audiodatarate,
            audiosamplerate,
            audiosamplesize,
            stereo,
        ) = if self.totals.has_audio {
            (
                Some(self.totals.size_of_audio_tags as f64),
                Some(self.totals.audio_codec_id),
                Some(self.calc_audio_data_rate()),
                Some(self.totals.audio_sample_rate),
                Some(self.totals.audio_sample_size),
                Some(self.totals.stereo),
            )
        } else {
            (None, None, None, None, None, None)
        };

        Some(MetaData {
            hasAudio: self.totals.has_audio,
            hasVideo: self.totals.has_video,
            hasMetadata: true,
            hasKeyframes: !self.totals.keyframe_timestamps.is_empty(),
            canSeekToEnd: self.totals.last_timestamp_of_video == last_keyframe_ts,
            duration: self.totals.last_timestamp as f64 / 1000.0,
            datasize: self.calc_data_size() as f64,
            filesize: self.calc_file_size() as f64,
            audiosize,
            audiocodecid,
            audiodatarate,
            audiosamplerate,
            audiosamplesize,
            stereo,
            videosize: self.totals.size_of_video_tags as f64,
            framerate: self.calc_frame_rate(),
            videocodecid: self.totals.video_codec_id,
            videodatarate: self.calc_video_data_rate(),
            width: resolution.width as f64,
            height: resolution.height as f64,
            lasttimestamp: self.totals.last_timestamp as f64 / 1000.0,
            lastkeyframelocation: *keyframes.filepositions.last()?,
            lastkeyframetimestamp: *keyframes.times.last()?,
            keyframes,
        })
    }

    fn push_metadata(&self) {
        (self.on_metadata)(self.make_metadata());
    }

    fn analyse_tag(&mut self, tag: &FlvTag) {
        if tag.is_audio_tag() {
            self.analyse_audio_tag(tag);
        } else if tag.is_video_tag() {
            self.analyse_video_tag(tag);
        }

        self.totals.num_of_tags += 1;
        self.totals.size_of_tags += tag.size() as u64;
        self.totals.last_timestamp = tag.timestamp_ms;

        if let Some(on_duration) = &self.on_duration {
            on_duration(self.totals.last_timestamp as f64 / 1000.0);
        }
    }

    fn analyse_audio_tag(&mut self, tag: &FlvTag) {
        if !self.totals.has_audio {
            if let Ok(header) = tag.decode_audio_header() {
                self.totals.has_audio = true;
                self.totals.audio_codec_id = header.sound_format as u8 as f64;
                self.totals.audio_sample_rate = header.sound_rate.hz() as f64;
                self.totals.audio_sample_size = if header.sound_size_16bit { 16.0 } else { 8.0 };
                self.totals.stereo = header.stereo;
                debug!("{} audio analysed: {:?}", self.context.name, header);
            }
        }
        self.totals.num_of_audio_tags += 1;
        self.totals.size_of_audio_tags += tag.size() as u64;
        self.totals.size_of_audio_data += tag.data.len() as u64;
        self.totals.last_timestamp_of_audio = tag.timestamp_ms;
    }

    fn analyse_video_tag(&mut self, tag: &FlvTag) {
        if tag.is_key_frame() {
            // The file position recorded is where this tag starts.
            self.totals.keyframe_timestamps.push(tag.timestamp_ms);
            let position = self.calc_file_size();
            self.totals.keyframe_filepositions.push(position);

            if tag.is_video_sequence_header() {
                if let Some(resolution) = tag.video_resolution() {
                    debug!("{} resolution: {}", self.context.name, resolution);
                    self.totals.resolution = Some(resolution);
                }
            }
        }

        if !self.totals.has_video {
            self.totals.has_video = true;
            self.totals.video_codec_id = tag
                .video_codec()
                .map(|codec| codec as u8 as f64)
                .unwrap_or(0.0);
        }
        self.totals.num_of_video_tags += 1;
        self.totals.size_of_video_tags += tag.size() as u64;
        self.totals.size_of_video_data += tag.data.len() as u64;
        self.totals.last_timestamp_of_video = tag.timestamp_ms;
    }
}

impl Processor<FlvData> for AnalyserOperator {
    fn process(
        &mut self,
        input: FlvData,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        match &input {
            FlvData::Header(_) => {
                self.stream_index += 1;
                if self.stream_index > 0 {
                    self.push_metadata();
                }
                self.totals = Totals {
                    header_size: 9,
                    ..Totals::default()
                };
                output(input)
            }
            FlvData::Tag(tag) => {
                self.analyse_tag(tag);
                output(input)
            }
        }
    }

    fn finish(
        &mut self,
        _output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        if self.stream_index >= 0 {
            self.push_metadata();
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "AnalyserOperator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use parking_lot::Mutex;

    use pipeline_common::test_context;

    /// A video sequence header carrying a real 1080p SPS so the analyser can
    /// extract the resolution.
    fn sequence_header_with_sps(timestamp: u32) -> FlvData {
        const SPS_1080P: &[u8] = &[
            0x67, 0x64, 0x00, 0x28, 0xAC, 0xD9, 0x40, 0x78, 0x02, 0x27, 0xE5, 0x84, 0x00, 0x00,
            0x03, 0x00, 0x04, 0x00, 0x00, 0x03, 0x00, 0xF0, 0x3C, 0x60, 0xC6, 0x58,
        ];
        let mut data = vec![0x17, 0x00, 0x00, 0x00, 0x00];
        data.extend_from_slice(&[0x01, 0x64, 0x00, 0x28, 0xFF, 0xE1]);
        data.extend_from_slice(&(SPS_1080P.len() as u16).to_be_bytes());
        data.extend_from_slice(SPS_1080P);
        data.push(0x01);
        data.extend_from_slice(&4u16.to_be_bytes());
        data.extend_from_slice(&[0x68, 0xCE, 0x38, 0x80]);
        FlvData::Tag(FlvTag {
            timestamp_ms: timestamp,
            stream_id: 0,
            tag_type: flv::FlvTagType::Video,
            data: bytes::Bytes::from(data),
        })
    }

    #[test]
    fn test_metadata_published_per_stream() {
        let published: Arc<Mutex<Vec<Option<MetaData>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_ref = published.clone();
        let mut operator = AnalyserOperator::new(
            test_context(),
            Box::new(move |meta| sink_ref.lock().push(meta)),
        );

        let mut sink = |_item: FlvData| Ok(());
        operator.process(create_test_header(), &mut sink).unwrap();
        operator
            .process(sequence_header_with_sps(0), &mut sink)
            .unwrap();
        operator
            .process(create_audio_sequence_header(0), &mut sink)
            .unwrap();
        for i in 0..10u32 {
            operator
                .process(create_video_tag(i * 33, i % 5 == 0), &mut sink)
                .unwrap();
            operator.process(create_audio_tag(i * 33 + 5), &mut sink).unwrap();
        }
        operator.finish(&mut sink).unwrap();

        let published = published.lock();
        assert_eq!(published.len(), 1);
        let metadata = published[0].as_ref().expect("metadata present");

        assert!(metadata.hasAudio);
        assert!(metadata.hasVideo);
        assert!(metadata.hasKeyframes);
        assert_eq!(metadata.width, 1920.0);
        assert_eq!(metadata.height, 1080.0);
        assert_eq!(metadata.duration, 0.302);
        // Sequence header + keyframes at 0 and 165ms.
        assert_eq!(metadata.keyframes.times, vec![0.0, 0.0, 0.165]);
        assert_eq!(metadata.audiocodecid, Some(10.0));
        assert_eq!(metadata.audiosamplerate, Some(44100.0));
        assert_eq!(metadata.stereo, Some(true));
    }

    #[test]
    fn test_keyframe_positions_match_writer_offsets() {
        let published: Arc<Mutex<Vec<Option<MetaData>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_ref = published.clone();
        let mut operator = AnalyserOperator::new(
            test_context(),
            Box::new(move |meta| sink_ref.lock().push(meta)),
        );

        let items = vec![
            create_test_header(),
            sequence_header_with_sps(0),
            create_video_tag(0, true),
            create_video_tag(33, false),
            create_video_tag(66, true),
        ];

        // Write the same items through the FLV writer to learn the true
        // byte offsets.
        let mut writer = flv::FlvWriter::new(Vec::new());
        let mut offsets = Vec::new();
        for item in &items {
            match item {
                FlvData::Header(h) => {
                    writer.write_header(h).unwrap();
                }
                FlvData::Tag(t) => {
                    offsets.push(writer.write_tag(t).unwrap());
                }
            }
        }

        let mut sink = |_item: FlvData| Ok(());
        for item in items {
            operator.process(item, &mut sink).unwrap();
        }
        operator.finish(&mut sink).unwrap();

        let published = published.lock();
        let metadata = published[0].as_ref().unwrap();
        // Keyframes: the sequence header, tag@0 and tag@66.
        assert_eq!(
            metadata.keyframes.filepositions,
            vec![offsets[0] as f64, offsets[1] as f64, offsets[3] as f64]
        );
        assert_eq!(metadata.lastkeyframelocation, offsets[3] as f64);
    }
}
