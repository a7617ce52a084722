//! Join points: markers recording where reconnected streams were stitched.
//!
//! The Concat operator emits an `onJoinPoint` script tag ahead of the first
//! tag that comes from a new connection. The extractor removes those marker
//! tags before the stream reaches the dumper and publishes the collected
//! list per output file, so the sidecar metadata (and the postprocessor's
//! chapter list) know where the seams are.

use std::fmt;
use std::sync::Arc;

use amf0::Amf0Value;
use flv::data::FlvData;
use flv::script::{ON_JOIN_POINT, ScriptData};
use flv::tag::FlvTag;
use pipeline_common::{PipelineError, Processor, StreamerContext};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One stitch between two upstream connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPoint {
    /// True when no data was lost across the seam.
    pub seamless: bool,
    /// Timestamp of the first tag after the seam, in milliseconds.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: f64,
    /// CRC32 (lowercase hex) of the body of the first tag after the seam.
    pub crc32: String,
}

impl JoinPoint {
    /// Serialize into an `onJoinPoint` script tag body.
    pub fn to_script_bytes(&self) -> Vec<u8> {
        let script = ScriptData {
            name: ON_JOIN_POINT.to_string(),
            data: vec![Amf0Value::Object(
                vec![
                    ("seamless".into(), Amf0Value::Boolean(self.seamless)),
                    ("timestamp".into(), Amf0Value::Number(self.timestamp_ms)),
                    ("crc32".into(), Amf0Value::String(self.crc32.clone().into())),
                ]
                .into(),
            )],
        };
        // Serialization of plain markers cannot fail.
        script.to_bytes().expect("join point script serialization")
    }

    /// Parse from a script tag, if it is an `onJoinPoint` marker.
    pub fn from_script_tag(tag: &FlvTag) -> Option<Self> {
        let script = tag.decode_script().ok()?;
        if script.name != ON_JOIN_POINT {
            return None;
        }
        let value = script.value()?;
        Some(JoinPoint {
            seamless: value.get("seamless")?.as_bool()?,
            timestamp_ms: value.get("timestamp")?.as_number()?,
            crc32: value.get("crc32")?.as_str()?.to_string(),
        })
    }
}

impl fmt::Display for JoinPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seamless: {}, timestamp: {}ms, crc32: {}",
            if self.seamless { "yes" } else { "no" },
            self.timestamp_ms,
            self.crc32
        )
    }
}

/// Removes `onJoinPoint` marker tags from the stream and publishes the
/// accumulated join points once per output stream.
pub struct JoinPointExtractorOperator {
    context: Arc<StreamerContext>,
    on_join_points: Box<dyn Fn(Vec<JoinPoint>) + Send>,
    stream_index: i64,
    join_points: Vec<JoinPoint>,
    pending_tag: Option<FlvTag>,
}

impl JoinPointExtractorOperator {
    pub fn new(
        context: Arc<StreamerContext>,
        on_join_points: impl Fn(Vec<JoinPoint>) + Send + 'static,
    ) -> Self {
        Self {
            context,
            on_join_points: Box::new(on_join_points),
            stream_index: -1,
            join_points: Vec::new(),
            pending_tag: None,
        }
    }

    fn push_join_points(&mut self) {
        (self.on_join_points)(self.join_points.clone());
    }

    fn is_join_point_tag(tag: &FlvTag) -> bool {
        tag.is_script_tag()
            && tag
                .decode_script()
                .map(|s| s.name == ON_JOIN_POINT)
                .unwrap_or(false)
    }
}

impl Processor<FlvData> for JoinPointExtractorOperator {
    fn process(
        &mut self,
        input: FlvData,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        match &input {
            FlvData::Header(_) => {
                self.stream_index += 1;
                if self.stream_index > 0 {
                    self.push_join_points();
                    self.join_points.clear();
                }
                self.pending_tag = None;
                output(input)
            }
            FlvData::Tag(tag) => {
                // Correlate the marker with the real tag that follows it,
                // verifying the recorded checksum.
                if let Some(marker) = self.pending_tag.take() {
                    if let Some(mut join_point) = JoinPoint::from_script_tag(&marker) {
                        let actual_crc = format!("{:x}", tag.body_crc32());
                        if actual_crc != join_point.crc32 {
                            warn!(
                                "{} join point checksum mismatch: recorded {}, next tag {}",
                                self.context.name, join_point.crc32, actual_crc
                            );
                        }
                        join_point.timestamp_ms = tag.timestamp_ms as f64;
                        debug!("{} extracted join point: {}", self.context.name, join_point);
                        self.join_points.push(join_point);
                    }
                }

                if Self::is_join_point_tag(tag) {
                    self.pending_tag = Some(tag.clone());
                    return Ok(());
                }

                output(input)
            }
        }
    }

    fn finish(
        &mut self,
        _output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        self.push_join_points();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "JoinPointExtractorOperator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use bytes::Bytes;
    use flv::tag::FlvTagType;
    use parking_lot::Mutex;
    use pipeline_common::test_context;

    fn join_point_tag(seamless: bool, next: &FlvTag) -> FlvData {
        let jp = JoinPoint {
            seamless,
            timestamp_ms: next.timestamp_ms as f64,
            crc32: format!("{:x}", next.body_crc32()),
        };
        FlvData::Tag(FlvTag {
            timestamp_ms: next.timestamp_ms,
            stream_id: 0,
            tag_type: FlvTagType::ScriptData,
            data: Bytes::from(jp.to_script_bytes()),
        })
    }

    #[test]
    fn test_markers_removed_and_published() {
        let published: Arc<Mutex<Vec<Vec<JoinPoint>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_ref = published.clone();
        let mut operator = JoinPointExtractorOperator::new(test_context(), move |jps| {
            sink_ref.lock().push(jps);
        });

        let next = match create_video_tag(165, false) {
            FlvData::Tag(tag) => tag,
            _ => unreachable!(),
        };

        let mut results = Vec::new();
        let mut sink = |item: FlvData| {
            results.push(item);
            Ok(())
        };

        operator.process(create_test_header(), &mut sink).unwrap();
        operator
            .process(create_video_tag(132, false), &mut sink)
            .unwrap();
        operator
            .process(join_point_tag(true, &next), &mut sink)
            .unwrap();
        operator
            .process(FlvData::Tag(next.clone()), &mut sink)
            .unwrap();
        operator.finish(&mut sink).unwrap();

        // The marker tag itself is gone from the output.
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|item| match item {
            FlvData::Tag(tag) => !JoinPointExtractorOperator::is_join_point_tag(tag),
            _ => true,
        }));

        let published = published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].len(), 1);
        assert!(published[0][0].seamless);
        assert_eq!(published[0][0].timestamp_ms, 165.0);
    }

    #[test]
    fn test_join_point_round_trip_via_script_tag() {
        let jp = JoinPoint {
            seamless: false,
            timestamp_ms: 1234.0,
            crc32: "89abcdef".to_string(),
        };
        let tag = FlvTag {
            timestamp_ms: 1234,
            stream_id: 0,
            tag_type: FlvTagType::ScriptData,
            data: Bytes::from(jp.to_script_bytes()),
        };
        assert_eq!(JoinPoint::from_script_tag(&tag), Some(jp));
    }
}
