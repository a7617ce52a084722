//! # Inject Operator
//!
//! Ensures every sub-stream starts with an `onMetaData` tag carrying the
//! caller's extra fields (room, streamer, recording time). When the stream
//! already has a metadata tag it is enriched in place; when it has none, a
//! minimal one is synthesized. Enrichment changes the tag's size, so any
//! keyframe byte offsets present in the metadata are shifted by the size
//! delta to stay accurate.

use std::sync::Arc;

use amf0::Amf0Value;
use bytes::Bytes;
use flv::data::FlvData;
use flv::script::{ON_METADATA, ScriptData};
use flv::tag::{FlvTag, FlvTagType};
use pipeline_common::{PipelineError, Processor, StreamerContext};
use tracing::debug;

use crate::metadata::{keyframes_from_amf, keyframes_to_amf};

/// Supplies the fields to merge into each file's metadata. Receives the
/// stream's own metadata properties for context.
pub type MetadataProvider = Arc<
    dyn Fn(&[(String, Amf0Value<'static>)]) -> Vec<(String, Amf0Value<'static>)> + Send + Sync,
>;

pub struct InjectOperator {
    context: Arc<StreamerContext>,
    provider: MetadataProvider,
    index: u64,
}

/// An ordered property list with upsert semantics: existing keys are
/// replaced in place, new keys are appended.
fn merge_pairs(
    base: Vec<(String, Amf0Value<'static>)>,
    extra: Vec<(String, Amf0Value<'static>)>,
) -> Vec<(String, Amf0Value<'static>)> {
    let mut merged = base;
    for (key, value) in extra {
        if let Some(slot) = merged.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            merged.push((key, value));
        }
    }
    merged
}

pub(crate) fn pairs_to_script_bytes(
    pairs: &[(String, Amf0Value<'static>)],
) -> std::io::Result<Vec<u8>> {
    let script = ScriptData {
        name: ON_METADATA.to_string(),
        data: vec![Amf0Value::EcmaArray(
            pairs
                .iter()
                .map(|(k, v)| (std::borrow::Cow::Owned(k.clone()), v.clone()))
                .collect::<Vec<_>>()
                .into(),
        )],
    };
    script.to_bytes()
}

impl InjectOperator {
    pub fn new(context: Arc<StreamerContext>, provider: MetadataProvider) -> Self {
        Self {
            context,
            provider,
            index: 0,
        }
    }

    fn inject_metadata(&self, tag: &FlvTag) -> Result<FlvTag, PipelineError> {
        let script = tag.decode_script().map_err(PipelineError::Io)?;
        let old_pairs: Vec<(String, Amf0Value<'static>)> = script
            .value()
            .and_then(|v| v.properties())
            .map(|props| {
                props
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_owned()))
                    .collect()
            })
            .unwrap_or_default();

        let extra = (self.provider)(&old_pairs);

        let base = vec![
            ("duration".to_string(), Amf0Value::Number(0.0)),
            ("filesize".to_string(), Amf0Value::Number(0.0)),
        ];
        let mut final_pairs = merge_pairs(merge_pairs(base, old_pairs), extra);

        let mut data = pairs_to_script_bytes(&final_pairs).map_err(PipelineError::Io)?;

        // The enriched tag is bigger than the original; keyframe offsets
        // recorded relative to the old layout must shift with it.
        let keyframes = final_pairs
            .iter()
            .find(|(k, _)| k == "keyframes")
            .and_then(|(_, v)| keyframes_from_amf(v));
        if let Some(mut keyframes) = keyframes {
            let offset = (11 + data.len()) as f64 - tag.size() as f64;
            for position in &mut keyframes.filepositions {
                *position += offset;
            }
            let last_location = keyframes.filepositions.last().copied();

            for (key, value) in &mut final_pairs {
                if key == "keyframes" {
                    *value = keyframes_to_amf(&keyframes);
                } else if key == "lastkeyframelocation" {
                    if let Some(location) = last_location {
                        *value = Amf0Value::Number(location);
                    }
                }
            }
            data = pairs_to_script_bytes(&final_pairs).map_err(PipelineError::Io)?;
        }

        Ok(FlvTag {
            timestamp_ms: tag.timestamp_ms,
            stream_id: tag.stream_id,
            tag_type: FlvTagType::ScriptData,
            data: Bytes::from(data),
        })
    }

    fn make_metadata_tag(&self) -> Result<FlvTag, PipelineError> {
        let extra = (self.provider)(&[]);
        let base = vec![
            ("duration".to_string(), Amf0Value::Number(0.0)),
            ("filesize".to_string(), Amf0Value::Number(0.0)),
        ];
        let pairs = merge_pairs(base, extra);
        let data = pairs_to_script_bytes(&pairs).map_err(PipelineError::Io)?;
        Ok(FlvTag {
            timestamp_ms: 0,
            stream_id: 0,
            tag_type: FlvTagType::ScriptData,
            data: Bytes::from(data),
        })
    }
}

impl Processor<FlvData> for InjectOperator {
    fn process(
        &mut self,
        input: FlvData,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        match &input {
            FlvData::Header(_) => {
                self.index = 0;
                output(input)
            }
            FlvData::Tag(tag) => {
                self.index += 1;
                if self.index == 1 {
                    if tag.is_script_tag() && tag.decode_script().map(|s| s.is_metadata()).unwrap_or(false) {
                        let enriched = self.inject_metadata(tag)?;
                        debug!("{} injected metadata into the metadata tag", self.context.name);
                        return output(FlvData::Tag(enriched));
                    }
                    debug!(
                        "{} no metadata tag in the stream, inserting one",
                        self.context.name
                    );
                    let metadata_tag = self.make_metadata_tag()?;
                    output(FlvData::Tag(metadata_tag))?;
                }
                output(input)
            }
        }
    }

    fn finish(
        &mut self,
        _output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "InjectOperator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use pipeline_common::test_context;

    fn provider(extra: Vec<(String, Amf0Value<'static>)>) -> MetadataProvider {
        Arc::new(move |_old: &[(String, Amf0Value<'static>)]| extra.clone())
    }

    fn run(provider: MetadataProvider, input: Vec<FlvData>) -> Vec<FlvData> {
        let mut operator = InjectOperator::new(test_context(), provider);
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

    fn first_script_pairs(results: &[FlvData]) -> Vec<(String, Amf0Value<'static>)> {
        results
            .iter()
            .find_map(|item| match item {
                FlvData::Tag(tag) if tag.is_script_tag() => {
                    let script = tag.decode_script().unwrap();
                    script.value().and_then(|v| v.properties()).map(|props| {
                        props
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_owned()))
                            .collect()
                    })
                }
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_existing_metadata_enriched() {
        let results = run(
            provider(vec![(
                "streamer".to_string(),
                Amf0Value::String("some streamer".into()),
            )]),
            vec![
                create_test_header(),
                create_metadata_tag(0),
                create_video_tag(0, true),
            ],
        );

        let pairs = first_script_pairs(&results);
        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"duration"));
        assert!(keys.contains(&"filesize"));
        assert!(keys.contains(&"framerate"));
        assert!(keys.contains(&"streamer"));
    }

    #[test]
    fn test_missing_metadata_synthesized() {
        let results = run(
            provider(vec![("roomid".to_string(), Amf0Value::Number(23058.0))]),
            vec![create_test_header(), create_video_tag(0, true)],
        );

        // Synthesized script tag inserted ahead of the first data tag.
        assert!(matches!(&results[1], FlvData::Tag(tag) if tag.is_script_tag()));
        let pairs = first_script_pairs(&results);
        assert_eq!(
            pairs.iter().find(|(k, _)| k == "duration").map(|(_, v)| v),
            Some(&Amf0Value::Number(0.0))
        );
        assert_eq!(
            pairs.iter().find(|(k, _)| k == "roomid").map(|(_, v)| v),
            Some(&Amf0Value::Number(23058.0))
        );
    }

    #[test]
    fn test_keyframe_positions_shifted_by_growth() {
        // Original metadata carries a keyframe index.
        let original = flv::ScriptData {
            name: flv::ON_METADATA.to_string(),
            data: vec![Amf0Value::EcmaArray(
                vec![
                    ("duration".into(), Amf0Value::Number(10.0)),
                    (
                        "keyframes".into(),
                        keyframes_to_amf(&crate::metadata::KeyFrames {
                            times: vec![0.0, 2.0],
                            filepositions: vec![100.0, 5000.0],
                        }),
                    ),
                ]
                .into(),
            )],
        };
        let original_tag = FlvTag {
            timestamp_ms: 0,
            stream_id: 0,
            tag_type: FlvTagType::ScriptData,
            data: Bytes::from(original.to_bytes().unwrap()),
        };
        let original_size = original_tag.size() as f64;

        let results = run(
            provider(vec![(
                "comment".to_string(),
                Amf0Value::String("x".repeat(64).into()),
            )]),
            vec![
                create_test_header(),
                FlvData::Tag(original_tag),
                create_video_tag(0, true),
            ],
        );

        let enriched = match &results[1] {
            FlvData::Tag(tag) => tag.clone(),
            other => panic!("unexpected: {}", other.description()),
        };
        let growth = enriched.size() as f64 - original_size;
        assert!(growth > 0.0);

        let pairs = first_script_pairs(&results);
        let keyframes = pairs
            .iter()
            .find(|(k, _)| k == "keyframes")
            .and_then(|(_, v)| keyframes_from_amf(v))
            .unwrap();
        assert_eq!(keyframes.filepositions, vec![100.0 + growth, 5000.0 + growth]);
    }
}
