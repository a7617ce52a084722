//! In-place metadata injection for finished FLV files.
//!
//! Rewrites the first `onMetaData` tag of a file with updated values
//! (duration, filesize, keyframe index, join points). The file is copied to
//! a `<name>_injecting.<ext>` sibling with the new metadata tag spliced in,
//! then atomically renamed over the original, so a crash never leaves a
//! half-written recording behind.

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use amf0::Amf0Value;
use flv::data::FlvData;
use flv::parser::FlvStreamParser;
use flv::writer::FlvWriter;
use flv::{FlvError, FlvTag, FlvTagType};
use tracing::{debug, info};

use crate::metadata::{MetaData, keyframes_to_amf};
use crate::operators::inject::pairs_to_script_bytes;
use crate::JoinPoint;

/// Build the working path: `video.flv` -> `video_injecting.flv`.
fn injecting_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let ext = path.extension().unwrap_or_default().to_string_lossy();
    path.with_file_name(format!("{stem}_injecting.{ext}"))
}

/// Replace the first metadata tag of `path` with one carrying the analysed
/// values and the join-point list.
pub fn inject_metadata(
    path: &Path,
    metadata: &MetaData,
    join_points: &[JoinPoint],
) -> Result<(), FlvError> {
    let work_path = injecting_path(path);
    info!("injecting metadata into {}", path.display());

    {
        let input = std::fs::File::open(path)?;
        let output = std::fs::File::create(&work_path)?;
        let mut writer = FlvWriter::new(BufWriter::new(output));

        let mut replaced = false;
        for item in FlvStreamParser::new(BufReader::new(input)) {
            match item? {
                FlvData::Header(header) => writer.write_header(&header)?,
                FlvData::Tag(tag) => {
                    if !replaced && tag.is_script_tag() {
                        let script = tag.decode_script()?;
                        if script.is_metadata() {
                            let new_tag = make_metadata_tag(&tag, metadata, join_points)?;
                            writer.write_tag(&new_tag)?;
                            replaced = true;
                            continue;
                        }
                    }
                    writer.write_tag(&tag)?;
                }
            };
        }

        if !replaced {
            std::fs::remove_file(&work_path).ok();
            return Err(FlvError::DataError(
                "no metadata tag found to replace".to_string(),
            ));
        }

        writer.flush()?;
    }

    std::fs::rename(&work_path, path)?;
    debug!("metadata injected into {}", path.display());
    Ok(())
}

fn make_metadata_tag(
    original: &FlvTag,
    metadata: &MetaData,
    join_points: &[JoinPoint],
) -> Result<FlvTag, FlvError> {
    // Start from the original properties so provider-supplied fields
    // (streamer, room, recording time) survive, then overwrite with the
    // analysed values.
    let script = original.decode_script()?;
    let mut pairs: Vec<(String, Amf0Value<'static>)> = script
        .value()
        .and_then(|v| v.properties())
        .map(|props| {
            props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_owned()))
                .collect()
        })
        .unwrap_or_default();

    fn upsert(
        pairs: &mut Vec<(String, Amf0Value<'static>)>,
        key: &str,
        value: Amf0Value<'static>,
    ) {
        if let Some(slot) = pairs.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            pairs.push((key.to_string(), value));
        }
    }

    for (key, value) in metadata.to_amf_pairs() {
        upsert(&mut pairs, &key, value);
    }

    if !join_points.is_empty() {
        upsert(
            &mut pairs,
            "joinpoints",
            Amf0Value::StrictArray(
                join_points
                    .iter()
                    .map(|jp| {
                        Amf0Value::Object(
                            vec![
                                ("seamless".into(), Amf0Value::Boolean(jp.seamless)),
                                ("timestamp".into(), Amf0Value::Number(jp.timestamp_ms)),
                                ("crc32".into(), Amf0Value::String(jp.crc32.clone().into())),
                            ]
                            .into(),
                        )
                    })
                    .collect(),
            ),
        );
    }

    // Keyframe offsets were computed against the analysed layout; splicing
    // in a different-sized metadata tag moves everything after it.
    let provisional = pairs_to_script_bytes(&pairs)?;
    let offset = (11 + provisional.len()) as f64 - original.size() as f64;
    if offset != 0.0 {
        let mut keyframes = metadata.keyframes.clone();
        for position in &mut keyframes.filepositions {
            *position += offset;
        }
        let last = keyframes.filepositions.last().copied();
        upsert(&mut pairs, "keyframes", keyframes_to_amf(&keyframes));
        if let Some(last) = last {
            upsert(&mut pairs, "lastkeyframelocation", Amf0Value::Number(last));
        }
        upsert(
            &mut pairs,
            "filesize",
            Amf0Value::Number(metadata.filesize + offset),
        );
    }

    let data = pairs_to_script_bytes(&pairs)?;
    Ok(FlvTag {
        timestamp_ms: 0,
        stream_id: 0,
        tag_type: FlvTagType::ScriptData,
        data: bytes::Bytes::from(data),
    })
}

/// Scan a finished file and check it contains everything a player needs:
/// metadata, one sequence header per declared medium, and at least one data
/// tag per declared medium.
pub fn is_playable_file(path: &Path) -> Result<bool, FlvError> {
    let input = std::fs::File::open(path)?;
    let mut parser = FlvStreamParser::new(BufReader::new(input));

    let header = match parser.next() {
        Some(Ok(FlvData::Header(header))) => header,
        _ => return Ok(false),
    };

    let mut has_metadata = false;
    let mut has_audio_header = false;
    let mut has_video_header = false;
    let mut has_audio_data = false;
    let mut has_video_data = false;

    for item in parser {
        let FlvData::Tag(tag) = item? else { continue };
        if tag.is_script_tag() {
            has_metadata = true;
        } else if tag.is_audio_sequence_header() {
            has_audio_header = true;
        } else if tag.is_video_sequence_header() {
            has_video_header = true;
        } else if tag.is_audio_tag() {
            has_audio_data = true;
        } else if tag.is_video_tag() {
            has_video_data = true;
        }

        let audio_ok = !header.has_audio || (has_audio_header && has_audio_data);
        let video_ok = !header.has_video || (has_video_header && has_video_data);
        if has_metadata && audio_ok && video_ok {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::KeyFrames;
    use crate::test_utils::*;

    fn write_sample_file(path: &Path) -> Vec<FlvData> {
        let items = vec![
            create_test_header(),
            create_metadata_tag(0),
            create_video_sequence_header(0),
            create_audio_sequence_header(0),
            create_video_tag(0, true),
            create_audio_tag(5),
            create_video_tag(33, false),
        ];
        let mut writer = FlvWriter::new(std::fs::File::create(path).unwrap());
        for item in &items {
            match item {
                FlvData::Header(h) => {
                    writer.write_header(h).unwrap();
                }
                FlvData::Tag(t) => {
                    writer.write_tag(t).unwrap();
                }
            }
        }
        writer.flush().unwrap();
        items
    }

    fn sample_metadata() -> MetaData {
        MetaData {
            hasAudio: true,
            hasVideo: true,
            hasMetadata: true,
            hasKeyframes: true,
            canSeekToEnd: false,
            duration: 0.033,
            datasize: 100.0,
            filesize: 200.0,
            audiosize: Some(10.0),
            audiocodecid: Some(10.0),
            audiodatarate: Some(0.0),
            audiosamplerate: Some(44100.0),
            audiosamplesize: Some(16.0),
            stereo: Some(true),
            videosize: 60.0,
            framerate: 30.0,
            videocodecid: 7.0,
            videodatarate: 0.0,
            width: 1920.0,
            height: 1080.0,
            lasttimestamp: 0.033,
            lastkeyframelocation: 13.0,
            lastkeyframetimestamp: 0.0,
            keyframes: KeyFrames {
                times: vec![0.0],
                filepositions: vec![13.0],
            },
        }
    }

    #[test]
    fn test_inject_replaces_metadata_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.flv");
        write_sample_file(&path);

        let join_points = vec![JoinPoint {
            seamless: true,
            timestamp_ms: 1000.0,
            crc32: "abcd".to_string(),
        }];
        inject_metadata(&path, &sample_metadata(), &join_points).unwrap();

        assert!(!injecting_path(&path).exists());

        let bytes = std::fs::read(&path).unwrap();
        let parsed = flv::parser::parse_all(&bytes).unwrap();
        let FlvData::Tag(metadata_tag) = &parsed[1] else {
            panic!("expected metadata tag");
        };
        let script = metadata_tag.decode_script().unwrap();
        let value = script.value().unwrap();
        assert_eq!(value.get("width").and_then(|v| v.as_number()), Some(1920.0));
        assert!(value.get("joinpoints").is_some());
    }

    #[test]
    fn test_playability_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.flv");
        write_sample_file(&path);
        assert!(is_playable_file(&path).unwrap());

        // A file with only a header and metadata is not playable.
        let short_path = dir.path().join("short.flv");
        let mut writer = FlvWriter::new(std::fs::File::create(&short_path).unwrap());
        if let FlvData::Header(h) = create_test_header() {
            writer.write_header(&h).unwrap();
        }
        if let FlvData::Tag(t) = create_metadata_tag(0) {
            writer.write_tag(&t).unwrap();
        }
        writer.flush().unwrap();
        assert!(!is_playable_file(&short_path).unwrap());
    }
}
