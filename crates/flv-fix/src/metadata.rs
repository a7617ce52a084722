//! Recorded-stream metadata, as carried by the `onMetaData` script tag and
//! the `.meta.json` sidecar.

use amf0::Amf0Value;
use serde::{Deserialize, Serialize};

/// Keyframe index: seconds and byte offsets, parallel arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyFrames {
    pub times: Vec<f64>,
    pub filepositions: Vec<f64>,
}

/// The full metadata computed by the analyser, modelled after what desktop
/// players expect to find in `onMetaData`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct MetaData {
    pub hasAudio: bool,
    pub hasVideo: bool,
    pub hasMetadata: bool,
    pub hasKeyframes: bool,
    pub canSeekToEnd: bool,
    pub duration: f64,
    pub datasize: f64,
    pub filesize: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audiosize: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audiocodecid: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audiodatarate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audiosamplerate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audiosamplesize: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stereo: Option<bool>,

    pub videosize: f64,
    pub framerate: f64,
    pub videocodecid: f64,
    pub videodatarate: f64,
    pub width: f64,
    pub height: f64,

    pub lasttimestamp: f64,
    pub lastkeyframelocation: f64,
    pub lastkeyframetimestamp: f64,
    pub keyframes: KeyFrames,
}

impl MetaData {
    /// Flatten into ordered AMF properties for metadata injection.
    pub fn to_amf_pairs(&self) -> Vec<(String, Amf0Value<'static>)> {
        let mut pairs: Vec<(String, Amf0Value<'static>)> = vec![
            ("hasAudio".into(), Amf0Value::Boolean(self.hasAudio)),
            ("hasVideo".into(), Amf0Value::Boolean(self.hasVideo)),
            ("hasMetadata".into(), Amf0Value::Boolean(self.hasMetadata)),
            ("hasKeyframes".into(), Amf0Value::Boolean(self.hasKeyframes)),
            ("canSeekToEnd".into(), Amf0Value::Boolean(self.canSeekToEnd)),
            ("duration".into(), Amf0Value::Number(self.duration)),
            ("datasize".into(), Amf0Value::Number(self.datasize)),
            ("filesize".into(), Amf0Value::Number(self.filesize)),
        ];

        if let Some(audiosize) = self.audiosize {
            pairs.push(("audiosize".into(), Amf0Value::Number(audiosize)));
        }
        if let Some(audiocodecid) = self.audiocodecid {
            pairs.push(("audiocodecid".into(), Amf0Value::Number(audiocodecid)));
        }
        if let Some(audiodatarate) = self.audiodatarate {
            pairs.push(("audiodatarate".into(), Amf0Value::Number(audiodatarate)));
        }
        if let Some(audiosamplerate) = self.audiosamplerate {
            pairs.push(("audiosamplerate".into(), Amf0Value::Number(audiosamplerate)));
        }
        if let Some(audiosamplesize) = self.audiosamplesize {
            pairs.push(("audiosamplesize".into(), Amf0Value::Number(audiosamplesize)));
        }
        if let Some(stereo) = self.stereo {
            pairs.push(("stereo".into(), Amf0Value::Boolean(stereo)));
        }

        pairs.extend([
            (
                "videosize".to_string(),
                Amf0Value::Number(self.videosize),
            ),
            ("framerate".to_string(), Amf0Value::Number(self.framerate)),
            (
                "videocodecid".to_string(),
                Amf0Value::Number(self.videocodecid),
            ),
            (
                "videodatarate".to_string(),
                Amf0Value::Number(self.videodatarate),
            ),
            ("width".to_string(), Amf0Value::Number(self.width)),
            ("height".to_string(), Amf0Value::Number(self.height)),
            (
                "lasttimestamp".to_string(),
                Amf0Value::Number(self.lasttimestamp),
            ),
            (
                "lastkeyframelocation".to_string(),
                Amf0Value::Number(self.lastkeyframelocation),
            ),
            (
                "lastkeyframetimestamp".to_string(),
                Amf0Value::Number(self.lastkeyframetimestamp),
            ),
            ("keyframes".to_string(), keyframes_to_amf(&self.keyframes)),
        ]);

        pairs
    }
}

pub fn keyframes_to_amf(keyframes: &KeyFrames) -> Amf0Value<'static> {
    Amf0Value::Object(
        vec![
            (
                "times".into(),
                Amf0Value::StrictArray(
                    keyframes.times.iter().map(|t| Amf0Value::Number(*t)).collect(),
                ),
            ),
            (
                "filepositions".into(),
                Amf0Value::StrictArray(
                    keyframes
                        .filepositions
                        .iter()
                        .map(|p| Amf0Value::Number(*p))
                        .collect(),
                ),
            ),
        ]
        .into(),
    )
}

pub fn keyframes_from_amf(value: &Amf0Value<'_>) -> Option<KeyFrames> {
    let times = value.get("times")?;
    let filepositions = value.get("filepositions")?;

    let to_numbers = |v: &Amf0Value<'_>| -> Option<Vec<f64>> {
        match v {
            Amf0Value::StrictArray(items) => {
                items.iter().map(|item| item.as_number()).collect()
            }
            _ => None,
        }
    };

    Some(KeyFrames {
        times: to_numbers(times)?,
        filepositions: to_numbers(filepositions)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframes_amf_round_trip() {
        let keyframes = KeyFrames {
            times: vec![0.0, 2.0, 4.0],
            filepositions: vec![13.0, 4096.0, 8192.0],
        };
        let amf = keyframes_to_amf(&keyframes);
        assert_eq!(keyframes_from_amf(&amf), Some(keyframes));
    }
}
