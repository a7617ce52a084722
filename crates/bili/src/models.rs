use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ApiError;

/// Live state of a room as reported by the API and the chat channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStatus {
    Preparing,
    Live,
    /// The room is replaying recorded content between live sessions.
    Round,
}

impl TryFrom<i64> for LiveStatus {
    type Error = ApiError;

    fn try_from(value: i64) -> Result<Self, ApiError> {
        match value {
            0 => Ok(Self::Preparing),
            1 => Ok(Self::Live),
            2 => Ok(Self::Round),
            other => Err(ApiError::Malformed(format!("unknown live status: {other}"))),
        }
    }
}

impl fmt::Display for LiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preparing => f.write_str("preparing"),
            Self::Live => f.write_str("live"),
            Self::Round => f.write_str("round"),
        }
    }
}

/// Numeric quality level: 80 smoothest .. 20000 4K.
pub type QualityNumber = u32;

pub const QUALITY_NUMBERS: &[QualityNumber] = &[20000, 10000, 401, 400, 250, 150, 80];

/// Container format of a live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    Flv,
    Ts,
    Fmp4,
}

impl StreamFormat {
    /// Name used by the playback API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flv => "flv",
            Self::Ts => "ts",
            Self::Fmp4 => "fmp4",
        }
    }

    /// The format ladder used when the requested format is unavailable.
    pub fn fallback(&self) -> Option<StreamFormat> {
        match self {
            Self::Fmp4 => Some(Self::Ts),
            Self::Ts => Some(Self::Flv),
            Self::Flv => None,
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Video codec of a live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamCodec {
    Avc,
    Hevc,
}

impl StreamCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Avc => "avc",
            Self::Hevc => "hevc",
        }
    }
}

impl fmt::Display for StreamCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which flavor of the playback API to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiPlatform {
    Web,
    Android,
}

impl ApiPlatform {
    pub fn rotate(&self) -> ApiPlatform {
        match self {
            Self::Web => Self::Android,
            Self::Android => Self::Web,
        }
    }
}

/// Everything that identifies one resolved stream. Equal parameters may
/// reuse a previously resolved URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    pub format: StreamFormat,
    pub quality: QualityNumber,
    pub platform: ApiPlatform,
    pub use_alternative: bool,
}

impl StreamParams {
    pub fn new(format: StreamFormat, quality: QualityNumber) -> Self {
        Self {
            format,
            quality,
            platform: ApiPlatform::Web,
            use_alternative: false,
        }
    }
}

/// Room information from `getInfoByRoom` / `get_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub uid: u64,
    pub room_id: u64,
    pub short_room_id: u64,
    pub area_id: u64,
    pub area_name: String,
    pub parent_area_id: u64,
    pub parent_area_name: String,
    pub live_status: LiveStatus,
    /// Unix seconds; 0 when not live.
    pub live_start_time: i64,
    pub online: u64,
    pub title: String,
    pub cover: String,
    pub tags: String,
    pub description: String,
}

fn ensure_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        url.to_string()
    }
}

impl RoomInfo {
    pub fn from_data(data: &Value) -> Result<Self, ApiError> {
        let get_u64 = |key: &str| -> Result<u64, ApiError> {
            data.get(key)
                .and_then(|v| v.as_u64().or_else(|| v.as_str()?.parse().ok()))
                .ok_or_else(|| ApiError::Malformed(format!("missing field: {key}")))
        };
        let get_str = |key: &str| -> String {
            data.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        // Either a unix timestamp or a formatted local time string.
        let live_start_time = if let Some(ts) = data.get("live_start_time").and_then(Value::as_i64)
        {
            ts
        } else if let Some(time_string) = data.get("live_time").and_then(Value::as_str) {
            if time_string == "0000-00-00 00:00:00" {
                0
            } else {
                chrono::NaiveDateTime::parse_from_str(time_string, "%Y-%m-%d %H:%M:%S")
                    .map(|dt| dt.and_utc().timestamp())
                    .unwrap_or(0)
            }
        } else {
            return Err(ApiError::Malformed("missing live_start_time".to_string()));
        };

        let cover = data
            .get("cover")
            .or_else(|| data.get("user_cover"))
            .and_then(Value::as_str)
            .map(ensure_scheme)
            .unwrap_or_default();

        Ok(RoomInfo {
            uid: get_u64("uid")?,
            room_id: get_u64("room_id")?,
            short_room_id: get_u64("short_id").unwrap_or(0),
            area_id: get_u64("area_id").unwrap_or(0),
            area_name: get_str("area_name"),
            parent_area_id: get_u64("parent_area_id").unwrap_or(0),
            parent_area_name: get_str("parent_area_name"),
            live_status: LiveStatus::try_from(
                data.get("live_status").and_then(Value::as_i64).unwrap_or(0),
            )?,
            live_start_time,
            online: get_u64("online").unwrap_or(0),
            title: get_str("title"),
            cover,
            tags: get_str("tags"),
            description: get_str("description"),
        })
    }

    pub fn is_living(&self) -> bool {
        self.live_status == LiveStatus::Live
    }
}

/// Streamer information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub gender: String,
    pub face: String,
    pub uid: u64,
}

impl UserInfo {
    /// From `getInfoByRoom`, which nests the streamer under `anchor_info`.
    pub fn from_info_by_room(data: &Value) -> Result<Self, ApiError> {
        let room_info = data
            .get("room_info")
            .ok_or_else(|| ApiError::Malformed("missing room_info".to_string()))?;
        let base_info = data
            .pointer("/anchor_info/base_info")
            .ok_or_else(|| ApiError::Malformed("missing anchor_info".to_string()))?;

        Ok(UserInfo {
            name: base_info
                .get("uname")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            gender: base_info
                .get("gender")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            face: base_info
                .get("face")
                .and_then(Value::as_str)
                .map(ensure_scheme)
                .unwrap_or_default(),
            uid: room_info.get("uid").and_then(Value::as_u64).unwrap_or(0),
        })
    }
}

/// Chat server endpoints and the auth token, from `getDanmuInfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DanmuInfo {
    pub token: String,
    pub host_list: Vec<DanmuHost>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DanmuHost {
    pub host: String,
    pub port: u16,
    pub wss_port: u16,
    pub ws_port: u16,
}

impl DanmuHost {
    pub fn wss_url(&self) -> String {
        format!("wss://{}:{}/sub", self.host, self.wss_port)
    }
}

impl Default for DanmuInfo {
    /// The well-known fallback endpoint, used when `getDanmuInfo` fails.
    fn default() -> Self {
        Self {
            token: String::new(),
            host_list: vec![DanmuHost {
                host: "broadcastlv.chat.bilibili.com".to_string(),
                port: 2243,
                wss_port: 443,
                ws_port: 2244,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_room_info_from_api_data() {
        let data = json!({
            "uid": 322892,
            "room_id": 23058,
            "short_id": 3,
            "area_id": 33,
            "area_name": "影音馆",
            "parent_area_id": 1,
            "parent_area_name": "娱乐",
            "live_status": 1,
            "live_start_time": 1640000000,
            "online": 12345,
            "title": "某直播间",
            "cover": "//i0.hdslb.com/bfs/live/cover.jpg",
            "tags": "",
            "description": ""
        });

        let info = RoomInfo::from_data(&data).unwrap();
        assert_eq!(info.room_id, 23058);
        assert_eq!(info.short_room_id, 3);
        assert_eq!(info.live_status, LiveStatus::Live);
        assert!(info.is_living());
        assert!(info.cover.starts_with("https://"));
    }

    #[test]
    fn test_room_info_live_time_string() {
        let data = json!({
            "uid": 1,
            "room_id": 2,
            "short_id": 0,
            "live_status": 0,
            "live_time": "0000-00-00 00:00:00",
            "title": "",
            "description": ""
        });
        let info = RoomInfo::from_data(&data).unwrap();
        assert_eq!(info.live_start_time, 0);
        assert_eq!(info.live_status, LiveStatus::Preparing);
    }

    #[test]
    fn test_format_fallback_ladder() {
        assert_eq!(StreamFormat::Fmp4.fallback(), Some(StreamFormat::Ts));
        assert_eq!(StreamFormat::Ts.fallback(), Some(StreamFormat::Flv));
        assert_eq!(StreamFormat::Flv.fallback(), None);
    }

    #[test]
    fn test_stream_params_equality_for_url_reuse() {
        let a = StreamParams::new(StreamFormat::Flv, 10000);
        let b = StreamParams::new(StreamFormat::Flv, 10000);
        let c = StreamParams {
            use_alternative: true,
            ..a
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
