//! Per-room live state and stream URL extraction.
//!
//! A [`Live`] owns the room's shared HTTP client and both API flavors,
//! caches the current room/user info, and knows how to pick a stream URL
//! out of a play-info response: filter by format and codec, validate the
//! requested quality, then order candidate hosts by the CDN preference
//! table.

use std::sync::Arc;
use std::sync::LazyLock;

use parking_lot::RwLock;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::{ApiHeaders, AppApi, DEFAULT_USER_AGENT, WebApi, build_client};
use crate::errors::{ApiError, StreamError};
use crate::models::{
    ApiPlatform, LiveStatus, QualityNumber, RoomInfo, StreamCodec, StreamFormat, UserInfo,
};

/// The default CDN host ordering. Entries are regex fragments matched
/// against the host name; earlier entries win. Hosts matching nothing sort
/// after every entry, `mcdn` and overseas relay hosts after those.
pub const DEFAULT_STREAM_HOST_PREFS: &[&str] =
    &["gotcha04", "gotcha09", "gotcha08", "gotcha05", "gotcha07"];

pub struct Live {
    room_id: u64,
    client: Client,
    webapi: RwLock<WebApi>,
    appapi: RwLock<AppApi>,
    headers: RwLock<ApiHeaders>,
    room_info: RwLock<Option<RoomInfo>>,
    user_info: RwLock<Option<UserInfo>>,
    host_prefs: RwLock<Vec<String>>,
}

impl Live {
    pub fn new(room_id: u64, user_agent: &str, cookie: &str) -> Arc<Self> {
        let client = build_client();
        let headers = ApiHeaders {
            user_agent: if user_agent.is_empty() {
                DEFAULT_USER_AGENT.to_string()
            } else {
                user_agent.to_string()
            },
            cookie: cookie.to_string(),
            referer: format!("https://live.bilibili.com/{room_id}"),
        };

        Arc::new(Self {
            room_id,
            client: client.clone(),
            webapi: RwLock::new(WebApi::new(client.clone(), headers.clone())),
            appapi: RwLock::new(AppApi::new(client, headers.clone())),
            headers: RwLock::new(headers),
            room_info: RwLock::new(None),
            user_info: RwLock::new(None),
            host_prefs: RwLock::new(
                DEFAULT_STREAM_HOST_PREFS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
        })
    }

    pub fn room_id(&self) -> u64 {
        self.room_id
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn headers(&self) -> ApiHeaders {
        self.headers.read().clone()
    }

    pub fn user_agent(&self) -> String {
        self.headers.read().user_agent.clone()
    }

    pub fn webapi(&self) -> WebApi {
        self.webapi.read().clone()
    }

    pub fn appapi(&self) -> AppApi {
        self.appapi.read().clone()
    }

    /// Replace UA/cookie on all API surfaces.
    pub fn set_headers(&self, user_agent: &str, cookie: &str) {
        let headers = ApiHeaders {
            user_agent: if user_agent.is_empty() {
                DEFAULT_USER_AGENT.to_string()
            } else {
                user_agent.to_string()
            },
            cookie: cookie.to_string(),
            referer: format!("https://live.bilibili.com/{}", self.room_id),
        };
        self.webapi.write().set_headers(headers.clone());
        self.appapi.write().set_headers(headers.clone());
        *self.headers.write() = headers;
    }

    pub fn set_host_prefs(&self, prefs: Vec<String>) {
        *self.host_prefs.write() = prefs;
    }

    /// The last fetched room info; call `update_room_info` first.
    pub fn room_info(&self) -> Option<RoomInfo> {
        self.room_info.read().clone()
    }

    pub fn user_info(&self) -> Option<UserInfo> {
        self.user_info.read().clone()
    }

    pub fn is_living(&self) -> bool {
        self.room_info
            .read()
            .as_ref()
            .map(RoomInfo::is_living)
            .unwrap_or(false)
    }

    pub async fn init(&self) -> Result<(), ApiError> {
        self.update_info().await
    }

    pub async fn update_info(&self) -> Result<(), ApiError> {
        self.update_room_info().await?;
        self.update_user_info().await?;
        Ok(())
    }

    pub async fn update_room_info(&self) -> Result<(), ApiError> {
        let info = self.fetch_room_info().await?;
        *self.room_info.write() = Some(info);
        Ok(())
    }

    pub async fn update_user_info(&self) -> Result<(), ApiError> {
        match self.fetch_user_info().await {
            Ok(info) => {
                *self.user_info.write() = Some(info);
                Ok(())
            }
            Err(e) => {
                warn!(room_id = self.room_id, "failed to update user info: {e}");
                Err(e)
            }
        }
    }

    pub async fn get_live_status(&self) -> Result<LiveStatus, ApiError> {
        Ok(self.fetch_room_info().await?.live_status)
    }

    async fn fetch_room_info(&self) -> Result<RoomInfo, ApiError> {
        // Prefer the web endpoint; the app endpoint answers the same shape.
        let webapi = self.webapi();
        match webapi.get_info_by_room(self.room_id).await {
            Ok(data) => {
                let room_info = data.get("room_info").cloned().ok_or_else(|| {
                    ApiError::Malformed("missing room_info".to_string())
                })?;
                RoomInfo::from_data(&room_info)
            }
            Err(e) => {
                debug!(room_id = self.room_id, "getInfoByRoom failed: {e}");
                let data = webapi.get_info(self.room_id).await?;
                RoomInfo::from_data(&data)
            }
        }
    }

    async fn fetch_user_info(&self) -> Result<UserInfo, ApiError> {
        let data = self.webapi().get_info_by_room(self.room_id).await?;
        UserInfo::from_info_by_room(&data)
    }

    pub async fn check_connectivity(&self) -> bool {
        self.webapi().check_connectivity().await
    }

    /// Fetch play info and extract all candidate streams, checking the room
    /// state flags on the way.
    pub async fn get_live_streams(
        &self,
        qn: QualityNumber,
        api_platform: ApiPlatform,
    ) -> Result<Vec<Value>, StreamError> {
        let play_info = match api_platform {
            ApiPlatform::Web => self.webapi().get_room_play_info(self.room_id, qn).await?,
            ApiPlatform::Android => self.appapi().get_room_play_info(self.room_id, qn).await?,
        };

        check_room_play_info(&play_info)?;

        let streams = play_info
            .pointer("/playurl_info/playurl/stream")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(streams)
    }

    /// Resolve one stream URL per the quality/format/codec request.
    pub async fn get_live_stream_url(
        &self,
        qn: QualityNumber,
        api_platform: ApiPlatform,
        stream_format: StreamFormat,
        stream_codec: StreamCodec,
        select_alternative: bool,
    ) -> Result<String, StreamError> {
        let not_available = |kind: fn(StreamFormat, StreamCodec, QualityNumber) -> StreamError| {
            kind(stream_format, stream_codec, qn)
        };

        let streams = self.get_live_streams(qn, api_platform).await?;
        if streams.is_empty() {
            return Err(not_available(|format, codec, quality| {
                StreamError::NoStreamAvailable {
                    format,
                    codec,
                    quality,
                }
            }));
        }

        let formats = extract_formats(&streams, stream_format);
        if formats.is_empty() {
            return Err(not_available(|format, codec, quality| {
                StreamError::NoStreamFormatAvailable {
                    format,
                    codec,
                    quality,
                }
            }));
        }

        let codecs = extract_codecs(&formats, stream_codec);
        if codecs.is_empty() {
            return Err(not_available(|format, codec, quality| {
                StreamError::NoStreamCodecAvailable {
                    format,
                    codec,
                    quality,
                }
            }));
        }

        // The requested quality must be accepted by some codec and already
        // selected by every codec, otherwise the server substituted another
        // quality.
        let accept_qns: Vec<u64> = codecs
            .iter()
            .filter_map(|c| c.get("accept_qn").and_then(Value::as_array))
            .flatten()
            .filter_map(Value::as_u64)
            .collect();
        let current_qns: Vec<u64> = codecs
            .iter()
            .filter_map(|c| c.get("current_qn").and_then(Value::as_u64))
            .collect();
        if !accept_qns.contains(&(qn as u64)) || current_qns.iter().any(|q| *q != qn as u64) {
            return Err(not_available(|format, codec, quality| {
                StreamError::NoStreamQualityAvailable {
                    format,
                    codec,
                    quality,
                }
            }));
        }

        let urls = sort_urls_by_host(&codecs, &self.host_prefs.read());
        if select_alternative {
            urls.get(1).cloned().ok_or(not_available(
                |format, codec, quality| StreamError::NoAlternativeStreamAvailable {
                    format,
                    codec,
                    quality,
                },
            ))
        } else {
            urls.first().cloned().ok_or(not_available(|format, codec, quality| {
                StreamError::NoStreamAvailable {
                    format,
                    codec,
                    quality,
                }
            }))
        }
    }
}

fn check_room_play_info(data: &Value) -> Result<(), StreamError> {
    if data.get("is_hidden").and_then(Value::as_bool).unwrap_or(false) {
        return Err(StreamError::RoomHidden);
    }
    if data.get("is_locked").and_then(Value::as_bool).unwrap_or(false) {
        return Err(StreamError::RoomLocked);
    }
    let encrypted = data.get("encrypted").and_then(Value::as_bool).unwrap_or(false);
    let pwd_verified = data
        .get("pwd_verified")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if encrypted && !pwd_verified {
        return Err(StreamError::RoomEncrypted);
    }
    Ok(())
}

fn extract_formats(streams: &[Value], stream_format: StreamFormat) -> Vec<Value> {
    streams
        .iter()
        .filter_map(|s| s.get("format").and_then(Value::as_array))
        .flatten()
        .filter(|f| {
            f.get("format_name").and_then(Value::as_str) == Some(stream_format.as_str())
        })
        .cloned()
        .collect()
}

fn extract_codecs(formats: &[Value], stream_codec: StreamCodec) -> Vec<Value> {
    formats
        .iter()
        .filter_map(|f| f.get("codec").and_then(Value::as_array))
        .flatten()
        .filter(|c| c.get("codec_name").and_then(Value::as_str) == Some(stream_codec.as_str()))
        .cloned()
        .collect()
}

static GOTCHA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"gotcha(\d+)").expect("gotcha pattern"));
static OVERSEAS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"cn-[a-z]+-[a-z]+").expect("overseas pattern"));

/// Rank a host: configured preferences first, other `gotcha` relays next,
/// plain CDN hosts after, `mcdn` and overseas relays last.
fn host_rank(host: &str, prefs: &[String]) -> i64 {
    if let Some(rank) = prefs.iter().position(|p| host.contains(p.as_str())) {
        return rank as i64;
    }

    if let Some(caps) = GOTCHA_RE.captures(host) {
        let num: i64 = caps[1].parse().unwrap_or(0);
        return 1000 + num;
    }
    if host.contains("mcdn") {
        return 2000;
    }
    if OVERSEAS_RE.is_match(host) {
        return 5000;
    }
    10000
}

fn sort_urls_by_host(codecs: &[Value], prefs: &[String]) -> Vec<String> {
    let mut url_infos: Vec<(i64, String)> = Vec::new();
    for codec in codecs {
        let Some(base_url) = codec.get("base_url").and_then(Value::as_str) else {
            continue;
        };
        let Some(infos) = codec.get("url_info").and_then(Value::as_array) else {
            continue;
        };
        for info in infos {
            let Some(host) = info.get("host").and_then(Value::as_str) else {
                continue;
            };
            let extra = info.get("extra").and_then(Value::as_str).unwrap_or("");
            url_infos.push((host_rank(host, prefs), format!("{host}{base_url}{extra}")));
        }
    }
    url_infos.sort_by_key(|(rank, _)| *rank);
    url_infos.into_iter().map(|(_, url)| url).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prefs() -> Vec<String> {
        DEFAULT_STREAM_HOST_PREFS
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_host_ranking_prefers_gotcha04() {
        let prefs = prefs();
        let r04 = host_rank("cn-gotcha04.bilivideo.com", &prefs);
        let r09 = host_rank("cn-gotcha09.bilivideo.com", &prefs);
        let r01 = host_rank("cn-gotcha01.bilivideo.com", &prefs);
        let mcdn = host_rank("xy123mcdn.bilivideo.com", &prefs);
        let plain = host_rank("d1--cn-live.bilivideo.com", &prefs);

        assert!(r04 < r09);
        assert!(r09 < r01);
        assert!(r01 < mcdn);
        assert!(mcdn < plain);
    }

    #[test]
    fn test_overseas_demoted_below_mcdn_but_above_unknown() {
        let prefs = prefs();
        let overseas = host_rank("cn-hk-eq.bilivideo.com", &prefs);
        let mcdn = host_rank("xy0mcdn.bilivideo.com", &prefs);
        assert!(mcdn < overseas);
    }

    #[test]
    fn test_url_assembly_and_ordering() {
        let codecs = vec![json!({
            "codec_name": "avc",
            "base_url": "/live/stream.flv?",
            "current_qn": 10000,
            "accept_qn": [10000],
            "url_info": [
                {"host": "https://xy0mcdn.bilivideo.com", "extra": "a=1"},
                {"host": "https://cn-gotcha04.bilivideo.com", "extra": "b=2"},
            ]
        })];

        let urls = sort_urls_by_host(&codecs, &prefs());
        assert_eq!(
            urls,
            vec![
                "https://cn-gotcha04.bilivideo.com/live/stream.flv?b=2",
                "https://xy0mcdn.bilivideo.com/live/stream.flv?a=1",
            ]
        );
    }

    #[test]
    fn test_room_state_checks() {
        assert!(matches!(
            check_room_play_info(&json!({"is_hidden": true})),
            Err(StreamError::RoomHidden)
        ));
        assert!(matches!(
            check_room_play_info(&json!({"is_locked": true})),
            Err(StreamError::RoomLocked)
        ));
        assert!(matches!(
            check_room_play_info(&json!({"encrypted": true, "pwd_verified": false})),
            Err(StreamError::RoomEncrypted)
        ));
        assert!(check_room_play_info(&json!({"encrypted": true, "pwd_verified": true})).is_ok());
        assert!(check_room_play_info(&json!({})).is_ok());
    }

    #[test]
    fn test_format_and_codec_extraction() {
        let streams = vec![json!({
            "format": [
                {"format_name": "flv", "codec": [
                    {"codec_name": "avc", "current_qn": 10000, "accept_qn": [10000, 400]},
                ]},
                {"format_name": "fmp4", "codec": [
                    {"codec_name": "hevc", "current_qn": 10000, "accept_qn": [10000]},
                ]},
            ]
        })];

        let flv = extract_formats(&streams, StreamFormat::Flv);
        assert_eq!(flv.len(), 1);
        assert_eq!(extract_codecs(&flv, StreamCodec::Avc).len(), 1);
        assert!(extract_codecs(&flv, StreamCodec::Hevc).is_empty());
        assert!(extract_formats(&streams, StreamFormat::Ts).is_empty());
    }
}
