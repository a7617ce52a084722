//! Playback REST API clients.
//!
//! Two flavors exist: the unsigned web API and the app API whose requests
//! carry the legacy app signature. Both share one `reqwest::Client` per
//! room, so connection pools and cookies are reused by the API and the
//! stream downloader alike.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::errors::ApiError;
use crate::models::{DanmuInfo, QualityNumber};
use crate::sign;

const BASE_API_URL: &str = "https://api.bilibili.com";
const BASE_LIVE_API_URL: &str = "https://api.live.bilibili.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

const APP_USER_AGENT: &str = "Mozilla/5.0 BiliDroid/6.64.0 (bbcallen@gmail.com) \
     os/android model/Unknown mobi_app/android build/6640400 channel/bili \
     innerVer/6640400 osVer/6.0.1 network/2";

const APP_BUILD: &str = "6640400";

/// Extra headers applied to every request of one room.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiHeaders {
    pub user_agent: String,
    pub cookie: String,
    pub referer: String,
}

async fn get_json(
    client: &Client,
    url: &str,
    headers: &ApiHeaders,
) -> Result<Value, ApiError> {
    debug!(url, "api request");
    let mut request = client.get(url).timeout(REQUEST_TIMEOUT);
    if !headers.user_agent.is_empty() {
        request = request.header(reqwest::header::USER_AGENT, &headers.user_agent);
    }
    if !headers.cookie.is_empty() {
        request = request.header(reqwest::header::COOKIE, &headers.cookie);
    }
    if !headers.referer.is_empty() {
        request = request.header(reqwest::header::REFERER, &headers.referer);
    }

    let json: Value = request.send().await?.json().await?;

    let code = json.get("code").and_then(Value::as_i64).unwrap_or(-1);
    if code != 0 {
        let message = json
            .get("message")
            .or_else(|| json.get("msg"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(ApiError::Request { code, message });
    }

    json.get("data")
        .cloned()
        .ok_or_else(|| ApiError::Malformed("missing data field".to_string()))
}

/// The unsigned web API.
#[derive(Debug, Clone)]
pub struct WebApi {
    client: Client,
    headers: ApiHeaders,
}

impl WebApi {
    pub fn new(client: Client, headers: ApiHeaders) -> Self {
        Self { client, headers }
    }

    pub fn set_headers(&mut self, headers: ApiHeaders) {
        self.headers = headers;
    }

    /// Resolve a short room id: returns `data` with `room_id`/`short_id`.
    pub async fn room_init(&self, room_id: u64) -> Result<Value, ApiError> {
        let url = format!("{BASE_LIVE_API_URL}/room/v1/Room/room_init?id={room_id}");
        get_json(&self.client, &url, &self.headers).await
    }

    pub async fn get_info_by_room(&self, room_id: u64) -> Result<Value, ApiError> {
        let url =
            format!("{BASE_LIVE_API_URL}/xlive/web-room/v1/index/getInfoByRoom?room_id={room_id}");
        get_json(&self.client, &url, &self.headers).await
    }

    pub async fn get_info(&self, room_id: u64) -> Result<Value, ApiError> {
        let url = format!("{BASE_LIVE_API_URL}/room/v1/Room/get_info?room_id={room_id}");
        get_json(&self.client, &url, &self.headers).await
    }

    pub async fn get_room_play_info(
        &self,
        room_id: u64,
        qn: QualityNumber,
    ) -> Result<Value, ApiError> {
        let url = format!(
            "{BASE_LIVE_API_URL}/xlive/web-room/v2/index/getRoomPlayInfo\
             ?room_id={room_id}&protocol=0,1&format=0,1,2&codec=0,1&qn={qn}\
             &platform=web&ptype=8"
        );
        get_json(&self.client, &url, &self.headers).await
    }

    pub async fn get_user_info(&self, uid: u64) -> Result<Value, ApiError> {
        let url = format!("{BASE_API_URL}/x/space/acc/info?mid={uid}");
        get_json(&self.client, &url, &self.headers).await
    }

    pub async fn get_timestamp(&self) -> Result<i64, ApiError> {
        let url = format!("{BASE_LIVE_API_URL}/av/v1/Time/getTimestamp?platform=pc");
        let data = get_json(&self.client, &url, &self.headers).await?;
        data.get("timestamp")
            .and_then(Value::as_i64)
            .ok_or_else(|| ApiError::Malformed("missing timestamp".to_string()))
    }

    /// Fetch danmu connection info, WBI-signed.
    pub async fn get_danmu_info(&self, room_id: u64) -> Result<DanmuInfo, ApiError> {
        let (img_key, sub_key) = self.get_wbi_keys().await?;
        let mixin_key = sign::make_wbi_key(&img_key, &sub_key);

        let params = [
            ("id", room_id.to_string()),
            ("type", "0".to_string()),
            ("web_location", "444.8".to_string()),
        ];
        let query = sign::build_wbi_query(
            &mixin_key,
            chrono::Utc::now().timestamp(),
            &params.iter().map(|(k, v)| (*k, v.clone())).collect::<Vec<_>>(),
        );

        let url = format!("{BASE_LIVE_API_URL}/xlive/web-room/v1/index/getDanmuInfo?{query}");
        let data = get_json(&self.client, &url, &self.headers).await?;
        serde_json::from_value(data)
            .map_err(|e| ApiError::Malformed(format!("danmu info: {e}")))
    }

    /// WBI keys come from the nav endpoint's wbi_img URLs.
    async fn get_wbi_keys(&self) -> Result<(String, String), ApiError> {
        let url = format!("{BASE_API_URL}/x/web-interface/nav");
        let mut request = self.client.get(&url).timeout(REQUEST_TIMEOUT);
        if !self.headers.user_agent.is_empty() {
            request = request.header(reqwest::header::USER_AGENT, &self.headers.user_agent);
        }
        if !self.headers.cookie.is_empty() {
            request = request.header(reqwest::header::COOKIE, &self.headers.cookie);
        }

        // The nav endpoint answers code -101 for guests but still carries
        // the wbi_img data.
        let json: Value = request.send().await?.json().await?;
        let wbi_img = json
            .pointer("/data/wbi_img")
            .ok_or_else(|| ApiError::Malformed("missing wbi_img".to_string()))?;
        let img_url = wbi_img
            .get("img_url")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Malformed("missing img_url".to_string()))?;
        let sub_url = wbi_img
            .get("sub_url")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Malformed("missing sub_url".to_string()))?;

        Ok((
            sign::extract_wbi_key(img_url).to_string(),
            sign::extract_wbi_key(sub_url).to_string(),
        ))
    }

    /// Cheap reachability probe used while waiting out disconnections.
    pub async fn check_connectivity(&self) -> bool {
        let request = self
            .client
            .head("https://live.bilibili.com/")
            .timeout(Duration::from_secs(3))
            .header(reqwest::header::USER_AGENT, &self.headers.user_agent);
        match request.send().await {
            Ok(_) => true,
            Err(e) => {
                debug!("connectivity check failed: {e}");
                false
            }
        }
    }
}

/// The app API; every request carries the app signature and the Android
/// client's identity headers.
#[derive(Debug, Clone)]
pub struct AppApi {
    client: Client,
    headers: ApiHeaders,
}

impl AppApi {
    pub fn new(client: Client, headers: ApiHeaders) -> Self {
        let headers = ApiHeaders {
            user_agent: APP_USER_AGENT.to_string(),
            ..headers
        };
        Self { client, headers }
    }

    pub fn set_headers(&mut self, headers: ApiHeaders) {
        self.headers = ApiHeaders {
            user_agent: APP_USER_AGENT.to_string(),
            ..headers
        };
    }

    fn common_params(room_id: u64) -> Vec<(&'static str, String)> {
        vec![
            ("actionKey", "appkey".to_string()),
            ("build", APP_BUILD.to_string()),
            ("channel", "bili".to_string()),
            ("device", "android".to_string()),
            ("mobi_app", "android".to_string()),
            ("platform", "android".to_string()),
            ("room_id", room_id.to_string()),
            ("ts", chrono::Utc::now().timestamp().to_string()),
        ]
    }

    pub async fn get_room_play_info(
        &self,
        room_id: u64,
        qn: QualityNumber,
    ) -> Result<Value, ApiError> {
        let mut params = Self::common_params(room_id);
        params.extend([
            ("codec", "0,1".to_string()),
            ("device_name", "Unknown".to_string()),
            ("disable_rcmd", "0".to_string()),
            ("dolby", "1".to_string()),
            ("format", "0,1,2".to_string()),
            ("free_type", "0".to_string()),
            ("http", "1".to_string()),
            ("mask", "0".to_string()),
            ("need_hdr", "0".to_string()),
            ("no_playurl", "0".to_string()),
            ("only_audio", "0".to_string()),
            ("only_video", "0".to_string()),
            ("play_type", "0".to_string()),
            ("protocol", "0,1".to_string()),
            ("qn", qn.to_string()),
        ]);
        let query = sign::app_signed_query(&params);
        let url =
            format!("{BASE_LIVE_API_URL}/xlive/app-room/v2/index/getRoomPlayInfo?{query}");
        get_json(&self.client, &url, &self.headers).await
    }

    pub async fn get_info_by_room(&self, room_id: u64) -> Result<Value, ApiError> {
        let query = sign::app_signed_query(&Self::common_params(room_id));
        let url = format!("{BASE_LIVE_API_URL}/xlive/app-room/v1/index/getInfoByRoom?{query}");
        get_json(&self.client, &url, &self.headers).await
    }

    pub async fn get_danmu_info(&self, room_id: u64) -> Result<DanmuInfo, ApiError> {
        let query = sign::app_signed_query(&Self::common_params(room_id));
        let url = format!("{BASE_LIVE_API_URL}/xlive/app-room/v1/index/getDanmuInfo?{query}");
        let data = get_json(&self.client, &url, &self.headers).await?;
        serde_json::from_value(data)
            .map_err(|e| ApiError::Malformed(format!("danmu info: {e}")))
    }
}

/// Build the shared per-room HTTP client.
pub fn build_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .expect("http client construction")
}

/// Extract a cookie value by name from a raw Cookie header.
pub fn extract_cookie_value<'a>(cookie: &'a str, name: &str) -> Option<&'a str> {
    cookie.split(';').find_map(|part| {
        let (k, v) = part.trim().split_once('=')?;
        (k.trim() == name).then_some(v.trim())
    })
}

/// The uid (`DedeUserID`) carried in the user's cookie, if any.
pub fn extract_uid_from_cookie(cookie: &str) -> Option<u64> {
    extract_cookie_value(cookie, "DedeUserID")?.parse().ok()
}

/// The `buvid3` device id carried in the user's cookie, if any.
pub fn extract_buvid_from_cookie(cookie: &str) -> Option<&str> {
    extract_cookie_value(cookie, "buvid3")
}

/// Generate a fake buvid3 for cookie-less sessions.
pub fn generate_fake_buvid() -> String {
    use rand::RngExt;
    let mut rng = rand::rng();
    let hex_chars: String = (0..35)
        .map(|_| {
            let n: u8 = rng.random_range(0..16);
            char::from_digit(n as u32, 16).unwrap().to_ascii_uppercase()
        })
        .collect();
    format!("{}infoc", hex_chars)
}

/// A map view of query parameters, handy in tests.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_extraction() {
        let cookie = "buvid3=ABC123infoc; DedeUserID=42; SESSDATA=xyz";
        assert_eq!(extract_uid_from_cookie(cookie), Some(42));
        assert_eq!(extract_buvid_from_cookie(cookie), Some("ABC123infoc"));
        assert_eq!(extract_cookie_value(cookie, "SESSDATA"), Some("xyz"));
        assert_eq!(extract_cookie_value(cookie, "missing"), None);
    }

    #[test]
    fn test_fake_buvid_shape() {
        let buvid = generate_fake_buvid();
        assert_eq!(buvid.len(), 40);
        assert!(buvid.ends_with("infoc"));
    }

    #[test]
    fn test_app_play_info_query_is_signed() {
        let params = AppApi::common_params(23058);
        let query = sign::app_signed_query(&params);
        let parsed = parse_query(&query);
        assert_eq!(parsed.get("room_id").map(String::as_str), Some("23058"));
        assert_eq!(parsed.get("appkey").map(String::as_str), Some(sign::APP_KEY));
        assert_eq!(parsed.get("sign").map(|s| s.len()), Some(32));
    }
}
