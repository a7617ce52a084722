//! Request signing for the playback API.
//!
//! Two schemes are in play: the legacy app signature (md5 over the sorted
//! query plus the app secret) and the WBI signature used by newer web
//! endpoints (md5 over a canonicalised query plus a mixin key derived from
//! two rotating keys).

use md5::{Digest, Md5};

/// Public app credentials of the Android client.
pub const APP_KEY: &str = "1d8b6e7d45233436";
pub const APP_SEC: &str = "560c52ccd288fed045859ed18bffd973";

fn md5_hex(input: &[u8]) -> String {
    hex::encode(Md5::digest(input))
}

/// Sign app-API parameters: sort `{params ∪ {appkey}}`, URL-encode,
/// `sign = md5(query + appsec)`. Returns the full signed query string.
pub fn app_signed_query(params: &[(&str, String)]) -> String {
    let mut params: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    params.push(("appkey".to_string(), APP_KEY.to_string()));
    params.sort_by(|a, b| a.0.cmp(&b.0));

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let sign = md5_hex(format!("{query}{APP_SEC}").as_bytes());
    format!("{query}&sign={sign}")
}

/// Pull the key out of a WBI image URL:
/// `https://…/wbi/<key>.png` -> `<key>`.
pub fn extract_wbi_key(url: &str) -> &str {
    let name = url.rsplit('/').next().unwrap_or(url);
    name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

/// Derive the 32-character mixin key from `img_key || sub_key` via the
/// fixed index permutation.
pub fn make_wbi_key(img_key: &str, sub_key: &str) -> String {
    const MAPPING: [usize; 32] = [
        46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42,
        19, 29, 28, 14, 39, 12, 38, 41, 13,
    ];
    let key = format!("{img_key}{sub_key}");
    let bytes = key.as_bytes();
    MAPPING.iter().map(|&n| bytes[n] as char).collect()
}

/// WBI value encoding: the characters `!'()*` are dropped entirely,
/// unreserved characters pass through, everything else is percent-encoded
/// byte-wise in uppercase hex.
pub fn encode_wbi_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '!' | '\'' | '(' | ')' | '*') {
            continue;
        }
        if (c.is_ascii_alphanumeric()) || matches!(c, '-' | '_' | '.' | '~') {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).as_bytes() {
                out.push_str(&format!("%{b:02X}"));
            }
        }
    }
    out
}

/// Build the signed WBI query: append `wts`, sort by name, encode values,
/// append `w_rid = md5(query + key)`.
pub fn build_wbi_query(key: &str, ts: i64, params: &[(&str, String)]) -> String {
    let mut params: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    params.push(("wts".to_string(), ts.to_string()));
    params.sort_by(|a, b| a.0.cmp(&b.0));

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, encode_wbi_value(v)))
        .collect::<Vec<_>>()
        .join("&");

    let sign = md5_hex(format!("{query}{key}").as_bytes());
    format!("{query}&w_rid={sign}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_sign_known_answer() {
        let params = [
            ("a", "1".to_string()),
            ("b", "2".to_string()),
            ("ts", "0".to_string()),
        ];
        let query = app_signed_query(&params);
        let expected_sign = md5_hex(
            format!("a=1&appkey={APP_KEY}&b=2&ts=0{APP_SEC}").as_bytes(),
        );
        assert_eq!(query, format!("a=1&appkey={APP_KEY}&b=2&ts=0&sign={expected_sign}"));
    }

    #[test]
    fn test_extract_wbi_key() {
        assert_eq!(
            extract_wbi_key("https://i0.hdslb.com/bfs/wbi/7cd084941338484aae1ad9425b84077c.png"),
            "7cd084941338484aae1ad9425b84077c"
        );
    }

    #[test]
    fn test_make_wbi_key_known_answer() {
        let key = make_wbi_key(
            "7cd084941338484aae1ad9425b84077c",
            "4932caff0ff746eab6f01bf08b70ac45",
        );
        assert_eq!(key, "ea1db124af3c7062474693fa704f4ff8");
    }

    #[test]
    fn test_encode_wbi_value_known_answer() {
        assert_eq!(encode_wbi_value(")-_-( F**' 哔~!"), "-_-%20F%20%E5%93%94~");
    }

    #[test]
    fn test_build_wbi_query_known_answer() {
        let key = make_wbi_key(
            "7cd084941338484aae1ad9425b84077c",
            "4932caff0ff746eab6f01bf08b70ac45",
        );
        let params = [
            ("foo", ")-_-( F**' 哔~!".to_string()),
            ("bar", "2333".to_string()),
        ];
        let query = build_wbi_query(&key, 1748867128, &params);
        assert_eq!(
            query,
            "bar=2333&foo=-_-%20F%20%E5%93%94~&wts=1748867128\
             &w_rid=6ba96e28a3f09b40e704f1e4b4f8e3e3"
        );
    }
}
