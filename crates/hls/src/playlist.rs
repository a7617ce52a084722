//! Playlist polling and resolution.
//!
//! The fetcher polls the media playlist once per second (resolving a master
//! playlist to its highest-bandwidth variant first); the resolver
//! deduplicates segments across polls by sequence number and marks a
//! discontinuity whenever the sequence jumps by two or more.

use std::time::Duration;

use m3u8_rs::{MediaPlaylist, Playlist};
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::HlsError;
use crate::segment::Segment;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Strip the path and query down to the file name.
fn uri_file_name(uri: &str) -> String {
    let path = uri.split('?').next().unwrap_or(uri);
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// The sequence number encoded in the segment file name (`12345.m4s`).
fn sequence_from_uri(uri: &str) -> Option<u64> {
    let name = uri_file_name(uri);
    name.split('.').next()?.parse().ok()
}

/// Fetch the playlist at `url`, following a master playlist to its
/// highest-bandwidth variant. Returns the media playlist and its final URL
/// (segment URIs are relative to it).
pub async fn fetch_media_playlist(
    client: &Client,
    url: &Url,
    user_agent: &str,
) -> Result<(MediaPlaylist, Url), HlsError> {
    let body = client
        .get(url.clone())
        .timeout(FETCH_TIMEOUT)
        .header(reqwest::header::USER_AGENT, user_agent)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    match m3u8_rs::parse_playlist_res(&body)
        .map_err(|e| HlsError::Playlist(format!("parse failed: {e:?}")))?
    {
        Playlist::MediaPlaylist(playlist) => Ok((playlist, url.clone())),
        Playlist::MasterPlaylist(master) => {
            let variant = master
                .variants
                .iter()
                .max_by_key(|v| v.bandwidth)
                .ok_or_else(|| HlsError::Playlist("master playlist without variants".into()))?;
            let variant_url = url
                .join(&variant.uri)
                .map_err(|e| HlsError::Playlist(format!("bad variant uri: {e}")))?;
            debug!(bandwidth = variant.bandwidth, url = %variant_url, "resolved variant");

            let body = client
                .get(variant_url.clone())
                .timeout(FETCH_TIMEOUT)
                .header(reqwest::header::USER_AGENT, user_agent)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            match m3u8_rs::parse_media_playlist_res(&body) {
                Ok(playlist) => Ok((playlist, variant_url)),
                Err(e) => Err(HlsError::Playlist(format!("variant parse failed: {e:?}"))),
            }
        }
    }
}

/// Deduplicates segments across playlist polls.
#[derive(Debug, Default)]
pub struct PlaylistResolver {
    last_sequence: Option<u64>,
}

impl PlaylistResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract the segments of this poll that have not been seen yet.
    pub fn resolve(&mut self, playlist: &MediaPlaylist, base_url: &Url) -> Vec<Segment> {
        let mut fresh = Vec::new();

        for media_segment in &playlist.segments {
            let Some(sequence) = sequence_from_uri(&media_segment.uri) else {
                warn!(uri = %media_segment.uri, "segment uri without sequence number");
                continue;
            };

            let discontinuous = match self.last_sequence {
                Some(last) => {
                    if sequence <= last {
                        continue; // already emitted
                    }
                    sequence - last >= 2
                }
                None => false,
            };
            if discontinuous {
                debug!(
                    last = ?self.last_sequence,
                    sequence, "discontinuity detected in playlist"
                );
            }

            let Ok(url) = base_url.join(&media_segment.uri) else {
                warn!(uri = %media_segment.uri, "unresolvable segment uri");
                continue;
            };

            let (init_url, init_name) = match media_segment
                .map
                .as_ref()
                .map(|map| base_url.join(&map.uri))
            {
                Some(Ok(init_url)) => {
                    let name = uri_file_name(init_url.path());
                    (Some(init_url), Some(name))
                }
                Some(Err(e)) => {
                    warn!("unresolvable init section uri: {e}");
                    (None, None)
                }
                None => (None, None),
            };

            fresh.push(Segment {
                sequence,
                name: uri_file_name(&media_segment.uri),
                url,
                duration: media_segment.duration,
                init_url,
                init_name,
                title: media_segment.title.clone().unwrap_or_default(),
                discontinuous,
            });
            self.last_sequence = Some(sequence);
        }

        fresh
    }
}

/// Poll the playlist once per second and push fresh segments into the
/// bounded queue until cancelled or the stream ends.
pub async fn run_playlist_fetcher(
    client: Client,
    url: Url,
    user_agent: String,
    segments_tx: mpsc::Sender<Segment>,
    cancel: CancellationToken,
) -> Result<(), HlsError> {
    let mut resolver = PlaylistResolver::new();
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(HlsError::Cancelled),
            _ = interval.tick() => {}
        }

        let (playlist, base_url) = match fetch_media_playlist(&client, &url, &user_agent).await {
            Ok(result) => result,
            Err(e) => {
                warn!("playlist fetch failed: {e}");
                continue;
            }
        };

        for segment in resolver.resolve(&playlist, &base_url) {
            tokio::select! {
                _ = cancel.cancelled() => return Err(HlsError::Cancelled),
                sent = segments_tx.send(segment) => {
                    if sent.is_err() {
                        return Err(HlsError::ChannelClosed);
                    }
                }
            }
        }

        if playlist.end_list {
            debug!("playlist carries ENDLIST, stopping fetcher");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(playlist: &str) -> MediaPlaylist {
        m3u8_rs::parse_media_playlist_res(playlist.as_bytes()).unwrap()
    }

    const PLAYLIST_A: &str = "#EXTM3U\n\
        #EXT-X-VERSION:7\n\
        #EXT-X-TARGETDURATION:1\n\
        #EXT-X-MEDIA-SEQUENCE:100\n\
        #EXT-X-MAP:URI=\"h1668707.m4s\"\n\
        #EXTINF:1.00,a1b2c3|89abcdef\n\
        100.m4s\n\
        #EXTINF:1.00,deadbe|12345678\n\
        101.m4s\n";

    const PLAYLIST_B: &str = "#EXTM3U\n\
        #EXT-X-VERSION:7\n\
        #EXT-X-TARGETDURATION:1\n\
        #EXT-X-MEDIA-SEQUENCE:101\n\
        #EXT-X-MAP:URI=\"h1668707.m4s\"\n\
        #EXTINF:1.00,deadbe|12345678\n\
        101.m4s\n\
        #EXTINF:1.00,cafe12|87654321\n\
        104.m4s\n";

    #[test]
    fn test_segments_deduplicated_across_polls() {
        let base = Url::parse("https://cdn.example.com/live/index.m3u8").unwrap();
        let mut resolver = PlaylistResolver::new();

        let first = resolver.resolve(&parse(PLAYLIST_A), &base);
        assert_eq!(
            first.iter().map(|s| s.sequence).collect::<Vec<_>>(),
            vec![100, 101]
        );

        let second = resolver.resolve(&parse(PLAYLIST_B), &base);
        assert_eq!(
            second.iter().map(|s| s.sequence).collect::<Vec<_>>(),
            vec![104]
        );
    }

    #[test]
    fn test_discontinuity_marked_on_sequence_gap() {
        let base = Url::parse("https://cdn.example.com/live/index.m3u8").unwrap();
        let mut resolver = PlaylistResolver::new();

        resolver.resolve(&parse(PLAYLIST_A), &base);
        let second = resolver.resolve(&parse(PLAYLIST_B), &base);

        // 101 -> 104 jumps by 3.
        assert!(second[0].discontinuous);
    }

    #[test]
    fn test_segment_urls_and_init_section_resolved() {
        let base = Url::parse("https://cdn.example.com/live/index.m3u8").unwrap();
        let mut resolver = PlaylistResolver::new();

        let segments = resolver.resolve(&parse(PLAYLIST_A), &base);
        assert_eq!(
            segments[0].url.as_str(),
            "https://cdn.example.com/live/100.m4s"
        );
        assert_eq!(
            segments[0].init_url.as_ref().unwrap().as_str(),
            "https://cdn.example.com/live/h1668707.m4s"
        );
        assert_eq!(segments[0].init_name.as_deref(), Some("h1668707.m4s"));
        assert_eq!(segments[0].title, "a1b2c3|89abcdef");
    }
}
