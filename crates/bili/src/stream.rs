//! Stream URL resolution with fallback policy.
//!
//! Wraps [`Live::get_live_stream_url`] with the retry ladder: an
//! unavailable quality falls back to the original quality (10000), an
//! unavailable format walks fmp4 -> ts -> flv, a missing alternative stream
//! falls back to the primary and rotates the API platform, transient
//! network errors retry with backoff, and room-state errors surface
//! untouched. A resolved URL is remembered and reused for identical
//! parameters as long as a HEAD probe still succeeds.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::StreamError;
use crate::live::Live;
use crate::models::{StreamCodec, StreamParams};

const TRANSIENT_RETRIES: usize = 3;
const ORIGINAL_QUALITY: u32 = 10000;

/// How to proceed after a failed resolution attempt.
#[derive(Debug, PartialEq)]
enum Fallback {
    /// Retry immediately with adjusted parameters.
    Retry(StreamParams),
    /// Retry the same parameters after a backoff (transient failure).
    Backoff,
    /// Give up and surface the error.
    GiveUp,
}

/// The fallback ladder, as a pure decision over the failed attempt.
fn fallback_for(params: StreamParams, error: &StreamError) -> Fallback {
    match error {
        StreamError::NoStreamQualityAvailable { .. } if params.quality != ORIGINAL_QUALITY => {
            Fallback::Retry(StreamParams {
                quality: ORIGINAL_QUALITY,
                ..params
            })
        }
        StreamError::NoStreamFormatAvailable { .. } => match params.format.fallback() {
            Some(format) => Fallback::Retry(StreamParams { format, ..params }),
            None => Fallback::GiveUp,
        },
        StreamError::NoAlternativeStreamAvailable { .. } if params.use_alternative => {
            Fallback::Retry(StreamParams {
                use_alternative: false,
                platform: params.platform.rotate(),
                ..params
            })
        }
        e if e.is_terminal() => Fallback::GiveUp,
        _ => Fallback::Backoff,
    }
}

pub struct StreamUrlResolver {
    live: Arc<Live>,
    last_resolved: Mutex<Option<(StreamParams, String)>>,
}

impl StreamUrlResolver {
    pub fn new(live: Arc<Live>) -> Self {
        Self {
            live,
            last_resolved: Mutex::new(None),
        }
    }

    /// Forget the cached URL, forcing the next resolution to hit the API.
    pub async fn invalidate(&self) {
        *self.last_resolved.lock().await = None;
    }

    pub async fn resolve(&self, params: StreamParams) -> Result<String, StreamError> {
        if let Some(url) = self.reusable_url(&params).await {
            debug!(room_id = self.live.room_id(), "reusing resolved stream url");
            return Ok(url);
        }

        let url = self.resolve_fresh(params).await?;
        *self.last_resolved.lock().await = Some((params, url.clone()));
        Ok(url)
    }

    async fn reusable_url(&self, params: &StreamParams) -> Option<String> {
        let guard = self.last_resolved.lock().await;
        let (last_params, last_url) = guard.as_ref()?;
        if last_params != params {
            return None;
        }
        let ok = self
            .live
            .client()
            .head(last_url)
            .timeout(Duration::from_secs(5))
            .header(reqwest::header::USER_AGENT, self.live.user_agent())
            .send()
            .await
            .map(|res| res.status().is_success())
            .unwrap_or(false);
        ok.then(|| last_url.clone())
    }

    async fn resolve_fresh(&self, mut params: StreamParams) -> Result<String, StreamError> {
        let mut transient_attempts = 0usize;

        loop {
            let result = self
                .live
                .get_live_stream_url(
                    params.quality,
                    params.platform,
                    params.format,
                    StreamCodec::Avc,
                    params.use_alternative,
                )
                .await;

            let error = match result {
                Ok(url) => {
                    info!(
                        room_id = self.live.room_id(),
                        format = %params.format,
                        quality = params.quality,
                        "resolved stream url"
                    );
                    return Ok(url);
                }
                Err(error) => error,
            };

            match fallback_for(params, &error) {
                Fallback::Retry(next) => {
                    warn!(
                        room_id = self.live.room_id(),
                        "stream resolution failed ({error}), retrying as {next:?}"
                    );
                    params = next;
                }
                Fallback::GiveUp => return Err(error),
                Fallback::Backoff => {
                    transient_attempts += 1;
                    if transient_attempts > TRANSIENT_RETRIES {
                        return Err(error);
                    }
                    let delay = Duration::from_millis(500 * (1 << transient_attempts));
                    warn!(
                        room_id = self.live.room_id(),
                        attempt = transient_attempts,
                        "stream resolution failed ({error}), retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApiPlatform, QualityNumber, StreamFormat};

    fn quality_error(params: &StreamParams) -> StreamError {
        StreamError::NoStreamQualityAvailable {
            format: params.format,
            codec: StreamCodec::Avc,
            quality: params.quality,
        }
    }

    fn format_error(params: &StreamParams) -> StreamError {
        StreamError::NoStreamFormatAvailable {
            format: params.format,
            codec: StreamCodec::Avc,
            quality: params.quality,
        }
    }

    /// fmp4 at 401 on a room that only offers flv/10000: the ladder walks
    /// fmp4 -> ts -> flv, then falls back to the original quality.
    #[test]
    fn test_format_then_quality_ladder() {
        let mut params = StreamParams::new(StreamFormat::Fmp4, 401);

        for expected_format in [StreamFormat::Ts, StreamFormat::Flv] {
            let Fallback::Retry(next) = fallback_for(params, &format_error(&params)) else {
                panic!("expected a retry");
            };
            assert_eq!(next.format, expected_format);
            assert_eq!(next.quality, 401);
            params = next;
        }

        let Fallback::Retry(next) = fallback_for(params, &quality_error(&params)) else {
            panic!("expected a retry");
        };
        assert_eq!(next.format, StreamFormat::Flv);
        assert_eq!(next.quality, 10000 as QualityNumber);
    }

    #[test]
    fn test_flv_format_failure_gives_up() {
        let params = StreamParams::new(StreamFormat::Flv, 10000);
        assert_eq!(
            fallback_for(params, &format_error(&params)),
            Fallback::GiveUp
        );
    }

    #[test]
    fn test_quality_at_original_backs_off() {
        let params = StreamParams::new(StreamFormat::Flv, 10000);
        assert_eq!(
            fallback_for(params, &quality_error(&params)),
            Fallback::Backoff
        );
    }

    #[test]
    fn test_missing_alternative_rotates_platform() {
        let params = StreamParams {
            use_alternative: true,
            ..StreamParams::new(StreamFormat::Flv, 10000)
        };
        let error = StreamError::NoAlternativeStreamAvailable {
            format: params.format,
            codec: StreamCodec::Avc,
            quality: params.quality,
        };

        let Fallback::Retry(next) = fallback_for(params, &error) else {
            panic!("expected a retry");
        };
        assert!(!next.use_alternative);
        assert_eq!(next.platform, ApiPlatform::Android);
    }

    #[test]
    fn test_terminal_room_states_give_up() {
        let params = StreamParams::new(StreamFormat::Flv, 10000);
        for error in [
            StreamError::RoomHidden,
            StreamError::RoomLocked,
            StreamError::RoomEncrypted,
        ] {
            assert_eq!(fallback_for(params, &error), Fallback::GiveUp);
        }
    }

    #[test]
    fn test_codec_and_network_errors_back_off() {
        let params = StreamParams::new(StreamFormat::Flv, 10000);
        let error = StreamError::NoStreamCodecAvailable {
            format: params.format,
            codec: StreamCodec::Avc,
            quality: params.quality,
        };
        assert_eq!(fallback_for(params, &error), Fallback::Backoff);
    }
}
