//! Segment downloading and verification.
//!
//! For each segment the fetcher downloads the init section when it changed
//! (a new init section is accepted only after two fetches one second apart
//! return identical bytes), then the segment body, verifying the size and
//! CRC32 the playlist advertised. Verification failures re-download up to
//! three times; network errors back off exponentially up to 60 seconds.

use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::HlsError;
use crate::segment::{Segment, SegmentData};

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const VERIFY_ATTEMPTS: usize = 3;
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const INIT_STABILITY_DELAY: Duration = Duration::from_secs(1);

pub struct SegmentFetcher {
    client: Client,
    user_agent: String,
    last_init_name: Option<String>,
    last_init_payload: Option<Bytes>,
}

impl SegmentFetcher {
    pub fn new(client: Client, user_agent: String) -> Self {
        Self {
            client,
            user_agent,
            last_init_name: None,
            last_init_payload: None,
        }
    }

    async fn get_bytes(&self, url: &Url) -> Result<Bytes, HlsError> {
        Ok(self
            .client
            .get(url.clone())
            .timeout(FETCH_TIMEOUT)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?)
    }

    /// Download the init section and wait until two consecutive fetches
    /// agree, so a section caught mid-update is never used.
    async fn fetch_stable_init(&self, url: &Url) -> Result<Bytes, HlsError> {
        let mut previous = self.get_bytes(url).await?;
        loop {
            tokio::time::sleep(INIT_STABILITY_DELAY).await;
            let current = self.get_bytes(url).await?;
            if current == previous {
                return Ok(current);
            }
            debug!(url = %url, "init section changed between fetches, retrying");
            previous = current;
        }
    }

    /// Fetch the init section if this segment references a different one
    /// than the last emitted.
    pub async fn fetch_init_if_changed(
        &mut self,
        segment: &Segment,
    ) -> Result<Option<SegmentData>, HlsError> {
        let (Some(init_url), Some(init_name)) = (&segment.init_url, &segment.init_name) else {
            return Ok(None);
        };
        if self.last_init_name.as_deref() == Some(init_name.as_str()) {
            return Ok(None);
        }

        let payload = self.fetch_stable_init(init_url).await?;
        self.last_init_name = Some(init_name.clone());
        self.last_init_payload = Some(payload.clone());
        Ok(Some(SegmentData::InitSection {
            name: init_name.clone(),
            payload,
        }))
    }

    /// The most recently fetched init section, for remuxing.
    pub fn current_init(&self) -> Option<Bytes> {
        self.last_init_payload.clone()
    }

    /// Download one segment body, verifying against the playlist checksum.
    pub async fn fetch_segment(&self, segment: &Segment) -> Result<Bytes, HlsError> {
        let mut last_error = None;
        for attempt in 1..=VERIFY_ATTEMPTS {
            let payload = self.get_bytes(&segment.url).await?;
            match segment.verify(&payload) {
                Ok(()) => return Ok(payload),
                Err(e) => {
                    warn!(
                        sequence = segment.sequence,
                        attempt, "segment verification failed: {e}"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.expect("at least one attempt"))
    }
}

/// Drain the segment queue, download everything, and push the data onward.
pub async fn run_segment_fetcher(
    client: Client,
    user_agent: String,
    mut segments_rx: mpsc::Receiver<Segment>,
    data_tx: mpsc::Sender<SegmentData>,
    cancel: CancellationToken,
) -> Result<(), HlsError> {
    let mut fetcher = SegmentFetcher::new(client, user_agent);
    let mut backoff = Duration::from_secs(1);

    loop {
        let segment = tokio::select! {
            _ = cancel.cancelled() => return Err(HlsError::Cancelled),
            segment = segments_rx.recv() => match segment {
                Some(segment) => segment,
                None => return Ok(()),
            },
        };

        loop {
            let result = async {
                let init = fetcher.fetch_init_if_changed(&segment).await?;
                let payload = fetcher.fetch_segment(&segment).await?;
                Ok::<_, HlsError>((init, payload))
            }
            .await;

            match result {
                Ok((init, payload)) => {
                    backoff = Duration::from_secs(1);
                    if let Some(init) = init {
                        if data_tx.send(init).await.is_err() {
                            return Err(HlsError::ChannelClosed);
                        }
                    }
                    let data = SegmentData::Segment {
                        segment: segment.clone(),
                        payload,
                    };
                    if data_tx.send(data).await.is_err() {
                        return Err(HlsError::ChannelClosed);
                    }
                    break;
                }
                Err(e) if e.is_structural() => {
                    // Persistent checksum mismatches after all retries mean
                    // the segment is gone; skip it rather than stall.
                    warn!(sequence = segment.sequence, "dropping segment: {e}");
                    break;
                }
                Err(HlsError::Cancelled) => return Err(HlsError::Cancelled),
                Err(e) => {
                    warn!(
                        sequence = segment.sequence,
                        "segment fetch failed: {e}, retrying in {backoff:?}"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(HlsError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}
