//! Webhook sinks.
//!
//! Subscribes both buses and POSTs every matching event as JSON. Each
//! delivery runs on its own task with exponential backoff capped at 180
//! seconds, so one slow endpoint never delays the buses or other hooks.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::{EventBus, ExceptionBus};
use crate::setting::WebhookSettings;

const MAX_BACKOFF: Duration = Duration::from_secs(180);
const DELIVERY_ATTEMPTS: usize = 8;

pub struct WebhookEmitter {
    client: Client,
    hooks: Vec<WebhookSettings>,
}

impl WebhookEmitter {
    pub fn new(hooks: Vec<WebhookSettings>) -> Self {
        Self {
            client: Client::new(),
            hooks,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        if self.hooks.is_empty() {
            return;
        }
        let mut events = EventBus::global().subscribe();
        let mut exceptions = ExceptionBus::global().subscribe();

        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Ok(event) => event.to_wire(),
                    Err(_) => continue,
                },
                exception = exceptions.recv() => match exception {
                    Ok(record) => crate::event::Event::Error {
                        name: record.name,
                        detail: record.detail,
                    }
                    .to_wire(),
                    Err(_) => continue,
                },
            };

            let event_type = payload
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            for hook in &self.hooks {
                if !hook.event_types.is_empty()
                    && !hook.event_types.iter().any(|t| t == &event_type)
                {
                    continue;
                }
                // One delivery task per hook per event.
                tokio::spawn(deliver(
                    self.client.clone(),
                    hook.url.clone(),
                    payload.clone(),
                ));
            }
        }
    }
}

async fn deliver(client: Client, url: String, payload: Value) {
    let mut backoff = Duration::from_secs(1);
    for attempt in 1..=DELIVERY_ATTEMPTS {
        let result = client
            .post(&url)
            .header(
                reqwest::header::USER_AGENT,
                concat!("birec/", env!("CARGO_PKG_VERSION")),
            )
            .json(&payload)
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(url, "webhook delivered");
                return;
            }
            Ok(response) => {
                warn!(url, status = %response.status(), attempt, "webhook rejected");
            }
            Err(e) => {
                warn!(url, attempt, "webhook delivery failed: {e}");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    warn!(url, "webhook delivery abandoned after {DELIVERY_ATTEMPTS} attempts");
}
