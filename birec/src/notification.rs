//! Push notification sinks.
//!
//! Subscribes the event bus and forwards the notable room events to the
//! configured providers. Every send runs on its own task so providers
//! cannot block the bus.

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::{Event, EventBus};
use crate::setting::NotifierSettings;

pub struct Notifier {
    client: Client,
    settings: NotifierSettings,
}

impl Notifier {
    pub fn new(settings: NotifierSettings) -> Self {
        Self {
            client: Client::new(),
            settings,
        }
    }

    fn enabled(&self) -> bool {
        self.settings.serverchan.enabled || self.settings.telegram.enabled
    }

    pub async fn run(self, cancel: CancellationToken) {
        if !self.enabled() {
            return;
        }
        let mut events = EventBus::global().subscribe();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(_) => continue,
                },
            };

            let Some((title, body)) = render(&event) else {
                continue;
            };

            if self.settings.serverchan.enabled {
                let client = self.client.clone();
                let sendkey = self.settings.serverchan.sendkey.clone();
                let (title, body) = (title.clone(), body.clone());
                tokio::spawn(async move {
                    send_serverchan(&client, &sendkey, &title, &body).await;
                });
            }
            if self.settings.telegram.enabled {
                let client = self.client.clone();
                let token = self.settings.telegram.token.clone();
                let chat_id = self.settings.telegram.chat_id;
                let text = format!("{title}\n{body}");
                tokio::spawn(async move {
                    send_telegram(&client, &token, chat_id, &text).await;
                });
            }
        }
    }
}

/// Which events are worth a push, and how they read.
fn render(event: &Event) -> Option<(String, String)> {
    match event {
        Event::LiveBeganEvent {
            room_id,
            title,
            user_name,
        } => Some((
            format!("{user_name} went live"),
            format!("room {room_id}: {title}"),
        )),
        Event::LiveEndedEvent {
            room_id,
            title,
            user_name,
        } => Some((
            format!("{user_name} is offline"),
            format!("room {room_id}: {title}"),
        )),
        Event::SpaceNoEnoughEvent {
            path,
            threshold,
            usage,
        } => Some((
            "Disk space is running out".to_string(),
            format!(
                "{}: {} bytes free (threshold {})",
                path.display(),
                usage.free,
                threshold
            ),
        )),
        Event::Error { name, detail } => {
            Some((format!("Recorder error: {name}"), detail.clone()))
        }
        _ => None,
    }
}

async fn send_serverchan(client: &Client, sendkey: &str, title: &str, body: &str) {
    let url = format!("https://sctapi.ftqq.com/{sendkey}.send");
    let result = client
        .post(&url)
        .form(&[("title", title), ("desp", body)])
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => debug!("serverchan push sent"),
        Ok(response) => warn!(status = %response.status(), "serverchan push rejected"),
        Err(e) => warn!("serverchan push failed: {e}"),
    }
}

async fn send_telegram(client: &Client, token: &str, chat_id: i64, text: &str) {
    let url = format!("https://api.telegram.org/bot{token}/sendMessage");
    let result = client
        .post(&url)
        .json(&serde_json::json!({"chat_id": chat_id, "text": text}))
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => debug!("telegram push sent"),
        Ok(response) => warn!(status = %response.status(), "telegram push rejected"),
        Err(e) => warn!("telegram push failed: {e}"),
    }
}
