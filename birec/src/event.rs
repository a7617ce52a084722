//! Process-wide event and exception buses.
//!
//! Both buses are broadcast channels created once at startup. Subscribers
//! (the admin WebSocket, the webhook emitter, the notifier) each hold their
//! own receiver and drop it to unsubscribe; publishing never blocks.

use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::{FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::setting::QualityNumber;

const BUS_CAPACITY: usize = 256;

/// Domain events published by tasks and the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    LiveBeganEvent {
        room_id: u64,
        title: String,
        user_name: String,
    },
    LiveEndedEvent {
        room_id: u64,
        title: String,
        user_name: String,
    },
    RoomChangeEvent {
        room_id: u64,
        title: String,
        area_name: String,
        parent_area_name: String,
    },
    RecordingStartedEvent {
        room_id: u64,
    },
    RecordingFinishedEvent {
        room_id: u64,
    },
    RecordingCancelledEvent {
        room_id: u64,
    },
    VideoFileCreatedEvent {
        room_id: u64,
        path: PathBuf,
    },
    VideoFileCompletedEvent {
        room_id: u64,
        path: PathBuf,
    },
    DanmakuFileCreatedEvent {
        room_id: u64,
        path: PathBuf,
    },
    DanmakuFileCompletedEvent {
        room_id: u64,
        path: PathBuf,
    },
    RawDanmakuFileCreatedEvent {
        room_id: u64,
        path: PathBuf,
    },
    RawDanmakuFileCompletedEvent {
        room_id: u64,
        path: PathBuf,
    },
    VideoPostprocessingCompletedEvent {
        room_id: u64,
        path: PathBuf,
    },
    StreamRecordingInterruptedEvent {
        room_id: u64,
        duration: f64,
    },
    StreamRecordingRecoveredEvent {
        room_id: u64,
        timestamp: i64,
    },
    RealQualityChangedEvent {
        room_id: u64,
        quality: QualityNumber,
    },
    SpaceNoEnoughEvent {
        path: PathBuf,
        threshold: u64,
        usage: DiskUsage,
    },
    Error {
        name: String,
        detail: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

impl Event {
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::LiveBeganEvent { .. } => "LiveBeganEvent",
            Event::LiveEndedEvent { .. } => "LiveEndedEvent",
            Event::RoomChangeEvent { .. } => "RoomChangeEvent",
            Event::RecordingStartedEvent { .. } => "RecordingStartedEvent",
            Event::RecordingFinishedEvent { .. } => "RecordingFinishedEvent",
            Event::RecordingCancelledEvent { .. } => "RecordingCancelledEvent",
            Event::VideoFileCreatedEvent { .. } => "VideoFileCreatedEvent",
            Event::VideoFileCompletedEvent { .. } => "VideoFileCompletedEvent",
            Event::DanmakuFileCreatedEvent { .. } => "DanmakuFileCreatedEvent",
            Event::DanmakuFileCompletedEvent { .. } => "DanmakuFileCompletedEvent",
            Event::RawDanmakuFileCreatedEvent { .. } => "RawDanmakuFileCreatedEvent",
            Event::RawDanmakuFileCompletedEvent { .. } => "RawDanmakuFileCompletedEvent",
            Event::VideoPostprocessingCompletedEvent { .. } => {
                "VideoPostprocessingCompletedEvent"
            }
            Event::StreamRecordingInterruptedEvent { .. } => "StreamRecordingInterruptedEvent",
            Event::StreamRecordingRecoveredEvent { .. } => "StreamRecordingRecoveredEvent",
            Event::RealQualityChangedEvent { .. } => "RealQualityChangedEvent",
            Event::SpaceNoEnoughEvent { .. } => "SpaceNoEnoughEvent",
            Event::Error { .. } => "Error",
        }
    }

    /// The wire form: `{type, id, date, data}` with a time-based id and the
    /// date rendered in UTC+8.
    pub fn to_wire(&self) -> Value {
        let tz = FixedOffset::east_opt(8 * 3600).expect("fixed offset");
        let value = serde_json::to_value(self).expect("event serialization");
        json!({
            "type": self.type_name(),
            "id": Uuid::now_v1(&[0, 0, 0, 0, 0, 0]).to_string(),
            "date": Utc::now()
                .with_timezone(&tz)
                .to_rfc3339_opts(SecondsFormat::Secs, false),
            "data": value.get("data").cloned().unwrap_or(Value::Null),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// The process-wide instance.
    pub fn global() -> &'static EventBus {
        static BUS: OnceLock<EventBus> = OnceLock::new();
        BUS.get_or_init(EventBus::new)
    }

    pub fn publish(&self, event: Event) {
        // A send error only means nobody is listening right now.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

/// An unhandled error surfaced to the UI: `{name, detail}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub name: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct ExceptionBus {
    sender: broadcast::Sender<ExceptionRecord>,
}

impl ExceptionBus {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn global() -> &'static ExceptionBus {
        static BUS: OnceLock<ExceptionBus> = OnceLock::new();
        BUS.get_or_init(ExceptionBus::new)
    }

    pub fn submit(&self, name: impl Into<String>, detail: impl Into<String>) {
        let record = ExceptionRecord {
            name: name.into(),
            detail: detail.into(),
        };
        tracing::error!("unhandled exception: {}: {}", record.name, record.detail);
        let _ = self.sender.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExceptionRecord> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_form_shape() {
        let event = Event::LiveBeganEvent {
            room_id: 23058,
            title: "t".to_string(),
            user_name: "u".to_string(),
        };
        let wire = event.to_wire();

        assert_eq!(wire["type"], "LiveBeganEvent");
        assert_eq!(wire["data"]["room_id"], 23058);
        assert!(wire["date"].as_str().unwrap().ends_with("+08:00"));
        // Time-based UUID, version 1.
        let id = Uuid::parse_str(wire["id"].as_str().unwrap()).unwrap();
        assert_eq!(id.get_version_num(), 1);
    }

    #[tokio::test]
    async fn test_bus_broadcast_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::RecordingStartedEvent { room_id: 1 });

        assert!(matches!(
            a.recv().await.unwrap(),
            Event::RecordingStartedEvent { room_id: 1 }
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            Event::RecordingStartedEvent { room_id: 1 }
        ));
    }
}
