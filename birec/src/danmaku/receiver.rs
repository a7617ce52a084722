//! Chat capture task.
//!
//! A [`DanmakuReceiver`] listens on the chat client and forwards raw
//! commands into a queue; the dump task drains that queue and maintains the
//! sidecar files of whichever video file is currently open. File rotation
//! arrives through the same queue so messages never land in the wrong file.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bili::ws::DanmakuListener;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::statistics::RateCounter;
use crate::event::{Event, EventBus};
use crate::setting::DanmakuSettings;

use super::dumper::{DanmakuMetadata, DanmakuWriter, RawDanmakuWriter};
use super::models::{Danmu, GiftSendRecord, GuardBuyRecord, SuperChatRecord};

/// Input of the dump task.
#[derive(Debug)]
pub enum DanmakuItem {
    Message(Box<Value>),
    /// A new video file was opened; rotate the sidecars.
    Open {
        video_path: PathBuf,
        metadata: DanmakuMetadata,
        save_raw: bool,
    },
    /// The current video file completed; close the sidecars.
    Close,
}

/// Listener side: forwards messages into the queue and counts them.
pub struct DanmakuReceiver {
    tx: mpsc::UnboundedSender<DanmakuItem>,
    counter: Arc<RateCounter>,
}

impl DanmakuReceiver {
    pub fn new(tx: mpsc::UnboundedSender<DanmakuItem>, counter: Arc<RateCounter>) -> Arc<Self> {
        Arc::new(Self { tx, counter })
    }
}

#[async_trait]
impl DanmakuListener for DanmakuReceiver {
    async fn on_danmaku_received(&self, danmu: &Value) {
        if danmu.get("cmd").and_then(Value::as_str) == Some("DANMU_MSG") {
            self.counter.add(1);
        }
        let _ = self.tx.send(DanmakuItem::Message(Box::new(danmu.clone())));
    }
}

struct OpenFiles {
    xml: DanmakuWriter,
    raw: Option<RawDanmakuWriter>,
    record_start_time: i64,
}

/// Drains the queue, writing sidecars for the currently open video file.
/// The settings handle is shared with the owning task so changes apply to
/// the next message without restarting the capture.
pub struct DanmakuDumpTask {
    room_id: u64,
    settings: Arc<RwLock<DanmakuSettings>>,
    files: Option<OpenFiles>,
}

impl DanmakuDumpTask {
    pub fn new(room_id: u64, settings: Arc<RwLock<DanmakuSettings>>) -> Self {
        Self {
            room_id,
            settings,
            files: None,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DanmakuItem>) {
        while let Some(item) = rx.recv().await {
            match item {
                DanmakuItem::Message(value) => self.handle_message(&value),
                DanmakuItem::Open {
                    video_path,
                    metadata,
                    save_raw,
                } => self.open(&video_path, metadata, save_raw),
                DanmakuItem::Close => self.close(),
            }
        }
        self.close();
    }

    fn open(&mut self, video_path: &std::path::Path, metadata: DanmakuMetadata, save_raw: bool) {
        self.close();

        let xml_path = video_path.with_extension("xml");
        let xml = match DanmakuWriter::create(&xml_path, &metadata) {
            Ok(writer) => writer,
            Err(e) => {
                warn!(room_id = self.room_id, "failed to open danmaku file: {e}");
                return;
            }
        };
        EventBus::global().publish(Event::DanmakuFileCreatedEvent {
            room_id: self.room_id,
            path: xml_path,
        });

        let raw = if save_raw {
            let raw_path = video_path.with_extension("jsonl");
            match RawDanmakuWriter::create(&raw_path) {
                Ok(writer) => {
                    EventBus::global().publish(Event::RawDanmakuFileCreatedEvent {
                        room_id: self.room_id,
                        path: writer.path().to_path_buf(),
                    });
                    Some(writer)
                }
                Err(e) => {
                    warn!(room_id = self.room_id, "failed to open raw danmaku file: {e}");
                    None
                }
            }
        } else {
            None
        };

        self.files = Some(OpenFiles {
            xml,
            raw,
            record_start_time: metadata.record_start_time,
        });
    }

    fn close(&mut self) {
        let Some(files) = self.files.take() else {
            return;
        };
        match files.xml.complete() {
            Ok(path) => EventBus::global().publish(Event::DanmakuFileCompletedEvent {
                room_id: self.room_id,
                path,
            }),
            Err(e) => warn!(room_id = self.room_id, "failed to close danmaku file: {e}"),
        }
        if let Some(raw) = files.raw {
            match raw.complete() {
                Ok(path) => EventBus::global().publish(Event::RawDanmakuFileCompletedEvent {
                    room_id: self.room_id,
                    path,
                }),
                Err(e) => {
                    warn!(room_id = self.room_id, "failed to close raw danmaku file: {e}")
                }
            }
        }
    }

    fn handle_message(&mut self, value: &Value) {
        let Some(files) = self.files.as_mut() else {
            return; // no video file open, nothing to record against
        };

        if let Some(raw) = files.raw.as_mut() {
            if let Err(e) = raw.write(value) {
                debug!(room_id = self.room_id, "raw danmaku write failed: {e}");
            }
        }

        let Some(cmd) = value.get("cmd").and_then(Value::as_str) else {
            return;
        };
        // DANMU_MSG arrives with display variants suffixed to the command.
        let base_cmd = cmd.split(':').next().unwrap_or(cmd);

        let record_start = files.record_start_time;
        let stime = |date_ms: i64| ((date_ms as f64 / 1000.0) - record_start as f64).max(0.0);
        let settings = self.settings.read().clone();

        let result = match base_cmd {
            "DANMU_MSG" => Danmu::from_cmd(value).map(|mut danmu| {
                danmu.stime = stime(danmu.date);
                if !settings.danmu_uname {
                    danmu.uname.clear();
                }
                files.xml.write_danmu(&danmu)
            }),
            "SEND_GIFT" if settings.record_gift_send => {
                GiftSendRecord::from_cmd(value).and_then(|mut gift| {
                    if gift.is_free_gift() && !settings.record_free_gifts {
                        return None;
                    }
                    gift.ts = stime(chrono::Utc::now().timestamp_millis());
                    Some(files.xml.write_gift(&gift))
                })
            }
            "GUARD_BUY" if settings.record_guard_buy => {
                GuardBuyRecord::from_cmd(value).map(|mut record| {
                    record.ts = stime(chrono::Utc::now().timestamp_millis());
                    files.xml.write_guard_buy(&record)
                })
            }
            "SUPER_CHAT_MESSAGE" if settings.record_super_chat => {
                SuperChatRecord::from_cmd(value).map(|mut record| {
                    record.ts = stime(chrono::Utc::now().timestamp_millis());
                    files.xml.write_super_chat(&record)
                })
            }
            _ => None,
        };

        if let Some(Err(e)) = result {
            debug!(room_id = self.room_id, "danmaku write failed: {e}");
        }
    }
}
