//! Live-state monitor.
//!
//! Interprets chat commands and reconnect probes into a small state
//! machine. The `consecutive_live_count` distinguishes the phases of going
//! live: the first LIVE command means the broadcast began, the second means
//! the stream is actually available, and any further one while already live
//! means the streamer reset the stream. After a chat reconnect the room
//! info is re-fetched and the missed transitions are replayed, so recording
//! resumes correctly even after an OS hibernation.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::WsError;
use crate::live::Live;
use crate::models::{LiveStatus, RoomInfo};
use crate::ws::client::DanmakuListener;

/// Observer of live state changes.
#[async_trait]
pub trait LiveEventListener: Send + Sync {
    async fn on_live_status_changed(&self, _current: LiveStatus, _previous: LiveStatus) {}
    async fn on_live_began(&self, _live: &Arc<Live>) {}
    async fn on_live_ended(&self, _live: &Arc<Live>) {}
    async fn on_live_stream_available(&self, _live: &Arc<Live>) {}
    async fn on_live_stream_reset(&self, _live: &Arc<Live>) {}
    async fn on_room_changed(&self, _room_info: &RoomInfo) {}
}

struct MonitorState {
    previous_status: LiveStatus,
    consecutive_live_count: u32,
}

pub struct LiveMonitor {
    live: Arc<Live>,
    state: Mutex<MonitorState>,
    listeners: parking_lot::RwLock<Vec<Arc<dyn LiveEventListener>>>,
}

impl LiveMonitor {
    pub fn new(live: Arc<Live>) -> Arc<Self> {
        Arc::new(Self {
            live,
            state: Mutex::new(MonitorState {
                previous_status: LiveStatus::Preparing,
                consecutive_live_count: 0,
            }),
            listeners: parking_lot::RwLock::new(Vec::new()),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn LiveEventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn LiveEventListener>) {
        self.listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Seed the state machine from the current room info. A room that is
    /// already live counts as "began + stream available".
    pub fn init_status(&self) {
        let status = self
            .live
            .room_info()
            .map(|info| info.live_status)
            .unwrap_or(LiveStatus::Preparing);
        let mut state = self.state.lock();
        state.previous_status = status;
        state.consecutive_live_count = if status == LiveStatus::Live { 2 } else { 0 };
    }

    async fn emit<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<dyn LiveEventListener>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            f(listener).await;
        }
    }

    async fn handle_status_change(&self, current: LiveStatus) {
        if let Err(e) = self.live.update_info().await {
            warn!(
                room_id = self.live.room_id(),
                "failed to update live info on status change: {e}"
            );
        }

        let (previous, count) = {
            let mut state = self.state.lock();
            let previous = state.previous_status;
            if current != LiveStatus::Live {
                state.consecutive_live_count = 0;
            } else {
                state.consecutive_live_count += 1;
            }
            state.previous_status = current;
            (previous, state.consecutive_live_count)
        };

        debug!(
            room_id = self.live.room_id(),
            %current,
            %previous,
            count,
            "live status changed"
        );

        self.emit(|l| async move { l.on_live_status_changed(current, previous).await })
            .await;

        if current != LiveStatus::Live {
            self.emit(|l| {
                let live = self.live.clone();
                async move { l.on_live_ended(&live).await }
            })
            .await;
        } else {
            match count {
                1 => {
                    self.emit(|l| {
                        let live = self.live.clone();
                        async move { l.on_live_began(&live).await }
                    })
                    .await;
                }
                2 => {
                    self.emit(|l| {
                        let live = self.live.clone();
                        async move { l.on_live_stream_available(&live).await }
                    })
                    .await;
                }
                _ => {
                    self.emit(|l| {
                        let live = self.live.clone();
                        async move { l.on_live_stream_reset(&live).await }
                    })
                    .await;
                }
            }
        }
    }
}

#[async_trait]
impl DanmakuListener for LiveMonitor {
    /// Replay missed transitions after a reconnect so a status change that
    /// happened while the socket was down still produces the right events.
    async fn on_client_reconnected(&self) {
        warn!(room_id = self.live.room_id(), "chat client reconnected");

        if let Err(e) = self.live.update_room_info().await {
            warn!(
                room_id = self.live.room_id(),
                "failed to refresh room info after reconnect: {e}"
            );
            return;
        }
        let Some(current) = self.live.room_info().map(|info| info.live_status) else {
            return;
        };

        let previous = self.state.lock().previous_status;
        if current == previous {
            return;
        }

        if current == LiveStatus::Live {
            debug!("simulating live began event");
            self.handle_status_change(current).await;
            debug!("simulating live stream available event");
            self.handle_status_change(current).await;
        } else {
            debug!("simulating live ended event");
            self.handle_status_change(current).await;
        }
    }

    async fn on_danmaku_received(&self, danmu: &Value) {
        let Some(cmd) = danmu.get("cmd").and_then(Value::as_str) else {
            return;
        };

        // Commands outside this set have no live-state meaning; tolerate
        // and ignore them.
        match cmd {
            "LIVE" => self.handle_status_change(LiveStatus::Live).await,
            "PREPARING" => {
                if danmu.get("round").and_then(Value::as_i64) == Some(1) {
                    self.handle_status_change(LiveStatus::Round).await;
                } else {
                    self.handle_status_change(LiveStatus::Preparing).await;
                }
            }
            "ROOM_CHANGE" => {
                if let Err(e) = self.live.update_room_info().await {
                    warn!(
                        room_id = self.live.room_id(),
                        "failed to update room info on ROOM_CHANGE: {e}"
                    );
                    return;
                }
                if let Some(room_info) = self.live.room_info() {
                    self.emit(|l| {
                        let room_info = room_info.clone();
                        async move { l.on_room_changed(&room_info).await }
                    })
                    .await;
                }
            }
            _ => {}
        }
    }

    async fn on_error_occurred(&self, error: &WsError) {
        debug!(room_id = self.live.room_id(), "chat client error: {error}");
    }
}
