//! The chat channel client.
//!
//! Maintains one WebSocket connection per room: fetches the host list and
//! token, authenticates, heartbeats every 30 seconds and dispatches decoded
//! messages to listeners. Connection failures rotate through the host list
//! (refreshing it after a full cycle) and reconnect with a linearly growing
//! delay, up to `max_retries` attempts; read timeouts reconnect without
//! consuming an attempt.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{extract_buvid_from_cookie, extract_uid_from_cookie, generate_fake_buvid};
use crate::errors::WsError;
use crate::live::Live;
use crate::models::DanmuInfo;
use crate::ws::frame::{self, AUTH_TOKEN_ERROR, Frame, op};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(60); // 2 x heartbeat
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RETRIES: usize = 60;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Observer of chat client events. Implementations must not block; slow
/// reactions belong on their own tasks.
#[async_trait]
pub trait DanmakuListener: Send + Sync {
    async fn on_client_connected(&self) {}
    async fn on_client_disconnected(&self) {}
    async fn on_client_reconnected(&self) {}
    async fn on_danmaku_received(&self, _danmu: &Value) {}
    async fn on_error_occurred(&self, _error: &WsError) {}
}

struct ClientState {
    live: Arc<Live>,
    room_id: u64,
    max_retries: usize,
    listeners: RwLock<Vec<Arc<dyn DanmakuListener>>>,
    danmu_info: RwLock<DanmuInfo>,
    host_index: AtomicUsize,
    connected_once: AtomicBool,
}

impl ClientState {
    async fn emit<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<dyn DanmakuListener>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            f(listener).await;
        }
    }

    async fn update_danmu_info(&self) {
        debug!(room_id = self.room_id, "updating danmu info");
        let info = match self.live.webapi().get_danmu_info(self.room_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(room_id = self.room_id, "failed to update danmu info: {e}");
                DanmuInfo::default()
            }
        };
        *self.danmu_info.write() = info;
        self.host_index.store(0, Ordering::SeqCst);
    }

    fn auth_body(&self) -> String {
        let cookie = self.live.headers().cookie;
        let uid = extract_uid_from_cookie(&cookie).unwrap_or(0);
        let buvid = extract_buvid_from_cookie(&cookie)
            .map(str::to_string)
            .unwrap_or_else(generate_fake_buvid);
        let token = self.danmu_info.read().token.clone();

        json!({
            "uid": uid,
            // Must be the real room id, never the short alias.
            "roomid": self.room_id,
            "protover": 3,
            "buvid": buvid,
            "platform": "web",
            "type": 2,
            "key": token,
        })
        .to_string()
    }

    fn current_url(&self) -> Option<String> {
        let info = self.danmu_info.read();
        let index = self.host_index.load(Ordering::SeqCst);
        info.host_list.get(index).map(|h| h.wss_url())
    }

    /// Advance to the next host; returns true when the list wrapped around
    /// (and therefore should be refreshed).
    fn rotate_host(&self) -> bool {
        let len = self.danmu_info.read().host_list.len().max(1);
        let next = self.host_index.fetch_add(1, Ordering::SeqCst) + 1;
        if next >= len {
            self.host_index.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Establish the socket and authenticate, rotating hosts on failure.
    async fn connect(&self, cancel: &CancellationToken) -> Result<WsStream, WsError> {
        let mut refreshed_for_token = false;

        loop {
            if cancel.is_cancelled() {
                return Err(WsError::Closed);
            }

            match self.try_connect_once().await {
                Ok(ws) => return Ok(ws),
                Err(WsError::TokenExpired) if !refreshed_for_token => {
                    // Token errors get exactly one danmu-info refresh per
                    // reconnect cycle.
                    warn!(room_id = self.room_id, "auth token expired, refreshing danmu info");
                    self.update_danmu_info().await;
                    refreshed_for_token = true;
                }
                Err(e) => {
                    debug!(room_id = self.room_id, "connect attempt failed: {e}");
                    if self.rotate_host() {
                        self.update_danmu_info().await;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(WsError::Closed),
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }

    async fn try_connect_once(&self) -> Result<WsStream, WsError> {
        let url = self
            .current_url()
            .ok_or_else(|| WsError::UnexpectedFrame("empty host list".to_string()))?;
        debug!(room_id = self.room_id, url, "connecting websocket");

        let (mut ws, _response) = timeout(CONNECT_TIMEOUT, connect_async(&url))
            .await
            .map_err(|_| WsError::ReadTimeout)??;

        // AUTH, then wait for AUTH_REPLY.
        let auth = frame::encode(op::AUTH, &self.auth_body());
        ws.send(Message::Binary(auth.into())).await?;

        let reply = timeout(CONNECT_TIMEOUT, ws.next())
            .await
            .map_err(|_| WsError::ReadTimeout)?
            .ok_or(WsError::Closed)??;

        let Message::Binary(data) = reply else {
            return Err(WsError::UnexpectedFrame(format!("{reply:?}")));
        };
        let Frame::AuthReply(body) = frame::decode(&data)? else {
            return Err(WsError::UnexpectedFrame("expected auth reply".to_string()));
        };

        let code = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("code").and_then(Value::as_i64))
            .unwrap_or(-1);
        match code {
            0 => {
                debug!(room_id = self.room_id, "authenticated");
                Ok(ws)
            }
            AUTH_TOKEN_ERROR => Err(WsError::TokenExpired),
            other => Err(WsError::AuthFailed(other)),
        }
    }

    /// Pump one established connection until it fails or is cancelled.
    /// Returns the error that ended the session, or None on cancellation.
    async fn run_session(&self, mut ws: WsStream, cancel: &CancellationToken) -> Option<WsError> {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws.close(None).await;
                    return None;
                }
                _ = heartbeat.tick() => {
                    let packet = frame::encode(op::HEARTBEAT, "");
                    if let Err(e) = ws.send(Message::Binary(packet.into())).await {
                        warn!(room_id = self.room_id, "failed to send heartbeat: {e}");
                        return Some(WsError::Transport(e));
                    }
                }
                msg = timeout(READ_TIMEOUT, ws.next()) => {
                    match msg {
                        Err(_) => return Some(WsError::ReadTimeout),
                        Ok(None) => return Some(WsError::Closed),
                        Ok(Some(Err(e))) => return Some(WsError::Transport(e)),
                        Ok(Some(Ok(Message::Binary(data)))) => {
                            self.handle_data(&data).await;
                        }
                        Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
                        Ok(Some(Ok(Message::Close(_)))) => return Some(WsError::Closed),
                        Ok(Some(Ok(other))) => {
                            return Some(WsError::UnexpectedFrame(format!("{other:?}")));
                        }
                    }
                }
            }
        }
    }

    async fn handle_data(&self, data: &[u8]) {
        match frame::decode(data) {
            Ok(Frame::Messages(messages)) => {
                for msg in messages {
                    match serde_json::from_str::<Value>(&msg) {
                        Ok(danmu) => {
                            self.emit(|l| {
                                let danmu = danmu.clone();
                                async move { l.on_danmaku_received(&danmu).await }
                            })
                            .await;
                        }
                        Err(e) => {
                            debug!(room_id = self.room_id, "invalid message json: {e}");
                        }
                    }
                }
            }
            // Heartbeat replies only carry the online count.
            Ok(Frame::HeartbeatReply(_)) => {}
            Ok(Frame::AuthReply(_)) => {}
            Err(e) => {
                warn!(room_id = self.room_id, "failed to decode frame: {e}");
            }
        }
    }

    /// The whole client lifecycle: connect, pump, reconnect with backoff.
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut retry_count = 0usize;
        let mut retry_delay = 0u64;

        self.update_danmu_info().await;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let ws = match self.connect(&cancel).await {
                Ok(ws) => ws,
                Err(WsError::Closed) => break,
                Err(e) => {
                    self.emit(|l| {
                        let e = &e;
                        async move { l.on_error_occurred(e).await }
                    })
                    .await;
                    continue;
                }
            };

            if self.connected_once.swap(true, Ordering::SeqCst) {
                self.emit(|l| async move { l.on_client_reconnected().await })
                    .await;
            } else {
                self.emit(|l| async move { l.on_client_connected().await })
                    .await;
            }
            retry_count = 0;
            retry_delay = 0;

            let session_error = self.run_session(ws, &cancel).await;
            self.emit(|l| async move { l.on_client_disconnected().await })
                .await;

            let Some(error) = session_error else {
                break; // cancelled
            };

            self.emit(|l| {
                let error = &error;
                async move { l.on_error_occurred(error).await }
            })
            .await;

            // Timeouts reconnect immediately and do not consume an attempt.
            if !matches!(error, WsError::ReadTimeout) {
                if retry_count >= self.max_retries {
                    let exhausted = WsError::RetriesExhausted(retry_count);
                    warn!(room_id = self.room_id, "{exhausted}");
                    self.emit(|l| {
                        let exhausted = &exhausted;
                        async move { l.on_error_occurred(exhausted).await }
                    })
                    .await;
                    break;
                }
                if retry_delay > 0 {
                    debug!(
                        room_id = self.room_id,
                        "retrying in {retry_delay} second(s)"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(retry_delay)) => {}
                    }
                }
                retry_count += 1;
                retry_delay += 1;
            }
        }

        debug!(room_id = self.room_id, "danmaku client loop finished");
    }
}

pub struct DanmakuClient {
    state: Arc<ClientState>,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DanmakuClient {
    pub fn new(live: Arc<Live>) -> Self {
        Self::with_max_retries(live, DEFAULT_MAX_RETRIES)
    }

    pub fn with_max_retries(live: Arc<Live>, max_retries: usize) -> Self {
        let room_id = live.room_id();
        Self {
            state: Arc::new(ClientState {
                live,
                room_id,
                max_retries,
                listeners: RwLock::new(Vec::new()),
                danmu_info: RwLock::new(DanmuInfo::default()),
                host_index: AtomicUsize::new(0),
                connected_once: AtomicBool::new(false),
            }),
            cancel: parking_lot::Mutex::new(None),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn DanmakuListener>) {
        self.state.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DanmakuListener>) {
        self.state
            .listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start the client: refresh danmu info, connect, heartbeat, dispatch.
    pub fn start(&self) {
        if self.is_running() {
            return;
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());
        self.state.connected_once.store(false, Ordering::SeqCst);

        let state = self.state.clone();
        *self.task.lock() = Some(tokio::spawn(state.run(cancel)));
        debug!(room_id = self.state.room_id, "started danmaku client");
    }

    /// Stop the client: cancel the loop and close the socket.
    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = timeout(Duration::from_secs(10), task).await;
        }
        debug!(room_id = self.state.room_id, "stopped danmaku client");
    }

    pub async fn restart(&self) {
        self.stop().await;
        self.start();
    }
}
