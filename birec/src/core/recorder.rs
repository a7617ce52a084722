//! The per-room recorder.
//!
//! One recorder owns the recording lifecycle of a room: it reacts to the
//! live monitor, resolves a stream URL, drives the FLV or HLS pipeline on a
//! blocking worker, rotates to alternative streams on structural errors,
//! and watches for stalled downloads. Produced files are handed to the
//! postprocessor queue together with their sidecars.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bili::models::StreamFormat;
use bili::{Live, LiveEventListener, StreamError, StreamParams, StreamUrlResolver};
use bytes::Bytes;
use flv::FlvData;
use flv_fix::{CutHandle, DumpEvent, FlvPipelineConfig, FlvPipelineSinks, JoinPoint, MetaData};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use pipeline_common::{CancellationToken, PipelineError, StreamerContext};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::danmaku::dumper::DanmakuMetadata;
use crate::danmaku::receiver::DanmakuItem;
use crate::event::{Event, EventBus, ExceptionBus};
use crate::path_provider::{PathContext, build_output_path};
use crate::setting::ResolvedTaskSettings;

use super::statistics::RateCounter;

const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const REACHABILITY_POLL: Duration = Duration::from_secs(3);
const WATCHDOG_TICK: Duration = Duration::from_secs(1);

/// What the task status endpoint reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunningStatus {
    Stopped,
    Waiting,
    Recording,
    Remuxing,
    Injecting,
}

/// A finished video file plus its sidecars, queued for postprocessing.
#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    pub room_id: u64,
    pub video_path: PathBuf,
    pub meta_path: Option<PathBuf>,
}

enum SessionEnd {
    /// The server closed the stream; reconnect while still live.
    Eof,
    Cancelled,
    /// The watchdog cancelled a stalled session.
    Stalled,
    UrlExpired,
    Corrupted(String),
    NoSpace(std::io::Error),
    Failed(String),
}

struct SessionShared {
    room_id: u64,
    data_counter: Arc<RateCounter>,
    last_progress: Mutex<Instant>,
    /// Monotonic duration of the current file, milliseconds.
    duration_ms: AtomicU32,
    latest_metadata: Mutex<Option<MetaData>>,
    latest_join_points: Mutex<Vec<JoinPoint>>,
}

pub struct Recorder {
    inner: Arc<RecorderInner>,
}

struct RecorderInner {
    live: Arc<Live>,
    resolver: StreamUrlResolver,
    settings: RwLock<ResolvedTaskSettings>,
    status: RwLock<RunningStatus>,
    cut_handle: CutHandle,
    data_counter: Arc<RateCounter>,
    real_quality: RwLock<Option<u32>>,
    stream_profile: RwLock<Option<flv_fix::StreamProfile>>,
    session_cancel: Mutex<Option<tokio_util::sync::CancellationToken>>,
    session_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    danmaku_tx: mpsc::UnboundedSender<DanmakuItem>,
    artifact_tx: mpsc::UnboundedSender<RecordingArtifact>,
}

impl Recorder {
    pub fn new(
        live: Arc<Live>,
        settings: ResolvedTaskSettings,
        danmaku_tx: mpsc::UnboundedSender<DanmakuItem>,
        artifact_tx: mpsc::UnboundedSender<RecordingArtifact>,
    ) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                resolver: StreamUrlResolver::new(live.clone()),
                live,
                settings: RwLock::new(settings),
                status: RwLock::new(RunningStatus::Stopped),
                cut_handle: CutHandle::new(),
                data_counter: RateCounter::new(),
                real_quality: RwLock::new(None),
                stream_profile: RwLock::new(None),
                session_cancel: Mutex::new(None),
                session_task: Mutex::new(None),
                danmaku_tx,
                artifact_tx,
            }),
        }
    }

    pub fn status(&self) -> RunningStatus {
        *self.inner.status.read()
    }

    pub fn set_status(&self, status: RunningStatus) {
        *self.inner.status.write() = status;
    }

    pub fn cut_handle(&self) -> CutHandle {
        self.inner.cut_handle.clone()
    }

    pub fn data_counter(&self) -> Arc<RateCounter> {
        self.inner.data_counter.clone()
    }

    pub fn real_quality(&self) -> Option<u32> {
        *self.inner.real_quality.read()
    }

    pub fn stream_profile(&self) -> Option<flv_fix::StreamProfile> {
        self.inner.stream_profile.read().clone()
    }

    pub fn update_settings(&self, settings: ResolvedTaskSettings) {
        self.inner
            .live
            .set_host_prefs(settings.recorder.stream_host_prefs.clone());
        *self.inner.settings.write() = settings;
    }

    pub fn is_recording(&self) -> bool {
        self.inner
            .session_task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Begin a recording session, unless one is already running.
    pub fn start_session(&self) {
        if self.is_recording() {
            return;
        }
        let cancel = tokio_util::sync::CancellationToken::new();
        *self.inner.session_cancel.lock() = Some(cancel.clone());

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            inner.clone().run_sessions(cancel).await;
        });
        *self.inner.session_task.lock() = Some(handle);
    }

    /// Cancel the running session and wait for the workers to drain.
    pub async fn stop_session(&self) {
        if let Some(cancel) = self.inner.session_cancel.lock().take() {
            cancel.cancel();
        }
        let task = self.inner.session_task.lock().take();
        if let Some(task) = task {
            // Worker threads get a generous window to flush and close files.
            if tokio::time::timeout(Duration::from_secs(30), task)
                .await
                .is_err()
            {
                warn!("recording session did not stop within 30s, abandoning");
            }
        }
        *self.inner.status.write() = RunningStatus::Stopped;
    }
}

/// Recorder reacts to live state: it records exactly while the stream is
/// available.
#[async_trait]
impl LiveEventListener for Recorder {
    async fn on_live_began(&self, _live: &Arc<Live>) {
        if self.status() == RunningStatus::Stopped {
            self.set_status(RunningStatus::Waiting);
        }
    }

    async fn on_live_stream_available(&self, _live: &Arc<Live>) {
        self.start_session();
    }

    async fn on_live_stream_reset(&self, _live: &Arc<Live>) {
        // Re-resolve and reconnect; the concat operator stitches the seam.
        self.stop_session().await;
        self.start_session();
    }

    async fn on_live_ended(&self, _live: &Arc<Live>) {
        self.stop_session().await;
        self.set_status(RunningStatus::Waiting);
    }
}

impl RecorderInner {
    fn room_id(&self) -> u64 {
        self.live.room_id()
    }

    async fn run_sessions(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        *self.status.write() = RunningStatus::Recording;
        self.data_counter.reset();
        EventBus::global().publish(Event::RecordingStartedEvent {
            room_id: self.room_id(),
        });

        let mut params = {
            let settings = self.settings.read();
            StreamParams::new(
                settings.recorder.stream_format,
                settings.recorder.quality_number,
            )
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let url = match self.resolver.resolve(params).await {
                Ok(url) => url,
                Err(e) if e.is_terminal() => {
                    warn!(room_id = self.room_id(), "stream unavailable: {e}");
                    ExceptionBus::global().submit("StreamError", e.to_string());
                    break;
                }
                Err(StreamError::NoStreamAvailable { .. }) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    }
                }
                Err(e) => {
                    warn!(room_id = self.room_id(), "stream resolution failed: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    }
                }
            };
            *self.real_quality.write() = Some(params.quality);
            EventBus::global().publish(Event::RealQualityChangedEvent {
                room_id: self.room_id(),
                quality: params.quality,
            });

            let end = match params.format {
                StreamFormat::Flv => self.run_flv_session(&url, &cancel).await,
                StreamFormat::Ts => self.run_hls_session(&url, &cancel, false).await,
                StreamFormat::Fmp4 => self.run_hls_session(&url, &cancel, true).await,
            };

            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Eof => {
                    // The server finished its side; reconnect while live.
                    if !self.live.is_living() {
                        break;
                    }
                    debug!(room_id = self.room_id(), "stream ended, reconnecting");
                }
                SessionEnd::Stalled => {
                    if !self.wait_for_reachability(&cancel).await {
                        break;
                    }
                    EventBus::global().publish(Event::StreamRecordingRecoveredEvent {
                        room_id: self.room_id(),
                        timestamp: chrono::Utc::now().timestamp(),
                    });
                }
                SessionEnd::UrlExpired => {
                    debug!(room_id = self.room_id(), "stream url expired, re-resolving");
                    self.resolver.invalidate().await;
                }
                SessionEnd::Corrupted(detail) => {
                    // Structural stream damage: try the alternative stream,
                    // then the other API platform.
                    warn!(room_id = self.room_id(), "stream corrupted: {detail}");
                    if !params.use_alternative {
                        params.use_alternative = true;
                    } else {
                        params.use_alternative = false;
                        params.platform = params.platform.rotate();
                    }
                    self.resolver.invalidate().await;
                }
                SessionEnd::NoSpace(e) => {
                    ExceptionBus::global().submit("OSError", e.to_string());
                    break;
                }
                SessionEnd::Failed(detail) => {
                    warn!(room_id = self.room_id(), "recording session failed: {detail}");
                    ExceptionBus::global().submit("RecordingError", detail);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }

        let _ = self.danmaku_tx.send(DanmakuItem::Close);
        EventBus::global().publish(Event::RecordingFinishedEvent {
            room_id: self.room_id(),
        });
        *self.status.write() = RunningStatus::Stopped;
    }

    /// Poll the reachability endpoint until the network is back.
    async fn wait_for_reachability(&self, cancel: &tokio_util::sync::CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if self.live.check_connectivity().await {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(REACHABILITY_POLL) => {}
            }
        }
    }

    fn make_session_shared(&self) -> Arc<SessionShared> {
        Arc::new(SessionShared {
            room_id: self.room_id(),
            data_counter: self.data_counter.clone(),
            last_progress: Mutex::new(Instant::now()),
            duration_ms: AtomicU32::new(0),
            latest_metadata: Mutex::new(None),
            latest_join_points: Mutex::new(Vec::new()),
        })
    }

    fn path_context(&self) -> PathContext {
        let room_info = self.live.room_info();
        let user_info = self.live.user_info();
        PathContext {
            room_id: self.room_id(),
            user_name: user_info.map(|u| u.name).unwrap_or_default(),
            title: room_info
                .as_ref()
                .map(|r| r.title.clone())
                .unwrap_or_default(),
            area_name: room_info
                .as_ref()
                .map(|r| r.area_name.clone())
                .unwrap_or_default(),
            parent_area_name: room_info
                .map(|r| r.parent_area_name)
                .unwrap_or_default(),
        }
    }

    /// The extra fields injected into each file's `onMetaData`.
    fn metadata_provider(&self) -> flv_fix::MetadataProvider {
        let room_info = self.live.room_info();
        let user_info = self.live.user_info();
        let room_id = self.room_id();

        Arc::new(move |_old: &[(String, amf0::Amf0Value<'static>)]| {
            let mut pairs: Vec<(String, amf0::Amf0Value<'static>)> = vec![
                (
                    "metadatacreator".to_string(),
                    amf0::Amf0Value::String(
                        format!("birec v{}", env!("CARGO_PKG_VERSION")).into(),
                    ),
                ),
                ("roomid".to_string(), amf0::Amf0Value::Number(room_id as f64)),
            ];
            if let Some(room_info) = &room_info {
                pairs.push((
                    "title".to_string(),
                    amf0::Amf0Value::String(room_info.title.clone().into()),
                ));
                pairs.push((
                    "area".to_string(),
                    amf0::Amf0Value::String(room_info.area_name.clone().into()),
                ));
            }
            if let Some(user_info) = &user_info {
                pairs.push((
                    "streamer".to_string(),
                    amf0::Amf0Value::String(user_info.name.clone().into()),
                ));
            }
            pairs
        })
    }

    fn danmaku_metadata(&self, record_start_time: i64) -> DanmakuMetadata {
        let room_info = self.live.room_info();
        let user_info = self.live.user_info();
        DanmakuMetadata {
            user_name: user_info.map(|u| u.name).unwrap_or_default(),
            room_id: self.room_id(),
            room_title: room_info
                .as_ref()
                .map(|r| r.title.clone())
                .unwrap_or_default(),
            area: room_info
                .as_ref()
                .map(|r| r.area_name.clone())
                .unwrap_or_default(),
            parent_area: room_info
                .as_ref()
                .map(|r| r.parent_area_name.clone())
                .unwrap_or_default(),
            live_start_time: room_info.map(|r| r.live_start_time).unwrap_or_default(),
            record_start_time,
            recorder: format!("birec v{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Handle dump events arriving from the pipeline worker.
    fn handle_dump_event(&self, shared: &SessionShared, event: DumpEvent, save_raw: bool) {
        match event {
            DumpEvent::FileOpened { path, timestamp } => {
                info!(room_id = shared.room_id, path = %path.display(), "video file created");
                EventBus::global().publish(Event::VideoFileCreatedEvent {
                    room_id: shared.room_id,
                    path: path.clone(),
                });
                let _ = self.danmaku_tx.send(DanmakuItem::Open {
                    video_path: path.clone(),
                    metadata: self.danmaku_metadata(timestamp),
                    save_raw,
                });
                self.maybe_save_cover(&path);
            }
            DumpEvent::FileClosed { path } => {
                info!(room_id = shared.room_id, path = %path.display(), "video file completed");
                let _ = self.danmaku_tx.send(DanmakuItem::Close);

                let meta_path = self.write_meta_sidecar(shared, &path);
                EventBus::global().publish(Event::VideoFileCompletedEvent {
                    room_id: shared.room_id,
                    path: path.clone(),
                });
                let _ = self.artifact_tx.send(RecordingArtifact {
                    room_id: shared.room_id,
                    video_path: path,
                    meta_path,
                });
            }
            DumpEvent::SizeUpdated { bytes } => {
                shared.data_counter.set(bytes);
                *shared.last_progress.lock() = Instant::now();
            }
            DumpEvent::TimestampUpdated { timestamp_ms } => {
                shared.duration_ms.store(timestamp_ms, Ordering::Relaxed);
                *shared.last_progress.lock() = Instant::now();
            }
        }
    }

    /// Dump the analysed metadata and join points next to the video file.
    fn write_meta_sidecar(&self, shared: &SessionShared, video_path: &std::path::Path) -> Option<PathBuf> {
        let metadata = shared.latest_metadata.lock().clone();
        let join_points = shared.latest_join_points.lock().clone();

        let sidecar = serde_json::json!({
            "metadata": metadata,
            "joinpoints": join_points,
        });
        let meta_path = video_path.with_extension("meta.json");
        match std::fs::write(&meta_path, serde_json::to_vec_pretty(&sidecar).ok()?) {
            Ok(()) => Some(meta_path),
            Err(e) => {
                warn!(room_id = shared.room_id, "failed to write meta sidecar: {e}");
                None
            }
        }
    }

    fn maybe_save_cover(&self, video_path: &std::path::Path) {
        let save_cover = self.settings.read().recorder.save_cover;
        if !save_cover {
            return;
        }
        let Some(room_info) = self.live.room_info() else {
            return;
        };
        if room_info.cover.is_empty() {
            return;
        }
        let client = self.live.client();
        let cover_url = room_info.cover.clone();
        let extension = cover_url
            .rsplit('.')
            .next()
            .filter(|ext| matches!(*ext, "jpg" | "jpeg" | "png"))
            .unwrap_or("jpg")
            .to_string();
        let path = video_path.with_extension(extension);

        tokio::spawn(async move {
            match client.get(&cover_url).send().await {
                Ok(response) => match response.bytes().await {
                    Ok(bytes) => {
                        if let Err(e) = tokio::fs::write(&path, &bytes).await {
                            warn!("failed to save cover: {e}");
                        }
                    }
                    Err(e) => warn!("failed to download cover: {e}"),
                },
                Err(e) => warn!("failed to download cover: {e}"),
            }
        });
    }

    /// Watch for stalled downloads: no dumper progress within the
    /// disconnection timeout interrupts the session.
    async fn watchdog(
        &self,
        shared: Arc<SessionShared>,
        session_cancel: tokio_util::sync::CancellationToken,
    ) -> SessionEnd {
        let timeout = Duration::from_secs(self.settings.read().recorder.disconnection_timeout);
        loop {
            tokio::select! {
                _ = session_cancel.cancelled() => return SessionEnd::Cancelled,
                _ = tokio::time::sleep(WATCHDOG_TICK) => {}
            }
            let stalled_for = shared.last_progress.lock().elapsed();
            if stalled_for >= timeout {
                let duration = shared.duration_ms.load(Ordering::Relaxed) as f64 / 1000.0;
                warn!(
                    room_id = shared.room_id,
                    ?stalled_for,
                    "no data produced, interrupting recording"
                );
                EventBus::global().publish(Event::StreamRecordingInterruptedEvent {
                    room_id: shared.room_id,
                    duration,
                });
                session_cancel.cancel();
                return SessionEnd::Stalled;
            }
        }
    }

    async fn run_flv_session(
        self: &Arc<Self>,
        url: &str,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> SessionEnd {
        let headers = self.live.headers();
        let response = match self
            .live
            .client()
            .get(url)
            .header(reqwest::header::USER_AGENT, &headers.user_agent)
            .header(reqwest::header::REFERER, &headers.referer)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return SessionEnd::Failed(format!("stream request failed: {e}")),
        };

        match response.status().as_u16() {
            200 => {}
            403 | 404 => return SessionEnd::UrlExpired,
            status => return SessionEnd::Failed(format!("stream answered HTTP {status}")),
        }

        let shared = self.make_session_shared();
        let session_cancel = cancel.child_token();

        // Network bytes flow through a bounded bridge into the blocking
        // pipeline worker; dropping the sender unblocks the reader.
        let (bytes_tx, bytes_rx) = std::sync::mpsc::sync_channel::<Bytes>(64);
        let (dump_tx, mut dump_rx) = mpsc::unbounded_channel::<DumpEvent>();

        let pipeline_token = CancellationToken::new();
        let worker = self.spawn_flv_worker(
            shared.clone(),
            bytes_rx,
            dump_tx,
            pipeline_token.clone(),
        );

        // Forward dump events on the async side.
        let forwarder = {
            let inner = self.clone();
            let shared = shared.clone();
            let save_raw = self.settings.read().danmaku.save_raw_danmaku;
            tokio::spawn(async move {
                while let Some(event) = dump_rx.recv().await {
                    inner.handle_dump_event(&shared, event, save_raw);
                }
            })
        };

        let watchdog = {
            let inner = self.clone();
            let shared = shared.clone();
            let session_cancel = session_cancel.clone();
            tokio::spawn(async move { inner.watchdog(shared, session_cancel).await })
        };

        // Shovel the HTTP body.
        let mut stream = response.bytes_stream();
        let download_end = loop {
            tokio::select! {
                _ = session_cancel.cancelled() => break None,
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if bytes_tx.send(bytes).is_err() {
                            break None; // worker finished first
                        }
                    }
                    Some(Err(e)) => break Some(format!("download error: {e}")),
                    None => break None, // clean EOF
                },
            }
        };
        drop(bytes_tx);

        let worker_result = worker.await;
        pipeline_token.cancel();
        forwarder.await.ok();
        watchdog.abort();
        let watchdog_result = watchdog.await;

        if let Ok(SessionEnd::Stalled) = watchdog_result {
            return SessionEnd::Stalled;
        }
        if cancel.is_cancelled() {
            return SessionEnd::Cancelled;
        }
        if let Some(detail) = download_end {
            return SessionEnd::Failed(detail);
        }
        match worker_result {
            Ok(end) => end,
            Err(e) => SessionEnd::Failed(format!("pipeline worker panicked: {e}")),
        }
    }

    /// Run the repair chain over the byte bridge on a blocking thread.
    fn spawn_flv_worker(
        self: &Arc<Self>,
        shared: Arc<SessionShared>,
        bytes_rx: std::sync::mpsc::Receiver<Bytes>,
        dump_tx: mpsc::UnboundedSender<DumpEvent>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<SessionEnd> {
        let settings = self.settings.read().clone();
        let context = StreamerContext::arc_new(format!("room {}", self.room_id()), token);
        let cut_handle = self.cut_handle.clone();
        let metadata_provider = self.metadata_provider();
        let path_context = self.path_context();
        let inner = self.clone();

        let out_dir = settings.output.out_dir.clone();
        let template = settings.output.path_template.clone();
        let path_provider: flv_fix::PathProvider = Box::new(move || {
            let now = chrono::Local::now();
            let path = build_output_path(&out_dir, &template, &path_context, now, "flv")
                .unwrap_or_else(|e| {
                    warn!("path template failed ({e}), falling back to room id");
                    out_dir.join(format!(
                        "{}_{}.flv",
                        path_context.room_id,
                        now.format("%Y%m%d_%H%M%S")
                    ))
                });
            (path, now.timestamp())
        });

        let metadata_shared = shared.clone();
        let join_point_shared = shared.clone();
        let profile_inner = inner.clone();
        let sinks = FlvPipelineSinks {
            metadata: Box::new(move |meta| {
                *metadata_shared.latest_metadata.lock() = meta;
            }),
            duration: None,
            join_points: Box::new(move |points| {
                *join_point_shared.latest_join_points.lock() = points;
            }),
            profile: Arc::new(move |profile| {
                *profile_inner.stream_profile.write() = Some(profile);
            }),
            dump_events: Arc::new(move |event| {
                let _ = dump_tx.send(event);
            }),
        };

        let pipeline_config = FlvPipelineConfig {
            filesize_limit: settings.output.filesize_limit,
            duration_limit: settings.output.duration_limit,
            buffer_size: settings.recorder.buffer_size,
        };

        tokio::task::spawn_blocking(move || {
            let pipeline = flv_fix::build_pipeline(
                context,
                pipeline_config,
                cut_handle,
                metadata_provider,
                path_provider,
                sinks,
            );

            let reader = ChannelReader::new(bytes_rx);
            let parser = flv::FlvStreamParser::new(reader);
            let source = parser.map(|item| item.map_err(PipelineError::source));

            let mut sink_error: Option<PipelineError> = None;
            let mut sink = |item: Result<FlvData, PipelineError>| {
                if let Err(e) = item {
                    sink_error.get_or_insert(e);
                }
            };

            let run_result = pipeline.run(source, &mut sink);
            classify_pipeline_end(run_result, sink_error, &shared)
        })
    }

    async fn run_hls_session(
        self: &Arc<Self>,
        url: &str,
        cancel: &tokio_util::sync::CancellationToken,
        raw: bool,
    ) -> SessionEnd {
        let Ok(playlist_url) = url::Url::parse(url) else {
            return SessionEnd::Failed(format!("invalid playlist url: {url}"));
        };

        let shared = self.make_session_shared();
        let session_cancel = cancel.child_token();
        let headers = self.live.headers();

        let (segments_tx, segments_rx) = mpsc::channel(hls::SEGMENT_QUEUE_SIZE);
        let (data_tx, data_rx) = mpsc::channel(hls::SEGMENT_DATA_QUEUE_SIZE);

        let playlist_task = tokio::spawn(hls::run_playlist_fetcher(
            self.live.client(),
            playlist_url,
            headers.user_agent.clone(),
            segments_tx,
            session_cancel.clone(),
        ));
        let fetcher_task = tokio::spawn(hls::run_segment_fetcher(
            self.live.client(),
            headers.user_agent.clone(),
            segments_rx,
            data_tx,
            session_cancel.clone(),
        ));

        let watchdog = {
            let inner = self.clone();
            let shared = shared.clone();
            let session_cancel = session_cancel.clone();
            tokio::spawn(async move { inner.watchdog(shared, session_cancel).await })
        };

        let end = if raw {
            self.run_hls_raw_output(shared.clone(), data_rx, &session_cancel)
                .await
        } else {
            self.run_hls_remux_output(shared.clone(), data_rx, &session_cancel)
                .await
        };

        session_cancel.cancel();
        playlist_task.abort();
        fetcher_task.abort();
        let _ = playlist_task.await;
        let _ = fetcher_task.await;
        watchdog.abort();
        if let Ok(SessionEnd::Stalled) = watchdog.await {
            return SessionEnd::Stalled;
        }
        if cancel.is_cancelled() {
            return SessionEnd::Cancelled;
        }
        end
    }

    /// Raw mode: segments and a local playlist in a per-recording directory.
    async fn run_hls_raw_output(
        self: &Arc<Self>,
        shared: Arc<SessionShared>,
        mut data_rx: mpsc::Receiver<hls::SegmentData>,
        session_cancel: &tokio_util::sync::CancellationToken,
    ) -> SessionEnd {
        let settings = self.settings.read().clone();
        let now = chrono::Local::now();
        let out_dir = match build_output_path(
            &settings.output.out_dir,
            &settings.output.path_template,
            &self.path_context(),
            now,
            "hls",
        ) {
            Ok(path) => path.with_extension(""),
            Err(e) => return SessionEnd::Failed(format!("path template failed: {e}")),
        };

        let mut dumper = match hls::SegmentDumper::new(&out_dir) {
            Ok(dumper) => dumper,
            Err(e) => return SessionEnd::Failed(format!("cannot create output dir: {e}")),
        };
        let playlist_path = dumper.playlist_path().to_path_buf();

        self.handle_dump_event(
            &shared,
            DumpEvent::FileOpened {
                path: playlist_path.clone(),
                timestamp: now.timestamp(),
            },
            settings.danmaku.save_raw_danmaku,
        );

        let mut total_bytes: u64 = 0;
        let end = loop {
            let data = tokio::select! {
                _ = session_cancel.cancelled() => break SessionEnd::Cancelled,
                data = data_rx.recv() => match data {
                    Some(data) => data,
                    None => break SessionEnd::Eof,
                },
            };

            let size = match &data {
                hls::SegmentData::InitSection { payload, .. } => payload.len(),
                hls::SegmentData::Segment { payload, .. } => payload.len(),
            };
            if let Err(e) = dumper.handle(&data) {
                if let hls::HlsError::Io(io_err) = &e {
                    if io_err.raw_os_error() == Some(28) {
                        break SessionEnd::NoSpace(std::io::Error::other(e.to_string()));
                    }
                }
                break SessionEnd::Failed(e.to_string());
            }
            total_bytes += size as u64;
            self.handle_dump_event(
                &shared,
                DumpEvent::SizeUpdated { bytes: total_bytes },
                settings.danmaku.save_raw_danmaku,
            );
        };

        dumper.finish().ok();
        self.handle_dump_event(
            &shared,
            DumpEvent::FileClosed {
                path: playlist_path,
            },
            settings.danmaku.save_raw_danmaku,
        );
        end
    }

    /// Remuxed mode: segments become FLV and feed the normal repair chain.
    async fn run_hls_remux_output(
        self: &Arc<Self>,
        shared: Arc<SessionShared>,
        data_rx: mpsc::Receiver<hls::SegmentData>,
        session_cancel: &tokio_util::sync::CancellationToken,
    ) -> SessionEnd {
        let (flv_tx, flv_rx) = mpsc::channel::<FlvData>(64);
        let (dump_tx, mut dump_rx) = mpsc::unbounded_channel::<DumpEvent>();

        let remux_task = tokio::spawn(hls::run_segment_remuxer(
            data_rx,
            flv_tx,
            session_cancel.clone(),
        ));

        let pipeline_token = CancellationToken::new();
        let worker = self.spawn_hls_pipeline_worker(shared.clone(), flv_rx, dump_tx, pipeline_token.clone());

        let forwarder = {
            let inner = self.clone();
            let shared = shared.clone();
            let save_raw = self.settings.read().danmaku.save_raw_danmaku;
            tokio::spawn(async move {
                while let Some(event) = dump_rx.recv().await {
                    inner.handle_dump_event(&shared, event, save_raw);
                }
            })
        };

        let remux_end = remux_task.await;
        let worker_result = worker.await;
        pipeline_token.cancel();
        forwarder.await.ok();

        if session_cancel.is_cancelled() {
            return SessionEnd::Cancelled;
        }
        match worker_result {
            Ok(end @ (SessionEnd::NoSpace(_) | SessionEnd::Corrupted(_))) => return end,
            Err(e) => return SessionEnd::Failed(format!("pipeline worker panicked: {e}")),
            Ok(_) => {}
        }
        match remux_end {
            Ok(Ok(())) => SessionEnd::Eof,
            Ok(Err(hls::HlsError::Cancelled)) => SessionEnd::Cancelled,
            Ok(Err(e)) => SessionEnd::Failed(e.to_string()),
            Err(e) => SessionEnd::Failed(format!("remuxer panicked: {e}")),
        }
    }

    fn spawn_hls_pipeline_worker(
        self: &Arc<Self>,
        shared: Arc<SessionShared>,
        mut flv_rx: mpsc::Receiver<FlvData>,
        dump_tx: mpsc::UnboundedSender<DumpEvent>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<SessionEnd> {
        let settings = self.settings.read().clone();
        let context = StreamerContext::arc_new(format!("room {}", self.room_id()), token);
        let cut_handle = self.cut_handle.clone();
        let metadata_provider = self.metadata_provider();
        let path_context = self.path_context();

        let out_dir = settings.output.out_dir.clone();
        let template = settings.output.path_template.clone();
        let path_provider: flv_fix::PathProvider = Box::new(move || {
            let now = chrono::Local::now();
            let path = build_output_path(&out_dir, &template, &path_context, now, "flv")
                .unwrap_or_else(|_| {
                    out_dir.join(format!(
                        "{}_{}.flv",
                        path_context.room_id,
                        now.format("%Y%m%d_%H%M%S")
                    ))
                });
            (path, now.timestamp())
        });

        let metadata_shared = shared.clone();
        let join_point_shared = shared.clone();
        let profile_inner = self.clone();
        let sinks = FlvPipelineSinks {
            metadata: Box::new(move |meta| {
                *metadata_shared.latest_metadata.lock() = meta;
            }),
            duration: None,
            join_points: Box::new(move |points| {
                *join_point_shared.latest_join_points.lock() = points;
            }),
            profile: Arc::new(move |profile| {
                *profile_inner.stream_profile.write() = Some(profile);
            }),
            dump_events: Arc::new(move |event| {
                let _ = dump_tx.send(event);
            }),
        };

        let pipeline_config = FlvPipelineConfig {
            filesize_limit: settings.output.filesize_limit,
            duration_limit: settings.output.duration_limit,
            buffer_size: settings.recorder.buffer_size,
        };

        tokio::task::spawn_blocking(move || {
            let pipeline = flv_fix::build_pipeline(
                context,
                pipeline_config,
                cut_handle,
                metadata_provider,
                path_provider,
                sinks,
            );

            let source = std::iter::from_fn(move || flv_rx.blocking_recv().map(Ok));

            let mut sink_error: Option<PipelineError> = None;
            let mut sink = |item: Result<FlvData, PipelineError>| {
                if let Err(e) = item {
                    sink_error.get_or_insert(e);
                }
            };

            let run_result = pipeline.run(source, &mut sink);
            classify_pipeline_end(run_result, sink_error, &shared)
        })
    }
}

/// Map how a pipeline run ended onto the recorder's error taxonomy.
fn classify_pipeline_end(
    run_result: Result<(), PipelineError>,
    sink_error: Option<PipelineError>,
    shared: &SessionShared,
) -> SessionEnd {
    let error = match run_result {
        Ok(()) => sink_error,
        Err(e) => Some(e),
    };
    match error {
        None => SessionEnd::Eof,
        Some(PipelineError::Cancelled) => SessionEnd::Cancelled,
        Some(PipelineError::Io(e)) if e.raw_os_error() == Some(28) => SessionEnd::NoSpace(e),
        Some(PipelineError::Source(e)) => {
            // Upstream FLV parse failures mean the stream bytes are broken.
            debug!(room_id = shared.room_id, "source error: {e}");
            SessionEnd::Corrupted(e.to_string())
        }
        Some(e) => SessionEnd::Failed(e.to_string()),
    }
}

/// A blocking `Read` over a channel of byte chunks.
struct ChannelReader {
    rx: std::sync::mpsc::Receiver<Bytes>,
    current: Bytes,
    offset: usize,
}

impl ChannelReader {
    fn new(rx: std::sync::mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
            offset: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.offset >= self.current.len() {
            match self.rx.recv() {
                Ok(bytes) => {
                    self.current = bytes;
                    self.offset = 0;
                }
                Err(_) => return Ok(0), // sender gone: EOF
            }
        }
        let available = &self.current[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_reader_concatenates_chunks() {
        let (tx, rx) = std::sync::mpsc::sync_channel(4);
        tx.send(Bytes::from_static(b"hello ")).unwrap();
        tx.send(Bytes::from_static(b"world")).unwrap();
        drop(tx);

        let mut reader = ChannelReader::new(rx);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_channel_reader_eof_on_sender_drop() {
        let (tx, rx) = std::sync::mpsc::sync_channel::<Bytes>(1);
        drop(tx);
        let mut reader = ChannelReader::new(rx);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
