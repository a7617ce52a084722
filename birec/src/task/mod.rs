//! Per-room task supervision.
//!
//! A [`Task`] composes everything one room needs: the shared `Live` state,
//! the chat client, the live monitor, the recorder and the postprocessor.
//! The [`TaskManager`] keys tasks by real room id (short ids are resolved
//! before insertion) and fans setting changes out to them.

mod manager;

use std::sync::Arc;
use std::time::Duration;

use bili::{DanmakuClient, Live, LiveEventListener, LiveMonitor, RoomInfo};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::statistics::RateCounter;
use crate::core::{Recorder, RecordingArtifact, RunningStatus};
use crate::danmaku::receiver::{DanmakuDumpTask, DanmakuItem, DanmakuReceiver};
use crate::event::{Event, EventBus};
use crate::postprocess::{PostprocessContext, Postprocessor};
use crate::setting::{DanmakuSettings, QualityNumber, ResolvedTaskSettings};

pub use manager::TaskManager;

/// The status view served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub room_id: u64,
    pub monitor_enabled: bool,
    pub recorder_enabled: bool,
    pub running_status: RunningStatus,
    /// Seconds since the current recording session produced its first data.
    pub elapsed: f64,
    pub data_count: u64,
    pub data_rate: f64,
    pub danmu_count: u64,
    pub danmu_rate: f64,
    pub real_quality: Option<QualityNumber>,
    pub room_info: Option<RoomInfo>,
    pub user_name: Option<String>,
    pub postprocessing_path: Option<std::path::PathBuf>,
    pub postprocessing_progress: Option<f64>,
}

/// Publishes domain events for monitor transitions.
struct MonitorEventForwarder {
    room_id: u64,
}

#[async_trait::async_trait]
impl LiveEventListener for MonitorEventForwarder {
    async fn on_live_began(&self, live: &Arc<Live>) {
        let room_info = live.room_info();
        EventBus::global().publish(Event::LiveBeganEvent {
            room_id: self.room_id,
            title: room_info.map(|r| r.title).unwrap_or_default(),
            user_name: live.user_info().map(|u| u.name).unwrap_or_default(),
        });
    }

    async fn on_live_ended(&self, live: &Arc<Live>) {
        let room_info = live.room_info();
        EventBus::global().publish(Event::LiveEndedEvent {
            room_id: self.room_id,
            title: room_info.map(|r| r.title).unwrap_or_default(),
            user_name: live.user_info().map(|u| u.name).unwrap_or_default(),
        });
    }

    async fn on_room_changed(&self, room_info: &RoomInfo) {
        EventBus::global().publish(Event::RoomChangeEvent {
            room_id: self.room_id,
            title: room_info.title.clone(),
            area_name: room_info.area_name.clone(),
            parent_area_name: room_info.parent_area_name.clone(),
        });
    }
}

pub struct Task {
    room_id: u64,
    live: Arc<Live>,
    danmaku_client: Arc<DanmakuClient>,
    monitor: Arc<LiveMonitor>,
    recorder: Arc<Recorder>,
    postprocessor: Arc<Postprocessor>,
    settings: RwLock<ResolvedTaskSettings>,

    monitor_enabled: RwLock<bool>,
    recorder_enabled: RwLock<bool>,

    danmu_counter: Arc<RateCounter>,
    danmaku_settings: Arc<RwLock<DanmakuSettings>>,
    recorder_listener: Arc<dyn LiveEventListener>,
    forwarder_listener: Arc<dyn LiveEventListener>,
    danmaku_receiver: Arc<DanmakuReceiver>,
    monitor_as_listener: Arc<dyn bili::DanmakuListener>,

    danmaku_task: RwLock<Option<tokio::task::JoinHandle<()>>>,
    postprocess_task: RwLock<Option<tokio::task::JoinHandle<()>>>,
    postprocess_cancel: RwLock<Option<CancellationToken>>,
    session_started: RwLock<Option<std::time::Instant>>,
}

impl Task {
    /// Build the component graph for one room. The room id must already be
    /// the real one.
    pub async fn new(settings: ResolvedTaskSettings) -> Arc<Self> {
        let room_id = settings.room_id;
        let live = Live::new(room_id, &settings.header.user_agent, &settings.header.cookie);
        live.set_host_prefs(settings.recorder.stream_host_prefs.clone());

        let danmaku_client = Arc::new(DanmakuClient::new(live.clone()));
        let monitor = LiveMonitor::new(live.clone());

        let danmu_counter = RateCounter::new();
        let danmaku_settings = Arc::new(RwLock::new(settings.danmaku.clone()));
        let (danmaku_tx, danmaku_rx) = mpsc::unbounded_channel::<DanmakuItem>();
        let danmaku_receiver = DanmakuReceiver::new(danmaku_tx.clone(), danmu_counter.clone());

        let (artifact_tx, artifact_rx) = mpsc::unbounded_channel::<RecordingArtifact>();
        let recorder = Arc::new(Recorder::new(
            live.clone(),
            settings.clone(),
            danmaku_tx,
            artifact_tx,
        ));

        let postprocess_live = live.clone();
        let postprocessor = Postprocessor::new(
            room_id,
            settings.postprocessing.clone(),
            recorder.clone(),
            move || {
                let room_info = postprocess_live.room_info();
                let user_info = postprocess_live.user_info();
                PostprocessContext {
                    title: room_info.as_ref().map(|r| r.title.clone()).unwrap_or_default(),
                    artist: user_info.map(|u| u.name).unwrap_or_default(),
                    date: chrono::Local::now().to_rfc3339(),
                    description: room_info.map(|r| r.description).unwrap_or_default(),
                }
            },
        );

        let task = Arc::new(Self {
            room_id,
            live,
            danmaku_client,
            monitor: monitor.clone(),
            recorder: recorder.clone(),
            postprocessor,
            settings: RwLock::new(settings.clone()),
            monitor_enabled: RwLock::new(false),
            recorder_enabled: RwLock::new(false),
            danmu_counter,
            danmaku_settings: danmaku_settings.clone(),
            recorder_listener: recorder.clone() as Arc<dyn LiveEventListener>,
            forwarder_listener: Arc::new(MonitorEventForwarder { room_id }),
            danmaku_receiver,
            monitor_as_listener: monitor as Arc<dyn bili::DanmakuListener>,
            danmaku_task: RwLock::new(None),
            postprocess_task: RwLock::new(None),
            postprocess_cancel: RwLock::new(None),
            session_started: RwLock::new(None),
        });

        // The danmaku dump task lives as long as the task itself.
        let dump_task = DanmakuDumpTask::new(room_id, danmaku_settings);
        *task.danmaku_task.write() = Some(tokio::spawn(dump_task.run(danmaku_rx)));

        // Keep the artifact receiver alive until the recorder is enabled.
        task.spawn_postprocessor(artifact_rx);

        task
    }

    fn spawn_postprocessor(&self, artifact_rx: mpsc::UnboundedReceiver<RecordingArtifact>) {
        let cancel = CancellationToken::new();
        *self.postprocess_cancel.write() = Some(cancel.clone());
        *self.postprocess_task.write() =
            Some(tokio::spawn(self.postprocessor.clone().run(artifact_rx, cancel)));
    }

    pub fn room_id(&self) -> u64 {
        self.room_id
    }

    pub fn live(&self) -> Arc<Live> {
        self.live.clone()
    }

    pub fn monitor_enabled(&self) -> bool {
        *self.monitor_enabled.read()
    }

    pub fn recorder_enabled(&self) -> bool {
        *self.recorder_enabled.read()
    }

    /// Start the chat client and live monitor.
    pub async fn enable_monitor(&self) {
        if std::mem::replace(&mut *self.monitor_enabled.write(), true) {
            return;
        }
        if let Err(e) = self.live.init().await {
            warn!(room_id = self.room_id, "failed to init live info: {e}");
        }
        self.monitor.init_status();
        self.monitor.add_listener(self.forwarder_listener.clone());
        self.danmaku_client
            .add_listener(self.monitor_as_listener.clone());
        self.danmaku_client
            .add_listener(self.danmaku_receiver.clone() as Arc<dyn bili::DanmakuListener>);
        self.danmaku_client.start();
        info!(room_id = self.room_id, "monitor enabled");
    }

    pub async fn disable_monitor(&self) {
        if !std::mem::replace(&mut *self.monitor_enabled.write(), false) {
            return;
        }
        self.danmaku_client.stop().await;
        self.danmaku_client
            .remove_listener(&self.monitor_as_listener);
        self.danmaku_client.remove_listener(
            &(self.danmaku_receiver.clone() as Arc<dyn bili::DanmakuListener>),
        );
        self.monitor.remove_listener(&self.forwarder_listener);
        info!(room_id = self.room_id, "monitor disabled");
    }

    /// Arm the recorder: it starts recording at the next stream-available
    /// event, or immediately when the room is already live.
    pub async fn enable_recorder(&self) {
        if std::mem::replace(&mut *self.recorder_enabled.write(), true) {
            return;
        }
        self.monitor.add_listener(self.recorder_listener.clone());
        self.recorder.set_status(RunningStatus::Waiting);
        *self.session_started.write() = Some(std::time::Instant::now());

        if self.live.is_living() {
            self.recorder.start_session();
        }
        info!(room_id = self.room_id, "recorder enabled");
    }

    /// Stop recording. Graceful disable waits for queued postprocessing;
    /// force cancels it.
    pub async fn disable_recorder(&self, force: bool) {
        if !std::mem::replace(&mut *self.recorder_enabled.write(), false) {
            return;
        }
        self.monitor.remove_listener(&self.recorder_listener);
        self.recorder.stop_session().await;

        if force {
            if let Some(cancel) = self.postprocess_cancel.read().clone() {
                cancel.cancel();
            }
            EventBus::global().publish(Event::RecordingCancelledEvent {
                room_id: self.room_id,
            });
        } else {
            // Graceful: wait until the postprocessor has drained its queue.
            let deadline = std::time::Instant::now() + Duration::from_secs(3600);
            while self.postprocessor.progress().is_some()
                && std::time::Instant::now() < deadline
            {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
        *self.session_started.write() = None;
        info!(room_id = self.room_id, force, "recorder disabled");
    }

    /// Request a file cut; refused while the current file is too short.
    pub fn cut_stream(&self) -> bool {
        self.recorder.cut_handle().cut_stream()
    }

    pub fn update_settings(&self, settings: ResolvedTaskSettings) {
        let previous = self.settings.read().clone();

        // The shared HTTP session is only rebuilt when the identity headers
        // actually changed.
        if previous.header != settings.header {
            debug!(room_id = self.room_id, "applying new header settings");
            self.live
                .set_headers(&settings.header.user_agent, &settings.header.cookie);
        }

        self.recorder.update_settings(settings.clone());
        self.postprocessor
            .update_settings(settings.postprocessing.clone());
        *self.danmaku_settings.write() = settings.danmaku.clone();
        *self.settings.write() = settings;
    }

    pub fn status(&self) -> TaskStatus {
        let (postprocessing_path, postprocessing_progress) =
            match self.postprocessor.progress() {
                Some((path, progress)) => (Some(path), Some(progress)),
                None => (None, None),
            };

        TaskStatus {
            room_id: self.room_id,
            monitor_enabled: self.monitor_enabled(),
            recorder_enabled: self.recorder_enabled(),
            running_status: self.recorder.status(),
            elapsed: self
                .session_started
                .read()
                .map(|started| started.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            data_count: self.recorder.data_counter().count(),
            data_rate: self.recorder.data_counter().rate(),
            danmu_count: self.danmu_counter.count(),
            danmu_rate: self.danmu_counter.rate(),
            real_quality: self.recorder.real_quality(),
            room_info: self.live.room_info(),
            user_name: self.live.user_info().map(|u| u.name),
            postprocessing_path,
            postprocessing_progress,
        }
    }

    /// Tear the task down completely.
    pub async fn destroy(&self) {
        self.disable_recorder(true).await;
        self.disable_monitor().await;
        if let Some(task) = self.postprocess_task.write().take() {
            task.abort();
        }
        if let Some(task) = self.danmaku_task.write().take() {
            task.abort();
        }
        info!(room_id = self.room_id, "task destroyed");
    }
}
