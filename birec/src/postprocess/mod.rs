//! Post-recording processing.
//!
//! Every completed video file is validated, then either remuxed to MP4
//! (with generated ffmetadata: stream info, join-point comment, chapters at
//! non-seamless seams) or gets its final metadata injected in place. With
//! the `auto` delete strategy the FLV source and its `.meta.json` sidecar
//! are removed after a successful remux.

mod ffmetadata;
mod remux;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use flv_fix::{JoinPoint, MetaData};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::{Recorder, RecordingArtifact, RunningStatus};
use crate::event::{Event, EventBus, ExceptionBus};
use crate::setting::{DeleteStrategy, PostprocessingSettings};

pub use ffmetadata::make_ffmetadata;
pub use remux::{RemuxOutcome, remux_to_mp4};

/// The sidecar layout written by the recorder.
#[derive(Debug, Clone, Default, Deserialize)]
struct MetaSidecar {
    metadata: Option<MetaData>,
    #[serde(default)]
    joinpoints: Vec<JoinPoint>,
}

fn load_sidecar(meta_path: Option<&Path>) -> MetaSidecar {
    let Some(path) = meta_path else {
        return MetaSidecar::default();
    };
    std::fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

/// Extra context rendered into the MP4 metadata.
#[derive(Debug, Clone, Default)]
pub struct PostprocessContext {
    pub title: String,
    pub artist: String,
    pub date: String,
    pub description: String,
}

pub struct Postprocessor {
    room_id: u64,
    settings: RwLock<PostprocessingSettings>,
    recorder: Arc<Recorder>,
    context_provider: Box<dyn Fn() -> PostprocessContext + Send + Sync>,
    progress: Arc<RwLock<Option<(PathBuf, f64)>>>,
}

impl Postprocessor {
    pub fn new(
        room_id: u64,
        settings: PostprocessingSettings,
        recorder: Arc<Recorder>,
        context_provider: impl Fn() -> PostprocessContext + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            room_id,
            settings: RwLock::new(settings),
            recorder,
            context_provider: Box::new(context_provider),
            progress: Arc::new(RwLock::new(None)),
        })
    }

    pub fn update_settings(&self, settings: PostprocessingSettings) {
        *self.settings.write() = settings;
    }

    /// Path and completion of the file currently being processed.
    pub fn progress(&self) -> Option<(PathBuf, f64)> {
        self.progress.read().clone()
    }

    /// Drain the artifact queue until it closes or processing is cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut artifacts: mpsc::UnboundedReceiver<RecordingArtifact>,
        cancel: CancellationToken,
    ) {
        loop {
            let artifact = tokio::select! {
                _ = cancel.cancelled() => break,
                artifact = artifacts.recv() => match artifact {
                    Some(artifact) => artifact,
                    None => break,
                },
            };
            self.process(artifact).await;
        }
    }

    async fn process(&self, artifact: RecordingArtifact) {
        // Raw HLS recordings (local playlists) are left as they are.
        if artifact
            .video_path
            .extension()
            .is_some_and(|ext| ext == "m3u8")
        {
            return;
        }

        let settings = self.settings.read().clone();
        let sidecar = load_sidecar(artifact.meta_path.as_deref());

        // Files too broken for playback are discarded together with their
        // sidecars.
        match flv_fix::script_modifier::is_playable_file(&artifact.video_path) {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    room_id = self.room_id,
                    path = %artifact.video_path.display(),
                    "recording unplayable, discarding"
                );
                discard_with_siblings(&artifact.video_path);
                return;
            }
            Err(e) => {
                ExceptionBus::global().submit("PostprocessError", e.to_string());
                return;
            }
        }

        let result = if settings.remux_to_mp4 {
            self.recorder.set_status(RunningStatus::Remuxing);
            self.do_remux(&artifact, &sidecar).await
        } else if settings.inject_extra_metadata {
            self.recorder.set_status(RunningStatus::Injecting);
            self.do_inject(&artifact, &sidecar).await
        } else {
            Ok(artifact.video_path.clone())
        };
        *self.progress.write() = None;
        if self.recorder.status() != RunningStatus::Recording {
            self.recorder.set_status(RunningStatus::Waiting);
        }

        match result {
            Ok(final_path) => {
                if settings.remux_to_mp4
                    && settings.delete_source == DeleteStrategy::Auto
                    && final_path != artifact.video_path
                {
                    delete_source(&artifact.video_path, artifact.meta_path.as_deref());
                }
                EventBus::global().publish(Event::VideoPostprocessingCompletedEvent {
                    room_id: self.room_id,
                    path: final_path,
                });
            }
            Err(e) => {
                ExceptionBus::global().submit("PostprocessError", e);
            }
        }
    }

    async fn do_remux(
        &self,
        artifact: &RecordingArtifact,
        sidecar: &MetaSidecar,
    ) -> Result<PathBuf, String> {
        let context = (self.context_provider)();
        let metadata_text = make_ffmetadata(&context, &sidecar.joinpoints, &sidecar.metadata);

        let out_path = artifact.video_path.with_extension("mp4");
        *self.progress.write() = Some((out_path.clone(), 0.0));

        info!(
            room_id = self.room_id,
            src = %artifact.video_path.display(),
            dst = %out_path.display(),
            "remuxing to mp4"
        );

        let duration = sidecar
            .metadata
            .as_ref()
            .map(|m| m.duration)
            .unwrap_or(0.0);
        let progress = self.progress_sink(out_path.clone(), duration);
        let outcome = remux_to_mp4(&artifact.video_path, &out_path, &metadata_text, progress)
            .await
            .map_err(|e| e.to_string())?;

        match outcome {
            RemuxOutcome::Succeeded => Ok(out_path),
            RemuxOutcome::Warned(detail) => {
                warn!(room_id = self.room_id, "remux finished with warnings: {detail}");
                Ok(out_path)
            }
            RemuxOutcome::Failed(detail) => {
                std::fs::remove_file(&out_path).ok();
                Err(format!("remux failed: {detail}"))
            }
        }
    }

    async fn do_inject(
        &self,
        artifact: &RecordingArtifact,
        sidecar: &MetaSidecar,
    ) -> Result<PathBuf, String> {
        let Some(metadata) = &sidecar.metadata else {
            return Err("no analysed metadata to inject".to_string());
        };
        *self.progress.write() = Some((artifact.video_path.clone(), 0.0));

        let path = artifact.video_path.clone();
        let metadata = metadata.clone();
        let join_points = sidecar.joinpoints.clone();
        tokio::task::spawn_blocking(move || {
            flv_fix::script_modifier::inject_metadata(&path, &metadata, &join_points)
                .map(|_| path)
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    fn progress_sink(&self, path: PathBuf, duration_s: f64) -> impl Fn(f64) + Send + 'static {
        let slot = self.progress.clone();
        move |seconds| {
            let ratio = if duration_s > 0.0 {
                (seconds / duration_s).clamp(0.0, 1.0)
            } else {
                0.0
            };
            *slot.write() = Some((path.clone(), ratio));
        }
    }
}

fn discard_with_siblings(video_path: &Path) {
    for extension in ["flv", "xml", "jsonl", "meta.json", "jpg", "png"] {
        let path = video_path.with_extension(extension);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), "failed to discard file: {e}");
            }
        }
    }
}

fn delete_source(video_path: &Path, meta_path: Option<&Path>) {
    info!(path = %video_path.display(), "deleting remuxed source");
    if let Err(e) = std::fs::remove_file(video_path) {
        warn!("failed to delete source video: {e}");
    }
    if let Some(meta_path) = meta_path {
        if let Err(e) = std::fs::remove_file(meta_path) {
            warn!("failed to delete metadata sidecar: {e}");
        }
    }
}
