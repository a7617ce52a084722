//! Disk-space monitoring and reclaiming.
//!
//! Polls the free space of the disk holding the output directory and
//! publishes `SpaceNoEnoughEvent` when it drops below the threshold. When
//! reclaiming is enabled, recordings older than the retention window are
//! deleted oldest-first; only file types this recorder produces are ever
//! touched.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sysinfo::Disks;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{DiskUsage, Event, EventBus};
use crate::setting::SpaceSettings;

/// File extensions this recorder creates; nothing else may be reclaimed.
const RECLAIMABLE_EXTENSIONS: &[&str] = &[
    "flv", "mp4", "m4s", "m3u8", "xml", "jsonl", "jpg", "png", "json",
];

/// Free/total bytes of the disk containing `path`.
pub fn disk_usage(path: &Path) -> Option<DiskUsage> {
    let canonical = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();

    // The disk with the longest matching mount point owns the path.
    let disk = disks
        .iter()
        .filter(|disk| canonical.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())?;

    let total = disk.total_space();
    let free = disk.available_space();
    Some(DiskUsage {
        total,
        free,
        used: total.saturating_sub(free),
    })
}

pub struct SpaceMonitor {
    out_dir: PathBuf,
    settings: SpaceSettings,
}

impl SpaceMonitor {
    pub fn new(out_dir: PathBuf, settings: SpaceSettings) -> Self {
        Self { out_dir, settings }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.settings.check_interval.max(10));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let Some(usage) = disk_usage(&self.out_dir) else {
                debug!("cannot determine disk usage of {}", self.out_dir.display());
                continue;
            };

            if usage.free < self.settings.space_threshold {
                warn!(
                    free = usage.free,
                    threshold = self.settings.space_threshold,
                    "free disk space below threshold"
                );
                EventBus::global().publish(Event::SpaceNoEnoughEvent {
                    path: self.out_dir.clone(),
                    threshold: self.settings.space_threshold,
                    usage,
                });

                if self.settings.recycle_records > 0 {
                    let out_dir = self.out_dir.clone();
                    let days = self.settings.recycle_records;
                    let reclaimed =
                        tokio::task::spawn_blocking(move || reclaim_space(&out_dir, days))
                            .await
                            .unwrap_or(0);
                    if reclaimed > 0 {
                        info!(reclaimed, "reclaimed bytes by deleting old recordings");
                    }
                }
            }
        }
    }
}

/// Delete recordings older than `days`, oldest first. Returns bytes freed.
pub fn reclaim_space(out_dir: &Path, days: u64) -> u64 {
    let cutoff = SystemTime::now() - Duration::from_secs(days * 24 * 3600);

    let mut candidates: Vec<(SystemTime, PathBuf, u64)> = Vec::new();
    collect_old_files(out_dir, cutoff, &mut candidates);
    candidates.sort_by_key(|(mtime, _, _)| *mtime);

    let mut freed = 0;
    for (_, path, size) in candidates {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "reclaimed old recording");
                freed += size;
            }
            Err(e) => warn!(path = %path.display(), "failed to reclaim: {e}"),
        }
    }
    freed
}

fn collect_old_files(
    dir: &Path,
    cutoff: SystemTime,
    candidates: &mut Vec<(SystemTime, PathBuf, u64)>,
) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_old_files(&path, cutoff, candidates);
            continue;
        }

        let reclaimable = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| RECLAIMABLE_EXTENSIONS.contains(&ext));
        if !reclaimable {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if modified < cutoff {
            candidates.push((modified, path, metadata.len()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reclaim_only_touches_known_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let old = SystemTime::now() - Duration::from_secs(10 * 24 * 3600);

        let video = dir.path().join("video.flv");
        let other = dir.path().join("keep.txt");
        std::fs::write(&video, b"data").unwrap();
        std::fs::write(&other, b"data").unwrap();
        for path in [&video, &other] {
            let file = std::fs::File::options().write(true).open(path).unwrap();
            file.set_times(
                std::fs::FileTimes::new().set_modified(old),
            )
            .unwrap();
        }

        let freed = reclaim_space(dir.path(), 7);
        assert_eq!(freed, 4);
        assert!(!video.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_recent_files_kept() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("video.flv");
        std::fs::write(&video, b"data").unwrap();

        let freed = reclaim_space(dir.path(), 7);
        assert_eq!(freed, 0);
        assert!(video.exists());
    }
}
