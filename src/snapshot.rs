use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use chrono::Local;
use opencv::core::Mat;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::frame::write_jpeg;

pub const LATEST_FRAME_NAME: &str = "latest_frame.jpg";

/// JPEG sink under one `snapshots/` directory (per camera, or the outlet
/// root for aggregator alert frames).
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let root = data_dir.join("snapshots");
        fs::create_dir_all(&root)
            .with_context(|| format!("creating snapshot dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn latest_frame_path(&self) -> PathBuf {
        self.root.join(LATEST_FRAME_NAME)
    }

    pub fn save_latest_frame(&self, frame: &Mat, quality: i32) -> Result<PathBuf> {
        let path = self.latest_frame_path();
        write_jpeg(&path, frame, quality)?;
        Ok(path)
    }

    pub fn save_alert_frame(&self, outlet_id: &str, camera_id: &str, frame: &Mat) -> Result<PathBuf> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let filename = format!("{stamp}_absent_{outlet_id}_{camera_id}.jpg").replace(' ', "_");
        let path = self.root.join(filename);
        write_jpeg(&path, frame, 90)?;
        Ok(path)
    }

    /// Overwrites the rolling best face for a target; rate limiting is the
    /// caller's business.
    pub fn save_latest_face(&self, target_id: &str, face: &Mat) -> Result<PathBuf> {
        let path = self.root.join(format!("latest_{target_id}.jpg"));
        write_jpeg(&path, face, 90)?;
        Ok(path)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub deleted: usize,
    pub freed_bytes: u64,
}

/// Startup sweep: delete any `*/snapshots/*.jpg` under `data_dir` whose mtime
/// is older than the retention window. Zero or negative retention disables
/// the sweep entirely. `now` is epoch seconds.
pub fn sweep_snapshots(data_dir: &Path, retention_days: i64, now: f64) -> SweepStats {
    let mut stats = SweepStats::default();
    if retention_days <= 0 {
        info!("snapshot retention disabled (days <= 0)");
        return stats;
    }
    let retention_secs = retention_days as f64 * 86_400.0;

    for entry in WalkDir::new(data_dir).into_iter().flatten() {
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|e| e.to_str()) != Some("jpg")
            || path.parent().and_then(|p| p.file_name()).and_then(|n| n.to_str())
                != Some("snapshots")
        {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(now);
        if now - mtime <= retention_secs {
            continue;
        }
        match fs::remove_file(path) {
            Ok(()) => {
                stats.deleted += 1;
                stats.freed_bytes += meta.len();
            }
            Err(e) => warn!(file = %path.display(), error = %e, "failed to delete snapshot"),
        }
    }

    if stats.deleted > 0 {
        info!(
            deleted = stats.deleted,
            freed_mb = format!("{:.2}", stats.freed_bytes as f64 / (1024.0 * 1024.0)),
            "snapshot retention sweep done"
        );
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::now_ts;
    use opencv::core::Scalar;
    use tempfile::TempDir;

    fn frame() -> Mat {
        Mat::new_rows_cols_with_default(24, 32, opencv::core::CV_8UC3, Scalar::all(90.0)).unwrap()
    }

    #[test]
    fn alert_frame_filename_shape() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let path = store.save_alert_frame("outlet a", "cam_01", &frame()).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with("_absent_outlet_a_cam_01.jpg"), "got {name}");
        assert!(path.exists());
    }

    #[test]
    fn latest_face_overwrites_in_place() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let first = store.save_latest_face("T1", &frame()).unwrap();
        let second = store.save_latest_face("T1", &frame()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.file_name().unwrap(), "latest_T1.jpg");
    }

    #[test]
    fn sweep_deletes_only_expired_snapshot_jpegs() {
        let dir = TempDir::new().unwrap();
        let snaps = dir.path().join("cam_01/snapshots");
        fs::create_dir_all(&snaps).unwrap();
        fs::write(snaps.join("old.jpg"), b"x").unwrap();
        fs::write(snaps.join("events.jsonl"), b"{}").unwrap();
        fs::write(dir.path().join("cam_01/not_a_snapshot.jpg"), b"x").unwrap();

        // Files were just created; pretend the sweep runs ten days from now.
        let future = now_ts() + 10.0 * 86_400.0;
        let stats = sweep_snapshots(dir.path(), 3, future);
        assert_eq!(stats.deleted, 1);
        assert!(!snaps.join("old.jpg").exists());
        assert!(snaps.join("events.jsonl").exists());
        assert!(dir.path().join("cam_01/not_a_snapshot.jpg").exists());
    }

    #[test]
    fn sweep_disabled_by_non_positive_retention() {
        let dir = TempDir::new().unwrap();
        let snaps = dir.path().join("cam_01/snapshots");
        fs::create_dir_all(&snaps).unwrap();
        fs::write(snaps.join("old.jpg"), b"x").unwrap();

        let future = now_ts() + 100.0 * 86_400.0;
        assert_eq!(sweep_snapshots(dir.path(), 0, future), SweepStats::default());
        assert!(snaps.join("old.jpg").exists());
    }

    #[test]
    fn fresh_files_survive_the_sweep() {
        let dir = TempDir::new().unwrap();
        let snaps = dir.path().join("cam_01/snapshots");
        fs::create_dir_all(&snaps).unwrap();
        fs::write(snaps.join("latest_frame.jpg"), b"x").unwrap();

        let stats = sweep_snapshots(dir.path(), 3, now_ts());
        assert_eq!(stats.deleted, 0);
        assert!(snaps.join("latest_frame.jpg").exists());
    }
}
