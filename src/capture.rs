use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender};
use ndarray::Array3;
use opencv::core::{Mat, Point, Rect, Scalar};
use opencv::imgproc;
use opencv::prelude::*;
use tracing::{debug, info, warn};

use crate::events::now_ts;
use crate::frame::{downscale_to_fit, mat_to_array3, resize_to_width};
use crate::recognition::ResultMsg;
use crate::slot::FrameSlot;
use crate::snapshot::SnapshotStore;
use crate::source::VideoSource;

const IDLE_SLEEP: Duration = Duration::from_millis(50);
const META_ENQUEUE_WAIT: Duration = Duration::from_millis(100);
const FACE_SAVE_MIN_INTERVAL_SEC: f64 = 1.0;

const COLOR_MATCHED: (f64, f64, f64) = (0.0, 255.0, 0.0);
const COLOR_UNMATCHED: (f64, f64, f64) = (0.0, 0.0, 255.0);

/// Hand-off from a capture worker to the recognition worker. The pixel data
/// normally lives in the camera's frame slot; `inline` carries it through the
/// queue when slots are disabled or a slot write was refused.
pub enum MetaMsg {
    Frame {
        camera_id: String,
        frame_id: i64,
        ts: f64,
        inline: Option<Array3<u8>>,
    },
    Stop,
}

#[derive(Debug, Clone)]
pub struct PreviewSettings {
    pub enabled: bool,
    pub interval_sec: f64,
    pub width: u32,
    pub jpeg_quality: i32,
}

pub struct CaptureContext {
    pub camera_id: String,
    pub source: Box<dyn VideoSource>,
    pub slot: Option<Arc<FrameSlot>>,
    pub max_frame_height: u32,
    pub max_frame_width: u32,
    pub meta_tx: Sender<MetaMsg>,
    pub feedback_rx: Receiver<ResultMsg>,
    pub data_dir: PathBuf,
    pub preview: PreviewSettings,
}

pub struct CaptureWorker {
    pub camera_id: String,
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl CaptureWorker {
    pub fn spawn(ctx: CaptureContext) -> Result<Self> {
        let camera_id = ctx.camera_id.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let snapshots = SnapshotStore::new(&ctx.data_dir)?;
        let join = thread::Builder::new()
            .name(format!("capture-{camera_id}"))
            .spawn(move || run_loop(ctx, snapshots, stop_thread))
            .map_err(|e| anyhow!("spawning capture thread: {e}"))?;
        Ok(Self { camera_id, stop, join })
    }

    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.join.join().is_err() {
            warn!(camera_id = %self.camera_id, "capture thread panicked");
        }
    }
}

fn run_loop(mut ctx: CaptureContext, snapshots: SnapshotStore, stop: Arc<AtomicBool>) {
    info!(camera_id = %ctx.camera_id, "capture worker started");
    let mut frame_id: i64 = 0;
    let mut overlay: Option<ResultMsg> = None;
    let mut slot_scale = 1.0f64;
    let mut last_preview_ts = 0.0f64;
    let mut last_face_save: HashMap<String, f64> = HashMap::new();

    while !stop.load(Ordering::Relaxed) {
        let frame = match ctx.source.read_throttled() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(camera_id = %ctx.camera_id, error = %e, "frame read failed");
                None
            }
        };

        // Non-blocking drain; keep only the newest result for this camera.
        let mut fresh_overlay = false;
        while let Ok(res) = ctx.feedback_rx.try_recv() {
            if res.camera_id == ctx.camera_id {
                overlay = Some(res);
                fresh_overlay = true;
            }
        }

        let Some(mut frame) = frame else {
            thread::sleep(IDLE_SLEEP);
            continue;
        };
        frame_id += 1;
        let now = now_ts();

        if let Err(e) = publish_frame(&ctx, &frame, frame_id, now, &mut slot_scale) {
            warn!(camera_id = %ctx.camera_id, error = %e, "frame publish failed");
        }

        let inv_scale = if slot_scale > 0.0 { 1.0 / slot_scale } else { 1.0 };
        if fresh_overlay {
            if let Some(res) = &overlay {
                save_matched_faces(&snapshots, res, &frame, inv_scale, now, &mut last_face_save);
            }
        }

        if let Some(res) = &overlay {
            if let Err(e) = draw_overlay(&mut frame, res, inv_scale) {
                debug!(camera_id = %ctx.camera_id, error = %e, "overlay draw failed");
            }
        }

        if ctx.preview.enabled && now - last_preview_ts > ctx.preview.interval_sec {
            match resize_to_width(&frame, ctx.preview.width)
                .and_then(|small| snapshots.save_latest_frame(&small, ctx.preview.jpeg_quality))
            {
                Ok(_) => last_preview_ts = now,
                Err(e) => debug!(camera_id = %ctx.camera_id, error = %e, "preview save failed"),
            }
        }
    }

    ctx.source.stop();
    info!(camera_id = %ctx.camera_id, "capture worker stopped");
}

/// Downscale to the slot capacity, publish, and enqueue the metadata. A full
/// queue is not an error: the slot already holds the newest frame and the
/// recognition worker reads it whenever it catches up.
fn publish_frame(
    ctx: &CaptureContext,
    frame: &Mat,
    frame_id: i64,
    ts: f64,
    slot_scale: &mut f64,
) -> Result<()> {
    let (scaled, scale) = downscale_to_fit(frame, ctx.max_frame_height, ctx.max_frame_width)?;
    *slot_scale = scale;
    let pixels = mat_to_array3(&scaled)?;

    let inline = match &ctx.slot {
        Some(slot) if slot.write(pixels.view(), frame_id, ts) => None,
        _ => Some(pixels),
    };

    let msg = MetaMsg::Frame { camera_id: ctx.camera_id.clone(), frame_id, ts, inline };
    if ctx.meta_tx.send_timeout(msg, META_ENQUEUE_WAIT).is_err() {
        debug!(camera_id = %ctx.camera_id, frame_id, "metadata queue full, frame dropped");
    }
    Ok(())
}

fn scaled_rect(bbox: [i32; 4], inv_scale: f64, frame: &Mat) -> Option<Rect> {
    let x1 = ((bbox[0] as f64 * inv_scale) as i32).clamp(0, frame.cols() - 1);
    let y1 = ((bbox[1] as f64 * inv_scale) as i32).clamp(0, frame.rows() - 1);
    let x2 = ((bbox[2] as f64 * inv_scale) as i32).clamp(0, frame.cols());
    let y2 = ((bbox[3] as f64 * inv_scale) as i32).clamp(0, frame.rows());
    if x2 - x1 < 2 || y2 - y1 < 2 {
        return None;
    }
    Some(Rect::new(x1, y1, x2 - x1, y2 - y1))
}

fn draw_overlay(frame: &mut Mat, res: &ResultMsg, inv_scale: f64) -> Result<()> {
    for face in &res.faces {
        let Some(rect) = scaled_rect(face.bbox, inv_scale, frame) else {
            continue;
        };
        let (b, g, r) = if face.matched { COLOR_MATCHED } else { COLOR_UNMATCHED };
        let color = Scalar::new(b, g, r, 0.0);
        imgproc::rectangle(frame, rect, color, 2, imgproc::LINE_AA, 0)?;

        let name = face.display_name.as_deref().unwrap_or("UNKNOWN");
        let label = format!("{name} ({:.2})", face.similarity);
        imgproc::put_text(
            frame,
            &label,
            Point::new(rect.x, (rect.y - 10).max(0)),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            color,
            2,
            imgproc::LINE_AA,
            false,
        )?;
    }
    Ok(())
}

fn save_matched_faces(
    snapshots: &SnapshotStore,
    res: &ResultMsg,
    frame: &Mat,
    inv_scale: f64,
    now: f64,
    last_save: &mut HashMap<String, f64>,
) {
    for face in &res.faces {
        let Some(target_id) = face.target_id.as_deref().filter(|_| face.matched) else {
            continue;
        };
        let last = last_save.get(target_id).copied().unwrap_or(0.0);
        if now - last < FACE_SAVE_MIN_INTERVAL_SEC {
            continue;
        }
        let Some(rect) = scaled_rect(face.bbox, inv_scale, frame) else {
            continue;
        };
        let crop = match Mat::roi(frame, rect).and_then(|roi| roi.try_clone()) {
            Ok(crop) => crop,
            Err(e) => {
                debug!(target_id, error = %e, "face crop failed");
                continue;
            }
        };
        match snapshots.save_latest_face(target_id, &crop) {
            Ok(_) => {
                last_save.insert(target_id.to_string(), now);
            }
            Err(e) => debug!(target_id, error = %e, "face snapshot failed"),
        }
    }
}
