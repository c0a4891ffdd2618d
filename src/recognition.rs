use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::capture::MetaMsg;
use crate::config::RecognitionSettings;
use crate::detector::build_detector;
use crate::gallery::{GalleryIndex, GalleryStore};
use crate::slot::FrameSlot;

const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ResultFace {
    /// [x1, y1, x2, y2] in slot-frame coordinates.
    pub bbox: [i32; 4],
    pub matched: bool,
    pub target_id: Option<String>,
    pub display_name: Option<String>,
    pub similarity: f64,
}

#[derive(Debug, Clone)]
pub struct ResultMsg {
    pub camera_id: String,
    pub frame_id: i64,
    pub timestamp: f64,
    pub faces: Vec<ResultFace>,
    pub inference_ms: f64,
}

pub struct RecognitionContext {
    pub settings: RecognitionSettings,
    /// Outlet data dir holding `gallery/`.
    pub data_dir: PathBuf,
    pub frame_skip: u32,
    pub slots: HashMap<String, Arc<FrameSlot>>,
    pub meta_rx: Receiver<MetaMsg>,
    pub results_tx: Sender<ResultMsg>,
}

/// The single worker owning the detector and the gallery index. All cameras
/// funnel through here; parallelism across cameras stays at the capture side
/// and the model never has to be re-entrant.
pub struct RecognitionWorker {
    join: JoinHandle<Result<()>>,
}

impl RecognitionWorker {
    pub fn spawn(ctx: RecognitionContext) -> Result<Self> {
        let join = thread::Builder::new()
            .name("recognition".to_string())
            .spawn(move || run(ctx))
            .map_err(|e| anyhow!("spawning recognition thread: {e}"))?;
        Ok(Self { join })
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) -> Result<()> {
        match self.join.join() {
            Ok(res) => res,
            Err(_) => Err(anyhow!("recognition thread panicked")),
        }
    }
}

fn run(mut ctx: RecognitionContext) -> Result<()> {
    // Model load is the expensive part and happens exactly once, in here.
    // Failure is fatal; the supervisor decides what to do about it.
    let mut detector = build_detector(&ctx.settings).context("loading detection model")?;

    let store = GalleryStore::new(&ctx.data_dir)?;
    let identities = store.load_all()?;
    let index = GalleryIndex::build(&identities, ctx.settings.threshold);
    info!(
        identities = identities.len(),
        embeddings = index.len(),
        frame_skip = ctx.frame_skip,
        "recognition worker ready"
    );

    let mut skip_counters: HashMap<String, u32> = HashMap::new();

    loop {
        let msg = match ctx.meta_rx.recv_timeout(DEQUEUE_TIMEOUT) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let MetaMsg::Frame { camera_id, frame_id, ts, inline } = msg else {
            info!("recognition worker received stop");
            break;
        };

        // Per-camera frame skip; one camera backing off never delays another.
        if ctx.frame_skip > 0 {
            let counter = skip_counters.entry(camera_id.clone()).or_insert(0);
            if *counter < ctx.frame_skip {
                *counter += 1;
                continue;
            }
            *counter = 0;
        }

        let pixels = match inline {
            Some(pixels) => Some(pixels),
            None => ctx
                .slots
                .get(&camera_id)
                .and_then(|slot| slot.read())
                .map(|(frame, _meta)| frame),
        };
        let Some(pixels) = pixels else {
            debug!(camera_id = %camera_id, frame_id, "no frame available for metadata message");
            continue;
        };

        let t0 = Instant::now();
        let faces = match detector.detect(pixels.view()) {
            Ok(faces) => faces,
            Err(e) => {
                error!(camera_id = %camera_id, frame_id, error = %e, "detection failed");
                continue;
            }
        };

        let faces = faces
            .into_iter()
            .map(|face| {
                let outcome = index.match_embedding(Some(&face.embedding));
                ResultFace {
                    bbox: face.bbox.map(|v| v as i32),
                    matched: outcome.matched,
                    target_id: outcome.target_id,
                    display_name: outcome.display_name,
                    similarity: outcome.similarity,
                }
            })
            .collect();

        let result = ResultMsg {
            camera_id,
            frame_id,
            timestamp: ts,
            faces,
            inference_ms: t0.elapsed().as_secs_f64() * 1000.0,
        };
        match ctx.results_tx.try_send(result) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                debug!(camera_id = %msg.camera_id, frame_id = msg.frame_id, "results channel full, dropped");
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    warn!("recognition worker exiting");
    Ok(())
}
