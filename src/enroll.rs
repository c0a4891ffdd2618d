use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use opencv::core::{Mat, Rect};
use opencv::prelude::*;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::detector::{build_detector, FaceDet};
use crate::events::now_ts;
use crate::frame::mat_to_array3;
use crate::gallery::{GalleryStore, IdentityMeta, IdentityRecord, SampleMeta};
use crate::source::{open_source, SourceSpec};

const SAMPLE_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// `enroll` command: sample `samples` acceptable faces from the enrollment
/// source and persist them as one identity.
pub fn enroll(config: &AppConfig, target_id: &str, name: &str, samples: usize) -> Result<()> {
    if samples == 0 {
        bail!("--samples must be at least 1");
    }

    let spec = if config.dev.simulate {
        SourceSpec::Synthetic { seed: 1 }
    } else {
        SourceSpec::Camera { url: config.camera.enroll_source.clone(), loop_video: false }
    };
    let mut source = open_source(&spec, config.camera.process_fps);
    let mut detector = build_detector(&config.recognition)?;
    let store = GalleryStore::new(&config.storage.data_dir)?;

    let min_score = config.recognition.min_det_score;
    let min_width = config.recognition.min_face_width_px;
    info!(target_id, name, samples, min_score, min_width, "enrollment started");

    let mut embeddings: Vec<Vec<f32>> = Vec::new();
    let mut meta_samples: Vec<SampleMeta> = Vec::new();
    let mut last_face_crop: Option<Mat> = None;
    let mut last_progress = Instant::now();

    while embeddings.len() < samples {
        if last_progress.elapsed() > SAMPLE_STALL_TIMEOUT {
            bail!(
                "no acceptable face seen for {}s, collected {}/{} samples",
                SAMPLE_STALL_TIMEOUT.as_secs(),
                embeddings.len(),
                samples
            );
        }

        let Some(frame) = source.read_throttled()? else {
            std::thread::sleep(Duration::from_millis(50));
            continue;
        };
        let pixels = mat_to_array3(&frame)?;
        let faces = detector.detect(pixels.view())?;

        let Some(best) = best_face(&faces) else { continue };
        let width = (best.bbox[2] - best.bbox[0]).max(0.0) as u32;
        if best.det_score < min_score || width < min_width {
            continue;
        }

        let norm: f32 = best.embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm <= 0.0 {
            warn!("zero-norm embedding skipped");
            continue;
        }
        embeddings.push(best.embedding.iter().map(|x| x / (norm + 1e-12)).collect());
        meta_samples.push(SampleMeta {
            ts: now_ts(),
            det_score: best.det_score,
            face_width_px: width,
        });
        last_progress = Instant::now();

        if let Some(rect) = crop_rect(best, &frame) {
            if let Ok(crop) = Mat::roi(&frame, rect).and_then(|roi| roi.try_clone()) {
                last_face_crop = Some(crop);
            }
        }
        info!(collected = embeddings.len(), total = samples, "sample accepted");
    }
    source.stop();

    let record = IdentityRecord {
        target_id: target_id.to_string(),
        name: name.to_string(),
        meta: IdentityMeta {
            created_at: now_ts(),
            num_samples: embeddings.len(),
            min_det_score: min_score,
            min_face_width_px: min_width,
            samples: meta_samples,
        },
        embeddings,
    };
    let json_path = store.save_identity(&record).context("saving identity")?;
    info!(path = %json_path.display(), "identity saved");

    if let Some(crop) = last_face_crop {
        let face_path = store.save_face_crop(target_id, &crop)?;
        info!(path = %face_path.display(), "face crop saved");
    }
    Ok(())
}

fn best_face(faces: &[FaceDet]) -> Option<&FaceDet> {
    faces
        .iter()
        .max_by(|a, b| a.det_score.partial_cmp(&b.det_score).unwrap_or(std::cmp::Ordering::Equal))
}

fn crop_rect(face: &FaceDet, frame: &Mat) -> Option<Rect> {
    let x1 = (face.bbox[0].max(0.0)) as i32;
    let y1 = (face.bbox[1].max(0.0)) as i32;
    let x2 = (face.bbox[2] as i32).min(frame.cols());
    let y2 = (face.bbox[3] as i32).min(frame.rows());
    if x2 - x1 < 2 || y2 - y1 < 2 {
        return None;
    }
    Some(Rect::new(x1, y1, x2 - x1, y2 - y1))
}
