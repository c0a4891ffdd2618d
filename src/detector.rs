use anyhow::{bail, Result};
use ndarray::ArrayView3;

use crate::config::RecognitionSettings;

pub const EMBEDDING_DIM: usize = 128;

const MIN_REGION_SCORE: f32 = 0.15;

/// One detected face, decoupled from any model's native output type.
#[derive(Debug, Clone)]
pub struct FaceDet {
    /// [x1, y1, x2, y2] in frame coordinates.
    pub bbox: [f32; 4],
    pub det_score: f32,
    pub embedding: Vec<f32>,
}

/// Detection + embedding capability. Owned by exactly one recognition worker;
/// implementations are free to be expensive to construct and non-reentrant.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: ArrayView3<u8>) -> Result<Vec<FaceDet>>;
}

pub fn build_detector(cfg: &RecognitionSettings) -> Result<Box<dyn FaceDetector>> {
    match cfg.backend.as_str() {
        "synthetic" => Ok(Box::new(SyntheticDetector::new())),
        other => bail!("unknown recognition backend '{other}'"),
    }
}

/// Deterministic stand-in for the ONNX face stack: treats the center square of
/// the frame as the face region, scores it by local contrast and derives the
/// embedding from a color histogram of that region. Flat frames yield no
/// detection, so idle synthetic cameras stay quiet.
pub struct SyntheticDetector;

impl SyntheticDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SyntheticDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl FaceDetector for SyntheticDetector {
    fn detect(&mut self, frame: ArrayView3<u8>) -> Result<Vec<FaceDet>> {
        let (h, w, _) = frame.dim();
        if h < 8 || w < 8 {
            return Ok(Vec::new());
        }

        let side = h.min(w) / 2;
        let y0 = (h - side) / 2;
        let x0 = (w - side) / 2;

        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        let mut hist = vec![0.0f32; EMBEDDING_DIM];
        let count = (side * side) as f64;

        for y in y0..y0 + side {
            for x in x0..x0 + side {
                let b = frame[(y, x, 0)];
                let g = frame[(y, x, 1)];
                let r = frame[(y, x, 2)];
                let gray = (b as f64 + g as f64 + r as f64) / 3.0;
                sum += gray;
                sum_sq += gray * gray;
                // 8 * 4 * 4 color buckets
                let bucket = ((b >> 5) as usize) * 16 + ((g >> 6) as usize) * 4 + (r >> 6) as usize;
                hist[bucket] += 1.0;
            }
        }

        let mean = sum / count;
        let var = (sum_sq / count - mean * mean).max(0.0);
        let det_score = ((var.sqrt() / 64.0) as f32).clamp(0.0, 1.0);
        if det_score < MIN_REGION_SCORE {
            return Ok(Vec::new());
        }

        let norm: f32 = hist.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut hist {
                *v /= norm;
            }
        }

        Ok(vec![FaceDet {
            bbox: [x0 as f32, y0 as f32, (x0 + side) as f32, (y0 + side) as f32],
            det_score,
            embedding: hist,
        }])
    }
}
