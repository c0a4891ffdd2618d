use std::time::{Duration, Instant};

use anyhow::Result;
use opencv::core::{Mat, Rect, Scalar};
use opencv::prelude::*;
use opencv::{imgproc, videoio};
use tracing::{info, warn};

const RECONNECT_COOLDOWN: Duration = Duration::from_secs(5);

/// A bounded producer of decoded frames, sampled down to the configured FPS.
/// `read_throttled` keeps consuming the underlying stream on every call so
/// the decoder never builds up a backlog; it only *returns* a frame when the
/// sampling interval has elapsed.
pub trait VideoSource: Send {
    fn read_throttled(&mut self) -> Result<Option<Mat>>;
    fn stop(&mut self);
}

#[derive(Debug, Clone)]
pub enum SourceSpec {
    /// RTSP url, file path, or a webcam index ("0", "1", ...).
    Camera { url: String, loop_video: bool },
    /// Deterministic generated pattern, one identity per seed.
    Synthetic { seed: u64 },
}

pub fn open_source(spec: &SourceSpec, process_fps: u32) -> Box<dyn VideoSource> {
    match spec {
        SourceSpec::Camera { url, loop_video } => {
            Box::new(CameraSource::new(url, process_fps, *loop_video))
        }
        SourceSpec::Synthetic { seed } => Box::new(SyntheticSource::new(*seed, process_fps)),
    }
}

pub fn is_rtsp_source(source: &str) -> bool {
    let s = source.trim();
    s.starts_with("rtsp://") || s.starts_with("rtsps://")
}

fn sample_interval(process_fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / process_fps.max(1) as f64)
}

pub struct CameraSource {
    url: String,
    loop_video: bool,
    interval: Duration,
    cap: Option<videoio::VideoCapture>,
    last_emit: Option<Instant>,
    last_open_attempt: Option<Instant>,
}

impl CameraSource {
    pub fn new(url: &str, process_fps: u32, loop_video: bool) -> Self {
        Self {
            url: url.to_string(),
            loop_video,
            interval: sample_interval(process_fps),
            cap: None,
            last_emit: None,
            last_open_attempt: None,
        }
    }

    fn open(&mut self) -> Result<()> {
        // Drop corrupt frames for the FFmpeg backend; damaged RTSP packets
        // otherwise surface as decode errors mid-stream.
        // SAFETY: process-wide env var set before the capture is opened.
        unsafe {
            if is_rtsp_source(&self.url) {
                std::env::set_var(
                    "OPENCV_FFMPEG_CAPTURE_OPTIONS",
                    "rtsp_transport;tcp|fflags;discardcorrupt|err_detect;ignore_err",
                );
            } else {
                std::env::set_var(
                    "OPENCV_FFMPEG_CAPTURE_OPTIONS",
                    "fflags;discardcorrupt|err_detect;ignore_err",
                );
            }
        }
        let cap = if let Ok(index) = self.url.trim().parse::<i32>() {
            videoio::VideoCapture::new(index, videoio::CAP_ANY)?
        } else {
            videoio::VideoCapture::from_file(&self.url, videoio::CAP_ANY)?
        };
        if !cap.is_opened()? {
            anyhow::bail!("could not open video source {}", self.url);
        }
        info!(source = %self.url, "video source opened");
        self.cap = Some(cap);
        Ok(())
    }

    /// Reopen at most once per cooldown window.
    fn ensure_open(&mut self) {
        if self.cap.is_some() {
            return;
        }
        if let Some(at) = self.last_open_attempt {
            if at.elapsed() < RECONNECT_COOLDOWN {
                return;
            }
        }
        self.last_open_attempt = Some(Instant::now());
        if let Err(e) = self.open() {
            warn!(source = %self.url, error = %e, "video source open failed, will retry");
        }
    }

    fn read_raw(&mut self) -> Option<Mat> {
        let cap = self.cap.as_mut()?;
        let mut frame = Mat::default();
        let mut ok = cap.read(&mut frame).unwrap_or(false);

        if !ok && self.loop_video {
            // File ended; rewind and take the next frame.
            let _ = cap.set(videoio::CAP_PROP_POS_FRAMES, 0.0);
            ok = cap.read(&mut frame).unwrap_or(false);
        }

        if !ok {
            warn!(source = %self.url, "video read failed, dropping connection");
            if let Some(mut cap) = self.cap.take() {
                let _ = cap.release();
            }
            return None;
        }
        Some(frame)
    }
}

impl VideoSource for CameraSource {
    fn read_throttled(&mut self) -> Result<Option<Mat>> {
        self.ensure_open();
        let Some(frame) = self.read_raw() else {
            return Ok(None);
        };
        match self.last_emit {
            Some(at) if at.elapsed() < self.interval => Ok(None),
            _ => {
                self.last_emit = Some(Instant::now());
                Ok(Some(frame))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(mut cap) = self.cap.take() {
            let _ = cap.release();
        }
    }
}

/// Simulation source: a dark frame with a tiled color patch in the center.
/// The patch colors derive from the seed, so two sources with the same seed
/// show the same "person" and different seeds show strangers.
pub struct SyntheticSource {
    seed: u64,
    interval: Duration,
    last_emit: Option<Instant>,
}

pub const SYNTH_HEIGHT: i32 = 480;
pub const SYNTH_WIDTH: i32 = 640;
const PATCH_SIDE: i32 = 220;
const PATCH_TILES: i32 = 4;

impl SyntheticSource {
    pub fn new(seed: u64, process_fps: u32) -> Self {
        Self { seed, interval: sample_interval(process_fps), last_emit: None }
    }

    fn tile_color(&self, tile: i32) -> Scalar {
        // Splitmix-style scramble; stable per (seed, tile).
        let mut z = self
            .seed
            .wrapping_mul(0x9e37_79b9_7f4a_7c15)
            .wrapping_add(tile as u64)
            .wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z ^= z >> 27;
        let b = 40 + (z & 0xff) as i64 % 200;
        let g = 40 + ((z >> 8) & 0xff) as i64 % 200;
        let r = 40 + ((z >> 16) & 0xff) as i64 % 200;
        Scalar::new(b as f64, g as f64, r as f64, 0.0)
    }

    pub fn render(&self) -> Result<Mat> {
        let mut frame = Mat::new_rows_cols_with_default(
            SYNTH_HEIGHT,
            SYNTH_WIDTH,
            opencv::core::CV_8UC3,
            Scalar::all(30.0),
        )?;
        let x0 = (SYNTH_WIDTH - PATCH_SIDE) / 2;
        let y0 = (SYNTH_HEIGHT - PATCH_SIDE) / 2;
        let tile = PATCH_SIDE / PATCH_TILES;
        for ty in 0..PATCH_TILES {
            for tx in 0..PATCH_TILES {
                let rect = Rect::new(x0 + tx * tile, y0 + ty * tile, tile, tile);
                imgproc::rectangle(
                    &mut frame,
                    rect,
                    self.tile_color(ty * PATCH_TILES + tx),
                    -1,
                    imgproc::LINE_8,
                    0,
                )?;
            }
        }
        Ok(frame)
    }
}

impl VideoSource for SyntheticSource {
    fn read_throttled(&mut self) -> Result<Option<Mat>> {
        if let Some(at) = self.last_emit {
            if at.elapsed() < self.interval {
                return Ok(None);
            }
        }
        self.last_emit = Some(Instant::now());
        Ok(Some(self.render()?))
    }

    fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{FaceDetector, SyntheticDetector};
    use crate::frame::mat_to_array3;

    #[test]
    fn rtsp_detection() {
        assert!(is_rtsp_source("rtsp://10.0.0.4/stream1"));
        assert!(is_rtsp_source("  rtsps://cam/live"));
        assert!(!is_rtsp_source("/data/video.mp4"));
        assert!(!is_rtsp_source("0"));
    }

    #[test]
    fn synthetic_pattern_is_stable_per_seed_and_detectable() {
        let source = SyntheticSource::new(7, 5);
        let a = mat_to_array3(&source.render().unwrap()).unwrap();
        let b = mat_to_array3(&source.render().unwrap()).unwrap();
        assert_eq!(a, b);

        let mut det = SyntheticDetector::new();
        let faces = det.detect(a.view()).unwrap();
        assert_eq!(faces.len(), 1, "synthetic pattern must register as a face");

        let other = SyntheticSource::new(8, 5);
        let c = mat_to_array3(&other.render().unwrap()).unwrap();
        assert_ne!(a, c, "different seeds must look different");
    }

    #[test]
    fn synthetic_source_throttles_to_process_fps() {
        let mut source = SyntheticSource::new(1, 1000);
        assert!(source.read_throttled().unwrap().is_some());
        // Immediately after an emission the interval has not elapsed.
        let mut source = SyntheticSource::new(1, 1);
        assert!(source.read_throttled().unwrap().is_some());
        assert!(source.read_throttled().unwrap().is_none());
    }
}
