use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub camera: CameraSettings,
    pub recognition: RecognitionSettings,
    pub presence: PresenceSettings,
    #[serde(default)]
    pub inference: InferenceSettings,
    pub storage: StorageSettings,
    pub outlet: OutletSettings,
    #[serde(default)]
    pub notification: NotificationSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub dev: DevSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraSettings {
    /// Sample rate at each capture worker; the source is still drained at
    /// native speed.
    pub process_fps: u32,
    /// Source used by `enroll` ("0", "1", ... for webcams, or a URL/path).
    #[serde(default = "default_enroll_source")]
    pub enroll_source: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionSettings {
    /// Cosine similarity cut-off for an identity match.
    pub threshold: f64,
    #[serde(default = "default_det_size")]
    pub det_size: [u32; 2],
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_min_det_score")]
    pub min_det_score: f32,
    #[serde(default = "default_min_face_width")]
    pub min_face_width_px: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceSettings {
    /// Seconds without a sighting before a target goes ABSENT.
    pub grace_seconds: u64,
    /// Seconds without a sighting before the absence alert fires.
    pub absent_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// Skip N metadata messages between inferences, per camera.
    pub frame_skip: u32,
    pub max_frame_height: u32,
    pub max_frame_width: u32,
    /// When false, frames ride the metadata queue instead of the shared slots.
    pub use_frame_slots: bool,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            frame_skip: 0,
            max_frame_height: 720,
            max_frame_width: 1280,
            use_frame_slots: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    /// Snapshots older than this are deleted at startup; <= 0 disables.
    #[serde(default = "default_retention_days")]
    pub snapshot_retention_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutletSettings {
    pub id: String,
    #[serde(default)]
    pub cameras: Vec<CameraEntry>,
    pub target_spg_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraEntry {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub telegram_enabled: bool,
    /// Environment variable *names*; the credentials never live in the config.
    pub bot_token_env: String,
    pub chat_id_env: String,
    pub timeout_sec: u64,
    pub max_retries: u32,
    pub retry_backoff_base_sec: f64,
    pub retry_after_default_sec: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            telegram_enabled: false,
            bot_token_env: "SPG_TELEGRAM_BOT_TOKEN".to_string(),
            chat_id_env: "SPG_TELEGRAM_CHAT_ID".to_string(),
            timeout_sec: 15,
            max_retries: 3,
            retry_backoff_base_sec: 2.0,
            retry_after_default_sec: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub preview_enabled: bool,
    pub preview_save_interval_sec: f64,
    pub preview_width: u32,
    pub preview_jpeg_quality: i32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            preview_enabled: true,
            preview_save_interval_sec: 0.2,
            preview_width: 640,
            preview_jpeg_quality: 80,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DevSettings {
    pub simulate: bool,
    /// Looping file sources used when simulating; synthetic patterns otherwise.
    pub video_files: Vec<String>,
}

fn default_enroll_source() -> String {
    "0".to_string()
}

fn default_det_size() -> [u32; 2] {
    [640, 640]
}

fn default_backend() -> String {
    "synthetic".to_string()
}

fn default_min_det_score() -> f32 {
    0.60
}

fn default_min_face_width() -> u32 {
    100
}

fn default_retention_days() -> i64 {
    3
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("config file not found: {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera.process_fps == 0 {
            bail!("camera.process_fps must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.recognition.threshold) {
            bail!(
                "recognition.threshold must be within [0, 1], got {}",
                self.recognition.threshold
            );
        }
        if self.presence.grace_seconds > self.presence.absent_seconds {
            bail!(
                "presence.grace_seconds ({}) must not exceed presence.absent_seconds ({})",
                self.presence.grace_seconds,
                self.presence.absent_seconds
            );
        }
        if self.inference.max_frame_height == 0 || self.inference.max_frame_width == 0 {
            bail!("inference.max_frame_{{height,width}} must be positive");
        }
        if self.outlet.target_spg_ids.is_empty() {
            bail!("outlet.target_spg_ids must list at least one target");
        }
        if !self.dev.simulate && self.outlet.cameras.is_empty() {
            bail!("outlet.cameras is empty and dev.simulate is off");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
camera:
  process_fps: 5
recognition:
  threshold: 0.45
presence:
  grace_seconds: 10
  absent_seconds: 60
inference:
  frame_skip: 2
storage:
  data_dir: ./data
outlet:
  id: outlet_jkt_01
  cameras:
    - id: cam_01
      url: rtsp://10.0.0.4/stream1
  target_spg_ids: ["001", "002"]
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let cfg: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.camera.process_fps, 5);
        assert_eq!(cfg.inference.frame_skip, 2);
        assert_eq!(cfg.inference.max_frame_height, 720);
        assert_eq!(cfg.inference.max_frame_width, 1280);
        assert!(cfg.inference.use_frame_slots);
        assert_eq!(cfg.notification.bot_token_env, "SPG_TELEGRAM_BOT_TOKEN");
        assert_eq!(cfg.recognition.det_size, [640, 640]);
        assert_eq!(cfg.outlet.cameras[0].id, "cam_01");
    }

    #[test]
    fn rejects_grace_above_absent() {
        let mut cfg: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        cfg.presence.grace_seconds = 120;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("grace_seconds"), "unexpected error: {err}");
    }

    #[test]
    fn rejects_missing_cameras_outside_simulation() {
        let mut cfg: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        cfg.outlet.cameras.clear();
        assert!(cfg.validate().is_err());
        cfg.dev.simulate = true;
        cfg.validate().unwrap();
    }
}
