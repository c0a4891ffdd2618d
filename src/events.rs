use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Wall-clock time as fractional epoch seconds.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    SystemStart,
    SpgSeen,
    SpgPresent,
    SpgAbsent,
    AbsentAlertFired,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: f64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub outlet_id: String,
    pub camera_id: String,
    pub target_id: Option<String>,
    pub display_name: Option<String>,
    pub similarity: Option<f64>,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: EventType, outlet_id: &str, camera_id: &str, ts: f64) -> Self {
        Self {
            ts,
            event_type,
            outlet_id: outlet_id.to_string(),
            camera_id: camera_id.to_string(),
            target_id: None,
            display_name: None,
            similarity: None,
            details: Map::new(),
        }
    }

    pub fn with_target(mut self, target_id: &str, display_name: Option<&str>) -> Self {
        self.target_id = Some(target_id.to_string());
        self.display_name = display_name.map(str::to_string);
        self
    }

    pub fn with_similarity(mut self, similarity: f64) -> Self {
        self.similarity = Some(similarity);
        self
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

/// Append-only JSONL journal, one per camera directory.
pub struct EventStore {
    path: PathBuf,
    file: File,
}

impl EventStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("creating event dir {}", data_dir.display()))?;
        let path = data_dir.join("events.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening event journal {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Each record goes out as one buffered write so a tailer never sees a
    /// partial line.
    pub fn append(&mut self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Incremental reader over a journal, tracking its byte offset between
/// polls. Built for dashboards and external consumers that follow a live
/// file.
pub struct EventTailer {
    path: PathBuf,
    offset: u64,
}

impl EventTailer {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf(), offset: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Events appended since the last poll. A line that does not parse is
    /// warned about and skipped; a trailing partial line is left for the
    /// next poll.
    pub fn read_new(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        let Ok(mut file) = File::open(&self.path) else {
            return out;
        };
        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return out;
        }
        let mut buf = String::new();
        if file.read_to_string(&mut buf).is_err() {
            return out;
        }

        let mut consumed = 0usize;
        for line in buf.split_inclusive('\n') {
            if !line.ends_with('\n') {
                break;
            }
            consumed += line.len();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => out.push(event),
                Err(e) => warn!(file = %self.path.display(), error = %e, "skipping malformed event line"),
            }
        }
        self.offset += consumed as u64;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn event_type_wire_names() {
        let names: Vec<String> = [
            EventType::SystemStart,
            EventType::SpgSeen,
            EventType::SpgPresent,
            EventType::SpgAbsent,
            EventType::AbsentAlertFired,
            EventType::Error,
        ]
        .iter()
        .map(|t| serde_json::to_string(t).unwrap())
        .collect();
        assert_eq!(
            names,
            vec![
                "\"SYSTEM_START\"",
                "\"SPG_SEEN\"",
                "\"SPG_PRESENT\"",
                "\"SPG_ABSENT\"",
                "\"ABSENT_ALERT_FIRED\"",
                "\"ERROR\"",
            ]
        );
    }

    #[test]
    fn append_produces_one_parseable_line_per_event() {
        let dir = TempDir::new().unwrap();
        let mut store = EventStore::open(dir.path()).unwrap();

        let seen = Event::new(EventType::SpgSeen, "outlet_a", "cam_01", 100.5)
            .with_target("T1", Some("Nana"))
            .with_similarity(0.91)
            .with_detail("frame_id", 7.into());
        store.append(&seen).unwrap();
        store
            .append(&Event::new(EventType::SystemStart, "outlet_a", "cam_01", 101.0))
            .unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: Event = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.event_type, EventType::SpgSeen);
        assert_eq!(parsed.target_id.as_deref(), Some("T1"));
        assert_eq!(parsed.details["frame_id"], 7);

        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["type"], "SPG_SEEN");
    }

    #[test]
    fn tailer_reads_incrementally_and_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let mut store = EventStore::open(dir.path()).unwrap();
        let mut tailer = EventTailer::new(store.path());

        assert!(tailer.read_new().is_empty());

        store
            .append(&Event::new(EventType::SpgSeen, "o", "cam_01", 1.0))
            .unwrap();
        let batch = tailer.read_new();
        assert_eq!(batch.len(), 1);
        assert!(tailer.read_new().is_empty(), "already consumed");

        // Hand-write one garbage line and one good line after it.
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(store.path())
                .unwrap();
            writeln!(f, "{{broken").unwrap();
        }
        store
            .append(&Event::new(EventType::SpgAbsent, "o", "cam_01", 2.0))
            .unwrap();

        let batch = tailer.read_new();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_type, EventType::SpgAbsent);
    }

    #[test]
    fn tailer_leaves_partial_lines_for_the_next_poll() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, "{\"ts\":1.0,\"type\":\"SYSTEM_START\",\"outlet_id\":\"o\",\"camera_id\":\"c\",\"target_id\":null,\"display_name\":null,\"similarity\":null,\"details\":{}}\n{\"ts\":2.0,").unwrap();

        let mut tailer = EventTailer::new(&path);
        let batch = tailer.read_new();
        assert_eq!(batch.len(), 1);
        let offset = tailer.offset();

        // Completing the second line makes it visible.
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            write!(f, "\"type\":\"ERROR\",\"outlet_id\":\"o\",\"camera_id\":\"c\",\"target_id\":null,\"display_name\":null,\"similarity\":null,\"details\":{{}}}}\n").unwrap();
        }
        let batch = tailer.read_new();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_type, EventType::Error);
        assert!(tailer.offset() > offset);
    }
}
