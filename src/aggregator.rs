use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

use crate::events::{Event, EventType};

/// Virtual camera id stamped on outlet-level alerts.
pub const AGGREGATOR_CAMERA_ID: &str = "aggregator";

const STATE_WRITE_ATTEMPTS: u32 = 3;
const STATE_WRITE_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Default, Clone)]
struct GlobalState {
    last_seen: f64,
    is_absent: bool,
    alert_fired: bool,
    display_name: Option<String>,
    last_camera: Option<String>,
}

#[derive(Debug, Serialize)]
struct StateSnapshot<'a> {
    outlet_id: &'a str,
    timestamp: f64,
    targets: Vec<TargetSnapshot<'a>>,
}

#[derive(Debug, Serialize)]
struct TargetSnapshot<'a> {
    id: &'a str,
    name: &'a str,
    status: &'static str,
    last_seen_ts: f64,
    seconds_since_last_event: i64,
    is_alert_fired: bool,
}

/// Fuses SPG_SEEN events from every camera into one last-seen time per
/// target: present on ANY camera means present at the outlet. Owns the alert
/// edge, including the startup case where a target never arrives at all.
pub struct OutletAggregator {
    outlet_id: String,
    absent_seconds: u64,
    target_ids: Vec<String>,
    start_time: f64,
    states: HashMap<String, GlobalState>,
}

impl OutletAggregator {
    pub fn new(outlet_id: &str, target_ids: Vec<String>, absent_seconds: u64, start_time: f64) -> Self {
        let states = target_ids
            .iter()
            .map(|id| (id.clone(), GlobalState::default()))
            .collect();
        Self {
            outlet_id: outlet_id.to_string(),
            absent_seconds,
            target_ids,
            start_time,
            states,
        }
    }

    pub fn last_seen(&self, target_id: &str) -> f64 {
        self.states.get(target_id).map(|s| s.last_seen).unwrap_or(0.0)
    }

    pub fn is_absent(&self, target_id: &str) -> bool {
        self.states.get(target_id).map(|s| s.is_absent).unwrap_or(false)
    }

    pub fn alert_fired(&self, target_id: &str) -> bool {
        self.states.get(target_id).map(|s| s.alert_fired).unwrap_or(false)
    }

    /// Camera that produced the freshest sighting, for alert snapshots.
    pub fn last_camera(&self, target_id: &str) -> Option<&str> {
        self.states.get(target_id).and_then(|s| s.last_camera.as_deref())
    }

    pub fn ingest(&mut self, events: &[Event]) {
        for event in events {
            if event.outlet_id != self.outlet_id || event.event_type != EventType::SpgSeen {
                continue;
            }
            let Some(target_id) = event.target_id.as_deref() else {
                continue;
            };
            let Some(state) = self.states.get_mut(target_id) else {
                continue;
            };
            if event.ts > state.last_seen {
                state.last_seen = event.ts;
                state.last_camera = Some(event.camera_id.clone());
                if state.is_absent {
                    state.is_absent = false;
                    state.alert_fired = false;
                }
            }
            if let Some(name) = &event.display_name {
                state.display_name = Some(name.clone());
            }
        }
    }

    /// Evaluate global absence at `now`. Iteration order is the configured
    /// target order, so alert batches are deterministic.
    pub fn tick(&mut self, now: f64) -> Vec<Event> {
        let mut alerts = Vec::new();
        for target_id in &self.target_ids {
            let state = self.states.get_mut(target_id).expect("state map covers targets");

            if state.last_seen == 0.0 {
                // Never arrived since startup.
                if now - self.start_time > self.absent_seconds as f64 {
                    state.is_absent = true;
                    if !state.alert_fired {
                        state.alert_fired = true;
                        alerts.push(
                            Event::new(
                                EventType::AbsentAlertFired,
                                &self.outlet_id,
                                AGGREGATOR_CAMERA_ID,
                                now,
                            )
                            .with_target(target_id, state.display_name.as_deref())
                            .with_detail("reason", "startup_absence_never_arrived".into())
                            .with_detail(
                                "seconds_since_startup",
                                (((now - self.start_time).floor()) as i64).into(),
                            ),
                        );
                    }
                }
                continue;
            }

            let dt = now - state.last_seen;
            if dt > self.absent_seconds as f64 {
                state.is_absent = true;
                if !state.alert_fired {
                    state.alert_fired = true;
                    alerts.push(
                        Event::new(
                            EventType::AbsentAlertFired,
                            &self.outlet_id,
                            AGGREGATOR_CAMERA_ID,
                            now,
                        )
                        .with_target(target_id, state.display_name.as_deref())
                        .with_detail("reason", "global_absence".into())
                        .with_detail("seconds_since_last_seen", ((dt.floor()) as i64).into()),
                    );
                }
            }
        }
        alerts
    }

    fn status_of(state: &GlobalState) -> &'static str {
        if state.last_seen == 0.0 {
            if state.is_absent { "NEVER_ARRIVED" } else { "NOT_SEEN_YET" }
        } else if state.is_absent {
            "ABSENT"
        } else {
            "PRESENT"
        }
    }

    /// Overwrite the dashboard state file. A reader may hold the file open;
    /// retry briefly and then let this tick's write go, the next tick will
    /// refresh it anyway.
    pub fn dump_state(&self, path: &Path, now: f64) -> Result<()> {
        let targets = self
            .target_ids
            .iter()
            .map(|id| {
                let state = &self.states[id];
                let since = if state.last_seen > 0.0 {
                    now - state.last_seen
                } else {
                    now - self.start_time
                };
                TargetSnapshot {
                    id,
                    name: state.display_name.as_deref().unwrap_or(id),
                    status: Self::status_of(state),
                    last_seen_ts: state.last_seen,
                    seconds_since_last_event: since.max(0.0).floor() as i64,
                    is_alert_fired: state.alert_fired,
                }
            })
            .collect();

        let snapshot = StateSnapshot { outlet_id: &self.outlet_id, timestamp: now, targets };
        let json = serde_json::to_string_pretty(&snapshot)?;

        for attempt in 1..=STATE_WRITE_ATTEMPTS {
            match std::fs::write(path, &json) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    debug!(attempt, path = %path.display(), "state file busy, backing off");
                    std::thread::sleep(STATE_WRITE_BACKOFF);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "state snapshot write failed");
                    return Ok(());
                }
            }
        }
        debug!(path = %path.display(), "state snapshot skipped after contention");
        Ok(())
    }
}
