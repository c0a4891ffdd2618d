use std::collections::HashMap;

use crate::events::{Event, EventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Unknown,
    Present,
    Absent,
}

#[derive(Debug, Clone)]
struct TargetState {
    state: PresenceState,
    last_seen_ts: Option<f64>,
    alert_fired: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self { state: PresenceState::Unknown, last_seen_ts: None, alert_fired: false }
    }
}

/// Per-camera presence tracking. Sightings drive SEEN/PRESENT immediately;
/// `tick` turns the passage of time into ABSENT and, once per absence
/// episode, ABSENT_ALERT_FIRED. Time always comes in as a parameter so the
/// machine can be driven deterministically.
pub struct PresenceEngine {
    outlet_id: String,
    camera_id: String,
    grace_seconds: u64,
    absent_seconds: u64,
    states: HashMap<String, TargetState>,
}

impl PresenceEngine {
    pub fn new(outlet_id: &str, camera_id: &str, grace_seconds: u64, absent_seconds: u64) -> Self {
        debug_assert!(grace_seconds <= absent_seconds);
        Self {
            outlet_id: outlet_id.to_string(),
            camera_id: camera_id.to_string(),
            grace_seconds,
            absent_seconds,
            states: HashMap::new(),
        }
    }

    pub fn state_of(&self, target_id: &str) -> PresenceState {
        self.states.get(target_id).map(|s| s.state).unwrap_or(PresenceState::Unknown)
    }

    /// Record a confirmed sighting at `ts`.
    pub fn observe_seen(
        &mut self,
        target_id: &str,
        name: Option<&str>,
        similarity: f64,
        ts: f64,
    ) -> Vec<Event> {
        let s = self.states.entry(target_id.to_string()).or_default();
        s.last_seen_ts = Some(ts);

        let mut events = vec![
            Event::new(EventType::SpgSeen, &self.outlet_id, &self.camera_id, ts)
                .with_target(target_id, name)
                .with_similarity(similarity),
        ];

        if s.state != PresenceState::Present {
            s.state = PresenceState::Present;
            s.alert_fired = false;
            events.push(
                Event::new(EventType::SpgPresent, &self.outlet_id, &self.camera_id, ts)
                    .with_target(target_id, name)
                    .with_similarity(similarity),
            );
        }
        events
    }

    /// Evaluate absence for every target. A target never sighted on this
    /// camera stays UNKNOWN and produces nothing.
    pub fn tick(&mut self, target_ids: &[String], ts: f64) -> Vec<Event> {
        let mut events = Vec::new();
        for target_id in target_ids {
            let s = self.states.entry(target_id.clone()).or_default();
            let Some(last_seen) = s.last_seen_ts else {
                continue;
            };
            let dt = ts - last_seen;

            if dt > self.grace_seconds as f64 && s.state != PresenceState::Absent {
                s.state = PresenceState::Absent;
                events.push(
                    Event::new(EventType::SpgAbsent, &self.outlet_id, &self.camera_id, ts)
                        .with_target(target_id, None)
                        .with_detail("seconds_since_last_seen", (dt.floor() as i64).into()),
                );
            }

            if dt > self.absent_seconds as f64 && !s.alert_fired {
                s.alert_fired = true;
                events.push(
                    Event::new(EventType::AbsentAlertFired, &self.outlet_id, &self.camera_id, ts)
                        .with_target(target_id, None)
                        .with_detail("seconds_since_last_seen", (dt.floor() as i64).into()),
                );
            }
        }
        events
    }
}
