use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use opencv::imgcodecs;
use opencv::prelude::*;
use sysinfo::{get_current_pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{error, info, warn};

use crate::aggregator::OutletAggregator;
use crate::capture::{CaptureContext, CaptureWorker, MetaMsg, PreviewSettings};
use crate::config::AppConfig;
use crate::events::{now_ts, Event, EventStore, EventType};
use crate::notifier::TelegramNotifier;
use crate::recognition::{RecognitionContext, RecognitionWorker, ResultMsg};
use crate::slot::FrameSlot;
use crate::snapshot::{sweep_snapshots, SnapshotStore, LATEST_FRAME_NAME};
use crate::source::{open_source, SourceSpec};

const METADATA_QUEUE_CAP: usize = 10;
const RESULTS_QUEUE_CAP: usize = 256;
const FEEDBACK_QUEUE_CAP: usize = 5;
const RESULTS_DRAIN_MAX: usize = 50;
const TICK_SLEEP: Duration = Duration::from_millis(50);
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

struct CameraPlan {
    id: String,
    spec: SourceSpec,
}

/// `run` command: wire every component together and pump the main loop until
/// ctrl-c or a fatal worker failure.
pub fn run(config: AppConfig, preview_override: Option<bool>, force_simulate: bool) -> Result<()> {
    let outlet_id = config.outlet.id.clone();
    let target_ids = config.outlet.target_spg_ids.clone();
    let target_set: HashSet<String> = target_ids.iter().cloned().collect();

    let simulate = force_simulate || config.dev.simulate;
    let plans = plan_cameras(&config, simulate)?;
    info!(
        outlet_id = %outlet_id,
        cameras = plans.len(),
        targets = target_ids.len(),
        mode = if simulate { "simulation" } else { "production" },
        "outlet starting"
    );

    let outlet_root = config.storage.data_dir.join(&outlet_id);
    std::fs::create_dir_all(&outlet_root)
        .with_context(|| format!("creating outlet dir {}", outlet_root.display()))?;
    let state_path = outlet_root.join("outlet_state.json");
    if state_path.exists() {
        let _ = std::fs::remove_file(&state_path);
    }
    sweep_snapshots(&config.storage.data_dir, config.storage.snapshot_retention_days, now_ts());

    // IPC: shared metadata queue in, one results channel out, one feedback
    // channel back per camera.
    let (meta_tx, meta_rx) = bounded::<MetaMsg>(METADATA_QUEUE_CAP);
    let (results_tx, results_rx) = bounded::<ResultMsg>(RESULTS_QUEUE_CAP);
    let mut feedback: HashMap<String, (Sender<ResultMsg>, Receiver<ResultMsg>)> = HashMap::new();
    for plan in &plans {
        feedback.insert(plan.id.clone(), bounded(FEEDBACK_QUEUE_CAP));
    }

    let use_slots = config.inference.use_frame_slots;
    let mut slots: HashMap<String, Arc<FrameSlot>> = HashMap::new();
    if use_slots {
        for plan in &plans {
            slots.insert(
                plan.id.clone(),
                Arc::new(FrameSlot::new(
                    config.inference.max_frame_height,
                    config.inference.max_frame_width,
                )),
            );
        }
        info!(
            count = slots.len(),
            max_h = config.inference.max_frame_height,
            max_w = config.inference.max_frame_width,
            "frame slots created"
        );
    } else {
        info!("frame slots disabled, frames ride the metadata queue");
    }

    let recognition = RecognitionWorker::spawn(RecognitionContext {
        settings: config.recognition.clone(),
        data_dir: config.storage.data_dir.clone(),
        frame_skip: config.inference.frame_skip,
        slots: slots.clone(),
        meta_rx,
        results_tx,
    })?;

    let preview = PreviewSettings {
        enabled: preview_override.unwrap_or(config.runtime.preview_enabled),
        interval_sec: config.runtime.preview_save_interval_sec,
        width: config.runtime.preview_width,
        jpeg_quality: config.runtime.preview_jpeg_quality,
    };

    let mut captures = Vec::new();
    let mut cam_dirs: HashMap<String, PathBuf> = HashMap::new();
    for plan in &plans {
        let data_dir = outlet_root.join(&plan.id);
        cam_dirs.insert(plan.id.clone(), data_dir.clone());
        let worker = CaptureWorker::spawn(CaptureContext {
            camera_id: plan.id.clone(),
            source: open_source(&plan.spec, config.camera.process_fps),
            slot: slots.get(&plan.id).cloned(),
            max_frame_height: config.inference.max_frame_height,
            max_frame_width: config.inference.max_frame_width,
            meta_tx: meta_tx.clone(),
            feedback_rx: feedback[&plan.id].1.clone(),
            data_dir,
            preview: preview.clone(),
        })?;
        info!(camera_id = %plan.id, "capture worker launched");
        captures.push(worker);
    }

    let start_ts = now_ts();
    let mut event_stores: HashMap<String, EventStore> = HashMap::new();
    for (cam_id, dir) in &cam_dirs {
        let mut store = EventStore::open(dir)?;
        store.append(&Event::new(EventType::SystemStart, &outlet_id, cam_id, start_ts))?;
        event_stores.insert(cam_id.clone(), store);
    }
    let mut agg_store = EventStore::open(&outlet_root.join("aggregator"))?;
    agg_store.append(&Event::new(
        EventType::SystemStart,
        &outlet_id,
        crate::aggregator::AGGREGATOR_CAMERA_ID,
        start_ts,
    ))?;

    let mut engines: HashMap<String, crate::presence::PresenceEngine> = cam_dirs
        .keys()
        .map(|cam_id| {
            (
                cam_id.clone(),
                crate::presence::PresenceEngine::new(
                    &outlet_id,
                    cam_id,
                    config.presence.grace_seconds,
                    config.presence.absent_seconds,
                ),
            )
        })
        .collect();

    let mut aggregator = OutletAggregator::new(
        &outlet_id,
        target_ids.clone(),
        config.presence.absent_seconds,
        start_ts,
    );
    let alert_snapshots = SnapshotStore::new(&config.storage.data_dir)?;

    let notifier = if config.notification.telegram_enabled {
        match TelegramNotifier::from_env(&config.notification) {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "telegram notifier disabled");
                None
            }
        }
    } else {
        info!("telegram notification disabled in config");
        None
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })
        .context("installing ctrl-c handler")?;
    }

    let mut sys = System::new_all();
    let sys_pid = get_current_pid().ok();
    let mut last_health = Instant::now();
    let mut recognition_died = false;

    info!("supervisor loop active");
    while running.load(Ordering::SeqCst) {
        let mut seen_batch: Vec<Event> = Vec::new();

        for _ in 0..RESULTS_DRAIN_MAX {
            let Ok(res) = results_rx.try_recv() else { break };

            // Copy back to the owning capture worker for overlay drawing,
            // evicting the oldest entry when the worker lags.
            if let Some((tx, rx)) = feedback.get(&res.camera_id) {
                if tx.is_full() {
                    let _ = rx.try_recv();
                }
                let _ = tx.try_send(res.clone());
            }

            let Some(engine) = engines.get_mut(&res.camera_id) else { continue };
            let mut seen_this_frame: HashSet<String> = HashSet::new();

            for face in &res.faces {
                let Some(target_id) = face.target_id.as_deref().filter(|_| face.matched) else {
                    continue;
                };
                if !target_set.contains(target_id) || !seen_this_frame.insert(target_id.to_string())
                {
                    continue;
                }
                let events = engine.observe_seen(
                    target_id,
                    face.display_name.as_deref(),
                    face.similarity,
                    res.timestamp,
                );
                for mut event in events {
                    event.details.insert("frame_id".to_string(), res.frame_id.into());
                    if let Some(store) = event_stores.get_mut(&res.camera_id) {
                        append_logged(store, &event);
                    }
                    if event.event_type == EventType::SpgSeen {
                        seen_batch.push(event);
                    }
                }
            }
        }

        let now = now_ts();
        for (cam_id, engine) in engines.iter_mut() {
            for event in engine.tick(&target_ids, now) {
                if event.event_type == EventType::AbsentAlertFired {
                    // Informational on the camera level; the outlet-wide edge
                    // below is the one that notifies.
                    info!(
                        camera_id = %cam_id,
                        target_id = event.target_id.as_deref().unwrap_or(""),
                        "local absence threshold crossed"
                    );
                }
                if let Some(store) = event_stores.get_mut(cam_id) {
                    append_logged(store, &event);
                }
            }
        }

        aggregator.ingest(&seen_batch);
        for mut alert in aggregator.tick(now) {
            dispatch_alert(
                &mut alert,
                &aggregator,
                &cam_dirs,
                &alert_snapshots,
                notifier.as_ref(),
            );
            append_logged(&mut agg_store, &alert);
        }

        if let Err(e) = aggregator.dump_state(&state_path, now) {
            warn!(error = %e, "state snapshot failed");
        }

        if last_health.elapsed() >= HEALTH_INTERVAL {
            log_health(&mut sys, sys_pid, results_rx.len(), meta_tx.len());
            last_health = Instant::now();
        }
        if recognition.is_finished() {
            error!("recognition worker died");
            let event = Event::new(
                EventType::Error,
                &outlet_id,
                crate::aggregator::AGGREGATOR_CAMERA_ID,
                now_ts(),
            )
            .with_detail("error", "recognition worker died".into());
            append_logged(&mut agg_store, &event);
            recognition_died = true;
            break;
        }

        thread::sleep(TICK_SLEEP);
    }

    info!("shutting down");
    for worker in captures {
        worker.stop();
    }
    let _ = meta_tx.send_timeout(MetaMsg::Stop, Duration::from_secs(1));
    drop(meta_tx);
    let join_result = recognition.join();

    if recognition_died {
        return Err(join_result
            .err()
            .unwrap_or_else(|| anyhow!("recognition worker exited unexpectedly")));
    }
    join_result?;
    info!("outlet stopped cleanly");
    Ok(())
}

fn plan_cameras(config: &AppConfig, simulate: bool) -> Result<Vec<CameraPlan>> {
    let mut plans = Vec::new();
    if simulate {
        if config.dev.video_files.is_empty() {
            let count = config.outlet.cameras.len().max(1);
            for i in 0..count {
                plans.push(CameraPlan {
                    id: format!("cam_{:02}", i + 1),
                    spec: SourceSpec::Synthetic { seed: (i + 1) as u64 },
                });
            }
        } else {
            for (i, file) in config.dev.video_files.iter().enumerate() {
                if !Path::new(file).exists() {
                    warn!(file = %file, "simulation video missing, skipped");
                    continue;
                }
                plans.push(CameraPlan {
                    id: format!("cam_{:02}", i + 1),
                    spec: SourceSpec::Camera { url: file.clone(), loop_video: true },
                });
            }
        }
    } else {
        for cam in &config.outlet.cameras {
            plans.push(CameraPlan {
                id: cam.id.clone(),
                spec: SourceSpec::Camera { url: cam.url.clone(), loop_video: false },
            });
        }
    }
    if plans.is_empty() {
        bail!("no usable cameras configured");
    }
    Ok(plans)
}

/// Attach the freshest preview frame for the target's last camera, persist it
/// as the alert snapshot, and push the alert out. Transport failure leaves
/// the alert edge set: the alert counts as attempted, the next absence
/// episode re-arms it.
fn dispatch_alert(
    alert: &mut Event,
    aggregator: &OutletAggregator,
    cam_dirs: &HashMap<String, PathBuf>,
    alert_snapshots: &SnapshotStore,
    notifier: Option<&TelegramNotifier>,
) {
    let target_id = alert.target_id.clone().unwrap_or_default();
    let display = alert.display_name.clone().unwrap_or_else(|| target_id.clone());
    let reason = alert.details.get("reason").and_then(|v| v.as_str()).unwrap_or("unknown");
    let since = alert
        .details
        .get("seconds_since_last_seen")
        .or_else(|| alert.details.get("seconds_since_startup"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    let text = format!(
        "ABSENT ALERT\nOutlet: {}\nTarget: {}\nReason: {}\nNot seen for: {}s",
        alert.outlet_id, display, reason, since
    );
    info!(target_id = %target_id, reason, "outlet absence alert");

    let mut photo: Option<PathBuf> = None;
    if let Some(camera_id) = aggregator.last_camera(&target_id) {
        if let Some(dir) = cam_dirs.get(camera_id) {
            let preview = dir.join("snapshots").join(LATEST_FRAME_NAME);
            if let Some(path) = preview.to_str() {
                match imgcodecs::imread(path, imgcodecs::IMREAD_COLOR) {
                    Ok(frame) if !frame.empty() => {
                        match alert_snapshots.save_alert_frame(&alert.outlet_id, camera_id, &frame)
                        {
                            Ok(saved) => {
                                alert.details.insert(
                                    "snapshot_path".to_string(),
                                    saved.display().to_string().into(),
                                );
                                photo = Some(saved);
                            }
                            Err(e) => warn!(error = %e, "alert snapshot save failed"),
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(notifier) = notifier {
        let sent = match &photo {
            Some(path) => notifier.send_photo(path, Some(&text)),
            None => notifier.send_text(&text),
        };
        if let Err(e) = sent {
            error!(target_id = %target_id, error = %e, "alert delivery failed");
        }
    }
}

fn append_logged(store: &mut EventStore, event: &Event) {
    if let Err(e) = store.append(event) {
        error!(path = %store.path().display(), error = %e, "event append failed");
    }
}

fn log_health(sys: &mut System, pid: Option<sysinfo::Pid>, results_depth: usize, meta_depth: usize) {
    let Some(pid) = pid else { return };
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        false,
        ProcessRefreshKind::nothing().with_cpu().with_memory(),
    );
    if let Some(proc) = sys.process(pid) {
        info!(
            cpu_pct = proc.cpu_usage(),
            mem_mb = proc.memory() / (1024 * 1024),
            results_depth,
            meta_depth,
            "health"
        );
    }
}
