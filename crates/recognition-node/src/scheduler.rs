//! Per-camera sampling loop.
//!
//! Each camera gets one task that owns its scheduler state outright. The
//! in-flight gate is a `JoinSet` holding at most one cycle: a tick that finds
//! it occupied is dropped, never queued. Because the set is emptied by
//! `join_next` whether the cycle returned, failed, timed out or panicked,
//! the gate is always released.

use crate::error::CycleError;
use crate::pipeline::{CycleOutcome, RecognitionPipeline};
use chrono::Utc;
use common::attendance::{CameraId, CameraPriority, CameraStatus, CycleSummary};
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics::{
    RECOGNITION_CAMERA_OVERLOADED, RECOGNITION_CYCLES, RECOGNITION_CYCLE_DURATION,
    RECOGNITION_TICKS_SKIPPED,
};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cadence tier currently assigned to a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier {
    pub priority: CameraPriority,
    pub cadence: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// Consecutive skipped ticks before the camera is flagged overloaded
    pub overload_skip_threshold: u32,
}

/// Control side of a running camera scheduler
pub struct SchedulerHandle {
    tier_tx: watch::Sender<Tier>,
    status_rx: watch::Receiver<CameraStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Start the sampling loop for `camera_id`.
    ///
    /// `previous` is the drain handle of an earlier scheduler for the same
    /// camera; the new loop does not tick before it has finished, so two
    /// cycles of one camera never overlap across a stop/start.
    pub fn spawn(
        camera_id: CameraId,
        tier: Tier,
        pipeline: Arc<RecognitionPipeline>,
        settings: SchedulerSettings,
        previous: Option<JoinHandle<()>>,
    ) -> Self {
        let (tier_tx, tier_rx) = watch::channel(tier);
        let (status_tx, status_rx) = watch::channel(CameraStatus {
            camera_id: camera_id.clone(),
            running: true,
            priority: tier.priority,
            cadence_ms: tier.cadence.as_millis() as u64,
            in_flight: false,
            last_cycle_at: None,
            last_error: None,
            last_result: None,
            cycles_completed: 0,
            cycles_failed: 0,
            ticks_skipped: 0,
            consecutive_skips: 0,
            overloaded: false,
        });
        let cancel = CancellationToken::new();

        let scheduler = CameraScheduler {
            camera_id,
            pipeline,
            settings,
            tier_rx,
            status_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(scheduler.run(previous));

        Self {
            tier_tx,
            status_rx,
            cancel,
            task,
        }
    }

    /// Change the cadence tier in place. Takes effect on the loop's next
    /// scheduling decision. Returns false if the tier was already current.
    pub fn retune(&self, tier: Tier) -> bool {
        self.tier_tx.send_if_modified(|current| {
            if *current == tier {
                false
            } else {
                *current = tier;
                true
            }
        })
    }

    pub fn status(&self) -> CameraStatus {
        self.status_rx.borrow().clone()
    }

    /// Cancel the loop. The returned handle resolves once any in-flight
    /// cycle has drained.
    pub fn stop(self) -> JoinHandle<()> {
        self.cancel.cancel();
        self.task
    }
}

type CycleResult = (Instant, Result<CycleOutcome, CycleError>);

struct CameraScheduler {
    camera_id: CameraId,
    pipeline: Arc<RecognitionPipeline>,
    settings: SchedulerSettings,
    tier_rx: watch::Receiver<Tier>,
    status_tx: watch::Sender<CameraStatus>,
    cancel: CancellationToken,
}

fn new_interval(start: Instant, cadence: Duration) -> Interval {
    let mut interval = interval_at(start, cadence);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

impl CameraScheduler {
    async fn run(mut self, previous: Option<JoinHandle<()>>) {
        if let Some(previous) = previous {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.finish();
                    return;
                }
                _ = previous => {}
            }
        }

        let mut tier = *self.tier_rx.borrow_and_update();
        info!(
            camera_id = %self.camera_id,
            priority = %tier.priority,
            cadence_ms = tier.cadence.as_millis() as u64,
            "camera scheduler started"
        );

        let mut interval = new_interval(Instant::now(), tier.cadence);
        let mut last_tick = Instant::now();
        let mut in_flight: JoinSet<CycleResult> = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                changed = self.tier_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = *self.tier_rx.borrow_and_update();
                    if next == tier {
                        continue;
                    }
                    // The next tick honours the new cadence from the last one
                    // fired, or fires right away if that moment has passed.
                    let start = (last_tick + next.cadence).max(Instant::now());
                    interval = new_interval(start, next.cadence);
                    info!(
                        camera_id = %self.camera_id,
                        from = %tier.priority,
                        to = %next.priority,
                        cadence_ms = next.cadence.as_millis() as u64,
                        "camera retuned"
                    );
                    tier = next;
                    self.status_tx.send_modify(|s| {
                        s.priority = tier.priority;
                        s.cadence_ms = tier.cadence.as_millis() as u64;
                    });
                }

                Some(joined) = in_flight.join_next() => {
                    self.settle(joined);
                }

                tick = interval.tick() => {
                    last_tick = tick;
                    if in_flight.is_empty() {
                        self.launch(&mut in_flight);
                    } else {
                        self.skip();
                    }
                }
            }
        }

        // Let an in-flight cycle finish; the pipeline sees the cancelled
        // token and discards its output.
        if let Some(joined) = in_flight.join_next().await {
            self.settle(joined);
        }
        self.finish();
    }

    fn launch(&self, in_flight: &mut JoinSet<CycleResult>) {
        let pipeline = self.pipeline.clone();
        let camera_id = self.camera_id.clone();
        let active = self.cancel.clone();
        in_flight.spawn(async move {
            let started = Instant::now();
            let result = pipeline.run_cycle(&camera_id, &active).await;
            (started, result)
        });

        self.status_tx.send_modify(|s| {
            s.in_flight = true;
            if s.overloaded {
                info!(
                    camera_id = %s.camera_id,
                    skipped = s.consecutive_skips,
                    "camera caught up with its cadence"
                );
                RECOGNITION_CAMERA_OVERLOADED
                    .with_label_values(&[s.camera_id.as_str()])
                    .set(0);
            }
            s.consecutive_skips = 0;
            s.overloaded = false;
        });
    }

    fn skip(&self) {
        RECOGNITION_TICKS_SKIPPED
            .with_label_values(&[self.camera_id.as_str()])
            .inc();
        let threshold = self.settings.overload_skip_threshold;
        self.status_tx.send_modify(|s| {
            s.ticks_skipped += 1;
            s.consecutive_skips = s.consecutive_skips.saturating_add(1);
            if s.consecutive_skips == threshold {
                warn!(
                    camera_id = %s.camera_id,
                    consecutive_skips = s.consecutive_skips,
                    cadence_ms = s.cadence_ms,
                    "camera overloaded: cycles take longer than the cadence"
                );
                s.overloaded = true;
                RECOGNITION_CAMERA_OVERLOADED
                    .with_label_values(&[s.camera_id.as_str()])
                    .set(1);
            } else {
                debug!(
                    camera_id = %s.camera_id,
                    consecutive_skips = s.consecutive_skips,
                    "tick skipped, cycle still in flight"
                );
            }
        });
    }

    fn settle(&self, joined: Result<CycleResult, JoinError>) {
        let now = Utc::now();
        let (status, error) = match joined {
            Ok((started, result)) => {
                RECOGNITION_CYCLE_DURATION
                    .with_label_values(&[self.camera_id.as_str()])
                    .observe(started.elapsed().as_secs_f64());
                match result {
                    Ok(CycleOutcome::Completed(report)) => {
                        debug!(
                            camera_id = %self.camera_id,
                            faces = report.faces.len(),
                            rejected = report.rejected,
                            "cycle completed"
                        );
                        let summary = CycleSummary::from(&report);
                        self.status_tx.send_modify(|s| {
                            s.cycles_completed += 1;
                            s.last_cycle_at = Some(now);
                            s.last_error = None;
                            s.last_result = Some(summary);
                        });
                        ("success", None)
                    }
                    Ok(CycleOutcome::Discarded) => ("discarded", None),
                    Err(e) => {
                        warn!(
                            camera_id = %self.camera_id,
                            stage = %e.stage(),
                            error = %e,
                            "recognition cycle failed"
                        );
                        ("failed", Some(e.to_string()))
                    }
                }
            }
            Err(e) => {
                warn!(camera_id = %self.camera_id, error = %e, "recognition cycle aborted");
                ("failed", Some(format!("cycle aborted: {}", e)))
            }
        };

        RECOGNITION_CYCLES
            .with_label_values(&[self.camera_id.as_str(), status])
            .inc();
        self.status_tx.send_modify(|s| {
            s.in_flight = false;
            if let Some(error) = error {
                s.cycles_failed += 1;
                s.last_cycle_at = Some(now);
                s.last_error = Some(error);
            }
        });
    }

    fn finish(&self) {
        RECOGNITION_CAMERA_OVERLOADED
            .with_label_values(&[self.camera_id.as_str()])
            .set(0);
        self.status_tx.send_modify(|s| {
            s.running = false;
            s.in_flight = false;
        });
        info!(camera_id = %self.camera_id, "camera scheduler stopped");
    }
}
