//! Reconciles the set of running camera schedulers against the desired
//! camera state and the operator's view mode.

use crate::config::CadenceConfig;
use crate::pipeline::RecognitionPipeline;
use crate::scheduler::{SchedulerHandle, SchedulerSettings, Tier};
use crate::sources::CameraRegistry;
use anyhow::{bail, Result};
use common::attendance::{CameraId, CameraPriority, CameraStatus, DesiredCamera, ViewMode};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics::{RECOGNITION_ACTIVE_CAMERAS, RECOGNITION_FOCUSED_CAMERA};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one `reconcile` call changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub started: Vec<CameraId>,
    pub stopped: Vec<CameraId>,
    pub retuned: Vec<CameraId>,
    pub focused: Option<CameraId>,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.retuned.is_empty()
    }
}

#[derive(Default)]
struct FleetState {
    schedulers: HashMap<CameraId, SchedulerHandle>,
    /// Stopped schedulers whose last cycle may still be finishing
    draining: HashMap<CameraId, JoinHandle<()>>,
    focused: Option<CameraId>,
    /// Cameras that asked for focus in the last reconciled set
    focus_requests: HashSet<CameraId>,
    /// Last camera set reported by the registry
    registry: Vec<DesiredCamera>,
    view: ViewMode,
}

/// Owner of every per-camera scheduler on this node
pub struct FleetCoordinator {
    pipeline: Arc<RecognitionPipeline>,
    cadence: CadenceConfig,
    settings: SchedulerSettings,
    state: Mutex<FleetState>,
}

/// Resolve the single focused camera of a desired set.
///
/// A focus request that was not part of the previous desired set wins and
/// demotes the current focus. Without a new request the current focus is
/// kept while it is still requested, so reconciling the same set twice
/// changes nothing.
fn resolve_focus(
    desired: &[DesiredCamera],
    current: Option<&str>,
    previous_requests: &HashSet<CameraId>,
) -> Option<CameraId> {
    let requested: Vec<&str> = desired
        .iter()
        .filter(|c| c.priority == CameraPriority::Focused)
        .map(|c| c.camera_id.as_str())
        .collect();
    requested
        .iter()
        .find(|id| Some(**id) != current && !previous_requests.contains(**id))
        .or_else(|| requested.iter().find(|id| Some(**id) == current))
        .or_else(|| requested.first())
        .map(|id| id.to_string())
}

/// Apply the operator view on top of the registry's camera set
fn overlay_view(registry: &[DesiredCamera], view: &ViewMode) -> Vec<DesiredCamera> {
    match view {
        ViewMode::Grid => registry.to_vec(),
        ViewMode::Single { camera_id } => registry
            .iter()
            .map(|c| {
                let priority = if &c.camera_id == camera_id {
                    CameraPriority::Focused
                } else {
                    CameraPriority::Background
                };
                DesiredCamera::new(c.camera_id.clone(), priority)
            })
            .collect(),
    }
}

impl FleetCoordinator {
    pub fn new(
        pipeline: Arc<RecognitionPipeline>,
        cadence: CadenceConfig,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            pipeline,
            cadence,
            settings,
            state: Mutex::new(FleetState::default()),
        }
    }

    pub fn pipeline(&self) -> &Arc<RecognitionPipeline> {
        &self.pipeline
    }

    fn tier(&self, priority: CameraPriority) -> Tier {
        Tier {
            priority,
            cadence: self.cadence.for_priority(priority),
        }
    }

    /// Bring the running schedulers in line with `desired`.
    ///
    /// New cameras are started at their tier, missing ones stopped, and
    /// cameras whose priority changed are retuned in place. At most one
    /// camera ends up focused.
    pub async fn reconcile(&self, desired: Vec<DesiredCamera>) -> ReconcileSummary {
        let mut state = self.state.lock().await;
        self.reconcile_locked(&mut state, desired)
    }

    fn reconcile_locked(
        &self,
        state: &mut FleetState,
        desired: Vec<DesiredCamera>,
    ) -> ReconcileSummary {
        state.draining.retain(|_, handle| !handle.is_finished());

        let mut seen = HashSet::new();
        let desired: Vec<DesiredCamera> = desired
            .into_iter()
            .filter(|c| seen.insert(c.camera_id.clone()))
            .collect();
        let focused = resolve_focus(&desired, state.focused.as_deref(), &state.focus_requests);
        state.focus_requests = desired
            .iter()
            .filter(|c| c.priority == CameraPriority::Focused)
            .map(|c| c.camera_id.clone())
            .collect();

        let mut summary = ReconcileSummary {
            focused: focused.clone(),
            ..Default::default()
        };

        let removed: Vec<CameraId> = state
            .schedulers
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for camera_id in removed {
            if let Some(handle) = state.schedulers.remove(&camera_id) {
                state.draining.insert(camera_id.clone(), handle.stop());
                RECOGNITION_FOCUSED_CAMERA
                    .with_label_values(&[camera_id.as_str()])
                    .set(0);
                summary.stopped.push(camera_id);
            }
        }

        for camera in desired {
            let priority = if focused.as_deref() == Some(camera.camera_id.as_str()) {
                CameraPriority::Focused
            } else {
                CameraPriority::Background
            };
            let tier = self.tier(priority);

            match state.schedulers.get(&camera.camera_id) {
                Some(handle) => {
                    if handle.retune(tier) {
                        summary.retuned.push(camera.camera_id.clone());
                    }
                }
                None => {
                    let previous = state.draining.remove(&camera.camera_id);
                    let handle = SchedulerHandle::spawn(
                        camera.camera_id.clone(),
                        tier,
                        self.pipeline.clone(),
                        self.settings,
                        previous,
                    );
                    state.schedulers.insert(camera.camera_id.clone(), handle);
                    summary.started.push(camera.camera_id.clone());
                }
            }

            RECOGNITION_FOCUSED_CAMERA
                .with_label_values(&[camera.camera_id.as_str()])
                .set(i64::from(priority == CameraPriority::Focused));
        }

        if state.focused != focused {
            info!(from = ?state.focused, to = ?focused, "focused camera changed");
        }
        state.focused = focused;
        RECOGNITION_ACTIVE_CAMERAS.set(state.schedulers.len() as i64);

        if summary.is_noop() {
            debug!(cameras = state.schedulers.len(), "fleet already reconciled");
        } else {
            info!(
                started = ?summary.started,
                stopped = ?summary.stopped,
                retuned = ?summary.retuned,
                focused = ?summary.focused,
                "fleet reconciled"
            );
        }
        summary
    }

    /// Record a fresh registry snapshot and reconcile it under the current view
    pub async fn apply_registry(&self, cameras: Vec<DesiredCamera>) -> ReconcileSummary {
        let mut state = self.state.lock().await;
        if let ViewMode::Single { camera_id } = &state.view {
            if !cameras.iter().any(|c| &c.camera_id == camera_id) {
                info!(camera_id = %camera_id, "focused camera left the registry, back to grid view");
                state.view = ViewMode::Grid;
            }
        }
        let desired = overlay_view(&cameras, &state.view);
        state.registry = cameras;
        self.reconcile_locked(&mut state, desired)
    }

    /// Switch between grid and single-camera view
    pub async fn set_view(&self, view: ViewMode) -> Result<ReconcileSummary> {
        let mut state = self.state.lock().await;
        if let ViewMode::Single { camera_id } = &view {
            if !state.registry.iter().any(|c| &c.camera_id == camera_id) {
                bail!("camera '{}' is not active", camera_id);
            }
        }
        let desired = overlay_view(&state.registry, &view);
        state.view = view;
        Ok(self.reconcile_locked(&mut state, desired))
    }

    pub async fn view(&self) -> ViewMode {
        self.state.lock().await.view.clone()
    }

    pub async fn focused(&self) -> Option<CameraId> {
        self.state.lock().await.focused.clone()
    }

    pub async fn statuses(&self) -> Vec<CameraStatus> {
        let state = self.state.lock().await;
        let mut statuses: Vec<CameraStatus> =
            state.schedulers.values().map(|h| h.status()).collect();
        statuses.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        statuses
    }

    pub async fn status(&self, camera_id: &str) -> Option<CameraStatus> {
        let state = self.state.lock().await;
        state.schedulers.get(camera_id).map(|h| h.status())
    }

    pub async fn camera_count(&self) -> usize {
        self.state.lock().await.schedulers.len()
    }

    /// Stop every scheduler and wait for in-flight cycles to drain
    pub async fn stop_all(&self) {
        let handles: Vec<(CameraId, JoinHandle<()>)> = {
            let mut state = self.state.lock().await;
            let mut handles: Vec<_> = state
                .schedulers
                .drain()
                .map(|(id, handle)| (id, handle.stop()))
                .collect();
            handles.extend(state.draining.drain());
            state.focused = None;
            state.focus_requests.clear();
            handles
        };
        RECOGNITION_ACTIVE_CAMERAS.set(0);

        info!(cameras = handles.len(), "stopping all camera schedulers");
        for (camera_id, handle) in handles {
            if let Err(e) = handle.await {
                warn!(camera_id = %camera_id, error = %e, "camera scheduler ended abnormally");
            }
        }
    }

    /// Poll the camera registry until `cancel` fires
    pub async fn run_registry_loop(
        self: Arc<Self>,
        registry: Arc<dyn CameraRegistry>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("camera registry polling stopped");
                    break;
                }
                _ = interval.tick() => {
                    // A registry call still in flight at shutdown is dropped, never applied
                    let listed = tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("camera registry polling stopped");
                            break;
                        }
                        listed = registry.list_active() => listed,
                    };
                    match listed {
                        Ok(cameras) => {
                            self.apply_registry(cameras).await;
                        }
                        Err(e) => {
                            // Keep the current fleet; a registry outage is not a reason to stop cameras.
                            warn!(error = %e, "failed to list active cameras");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_focus_prefers_new_request() {
        let desired = vec![
            DesiredCamera::focused("x"),
            DesiredCamera::background("z"),
            DesiredCamera::focused("y"),
        ];
        let none = HashSet::new();
        let only_x: HashSet<CameraId> = ["x".to_string()].into();
        let both: HashSet<CameraId> = ["x".to_string(), "y".to_string()].into();

        assert_eq!(resolve_focus(&desired, Some("x"), &only_x), Some("y".to_string()));
        assert_eq!(resolve_focus(&desired, None, &none), Some("x".to_string()));
        // Same requests as last time: the current focus stays
        assert_eq!(resolve_focus(&desired, Some("y"), &both), Some("y".to_string()));
        assert_eq!(resolve_focus(&desired, Some("x"), &both), Some("x".to_string()));
        assert_eq!(
            resolve_focus(&[DesiredCamera::focused("x")], Some("x"), &only_x),
            Some("x".to_string())
        );
        assert_eq!(
            resolve_focus(&[DesiredCamera::background("x")], Some("x"), &only_x),
            None
        );
    }

    #[test]
    fn test_overlay_single_view() {
        let registry = vec![
            DesiredCamera::focused("a"),
            DesiredCamera::background("b"),
        ];
        let overlaid = overlay_view(
            &registry,
            &ViewMode::Single {
                camera_id: "b".to_string(),
            },
        );
        assert_eq!(
            overlaid,
            vec![DesiredCamera::background("a"), DesiredCamera::focused("b")]
        );
        assert_eq!(overlay_view(&registry, &ViewMode::Grid), registry);
    }
}
