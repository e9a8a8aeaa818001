use crate::fleet::FleetCoordinator;
use crate::ledger::AttendanceGate;
use crate::sources::IdentityGallery;
use chrono::{NaiveDate, Utc};
use common::attendance::CycleReport;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct RecognitionNodeState {
    inner: Arc<RecognitionNodeStateInner>,
}

struct RecognitionNodeStateInner {
    node_id: String,
    fleet: Arc<FleetCoordinator>,
    /// Cancels background loops (registry polling) on shutdown
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl RecognitionNodeState {
    pub fn new(node_id: String, fleet: Arc<FleetCoordinator>) -> Self {
        Self {
            inner: Arc::new(RecognitionNodeStateInner {
                node_id,
                fleet,
                shutdown: CancellationToken::new(),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn fleet(&self) -> &Arc<FleetCoordinator> {
        &self.inner.fleet
    }

    pub fn gate(&self) -> &AttendanceGate {
        self.inner.fleet.pipeline().gate()
    }

    pub fn gallery(&self) -> &Arc<dyn IdentityGallery> {
        self.inner.fleet.pipeline().gallery()
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<CycleReport> {
        self.inner.fleet.pipeline().subscribe()
    }

    /// Today on the ledger's clock
    pub fn today(&self) -> NaiveDate {
        self.gate().day_of(Utc::now())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Spawn a loop that must observe [`Self::shutdown_token`]. Shutdown
    /// waits for it before stopping the fleet.
    pub fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.inner
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    /// Stop background loops, then every camera scheduler
    pub async fn shutdown(&self) {
        info!(node_id = %self.node_id(), "shutting down recognition node");
        self.inner.shutdown.cancel();

        let background: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .background
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in background {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        self.inner.fleet.stop_all().await;
    }
}
