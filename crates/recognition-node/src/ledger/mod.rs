//! Attendance ledger gate: one record per identity per calendar day.

mod memory;
mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use crate::error::{bounded, CycleError, Stage};
use crate::sources::{InsertOutcome, LedgerStore};
use anyhow::Result;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use common::attendance::{AttendanceRecord, RecordOutcome};
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics::RECOGNITION_ATTENDANCE;
use tracing::{debug, info};

#[derive(Clone)]
pub struct AttendanceGate {
    store: Arc<dyn LedgerStore>,
    offset: FixedOffset,
    timeout: Duration,
}

impl AttendanceGate {
    pub fn new(store: Arc<dyn LedgerStore>, offset: FixedOffset, timeout: Duration) -> Self {
        Self {
            store,
            offset,
            timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Calendar day of `now` on the gate's local clock
    pub fn day_of(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    /// Record attendance unless the identity already has a record for today.
    ///
    /// The lookup only saves a write on the common path. The store's
    /// uniqueness constraint decides races between cameras: a rejected
    /// duplicate insert is reported as `AlreadyPresent`.
    pub async fn record(
        &self,
        identity_id: &str,
        camera_id: &str,
        confidence: f32,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, CycleError> {
        let day = self.day_of(now);

        let exists = bounded(
            Stage::Ledger,
            self.timeout,
            self.store.has_record(identity_id, day),
        )
        .await?;

        let outcome = if exists {
            RecordOutcome::AlreadyPresent
        } else {
            let record = AttendanceRecord {
                identity_id: identity_id.to_string(),
                day,
                recorded_at: now,
                camera_id: camera_id.to_string(),
                confidence,
            };
            match bounded(Stage::Ledger, self.timeout, self.store.insert_record(&record)).await? {
                InsertOutcome::Inserted => RecordOutcome::Created,
                InsertOutcome::Duplicate => RecordOutcome::AlreadyPresent,
            }
        };

        RECOGNITION_ATTENDANCE
            .with_label_values(&[outcome.as_str()])
            .inc();
        match outcome {
            RecordOutcome::Created => info!(
                identity_id,
                camera_id,
                confidence,
                day = %day,
                "attendance recorded"
            ),
            RecordOutcome::AlreadyPresent => {
                debug!(identity_id, camera_id, day = %day, "identity already present today")
            }
        }
        Ok(outcome)
    }

    /// Records of `day`, bounded by the ledger timeout
    pub async fn list_day(&self, day: NaiveDate) -> Result<Vec<AttendanceRecord>, CycleError> {
        bounded(Stage::Ledger, self.timeout, self.store.list_day(day)).await
    }
}
