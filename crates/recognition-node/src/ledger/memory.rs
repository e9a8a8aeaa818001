use crate::sources::{InsertOutcome, LedgerStore};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use common::attendance::{AttendanceRecord, IdentityId};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

/// Process-local ledger. The map key carries the (identity, day) constraint;
/// check and insert happen under one lock.
#[derive(Default)]
pub struct MemoryLedgerStore {
    records: Mutex<HashMap<(IdentityId, NaiveDate), AttendanceRecord>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn has_record(&self, identity_id: &str, day: NaiveDate) -> Result<bool> {
        let records = self
            .records
            .lock()
            .map_err(|e| anyhow!("Failed to lock ledger: {}", e))?;
        Ok(records.contains_key(&(identity_id.to_string(), day)))
    }

    async fn insert_record(&self, record: &AttendanceRecord) -> Result<InsertOutcome> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| anyhow!("Failed to lock ledger: {}", e))?;
        match records.entry((record.identity_id.clone(), record.day)) {
            Entry::Occupied(_) => Ok(InsertOutcome::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn list_day(&self, day: NaiveDate) -> Result<Vec<AttendanceRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|e| anyhow!("Failed to lock ledger: {}", e))?;
        let mut listed: Vec<AttendanceRecord> = records
            .values()
            .filter(|r| r.day == day)
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(listed)
    }
}
