//! Seams to the collaborators a recognition cycle depends on.
//!
//! Every call here may block on I/O; the pipeline wraps each one in its own
//! timeout. Implementations must be safe to share across camera tasks.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use common::attendance::{
    AttendanceRecord, DesiredCamera, Detection, GalleryStats, IdentityId, MatchCandidate,
};
use image::DynamicImage;

/// Latest decoded frame of a camera
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn get_frame(&self, camera_id: &str) -> Result<DynamicImage>;
}

/// Face detector: frame in, raw face findings out
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect(&self, frame: &DynamicImage) -> Result<Vec<Detection>>;
}

/// Face embedder: face crop in, fixed-length vector out (not necessarily normalized)
#[async_trait]
pub trait FaceEmbedder: Send + Sync {
    async fn embed(&self, face: &DynamicImage) -> Result<Vec<f32>>;
}

/// Read-mostly store of enrolled identity embeddings
#[async_trait]
pub trait IdentityGallery: Send + Sync {
    /// Up to `k` stored embeddings most similar to `query`, best first.
    /// `query` is L2-normalized.
    async fn top_k(&self, query: &[f32], k: usize) -> Result<Vec<MatchCandidate>>;

    /// Display label of an identity, if the gallery knows one
    fn label(&self, identity_id: &str) -> Option<String>;

    fn identity_count(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.identity_count() == 0
    }

    fn stats(&self) -> GalleryStats;
}

/// Result of an insert against the ledger's (identity, day) uniqueness constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Attendance storage. Must enforce uniqueness of (identity_id, day) atomically.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn has_record(&self, identity_id: &str, day: NaiveDate) -> Result<bool>;

    async fn insert_record(&self, record: &AttendanceRecord) -> Result<InsertOutcome>;

    async fn list_day(&self, day: NaiveDate) -> Result<Vec<AttendanceRecord>>;

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Source of the desired camera set
#[async_trait]
pub trait CameraRegistry: Send + Sync {
    async fn list_active(&self) -> Result<Vec<DesiredCamera>>;
}

/// Identities present in a list of records, in record order
pub fn present_identities(records: &[AttendanceRecord]) -> Vec<IdentityId> {
    let mut seen = std::collections::HashSet::new();
    records
        .iter()
        .filter(|r| seen.insert(r.identity_id.clone()))
        .map(|r| r.identity_id.clone())
        .collect()
}
