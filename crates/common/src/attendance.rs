//! Attendance recognition contracts.
//!
//! These are the values that flow through one recognition cycle (detections,
//! verdicts, match decisions), the attendance records the ledger persists and
//! the reports published to the rendering layer.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type CameraId = String;
pub type IdentityId = String;

/// Monitoring priority of a camera. Drives the cadence tier of its scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraPriority {
    /// Monitored only in aggregate (grid view), slow cadence
    #[default]
    Background,
    /// The single camera under focused view, fast cadence
    Focused,
}

impl fmt::Display for CameraPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraPriority::Background => write!(f, "background"),
            CameraPriority::Focused => write!(f, "focused"),
        }
    }
}

impl FromStr for CameraPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "background" => Ok(CameraPriority::Background),
            "focused" => Ok(CameraPriority::Focused),
            _ => Err(format!("Invalid camera priority: {}", s)),
        }
    }
}

/// Camera as seen by the scheduling layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Camera {
    pub camera_id: CameraId,
    pub active: bool,
    #[serde(default)]
    pub priority: CameraPriority,
}

/// One entry of the desired fleet state handed to `reconcile`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredCamera {
    pub camera_id: CameraId,
    #[serde(default)]
    pub priority: CameraPriority,
}

impl DesiredCamera {
    pub fn new(camera_id: impl Into<CameraId>, priority: CameraPriority) -> Self {
        Self {
            camera_id: camera_id.into(),
            priority,
        }
    }

    pub fn background(camera_id: impl Into<CameraId>) -> Self {
        Self::new(camera_id, CameraPriority::Background)
    }

    pub fn focused(camera_id: impl Into<CameraId>) -> Self {
        Self::new(camera_id, CameraPriority::Focused)
    }
}

/// Operator view mode. `Single` puts one camera in focused priority.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ViewMode {
    #[default]
    Grid,
    Single { camera_id: CameraId },
}

/// Face bounding box in frame pixel coordinates (x1,y1 top-left, x2,y2 bottom-right)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn shorter_side(&self) -> f32 {
        self.width().min(self.height())
    }

    /// width / height, `None` for a degenerate box
    pub fn aspect_ratio(&self) -> Option<f32> {
        let height = self.height();
        if height > 0.0 {
            Some(self.width() / height)
        } else {
            None
        }
    }
}

/// One raw face finding produced by the external detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Raw detector confidence (0.0 to 1.0)
    pub confidence: f32,
    /// Five-point landmarks (eyes, nose, mouth corners) when the detector provides them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<Vec<[f32; 2]>>,
}

/// Why the quality filter turned a detection away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Confidence,
    Size,
    AreaRatio,
    AspectRatio,
    Sharpness,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Confidence => "confidence",
            RejectReason::Size => "size",
            RejectReason::AreaRatio => "area_ratio",
            RejectReason::AspectRatio => "aspect_ratio",
            RejectReason::Sharpness => "sharpness",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum QualityVerdict {
    Accept,
    Reject { reason: RejectReason },
}

impl QualityVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, QualityVerdict::Accept)
    }
}

/// One nearest-neighbour hit returned by the gallery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub identity_id: IdentityId,
    /// Cosine similarity to the query embedding
    pub similarity: f32,
}

impl MatchCandidate {
    pub fn new(identity_id: impl Into<IdentityId>, similarity: f32) -> Self {
        Self {
            identity_id: identity_id.into(),
            similarity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum MatchDecision {
    Recognized {
        identity_id: IdentityId,
        confidence: f32,
    },
    Unknown,
}

impl MatchDecision {
    pub fn is_recognized(&self) -> bool {
        matches!(self, MatchDecision::Recognized { .. })
    }
}

/// One persisted attendance event. At most one exists per (identity_id, day).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity_id: IdentityId,
    pub day: NaiveDate,
    pub recorded_at: DateTime<Utc>,
    pub camera_id: CameraId,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Created,
    AlreadyPresent,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Created => "created",
            RecordOutcome::AlreadyPresent => "already_present",
        }
    }
}

/// Attendance outcome as published to the reporting layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceOutcome {
    pub identity_id: IdentityId,
    pub camera_id: CameraId,
    pub created: bool,
}

/// Per-face result published to the rendering layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceResult {
    pub bbox: BoundingBox,
    pub recognized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<IdentityId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Everything one completed cycle produced for one camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub camera_id: CameraId,
    pub timestamp: DateTime<Utc>,
    pub faces: Vec<FaceResult>,
    /// Detections turned away by the quality filter
    pub rejected: usize,
    pub attendance: Vec<AttendanceOutcome>,
}

impl CycleReport {
    pub fn recognized_ids(&self) -> Vec<IdentityId> {
        self.faces
            .iter()
            .filter_map(|face| face.identity_id.clone())
            .collect()
    }
}

/// Lightweight summary of the last successful cycle of a camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub timestamp: DateTime<Utc>,
    pub recognized: Vec<IdentityId>,
    pub count: usize,
}

impl From<&CycleReport> for CycleSummary {
    fn from(report: &CycleReport) -> Self {
        let recognized = report.recognized_ids();
        Self {
            timestamp: report.timestamp,
            count: recognized.len(),
            recognized,
        }
    }
}

/// Frame pushed by a client for one-off recognition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizeRequest {
    pub camera_id: CameraId,
    /// Base64 image, optionally as a `data:` URL
    pub frame_base64: String,
    #[serde(default = "default_mark_attendance")]
    pub mark_attendance: bool,
}

/// Query of the raw-bytes variant of [`RecognizeRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizeFileQuery {
    pub camera_id: CameraId,
    #[serde(default = "default_mark_attendance")]
    pub mark_attendance: bool,
}

fn default_mark_attendance() -> bool {
    true
}

/// Scheduler status of one camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraStatus {
    pub camera_id: CameraId,
    pub running: bool,
    pub priority: CameraPriority,
    pub cadence_ms: u64,
    pub in_flight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<CycleSummary>,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub ticks_skipped: u64,
    pub consecutive_skips: u32,
    pub overloaded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraListResponse {
    pub cameras: Vec<CameraStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focused: Option<CameraId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceListResponse {
    pub day: NaiveDate,
    pub records: Vec<AttendanceRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceStats {
    pub day: NaiveDate,
    pub present: usize,
    pub known_identities: usize,
    pub absent: usize,
    pub attendance_percentage: f64,
}

impl AttendanceStats {
    pub fn compute(day: NaiveDate, present: usize, known_identities: usize) -> Self {
        let absent = known_identities.saturating_sub(present);
        let attendance_percentage = if known_identities > 0 {
            ((present as f64 / known_identities as f64) * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        Self {
            day,
            present,
            known_identities,
            absent,
            attendance_percentage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryStats {
    pub identities: usize,
    pub embeddings: usize,
    pub dimension: usize,
}
