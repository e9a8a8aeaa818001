//! One recognition cycle: frame, detect, filter, match, attendance, publish.
//! Frames pushed over the API go through the same stages.

use crate::config::{EngineConfig, TimeoutConfig};
use crate::error::{bounded, CycleError, Stage};
use crate::ledger::AttendanceGate;
use crate::matcher::MatchResolver;
use crate::quality::QualityFilter;
use crate::sources::{FaceDetector, FaceEmbedder, FrameSource, IdentityGallery, LedgerStore};
use chrono::{DateTime, Utc};
use common::attendance::{
    AttendanceOutcome, CycleReport, FaceResult, MatchDecision, QualityVerdict, RecordOutcome,
};
use image::DynamicImage;
use std::sync::Arc;
use telemetry::metrics::{RECOGNITION_DECISIONS, RECOGNITION_QUALITY_REJECTIONS};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Capacity of the report side channel; slow subscribers lose the oldest reports
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How a cycle that reached its end was settled
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Report was published and attendance recorded
    Completed(CycleReport),
    /// Camera was stopped while the cycle ran; the report was not published
    Discarded,
}

/// External collaborators of the pipeline
#[derive(Clone)]
pub struct Collaborators {
    pub frames: Arc<dyn FrameSource>,
    pub detector: Arc<dyn FaceDetector>,
    pub embedder: Arc<dyn FaceEmbedder>,
    pub gallery: Arc<dyn IdentityGallery>,
    pub ledger: Arc<dyn LedgerStore>,
}

pub struct RecognitionPipeline {
    frames: Arc<dyn FrameSource>,
    detector: Arc<dyn FaceDetector>,
    quality: QualityFilter,
    resolver: MatchResolver,
    gate: AttendanceGate,
    timeouts: TimeoutConfig,
    events: broadcast::Sender<CycleReport>,
}

impl RecognitionPipeline {
    pub fn new(config: &EngineConfig, collaborators: Collaborators) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            frames: collaborators.frames,
            detector: collaborators.detector,
            quality: QualityFilter::new(config.quality.clone()),
            resolver: MatchResolver::new(
                config.matching.clone(),
                config.timeouts,
                collaborators.embedder,
                collaborators.gallery,
            ),
            gate: AttendanceGate::new(
                collaborators.ledger,
                config.day_offset,
                config.timeouts.ledger,
            ),
            timeouts: config.timeouts,
            events,
        }
    }

    pub fn gate(&self) -> &AttendanceGate {
        &self.gate
    }

    pub fn gallery(&self) -> &Arc<dyn IdentityGallery> {
        self.resolver.gallery()
    }

    /// Subscribe to published cycle reports
    pub fn subscribe(&self) -> broadcast::Receiver<CycleReport> {
        self.events.subscribe()
    }

    /// Run one cycle for `camera_id`.
    ///
    /// `active` is the camera's scheduling token. Once it is cancelled the
    /// cycle still finishes its in-flight call, but attendance and
    /// publishing are skipped.
    #[instrument(skip_all, fields(camera_id = %camera_id))]
    pub async fn run_cycle(
        &self,
        camera_id: &str,
        active: &CancellationToken,
    ) -> Result<CycleOutcome, CycleError> {
        let frame = bounded(
            Stage::Frame,
            self.timeouts.frame,
            self.frames.get_frame(camera_id),
        )
        .await?;

        let (faces, rejected) = self.analyze(&frame).await?;
        // Decoded frame is scoped to the detection and matching stages.
        drop(frame);

        if active.is_cancelled() {
            debug!("camera stopped during cycle, discarding results");
            return Ok(CycleOutcome::Discarded);
        }

        let timestamp = Utc::now();
        let attendance = self.record_attendance(camera_id, &faces, timestamp).await?;
        let report = CycleReport {
            camera_id: camera_id.to_string(),
            timestamp,
            faces,
            rejected,
            attendance,
        };

        if active.is_cancelled() {
            debug!("camera stopped during attendance, discarding report");
            return Ok(CycleOutcome::Discarded);
        }
        // No subscribers is fine.
        let _ = self.events.send(report.clone());

        Ok(CycleOutcome::Completed(report))
    }

    /// Recognize faces in a frame pushed by a client rather than sampled
    /// by a scheduler. Attendance is recorded only when `mark_attendance`
    /// is set; the report is published either way.
    #[instrument(skip_all, fields(camera_id = %camera_id, mark_attendance = mark_attendance))]
    pub async fn recognize_frame(
        &self,
        camera_id: &str,
        frame: DynamicImage,
        mark_attendance: bool,
    ) -> Result<CycleReport, CycleError> {
        let (faces, rejected) = self.analyze(&frame).await?;
        drop(frame);

        let timestamp = Utc::now();
        let attendance = if mark_attendance {
            self.record_attendance(camera_id, &faces, timestamp).await?
        } else {
            Vec::new()
        };
        let report = CycleReport {
            camera_id: camera_id.to_string(),
            timestamp,
            faces,
            rejected,
            attendance,
        };
        let _ = self.events.send(report.clone());

        Ok(report)
    }

    /// Detect, filter and resolve every face of one frame
    async fn analyze(&self, frame: &DynamicImage) -> Result<(Vec<FaceResult>, usize), CycleError> {
        let detections =
            bounded(Stage::Detect, self.timeouts.detect, self.detector.detect(frame)).await?;

        let mut faces = Vec::with_capacity(detections.len());
        let mut rejected = 0usize;
        for detection in &detections {
            if let QualityVerdict::Reject { reason } = self.quality.evaluate(detection, frame) {
                debug!(reason = %reason, confidence = detection.confidence, "detection rejected");
                RECOGNITION_QUALITY_REJECTIONS
                    .with_label_values(&[reason.as_str()])
                    .inc();
                rejected += 1;
                continue;
            }

            let decision = self.resolver.resolve(detection, frame).await?;
            let face = match decision {
                MatchDecision::Recognized {
                    identity_id,
                    confidence,
                } => {
                    RECOGNITION_DECISIONS.with_label_values(&["recognized"]).inc();
                    FaceResult {
                        bbox: detection.bbox,
                        recognized: true,
                        identity_label: self.gallery().label(&identity_id),
                        identity_id: Some(identity_id),
                        confidence: Some(confidence),
                    }
                }
                MatchDecision::Unknown => {
                    RECOGNITION_DECISIONS.with_label_values(&["unknown"]).inc();
                    FaceResult {
                        bbox: detection.bbox,
                        recognized: false,
                        identity_id: None,
                        identity_label: None,
                        confidence: None,
                    }
                }
            };
            faces.push(face);
        }
        Ok((faces, rejected))
    }

    async fn record_attendance(
        &self,
        camera_id: &str,
        faces: &[FaceResult],
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<AttendanceOutcome>, CycleError> {
        let mut attendance = Vec::new();
        for face in faces {
            let (Some(identity_id), Some(confidence)) = (&face.identity_id, face.confidence) else {
                continue;
            };
            let outcome = self
                .gate
                .record(identity_id, camera_id, confidence, timestamp)
                .await?;
            attendance.push(AttendanceOutcome {
                identity_id: identity_id.clone(),
                camera_id: camera_id.to_string(),
                created: outcome == RecordOutcome::Created,
            });
        }
        Ok(attendance)
    }
}
