/// Integration tests for one recognition cycle
use chrono::FixedOffset;
use common::attendance::{BoundingBox, Detection};
use recognition_node::{
    config::EngineConfig,
    error::Stage,
    gallery::{EnrolledIdentity, MemoryGallery},
    ledger::MemoryLedgerStore,
    mock::{MockDetector, MockEmbedder, MockFrameSource},
    sources::LedgerStore,
    Collaborators, CycleError, CycleOutcome, RecognitionPipeline,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Harness {
    pipeline: RecognitionPipeline,
    detector: Arc<MockDetector>,
    embedder: Arc<MockEmbedder>,
    ledger: Arc<MemoryLedgerStore>,
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        day_offset: FixedOffset::east_opt(0).unwrap(),
        ..EngineConfig::default()
    }
}

/// Gallery where identity A has e1 (0.72 to the face embedding) and e2 (0.40 to it)
fn gallery_with_a() -> MemoryGallery {
    let gallery = MemoryGallery::new(3);
    gallery
        .enroll(EnrolledIdentity {
            identity_id: "A".to_string(),
            label: Some("Ada Lovelace".to_string()),
            embeddings: vec![
                vec![0.72, (1.0f32 - 0.72 * 0.72).sqrt(), 0.0],
                vec![0.40, 0.0, (1.0f32 - 0.40 * 0.40).sqrt()],
            ],
        })
        .unwrap();
    gallery
        .enroll(EnrolledIdentity {
            identity_id: "B".to_string(),
            label: None,
            embeddings: vec![vec![0.0, 0.0, 1.0]],
        })
        .unwrap();
    gallery
}

fn face_embedding() -> Vec<f32> {
    vec![1.0, 0.0, 0.0]
}

fn harness(gallery: MemoryGallery) -> Harness {
    let detector = Arc::new(MockDetector::single_face());
    let embedder = Arc::new(MockEmbedder::new(face_embedding()));
    let ledger = Arc::new(MemoryLedgerStore::new());
    let pipeline = RecognitionPipeline::new(
        &engine_config(),
        Collaborators {
            frames: Arc::new(MockFrameSource::new(640, 480)),
            detector: detector.clone(),
            embedder: embedder.clone(),
            gallery: Arc::new(gallery),
            ledger: ledger.clone(),
        },
    );
    Harness {
        pipeline,
        detector,
        embedder,
        ledger,
    }
}

fn completed(outcome: CycleOutcome) -> common::attendance::CycleReport {
    match outcome {
        CycleOutcome::Completed(report) => report,
        CycleOutcome::Discarded => panic!("cycle was discarded"),
    }
}

#[tokio::test]
async fn test_best_embedding_of_identity_is_recognized() {
    let h = harness(gallery_with_a());
    let active = CancellationToken::new();

    let report = completed(h.pipeline.run_cycle("cam-1", &active).await.unwrap());

    assert_eq!(report.camera_id, "cam-1");
    assert_eq!(report.faces.len(), 1);
    let face = &report.faces[0];
    assert!(face.recognized);
    assert_eq!(face.identity_id.as_deref(), Some("A"));
    assert_eq!(face.identity_label.as_deref(), Some("Ada Lovelace"));
    assert!((face.confidence.unwrap() - 0.72).abs() < 1e-4);

    assert_eq!(report.attendance.len(), 1);
    assert!(report.attendance[0].created);
    assert_eq!(report.attendance[0].identity_id, "A");
    assert_eq!(h.ledger.len(), 1);
}

#[tokio::test]
async fn test_repeat_recognition_same_day_is_already_present() {
    let h = harness(gallery_with_a());
    let active = CancellationToken::new();

    let first = completed(h.pipeline.run_cycle("cam-1", &active).await.unwrap());
    let second = completed(h.pipeline.run_cycle("cam-2", &active).await.unwrap());

    assert!(first.attendance[0].created);
    assert!(!second.attendance[0].created);
    assert_eq!(second.attendance[0].camera_id, "cam-2");
    assert_eq!(h.ledger.len(), 1);
}

#[tokio::test]
async fn test_two_faces_of_same_identity_record_once() {
    let h = harness(gallery_with_a());
    h.detector.set_detections(vec![
        Detection {
            bbox: BoundingBox::new(50.0, 50.0, 150.0, 160.0),
            confidence: 0.9,
            landmarks: None,
        },
        Detection {
            bbox: BoundingBox::new(400.0, 200.0, 500.0, 310.0),
            confidence: 0.9,
            landmarks: None,
        },
    ]);

    let report = completed(
        h.pipeline
            .run_cycle("cam-1", &CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(report.faces.len(), 2);
    assert!(report.faces.iter().all(|f| f.recognized));
    let created: Vec<bool> = report.attendance.iter().map(|a| a.created).collect();
    assert_eq!(created, vec![true, false]);
    assert_eq!(h.ledger.len(), 1);
}

#[tokio::test]
async fn test_below_threshold_resolves_unknown() {
    let h = harness(gallery_with_a());
    // Best similarity to A is 0.20 (via e2), under the 0.55 default threshold
    h.embedder
        .set_embedding(vec![0.5, -(1.0f32 - 0.25).sqrt(), 0.0]);

    let report = completed(
        h.pipeline
            .run_cycle("cam-1", &CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(report.faces.len(), 1);
    assert!(!report.faces[0].recognized);
    assert_eq!(report.faces[0].identity_id, None);
    assert!(report.attendance.is_empty());
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn test_small_face_rejected_without_embedding() {
    let h = harness(gallery_with_a());
    h.detector.set_detections(vec![Detection {
        bbox: BoundingBox::new(100.0, 100.0, 130.0, 130.0),
        confidence: 0.99,
        landmarks: None,
    }]);

    let report = completed(
        h.pipeline
            .run_cycle("cam-1", &CancellationToken::new())
            .await
            .unwrap(),
    );

    assert!(report.faces.is_empty());
    assert_eq!(report.rejected, 1);
    assert_eq!(h.embedder.calls(), 0);
}

#[tokio::test]
async fn test_empty_gallery_resolves_unknown_without_embedding() {
    let h = harness(MemoryGallery::new(3));

    let report = completed(
        h.pipeline
            .run_cycle("cam-1", &CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(report.faces.len(), 1);
    assert!(!report.faces[0].recognized);
    assert_eq!(h.embedder.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_detector_timeout_fails_cycle() {
    let h = harness(gallery_with_a());
    h.detector.set_delay(Duration::from_secs(30));

    let err = h
        .pipeline
        .run_cycle("cam-1", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CycleError::Timeout {
            stage: Stage::Detect,
            ..
        }
    ));
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn test_embedder_error_fails_cycle() {
    let h = harness(gallery_with_a());
    h.embedder.set_failing(true);

    let err = h
        .pipeline
        .run_cycle("cam-1", &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Stage::Embed);
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn test_detector_error_fails_cycle() {
    let h = harness(gallery_with_a());
    h.detector.set_failing(true);

    let err = h
        .pipeline
        .run_cycle("cam-1", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CycleError::Detector(_)));
}

#[tokio::test]
async fn test_stopped_camera_discards_results() {
    let h = harness(gallery_with_a());
    let mut reports = h.pipeline.subscribe();
    let active = CancellationToken::new();
    active.cancel();

    let outcome = h.pipeline.run_cycle("cam-1", &active).await.unwrap();

    assert_eq!(outcome, CycleOutcome::Discarded);
    assert!(h.ledger.is_empty());
    assert!(reports.try_recv().is_err());
}

#[tokio::test]
async fn test_report_is_published() {
    let h = harness(gallery_with_a());
    let mut reports = h.pipeline.subscribe();

    h.pipeline
        .run_cycle("cam-7", &CancellationToken::new())
        .await
        .unwrap();

    let published = reports.try_recv().unwrap();
    assert_eq!(published.camera_id, "cam-7");
    assert_eq!(published.recognized_ids(), vec!["A".to_string()]);
    let day = h.pipeline.gate().day_of(published.timestamp);
    assert_eq!(h.ledger.list_day(day).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_pushed_frame_goes_through_the_same_stages() {
    let h = harness(gallery_with_a());
    let mut reports = h.pipeline.subscribe();

    let report = h
        .pipeline
        .recognize_frame("kiosk", recognition_node::mock::textured_frame(640, 480), true)
        .await
        .unwrap();

    assert_eq!(report.recognized_ids(), vec!["A".to_string()]);
    assert!(report.attendance[0].created);
    assert_eq!(h.ledger.len(), 1);
    assert_eq!(reports.try_recv().unwrap().camera_id, "kiosk");
}

#[tokio::test]
async fn test_pushed_frame_without_marking_leaves_ledger_alone() {
    let h = harness(gallery_with_a());

    let report = h
        .pipeline
        .recognize_frame("kiosk", recognition_node::mock::textured_frame(640, 480), false)
        .await
        .unwrap();

    assert!(report.faces[0].recognized);
    assert!(report.attendance.is_empty());
    assert!(h.ledger.is_empty());
}
