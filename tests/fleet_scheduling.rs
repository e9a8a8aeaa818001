/// Integration tests for per-camera scheduling and fleet reconciliation.
///
/// All tests run on a paused clock so cadences and timeouts are exact.
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::FixedOffset;
use common::attendance::{CameraPriority, DesiredCamera};
use recognition_node::{
    config::EngineConfig,
    gallery::{EnrolledIdentity, MemoryGallery},
    ledger::MemoryLedgerStore,
    mock::{MockDetector, MockEmbedder, MockFrameSource},
    sources::CameraRegistry,
    Collaborators, FleetCoordinator, RecognitionNodeState, RecognitionPipeline,
    SchedulerSettings,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

struct Fleet {
    fleet: Arc<FleetCoordinator>,
    frames: Arc<MockFrameSource>,
    detector: Arc<MockDetector>,
    ledger: Arc<MemoryLedgerStore>,
}

fn setup_fleet(overload_skip_threshold: u32) -> Fleet {
    let config = EngineConfig {
        day_offset: FixedOffset::east_opt(0).unwrap(),
        overload_skip_threshold,
        ..EngineConfig::default()
    };

    let gallery = MemoryGallery::new(3);
    gallery
        .enroll(EnrolledIdentity {
            identity_id: "B".to_string(),
            label: Some("Grace Hopper".to_string()),
            embeddings: vec![vec![1.0, 0.0, 0.0]],
        })
        .unwrap();

    let frames = Arc::new(MockFrameSource::new(640, 480));
    let detector = Arc::new(MockDetector::single_face());
    let ledger = Arc::new(MemoryLedgerStore::new());
    let pipeline = Arc::new(RecognitionPipeline::new(
        &config,
        Collaborators {
            frames: frames.clone(),
            detector: detector.clone(),
            embedder: Arc::new(MockEmbedder::new(vec![0.9, 0.1, 0.0])),
            gallery: Arc::new(gallery),
            ledger: ledger.clone(),
        },
    ));
    let fleet = Arc::new(FleetCoordinator::new(
        pipeline,
        config.cadence,
        SchedulerSettings {
            overload_skip_threshold,
        },
    ));

    Fleet {
        fleet,
        frames,
        detector,
        ledger,
    }
}

#[tokio::test(start_paused = true)]
async fn test_single_flight_skips_ticks_while_cycle_runs() {
    let f = setup_fleet(2);
    f.frames.set_delay(Duration::from_millis(2500));

    f.fleet
        .reconcile(vec![DesiredCamera::focused("cam-1")])
        .await;

    // Cycle launched at 0 is still fetching; ticks at 1000 and 2000 were dropped
    sleep(Duration::from_millis(2100)).await;
    let status = f.fleet.status("cam-1").await.unwrap();
    assert!(status.in_flight);
    assert_eq!(status.ticks_skipped, 2);
    assert_eq!(status.consecutive_skips, 2);
    assert!(status.overloaded);
    assert_eq!(f.frames.calls_for("cam-1"), 1);

    // First cycle finished at 2500, the tick at 3000 launched the next one
    sleep(Duration::from_millis(1000)).await;
    let status = f.fleet.status("cam-1").await.unwrap();
    assert_eq!(status.cycles_completed, 1);
    assert_eq!(status.consecutive_skips, 0);
    assert!(!status.overloaded);
    assert_eq!(f.frames.calls_for("cam-1"), 2);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(f.frames.peak_concurrency("cam-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_focus_switch_takes_effect_immediately() {
    let f = setup_fleet(5);

    f.fleet
        .reconcile(vec![
            DesiredCamera::background("cam-x"),
            DesiredCamera::background("cam-y"),
        ])
        .await;
    sleep(Duration::from_millis(500)).await;
    assert_eq!(f.frames.calls_for("cam-x"), 1);
    assert_eq!(f.frames.calls_for("cam-y"), 1);

    // Focusing X moves its next tick from 3000 to 1000
    let summary = f
        .fleet
        .reconcile(vec![
            DesiredCamera::focused("cam-x"),
            DesiredCamera::background("cam-y"),
        ])
        .await;
    assert_eq!(summary.retuned, vec!["cam-x".to_string()]);
    assert_eq!(summary.focused.as_deref(), Some("cam-x"));

    sleep(Duration::from_millis(600)).await;
    assert_eq!(f.frames.calls_for("cam-x"), 2);
    assert_eq!(f.frames.calls_for("cam-y"), 1);

    // At 1100 Y was last sampled at 0, so its first focused tick is due now
    let summary = f
        .fleet
        .reconcile(vec![
            DesiredCamera::background("cam-x"),
            DesiredCamera::focused("cam-y"),
        ])
        .await;
    assert_eq!(
        summary.retuned,
        vec!["cam-x".to_string(), "cam-y".to_string()]
    );
    assert_eq!(summary.focused.as_deref(), Some("cam-y"));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(f.frames.calls_for("cam-y"), 2);

    // X now runs at the background cadence: nothing until 4000
    sleep(Duration::from_millis(2000)).await;
    assert_eq!(f.frames.calls_for("cam-x"), 2);
    let x = f.fleet.status("cam-x").await.unwrap();
    assert_eq!(x.priority, CameraPriority::Background);
    assert_eq!(x.cadence_ms, 3000);
    let y = f.fleet.status("cam-y").await.unwrap();
    assert_eq!(y.priority, CameraPriority::Focused);
    assert_eq!(y.cadence_ms, 1000);
}

#[tokio::test(start_paused = true)]
async fn test_detector_timeout_releases_in_flight() {
    let f = setup_fleet(5);
    f.detector.set_delay(Duration::from_secs(60));

    f.fleet
        .reconcile(vec![DesiredCamera::focused("cam-1")])
        .await;

    sleep(Duration::from_millis(3500)).await;
    let status = f.fleet.status("cam-1").await.unwrap();
    assert!(status.cycles_failed >= 1);
    let error = status.last_error.unwrap();
    assert!(error.contains("timed out"), "unexpected error: {}", error);

    f.detector.set_delay(Duration::ZERO);
    sleep(Duration::from_millis(5000)).await;
    let status = f.fleet.status("cam-1").await.unwrap();
    assert!(status.cycles_completed >= 1);
    assert!(status.running);
    assert_eq!(f.ledger.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_camera_keeps_running() {
    let f = setup_fleet(5);
    f.frames.set_failing("cam-1", true);

    f.fleet
        .reconcile(vec![
            DesiredCamera::focused("cam-1"),
            DesiredCamera::background("cam-2"),
        ])
        .await;
    sleep(Duration::from_millis(2500)).await;

    let broken = f.fleet.status("cam-1").await.unwrap();
    assert_eq!(broken.cycles_failed, 3);
    assert!(broken.running);
    let healthy = f.fleet.status("cam-2").await.unwrap();
    assert_eq!(healthy.cycles_completed, 1);

    f.frames.set_failing("cam-1", false);
    sleep(Duration::from_millis(1000)).await;
    let recovered = f.fleet.status("cam-1").await.unwrap();
    assert_eq!(recovered.cycles_completed, 1);
    assert_eq!(recovered.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn test_two_cameras_recognizing_same_person_record_once() {
    let f = setup_fleet(5);
    let mut reports = f.fleet.pipeline().subscribe();

    f.fleet
        .reconcile(vec![
            DesiredCamera::background("cam-1"),
            DesiredCamera::background("cam-2"),
        ])
        .await;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(f.ledger.len(), 1);

    let mut created = 0;
    let mut already_present = 0;
    while let Ok(report) = reports.try_recv() {
        for outcome in report.attendance {
            assert_eq!(outcome.identity_id, "B");
            if outcome.created {
                created += 1;
            } else {
                already_present += 1;
            }
        }
    }
    assert_eq!(created, 1);
    assert_eq!(already_present, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_camera_discards_in_flight_cycle() {
    let f = setup_fleet(5);
    f.frames.set_delay(Duration::from_millis(2000));
    let mut reports = f.fleet.pipeline().subscribe();

    f.fleet
        .reconcile(vec![DesiredCamera::background("cam-1")])
        .await;
    sleep(Duration::from_millis(500)).await;

    let summary = f.fleet.reconcile(vec![]).await;
    assert_eq!(summary.stopped, vec!["cam-1".to_string()]);
    assert!(f.fleet.status("cam-1").await.is_none());

    sleep(Duration::from_millis(3000)).await;
    assert!(f.ledger.is_empty());
    assert!(reports.try_recv().is_err());
    assert_eq!(f.frames.calls_for("cam-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_restarted_camera_waits_for_previous_cycle() {
    let f = setup_fleet(5);
    f.frames.set_delay(Duration::from_millis(2000));

    f.fleet
        .reconcile(vec![DesiredCamera::background("cam-1")])
        .await;
    sleep(Duration::from_millis(500)).await;
    f.fleet.reconcile(vec![]).await;

    let summary = f
        .fleet
        .reconcile(vec![DesiredCamera::background("cam-1")])
        .await;
    assert_eq!(summary.started, vec!["cam-1".to_string()]);

    // The old cycle is still fetching until 2000
    sleep(Duration::from_millis(1000)).await;
    assert_eq!(f.frames.calls_for("cam-1"), 1);

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(f.frames.calls_for("cam-1"), 2);
    assert_eq!(f.frames.peak_concurrency("cam-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_summary() {
    let f = setup_fleet(5);

    let summary = f
        .fleet
        .reconcile(vec![
            DesiredCamera::background("a"),
            DesiredCamera::background("b"),
            DesiredCamera::background("a"),
        ])
        .await;
    assert_eq!(summary.started, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(summary.focused, None);
    assert_eq!(f.fleet.camera_count().await, 2);

    let summary = f
        .fleet
        .reconcile(vec![
            DesiredCamera::focused("a"),
            DesiredCamera::background("b"),
            DesiredCamera::background("c"),
        ])
        .await;
    assert_eq!(summary.started, vec!["c".to_string()]);
    assert_eq!(summary.retuned, vec!["a".to_string()]);
    assert_eq!(summary.focused.as_deref(), Some("a"));

    // Both ask for focus: the newly requested camera wins
    let summary = f
        .fleet
        .reconcile(vec![DesiredCamera::focused("a"), DesiredCamera::focused("b")])
        .await;
    assert_eq!(summary.stopped, vec!["c".to_string()]);
    assert_eq!(summary.retuned, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(summary.focused.as_deref(), Some("b"));
    assert_eq!(f.fleet.focused().await.as_deref(), Some("b"));

    let summary = f
        .fleet
        .reconcile(vec![DesiredCamera::background("a"), DesiredCamera::focused("b")])
        .await;
    assert!(summary.is_noop());

    f.fleet.stop_all().await;
    assert_eq!(f.fleet.camera_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_reconcile_with_two_focus_requests_is_stable() {
    let f = setup_fleet(5);
    let desired = vec![DesiredCamera::focused("a"), DesiredCamera::focused("b")];

    let first = f.fleet.reconcile(desired.clone()).await;
    assert_eq!(first.focused.as_deref(), Some("a"));

    for _ in 0..3 {
        let again = f.fleet.reconcile(desired.clone()).await;
        assert!(again.is_noop(), "reconcile changed the fleet: {:?}", again);
        assert_eq!(again.focused.as_deref(), Some("a"));
    }

    // A request that was not there before still takes focus over
    let summary = f
        .fleet
        .reconcile(vec![
            DesiredCamera::focused("a"),
            DesiredCamera::focused("b"),
            DesiredCamera::focused("c"),
        ])
        .await;
    assert_eq!(summary.focused.as_deref(), Some("c"));
    let summary = f
        .fleet
        .reconcile(vec![
            DesiredCamera::focused("a"),
            DesiredCamera::focused("b"),
            DesiredCamera::focused("c"),
        ])
        .await;
    assert!(summary.is_noop());

    f.fleet.stop_all().await;
}

/// Registry whose camera set the test controls, and which can go down
struct ScriptedRegistry {
    cameras: Mutex<Vec<DesiredCamera>>,
    down: AtomicBool,
}

#[async_trait]
impl CameraRegistry for ScriptedRegistry {
    async fn list_active(&self) -> Result<Vec<DesiredCamera>> {
        if self.down.load(Ordering::SeqCst) {
            bail!("registry unreachable");
        }
        Ok(self.cameras.lock().unwrap().clone())
    }
}

#[tokio::test(start_paused = true)]
async fn test_registry_loop_follows_registry_and_survives_outage() {
    let f = setup_fleet(5);
    let registry = Arc::new(ScriptedRegistry {
        cameras: Mutex::new(vec![
            DesiredCamera::background("cam-1"),
            DesiredCamera::background("cam-2"),
        ]),
        down: AtomicBool::new(false),
    });
    let cancel = CancellationToken::new();
    let poller = tokio::spawn(f.fleet.clone().run_registry_loop(
        registry.clone(),
        Duration::from_secs(10),
        cancel.clone(),
    ));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(f.fleet.camera_count().await, 2);

    f.fleet
        .set_view(common::attendance::ViewMode::Single {
            camera_id: "cam-2".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(f.fleet.focused().await.as_deref(), Some("cam-2"));

    // Outage keeps the running fleet
    registry.down.store(true, Ordering::SeqCst);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(f.fleet.camera_count().await, 2);

    // Focused camera leaves the registry: back to grid
    *registry.cameras.lock().unwrap() = vec![DesiredCamera::background("cam-1")];
    registry.down.store(false, Ordering::SeqCst);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(f.fleet.camera_count().await, 1);
    assert_eq!(f.fleet.focused().await, None);
    assert_eq!(
        f.fleet.view().await,
        common::attendance::ViewMode::Grid
    );

    cancel.cancel();
    poller.await.unwrap();
    f.fleet.stop_all().await;
}

/// Registry whose listing takes a while, like a slow database round trip
struct SlowRegistry {
    delay: Duration,
}

#[async_trait]
impl CameraRegistry for SlowRegistry {
    async fn list_active(&self) -> Result<Vec<DesiredCamera>> {
        sleep(self.delay).await;
        Ok(vec![
            DesiredCamera::background("cam-1"),
            DesiredCamera::background("cam-2"),
        ])
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_registry_listing_leaves_fleet_empty() {
    let f = setup_fleet(5);
    let state = RecognitionNodeState::new("test-node".to_string(), f.fleet.clone());
    state.spawn_background(f.fleet.clone().run_registry_loop(
        Arc::new(SlowRegistry {
            delay: Duration::from_secs(5),
        }),
        Duration::from_secs(30),
        state.shutdown_token(),
    ));

    // First listing is still in flight
    sleep(Duration::from_secs(1)).await;
    assert_eq!(f.fleet.camera_count().await, 0);

    state.shutdown().await;
    assert_eq!(f.fleet.camera_count().await, 0);

    // The listing that was in flight never lands
    sleep(Duration::from_secs(60)).await;
    assert_eq!(f.fleet.camera_count().await, 0);
    assert!(f.fleet.statuses().await.is_empty());
}
