use anyhow::Result;
use recognition_node::{
    adapters::{CameraSources, FfmpegFrameSource, HttpInferenceClient, PgCameraRegistry, StaticCameraRegistry},
    api,
    gallery::MemoryGallery,
    ledger::{MemoryLedgerStore, PgLedgerStore},
    mock::{MockDetector, MockEmbedder, MockFrameSource},
    sources::{CameraRegistry, FaceDetector, FaceEmbedder, FrameSource, LedgerStore},
    Collaborators, FleetCoordinator, RecognitionNodeConfig, RecognitionNodeState,
    RecognitionPipeline, SchedulerSettings,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = telemetry::init_with_service("recognition-node");

    info!("Starting Recognition Node...");

    // Configuration errors are fatal here rather than per cycle
    let config = RecognitionNodeConfig::from_env()?;
    info!(
        bind = %config.bind_addr,
        node_id = %config.node_id,
        gallery = %config.gallery_path.display(),
        threshold = config.engine.matching.threshold,
        focused_cadence_ms = config.engine.cadence.focused.as_millis() as u64,
        background_cadence_ms = config.engine.cadence.background.as_millis() as u64,
        "recognition node configuration loaded"
    );

    let gallery = Arc::new(MemoryGallery::load_json(&config.gallery_path)?);
    let sources = CameraSources::new();

    let (ledger, registry): (Arc<dyn LedgerStore>, Arc<dyn CameraRegistry>) =
        match &config.database_url {
            Some(database_url) => {
                info!("Connecting to attendance database");
                let store = PgLedgerStore::connect(database_url).await?;
                let registry: Arc<dyn CameraRegistry> =
                    Arc::new(PgCameraRegistry::new(store.pool().clone(), sources.clone()));
                let ledger: Arc<dyn LedgerStore> = Arc::new(store);
                (ledger, registry)
            }
            None => {
                warn!("DATABASE_URL not set, attendance is kept in memory and cameras come from CAMERAS");
                let registry: Arc<dyn CameraRegistry> =
                    Arc::new(StaticCameraRegistry::new(&config.static_cameras, &sources)?);
                let ledger: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
                (ledger, registry)
            }
        };

    let (frames, detector, embedder): (
        Arc<dyn FrameSource>,
        Arc<dyn FaceDetector>,
        Arc<dyn FaceEmbedder>,
    ) = if config.mock_inference {
        warn!("MOCK_INFERENCE enabled, serving synthetic frames and faces");
        let mut embedding = vec![0.0; gallery.dimension()];
        if let Some(first) = embedding.first_mut() {
            *first = 1.0;
        }
        let frames: Arc<dyn FrameSource> = Arc::new(MockFrameSource::new(640, 480));
        let detector: Arc<dyn FaceDetector> = Arc::new(MockDetector::single_face());
        let embedder: Arc<dyn FaceEmbedder> = Arc::new(MockEmbedder::new(embedding));
        (frames, detector, embedder)
    } else {
        info!(url = %config.inference_url, "Using inference service");
        let inference = Arc::new(HttpInferenceClient::new(config.inference_url.clone())?);
        let frames: Arc<dyn FrameSource> = Arc::new(FfmpegFrameSource::new(sources.clone()));
        let detector: Arc<dyn FaceDetector> = inference.clone();
        let embedder: Arc<dyn FaceEmbedder> = inference;
        (frames, detector, embedder)
    };

    let pipeline = Arc::new(RecognitionPipeline::new(
        &config.engine,
        Collaborators {
            frames,
            detector,
            embedder,
            gallery,
            ledger,
        },
    ));
    let fleet = Arc::new(FleetCoordinator::new(
        pipeline,
        config.engine.cadence,
        SchedulerSettings {
            overload_skip_threshold: config.engine.overload_skip_threshold,
        },
    ));
    let state = RecognitionNodeState::new(config.node_id.clone(), fleet.clone());

    state.spawn_background(fleet.run_registry_loop(
        registry,
        config.registry_poll_interval,
        state.shutdown_token(),
    ));

    // Build HTTP router
    let app = api::router(state.clone());

    info!("Binding to {}", config.bind_addr);
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Recognition Node listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown().await;
    info!("Recognition Node stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    info!("Shutting down gracefully...");
}
