// Metric names and label sets are static; construction cannot fail at runtime.
#![allow(clippy::expect_used)]

use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Fleet / Scheduler Metrics ====
    pub static ref RECOGNITION_ACTIVE_CAMERAS: IntGauge = {
        let metric = IntGauge::new(
            "recognition_active_cameras",
            "Number of cameras with a running scheduler",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECOGNITION_FOCUSED_CAMERA: IntGaugeVec = {
        let metric = IntGaugeVec::new(
            Opts::new(
                "recognition_focused_camera",
                "1 for the camera currently in focused priority, 0 otherwise",
            ),
            &["camera_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECOGNITION_CYCLES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "recognition_cycles_total",
                "Total number of recognition cycles by outcome",
            ),
            &["camera_id", "status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECOGNITION_TICKS_SKIPPED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "recognition_ticks_skipped_total",
                "Ticks skipped because a cycle was still in flight",
            ),
            &["camera_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECOGNITION_CAMERA_OVERLOADED: IntGaugeVec = {
        let metric = IntGaugeVec::new(
            Opts::new(
                "recognition_camera_overloaded",
                "1 while a camera keeps skipping ticks beyond the overload threshold",
            ),
            &["camera_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECOGNITION_CYCLE_DURATION: HistogramVec = {
        let metric = HistogramVec::new(
            HistogramOpts::new(
                "recognition_cycle_duration_seconds",
                "Wall time of one recognition cycle",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]),
            &["camera_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Recognition Pipeline Metrics ====
    pub static ref RECOGNITION_QUALITY_REJECTIONS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "recognition_quality_rejections_total",
                "Detections rejected by the quality filter",
            ),
            &["reason"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECOGNITION_DECISIONS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "recognition_decisions_total",
                "Match decisions by outcome (recognized/unknown)",
            ),
            &["outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECOGNITION_ATTENDANCE: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "recognition_attendance_total",
                "Attendance gate outcomes (created/already_present)",
            ),
            &["outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Helper function to encode metrics for Prometheus scraping
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e))
    })
}
