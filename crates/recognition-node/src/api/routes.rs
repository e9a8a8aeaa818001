use crate::adapters::decode_frame_base64;
use crate::error::ApiError;
use crate::fleet::ReconcileSummary;
use crate::sources::present_identities;
use crate::state::RecognitionNodeState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use common::attendance::{
    AttendanceListResponse, AttendanceStats, CameraListResponse, CameraStatus, CycleReport,
    GalleryStats, RecognizeFileQuery, RecognizeRequest, ViewMode,
};
use common::validation::{parse_day, validate_id};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Default, Deserialize)]
pub struct DayQuery {
    /// Calendar day as YYYY-MM-DD, defaults to today
    pub date: Option<String>,
}

impl DayQuery {
    fn resolve(&self, state: &RecognitionNodeState) -> Result<NaiveDate, ApiError> {
        match self.date.as_deref() {
            Some(raw) => parse_day(raw, "date").map_err(|e| ApiError::bad_request(e.to_string())),
            None => Ok(state.today()),
        }
    }
}

/// Health check endpoint
pub async fn healthz(State(state): State<RecognitionNodeState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "recognition-node",
            "node_id": state.node_id(),
        })),
    )
}

/// Readiness check endpoint
pub async fn readyz(State(state): State<RecognitionNodeState>) -> impl IntoResponse {
    let ledger_ready = match state.gate().store().health_check().await {
        Ok(healthy) => healthy,
        Err(e) => {
            tracing::warn!("Ledger health check failed: {}", e);
            false
        }
    };
    let cameras = state.fleet().camera_count().await;
    let gallery = state.gallery().stats();

    let status = if ledger_ready { "ready" } else { "not ready" };
    let body = Json(json!({
        "status": status,
        "ledger": ledger_ready,
        "cameras": cameras,
        "identities": gallery.identities,
    }));

    if ledger_ready {
        (StatusCode::OK, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body)
    }
}

/// Prometheus metrics endpoint
pub async fn metrics() -> impl IntoResponse {
    match telemetry::metrics::encode_metrics() {
        Ok(body) => body.into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// List scheduler status of every running camera
pub async fn list_cameras(State(state): State<RecognitionNodeState>) -> Json<CameraListResponse> {
    let fleet = state.fleet();
    Json(CameraListResponse {
        cameras: fleet.statuses().await,
        focused: fleet.focused().await,
    })
}

/// Scheduler status of one camera
pub async fn get_camera(
    State(state): State<RecognitionNodeState>,
    Path(camera_id): Path<String>,
) -> Result<Json<CameraStatus>, ApiError> {
    state
        .fleet()
        .status(&camera_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Camera '{}' is not running", camera_id)))
}

pub async fn get_view(State(state): State<RecognitionNodeState>) -> Json<ViewMode> {
    Json(state.fleet().view().await)
}

/// Switch between grid and single-camera view
pub async fn set_view(
    State(state): State<RecognitionNodeState>,
    Json(view): Json<ViewMode>,
) -> Result<Json<ReconcileSummary>, ApiError> {
    if let ViewMode::Single { camera_id } = &view {
        validate_id(camera_id, "camera_id").map_err(|e| ApiError::bad_request(e.to_string()))?;
    }
    state
        .fleet()
        .set_view(view)
        .await
        .map(Json)
        .map_err(|e| ApiError::not_found(e.to_string()))
}

/// Attendance records of one day
pub async fn list_attendance(
    State(state): State<RecognitionNodeState>,
    Query(query): Query<DayQuery>,
) -> Result<Json<AttendanceListResponse>, ApiError> {
    let day = query.resolve(&state)?;
    let records = state.gate().list_day(day).await?;
    Ok(Json(AttendanceListResponse { day, records }))
}

/// Present/absent counts of one day against the enrolled gallery
pub async fn attendance_stats(
    State(state): State<RecognitionNodeState>,
    Query(query): Query<DayQuery>,
) -> Result<Json<AttendanceStats>, ApiError> {
    let day = query.resolve(&state)?;
    let records = state.gate().list_day(day).await?;
    let present = present_identities(&records).len();
    let known = state.gallery().identity_count();
    Ok(Json(AttendanceStats::compute(day, present, known)))
}

pub async fn gallery_stats(State(state): State<RecognitionNodeState>) -> Json<GalleryStats> {
    Json(state.gallery().stats())
}

/// Run one recognition on a base64 frame pushed by the client
pub async fn recognize(
    State(state): State<RecognitionNodeState>,
    Json(request): Json<RecognizeRequest>,
) -> Result<Json<CycleReport>, ApiError> {
    validate_id(&request.camera_id, "camera_id")
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let frame = decode_frame_base64(&request.frame_base64)
        .map_err(|e| ApiError::bad_request(format!("{:#}", e)))?;

    let report = state
        .fleet()
        .pipeline()
        .recognize_frame(&request.camera_id, frame, request.mark_attendance)
        .await?;
    Ok(Json(report))
}

/// Same as [`recognize`], with the encoded image as the raw request body
pub async fn recognize_file(
    State(state): State<RecognitionNodeState>,
    Query(query): Query<RecognizeFileQuery>,
    body: Bytes,
) -> Result<Json<CycleReport>, ApiError> {
    validate_id(&query.camera_id, "camera_id").map_err(|e| ApiError::bad_request(e.to_string()))?;
    if body.is_empty() {
        return Err(ApiError::bad_request("request body is empty"));
    }
    let frame = image::load_from_memory(&body)
        .map_err(|e| ApiError::bad_request(format!("frame is not a decodable image: {}", e)))?;

    let report = state
        .fleet()
        .pipeline()
        .recognize_frame(&query.camera_id, frame, query.mark_attendance)
        .await?;
    Ok(Json(report))
}
