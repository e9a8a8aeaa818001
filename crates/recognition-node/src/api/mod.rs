pub mod events;
pub mod routes;

use crate::state::RecognitionNodeState;
use axum::{routing::{get, post, put}, Router};
use tower_http::trace::TraceLayer;

/// Build the API router
pub fn router(state: RecognitionNodeState) -> Router {
    Router::new()
        // Health and metrics endpoints
        .route("/healthz", get(routes::healthz))
        .route("/readyz", get(routes::readyz))
        .route("/metrics", get(routes::metrics))
        // Fleet endpoints
        .route("/v1/cameras", get(routes::list_cameras))
        .route("/v1/cameras/:id", get(routes::get_camera))
        .route("/v1/view", put(routes::set_view).get(routes::get_view))
        // Attendance endpoints
        .route("/v1/attendance", get(routes::list_attendance))
        .route("/v1/attendance/stats", get(routes::attendance_stats))
        .route("/v1/gallery", get(routes::gallery_stats))
        // One-off recognition of client frames
        .route("/v1/recognize", post(routes::recognize))
        .route("/v1/recognize/file", post(routes::recognize_file))
        // Live cycle reports
        .route("/v1/events", get(events::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
