use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// External call a cycle was waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Frame,
    Detect,
    Embed,
    Gallery,
    Ledger,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Frame => "frame",
            Stage::Detect => "detect",
            Stage::Embed => "embed",
            Stage::Gallery => "gallery",
            Stage::Ledger => "ledger",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a recognition cycle ended without a report.
///
/// All variants are transient: the scheduler logs them and tries again on
/// the next tick.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("frame unavailable: {0}")]
    FrameUnavailable(String),

    #[error("detector error: {0}")]
    Detector(String),

    #[error("embedder error: {0}")]
    Embedder(String),

    #[error("gallery error: {0}")]
    Gallery(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("{stage} call timed out after {elapsed:?}")]
    Timeout { stage: Stage, elapsed: Duration },
}

impl CycleError {
    pub fn stage(&self) -> Stage {
        match self {
            CycleError::FrameUnavailable(_) => Stage::Frame,
            CycleError::Detector(_) => Stage::Detect,
            CycleError::Embedder(_) => Stage::Embed,
            CycleError::Gallery(_) => Stage::Gallery,
            CycleError::Ledger(_) => Stage::Ledger,
            CycleError::Timeout { stage, .. } => *stage,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CycleError::Timeout { .. })
    }

    pub(crate) fn from_stage(stage: Stage, err: anyhow::Error) -> Self {
        let msg = format!("{:#}", err);
        match stage {
            Stage::Frame => CycleError::FrameUnavailable(msg),
            Stage::Detect => CycleError::Detector(msg),
            Stage::Embed => CycleError::Embedder(msg),
            Stage::Gallery => CycleError::Gallery(msg),
            Stage::Ledger => CycleError::Ledger(msg),
        }
    }
}

/// Run one external call under its stage timeout
pub async fn bounded<T, F>(stage: Stage, limit: Duration, call: F) -> Result<T, CycleError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CycleError::from_stage(stage, e)),
        Err(_) => Err(CycleError::Timeout {
            stage,
            elapsed: limit,
        }),
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::internal(err.to_string())
    }
}

impl From<CycleError> for ApiError {
    fn from(err: CycleError) -> Self {
        match err {
            CycleError::Timeout { .. } => ApiError::unavailable(err.to_string()),
            other => ApiError::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_stage() {
        let err = CycleError::Timeout {
            stage: Stage::Detect,
            elapsed: Duration::from_millis(3000),
        };
        assert_eq!(err.stage(), Stage::Detect);
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "detect call timed out after 3s");

        let err = CycleError::from_stage(Stage::Ledger, anyhow::anyhow!("connection reset"));
        assert!(matches!(err, CycleError::Ledger(_)));
        assert_eq!(err.stage().as_str(), "ledger");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_maps_timeout_and_errors() {
        let slow = bounded(Stage::Embed, Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, anyhow::Error>(())
        })
        .await;
        assert!(matches!(
            slow,
            Err(CycleError::Timeout {
                stage: Stage::Embed,
                ..
            })
        ));

        let failed: Result<(), CycleError> =
            bounded(Stage::Frame, Duration::from_secs(1), async {
                Err(anyhow::anyhow!("camera offline"))
            })
            .await;
        assert!(matches!(failed, Err(CycleError::FrameUnavailable(_))));

        let ok = bounded(Stage::Gallery, Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
    }

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(
            ApiError::bad_request("x").into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::not_found("x").into_response().status(),
            StatusCode::NOT_FOUND
        );
        let timeout: ApiError = CycleError::Timeout {
            stage: Stage::Ledger,
            elapsed: Duration::from_secs(2),
        }
        .into();
        assert_eq!(timeout.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
