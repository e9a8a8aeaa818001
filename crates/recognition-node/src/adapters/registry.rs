use super::frame_source::CameraSources;
use crate::config::StaticCamera;
use crate::sources::CameraRegistry;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::attendance::{CameraPriority, DesiredCamera};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::warn;

/// Fixed camera list from configuration; every camera starts in background
pub struct StaticCameraRegistry {
    cameras: Vec<DesiredCamera>,
}

impl StaticCameraRegistry {
    pub fn new(cameras: &[StaticCamera], sources: &CameraSources) -> Result<Self> {
        for camera in cameras {
            sources.set(camera.camera_id.clone(), camera.source_uri.clone())?;
        }
        Ok(Self {
            cameras: cameras
                .iter()
                .map(|c| DesiredCamera::background(c.camera_id.clone()))
                .collect(),
        })
    }
}

#[async_trait]
impl CameraRegistry for StaticCameraRegistry {
    async fn list_active(&self) -> Result<Vec<DesiredCamera>> {
        Ok(self.cameras.clone())
    }
}

/// Camera registry backed by the `cameras` table
pub struct PgCameraRegistry {
    pool: PgPool,
    sources: CameraSources,
}

impl PgCameraRegistry {
    pub fn new(pool: PgPool, sources: CameraSources) -> Self {
        Self { pool, sources }
    }
}

#[async_trait]
impl CameraRegistry for PgCameraRegistry {
    async fn list_active(&self) -> Result<Vec<DesiredCamera>> {
        let rows = sqlx::query(
            r#"
            SELECT camera_id, source_uri, focused
            FROM cameras
            WHERE is_active
            ORDER BY camera_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list active cameras")?;

        let mut cameras = Vec::with_capacity(rows.len());
        let mut sources = HashMap::with_capacity(rows.len());
        for row in rows {
            let camera_id: String = row.try_get("camera_id")?;
            let source_uri: String = row.try_get("source_uri")?;
            let focused: bool = row.try_get("focused")?;

            if common::validation::validate_uri(&source_uri, "source_uri").is_err() {
                warn!(camera_id = %camera_id, "skipping camera with unsafe source uri");
                continue;
            }
            let priority = if focused {
                CameraPriority::Focused
            } else {
                CameraPriority::Background
            };
            sources.insert(camera_id.clone(), source_uri);
            cameras.push(DesiredCamera::new(camera_id, priority));
        }

        self.sources.replace(sources)?;
        Ok(cameras)
    }
}
