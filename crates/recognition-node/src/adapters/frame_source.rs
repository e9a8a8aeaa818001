use crate::sources::FrameSource;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use common::attendance::CameraId;
use common::validation::validate_uri;
use image::DynamicImage;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use tokio::process::Command;
use tracing::debug;

/// Camera id to source URI map, filled by the camera registry
#[derive(Clone, Default)]
pub struct CameraSources {
    inner: Arc<RwLock<HashMap<CameraId, String>>>,
}

impl CameraSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, camera_id: impl Into<CameraId>, source_uri: impl Into<String>) -> Result<()> {
        let source_uri = source_uri.into();
        validate_uri(&source_uri, "source_uri")?;
        self.inner
            .write()
            .map_err(|e| anyhow!("Failed to lock camera sources: {}", e))?
            .insert(camera_id.into(), source_uri);
        Ok(())
    }

    /// Replace the whole map with a fresh registry snapshot
    pub fn replace(&self, sources: HashMap<CameraId, String>) -> Result<()> {
        for uri in sources.values() {
            validate_uri(uri, "source_uri")?;
        }
        *self
            .inner
            .write()
            .map_err(|e| anyhow!("Failed to lock camera sources: {}", e))? = sources;
        Ok(())
    }

    pub fn get(&self, camera_id: &str) -> Option<String> {
        self.inner
            .read()
            .ok()
            .and_then(|sources| sources.get(camera_id).cloned())
    }
}

/// Grabs one frame per call with ffmpeg.
///
/// The source is opened per call, so a camera that drops its connection is
/// simply retried on the next cycle.
pub struct FfmpegFrameSource {
    sources: CameraSources,
    /// Downscale width, 0 keeps the native size
    width: u32,
}

impl FfmpegFrameSource {
    pub fn new(sources: CameraSources) -> Self {
        Self { sources, width: 0 }
    }

    pub fn with_width(mut self, width: u32) -> Self {
        self.width = width;
        self
    }

    fn args(&self, source_uri: &str) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
        ];
        if source_uri.starts_with("rtsp://") {
            args.push("-rtsp_transport".to_string());
            args.push("tcp".to_string());
        }
        args.extend([
            "-i".to_string(),
            source_uri.to_string(),
            "-vframes".to_string(),
            "1".to_string(),
        ]);
        if self.width > 0 {
            args.push("-vf".to_string());
            args.push(format!("scale={}:-1", self.width));
        }
        args.extend([
            "-f".to_string(),
            "image2pipe".to_string(),
            "-vcodec".to_string(),
            "mjpeg".to_string(),
            "pipe:1".to_string(),
        ]);
        args
    }
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    async fn get_frame(&self, camera_id: &str) -> Result<DynamicImage> {
        let source_uri = self
            .sources
            .get(camera_id)
            .with_context(|| format!("no source configured for camera '{}'", camera_id))?;

        let args = self.args(&source_uri);
        debug!(camera_id, args = ?args, "spawning ffmpeg for frame grab");

        // Dropping the future on timeout kills the child.
        let output = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to execute ffmpeg")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.lines().last().unwrap_or_default()
            );
        }
        if output.stdout.is_empty() {
            bail!("ffmpeg returned no frame data");
        }

        image::load_from_memory(&output.stdout).context("failed to decode frame")
    }
}
