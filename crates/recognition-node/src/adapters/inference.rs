use crate::sources::{FaceDetector, FaceEmbedder};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use common::attendance::Detection;
use image::{DynamicImage, ImageFormat};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct ImageRequest {
    /// Base64-encoded JPEG
    image: String,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// Detector and embedder served over HTTP by the inference service
#[derive(Clone)]
pub struct HttpInferenceClient {
    client: Client,
    base_url: Url,
}

impl HttpInferenceClient {
    pub fn new(base_url: Url) -> Result<Self> {
        // Per-call deadlines are enforced by the pipeline; this only caps
        // connections that would otherwise linger.
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid inference endpoint {}", path))
    }

    async fn post<T: for<'de> Deserialize<'de>>(&self, path: &str, image: &DynamicImage) -> Result<T> {
        let request = ImageRequest {
            image: encode_jpeg_base64(image)?,
        };
        let url = self.endpoint(path)?;

        let response = self
            .client
            .post(url.clone())
            .json(&request)
            .send()
            .await
            .with_context(|| format!("failed to reach inference service at {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("inference service returned error {}: {}", status, body);
        }

        response
            .json::<T>()
            .await
            .context("failed to decode inference response")
    }
}

/// JPEG-encode an image for JSON transport
pub fn encode_jpeg_base64(image: &DynamicImage) -> Result<String> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.to_rgb8())
        .write_to(&mut buffer, ImageFormat::Jpeg)
        .context("failed to encode JPEG")?;
    Ok(base64::engine::general_purpose::STANDARD.encode(buffer.into_inner()))
}

/// Decode a base64 image pushed by a client. A `data:image/..;base64,`
/// prefix is accepted.
pub fn decode_frame_base64(payload: &str) -> Result<DynamicImage> {
    let payload = payload.trim();
    let encoded = match payload.split_once(',') {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => payload,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("frame is not valid base64")?;
    image::load_from_memory(&bytes).context("frame is not a decodable image")
}

#[async_trait]
impl FaceDetector for HttpInferenceClient {
    async fn detect(&self, frame: &DynamicImage) -> Result<Vec<Detection>> {
        let response: DetectResponse = self.post("/v1/detect", frame).await?;
        debug!(faces = response.detections.len(), "detector responded");
        Ok(response.detections)
    }
}

#[async_trait]
impl FaceEmbedder for HttpInferenceClient {
    async fn embed(&self, face: &DynamicImage) -> Result<Vec<f32>> {
        let response: EmbedResponse = self.post("/v1/embed", face).await?;
        Ok(response.embedding)
    }
}
