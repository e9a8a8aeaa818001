//! In-process collaborators for tests and demo runs without cameras or an
//! inference service.

use crate::sources::{FaceDetector, FaceEmbedder, FrameSource};
use anyhow::{bail, Result};
use async_trait::async_trait;
use common::attendance::{BoundingBox, Detection};
use image::{DynamicImage, Rgb, RgbImage};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Checkerboard frame with enough edge energy to pass the sharpness check
pub fn textured_frame(width: u32, height: u32) -> DynamicImage {
    let image = RgbImage::from_fn(width, height, |x, y| {
        if ((x / 4) + (y / 4)) % 2 == 0 {
            Rgb([230, 230, 230])
        } else {
            Rgb([20, 20, 20])
        }
    });
    DynamicImage::ImageRgb8(image)
}

/// Tracks how many calls per camera are running at once
#[derive(Default)]
struct Concurrency {
    current: HashMap<String, usize>,
    peak: HashMap<String, usize>,
}

/// Frame source serving a synthetic frame, with optional latency and failures
pub struct MockFrameSource {
    width: u32,
    height: u32,
    delay: Mutex<Duration>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    per_camera: Mutex<HashMap<String, usize>>,
    concurrency: Mutex<Concurrency>,
}

impl MockFrameSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            delay: Mutex::new(Duration::ZERO),
            failing: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
            per_camera: Mutex::new(HashMap::new()),
            concurrency: Mutex::new(Concurrency::default()),
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        if let Ok(mut current) = self.delay.lock() {
            *current = delay;
        }
    }

    /// Make `camera_id` report an unavailable frame until cleared
    pub fn set_failing(&self, camera_id: &str, failing: bool) {
        if let Ok(mut set) = self.failing.lock() {
            if failing {
                set.insert(camera_id.to_string());
            } else {
                set.remove(camera_id);
            }
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, camera_id: &str) -> usize {
        self.per_camera
            .lock()
            .map(|m| m.get(camera_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Highest number of simultaneous fetches observed for `camera_id`
    pub fn peak_concurrency(&self, camera_id: &str) -> usize {
        self.concurrency
            .lock()
            .map(|c| c.peak.get(camera_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn enter(&self, camera_id: &str) {
        if let Ok(mut c) = self.concurrency.lock() {
            let current = c.current.entry(camera_id.to_string()).or_insert(0);
            *current += 1;
            let now = *current;
            let peak = c.peak.entry(camera_id.to_string()).or_insert(0);
            *peak = (*peak).max(now);
        }
    }

    fn exit(&self, camera_id: &str) {
        if let Ok(mut c) = self.concurrency.lock() {
            if let Some(current) = c.current.get_mut(camera_id) {
                *current = current.saturating_sub(1);
            }
        }
    }
}

/// Decrements the concurrency count even if the fetch future is dropped
struct InFlight<'a> {
    source: &'a MockFrameSource,
    camera_id: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.source.exit(self.camera_id);
    }
}

#[async_trait]
impl FrameSource for MockFrameSource {
    async fn get_frame(&self, camera_id: &str) -> Result<DynamicImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut per_camera) = self.per_camera.lock() {
            *per_camera.entry(camera_id.to_string()).or_insert(0) += 1;
        }

        self.enter(camera_id);
        let _guard = InFlight {
            source: self,
            camera_id,
        };

        let delay = self.delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing
            .lock()
            .map(|set| set.contains(camera_id))
            .unwrap_or(false);
        if failing {
            bail!("camera {} is offline", camera_id);
        }
        Ok(textured_frame(self.width, self.height))
    }
}

/// Detector returning a fixed set of faces for every frame
pub struct MockDetector {
    detections: Mutex<Vec<Detection>>,
    delay: Mutex<Duration>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl MockDetector {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections: Mutex::new(detections),
            delay: Mutex::new(Duration::ZERO),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// One well-formed face centred in a 640x480 frame
    pub fn single_face() -> Self {
        Self::new(vec![Detection {
            bbox: BoundingBox::new(270.0, 190.0, 370.0, 300.0),
            confidence: 0.95,
            landmarks: None,
        }])
    }

    pub fn set_detections(&self, detections: Vec<Detection>) {
        if let Ok(mut current) = self.detections.lock() {
            *current = detections;
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        if let Ok(mut current) = self.delay.lock() {
            *current = delay;
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaceDetector for MockDetector {
    async fn detect(&self, _frame: &DynamicImage) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("detector unavailable");
        }
        Ok(self
            .detections
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default())
    }
}

/// Embedder returning the same vector for every crop
pub struct MockEmbedder {
    embedding: Mutex<Vec<f32>>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding: Mutex::new(embedding),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_embedding(&self, embedding: Vec<f32>) {
        if let Ok(mut current) = self.embedding.lock() {
            *current = embedding;
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaceEmbedder for MockEmbedder {
    async fn embed(&self, _face: &DynamicImage) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            bail!("embedder unavailable");
        }
        Ok(self
            .embedding
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_frame_source_counts_and_fails() {
        let source = MockFrameSource::new(64, 48);
        let frame = source.get_frame("cam-1").await.unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 48));

        source.set_failing("cam-1", true);
        assert!(source.get_frame("cam-1").await.is_err());
        assert!(source.get_frame("cam-2").await.is_ok());

        assert_eq!(source.calls(), 3);
        assert_eq!(source.calls_for("cam-1"), 2);
        assert_eq!(source.peak_concurrency("cam-1"), 1);
    }

    #[tokio::test]
    async fn test_mock_detector_failure_toggle() {
        let detector = MockDetector::single_face();
        let frame = textured_frame(640, 480);
        assert_eq!(detector.detect(&frame).await.unwrap().len(), 1);
        detector.set_failing(true);
        assert!(detector.detect(&frame).await.is_err());
        assert_eq!(detector.calls(), 2);
    }
}
