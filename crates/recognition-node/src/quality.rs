use crate::config::QualityConfig;
use common::attendance::{BoundingBox, Detection, QualityVerdict, RejectReason};
use image::{DynamicImage, GenericImageView};
use imageproc::filter::laplacian_filter;

/// Pixel rectangle of a bounding box clipped to the frame, `None` if nothing is left
pub(crate) fn clamp_to_frame(bbox: &BoundingBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let x1 = bbox.x1.max(0.0).floor() as u32;
    let y1 = bbox.y1.max(0.0).floor() as u32;
    let x2 = (bbox.x2.min(width as f32).ceil().max(0.0) as u32).min(width);
    let y2 = (bbox.y2.min(height as f32).ceil().max(0.0) as u32).min(height);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some((x1, y1, x2 - x1, y2 - y1))
}

/// Variance of the Laplacian over the face region; low values mean blur
pub fn laplacian_variance(frame: &DynamicImage, bbox: &BoundingBox) -> Option<f64> {
    let (width, height) = frame.dimensions();
    let (x, y, w, h) = clamp_to_frame(bbox, width, height)?;
    let gray = frame.crop_imm(x, y, w, h).to_luma8();
    let response = laplacian_filter(&gray);

    let count = response.pixels().len() as f64;
    if count == 0.0 {
        return None;
    }
    let mean = response.pixels().map(|p| p.0[0] as f64).sum::<f64>() / count;
    let variance = response
        .pixels()
        .map(|p| {
            let d = p.0[0] as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / count;
    Some(variance)
}

/// Stateless gate in front of the embedder.
///
/// Checks run cheapest first and stop at the first failure, so the verdict
/// always names a single reason.
#[derive(Debug, Clone)]
pub struct QualityFilter {
    config: QualityConfig,
}

impl QualityFilter {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, detection: &Detection, frame: &DynamicImage) -> QualityVerdict {
        match self.check(detection, frame) {
            Ok(()) => QualityVerdict::Accept,
            Err(reason) => QualityVerdict::Reject { reason },
        }
    }

    fn check(&self, detection: &Detection, frame: &DynamicImage) -> Result<(), RejectReason> {
        let cfg = &self.config;
        let bbox = &detection.bbox;

        if !(detection.confidence >= cfg.min_confidence) {
            return Err(RejectReason::Confidence);
        }

        if bbox.shorter_side() < cfg.min_face_px {
            return Err(RejectReason::Size);
        }

        let (width, height) = frame.dimensions();
        let frame_area = width as f32 * height as f32;
        if frame_area <= 0.0 || bbox.area() / frame_area > cfg.max_area_ratio {
            return Err(RejectReason::AreaRatio);
        }

        match bbox.aspect_ratio() {
            Some(ratio) if ratio >= cfg.min_aspect_ratio && ratio <= cfg.max_aspect_ratio => {}
            _ => return Err(RejectReason::AspectRatio),
        }

        // A box lying entirely outside the frame has no pixels to measure.
        match laplacian_variance(frame, bbox) {
            Some(sharpness) if sharpness >= cfg.min_sharpness => Ok(()),
            Some(_) => Err(RejectReason::Sharpness),
            None => Err(RejectReason::Size),
        }
    }
}
