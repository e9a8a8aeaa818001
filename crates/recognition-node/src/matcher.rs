use crate::config::{MatchConfig, TimeoutConfig};
use crate::error::{bounded, CycleError, Stage};
use crate::quality::clamp_to_frame;
use crate::sources::{FaceEmbedder, IdentityGallery};
use common::attendance::{BoundingBox, Detection, MatchCandidate, MatchDecision};
use image::{DynamicImage, GenericImageView};
use std::collections::HashMap;
use std::sync::Arc;

/// Scale `vector` to unit length in place. Returns false for a zero or
/// non-finite vector, which is left untouched.
pub fn l2_normalize(vector: &mut [f32]) -> bool {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if !norm.is_finite() || norm <= f32::EPSILON {
        return false;
    }
    vector.iter_mut().for_each(|v| *v /= norm);
    true
}

/// Inner product; equals cosine similarity for normalized inputs
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Face crop expanded by `margin` of the box size on each side, clipped to the frame
pub fn crop_with_margin(frame: &DynamicImage, bbox: &BoundingBox, margin: f32) -> Option<DynamicImage> {
    let pad_x = bbox.width() * margin;
    let pad_y = bbox.height() * margin;
    let expanded = BoundingBox::new(
        bbox.x1 - pad_x,
        bbox.y1 - pad_y,
        bbox.x2 + pad_x,
        bbox.y2 + pad_y,
    );
    let (width, height) = frame.dimensions();
    let (x, y, w, h) = clamp_to_frame(&expanded, width, height)?;
    Some(frame.crop_imm(x, y, w, h))
}

/// Collapse candidates to one per identity, keeping each identity's best
/// similarity. Result is ordered best first.
pub fn best_per_identity(candidates: &[MatchCandidate]) -> Vec<MatchCandidate> {
    let mut best: HashMap<&str, f32> = HashMap::new();
    for candidate in candidates {
        if !candidate.similarity.is_finite() {
            continue;
        }
        best.entry(candidate.identity_id.as_str())
            .and_modify(|s| *s = s.max(candidate.similarity))
            .or_insert(candidate.similarity);
    }

    let mut collapsed: Vec<MatchCandidate> = best
        .into_iter()
        .map(|(identity_id, similarity)| MatchCandidate::new(identity_id, similarity))
        .collect();
    // Ties broken by identity id so the outcome never depends on hash order.
    collapsed.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.identity_id.cmp(&b.identity_id))
    });
    collapsed
}

/// Threshold decision over raw top-K candidates
pub fn decide(candidates: &[MatchCandidate], threshold: f32) -> MatchDecision {
    match best_per_identity(candidates).into_iter().next() {
        Some(best) if best.similarity >= threshold => MatchDecision::Recognized {
            identity_id: best.identity_id,
            confidence: best.similarity,
        },
        _ => MatchDecision::Unknown,
    }
}

/// Turns accepted detections into identity decisions
pub struct MatchResolver {
    config: MatchConfig,
    timeouts: TimeoutConfig,
    embedder: Arc<dyn FaceEmbedder>,
    gallery: Arc<dyn IdentityGallery>,
}

impl MatchResolver {
    pub fn new(
        config: MatchConfig,
        timeouts: TimeoutConfig,
        embedder: Arc<dyn FaceEmbedder>,
        gallery: Arc<dyn IdentityGallery>,
    ) -> Self {
        Self {
            config,
            timeouts,
            embedder,
            gallery,
        }
    }

    pub fn gallery(&self) -> &Arc<dyn IdentityGallery> {
        &self.gallery
    }

    pub async fn resolve(
        &self,
        detection: &Detection,
        frame: &DynamicImage,
    ) -> Result<MatchDecision, CycleError> {
        if self.gallery.is_empty() {
            return Ok(MatchDecision::Unknown);
        }

        let Some(face) = crop_with_margin(frame, &detection.bbox, self.config.crop_margin) else {
            return Ok(MatchDecision::Unknown);
        };

        let mut embedding =
            bounded(Stage::Embed, self.timeouts.embed, self.embedder.embed(&face)).await?;
        drop(face);

        if !l2_normalize(&mut embedding) {
            return Err(CycleError::Embedder(
                "embedder returned a zero or non-finite vector".to_string(),
            ));
        }

        let candidates = bounded(
            Stage::Gallery,
            self.timeouts.gallery,
            self.gallery.top_k(&embedding, self.config.top_k),
        )
        .await?;

        Ok(decide(&candidates, self.config.threshold))
    }
}
