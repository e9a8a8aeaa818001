use crate::matcher::{dot, l2_normalize};
use crate::sources::IdentityGallery;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use common::attendance::{GalleryStats, IdentityId, MatchCandidate};
use common::validation::{validate_id, validate_label};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{info, warn};

/// Embedding width produced by the ArcFace-style embedders we consume
pub const DEFAULT_DIMENSION: usize = 512;

/// One enrolled identity as stored in the gallery file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrolledIdentity {
    pub identity_id: IdentityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryFile {
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default)]
    pub identities: Vec<EnrolledIdentity>,
}

fn default_dimension() -> usize {
    DEFAULT_DIMENSION
}

struct StoredEmbedding {
    identity_id: IdentityId,
    vector: Vec<f32>,
}

#[derive(Default)]
struct GalleryInner {
    embeddings: Vec<StoredEmbedding>,
    labels: HashMap<IdentityId, String>,
    identities: HashMap<IdentityId, usize>,
}

/// In-memory gallery with exhaustive inner-product search.
///
/// Stored vectors are normalized on insert, so inner product equals cosine
/// similarity. Queries take a shared read lock and never block each other.
pub struct MemoryGallery {
    dimension: usize,
    inner: RwLock<GalleryInner>,
}

impl MemoryGallery {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            inner: RwLock::new(GalleryInner::default()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Load a gallery file. A missing or malformed file is a startup error.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read gallery file {}", path.display()))?;
        let file: GalleryFile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse gallery file {}", path.display()))?;

        let gallery = Self::from_file(file)?;
        let stats = gallery.stats();
        if stats.identities == 0 {
            warn!(path = %path.display(), "gallery is empty, every face will resolve to unknown");
        } else {
            info!(
                path = %path.display(),
                identities = stats.identities,
                embeddings = stats.embeddings,
                dimension = stats.dimension,
                "gallery loaded"
            );
        }
        Ok(gallery)
    }

    pub fn from_file(file: GalleryFile) -> Result<Self> {
        if file.dimension == 0 {
            bail!("gallery dimension must be greater than 0");
        }
        let gallery = Self::new(file.dimension);
        for identity in file.identities {
            gallery.enroll(identity)?;
        }
        Ok(gallery)
    }

    /// Add an identity's embeddings, normalizing each one
    pub fn enroll(&self, identity: EnrolledIdentity) -> Result<()> {
        validate_id(&identity.identity_id, "identity_id")?;
        if let Some(label) = &identity.label {
            validate_label(label, "label")?;
        }
        if identity.embeddings.is_empty() {
            bail!("identity '{}' has no embeddings", identity.identity_id);
        }

        let mut normalized = Vec::with_capacity(identity.embeddings.len());
        for (idx, mut vector) in identity.embeddings.into_iter().enumerate() {
            if vector.len() != self.dimension {
                bail!(
                    "embedding {} of identity '{}' has dimension {}, expected {}",
                    idx,
                    identity.identity_id,
                    vector.len(),
                    self.dimension
                );
            }
            if !l2_normalize(&mut vector) {
                bail!(
                    "embedding {} of identity '{}' has zero or non-finite norm",
                    idx,
                    identity.identity_id
                );
            }
            normalized.push(vector);
        }

        let mut inner = self
            .inner
            .write()
            .map_err(|e| anyhow!("Failed to lock gallery: {}", e))?;
        if let Some(label) = identity.label {
            inner.labels.insert(identity.identity_id.clone(), label);
        }
        *inner
            .identities
            .entry(identity.identity_id.clone())
            .or_insert(0) += normalized.len();
        for vector in normalized {
            inner.embeddings.push(StoredEmbedding {
                identity_id: identity.identity_id.clone(),
                vector,
            });
        }
        Ok(())
    }

    /// Drop every embedding of an identity. Returns how many were removed.
    pub fn remove_identity(&self, identity_id: &str) -> Result<usize> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| anyhow!("Failed to lock gallery: {}", e))?;
        let before = inner.embeddings.len();
        inner.embeddings.retain(|e| e.identity_id != identity_id);
        inner.labels.remove(identity_id);
        inner.identities.remove(identity_id);
        Ok(before - inner.embeddings.len())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<MatchCandidate>> {
        if query.len() != self.dimension {
            bail!(
                "query has dimension {}, gallery expects {}",
                query.len(),
                self.dimension
            );
        }
        let inner = self
            .inner
            .read()
            .map_err(|e| anyhow!("Failed to lock gallery: {}", e))?;

        let mut scored: Vec<MatchCandidate> = inner
            .embeddings
            .iter()
            .map(|e| MatchCandidate::new(e.identity_id.clone(), dot(query, &e.vector)))
            .collect();
        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(k);
        Ok(scored)
    }
}

#[async_trait]
impl IdentityGallery for MemoryGallery {
    async fn top_k(&self, query: &[f32], k: usize) -> Result<Vec<MatchCandidate>> {
        self.search(query, k)
    }

    fn label(&self, identity_id: &str) -> Option<String> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.labels.get(identity_id).cloned())
    }

    fn identity_count(&self) -> usize {
        self.inner.read().map(|i| i.identities.len()).unwrap_or(0)
    }

    fn stats(&self) -> GalleryStats {
        let (identities, embeddings) = self
            .inner
            .read()
            .map(|i| (i.identities.len(), i.embeddings.len()))
            .unwrap_or((0, 0));
        GalleryStats {
            identities,
            embeddings,
            dimension: self.dimension,
        }
    }
}
