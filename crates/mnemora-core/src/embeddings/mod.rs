//! Embedding Provider: `text -> unit-norm Vec<f32>`.
//!
//! Two implementations exist: [`preferred::PreferredEmbedder`] (local ONNX
//! inference via fastembed, feature-gated) and [`fallback::FallbackEmbedder`]
//! (a dependency-free deterministic hashed-shingle embedder, always
//! available). [`EmbeddingProvider`] tries the preferred model at init and
//! falls back on load failure, fixing the engine-wide dimension `D` for the
//! lifetime of the process.

#[cfg(feature = "embeddings")]
mod preferred;

mod fallback;

pub use fallback::FallbackEmbedder;
#[cfg(feature = "embeddings")]
pub use preferred::PreferredEmbedder;

/// Embedding error types.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum EmbeddingError {
    ModelInit(String),
    EmbeddingFailed(String),
    InvalidInput(String),
}

impl std::fmt::Display for EmbeddingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingError::ModelInit(e) => write!(f, "model initialization failed: {e}"),
            EmbeddingError::EmbeddingFailed(e) => write!(f, "embedding generation failed: {e}"),
            EmbeddingError::InvalidInput(e) => write!(f, "invalid input: {e}"),
        }
    }
}

impl std::error::Error for EmbeddingError {}

/// Contract implemented by both the preferred and fallback embedders.
pub trait EmbeddingModel: Send + Sync {
    /// Human-readable model identifier, recorded alongside stored vectors.
    fn model_name(&self) -> &str;

    /// Fixed output dimension `D` for this model.
    fn dimensions(&self) -> usize;

    /// Encode a single text into a unit-norm vector of length `dimensions()`.
    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Encode a batch of texts. Default implementation calls `encode` in a
    /// loop; implementations with native batch support should override it.
    fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|t| self.encode(t)).collect()
    }
}

/// Which embedder is currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveBackend {
    Preferred,
    Fallback,
}

/// Selects and owns the active embedding backend.
///
/// At construction, the preferred model is attempted first; on load failure
/// the provider degrades to the fallback embedder and logs a warning. The
/// active backend and its dimension are then fixed for the process lifetime.
pub struct EmbeddingProvider {
    model: Box<dyn EmbeddingModel>,
    active: ActiveBackend,
}

impl EmbeddingProvider {
    /// Construct a provider, preferring the high-quality local model and
    /// degrading to the deterministic fallback on any initialization error.
    pub fn new() -> Self {
        #[cfg(feature = "embeddings")]
        {
            let preferred = PreferredEmbedder::new();
            match preferred.check_ready() {
                Ok(()) => {
                    return Self {
                        model: Box::new(preferred),
                        active: ActiveBackend::Preferred,
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        "preferred embedding model unavailable ({e}); falling back to the \
                         deterministic hashed-shingle embedder"
                    );
                }
            }
        }
        Self {
            model: Box::new(FallbackEmbedder::default()),
            active: ActiveBackend::Fallback,
        }
    }

    /// Construct a provider that always uses the fallback embedder,
    /// regardless of whether the preferred backend is compiled in. Useful
    /// for tests and for deployments that want no ONNX dependency at all.
    pub fn fallback_only() -> Self {
        Self {
            model: Box::new(FallbackEmbedder::default()),
            active: ActiveBackend::Fallback,
        }
    }

    pub fn active_backend(&self) -> ActiveBackend {
        self.active
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    pub fn dimensions(&self) -> usize {
        self.model.dimensions()
    }

    pub fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("text cannot be empty".into()));
        }
        let v = self.model.encode(text)?;
        if v.iter().any(|x| !x.is_finite()) {
            return Err(EmbeddingError::EmbeddingFailed(
                "embedder returned non-finite values".into(),
            ));
        }
        Ok(v)
    }

    pub fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.model.encode_batch(texts)
    }
}

impl Default for EmbeddingProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// L2-normalize a vector in place.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Truncate to `dims` and L2-renormalize (Matryoshka representation
/// truncation: the leading dimensions of a Matryoshka-trained model's output
/// are themselves a valid lower-dimensional embedding).
pub fn matryoshka_truncate(mut vector: Vec<f32>, dims: usize) -> Vec<f32> {
    if vector.len() > dims {
        vector.truncate(dims);
    }
    normalize(&mut vector);
    vector
}

#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = (norm_a * norm_b).sqrt();
    if denom > 0.0 { dot / denom } else { 0.0 }
}

#[inline]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MAX;
    }
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt()
}

#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let a = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-4);
    }

    #[test]
    fn fallback_only_provider_reports_fallback_backend() {
        let provider = EmbeddingProvider::fallback_only();
        assert_eq!(provider.active_backend(), ActiveBackend::Fallback);
        let v = provider.encode("hello world").unwrap();
        assert_eq!(v.len(), provider.dimensions());
    }

    #[test]
    fn empty_text_is_rejected() {
        let provider = EmbeddingProvider::fallback_only();
        assert!(provider.encode("").is_err());
    }
}
