//! Preferred embedding backend: fastembed (local ONNX inference).
//!
//! Loads `nomic-embed-text-v1.5` (768 dimensions, Matryoshka-trained,
//! 8192-token context) and truncates its output to [`PREFERRED_DIMENSIONS`]
//! for storage/index efficiency.

use fastembed::{EmbeddingModel as FastembedModel, InitOptions, TextEmbedding};
use std::sync::{Mutex, OnceLock};

use super::{matryoshka_truncate, EmbeddingError, EmbeddingModel};

/// Matryoshka-truncated output dimension (truncated from 768).
pub const PREFERRED_DIMENSIONS: usize = 256;

/// Texts longer than this are truncated before encoding.
pub const MAX_TEXT_LENGTH: usize = 8192;

/// Batch size used by `encode_batch`.
pub const BATCH_SIZE: usize = 32;

static MODEL: OnceLock<Result<Mutex<TextEmbedding>, String>> = OnceLock::new();

fn cache_dir() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("FASTEMBED_CACHE_PATH") {
        return std::path::PathBuf::from(path);
    }
    if let Some(proj_dirs) = directories::ProjectDirs::from("dev", "mnemora", "mnemora") {
        return proj_dirs.cache_dir().join("fastembed");
    }
    if let Some(base_dirs) = directories::BaseDirs::new() {
        return base_dirs.home_dir().join(".cache/mnemora/fastembed");
    }
    std::path::PathBuf::from(".fastembed_cache")
}

fn get_model() -> Result<std::sync::MutexGuard<'static, TextEmbedding>, EmbeddingError> {
    let result = MODEL.get_or_init(|| {
        let dir = cache_dir();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!("failed to create fastembed cache dir {:?}: {}", dir, e);
        }
        let options = InitOptions::new(FastembedModel::NomicEmbedTextV15)
            .with_show_download_progress(true)
            .with_cache_dir(dir);
        TextEmbedding::try_new(options).map(Mutex::new).map_err(|e| {
            format!(
                "failed to initialize nomic-embed-text-v1.5: {e}. ONNX runtime or model files \
                 may be unavailable"
            )
        })
    });

    match result {
        Ok(model) => model
            .lock()
            .map_err(|e| EmbeddingError::ModelInit(format!("lock poisoned: {e}"))),
        Err(e) => Err(EmbeddingError::ModelInit(e.clone())),
    }
}

/// fastembed-backed preferred embedder.
pub struct PreferredEmbedder;

impl PreferredEmbedder {
    pub fn new() -> Self {
        Self
    }

    /// Check that the model is loadable without holding the lock.
    pub fn check_ready(&self) -> Result<(), EmbeddingError> {
        get_model().map(|_| ())
    }
}

impl Default for PreferredEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingModel for PreferredEmbedder {
    fn model_name(&self) -> &str {
        "nomic-ai/nomic-embed-text-v1.5"
    }

    fn dimensions(&self) -> usize {
        PREFERRED_DIMENSIONS
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = get_model()?;
        let text = if text.len() > MAX_TEXT_LENGTH { &text[..MAX_TEXT_LENGTH] } else { text };
        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;
        let raw = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("no embedding generated".into()))?;
        Ok(matryoshka_truncate(raw, PREFERRED_DIMENSIONS))
    }

    fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let mut model = get_model()?;
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(BATCH_SIZE) {
            let truncated: Vec<&str> = chunk
                .iter()
                .map(|t| if t.len() > MAX_TEXT_LENGTH { &t[..MAX_TEXT_LENGTH] } else { *t })
                .collect();
            let embeddings = model
                .embed(truncated, None)
                .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;
            out.extend(embeddings.into_iter().map(|e| matryoshka_truncate(e, PREFERRED_DIMENSIONS)));
        }
        Ok(out)
    }
}
