//! Fallback embedding backend: deterministic, dependency-free, no model
//! files required. Hashes character shingles into a fixed-size vector via
//! the hashing trick and L2-normalizes the result.
//!
//! This backend never fails to load, so the engine can always make
//! progress even when the preferred ONNX model is unavailable.

use sha2::{Digest, Sha256};

use super::{normalize, EmbeddingError, EmbeddingModel};

/// Output dimension of the fallback embedder. Smaller than the preferred
/// backend's dimension by design (spec allows `D_fallback` to be smaller).
pub const FALLBACK_DIMENSIONS: usize = 128;

/// Shingle (character n-gram) length.
const SHINGLE_LEN: usize = 3;

/// Hashes a byte shingle into a bucket index and a sign.
fn hash_shingle(bytes: &[u8]) -> (usize, f32) {
    let digest = Sha256::digest(bytes);
    let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
        % FALLBACK_DIMENSIONS;
    let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
    (bucket, sign)
}

/// Deterministic hashed-shingle embedder.
#[derive(Debug, Default, Clone, Copy)]
pub struct FallbackEmbedder;

impl EmbeddingModel for FallbackEmbedder {
    fn model_name(&self) -> &str {
        "mnemora-fallback-hashed-shingle-v1"
    }

    fn dimensions(&self) -> usize {
        FALLBACK_DIMENSIONS
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("text cannot be empty".into()));
        }

        let normalized_text: String = text.chars().flat_map(|c| c.to_lowercase()).collect();
        let chars: Vec<char> = normalized_text.chars().collect();

        let mut vector = vec![0.0_f32; FALLBACK_DIMENSIONS];

        if chars.len() < SHINGLE_LEN {
            let (bucket, sign) = hash_shingle(normalized_text.as_bytes());
            vector[bucket] += sign;
        } else {
            for window in chars.windows(SHINGLE_LEN) {
                let shingle: String = window.iter().collect();
                let (bucket, sign) = hash_shingle(shingle.as_bytes());
                vector[bucket] += sign;
            }
        }

        normalize(&mut vector);
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_deterministic() {
        let embedder = FallbackEmbedder;
        let a = embedder.encode("hello there").unwrap();
        let b = embedder.encode("hello there").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn encoding_is_unit_norm() {
        let embedder = FallbackEmbedder;
        let v = embedder.encode("the quick brown fox").unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }

    #[test]
    fn different_text_yields_different_vector() {
        let embedder = FallbackEmbedder;
        let a = embedder.encode("hello world").unwrap();
        let b = embedder.encode("goodbye moon").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_text_rejected() {
        let embedder = FallbackEmbedder;
        assert!(embedder.encode("").is_err());
    }

    #[test]
    fn short_text_still_encodes() {
        let embedder = FallbackEmbedder;
        let v = embedder.encode("hi").unwrap();
        assert_eq!(v.len(), FALLBACK_DIMENSIONS);
    }
}
