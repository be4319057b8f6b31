//! Engine configuration.
//!
//! One struct per section, `#[serde(default, deny_unknown_fields)]` so a
//! malformed or renamed key fails loudly at load time rather than being
//! silently ignored. Loaded from TOML; `update` re-validates before
//! swapping in the new value.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub db_file: PathBuf,
    pub ann_file: PathBuf,
    pub schema_version: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_file: PathBuf::from("mnemora.db"),
            ann_file: PathBuf::from("mnemora.ann"),
            schema_version: crate::storage::SCHEMA_VERSION,
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "mnemora", "mnemora")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".mnemora"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrievalConfig {
    pub k_initial: usize,
    pub min_score: f32,
    pub fallback_min_score: f32,
    pub k_assoc_seed: usize,
    pub assoc_depth: u8,
    pub k_final: usize,
    pub max_context_chars: usize,
    /// Fusion constant for combining ANN and keyword hit lists with
    /// reciprocal rank fusion.
    pub rrf_k: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_initial: 15,
            min_score: 0.3,
            fallback_min_score: 0.1,
            k_assoc_seed: 5,
            assoc_depth: 2,
            k_final: 15,
            max_context_chars: 8000,
            rrf_k: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringWeights {
    pub w_weight: f64,
    pub w_recency: f64,
    pub w_freq: f64,
    pub w_rel: f64,
    pub w_emotion: f64,
    pub w_assoc: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            w_weight: 0.25,
            w_recency: 0.15,
            w_freq: 0.1,
            w_rel: 0.35,
            w_emotion: 0.05,
            w_assoc: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub c_hot: usize,
    pub c_warm: usize,
    pub c_cold: usize,
    pub promotion_threshold: u64,
    pub importance_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            c_hot: 256,
            c_warm: 4096,
            c_cold: 65536,
            promotion_threshold: 3,
            importance_threshold: 7.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    pub decay_per_day: f64,
    pub archive_age_days: i64,
    pub archive_weight_threshold: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            decay_per_day: 0.995,
            archive_age_days: 30,
            archive_weight_threshold: 4.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvaluatorConfig {
    pub queue_capacity: usize,
    pub per_item_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            per_item_timeout_ms: 30_000,
            max_retries: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub inactivity_timeout_s: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_s: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MnemoraConfig {
    pub storage: StorageConfig,
    pub retrieval: RetrievalConfig,
    pub scoring: ScoringWeights,
    pub cache: CacheConfig,
    pub lifecycle: LifecycleConfig,
    pub evaluator: EvaluatorConfig,
    pub session: SessionConfig,
}

impl MnemoraConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::fs::read_to_string(path) {
            config = toml::from_str(&raw)
                .map_err(|e| EngineError::ConfigurationInvalid(e.to_string()))?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::IoFailure(e.to_string()))?;
        }
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| EngineError::ConfigurationInvalid(e.to_string()))?;
        std::fs::write(path, rendered).map_err(|e| EngineError::IoFailure(e.to_string()))?;
        Ok(())
    }

    /// Validate cross-field invariants. Called before any config swap.
    pub fn validate(&self) -> Result<()> {
        let w = &self.scoring;
        let sum = w.w_weight + w.w_recency + w.w_freq + w.w_rel + w.w_emotion + w.w_assoc;
        if !(0.0..=2.0).contains(&sum) {
            return Err(EngineError::ConfigurationInvalid(format!(
                "scoring weights sum to {sum}, expected roughly 1.0"
            )));
        }
        if self.retrieval.k_initial == 0 || self.retrieval.k_final == 0 {
            return Err(EngineError::ConfigurationInvalid(
                "k_initial and k_final must be positive".into(),
            ));
        }
        if self.retrieval.min_score < self.retrieval.fallback_min_score {
            return Err(EngineError::ConfigurationInvalid(
                "min_score must be >= fallback_min_score".into(),
            ));
        }
        if self.lifecycle.decay_per_day <= 0.0 || self.lifecycle.decay_per_day > 1.0 {
            return Err(EngineError::ConfigurationInvalid(
                "decay_per_day must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(MnemoraConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_scoring_weights_rejected() {
        let mut cfg = MnemoraConfig::default();
        cfg.scoring.w_weight = 10.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = MnemoraConfig::default();
        cfg.save_to(&path).unwrap();
        let loaded = MnemoraConfig::load_from(&path).unwrap();
        assert_eq!(loaded.retrieval.k_initial, cfg.retrieval.k_initial);
    }

    #[test]
    fn unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[storage]\nbogus_key = 1\n").unwrap();
        assert!(MnemoraConfig::load_from(&path).is_err());
    }
}
