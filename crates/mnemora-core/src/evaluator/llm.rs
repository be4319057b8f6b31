//! The injected LLM client contract and the structured evaluation it
//! returns for a stored turn.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// One LLM-produced evaluation of a dialogue turn.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EvaluationResult {
    pub summary: String,
    pub weight: f64,
    pub super_group: String,
    pub group_id: String,
    pub behavior_change: Option<String>,
    pub emotional_state: Option<String>,
    pub topic: Option<String>,
}

/// External LLM provider, injected so the Evaluator never depends on a
/// concrete backend. Implementors typically wrap an HTTP client.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Free-form completion, used for the reduced-prompt retry path.
    async fn complete(&self, prompt: &str) -> Result<String, EngineError>;

    /// Completion parsed into the structured evaluation schema.
    async fn complete_structured(&self, prompt: &str) -> Result<EvaluationResult, EngineError>;
}

/// A test double that always returns the same evaluation, regardless of
/// prompt. No real LLM integration ships with this crate; callers provide
/// their own `LlmClient`. This exists for tests and for callers who want to
/// run the engine with evaluation disabled in all but name.
pub struct StaticLlmClient {
    pub result: EvaluationResult,
}

impl StaticLlmClient {
    pub fn new(result: EvaluationResult) -> Self {
        Self { result }
    }
}

impl Default for StaticLlmClient {
    fn default() -> Self {
        Self {
            result: EvaluationResult {
                summary: String::new(),
                weight: 5.0,
                super_group: "other".into(),
                group_id: "ungrouped".into(),
                behavior_change: None,
                emotional_state: None,
                topic: None,
            },
        }
    }
}

#[async_trait]
impl LlmClient for StaticLlmClient {
    async fn complete(&self, _prompt: &str) -> Result<String, EngineError> {
        Ok(self.result.summary.clone())
    }

    async fn complete_structured(&self, _prompt: &str) -> Result<EvaluationResult, EngineError> {
        Ok(self.result.clone())
    }
}
