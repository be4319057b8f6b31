//! The evaluator's consumer loop: per-item timeout, one retry with a
//! reduced prompt, isolate-on-failure.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cache::CacheManager;
use crate::config::EvaluatorConfig;
use crate::graph::AssociationGraph;
use crate::model::{AssociationKind, Group, Memory, MemoryKind, MemoryPatch};
use crate::storage::Storage;

use super::llm::{EvaluationResult, LlmClient};

/// One evaluation job, produced by Storage after a successful `insert_turn`.
#[derive(Debug, Clone)]
pub struct EvaluatorItem {
    pub user_memory_id: String,
    pub assistant_memory_id: String,
    pub session_id: Option<String>,
    pub retrieved_context_ids: Vec<String>,
}

/// A handle producers use to enqueue items without blocking beyond the
/// bounded channel; when the queue is full the item is dropped and a
/// warning logged rather than applying backpressure to the caller.
#[derive(Clone)]
pub struct EvaluatorHandle {
    sender: mpsc::Sender<EvaluatorItem>,
}

impl EvaluatorHandle {
    pub(super) fn new(sender: mpsc::Sender<EvaluatorItem>) -> Self {
        Self { sender }
    }

    /// Enqueue an item. Returns `false` (and logs a warning) if the queue is
    /// full; the turn itself is already durably stored either way.
    pub fn try_enqueue(&self, item: EvaluatorItem) -> bool {
        match self.sender.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("evaluator queue full; dropping item, memories retain default weight");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("evaluator consumer is gone; dropping item");
                false
            }
        }
    }
}

pub(super) struct Consumer {
    pub config: EvaluatorConfig,
    pub llm: Arc<dyn LlmClient>,
    pub storage: Arc<Storage>,
    pub graph: Arc<RwLock<AssociationGraph>>,
    pub cache: Arc<CacheManager>,
}

impl Consumer {
    fn graph_write(&self) -> crate::error::Result<std::sync::RwLockWriteGuard<'_, AssociationGraph>> {
        self.graph.write().map_err(|_| crate::error::EngineError::Busy("association graph".into()))
    }

    pub async fn run(self, mut rx: mpsc::Receiver<EvaluatorItem>) {
        while let Some(item) = rx.recv().await {
            self.process_with_retry(item).await;
        }
        tracing::info!("evaluator consumer shutting down: channel closed");
    }

    async fn process_with_retry(&self, item: EvaluatorItem) {
        let timeout = Duration::from_millis(self.config.per_item_timeout_ms);
        let mut reduced_prompt = false;

        for attempt in 0..=self.config.max_retries {
            let outcome =
                tokio::time::timeout(timeout, self.process_once(&item, reduced_prompt)).await;
            match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => {
                    tracing::warn!(
                        "evaluator item failed on attempt {attempt} (user_memory={}): {e}",
                        item.user_memory_id
                    );
                    reduced_prompt = true;
                }
                Err(_) => {
                    tracing::warn!(
                        "evaluator item timed out on attempt {attempt} (user_memory={})",
                        item.user_memory_id
                    );
                }
            }
        }

        tracing::error!(
            "evaluator item isolated after exhausting retries: user_memory={}",
            item.user_memory_id
        );
        self.apply_default_weight(&item);
    }

    fn apply_default_weight(&self, item: &EvaluatorItem) {
        for id in [&item.user_memory_id, &item.assistant_memory_id] {
            let patch = MemoryPatch {
                metadata: Some(serde_json::json!({"raw_evaluation": "isolated_after_retries"})),
                ..Default::default()
            };
            if let Err(e) = self.storage.update_memory(id, &patch) {
                tracing::warn!("failed to mark isolated memory {id}: {e}");
            }
        }
    }

    async fn process_once(&self, item: &EvaluatorItem, reduced_prompt: bool) -> crate::error::Result<()> {
        let user_memory = self
            .storage
            .get(&item.user_memory_id)?
            .ok_or_else(|| crate::error::EngineError::NotFound(item.user_memory_id.clone()))?;
        let assistant_memory = self
            .storage
            .get(&item.assistant_memory_id)?
            .ok_or_else(|| crate::error::EngineError::NotFound(item.assistant_memory_id.clone()))?;

        let prompt = build_prompt(&user_memory, &assistant_memory, &item.retrieved_context_ids, reduced_prompt);

        let evaluation = match self.llm.complete_structured(&prompt).await {
            Ok(e) => e,
            Err(e) if !reduced_prompt => {
                tracing::warn!("structured evaluation failed, retrying with reduced prompt: {e}");
                let reduced = build_prompt(&user_memory, &assistant_memory, &[], true);
                self.llm.complete_structured(&reduced).await?
            }
            Err(e) => return Err(e),
        };

        self.apply_evaluation(&user_memory, &assistant_memory, item, &evaluation)?;
        Ok(())
    }

    fn apply_evaluation(
        &self,
        user_memory: &Memory,
        assistant_memory: &Memory,
        item: &EvaluatorItem,
        evaluation: &EvaluationResult,
    ) -> crate::error::Result<()> {
        let weight = evaluation.weight.clamp(0.1, 10.0);
        let metadata = serde_json::json!({
            "summary": evaluation.summary,
            "topic": evaluation.topic,
            "behavior_change": evaluation.behavior_change,
            "emotional": evaluation.emotional_state.is_some(),
            "emotional_state": evaluation.emotional_state,
        });

        for memory in [user_memory, assistant_memory] {
            self.storage.update_memory(
                &memory.id,
                &MemoryPatch {
                    weight: Some(weight),
                    group_id: Some(Some(evaluation.group_id.clone())),
                    summary: Some(Some(evaluation.summary.clone())),
                    metadata: Some(metadata.clone()),
                    ..Default::default()
                },
            )?;
            self.cache.invalidate(&memory.id).ok();
        }

        let summary_memory = Memory::new(
            evaluation.summary.clone(),
            MemoryKind::Summary,
            crate::model::Role::System,
            item.session_id.clone(),
        );
        if !summary_memory.content.is_empty() {
            match self.storage.insert_memory(summary_memory) {
                Ok(summary_id) => {
                    for id in [&item.user_memory_id, &item.assistant_memory_id] {
                        if let Err(e) = self.storage.upsert_association(
                            &summary_id,
                            id,
                            AssociationKind::Summarizes,
                            1.0,
                        ) {
                            tracing::warn!("failed to link summary {summary_id} to {id}: {e}");
                        }
                    }
                }
                Err(e) => tracing::warn!("failed to persist summary memory: {e}"),
            }
        }

        let now = chrono::Utc::now();
        let group = Group {
            group_id: evaluation.group_id.clone(),
            super_group: evaluation.super_group.clone(),
            topic: evaluation.topic.clone().unwrap_or_default(),
            time_start: user_memory.created_at.min(now),
            time_end: now,
            summary: Some(evaluation.summary.clone()),
            score: weight,
        };
        self.storage.upsert_group(&group)?;

        self.create_automatic_associations(user_memory, assistant_memory, item, &evaluation.group_id)?;

        Ok(())
    }

    fn create_automatic_associations(
        &self,
        user_memory: &Memory,
        assistant_memory: &Memory,
        item: &EvaluatorItem,
        group_id: &str,
    ) -> crate::error::Result<()> {
        let both = [item.user_memory_id.clone(), item.assistant_memory_id.clone()];

        if let Some(session_id) = &item.session_id {
            for recent_id in self.storage.recent_in_session(session_id, &both, 5)? {
                self.storage.upsert_association(
                    &item.user_memory_id,
                    &recent_id,
                    AssociationKind::TemporalSequence,
                    0.7,
                )?;
                self.graph_write()?.link(
                    &item.user_memory_id,
                    &recent_id,
                    AssociationKind::TemporalSequence,
                    0.7,
                );
            }
        }

        for member_id in self.storage.members_of_group(group_id, &both, 10)? {
            self.storage
                .upsert_association(&item.user_memory_id, &member_id, AssociationKind::SameTopic, 0.6)?;
            self.graph_write()?.link(
                &item.user_memory_id,
                &member_id,
                AssociationKind::SameTopic,
                0.6,
            );
        }

        if let Some(vector) = self.storage.vector_for(&item.user_memory_id)? {
            for (similar_id, score) in self.storage.ann_search(&vector, 6, 0.6)? {
                if both.contains(&similar_id) {
                    continue;
                }
                self.storage.upsert_association(
                    &item.user_memory_id,
                    &similar_id,
                    AssociationKind::IsRelatedTo,
                    score,
                )?;
                self.graph_write()?.link(
                    &item.user_memory_id,
                    &similar_id,
                    AssociationKind::IsRelatedTo,
                    score,
                );
            }
        }

        let _ = assistant_memory;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_drops_and_reports_false() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = EvaluatorHandle::new(tx);
        assert!(handle.try_enqueue(EvaluatorItem {
            user_memory_id: "u1".into(),
            assistant_memory_id: "a1".into(),
            session_id: None,
            retrieved_context_ids: vec![],
        }));
        assert!(!handle.try_enqueue(EvaluatorItem {
            user_memory_id: "u2".into(),
            assistant_memory_id: "a2".into(),
            session_id: None,
            retrieved_context_ids: vec![],
        }));
    }

    #[test]
    fn closed_channel_drops_and_reports_false() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let handle = EvaluatorHandle::new(tx);
        assert!(!handle.try_enqueue(EvaluatorItem {
            user_memory_id: "u1".into(),
            assistant_memory_id: "a1".into(),
            session_id: None,
            retrieved_context_ids: vec![],
        }));
    }
}

fn build_prompt(
    user_memory: &Memory,
    assistant_memory: &Memory,
    retrieved_context_ids: &[String],
    reduced: bool,
) -> String {
    if reduced {
        format!(
            "Evaluate this exchange briefly.\nUser: {}\nAssistant: {}\nRespond with summary, weight (0-10), super_group, group_id.",
            user_memory.content, assistant_memory.content
        )
    } else {
        format!(
            "Evaluate this exchange.\nUser: {}\nAssistant: {}\nRetrieved context ids: {:?}\n\
             Respond with summary, weight (0-10), super_group, group_id, and optionally \
             behavior_change, emotional_state, topic.",
            user_memory.content, assistant_memory.content, retrieved_context_ids
        )
    }
}
