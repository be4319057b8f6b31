//! Engine: the single facade the rest of an application talks to.
//!
//! Owns every subsystem (Storage, Cache, AssociationGraph, Retrieval,
//! Evaluator, Sessions, Monitor) and wires them together the way the crate's
//! components describe: Storage is the only durable writer, Cache and the
//! graph are rebuildable mirrors, Retrieval reads all three, and a stored
//! turn is hand off to the Evaluator without the caller waiting on it.

use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::cache::CacheManager;
use crate::config::MnemoraConfig;
use crate::error::{EngineError, Result};
use crate::evaluator::{self, EvaluatorHandle, EvaluatorItem, LlmClient};
use crate::graph::AssociationGraph;
use crate::model::{Association, Group, Memory, MemoryPatch};
use crate::monitor::{Monitor, MonitorSnapshot};
use crate::retrieval::{ContextOut, QueryIn, RetrievalPipeline};
use crate::session::SessionManager;
use crate::storage::{ConsistencyReport, RepairReport, Storage};
use crate::weight::LifecycleScheduler;

/// Result of `store_interaction`: the two memory ids that were just written.
#[derive(Debug, Clone, Serialize)]
pub struct StoredTurn {
    pub user_memory_id: String,
    pub assistant_memory_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub cache_hot_len: usize,
    pub cache_warm_len: usize,
    pub cache_cold_len: usize,
    pub ann_len: usize,
    pub graph_nodes: usize,
    pub graph_edges: usize,
    pub monitor: MonitorSnapshot,
}

/// The memory engine. Cheap to clone-share via `Arc<Engine>`; every field is
/// itself already `Arc`-wrapped or internally synchronized.
pub struct Engine {
    storage: Arc<Storage>,
    graph: Arc<RwLock<AssociationGraph>>,
    cache: Arc<CacheManager>,
    monitor: Arc<Monitor>,
    sessions: SessionManager,
    evaluator: EvaluatorHandle,
    retrieval: RetrievalPipeline,
    lifecycle: LifecycleScheduler,
    config: RwLock<MnemoraConfig>,
}

impl Engine {
    /// The facade never panics on a poisoned lock: a prior panicking holder
    /// doesn't make the guarded state unusable, so recover it instead.
    fn graph_read(&self) -> std::sync::RwLockReadGuard<'_, AssociationGraph> {
        self.graph.read().unwrap_or_else(|e| e.into_inner())
    }

    fn graph_write(&self) -> std::sync::RwLockWriteGuard<'_, AssociationGraph> {
        self.graph.write().unwrap_or_else(|e| e.into_inner())
    }

    fn config_read(&self) -> std::sync::RwLockReadGuard<'_, MnemoraConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    fn config_write(&self) -> std::sync::RwLockWriteGuard<'_, MnemoraConfig> {
        self.config.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Open (creating if absent) every durable subsystem at the paths named
    /// by `config`, reconcile the in-memory mirrors (ANN index, association
    /// graph) against Storage, and start the background evaluator.
    pub fn open(config: MnemoraConfig, llm: Arc<dyn LlmClient>) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config.storage)?);

        let mut graph = AssociationGraph::new();
        graph.rebuild_from(
            storage
                .all_associations()?
                .into_iter()
                .map(|a: Association| (a.source_id, a.target_id, a.kind, a.strength)),
        );
        let graph = Arc::new(RwLock::new(graph));

        let cold_dir = config.storage.data_dir.join("cache");
        let cache = Arc::new(CacheManager::open(&config.cache, &cold_dir, Arc::clone(&storage))?);

        let monitor = Arc::new(Monitor::new());
        let sessions = SessionManager::new(config.session.inactivity_timeout_s);

        let evaluator = evaluator::start(
            config.evaluator.clone(),
            llm,
            Arc::clone(&storage),
            Arc::clone(&graph),
            Arc::clone(&cache),
        );

        let retrieval = RetrievalPipeline::new(
            Arc::clone(&storage),
            Arc::clone(&graph),
            Arc::clone(&cache),
            Arc::clone(&monitor),
            config.retrieval.clone(),
            config.scoring.clone(),
        );

        let lifecycle = LifecycleScheduler::new(config.lifecycle.clone());

        Ok(Self {
            storage,
            graph,
            cache,
            monitor,
            sessions,
            evaluator,
            retrieval,
            lifecycle,
            config: RwLock::new(config),
        })
    }

    /// Build the context to prepend to the next LLM prompt. Never errors:
    /// every step in the pipeline degrades gracefully instead.
    pub fn enhance_query(&self, text: impl Into<String>, session_id: Option<String>) -> ContextOut {
        if let Some(session_id) = &session_id {
            self.sessions.open_or_refresh(session_id);
        }
        let recent_turns = self.config_read().retrieval.k_final;
        self.retrieval.retrieve(QueryIn { text: text.into(), session_id, recent_turns })
    }

    /// Durably store a dialogue turn, then hand it to the Evaluator queue.
    /// Returns as soon as the turn is committed; evaluation (weight, group,
    /// summary, associations) happens asynchronously.
    pub fn store_interaction(
        &self,
        user_text: impl Into<String>,
        assistant_text: impl Into<String>,
        session_id: Option<String>,
        retrieved_context_ids: Vec<String>,
    ) -> Result<StoredTurn> {
        self.monitor.record_store();
        let (user_memory_id, assistant_memory_id) = self
            .storage
            .insert_turn(&user_text.into(), &assistant_text.into(), session_id.as_deref())?;

        if let Some(session_id) = &session_id {
            self.sessions.open_or_refresh(session_id);
        }

        let enqueued = self.evaluator.try_enqueue(EvaluatorItem {
            user_memory_id: user_memory_id.clone(),
            assistant_memory_id: assistant_memory_id.clone(),
            session_id,
            retrieved_context_ids,
        });
        if !enqueued {
            self.monitor.record_evaluator_drop();
        }

        Ok(StoredTurn { user_memory_id, assistant_memory_id })
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        if let Some(memory) = self.cache.get(id) {
            return Ok(Some(memory));
        }
        let memory = self.storage.get(id)?;
        if let Some(memory) = &memory {
            self.cache.put(memory).map_err(|e| EngineError::IoFailure(e.to_string()))?;
        }
        Ok(memory)
    }

    pub fn update_memory(&self, id: &str, patch: &MemoryPatch) -> Result<()> {
        self.storage.update_memory(id, patch)?;
        self.cache.invalidate(id).map_err(|e| EngineError::IoFailure(e.to_string()))?;
        Ok(())
    }

    pub fn delete_memory(&self, id: &str) -> Result<()> {
        self.storage.delete(id)?;
        self.cache.invalidate(id).map_err(|e| EngineError::IoFailure(e.to_string()))?;
        Ok(())
    }

    /// Restore a previously archived memory, re-adding it to the ANN index
    /// and giving its weight a one-time boost.
    pub fn restore_memory(&self, id: &str) -> Result<()> {
        self.storage.restore(id)?;
        self.cache.invalidate(id).map_err(|e| EngineError::IoFailure(e.to_string()))?;
        Ok(())
    }

    pub fn neighbors_of(&self, id: &str, min_strength: f32) -> Result<Vec<Association>> {
        Ok(self.storage.neighbors_of(id, min_strength)?)
    }

    pub fn upsert_group(&self, group: &Group) -> Result<()> {
        Ok(self.storage.upsert_group(group)?)
    }

    pub fn search_by_keyword(&self, query: &str, limit: usize) -> Vec<String> {
        let tokens = crate::search::tokenize(query);
        let hits = self.cache.search_by_content(&tokens, limit);
        if !hits.is_empty() {
            return hits;
        }
        self.storage.search_fts(query, limit).unwrap_or_default()
    }

    pub fn check_consistency(&self) -> Result<ConsistencyReport> {
        Ok(self.storage.check_consistency()?)
    }

    pub fn repair_consistency(&self) -> Result<RepairReport> {
        Ok(self.storage.repair_consistency()?)
    }

    /// Run one periodic maintenance pass: decay weights, archive memories
    /// that qualify, close stale sessions, and let associations fade.
    pub fn run_maintenance(&self) -> Result<()> {
        self.lifecycle.tick(&self.storage)?;
        self.sessions.close_inactive();
        self.graph_write().decay(self.config_read().lifecycle.decay_per_day as f32);
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        let cache_stats = self.cache.stats();
        let graph = self.graph_read();
        EngineStats {
            cache_hot_len: cache_stats.hot_len,
            cache_warm_len: cache_stats.warm_len,
            cache_cold_len: cache_stats.cold_len,
            ann_len: self.storage.ann_len().unwrap_or(0),
            graph_nodes: graph.node_count(),
            graph_edges: graph.edge_count(),
            monitor: self.monitor.snapshot(),
        }
    }

    /// Validate and swap in a new configuration. Subsystems that were
    /// already constructed from the old configuration (Storage's open
    /// connections, the running Evaluator) keep their existing settings
    /// until the engine is reopened; retrieval tuning and scoring weights
    /// apply to the very next query.
    pub fn update_config(&self, new_config: MnemoraConfig) -> Result<()> {
        new_config.validate()?;
        *self.config_write() = new_config;
        Ok(())
    }

    pub fn config(&self) -> MnemoraConfig {
        self.config_read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EvaluationResult;
    use async_trait::async_trait;

    struct StubLlm;

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok("ok".into())
        }

        async fn complete_structured(&self, _prompt: &str) -> Result<EvaluationResult> {
            Ok(EvaluationResult {
                summary: "discussed test setup".into(),
                weight: 5.0,
                super_group: "work".into(),
                group_id: "grp-test".into(),
                ..Default::default()
            })
        }
    }

    fn test_engine() -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MnemoraConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        let engine = Engine::open(config, Arc::new(StubLlm)).unwrap();
        (engine, dir)
    }

    #[test]
    fn store_then_retrieve_round_trips() {
        let (engine, _dir) = test_engine();
        let turn = engine
            .store_interaction("what is rust ownership", "it tracks a single owner per value", None, vec![])
            .unwrap();
        let fetched = engine.get_memory(&turn.user_memory_id).unwrap();
        assert!(fetched.is_some());
    }

    #[test]
    fn enhance_query_never_errors_on_empty_store() {
        let (engine, _dir) = test_engine();
        let ctx = engine.enhance_query("anything", None);
        assert!(ctx.selected_memory_ids.is_empty());
    }

    #[test]
    fn delete_then_get_returns_none() {
        let (engine, _dir) = test_engine();
        let turn = engine.store_interaction("hello", "hi there", None, vec![]).unwrap();
        engine.delete_memory(&turn.user_memory_id).unwrap();
        assert!(engine.get_memory(&turn.user_memory_id).unwrap().is_none());
    }

    #[test]
    fn update_config_rejects_invalid() {
        let (engine, _dir) = test_engine();
        let mut bad = engine.config();
        bad.retrieval.k_initial = 0;
        assert!(engine.update_config(bad).is_err());
    }
}
