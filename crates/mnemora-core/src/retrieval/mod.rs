//! Retrieval Pipeline: turns a query into an assembled, budgeted context.
//!
//! Every step has a fall-through: the pipeline only ever returns the best
//! context it could assemble, never an error, per the failure semantics in
//! the component's contract.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::Utc;

use crate::cache::CacheManager;
use crate::config::{RetrievalConfig, ScoringWeights};
use crate::graph::AssociationGraph;
use crate::model::{Memory, MemoryKind, MemoryTier};
use crate::monitor::Monitor;
use crate::search::{reciprocal_rank_fusion, tokenize};
use crate::storage::Storage;

/// Strength assigned to a memory reached one hop from a seed.
const L1_ASSOC_STRENGTH: f32 = 0.8;
/// Strength assigned to a memory reached two hops from a seed.
const L2_ASSOC_STRENGTH: f32 = 0.5;
/// Weight nudge applied to a memory each time retrieval surfaces it.
const ACCESS_WEIGHT_DELTA: f64 = 0.05;

/// A retrieval request.
#[derive(Debug, Clone)]
pub struct QueryIn {
    pub text: String,
    pub session_id: Option<String>,
    pub recent_turns: usize,
}

impl Default for QueryIn {
    fn default() -> Self {
        Self { text: String::new(), session_id: None, recent_turns: 4 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptSection {
    pub label: &'static str,
    pub content: String,
    pub memory_ids: Vec<String>,
}

/// Per-call timing and outcome stats for a single `retrieve` invocation, as
/// opposed to `Monitor`'s process-wide aggregates.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub latencies_ms_per_step: HashMap<&'static str, f64>,
    pub cache_hit: bool,
    pub ann_used: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ContextOut {
    pub prompt_sections: Vec<PromptSection>,
    pub selected_memory_ids: Vec<String>,
    pub stats: Stats,
}

struct Candidate {
    memory: Memory,
    similarity: f32,
    association_strength: f32,
}

pub struct RetrievalPipeline {
    storage: Arc<Storage>,
    graph: Arc<RwLock<AssociationGraph>>,
    cache: Arc<CacheManager>,
    monitor: Arc<Monitor>,
    config: RetrievalConfig,
    scoring: ScoringWeights,
}

impl RetrievalPipeline {
    pub fn new(
        storage: Arc<Storage>,
        graph: Arc<RwLock<AssociationGraph>>,
        cache: Arc<CacheManager>,
        monitor: Arc<Monitor>,
        config: RetrievalConfig,
        scoring: ScoringWeights,
    ) -> Self {
        Self { storage, graph, cache, monitor, config, scoring }
    }

    /// Run `f`, recording its wall-clock duration both into the process-wide
    /// `Monitor` and into this call's own `Stats`.
    fn timed_step<T>(&self, stats: &mut Stats, name: &'static str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();
        stats.latencies_ms_per_step.insert(name, elapsed.as_secs_f64() * 1000.0);
        self.monitor.record_duration(name, elapsed);
        result
    }

    pub fn retrieve(&self, query: QueryIn) -> ContextOut {
        self.monitor.record_query();
        let mut stats = Stats::default();

        let (vector, cache_hit) =
            self.timed_step(&mut stats, "retrieval.vectorize", || self.vectorize(&query.text));
        stats.cache_hit = cache_hit;

        let (seeds, ann_used) =
            self.timed_step(&mut stats, "retrieval.ann_search", || self.ann_search(vector.as_deref(), &query.text));
        stats.ann_used = ann_used;

        let mut candidates: HashMap<String, Candidate> = HashMap::new();
        for (id, score) in &seeds {
            if let Ok(Some(memory)) = self.storage.get(id) {
                candidates.insert(
                    id.clone(),
                    Candidate { memory, similarity: *score, association_strength: 1.0 },
                );
            }
        }

        self.timed_step(&mut stats, "retrieval.association_expansion", || {
            self.expand_associations(&seeds, &mut candidates)
        });

        self.timed_step(&mut stats, "retrieval.history_aggregation", || {
            self.aggregate_history(&query, &mut candidates)
        });

        let mut scored = self.timed_step(&mut stats, "retrieval.scoring", || self.score_and_dedup(candidates));
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.config.k_final);

        for (memory, _) in &scored {
            self.cache.get(&memory.id);
        }

        let mut ctx =
            self.timed_step(&mut stats, "retrieval.context_assembly", || self.assemble(&query, scored));
        ctx.stats = stats;
        ctx
    }

    /// Returns the query embedding (if any) and whether it came from the
    /// embedding cache rather than a fresh embed call.
    fn vectorize(&self, text: &str) -> (Option<Vec<f32>>, bool) {
        if text.is_empty() {
            return (None, false);
        }
        if let Some(cached) = self.cache.get_cached_embedding(text) {
            return (Some(cached), true);
        }
        match self.storage.embed(text) {
            Ok(v) => {
                self.cache.cache_embedding(text, v.clone());
                (Some(v), false)
            }
            Err(e) => {
                tracing::warn!("query embedding failed, falling back to keyword search: {e}");
                (None, false)
            }
        }
    }

    /// Returns the seed hit list and whether the ANN index contributed to it
    /// (as opposed to a pure keyword fallback).
    fn ann_search(&self, vector: Option<&[f32]>, text: &str) -> (Vec<(String, f32)>, bool) {
        let keyword_hits = self.keyword_fallback(text);

        let Some(vector) = vector else {
            return (keyword_hits, false);
        };

        let mut ann_hits = self
            .storage
            .ann_search(vector, self.config.k_initial, self.config.min_score)
            .unwrap_or_default();

        if ann_hits.len() < 5 {
            if let Ok(more) = self.storage.ann_search(vector, self.config.k_initial, self.config.fallback_min_score) {
                ann_hits = more;
            }
        }

        if ann_hits.is_empty() {
            return (keyword_hits, false);
        }
        if keyword_hits.is_empty() {
            return (ann_hits, true);
        }

        (reciprocal_rank_fusion(&keyword_hits, &ann_hits, self.config.rrf_k), true)
    }

    fn keyword_fallback(&self, text: &str) -> Vec<(String, f32)> {
        let tokens = tokenize(text);
        self.cache
            .search_by_content(&tokens, self.config.k_initial)
            .into_iter()
            .map(|id| (id, self.config.fallback_min_score))
            .collect()
    }

    fn expand_associations(&self, seeds: &[(String, f32)], candidates: &mut HashMap<String, Candidate>) {
        let Ok(graph) = self.graph.read() else {
            tracing::warn!("association graph lock poisoned; proceeding with ANN-only set");
            return;
        };

        let seed_ids: Vec<String> = seeds.iter().take(self.config.k_assoc_seed).map(|(id, _)| id.clone()).collect();

        let (hop_strengths, min_strengths): (Vec<f32>, Vec<f32>) = if self.config.assoc_depth >= 2 {
            (vec![L1_ASSOC_STRENGTH, L2_ASSOC_STRENGTH], vec![self.config.min_score, self.config.fallback_min_score])
        } else {
            (vec![L1_ASSOC_STRENGTH], vec![self.config.min_score])
        };

        for (id, association_strength) in graph.expand(&seed_ids, &hop_strengths, &min_strengths) {
            self.add_candidate(&id, association_strength, candidates);
        }
    }

    fn add_candidate(&self, id: &str, association_strength: f32, candidates: &mut HashMap<String, Candidate>) {
        if candidates.contains_key(id) {
            return;
        }
        if let Ok(Some(memory)) = self.storage.get(id) {
            candidates.insert(id.to_string(), Candidate { memory, similarity: 0.0, association_strength });
        }
    }

    fn aggregate_history(&self, query: &QueryIn, candidates: &mut HashMap<String, Candidate>) {
        if let Some(session_id) = &query.session_id {
            let exclude: Vec<String> = candidates.keys().cloned().collect();
            if let Ok(recent_ids) = self.storage.recent_in_session(session_id, &exclude, query.recent_turns) {
                for id in recent_ids {
                    self.add_candidate(&id, 0.6, candidates);
                }
            }
        }

        let summary_ids: Vec<String> = {
            let Ok(graph) = self.graph.read() else { return };
            candidates
                .keys()
                .flat_map(|id| graph.neighbors(id, 0.0))
                .filter(|(_, kind, _)| *kind == crate::model::AssociationKind::Summarizes)
                .map(|(id, _, _)| id)
                .collect()
        };
        for id in summary_ids {
            self.add_candidate(&id, 0.7, candidates);
        }
    }

    fn score_and_dedup(&self, candidates: HashMap<String, Candidate>) -> Vec<(Memory, f64)> {
        let now = Utc::now();
        let mut by_content: HashMap<u64, (Memory, f64)> = HashMap::new();

        for (_, candidate) in candidates {
            let memory = candidate.memory;
            let hours_since_access = now.signed_duration_since(memory.last_accessed).num_minutes() as f64 / 60.0;
            let recency = (-hours_since_access / 24.0).exp();
            let freq = if memory.last_accessed == memory.created_at { 0.0 } else { 1.0 };
            let emotion_match =
                if memory.metadata.get("emotional").and_then(|v| v.as_bool()).unwrap_or(false) { 1.0 } else { 0.0 };

            let final_score = self.scoring.w_weight * (memory.weight / 10.0)
                + self.scoring.w_recency * recency
                + self.scoring.w_freq * freq
                + self.scoring.w_rel * candidate.similarity as f64
                + self.scoring.w_emotion * emotion_match
                + self.scoring.w_assoc * candidate.association_strength as f64;

            let hash = content_hash(&memory.content);
            match by_content.get(&hash) {
                Some((_, existing_score)) if *existing_score >= final_score => {}
                _ => {
                    by_content.insert(hash, (memory, final_score));
                }
            }
        }

        by_content.into_values().collect()
    }

    fn assemble(&self, query: &QueryIn, scored: Vec<(Memory, f64)>) -> ContextOut {
        let mut user_input = PromptSection { label: "current user input", ..Default::default() };
        if !query.text.is_empty() {
            user_input.content = format!("{}\n", query.text);
        }

        let mut core = PromptSection { label: "core memories", ..Default::default() };
        let mut recent = PromptSection { label: "recent dialogue", ..Default::default() };
        let mut related = PromptSection { label: "related memories", ..Default::default() };
        let mut summaries = PromptSection { label: "group summaries", ..Default::default() };
        let mut selected = vec![];

        for (memory, _score) in &scored {
            let line = format!("- {}\n", memory.content);
            let target = match (memory.kind, memory.tier()) {
                (MemoryKind::Summary, _) => &mut summaries,
                (_, MemoryTier::Core) => &mut core,
                _ => &mut related,
            };
            target.content.push_str(&line);
            target.memory_ids.push(memory.id.clone());

            if memory.kind != MemoryKind::Summary {
                recent.content.push_str(&line);
                recent.memory_ids.push(memory.id.clone());
            }

            selected.push(memory.id.clone());
            self.cache.record_memory_access(&memory.id, ACCESS_WEIGHT_DELTA).ok();
        }

        // Highest-priority sections first: each gets first claim on the
        // shared budget, so truncation falls on the lower-priority sections
        // queued behind it.
        let mut sections = vec![user_input, core, recent, related, summaries];

        let mut budget = self.config.max_context_chars;
        for section in sections.iter_mut() {
            if section.content.len() > budget {
                truncate_at_char_boundary(&mut section.content, budget);
            }
            budget = budget.saturating_sub(section.content.len());
        }

        sections.retain(|s| !s.content.is_empty());

        ContextOut { prompt_sections: sections, selected_memory_ids: selected, stats: Stats::default() }
    }
}

/// Truncates `s` to at most `max_bytes` bytes, backing off to the nearest
/// preceding UTF-8 char boundary so the cut never lands mid-codepoint.
fn truncate_at_char_boundary(s: &mut String, max_bytes: usize) {
    let mut cut = max_bytes.min(s.len());
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

fn content_hash(content: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    content.trim().to_lowercase().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_case_and_whitespace_insensitive() {
        assert_eq!(content_hash(" Hello "), content_hash("hello"));
    }

    #[test]
    fn query_in_defaults_to_no_session() {
        let q = QueryIn::default();
        assert!(q.session_id.is_none());
        assert_eq!(q.recent_turns, 4);
    }

    #[test]
    fn truncate_at_char_boundary_never_panics_mid_codepoint() {
        let mut s = "a🦀b".to_string();
        let byte_len_before_crab_ends = "a🦀".len() - 1;
        truncate_at_char_boundary(&mut s, byte_len_before_crab_ends);
        assert_eq!(s, "a");
    }

    #[test]
    fn truncate_at_char_boundary_is_a_no_op_under_budget() {
        let mut s = "hello".to_string();
        truncate_at_char_boundary(&mut s, 100);
        assert_eq!(s, "hello");
    }
}
