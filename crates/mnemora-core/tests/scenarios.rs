//! End-to-end scenario tests exercising the Engine facade against a real
//! (tempdir-backed) Storage, Cache, and ANN index.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mnemora_core::prelude::*;
use mnemora_core::evaluator::{EvaluationResult, StaticLlmClient};

fn engine_with(config_fn: impl FnOnce(&mut MnemoraConfig)) -> (Engine, tempfile::TempDir) {
    engine_with_llm(config_fn, StaticLlmClient::default())
}

fn engine_with_llm(
    config_fn: impl FnOnce(&mut MnemoraConfig),
    llm: StaticLlmClient,
) -> (Engine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = MnemoraConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config_fn(&mut config);
    let engine = Engine::open(config, Arc::new(llm)).unwrap();
    (engine, dir)
}

fn wait_until(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    pred()
}

/// Scenario 1: store a turn, then ask a near-duplicate query and find it in
/// the assembled context's selected memories.
#[test]
fn insert_then_retrieve_near_duplicate_query() {
    let (engine, _dir) = engine_with(|_| {});

    let turn = engine
        .store_interaction(
            "my dentist appointment is next tuesday at 3pm",
            "got it, I'll remember that",
            Some("s1".into()),
            vec![],
        )
        .unwrap();

    let ctx = engine.enhance_query("when is my dentist appointment", Some("s1".into()));
    assert!(ctx.selected_memory_ids.contains(&turn.user_memory_id));
}

/// Scenario 2: a second `get_memory` for the same id is served from cache.
#[test]
fn cache_hit_round_trip() {
    let (engine, _dir) = engine_with(|_| {});

    let turn = engine.store_interaction("remember this fact", "noted", None, vec![]).unwrap();
    // insert_turn doesn't itself populate the cache; get_memory does on first miss.
    let first = engine.get_memory(&turn.user_memory_id).unwrap().unwrap();
    let second = engine.get_memory(&turn.user_memory_id).unwrap().unwrap();
    assert_eq!(second.content, first.content);
    assert_eq!(second.id, turn.user_memory_id);
}

/// Scenario 3: the background evaluator assigns a weight, a group, and a
/// linked summary memory to a stored turn without the caller blocking on it.
#[test]
fn evaluator_updates_weight_and_creates_group() {
    let llm = StaticLlmClient::new(EvaluationResult {
        summary: "discussed q3 roadmap priorities".into(),
        weight: 8.0,
        super_group: "work".into(),
        group_id: "roadmap".into(),
        ..Default::default()
    });
    let (engine, _dir) = engine_with_llm(|c| c.evaluator.per_item_timeout_ms = 2000, llm);

    let turn = engine
        .store_interaction("let's plan the q3 roadmap", "sure, starting with infra", None, vec![])
        .unwrap();

    let updated = wait_until(
        || {
            engine
                .get_memory(&turn.user_memory_id)
                .unwrap()
                .map(|m| m.group_id.is_some())
                .unwrap_or(false)
        },
        Duration::from_secs(5),
    );
    assert!(updated, "evaluator did not assign a group within the timeout");

    let memory = engine.get_memory(&turn.user_memory_id).unwrap().unwrap();
    assert_eq!(memory.group_id.as_deref(), Some("roadmap"));
    assert!(memory.weight >= 7.0, "expected a high weight for a decision-laden exchange, got {}", memory.weight);

    let summarized = engine.neighbors_of(&turn.user_memory_id, 0.0).unwrap();
    let summary_link = summarized.iter().find(|a| a.kind == AssociationKind::Summarizes);
    assert!(summary_link.is_some(), "expected the turn to be linked to a summary memory");

    let summary_memory = engine.get_memory(&summary_link.unwrap().target_id).unwrap().unwrap();
    assert_eq!(summary_memory.kind, MemoryKind::Summary);
    assert_eq!(summary_memory.content, "discussed q3 roadmap priorities");
}

/// Scenario 4: the dual-write is all-or-nothing. An invalid turn (empty
/// content) is rejected before anything is persisted.
#[test]
fn rejected_insert_leaves_no_partial_state() {
    let (engine, _dir) = engine_with(|_| {});

    let result = engine.store_interaction("", "a reply", None, vec![]);
    assert!(result.is_err());

    let stats = engine.stats();
    assert_eq!(stats.ann_len, 0);
}

/// Scenario 5: an archived memory can be restored, is re-searchable, and
/// gets a one-time weight boost.
#[test]
fn archive_and_restore_round_trips() {
    let (engine, _dir) = engine_with(|_| {});

    let turn = engine.store_interaction("an old memory", "sure", None, vec![]).unwrap();
    engine
        .update_memory(
            &turn.user_memory_id,
            &MemoryPatch { archived: Some(true), weight: Some(1.0), ..Default::default() },
        )
        .unwrap();

    let archived = engine.get_memory(&turn.user_memory_id).unwrap().unwrap();
    assert!(archived.archived);

    engine.restore_memory(&turn.user_memory_id).unwrap();
    let restored = engine.get_memory(&turn.user_memory_id).unwrap().unwrap();
    assert!(!restored.archived);
    assert!(restored.weight > 1.0);
}

/// Scenario 6: when a query has no close semantic match, retrieval falls
/// back to the keyword index rather than returning nothing.
#[test]
fn keyword_fallback_finds_unrelated_phrasing_match() {
    let (engine, _dir) = engine_with(|c| {
        c.retrieval.min_score = 0.999;
        c.retrieval.fallback_min_score = 0.999;
    });

    let turn = engine
        .store_interaction("xylophone marmalade quokka", "interesting combination", None, vec![])
        .unwrap();
    // The keyword fallback searches the cache's content index, which is
    // populated lazily on a cache miss; prime it the way a prior lookup would.
    engine.get_memory(&turn.user_memory_id).unwrap();

    let ctx = engine.enhance_query("quokka", None);
    assert!(ctx.selected_memory_ids.contains(&turn.user_memory_id));
}
