//! # mnemora-core
//!
//! A long-term conversational memory engine for AI assistants: durable
//! storage of dialogue turns, approximate-nearest-neighbor semantic recall,
//! a typed association graph, a dynamic multi-factor weight/decay model,
//! and a background evaluator that turns raw turns into summaries, groups,
//! and associations.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use mnemora_core::prelude::*;
//! use std::sync::Arc;
//!
//! let config = MnemoraConfig::default();
//! let engine = Engine::open(config, Arc::new(my_llm_client))?;
//!
//! let ctx = engine.enhance_query("what did we decide about the database?", Some("session-1".into()));
//! let turn = engine.store_interaction("let's use postgres", "sounds good", Some("session-1".into()), ctx.selected_memory_ids.clone())?;
//! ```

pub mod cache;
pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod graph;
pub mod model;
pub mod monitor;
pub mod retrieval;
pub mod search;
pub mod session;
pub mod storage;
pub mod weight;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod prelude {
    pub use crate::cache::CacheManager;
    pub use crate::config::MnemoraConfig;
    pub use crate::engine::{Engine, EngineStats, StoredTurn};
    pub use crate::error::{EngineError, Result};
    pub use crate::evaluator::{EvaluationResult, LlmClient, StaticLlmClient};
    pub use crate::graph::AssociationGraph;
    pub use crate::model::{
        Association, AssociationKind, CacheLevel, Group, Memory, MemoryKind, MemoryPatch,
        MemoryTier, Role, Session, Vector,
    };
    pub use crate::retrieval::{ContextOut, PromptSection, QueryIn, Stats};
    pub use crate::storage::Storage;
}
