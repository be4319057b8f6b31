//! Evaluator Queue: a single-consumer background pipeline that turns a
//! freshly stored dialogue turn into a weight, a group, a summary, and a
//! handful of automatic associations, by calling out to an injected LLM.

mod llm;
mod worker;

pub use llm::{EvaluationResult, LlmClient, StaticLlmClient};
pub use worker::{EvaluatorHandle, EvaluatorItem};

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cache::CacheManager;
use crate::config::EvaluatorConfig;
use crate::graph::AssociationGraph;
use crate::storage::Storage;

use std::sync::RwLock;

/// Start the evaluator consumer. If called from within a Tokio runtime, the
/// consumer is spawned as a task on it; otherwise a dedicated single-thread
/// runtime is started on its own OS thread, so the Evaluator works whether
/// or not the host application is itself async.
pub fn start(
    config: EvaluatorConfig,
    llm: Arc<dyn LlmClient>,
    storage: Arc<Storage>,
    graph: Arc<RwLock<AssociationGraph>>,
    cache: Arc<CacheManager>,
) -> EvaluatorHandle {
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let consumer = worker::Consumer { config: config.clone(), llm, storage, graph, cache };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(consumer.run(rx));
        }
        Err(_) => {
            tracing::info!("no ambient tokio runtime found; starting a dedicated evaluator thread");
            std::thread::Builder::new()
                .name("mnemora-evaluator".into())
                .spawn(move || {
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed to build evaluator runtime");
                    rt.block_on(consumer.run(rx));
                })
                .expect("failed to spawn evaluator thread");
        }
    }

    EvaluatorHandle::new(tx)
}
