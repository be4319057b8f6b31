//! Monitor: lightweight in-process counters and per-step latencies, the
//! engine's only observability surface beyond `tracing` log lines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Monitor {
    counters: Mutex<HashMap<&'static str, u64>>,
    durations: Mutex<HashMap<&'static str, Duration>>,
    queries_total: AtomicU64,
    stores_total: AtomicU64,
    evaluator_drops_total: AtomicU64,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &'static str) {
        *self.counters.lock().unwrap_or_else(|e| e.into_inner()).entry(name).or_insert(0) += 1;
    }

    pub fn record_duration(&self, name: &'static str, elapsed: Duration) {
        self.durations.lock().unwrap_or_else(|e| e.into_inner()).insert(name, elapsed);
    }

    /// Run `f`, recording its wall-clock duration under `name`.
    pub fn timed<T>(&self, name: &'static str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.record_duration(name, start.elapsed());
        result
    }

    pub fn record_query(&self) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store(&self) {
        self.stores_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evaluator_drop(&self) {
        self.evaluator_drops_total.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("evaluator queue dropped an item");
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            queries_total: self.queries_total.load(Ordering::Relaxed),
            stores_total: self.stores_total.load(Ordering::Relaxed),
            evaluator_drops_total: self.evaluator_drops_total.load(Ordering::Relaxed),
            counters: self.counters.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            step_durations_ms: self
                .durations
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|(k, v)| (*k, v.as_secs_f64() * 1000.0))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MonitorSnapshot {
    pub queries_total: u64,
    pub stores_total: u64,
    pub evaluator_drops_total: u64,
    pub counters: HashMap<&'static str, u64>,
    pub step_durations_ms: HashMap<&'static str, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Monitor::new();
        m.incr("retrieval.ann_hit");
        m.incr("retrieval.ann_hit");
        assert_eq!(m.snapshot().counters["retrieval.ann_hit"], 2);
    }

    #[test]
    fn timed_records_a_duration() {
        let m = Monitor::new();
        m.timed("step", || std::thread::sleep(Duration::from_millis(1)));
        assert!(m.snapshot().step_durations_ms["step"] > 0.0);
    }
}
