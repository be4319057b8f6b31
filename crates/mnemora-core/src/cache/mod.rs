//! Cache Tier: three-level, non-authoritative cache over Memory records.
//!
//! Hot is an exact LRU (`lru`), Warm approximates LFU-with-aging via moka's
//! W-TinyLFU policy, Cold is a disk-backed overflow store (`sled`). Writes
//! always go through Storage first; the cache only ever mirrors what
//! Storage already holds and is safe to drop and rebuild at any time.
//!
//! A memory lives in at most one level at a time: `put`/promotion always
//! removes the memory from whichever other level it might have been in
//! before inserting it into the target level. Cold is never written to
//! directly; entries arrive there only via the warm cache's own
//! capacity-based eviction listener, so it behaves as warm's overflow
//! rather than a fourth, always-written copy.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use moka::notification::RemovalCause;

use crate::config::CacheConfig;
use crate::model::{CacheLevel, Memory, MemoryPatch};
use crate::search::KeywordIndex;
use crate::storage::{Storage, StorageError};

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cold store error: {0}")]
    Cold(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("cache lock poisoned: {0}")]
    Poisoned(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// The three cached domains named by the Cache Tier: resolved Memory
/// records, their embeddings, and a keyword -> ids index used to answer
/// `search_by_content` without a database round trip.
pub struct CacheManager {
    hot: Mutex<LruCache<String, Memory>>,
    warm: moka::sync::Cache<String, Memory>,
    cold: sled::Db,
    embedding_cache: Mutex<LruCache<String, Vec<f32>>>,
    keyword_index: Mutex<KeywordIndex>,
    access_counts: Mutex<HashMap<String, u64>>,
    config: CacheConfig,
    storage: Arc<Storage>,
}

impl CacheManager {
    pub fn open(config: &CacheConfig, cold_dir: &Path, storage: Arc<Storage>) -> Result<Self> {
        let cold = sled::open(cold_dir)?;
        let hot_cap = std::num::NonZeroUsize::new(config.c_hot.max(1)).unwrap();
        let embed_cap = std::num::NonZeroUsize::new(config.c_hot.max(1)).unwrap();

        // Demotion: a warm entry evicted purely for capacity reasons spills
        // into cold rather than disappearing, so it can still be served
        // (one level down) on the next lookup. Explicit invalidation and
        // replacement never write back to cold.
        let cold_for_eviction = cold.clone();
        let warm = moka::sync::Cache::builder()
            .max_capacity(config.c_warm as u64)
            .eviction_listener(move |key: Arc<String>, value: Memory, cause| {
                if matches!(cause, RemovalCause::Size | RemovalCause::Expired) {
                    if let Ok(bytes) = serde_json::to_vec(&value) {
                        let _ = cold_for_eviction.insert(key.as_bytes(), bytes);
                    }
                }
            })
            .build();

        Ok(Self {
            hot: Mutex::new(LruCache::new(hot_cap)),
            warm,
            cold,
            embedding_cache: Mutex::new(LruCache::new(embed_cap)),
            keyword_index: Mutex::new(KeywordIndex::new()),
            access_counts: Mutex::new(HashMap::new()),
            config: config.clone(),
            storage,
        })
    }

    /// Look up a memory by id, checking hot, then warm, then cold, and
    /// promoting on repeated access per `promotion_threshold` (or
    /// immediately, if the memory's own weight already clears
    /// `importance_threshold`).
    pub fn get(&self, id: &str) -> Option<Memory> {
        if let Some(m) = self.hot_lock().get(id).cloned() {
            return Some(m);
        }

        if let Some(m) = self.warm.get(id) {
            if self.note_access_and_should_promote(id, &m) {
                self.promote_to_hot(id, &m);
            }
            return Some(m);
        }

        if let Ok(Some(bytes)) = self.cold.get(id.as_bytes()) {
            if let Ok(m) = serde_json::from_slice::<Memory>(&bytes) {
                self.cold.remove(id.as_bytes()).ok();
                if self.note_access_and_should_promote(id, &m) {
                    self.hot_lock().put(id.to_string(), m.clone());
                } else {
                    self.warm.insert(id.to_string(), m.clone());
                }
                return Some(m);
            }
        }

        None
    }

    /// A poisoned mutex still holds a perfectly usable cache; recover it
    /// rather than let one panicking holder take the whole cache down.
    fn hot_lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, Memory>> {
        self.hot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn embedding_lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, Vec<f32>>> {
        self.embedding_cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn keyword_lock(&self) -> std::sync::MutexGuard<'_, KeywordIndex> {
        self.keyword_index.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn access_counts_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.access_counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bump the access counter for `id` and report whether it now qualifies
    /// for promotion to hot: either its recent access count or its current
    /// weight has crossed the configured threshold.
    fn note_access_and_should_promote(&self, id: &str, memory: &Memory) -> bool {
        let mut counts = self.access_counts_lock();
        let count = counts.entry(id.to_string()).or_insert(0);
        *count += 1;
        *count >= self.config.promotion_threshold || memory.weight >= self.config.importance_threshold
    }

    fn promote_to_hot(&self, id: &str, memory: &Memory) {
        self.warm.invalidate(id);
        self.cold.remove(id.as_bytes()).ok();
        self.hot_lock().put(id.to_string(), memory.clone());
    }

    /// Insert or refresh a memory in the cache. High-weight memories land
    /// directly in hot; everything else enters warm. Either way, the
    /// memory is removed from the other levels first so it is never
    /// present in more than one at a time.
    pub fn put(&self, memory: &Memory) -> Result<()> {
        self.cold.remove(memory.id.as_bytes())?;
        if memory.weight >= self.config.importance_threshold {
            self.warm.invalidate(&memory.id);
            self.hot_lock().put(memory.id.clone(), memory.clone());
        } else {
            self.hot_lock().pop(&memory.id);
            self.warm.insert(memory.id.clone(), memory.clone());
        }
        self.keyword_lock().insert(&memory.id, &memory.content);
        Ok(())
    }

    /// Record that `memory_id` was just used (e.g. selected into an
    /// assembled context): nudge its weight by `weight_delta`, refresh its
    /// `last_accessed` timestamp in Storage, and drop this cache's own
    /// copy so the next `get` reflects the update. The cache itself never
    /// computes weight from scratch; it only applies the delta on top of
    /// whatever Storage currently has.
    pub fn record_memory_access(&self, memory_id: &str, weight_delta: f64) -> Result<()> {
        let current_weight = self
            .get(memory_id)
            .map(|m| m.weight)
            .or_else(|| self.storage.get(memory_id).ok().flatten().map(|m| m.weight));

        let patch = MemoryPatch {
            last_accessed: Some(chrono::Utc::now()),
            weight: current_weight.map(|w| crate::model::clamp_weight(w + weight_delta)),
            ..Default::default()
        };
        self.storage.update_memory(memory_id, &patch)?;
        self.invalidate(memory_id)?;
        Ok(())
    }

    /// Drop a memory from every cache level. Called on update/delete so the
    /// cache never serves stale data Storage no longer has.
    pub fn invalidate(&self, id: &str) -> Result<()> {
        self.hot_lock().pop(id);
        self.warm.invalidate(id);
        self.cold.remove(id.as_bytes())?;
        self.embedding_lock().pop(id);
        self.keyword_lock().remove(id);
        self.access_counts_lock().remove(id);
        Ok(())
    }

    pub fn cache_embedding(&self, text_key: &str, vector: Vec<f32>) {
        self.embedding_lock().put(text_key.to_string(), vector);
    }

    pub fn get_cached_embedding(&self, text_key: &str) -> Option<Vec<f32>> {
        self.embedding_lock().get(text_key).cloned()
    }

    /// Keyword-domain search used by the Retrieval Pipeline's fallback path
    /// when the ANN index is unavailable.
    pub fn search_by_content(&self, tokens: &[String], limit: usize) -> Vec<String> {
        self.keyword_lock().search(tokens, limit)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hot_len: self.hot_lock().len(),
            warm_len: self.warm.entry_count() as usize,
            cold_len: self.cold.len(),
        }
    }

    /// Clear every level. Safe at any time: the cache holds no data Storage
    /// doesn't also have.
    pub fn clear(&self) -> Result<()> {
        self.hot_lock().clear();
        self.warm.invalidate_all();
        self.cold.clear()?;
        self.embedding_lock().clear();
        *self.keyword_lock() = KeywordIndex::new();
        self.access_counts_lock().clear();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hot_len: usize,
    pub warm_len: usize,
    pub cold_len: usize,
}

/// Which level currently holds `id`, if any. Used by diagnostics and tests;
/// not on the hot path.
pub fn level_of(manager: &CacheManager, id: &str) -> Option<CacheLevel> {
    if manager.hot_lock().contains(id) {
        return Some(CacheLevel::Hot);
    }
    if manager.warm.contains_key(id) {
        return Some(CacheLevel::Warm);
    }
    if matches!(manager.cold.contains_key(id.as_bytes()), Ok(true)) {
        return Some(CacheLevel::Cold);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::model::{MemoryKind, Role};

    fn manager() -> (CacheManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::default();
        let mut storage_config = StorageConfig::default();
        storage_config.data_dir = dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&storage_config).unwrap());
        let manager = CacheManager::open(&config, dir.path(), storage).unwrap();
        (manager, dir)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (mgr, _dir) = manager();
        let m = Memory::new("hello".into(), MemoryKind::UserInput, Role::User, None);
        mgr.put(&m).unwrap();
        let fetched = mgr.get(&m.id).unwrap();
        assert_eq!(fetched.content, "hello");
    }

    #[test]
    fn high_weight_memory_lands_in_hot() {
        let (mgr, _dir) = manager();
        let mut m = Memory::new("important".into(), MemoryKind::UserInput, Role::User, None);
        m.weight = 9.5;
        mgr.put(&m).unwrap();
        assert_eq!(level_of(&mgr, &m.id), Some(CacheLevel::Hot));
    }

    #[test]
    fn invalidate_removes_from_every_level() {
        let (mgr, _dir) = manager();
        let m = Memory::new("to remove".into(), MemoryKind::UserInput, Role::User, None);
        mgr.put(&m).unwrap();
        mgr.invalidate(&m.id).unwrap();
        assert!(mgr.get(&m.id).is_none());
    }

    #[test]
    fn repeated_warm_access_promotes_to_hot() {
        let (mgr, _dir) = manager();
        let m = Memory::new("promote me".into(), MemoryKind::UserInput, Role::User, None);
        mgr.warm.insert(m.id.clone(), m.clone());
        for _ in 0..CacheConfig::default().promotion_threshold {
            mgr.get(&m.id);
        }
        assert_eq!(level_of(&mgr, &m.id), Some(CacheLevel::Hot));
    }

    #[test]
    fn search_by_content_finds_indexed_memory() {
        let (mgr, _dir) = manager();
        let m = Memory::new("job interview tomorrow".into(), MemoryKind::UserInput, Role::User, None);
        mgr.put(&m).unwrap();
        let hits = mgr.search_by_content(&["interview".to_string()], 5);
        assert_eq!(hits, vec![m.id]);
    }

    #[test]
    fn put_never_leaves_memory_in_two_levels() {
        let (mgr, _dir) = manager();
        let mut m = Memory::new("dual write check".into(), MemoryKind::UserInput, Role::User, None);
        m.weight = 9.5;
        mgr.put(&m).unwrap();
        assert_eq!(level_of(&mgr, &m.id), Some(CacheLevel::Hot));
        assert!(!matches!(mgr.cold.contains_key(m.id.as_bytes()), Ok(true)));
        assert!(!mgr.warm.contains_key(&m.id));
    }

    #[test]
    fn record_memory_access_bumps_weight_and_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage_config = StorageConfig::default();
        storage_config.data_dir = dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&storage_config).unwrap());
        let memory = Memory::new("remembered fact".into(), MemoryKind::UserInput, Role::User, None);
        let id = storage.insert_memory(memory).unwrap();

        let config = CacheConfig::default();
        let manager = CacheManager::open(&config, dir.path(), Arc::clone(&storage)).unwrap();
        manager.put(&storage.get(&id).unwrap().unwrap()).unwrap();

        let before = storage.get(&id).unwrap().unwrap().weight;
        manager.record_memory_access(&id, 0.5).unwrap();
        let after = storage.get(&id).unwrap().unwrap().weight;
        assert!(after > before);
        assert!(level_of(&manager, &id).is_none(), "recording access should invalidate the stale cached copy");
    }
}
