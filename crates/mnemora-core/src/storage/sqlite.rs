//! SQLite-backed Storage: the durable record store with transactional
//! dual-write into the ANN index.

use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::embeddings::EmbeddingProvider;
use crate::model::{
    Association, AssociationKind, Group, Memory, MemoryKind, MemoryPatch, Role,
};
use crate::search::{sanitize_fts5_query, VectorIndex, VectorIndexConfig};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("initialization error: {0}")]
    Init(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("ann failure: {0}")]
    Ann(#[from] crate::search::VectorSearchError),
    #[error("lock poisoned: {0}")]
    Poisoned(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

// ============================================================================
// CONSISTENCY REPORTS
// ============================================================================

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConsistencyReport {
    pub db_count: usize,
    pub vector_count: usize,
    pub ann_count: usize,
    pub orphans_db_only: usize,
    pub orphans_ann_only: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RepairReport {
    pub removed_from_ann: usize,
    pub added_to_ann: usize,
}

// ============================================================================
// STORAGE
// ============================================================================

/// Durable record store for memories, vectors, associations, groups, and
/// sessions, with transactional dual-write to the ANN index.
///
/// Uses separate reader/writer connections for interior mutability so every
/// method takes `&self`, making `Storage` `Send + Sync`.
pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    ann: RwLock<VectorIndex>,
    embeddings: EmbeddingProvider,
    ann_file: PathBuf,
}

impl Storage {
    fn configure_connection(conn: &Connection) -> Result<()> {
        #[cfg(feature = "encryption")]
        {
            if let Ok(key) = std::env::var("MNEMORA_ENCRYPTION_KEY") {
                if !key.is_empty() {
                    conn.pragma_update(None, "key", &key)?;
                }
            }
        }

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA mmap_size = 268435456;",
        )?;

        Ok(())
    }

    /// Open (creating if absent) the database and ANN index described by
    /// `config`, applying pending migrations and loading existing
    /// embeddings into the index.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            let _ = std::fs::set_permissions(&config.data_dir, perms);
        }

        let db_path = config.data_dir.join(&config.db_file);
        let ann_path = config.data_dir.join(&config.ann_file);

        let writer_conn = Connection::open(&db_path)?;
        #[cfg(unix)]
        if db_path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&db_path, perms);
        }
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&db_path)?;
        Self::configure_connection(&reader_conn)?;

        let embeddings = EmbeddingProvider::new();
        let index_config = VectorIndexConfig {
            dimensions: embeddings.dimensions(),
            ..VectorIndexConfig::default()
        };

        let ann = if ann_path.exists() {
            match VectorIndex::load(&ann_path, index_config.clone()) {
                Ok(index) => index,
                Err(e) => {
                    tracing::warn!("failed to load ANN index from disk ({e}); starting empty");
                    VectorIndex::with_config(index_config)
                        .map_err(StorageError::Ann)?
                }
            }
        } else {
            VectorIndex::with_config(index_config).map_err(StorageError::Ann)?
        };

        let storage = Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            ann: RwLock::new(ann),
            embeddings,
            ann_file: ann_path,
        };

        storage.reconcile_ann_from_store()?;

        Ok(storage)
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer.lock().map_err(|_| StorageError::Poisoned("writer".into()))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader.lock().map_err(|_| StorageError::Poisoned("reader".into()))
    }

    fn ann_read(&self) -> Result<std::sync::RwLockReadGuard<'_, VectorIndex>> {
        self.ann.read().map_err(|_| StorageError::Poisoned("ann".into()))
    }

    fn ann_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, VectorIndex>> {
        self.ann.write().map_err(|_| StorageError::Poisoned("ann".into()))
    }

    pub fn active_model_name(&self) -> &str {
        self.embeddings.model_name()
    }

    pub fn active_dimensions(&self) -> usize {
        self.embeddings.dimensions()
    }

    /// Embed arbitrary text (e.g. an incoming query) using the active
    /// backend, without storing anything.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embeddings.encode(text).map_err(|e| StorageError::InvariantViolation(e.to_string()))
    }

    /// Flush the ANN index to disk. Called on clean shutdown.
    pub fn flush_ann(&self) -> Result<()> {
        let ann = self.ann_read()?;
        ann.save(&self.ann_file).map_err(StorageError::Ann)
    }

    /// Load every stored vector into the ANN index on top of whatever was
    /// loaded from disk, so a stale or missing sidecar file never leaves the
    /// index out of sync with the database.
    fn reconcile_ann_from_store(&self) -> Result<()> {
        let report = self.check_consistency()?;
        if report.orphans_db_only > 0 || report.orphans_ann_only > 0 {
            let repair = self.repair_consistency()?;
            tracing::warn!(
                "startup consistency repair: added {} to ANN, removed {} stale entries",
                repair.added_to_ann,
                repair.removed_from_ann
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dual-write
    // ------------------------------------------------------------------

    /// Stores both sides of a dialogue turn atomically: the embedding for
    /// each side is computed outside the transaction, then both Memory rows
    /// and both Vector rows are inserted under one DB transaction gated on
    /// the ANN add succeeding for both ids. On ANN failure the transaction
    /// is rolled back and any partial ANN state for these ids is undone.
    pub fn insert_turn(
        &self,
        user_text: &str,
        assistant_text: &str,
        session_id: Option<&str>,
    ) -> Result<(String, String)> {
        if user_text.is_empty() || assistant_text.is_empty() {
            return Err(StorageError::InvariantViolation(
                "memory content must be non-empty".into(),
            ));
        }

        let user_vec = self
            .embeddings
            .encode(user_text)
            .map_err(|e| StorageError::InvariantViolation(e.to_string()))?;
        let assistant_vec = self
            .embeddings
            .encode(assistant_text)
            .map_err(|e| StorageError::InvariantViolation(e.to_string()))?;

        let user_memory = Memory::new(
            user_text.to_string(),
            MemoryKind::UserInput,
            Role::User,
            session_id.map(str::to_string),
        );
        let assistant_memory = Memory::new(
            assistant_text.to_string(),
            MemoryKind::AssistantReply,
            Role::Assistant,
            session_id.map(str::to_string),
        );

        {
            let mut writer = self.writer()?;
            let tx = writer.transaction()?;
            insert_memory_row(&tx, &user_memory)?;
            insert_vector_row(&tx, &user_memory.id, &user_vec, self.embeddings.model_name())?;
            insert_memory_row(&tx, &assistant_memory)?;
            insert_vector_row(&tx, &assistant_memory.id, &assistant_vec, self.embeddings.model_name())?;

            // Attempt the ANN add while still inside the critical section;
            // the DB commit is gated on both adds succeeding.
            let ann_result = {
                let mut ann = self.ann_write()?;
                let r1 = ann.add(&user_memory.id, &user_vec);
                let r2 = if r1.is_ok() {
                    ann.add(&assistant_memory.id, &assistant_vec)
                } else {
                    r1.clone()
                };
                if r1.is_err() || r2.is_err() {
                    // Undo whichever side succeeded before rolling back.
                    let _ = ann.remove(&user_memory.id);
                    let _ = ann.remove(&assistant_memory.id);
                }
                r1.and(r2)
            };

            match ann_result {
                Ok(()) => {
                    tx.commit()?;
                }
                Err(e) => {
                    return Err(StorageError::Ann(e));
                }
            }
        }

        Ok((user_memory.id, assistant_memory.id))
    }

    /// Store a single standalone memory (e.g. a Summary produced by the
    /// Evaluator) with the same atomic DB-then-ANN discipline as
    /// `insert_turn`, minus the pairing.
    pub fn insert_memory(&self, memory: Memory) -> Result<String> {
        if memory.content.is_empty() {
            return Err(StorageError::InvariantViolation("memory content must be non-empty".into()));
        }
        let vector = self
            .embeddings
            .encode(&memory.content)
            .map_err(|e| StorageError::InvariantViolation(e.to_string()))?;

        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        insert_memory_row(&tx, &memory)?;
        insert_vector_row(&tx, &memory.id, &vector, self.embeddings.model_name())?;

        let ann_result = {
            let mut ann = self.ann_write()?;
            let r = ann.add(&memory.id, &vector);
            if r.is_err() {
                let _ = ann.remove(&memory.id);
            }
            r
        };

        match ann_result {
            Ok(()) => {
                tx.commit()?;
                Ok(memory.id)
            }
            Err(e) => Err(StorageError::Ann(e)),
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get(&self, memory_id: &str) -> Result<Option<Memory>> {
        let reader = self.reader()?;
        reader
            .query_row(MEMORY_SELECT, params![memory_id], map_memory_row)
            .optional()
            .map_err(StorageError::from)
    }

    /// Fetch memories for `ids`, preserving input order; missing ids are
    /// dropped rather than erroring.
    pub fn get_many(&self, ids: &[String]) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(m) = reader.query_row(MEMORY_SELECT, params![id], map_memory_row).optional()? {
                out.push(m);
            }
        }
        Ok(out)
    }

    /// All unarchived memories, for periodic maintenance ticks. Not paged:
    /// intended for background sweeps, not request-path use.
    pub fn list_unarchived(&self) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, content, kind, role, session_id, created_at, weight, \
             group_id, summary, last_accessed, archived, metadata FROM memories WHERE archived = 0",
        )?;
        let rows = stmt.query_map([], map_memory_row)?.filter_map(|r| r.ok()).collect();
        Ok(rows)
    }

    /// The stored embedding for a memory, if any. Lets callers reuse an
    /// already-computed vector (e.g. for similarity-based association
    /// creation) instead of re-embedding the content.
    pub fn vector_for(&self, memory_id: &str) -> Result<Option<Vec<f32>>> {
        let reader = self.reader()?;
        reader
            .query_row(
                "SELECT vector FROM vectors WHERE memory_id = ?1",
                params![memory_id],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map(|opt| opt.map(|bytes| bytes_to_vector(&bytes)))
            .map_err(StorageError::from)
    }

    /// Ids of unarchived memories in the same session, most recent first.
    pub fn recent_in_session(&self, session_id: &str, exclude: &[String], limit: usize) -> Result<Vec<String>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id FROM memories WHERE session_id = ?1 AND archived = 0 \
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![session_id, (limit + exclude.len()) as i64], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .filter(|id: &String| !exclude.contains(id))
            .take(limit)
            .collect();
        Ok(ids)
    }

    /// Ids of unarchived memories sharing `group_id`, excluding `exclude`.
    pub fn members_of_group(&self, group_id: &str, exclude: &[String], limit: usize) -> Result<Vec<String>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id FROM memories WHERE group_id = ?1 AND archived = 0 LIMIT ?2",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![group_id, (limit + exclude.len()) as i64], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .filter(|id: &String| !exclude.contains(id))
            .take(limit)
            .collect();
        Ok(ids)
    }

    pub fn search_fts(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let sanitized = sanitize_fts5_query(query);
        if sanitized.is_empty() {
            return Ok(vec![]);
        }
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT m.id FROM memories_fts f
             JOIN memories m ON m.id = f.id
             WHERE memories_fts MATCH ?1 AND m.archived = 0
             ORDER BY rank LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![sanitized, limit as i64], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // ANN search (delegates to the index; tie-break by weight desc, then
    // created_at asc, is applied here since only Storage can resolve ids
    // to Memory rows).
    // ------------------------------------------------------------------

    pub fn ann_search(&self, query_vector: &[f32], k: usize, min_score: f32) -> Result<Vec<(String, f32)>> {
        let ann = self.ann_read()?;
        let mut hits = ann
            .search_with_threshold(query_vector, k, min_score)
            .map_err(StorageError::Ann)?;

        if hits.len() > 1 {
            let ids: Vec<String> = hits.iter().map(|(id, _)| id.clone()).collect();
            let memories = self.get_many(&ids)?;
            let by_id: std::collections::HashMap<&str, &Memory> =
                memories.iter().map(|m| (m.id.as_str(), m)).collect();
            hits.sort_by(|(id_a, score_a), (id_b, score_b)| {
                score_b
                    .partial_cmp(score_a)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        let wa = by_id.get(id_a.as_str()).map(|m| m.weight).unwrap_or(0.0);
                        let wb = by_id.get(id_b.as_str()).map(|m| m.weight).unwrap_or(0.0);
                        wb.partial_cmp(&wa).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| {
                        let ca = by_id.get(id_a.as_str()).map(|m| m.created_at);
                        let cb = by_id.get(id_b.as_str()).map(|m| m.created_at);
                        ca.cmp(&cb)
                    })
            });
        }

        Ok(hits)
    }

    pub fn ann_len(&self) -> Result<usize> {
        Ok(self.ann_read()?.len())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub fn update_memory(&self, id: &str, patch: &MemoryPatch) -> Result<()> {
        let writer = self.writer()?;
        let existing = writer
            .query_row(MEMORY_SELECT, params![id], map_memory_row)
            .optional()?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        let weight = patch.weight.map(crate::model::clamp_weight).unwrap_or(existing.weight);
        if let Some(w) = patch.weight {
            if !(0.1..=10.0).contains(&w) {
                return Err(StorageError::InvariantViolation(format!(
                    "weight {w} out of range [0.1, 10.0]"
                )));
            }
        }
        let group_id = patch.group_id.clone().unwrap_or(existing.group_id.clone());
        let summary = patch.summary.clone().unwrap_or(existing.summary.clone());
        let metadata = patch.metadata.clone().unwrap_or(existing.metadata.clone());
        let archived = patch.archived.unwrap_or(existing.archived);
        let last_accessed = patch.last_accessed.unwrap_or(existing.last_accessed);

        writer.execute(
            "UPDATE memories SET weight=?1, group_id=?2, summary=?3, metadata=?4, archived=?5, last_accessed=?6 WHERE id=?7",
            params![
                weight,
                group_id,
                summary,
                metadata.to_string(),
                archived as i64,
                last_accessed.to_rfc3339(),
                id,
            ],
        )?;

        if archived && !existing.archived {
            let mut ann = self.ann_write()?;
            let _ = ann.remove(id);
        }

        Ok(())
    }

    /// Re-insert an archived memory's vector into the ANN index and raise
    /// its weight by a small restoration multiplier.
    pub fn restore(&self, id: &str) -> Result<()> {
        let memory = self.get(id)?.ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        let reader = self.reader()?;
        let (vector, _dims): (Vec<u8>, i64) = reader
            .query_row(
                "SELECT vector, dimensions FROM vectors WHERE memory_id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|_| StorageError::NotFound(format!("vector for {id}")))?;
        drop(reader);

        let vector = bytes_to_vector(&vector);
        {
            let mut ann = self.ann_write()?;
            ann.add(id, &vector).map_err(StorageError::Ann)?;
        }

        let new_weight = crate::model::clamp_weight(memory.weight * 1.2);
        self.update_memory(
            id,
            &MemoryPatch {
                weight: Some(new_weight),
                archived: Some(false),
                ..Default::default()
            },
        )
    }

    /// Removes Memory, Vector, cache-relevant rows, and the ANN index entry
    /// in one transaction.
    pub fn delete(&self, memory_id: &str) -> Result<()> {
        {
            let mut ann = self.ann_write()?;
            let _ = ann.remove(memory_id);
        }
        let writer = self.writer()?;
        writer.execute("DELETE FROM memories WHERE id = ?1", params![memory_id])?;
        Ok(())
    }

    pub fn upsert_group(&self, group: &Group) -> Result<()> {
        if group.time_start > group.time_end {
            return Err(StorageError::InvariantViolation("time_start must be <= time_end".into()));
        }
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO groups (group_id, super_group, topic, time_start, time_end, summary, score)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(group_id) DO UPDATE SET
                super_group=excluded.super_group, topic=excluded.topic,
                time_start=excluded.time_start, time_end=excluded.time_end,
                summary=excluded.summary, score=excluded.score",
            params![
                group.group_id,
                group.super_group,
                group.topic,
                group.time_start.to_rfc3339(),
                group.time_end.to_rfc3339(),
                group.summary,
                group.score,
            ],
        )?;
        Ok(())
    }

    /// Upsert a symmetric association: writes both `(a,b)` and `(b,a)` rows
    /// so the symmetry invariant holds regardless of lookup direction.
    pub fn upsert_association(&self, a: &str, b: &str, kind: AssociationKind, strength: f32) -> Result<()> {
        if a == b {
            return Err(StorageError::InvariantViolation("association endpoints must differ".into()));
        }
        if !(0.0..=1.0).contains(&strength) {
            return Err(StorageError::InvariantViolation(format!("strength {strength} out of [0,1]")));
        }
        let now = Utc::now().to_rfc3339();
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        for (src, dst) in [(a, b), (b, a)] {
            tx.execute(
                "INSERT INTO associations (source_id, target_id, kind, strength, created_at, last_activated_at)
                 VALUES (?1,?2,?3,?4,?5,?5)
                 ON CONFLICT(source_id, target_id, kind) DO UPDATE SET
                    strength=excluded.strength, last_activated_at=excluded.last_activated_at",
                params![src, dst, kind.as_str(), strength, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn neighbors_of(&self, memory_id: &str, min_strength: f32) -> Result<Vec<Association>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT source_id, target_id, kind, strength, created_at, last_activated_at
             FROM associations WHERE source_id = ?1 AND strength >= ?2",
        )?;
        let rows = stmt
            .query_map(params![memory_id, min_strength], map_association_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Every stored association, one row per direction. Used to rebuild the
    /// in-memory `AssociationGraph` at startup.
    pub fn all_associations(&self) -> Result<Vec<Association>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT source_id, target_id, kind, strength, created_at, last_activated_at FROM associations",
        )?;
        let rows = stmt.query_map([], map_association_row)?.filter_map(|r| r.ok()).collect();
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Consistency
    // ------------------------------------------------------------------

    pub fn check_consistency(&self) -> Result<ConsistencyReport> {
        let reader = self.reader()?;
        let db_count: i64 = reader.query_row(
            "SELECT COUNT(*) FROM memories WHERE archived = 0",
            [],
            |r| r.get(0),
        )?;
        let vector_count: i64 = reader.query_row("SELECT COUNT(*) FROM vectors", [], |r| r.get(0))?;
        let ann = self.ann_read()?;
        let ann_count = ann.len();

        let mut stmt = reader.prepare(
            "SELECT m.id FROM memories m JOIN vectors v ON v.memory_id = m.id WHERE m.archived = 0",
        )?;
        let expected_ids: Vec<String> =
            stmt.query_map([], |r| r.get::<_, String>(0))?.filter_map(|r| r.ok()).collect();

        let orphans_db_only = expected_ids.iter().filter(|id| !ann.contains(id)).count();
        // We cannot enumerate ANN keys directly; approximate ann-only orphans
        // as any excess beyond what the store expects.
        let orphans_ann_only = ann_count.saturating_sub(expected_ids.len() - orphans_db_only);

        Ok(ConsistencyReport {
            db_count: db_count as usize,
            vector_count: vector_count as usize,
            ann_count,
            orphans_db_only,
            orphans_ann_only,
        })
    }

    /// Bidirectional sweep: adds any memory with a stored vector but no ANN
    /// entry, and rebuilds the index from the store when it holds entries
    /// the store no longer expects (e.g. after an aborted dual-write).
    pub fn repair_consistency(&self) -> Result<RepairReport> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT m.id, v.vector, v.dimensions FROM memories m
             JOIN vectors v ON v.memory_id = m.id WHERE m.archived = 0",
        )?;
        let rows: Vec<(String, Vec<u8>, i64)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(reader);

        let mut added = 0usize;
        let mut removed = 0usize;
        {
            let mut ann = self.ann_write()?;
            let active_dims = self.embeddings.dimensions();
            let needs_rebuild = rows.iter().any(|(_, _, d)| *d as usize != active_dims);

            if needs_rebuild || ann.len() != rows.len() {
                let before = ann.len();
                let entries = rows.iter().filter_map(|(id, bytes, d)| {
                    if *d as usize == active_dims {
                        Some((id.clone(), bytes_to_vector(bytes)))
                    } else {
                        None
                    }
                });
                ann.rebuild_from(entries).map_err(StorageError::Ann)?;
                added = ann.len();
                removed = before.saturating_sub(ann.len().min(before));
            }
        }

        Ok(RepairReport { removed_from_ann: removed, added_to_ann: added })
    }
}

// ============================================================================
// ROW MAPPING HELPERS
// ============================================================================

const MEMORY_SELECT: &str = "SELECT id, content, kind, role, session_id, created_at, weight, \
    group_id, summary, last_accessed, archived, metadata FROM memories WHERE id = ?1";

fn map_memory_row(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
    let kind_str: String = row.get(2)?;
    let role_str: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    let last_accessed: String = row.get(9)?;
    let metadata_str: String = row.get(11)?;

    Ok(Memory {
        id: row.get(0)?,
        content: row.get(1)?,
        kind: MemoryKind::parse(&kind_str).unwrap_or(MemoryKind::System),
        role: Role::parse(&role_str).unwrap_or(Role::System),
        session_id: row.get(4)?,
        created_at: parse_rfc3339(&created_at),
        weight: row.get(6)?,
        group_id: row.get(7)?,
        summary: row.get(8)?,
        last_accessed: parse_rfc3339(&last_accessed),
        archived: row.get::<_, i64>(10)? != 0,
        metadata: serde_json::from_str(&metadata_str).unwrap_or_else(|_| serde_json::json!({})),
    })
}

fn map_association_row(row: &rusqlite::Row) -> rusqlite::Result<Association> {
    let kind_str: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    let last_activated_at: String = row.get(5)?;
    Ok(Association {
        source_id: row.get(0)?,
        target_id: row.get(1)?,
        kind: AssociationKind::parse(&kind_str).unwrap_or(AssociationKind::IsRelatedTo),
        strength: row.get(3)?,
        created_at: parse_rfc3339(&created_at),
        last_activated_at: parse_rfc3339(&last_activated_at),
    })
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn vector_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn insert_memory_row(tx: &rusqlite::Transaction, m: &Memory) -> Result<()> {
    tx.execute(
        "INSERT INTO memories (id, content, kind, role, session_id, created_at, weight, group_id, summary, last_accessed, archived, metadata)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
        params![
            m.id,
            m.content,
            m.kind.as_str(),
            m.role.as_str(),
            m.session_id,
            m.created_at.to_rfc3339(),
            m.weight,
            m.group_id,
            m.summary,
            m.last_accessed.to_rfc3339(),
            m.archived as i64,
            m.metadata.to_string(),
        ],
    )?;
    Ok(())
}

fn insert_vector_row(
    tx: &rusqlite::Transaction,
    memory_id: &str,
    vector: &[f32],
    model_name: &str,
) -> Result<()> {
    tx.execute(
        "INSERT INTO vectors (id, memory_id, vector, dimensions, model_name, created_at)
         VALUES (?1,?2,?3,?4,?5,?6)",
        params![
            Uuid::new_v4().to_string(),
            memory_id,
            vector_to_bytes(vector),
            vector.len() as i64,
            model_name,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StorageConfig::default();
        config.data_dir = dir.path().to_path_buf();
        let storage = Storage::open(&config).unwrap();
        (storage, dir)
    }

    #[test]
    fn insert_then_get_round_trips() {
        let (storage, _dir) = test_storage();
        let (user_id, assistant_id) = storage.insert_turn("hello there", "hi!", Some("s1")).unwrap();

        let user = storage.get(&user_id).unwrap().unwrap();
        assert_eq!(user.content, "hello there");
        assert_eq!(user.kind, MemoryKind::UserInput);

        let assistant = storage.get(&assistant_id).unwrap().unwrap();
        assert_eq!(assistant.kind, MemoryKind::AssistantReply);
    }

    #[test]
    fn delete_removes_memory_and_ann_entry() {
        let (storage, _dir) = test_storage();
        let (user_id, _) = storage.insert_turn("about to delete", "ok", None).unwrap();
        storage.delete(&user_id).unwrap();
        assert!(storage.get(&user_id).unwrap().is_none());

        let report = storage.check_consistency().unwrap();
        assert_eq!(report.orphans_db_only, 0);
    }

    #[test]
    fn get_many_preserves_order_and_drops_missing() {
        let (storage, _dir) = test_storage();
        let (user_id, assistant_id) = storage.insert_turn("a", "b", None).unwrap();
        let ids = vec![assistant_id.clone(), "missing".to_string(), user_id.clone()];
        let found = storage.get_many(&ids).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, assistant_id);
        assert_eq!(found[1].id, user_id);
    }

    #[test]
    fn weight_out_of_range_rejected() {
        let (storage, _dir) = test_storage();
        let (user_id, _) = storage.insert_turn("a", "b", None).unwrap();
        let patch = MemoryPatch { weight: Some(99.0), ..Default::default() };
        assert!(storage.update_memory(&user_id, &patch).is_err());
    }

    #[test]
    fn association_is_stored_symmetrically() {
        let (storage, _dir) = test_storage();
        let (a, b) = storage.insert_turn("a", "b", None).unwrap();
        storage.upsert_association(&a, &b, AssociationKind::IsRelatedTo, 0.9).unwrap();

        let forward = storage.neighbors_of(&a, 0.0).unwrap();
        let backward = storage.neighbors_of(&b, 0.0).unwrap();
        assert_eq!(forward.len(), 1);
        assert_eq!(backward.len(), 1);
        assert_eq!(forward[0].strength, backward[0].strength);
    }

    #[test]
    fn ann_search_finds_near_duplicate_content() {
        let (storage, _dir) = test_storage();
        let (user_id, _) = storage.insert_turn("I am stressed about work today", "reply", None).unwrap();
        let query_vec = storage.embeddings.encode("stressed about work today").unwrap();
        let hits = storage.ann_search(&query_vec, 5, 0.0).unwrap();
        assert!(hits.iter().any(|(id, _)| id == &user_id));
    }
}
