//! Storage: SQLite-backed durable record store with FTS5 keyword search and
//! a transactional dual-write path into the ANN index.

mod migrations;
mod sqlite;

pub use migrations::{Migration, MIGRATIONS, SCHEMA_VERSION};
pub use sqlite::{ConsistencyReport, RepairReport, Result, Storage, StorageError};
