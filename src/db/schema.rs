//! SQL DDL for all Cairn tables.
//!
//! Defines `files` (per-file index bookkeeping), `chunks` (hashed chunk records),
//! `chunks_fts` (FTS5), `chunks_vec` (vec0), the `chunk_log` and `heartbeat_log`
//! audit tables, and `schema_meta`. All DDL uses `IF NOT EXISTS`.

use rusqlite::Connection;

/// All schema DDL statements for Cairn's core tables.
const SCHEMA_SQL: &str = r#"
-- One row per indexed workspace file
CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    indexed_mtime INTEGER NOT NULL,
    indexed_at TEXT NOT NULL
);

-- Hashed chunk records. Rows are never updated in place except for
-- access tracking and invalidation.
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    source_file TEXT NOT NULL,
    byte_start INTEGER NOT NULL,
    byte_end INTEGER NOT NULL CHECK(byte_end >= byte_start),
    text TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    category TEXT,
    source TEXT NOT NULL DEFAULT 'file'
        CHECK(source IN ('user_stated','file','web_search','heartbeat_discovery')),
    declared_confidence TEXT,
    origin TEXT,
    last_verified TEXT,
    has_embedding INTEGER NOT NULL DEFAULT 0,
    access_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    invalidated_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(source_file);
CREATE INDEX IF NOT EXISTS idx_chunks_invalidated ON chunks(invalidated_at);
CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(content_hash);

-- Full-text search (BM25) over live chunks only
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    text,
    id UNINDEXED
);

-- Index audit log
CREATE TABLE IF NOT EXISTS chunk_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('index','invalidate','rebuild','hash_mismatch')),
    chunk_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Heartbeat audit log
CREATE TABLE IF NOT EXISTS heartbeat_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cycle_id TEXT NOT NULL,
    task_id TEXT,
    outcome TEXT NOT NULL CHECK(outcome IN ('executed','failed','ack')),
    details TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_heartbeat_log_cycle ON heartbeat_log(cycle_id);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for expected in ["files", "chunks", "chunk_log", "heartbeat_log", "schema_meta"] {
            assert!(tables.contains(&expected.to_string()), "missing table {expected}");
        }

        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn source_check_rejects_unknown_provenance() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let err = conn.execute(
            "INSERT INTO chunks (id, source_file, byte_start, byte_end, text, content_hash, source, created_at) \
             VALUES ('c1', 'a.md', 0, 1, 'a', 'h', 'rumour', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(err.is_err());
    }
}
