//! Content indexer: chunking, hashing, front-matter, and the FTS5/vec0 write path.

pub mod chunker;
pub mod front_matter;
pub mod indexer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::db::Db;
use crate::embedding::EmbeddingProvider;
use crate::workspace::Workspace;
pub use indexer::{index_file, rebuild, reindex_all, IndexStats};

/// Async handle over the index write path. Work runs on the blocking pool.
#[derive(Clone)]
pub struct Indexer {
    db: Db,
    embedder: Arc<dyn EmbeddingProvider>,
    workspace: Workspace,
    max_tokens: usize,
}

impl Indexer {
    pub fn new(
        db: Db,
        embedder: Arc<dyn EmbeddingProvider>,
        workspace: Workspace,
        max_tokens: usize,
    ) -> Self {
        Self {
            db,
            embedder,
            workspace,
            max_tokens,
        }
    }

    pub async fn index_file(&self, path: PathBuf) -> Result<IndexStats> {
        self.run(move |conn, ws, embedder, max_tokens| {
            indexer::index_file(conn, ws, &path, embedder, max_tokens)
        })
        .await
    }

    /// Incremental, mtime-based reindex.
    pub async fn reindex_all(&self) -> Result<IndexStats> {
        self.run(indexer::reindex_all).await
    }

    /// Full shadow-then-swap rebuild.
    pub async fn rebuild(&self) -> Result<IndexStats> {
        self.run(indexer::rebuild).await
    }

    pub async fn live_chunk_ids(&self, rel: String) -> Result<Vec<String>> {
        self.run(move |conn, _, _, _| indexer::live_chunk_ids(conn, &rel))
            .await
    }

    pub async fn overview(&self) -> Result<IndexOverview> {
        self.run(|conn, _, _, _| overview(conn)).await
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &Workspace, &dyn EmbeddingProvider, usize) -> Result<T>
            + Send
            + 'static,
    {
        let db = self.db.clone();
        let workspace = self.workspace.clone();
        let embedder = Arc::clone(&self.embedder);
        let max_tokens = self.max_tokens;
        tokio::task::spawn_blocking(move || {
            let mut conn = crate::db::lock(&db)?;
            f(&mut conn, &workspace, embedder.as_ref(), max_tokens)
        })
        .await
        .map_err(|e| anyhow::anyhow!("index task failed: {e}"))?
    }
}

/// Full SHA-256 digest as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Index overview reported by `stats`.
#[derive(Debug, Serialize)]
pub struct IndexOverview {
    pub chunk_count: u64,
    pub invalidated_count: u64,
    pub file_count: u64,
    pub lexical_only_count: u64,
    pub by_source: HashMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_indexed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
}

pub fn overview(conn: &Connection) -> Result<IndexOverview> {
    let count = |sql: &str| -> Result<u64> {
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n as u64)
    };

    let by_source = conn
        .prepare(
            "SELECT source, COUNT(*) FROM chunks WHERE invalidated_at IS NULL GROUP BY source",
        )?
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
        .collect::<Result<HashMap<_, _>, _>>()?;

    let last_indexed_at: Option<String> =
        conn.query_row("SELECT MAX(indexed_at) FROM files", [], |row| row.get(0))?;

    Ok(IndexOverview {
        chunk_count: count("SELECT COUNT(*) FROM chunks WHERE invalidated_at IS NULL")?,
        invalidated_count: count("SELECT COUNT(*) FROM chunks WHERE invalidated_at IS NOT NULL")?,
        file_count: count("SELECT COUNT(*) FROM files")?,
        lexical_only_count: count(
            "SELECT COUNT(*) FROM chunks WHERE invalidated_at IS NULL AND has_embedding = 0",
        )?,
        by_source,
        last_indexed_at,
        embedding_model: crate::db::meta::get_embedding_model(conn)?,
    })
}

/// Compare the stored embedding model with the active provider.
///
/// An empty index simply adopts the active model. A populated index built with another
/// model keeps working lexically for new vectors but should be rebuilt; returns `false`.
pub fn check_embedding_model(conn: &Connection, active: &str) -> Result<bool> {
    let stored = crate::db::meta::get_embedding_model(conn)?;
    let live: i64 = conn.query_row(
        "SELECT COUNT(*) FROM chunks WHERE invalidated_at IS NULL AND has_embedding = 1",
        [],
        |row| row.get(0),
    )?;

    match stored {
        Some(ref model) if model == active => Ok(true),
        _ if live == 0 => {
            crate::db::meta::set_embedding_model(conn, active)?;
            Ok(true)
        }
        stored => {
            warn!(
                stored = stored.as_deref().unwrap_or("unknown"),
                active,
                "embedding model changed since the index was built; run `cairn reindex --full`"
            );
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_matches_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn empty_index_adopts_active_model() {
        let conn = crate::db::open_memory_database().unwrap();
        assert!(check_embedding_model(&conn, "hashed-384").unwrap());
        assert_eq!(
            crate::db::meta::get_embedding_model(&conn).unwrap().as_deref(),
            Some("hashed-384")
        );
        let o = overview(&conn).unwrap();
        assert_eq!(o.chunk_count, 0);
        assert!(o.last_indexed_at.is_none());
    }
}
