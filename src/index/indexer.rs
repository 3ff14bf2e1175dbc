//! Write path for the index: stage, then apply in a transaction.
//!
//! Staging reads a file, parses front-matter, chunks, hashes and embeds. Applying
//! invalidates the file's previous chunks (marks them, removes them from FTS5 and vec0)
//! and inserts the new rows. Chunk rows are never edited in place.

use std::collections::HashMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::chunker;
use super::front_matter::{self, FrontMatter};
use super::sha256_hex;
use crate::embedding::{has_direction, EmbeddingProvider};
use crate::error::CairnError;
use crate::workspace::Workspace;

/// Counters returned from every index operation.
#[derive(Debug, Default, Clone, Serialize)]
pub struct IndexStats {
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_removed: usize,
    pub chunks_added: usize,
    pub chunks_invalidated: usize,
    /// Chunks stored without an embedding: the embedder failed or the chunk had no
    /// embeddable words.
    pub lexical_only: usize,
    /// Files left out because they could not be read as UTF-8 text.
    pub files_skipped: usize,
}

impl IndexStats {
    fn absorb(&mut self, other: &IndexStats) {
        self.files_indexed += other.files_indexed;
        self.files_removed += other.files_removed;
        self.chunks_added += other.chunks_added;
        self.chunks_invalidated += other.chunks_invalidated;
        self.lexical_only += other.lexical_only;
    }
}

struct StagedChunk {
    id: String,
    start: usize,
    end: usize,
    text: String,
    hash: String,
    embedding: Option<Vec<f32>>,
}

struct StagedFile {
    rel: String,
    mtime: i64,
    front_matter: FrontMatter,
    chunks: Vec<StagedChunk>,
}

/// Read, chunk, hash and embed one file without touching the database.
fn stage_file(
    workspace: &Workspace,
    path: &Path,
    embedder: &dyn EmbeddingProvider,
    max_tokens: usize,
) -> Result<StagedFile> {
    let rel = workspace
        .relative(path)
        .with_context(|| format!("{} is outside the workspace", path.display()))?;
    let mtime = file_mtime(path)?;
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let text = String::from_utf8(bytes).with_context(|| format!("{rel} is not valid UTF-8"))?;

    let (front_matter, body_start) = front_matter::parse(&text, &rel);
    let spans = chunker::chunk(&text, body_start, max_tokens);

    let texts: Vec<&str> = spans.iter().map(|s| &text[s.start..s.end]).collect();
    let embeddings = if texts.is_empty() {
        Vec::new()
    } else {
        match embedder.embed_batch(&texts) {
            // Chunks with nothing to embed stay lexical-only.
            Ok(vectors) if vectors.len() == texts.len() => vectors
                .into_iter()
                .map(|v| Some(v).filter(|v| has_direction(v)))
                .collect(),
            Ok(vectors) => {
                warn!(file = %rel, expected = texts.len(), got = vectors.len(), "embedder returned wrong batch size, indexing lexically");
                vec![None; texts.len()]
            }
            Err(e) => {
                warn!(file = %rel, error = %e, "embedding failed, indexing lexically");
                vec![None; texts.len()]
            }
        }
    };

    let chunks = spans
        .iter()
        .zip(embeddings)
        .map(|(span, embedding)| {
            let chunk_text = &text[span.start..span.end];
            StagedChunk {
                id: uuid::Uuid::now_v7().to_string(),
                start: span.start,
                end: span.end,
                text: chunk_text.to_string(),
                hash: sha256_hex(chunk_text.as_bytes()),
                embedding,
            }
        })
        .collect();

    Ok(StagedFile {
        rel,
        mtime,
        front_matter,
        chunks,
    })
}

/// Insert a staged file's chunks, replacing whatever the file had before.
fn apply_file(tx: &Transaction, staged: &StagedFile) -> Result<IndexStats> {
    let mut stats = IndexStats {
        files_indexed: 1,
        chunks_invalidated: invalidate_file(tx, &staged.rel)?,
        ..Default::default()
    };

    let now = chrono::Utc::now().to_rfc3339();
    let fm = &staged.front_matter;
    for chunk in &staged.chunks {
        tx.execute(
            "INSERT INTO chunks (id, source_file, byte_start, byte_end, text, content_hash, \
             category, source, declared_confidence, origin, last_verified, has_embedding, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                chunk.id,
                staged.rel,
                chunk.start as i64,
                chunk.end as i64,
                chunk.text,
                chunk.hash,
                fm.category,
                fm.source.as_str(),
                fm.confidence.map(|c| c.as_str()),
                fm.origin,
                fm.last_verified,
                chunk.embedding.is_some(),
                now,
            ],
        )?;
        tx.execute(
            "INSERT INTO chunks_fts (text, id) VALUES (?1, ?2)",
            params![chunk.text, chunk.id],
        )?;
        match &chunk.embedding {
            Some(embedding) => {
                tx.execute(
                    "INSERT INTO chunks_vec (id, embedding) VALUES (?1, ?2)",
                    params![chunk.id, crate::db::embedding_to_bytes(embedding)],
                )?;
            }
            None => stats.lexical_only += 1,
        }
        write_chunk_log(
            tx,
            "index",
            &chunk.id,
            Some(&serde_json::json!({"file": staged.rel, "hash": chunk.hash})),
        )?;
        stats.chunks_added += 1;
    }

    tx.execute(
        "INSERT INTO files (path, indexed_mtime, indexed_at) VALUES (?1, ?2, ?3) \
         ON CONFLICT(path) DO UPDATE SET indexed_mtime = excluded.indexed_mtime, indexed_at = excluded.indexed_at",
        params![staged.rel, staged.mtime, now],
    )?;

    Ok(stats)
}

/// Invalidate every live chunk of `rel`. Returns how many were invalidated.
pub(crate) fn invalidate_file(conn: &Connection, rel: &str) -> Result<usize> {
    let ids: Vec<String> = conn
        .prepare("SELECT id FROM chunks WHERE source_file = ?1 AND invalidated_at IS NULL")?
        .query_map(params![rel], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let now = chrono::Utc::now().to_rfc3339();
    for id in &ids {
        conn.execute(
            "UPDATE chunks SET invalidated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        conn.execute("DELETE FROM chunks_fts WHERE id = ?1", params![id])?;
        conn.execute("DELETE FROM chunks_vec WHERE id = ?1", params![id])?;
        write_chunk_log(conn, "invalidate", id, Some(&serde_json::json!({"file": rel})))?;
    }
    Ok(ids.len())
}

/// Index a single file synchronously, replacing its previous chunks.
pub fn index_file(
    conn: &mut Connection,
    workspace: &Workspace,
    path: &Path,
    embedder: &dyn EmbeddingProvider,
    max_tokens: usize,
) -> Result<IndexStats> {
    let staged = stage_file(workspace, path, embedder, max_tokens)?;
    let tx = conn.transaction()?;
    let stats = apply_file(&tx, &staged)?;
    tx.commit()?;
    debug!(
        file = %staged.rel,
        added = stats.chunks_added,
        invalidated = stats.chunks_invalidated,
        "indexed file"
    );
    Ok(stats)
}

/// Incremental reindex: only files whose mtime is newer than the recorded one.
///
/// Files that vanished have their chunks invalidated. A file that fails to stage is
/// logged and skipped; the rest still index.
pub fn reindex_all(
    conn: &mut Connection,
    workspace: &Workspace,
    embedder: &dyn EmbeddingProvider,
    max_tokens: usize,
) -> Result<IndexStats> {
    let recorded = recorded_mtimes(conn)?;
    let files = workspace.indexable_files()?;
    let mut stats = IndexStats {
        files_scanned: files.len(),
        ..Default::default()
    };

    let mut seen = Vec::with_capacity(files.len());
    for path in &files {
        let Some(rel) = workspace.relative(path) else {
            continue;
        };
        let mtime = file_mtime(path)?;
        let stale = recorded.get(&rel).map_or(true, |&indexed| mtime > indexed);
        seen.push(rel.clone());
        if !stale {
            continue;
        }
        match index_file(conn, workspace, path, embedder, max_tokens) {
            Ok(file_stats) => stats.absorb(&file_stats),
            Err(e) => {
                warn!(file = %rel, error = %format!("{e:#}"), "skipping file that failed to index");
                stats.files_skipped += 1;
            }
        }
    }

    for rel in recorded.keys().filter(|r| !seen.contains(r)) {
        let tx = conn.transaction()?;
        let invalidated = invalidate_file(&tx, rel)?;
        tx.execute("DELETE FROM files WHERE path = ?1", params![rel])?;
        tx.commit()?;
        debug!(file = %rel, invalidated, "file removed from workspace");
        stats.files_removed += 1;
        stats.chunks_invalidated += invalidated;
    }

    if stats.files_indexed > 0 || stats.files_removed > 0 {
        info!(
            indexed = stats.files_indexed,
            removed = stats.files_removed,
            added = stats.chunks_added,
            invalidated = stats.chunks_invalidated,
            "incremental reindex complete"
        );
    }
    Ok(stats)
}

/// Full rebuild: stage every file in memory, then swap in one transaction.
///
/// A file that cannot be staged is skipped with a warning, like the incremental path.
/// A listing or apply failure returns [`CairnError::RebuildFailed`] and the previous
/// index stays authoritative.
pub fn rebuild(
    conn: &mut Connection,
    workspace: &Workspace,
    embedder: &dyn EmbeddingProvider,
    max_tokens: usize,
) -> Result<IndexStats> {
    let files = workspace
        .indexable_files()
        .map_err(|e| CairnError::RebuildFailed(format!("{e:#}")))?;

    let mut shadow = Vec::with_capacity(files.len());
    let mut skipped = 0;
    for path in &files {
        match stage_file(workspace, path, embedder, max_tokens) {
            Ok(staged) => shadow.push(staged),
            Err(e) => {
                warn!(file = %path.display(), error = %format!("{e:#}"), "skipping file that failed to index");
                skipped += 1;
            }
        }
    }

    let stats = swap_in(conn, &shadow, embedder.model_id())
        .map_err(|e| CairnError::RebuildFailed(format!("{e:#}")))?;
    info!(
        files = stats.files_indexed,
        chunks = stats.chunks_added,
        lexical_only = stats.lexical_only,
        skipped,
        "index rebuilt"
    );
    Ok(IndexStats {
        files_scanned: files.len(),
        files_skipped: skipped,
        ..stats
    })
}

fn swap_in(conn: &mut Connection, shadow: &[StagedFile], model_id: &str) -> Result<IndexStats> {
    let tx = conn.transaction()?;
    let now = chrono::Utc::now().to_rfc3339();

    let previous = tx.execute(
        "UPDATE chunks SET invalidated_at = ?1 WHERE invalidated_at IS NULL",
        params![now],
    )?;
    tx.execute("DELETE FROM chunks_fts", [])?;
    tx.execute("DELETE FROM chunks_vec", [])?;
    tx.execute("DELETE FROM files", [])?;

    let mut stats = IndexStats::default();
    for staged in shadow {
        stats.absorb(&apply_file(&tx, staged)?);
    }
    stats.chunks_invalidated = previous;

    crate::db::meta::set_embedding_model(&tx, model_id)?;
    write_chunk_log(
        &tx,
        "rebuild",
        "*",
        Some(&serde_json::json!({"files": shadow.len(), "chunks": stats.chunks_added})),
    )?;
    // Dropping `tx` on any earlier `?` rolls the whole swap back.
    tx.commit()?;
    Ok(stats)
}

fn recorded_mtimes(conn: &Connection) -> Result<HashMap<String, i64>> {
    let map = conn
        .prepare("SELECT path, indexed_mtime FROM files")?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(map)
}

/// Live chunk ids of one file, in document order.
pub fn live_chunk_ids(conn: &Connection, rel: &str) -> Result<Vec<String>> {
    let ids = conn
        .prepare(
            "SELECT id FROM chunks WHERE source_file = ?1 AND invalidated_at IS NULL ORDER BY byte_start",
        )?
        .query_map(params![rel], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// The recorded mtime for one file, if it has been indexed.
pub fn indexed_mtime(conn: &Connection, rel: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT indexed_mtime FROM files WHERE path = ?1",
            params![rel],
            |row| row.get(0),
        )
        .optional()?)
}

/// Modification time in nanoseconds since the epoch.
fn file_mtime(path: &Path) -> Result<i64> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok(i64::try_from(nanos).unwrap_or(i64::MAX))
}

/// Write an entry to the chunk_log audit table.
pub(crate) fn write_chunk_log(
    conn: &Connection,
    operation: &str,
    chunk_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO chunk_log (operation, chunk_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, chunk_id, details_json, now],
    )?;
    Ok(())
}
