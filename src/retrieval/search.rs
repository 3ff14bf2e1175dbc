//! Hybrid search with hash re-verification.
//!
//! FTS5 BM25 and vec0 KNN run independently, are fused with configured weights, deduped
//! by overlapping byte range, and then every survivor is re-hashed against the bytes on
//! disk. Only matching chunks come back as verified results.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, warn};

use super::confidence::derive_tier;
use crate::config::RetrievalConfig;
use crate::embedding::has_direction;
use crate::index::indexer::write_chunk_log;
use crate::index::sha256_hex;
use crate::types::{ConfidenceTier, Source};

pub const NO_VERIFIED_MESSAGE: &str = "no verified information found";

/// Search knobs, usually built from [`RetrievalConfig`].
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    pub lexical_weight: f64,
    pub semantic_weight: f64,
    pub min_similarity: f64,
    pub report_unverified: bool,
}

impl From<&RetrievalConfig> for SearchOptions {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            top_k: config.default_top_k,
            lexical_weight: config.lexical_weight,
            semantic_weight: config.semantic_weight,
            min_similarity: config.min_similarity,
            report_unverified: config.report_unverified,
        }
    }
}

/// A result whose bytes were re-hashed and matched.
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedResult {
    pub chunk_id: String,
    pub text: String,
    /// `[VERIFIED:xxxxxxxx]`
    pub citation_tag: String,
    pub confidence_tier: ConfidenceTier,
    pub source_file: String,
    pub byte_range: (usize, usize),
    pub source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub score: f64,
}

/// A candidate that failed re-verification. Never tagged.
#[derive(Debug, Clone, Serialize)]
pub struct UnverifiedResult {
    pub chunk_id: String,
    pub text: String,
    pub source_file: String,
    pub confidence_tier: ConfidenceTier,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Verified,
    NoVerifiedMatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub status: SearchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub results: Vec<VerifiedResult>,
    /// "Use with caution" side-channel.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unverified: Vec<UnverifiedResult>,
    /// The semantic backend was unavailable and the search ran lexical-only.
    pub degraded: bool,
}

impl SearchResponse {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

struct ChunkRow {
    id: String,
    source_file: String,
    start: usize,
    end: usize,
    text: String,
    content_hash: String,
    category: Option<String>,
    source: Source,
    declared: Option<ConfidenceTier>,
    last_verified: Option<String>,
    access_count: u32,
}

struct Candidate {
    row: ChunkRow,
    score: f64,
}

enum Verification {
    Verified,
    Mismatch(&'static str),
}

/// Run a verified search.
///
/// `query_embedding` is `None` when the embedder failed or timed out; the search then
/// runs lexical-only and every tier is lowered one step.
pub fn search(
    conn: &Connection,
    workspace_root: &Path,
    query: &str,
    query_embedding: Option<&[f32]>,
    opts: &SearchOptions,
) -> Result<SearchResponse> {
    let k = opts.top_k.max(1);
    let degraded = query_embedding.is_none();

    let lexical = fts_search(conn, query, k)?;
    let semantic = match query_embedding {
        // A query with no embeddable words has no direction to compare against.
        Some(embedding) if !has_direction(embedding) => {
            debug!("query embedding has zero norm, skipping semantic search");
            Vec::new()
        }
        Some(embedding) => vector_search(conn, embedding, k)?
            .into_iter()
            .filter(|(_, cosine)| *cosine >= opts.min_similarity)
            .collect(),
        None => Vec::new(),
    };

    let fused = fuse(&lexical, &semantic, opts.lexical_weight, opts.semantic_weight);
    let ids: Vec<&str> = fused.keys().map(String::as_str).collect();
    let rows = fetch_live_chunks(conn, &ids)?;

    let mut candidates: Vec<Candidate> = rows
        .into_iter()
        .filter_map(|row| {
            let score = *fused.get(&row.id)?;
            Some(Candidate { row, score })
        })
        .collect();
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let candidates = dedupe(candidates);

    let mut file_cache: HashMap<String, Option<Vec<u8>>> = HashMap::new();
    let mut verified: Vec<(Candidate, Option<String>)> = Vec::new();
    let mut unverified = Vec::new();
    let now = chrono::Utc::now().to_rfc3339();

    for mut candidate in candidates {
        let bytes = file_cache
            .entry(candidate.row.source_file.clone())
            .or_insert_with(|| std::fs::read(workspace_root.join(&candidate.row.source_file)).ok());

        match verify(&candidate.row, bytes.as_deref()) {
            Verification::Verified => {
                conn.execute(
                    "UPDATE chunks SET access_count = access_count + 1, last_verified = ?1 WHERE id = ?2",
                    params![now, candidate.row.id],
                )?;
                let previous = candidate.row.last_verified.take();
                candidate.row.access_count += 1;
                verified.push((candidate, previous));
            }
            Verification::Mismatch(reason) => {
                warn!(
                    chunk_id = %candidate.row.id,
                    file = %candidate.row.source_file,
                    reason,
                    "hash mismatch, excluding from verified results"
                );
                write_chunk_log(
                    conn,
                    "hash_mismatch",
                    &candidate.row.id,
                    Some(&serde_json::json!({"file": candidate.row.source_file, "reason": reason})),
                )?;
                if opts.report_unverified {
                    unverified.push(UnverifiedResult {
                        chunk_id: candidate.row.id,
                        text: candidate.row.text,
                        source_file: candidate.row.source_file,
                        confidence_tier: ConfidenceTier::None,
                        reason: reason.to_string(),
                    });
                }
            }
        }
    }

    verified.sort_by(|(a, a_prev), (b, b_prev)| rank_order((a, a_prev), (b, b_prev)));
    verified.truncate(k);

    let results: Vec<VerifiedResult> = verified
        .into_iter()
        .map(|(c, _)| VerifiedResult {
            citation_tag: citation_tag(&c.row.content_hash),
            confidence_tier: derive_tier(
                true,
                c.row.source,
                c.row.access_count,
                c.row.declared,
                degraded,
            ),
            chunk_id: c.row.id,
            text: c.row.text,
            source_file: c.row.source_file,
            byte_range: (c.row.start, c.row.end),
            source: c.row.source,
            category: c.row.category,
            score: c.score,
        })
        .collect();

    debug!(
        query_len = query.len(),
        lexical = lexical.len(),
        semantic = semantic.len(),
        verified = results.len(),
        unverified = unverified.len(),
        degraded,
        "search complete"
    );

    let (status, message) = if results.is_empty() {
        (SearchStatus::NoVerifiedMatch, Some(NO_VERIFIED_MESSAGE.to_string()))
    } else {
        (SearchStatus::Verified, None)
    };

    Ok(SearchResponse {
        status,
        message,
        results,
        unverified,
        degraded,
    })
}

/// `[VERIFIED:` + first 8 hex chars of the digest + `]`.
pub fn citation_tag(content_hash: &str) -> String {
    let short = content_hash.get(..8).unwrap_or(content_hash);
    format!("[VERIFIED:{short}]")
}

fn verify(row: &ChunkRow, file: Option<&[u8]>) -> Verification {
    let Some(bytes) = file else {
        return Verification::Mismatch("source file missing");
    };
    let Some(slice) = bytes.get(row.start..row.end) else {
        return Verification::Mismatch("byte range out of bounds");
    };
    if sha256_hex(slice) == row.content_hash {
        Verification::Verified
    } else {
        Verification::Mismatch("content changed on disk")
    }
}

/// Weighted fusion. Lexical rank is normalized to `1 - rank/n`; semantic uses cosine.
fn fuse(
    lexical: &[String],
    semantic: &[(String, f64)],
    lexical_weight: f64,
    semantic_weight: f64,
) -> HashMap<String, f64> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    let n = lexical.len() as f64;
    for (rank, id) in lexical.iter().enumerate() {
        *scores.entry(id.clone()).or_insert(0.0) += lexical_weight * (1.0 - rank as f64 / n);
    }
    for (id, cosine) in semantic {
        *scores.entry(id.clone()).or_insert(0.0) += semantic_weight * cosine;
    }
    scores
}

/// Keep the highest-scoring candidate among those from the same file with overlapping
/// byte ranges. Input must be sorted by score, descending.
fn dedupe(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for c in candidates {
        let overlaps = kept.iter().any(|k| {
            k.row.source_file == c.row.source_file && k.row.start < c.row.end && c.row.start < k.row.end
        });
        if !overlaps {
            kept.push(c);
        }
    }
    kept
}

/// FTS5 BM25 search over live chunks. Returns ids best first.
fn fts_search(conn: &Connection, query: &str, limit: usize) -> Result<Vec<String>> {
    let escaped = escape_fts_query(query);
    if escaped.is_empty() {
        return Ok(Vec::new());
    }
    let ids = conn
        .prepare("SELECT id FROM chunks_fts WHERE chunks_fts MATCH ?1 ORDER BY rank LIMIT ?2")?
        .query_map(params![escaped, limit as i64], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Escape a user query for FTS5 MATCH syntax.
///
/// Each word becomes a quoted term with punctuation stripped; terms are OR-ed so a
/// natural-language question still matches documents containing some of its words.
fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{w}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// vec0 KNN. Returns `(id, cosine)` best first.
///
/// Stored vectors are unit length, so cosine = 1 - d²/2 for L2 distance d.
fn vector_search(conn: &Connection, embedding: &[f32], limit: usize) -> Result<Vec<(String, f64)>> {
    let bytes = crate::db::embedding_to_bytes(embedding);
    let results = conn
        .prepare(
            "SELECT id, distance FROM chunks_vec WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
        )?
        .query_map(params![bytes, limit as i64], |row| {
            let distance: f64 = row.get(1)?;
            Ok((row.get::<_, String>(0)?, 1.0 - distance * distance / 2.0))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

fn fetch_live_chunks(conn: &Connection, ids: &[&str]) -> Result<Vec<ChunkRow>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = (1..=ids.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT id, source_file, byte_start, byte_end, text, content_hash, category, source, \
         declared_confidence, last_verified, access_count \
         FROM chunks WHERE invalidated_at IS NULL AND id IN ({placeholders})"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
            let source: String = row.get(7)?;
            let declared: Option<String> = row.get(8)?;
            Ok(ChunkRow {
                id: row.get(0)?,
                source_file: row.get(1)?,
                start: row.get::<_, i64>(2)? as usize,
                end: row.get::<_, i64>(3)? as usize,
                text: row.get(4)?,
                content_hash: row.get(5)?,
                category: row.get(6)?,
                source: source.parse().unwrap_or_default(),
                declared: declared.and_then(|d| d.parse().ok()),
                last_verified: row.get(9)?,
                access_count: row.get::<_, i64>(10)? as u32,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Score descending; equal scores put the most recently verified first (by the
/// `last_verified` seen before this search), then user-stated facts.
fn rank_order(
    (a, a_prev): (&Candidate, &Option<String>),
    (b, b_prev): (&Candidate, &Option<String>),
) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b_prev.cmp(a_prev))
        .then_with(|| {
            let a_user = a.row.source == Source::UserStated;
            let b_user = b.row.source == Source::UserStated;
            b_user.cmp(&a_user)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_fts_strips_punctuation_and_ors_terms() {
        assert_eq!(escape_fts_query("wifi password?"), "\"wifi\" OR \"password\"");
        assert_eq!(escape_fts_query("\"quoted\" (x)"), "\"quoted\" OR \"x\"");
        assert_eq!(escape_fts_query("  ?? "), "");
    }

    #[test]
    fn citation_tag_uses_first_eight_hex_chars() {
        let hash = sha256_hex(b"hello");
        assert_eq!(citation_tag(&hash), format!("[VERIFIED:{}]", &hash[..8]));
        assert_eq!(citation_tag(&hash).len(), "[VERIFIED:]".len() + 8);
    }

    #[test]
    fn fusion_weights_both_signals() {
        let lexical = vec!["a".to_string(), "b".to_string()];
        let semantic = vec![("b".to_string(), 0.8), ("c".to_string(), 0.5)];
        let scores = fuse(&lexical, &semantic, 0.4, 0.6);
        assert!((scores["a"] - 0.4).abs() < 1e-9);
        assert!((scores["b"] - (0.4 * 0.5 + 0.6 * 0.8)).abs() < 1e-9);
        assert!((scores["c"] - 0.3).abs() < 1e-9);
    }

    fn candidate(id: &str, file: &str, start: usize, end: usize, score: f64) -> Candidate {
        Candidate {
            row: ChunkRow {
                id: id.into(),
                source_file: file.into(),
                start,
                end,
                text: String::new(),
                content_hash: String::new(),
                category: None,
                source: Source::File,
                declared: None,
                last_verified: None,
                access_count: 0,
            },
            score,
        }
    }

    #[test]
    fn dedupe_drops_overlapping_ranges_in_same_file() {
        let kept = dedupe(vec![
            candidate("a", "x.md", 0, 10, 0.9),
            candidate("b", "x.md", 5, 15, 0.8),
            candidate("c", "x.md", 10, 20, 0.7),
            candidate("d", "y.md", 0, 10, 0.6),
        ]);
        let ids: Vec<&str> = kept.iter().map(|c| c.row.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
    }

    #[test]
    fn verify_detects_missing_range_and_changed_bytes() {
        let bytes = b"hello world".to_vec();
        let mut row = candidate("a", "x.md", 0, 5, 0.0).row;
        row.content_hash = sha256_hex(b"hello");
        assert!(matches!(verify(&row, Some(&bytes)), Verification::Verified));
        assert!(matches!(verify(&row, None), Verification::Mismatch(_)));
        row.end = 50;
        assert!(matches!(verify(&row, Some(&bytes)), Verification::Mismatch(_)));
        row.end = 5;
        row.content_hash = sha256_hex(b"HELLO");
        assert!(matches!(verify(&row, Some(&bytes)), Verification::Mismatch(_)));
    }

    #[test]
    fn equal_scores_prefer_recently_verified_then_user_stated() {
        let older = Some("2026-01-01T00:00:00+00:00".to_string());
        let newer = Some("2026-03-01T00:00:00+00:00".to_string());
        let mut stated = candidate("stated", "facts/a.md", 0, 10, 0.5);
        stated.row.source = Source::UserStated;
        let mut stated_unseen = candidate("stated-unseen", "facts/b.md", 0, 10, 0.5);
        stated_unseen.row.source = Source::UserStated;

        let mut ranked = vec![
            (candidate("file-old", "notes/a.md", 0, 10, 0.5), older.clone()),
            (stated, older),
            (candidate("file-new", "notes/b.md", 0, 10, 0.5), newer),
            (candidate("never", "notes/c.md", 0, 10, 0.5), None),
            (candidate("best", "notes/d.md", 0, 10, 0.9), None),
            (stated_unseen, None),
        ];
        ranked.sort_by(|(a, a_prev), (b, b_prev)| rank_order((a, a_prev), (b, b_prev)));
        let ids: Vec<&str> = ranked.iter().map(|(c, _)| c.row.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["best", "file-new", "stated", "file-old", "stated-unseen", "never"]
        );
    }

    #[test]
    fn zero_norm_query_skips_semantic_matches() {
        let conn = crate::db::open_memory_database().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let embedding = vec![0.5f32; crate::embedding::EMBEDDING_DIM];
        conn.execute(
            "INSERT INTO chunks (id, source_file, byte_start, byte_end, text, content_hash, \
             has_embedding, created_at) VALUES ('c1', 'notes/a.md', 0, 5, 'hello', ?1, 1, ?2)",
            params![sha256_hex(b"hello"), chrono::Utc::now().to_rfc3339()],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO chunks_vec (id, embedding) VALUES ('c1', ?1)",
            params![crate::db::embedding_to_bytes(&crate::embedding::l2_normalize(&embedding))],
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("notes")).unwrap();
        std::fs::write(dir.path().join("notes/a.md"), "hello").unwrap();

        let opts = SearchOptions {
            top_k: 5,
            lexical_weight: 0.4,
            semantic_weight: 0.6,
            min_similarity: 0.25,
            report_unverified: true,
        };
        let zero = vec![0.0f32; crate::embedding::EMBEDDING_DIM];
        let response = search(&conn, dir.path(), "q z", Some(&zero), &opts).unwrap();
        assert_eq!(response.status, SearchStatus::NoVerifiedMatch);
        assert!(!response.degraded);

        let unit = crate::embedding::l2_normalize(&embedding);
        let response = search(&conn, dir.path(), "q z", Some(&unit), &opts).unwrap();
        assert_eq!(response.results.len(), 1);
    }
}
