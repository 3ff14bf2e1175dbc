//! Verified retrieval: ranked, hash-re-verified, confidence-scored results.
//!
//! [`search::search`] is the synchronous core. [`Retriever`] is the async front door
//! used by the surfaces: it embeds the query under a timeout, falls back to lexical-only
//! search when the embedder is unavailable, and runs the database work on the blocking
//! pool. Search never takes the workspace lock.

pub mod confidence;
pub mod search;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::db::Db;
use crate::embedding::{embed_with_timeout, EmbeddingProvider};
pub use search::{
    SearchOptions, SearchResponse, SearchStatus, UnverifiedResult, VerifiedResult,
    NO_VERIFIED_MESSAGE,
};

#[derive(Clone)]
pub struct Retriever {
    db: Db,
    embedder: Arc<dyn EmbeddingProvider>,
    workspace_root: PathBuf,
    options: SearchOptions,
    embed_timeout: Duration,
}

impl Retriever {
    pub fn new(
        db: Db,
        embedder: Arc<dyn EmbeddingProvider>,
        workspace_root: PathBuf,
        options: SearchOptions,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            db,
            embedder,
            workspace_root,
            options,
            embed_timeout,
        }
    }

    pub fn default_top_k(&self) -> usize {
        self.options.top_k
    }

    /// Search with an optional `top_k` override.
    pub async fn search(&self, query: &str, top_k: Option<usize>) -> Result<SearchResponse> {
        let embedding =
            match embed_with_timeout(Arc::clone(&self.embedder), query, self.embed_timeout).await {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(error = %e, "query embedding unavailable, searching lexically");
                    None
                }
            };

        let db = self.db.clone();
        let root = self.workspace_root.clone();
        let query_owned = query.to_string();
        let mut options = self.options.clone();
        if let Some(k) = top_k {
            options.top_k = k;
        }

        let response = tokio::task::spawn_blocking(move || {
            let conn = crate::db::lock(&db)?;
            search::search(&conn, &root, &query_owned, embedding.as_deref(), &options)
        })
        .await
        .map_err(|e| anyhow::anyhow!("search task failed: {e}"))??;

        info!(
            verified = response.results.len(),
            unverified = response.unverified.len(),
            degraded = response.degraded,
            "search served"
        );
        Ok(response)
    }
}
