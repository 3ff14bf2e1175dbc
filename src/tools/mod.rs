pub mod heartbeat;
pub mod memory_stats;
pub mod reindex;
pub mod search;

use std::sync::Arc;

use heartbeat::{HeartbeatRunParams, HeartbeatStatusParams};
use memory_stats::MemoryStatsParams;
use reindex::ReindexParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use search::SearchParams;

use crate::daemon::Daemon;
use crate::facts::NewFact;

/// The Cairn MCP tool handler. Every tool goes through the shared [`Daemon`].
#[derive(Clone)]
pub struct CairnTools {
    tool_router: ToolRouter<Self>,
    daemon: Arc<Daemon>,
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("serialization failed: {e}"))
}

#[tool_router]
impl CairnTools {
    pub fn new(daemon: Arc<Daemon>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            daemon,
        }
    }

    /// Verified search over the workspace.
    #[tool(description = "Search long-term memory. Returns only results whose text was re-verified against its stored hash, each with a [VERIFIED:xxxxxxxx] citation tag and a confidence tier. An empty result means no verified information exists: do not guess.")]
    async fn search(
        &self,
        Parameters(params): Parameters<SearchParams>,
    ) -> Result<String, String> {
        if params.query.trim().is_empty() {
            return Err("query must not be empty".into());
        }
        tracing::info!(query = %params.query, top_k = ?params.top_k, "search called");

        let response = self
            .daemon
            .retriever()
            .search(&params.query, params.top_k)
            .await
            .map_err(|e| format!("search failed: {e:#}"))?;
        to_json(&response)
    }

    /// Reconcile the index with the files on disk.
    #[tool(description = "Reindex the workspace. Incremental by default (changed files only); full=true rebuilds everything and swaps it in atomically.")]
    async fn reindex(
        &self,
        Parameters(params): Parameters<ReindexParams>,
    ) -> Result<String, String> {
        let full = params.full.unwrap_or(false);
        tracing::info!(full, "reindex called");
        let stats = self
            .daemon
            .reindex(full)
            .await
            .map_err(|e| format!("reindex failed: {e:#}"))?;
        to_json(&stats)
    }

    /// Index statistics.
    #[tool(description = "Get index statistics: live chunk count by source, invalidated chunks, file count, last indexed time, and embedding model.")]
    async fn memory_stats(
        &self,
        Parameters(params): Parameters<MemoryStatsParams>,
    ) -> Result<String, String> {
        let overview = self
            .daemon
            .indexer()
            .overview()
            .await
            .map_err(|e| format!("stats failed: {e:#}"))?;

        if !params.include_health.unwrap_or(false) {
            return to_json(&overview);
        }

        let db = self.daemon.db().clone();
        let health = tokio::task::spawn_blocking(move || {
            let conn = crate::db::lock(&db)?;
            crate::db::check_database_health(&conn)
        })
        .await
        .map_err(|e| format!("db task failed: {e}"))?
        .map_err(|e| format!("health check failed: {e:#}"))?;

        to_json(&serde_json::json!({ "index": overview, "health": health }))
    }

    /// Store a new fact with provenance.
    #[tool(description = "Store a new fact. 'source' (user_stated, file, web_search, heartbeat_discovery) and 'category' are required. The fact is indexed immediately and searchable on return.")]
    async fn store_fact(
        &self,
        Parameters(fact): Parameters<NewFact>,
    ) -> Result<String, String> {
        tracing::info!(
            text_len = fact.text.len(),
            source = ?fact.source,
            category = ?fact.category,
            "store_fact called"
        );
        let stored = self
            .daemon
            .facts()
            .store(fact)
            .await
            .map_err(|e| format!("{e:#}"))?;
        to_json(&stored)
    }

    /// Run one heartbeat cycle now.
    #[tool(description = "Run one heartbeat cycle immediately. Skips (ran=false) outside active hours or while the workspace is busy.")]
    async fn heartbeat_run(
        &self,
        Parameters(_params): Parameters<HeartbeatRunParams>,
    ) -> Result<String, String> {
        let report = self
            .daemon
            .heartbeat()
            .run_cycle()
            .await
            .map_err(|e| format!("heartbeat cycle failed: {e:#}"))?;
        to_json(&report)
    }

    /// Last heartbeat result and the task list.
    #[tool(description = "Get the last heartbeat cycle report and the current task list with due flags.")]
    async fn heartbeat_status(
        &self,
        Parameters(params): Parameters<HeartbeatStatusParams>,
    ) -> Result<String, String> {
        let heartbeat = self.daemon.heartbeat();
        if !params.include_tasks.unwrap_or(true) {
            return to_json(&heartbeat.last_status());
        }
        let status = heartbeat
            .status()
            .map_err(|e| format!("status failed: {e:#}"))?;
        to_json(&status)
    }
}

#[tool_handler]
impl ServerHandler for CairnTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Cairn is a verified-memory server. Use search to look things up and cite the \
                 [VERIFIED:...] tag of every result you rely on; if search finds nothing \
                 verified, say so. Use store_fact to remember something new."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
