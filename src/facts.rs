//! Fact store: the narrow write path for new facts with mandatory provenance.
//!
//! A fact becomes a small front-matter file under `memory/facts/<category>/`, written
//! atomically and indexed before [`FactStore::store`] returns, so it is searchable (and
//! verifiable) immediately.

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::CairnError;
use crate::generation::ToolSpec;
use crate::index::front_matter::{self, FrontMatter};
use crate::index::Indexer;
use crate::types::{ConfidenceTier, Source};
use crate::workspace::lock::{Actor, WorkspaceGuard};
use crate::workspace::{atomic_write, Workspace};

/// A fact to be stored. `source` and `category` are required; they are optional here
/// so a missing one surfaces as a validation error rather than a parse failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NewFact {
    #[schemars(description = "The fact, as one or a few plain sentences")]
    pub text: String,

    #[schemars(
        description = "Where the fact came from: 'user_stated', 'file', 'web_search', or 'heartbeat_discovery'"
    )]
    pub source: Option<Source>,

    #[schemars(description = "Category used to file the fact, e.g. 'family', 'home', 'work'")]
    pub category: Option<String>,

    #[schemars(description = "Declared confidence cap: 'low', 'medium', or 'high'")]
    pub confidence: Option<ConfidenceTier>,

    #[schemars(description = "Provenance detail such as a URL, task id, or session id")]
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredFact {
    /// First chunk of the fact file.
    pub chunk_id: String,
    pub file: String,
}

struct ValidFact {
    text: String,
    source: Source,
    category: String,
    confidence: Option<ConfidenceTier>,
    origin: Option<String>,
}

/// Reject incomplete facts before anything touches the disk.
fn validate(fact: NewFact) -> Result<ValidFact, CairnError> {
    let text = fact.text.trim().to_string();
    if text.is_empty() {
        return Err(CairnError::validation("fact text must not be empty"));
    }
    let source = fact
        .source
        .ok_or_else(|| CairnError::validation("fact source is required"))?;
    let category = fact
        .category
        .as_deref()
        .map(slugify)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| CairnError::validation("fact category is required"))?;
    Ok(ValidFact {
        text,
        source,
        category,
        confidence: fact.confidence,
        origin: fact.origin.filter(|o| !o.trim().is_empty()),
    })
}

pub const STORE_FACT_TOOL: &str = "store_fact";

/// The `store_fact` tool as offered to the generation backend.
pub fn store_fact_tool() -> ToolSpec {
    ToolSpec {
        name: STORE_FACT_TOOL.into(),
        description: "Store a new fact in long-term memory. Requires the fact text, its source, \
                      and a category."
            .into(),
        parameters: serde_json::to_value(schemars::schema_for!(NewFact)).unwrap_or_default(),
    }
}

/// Parse model-produced tool arguments. Malformed JSON is a validation failure.
pub fn parse_fact_arguments(arguments: &str) -> Result<NewFact, CairnError> {
    serde_json::from_str(arguments)
        .map_err(|e| CairnError::validation(format!("invalid store_fact arguments: {e}")))
}

/// Lowercase, `[a-z0-9-]` only, no leading/trailing or doubled dashes.
pub(crate) fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

#[derive(Clone)]
pub struct FactStore {
    workspace: Workspace,
    indexer: Indexer,
}

impl FactStore {
    pub fn new(workspace: Workspace, indexer: Indexer) -> Self {
        Self { workspace, indexer }
    }

    /// Interactive write: waits (bounded) for the workspace lock.
    pub async fn store(&self, fact: NewFact) -> Result<StoredFact> {
        let fact = validate(fact)?;
        let guard = self
            .workspace
            .acquire(Actor::Session, "fact-store")
            .await?;
        self.write_and_index(&guard, fact).await
    }

    /// Write under a guard the caller already holds (heartbeat tasks).
    pub async fn store_locked(&self, guard: &WorkspaceGuard, fact: NewFact) -> Result<StoredFact> {
        let fact = validate(fact)?;
        self.write_and_index(guard, fact).await
    }

    async fn write_and_index(&self, _guard: &WorkspaceGuard, fact: ValidFact) -> Result<StoredFact> {
        let now = chrono::Utc::now();
        let stem: String = slugify(&fact.text).chars().take(40).collect();
        let stem = stem.trim_end_matches('-');
        let id = uuid::Uuid::now_v7().simple().to_string();
        let file_name = format!(
            "{}-{}-{}.md",
            now.format("%Y%m%d"),
            if stem.is_empty() { "fact" } else { stem },
            &id[id.len() - 8..]
        );
        let path = self.workspace.facts_dir().join(&fact.category).join(file_name);

        let fm = FrontMatter {
            category: Some(fact.category.clone()),
            source: fact.source,
            confidence: fact.confidence,
            last_verified: Some(now.to_rfc3339()),
            origin: fact.origin,
        };
        let contents = format!("{}{}\n", front_matter::render(&fm), fact.text);
        atomic_write(&path, &contents)?;

        let rel = self
            .workspace
            .relative(&path)
            .context("fact path escaped the workspace")?;
        if let Err(e) = self.indexer.index_file(path.clone()).await {
            warn!(file = %rel, error = %e, "fact written but indexing failed; next reindex will pick it up");
            return Err(e);
        }
        let chunk_id = self
            .indexer
            .live_chunk_ids(rel.clone())
            .await?
            .into_iter()
            .next()
            .context("fact produced no chunks")?;

        info!(chunk_id = %chunk_id, file = %rel, source = %fact.source, "fact stored");
        Ok(StoredFact {
            chunk_id,
            file: rel,
        })
    }
}
