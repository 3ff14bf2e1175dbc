//! Default task runner: one grounded generation turn per task.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{HeartbeatTask, TaskRunner};
use crate::facts::{parse_fact_arguments, store_fact_tool, FactStore, STORE_FACT_TOOL};
use crate::generation::{GenerationBackend, Message};
use crate::retrieval::{Retriever, NO_VERIFIED_MESSAGE};
use crate::types::Source;
use crate::workspace::lock::WorkspaceGuard;
use crate::workspace::{Workspace, SOUL_FILE};

const TASK_INSTRUCTIONS: &str = "You are running a scheduled background task for a personal \
assistant. Use only the verified context below. If you learn something worth remembering, \
call store_fact with its source and category. Reply with a one-line summary of what you did.";

pub struct AgentTaskRunner {
    workspace: Workspace,
    retriever: Retriever,
    facts: FactStore,
    backend: Arc<dyn GenerationBackend>,
}

impl AgentTaskRunner {
    pub fn new(
        workspace: Workspace,
        retriever: Retriever,
        facts: FactStore,
        backend: Arc<dyn GenerationBackend>,
    ) -> Self {
        Self {
            workspace,
            retriever,
            facts,
            backend,
        }
    }
}

#[async_trait]
impl TaskRunner for AgentTaskRunner {
    async fn run(&self, task: &HeartbeatTask, guard: &WorkspaceGuard) -> Result<String> {
        let found = self.retriever.search(&task.description, None).await?;
        let soul = self.workspace.read_optional(SOUL_FILE)?.unwrap_or_default();

        let mut context = String::new();
        for r in &found.results {
            context.push_str(&format!(
                "- {} {} ({})\n",
                r.citation_tag,
                r.text.trim(),
                r.confidence_tier
            ));
        }
        if context.is_empty() {
            context.push_str(found.message.as_deref().unwrap_or(NO_VERIFIED_MESSAGE));
        }

        let messages = [
            Message::system(format!("{TASK_INSTRUCTIONS}\n\n{soul}")),
            Message::user(format!(
                "Task ({}): {}\n\nVerified context:\n{context}",
                task.section, task.description
            )),
        ];
        let completion = self
            .backend
            .complete(&messages, &[store_fact_tool()])
            .await?;

        let mut stored = 0usize;
        for call in completion.tool_calls {
            if call.name != STORE_FACT_TOOL {
                warn!(tool = %call.name, task_id = %task.id, "ignoring unknown tool call");
                continue;
            }
            let mut fact = parse_fact_arguments(&call.arguments)?;
            fact.source.get_or_insert(Source::HeartbeatDiscovery);
            fact.origin.get_or_insert_with(|| format!("heartbeat:{}", task.id));
            let saved = self.facts.store_locked(guard, fact).await?;
            debug!(chunk_id = %saved.chunk_id, task_id = %task.id, "task stored a fact");
            stored += 1;
        }

        let summary = completion.text.lines().next().unwrap_or("").trim().to_string();
        Ok(match (summary.is_empty(), stored) {
            (true, 0) => String::new(),
            (true, n) => format!("stored {n} fact(s)"),
            (false, 0) => summary,
            (false, n) => format!("{summary} (stored {n} fact(s))"),
        })
    }
}
