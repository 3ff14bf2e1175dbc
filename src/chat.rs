//! One chat turn: retrieve, then generate, streaming events back to the caller.
//!
//! Retrieval finishes before generation starts. Only verified results reach the model;
//! unverified candidates are never put in the prompt. The model may call `store_fact`,
//! which writes through the [`FactStore`] under the workspace lock. Cancelling a turn
//! aborts its task; the lock guard and index transactions unwind with it.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CairnError;
use crate::facts::{parse_fact_arguments, store_fact_tool, FactStore, STORE_FACT_TOOL};
use crate::generation::{GenerationBackend, GenerationEvent, Message, Role, ToolCall, ToolSpec};
use crate::retrieval::{Retriever, SearchResponse, SearchStatus, NO_VERIFIED_MESSAGE};
use crate::session::SessionManager;
use crate::types::ConfidenceTier;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    /// Extra persona instructions, appended after the built-in rules.
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub citation_tag: String,
    pub confidence_tier: ConfidenceTier,
    pub source_file: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Session {
        session_id: String,
    },
    Retrieval {
        status: SearchStatus,
        citations: Vec<Citation>,
        degraded: bool,
    },
    Text {
        delta: String,
    },
    Tool {
        name: String,
        ok: bool,
        detail: String,
    },
    Done {
        session_id: String,
    },
    Error {
        message: String,
    },
}

impl ChatEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Session { .. } => "session",
            Self::Retrieval { .. } => "retrieval",
            Self::Text { .. } => "text",
            Self::Tool { .. } => "tool",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

/// A running turn. Dropping the receiver does not stop generation; call [`cancel`](Self::cancel).
pub struct ChatTurn {
    pub session_id: String,
    pub events: mpsc::Receiver<ChatEvent>,
    handle: JoinHandle<()>,
}

impl ChatTurn {
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn abort_handle(&self) -> tokio::task::AbortHandle {
        self.handle.abort_handle()
    }

    /// Wait for the turn's task to end, whether it finished or was cancelled.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

#[derive(Clone)]
pub struct ChatService {
    retriever: Retriever,
    sessions: Arc<SessionManager>,
    facts: FactStore,
    backend: Arc<dyn GenerationBackend>,
    max_tool_rounds: usize,
}

impl ChatService {
    pub fn new(
        retriever: Retriever,
        sessions: Arc<SessionManager>,
        facts: FactStore,
        backend: Arc<dyn GenerationBackend>,
        max_tool_rounds: usize,
    ) -> Self {
        Self {
            retriever,
            sessions,
            facts,
            backend,
            max_tool_rounds,
        }
    }

    /// Start a turn on its own task.
    pub fn start(&self, request: ChatRequest) -> ChatTurn {
        let session_id = self.sessions.ensure(request.session_id.as_deref());
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let service = self.clone();
        let id = session_id.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = service.run_turn(&id, &request, &tx).await {
                warn!(session_id = %id, error = %e, "chat turn failed");
                let _ = tx
                    .send(ChatEvent::Error {
                        message: user_facing_error(&e),
                    })
                    .await;
            }
        });

        ChatTurn {
            session_id,
            events,
            handle,
        }
    }

    /// Run a turn to completion and collect every event.
    pub async fn run(&self, request: ChatRequest) -> Vec<ChatEvent> {
        let mut turn = self.start(request);
        let mut events = Vec::new();
        while let Some(event) = turn.events.recv().await {
            events.push(event);
        }
        events
    }

    async fn run_turn(
        &self,
        session_id: &str,
        request: &ChatRequest,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> Result<()> {
        emit(
            tx,
            ChatEvent::Session {
                session_id: session_id.to_string(),
            },
        )
        .await;

        let found = self.retriever.search(&request.message, None).await?;
        emit(
            tx,
            ChatEvent::Retrieval {
                status: found.status,
                citations: found
                    .results
                    .iter()
                    .map(|r| Citation {
                        citation_tag: r.citation_tag.clone(),
                        confidence_tier: r.confidence_tier,
                        source_file: r.source_file.clone(),
                    })
                    .collect(),
                degraded: found.degraded,
            },
        )
        .await;

        self.sessions
            .append_message(session_id, Role::User, &request.message)
            .await?;
        let prompt = self
            .sessions
            .build_context(session_id, request.context.as_deref())?;
        let mut messages = prompt.to_messages();
        // Verified context sits right before the user's latest message.
        let at = messages.len().saturating_sub(1);
        messages.insert(at, Message::system(verified_context(&found)));

        let tools = [store_fact_tool()];
        let mut reply = String::new();
        for round in 0..=self.max_tool_rounds {
            let offered: &[ToolSpec] = if round < self.max_tool_rounds { &tools } else { &[] };
            let (text, calls) = self.generate(&messages, offered, tx).await?;
            reply.push_str(&text);
            if calls.is_empty() {
                break;
            }

            let mut assistant = Message::assistant(text);
            assistant.tool_calls = calls.clone();
            messages.push(assistant);
            for call in calls {
                let outcome = self.call_tool(session_id, &call).await;
                let (ok, detail) = match outcome {
                    Ok(detail) => (true, detail),
                    Err(e) => (false, format!("{e:#}")),
                };
                emit(
                    tx,
                    ChatEvent::Tool {
                        name: call.name.clone(),
                        ok,
                        detail: detail.clone(),
                    },
                )
                .await;
                messages.push(Message::tool_result(call.id, detail));
            }
        }

        self.sessions
            .append_message(session_id, Role::Assistant, &reply)
            .await?;
        emit(
            tx,
            ChatEvent::Done {
                session_id: session_id.to_string(),
            },
        )
        .await;
        info!(session_id = %session_id, chars = reply.len(), "chat turn complete");
        Ok(())
    }

    /// One streamed generation call. Text deltas are forwarded as they arrive.
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        tx: &mpsc::Sender<ChatEvent>,
    ) -> Result<(String, Vec<ToolCall>)> {
        let (gen_tx, mut gen_rx) = mpsc::channel(EVENT_BUFFER);
        let mut text = String::new();
        let mut calls = Vec::new();

        let stream = self.backend.stream(messages, tools, gen_tx);
        let forward = async {
            while let Some(event) = gen_rx.recv().await {
                match event {
                    GenerationEvent::Text(delta) => {
                        text.push_str(&delta);
                        emit(tx, ChatEvent::Text { delta }).await;
                    }
                    GenerationEvent::ToolCall(call) => calls.push(call),
                }
            }
        };
        let (result, ()) = tokio::join!(stream, forward);
        result?;
        Ok((text, calls))
    }

    async fn call_tool(&self, session_id: &str, call: &ToolCall) -> Result<String> {
        if call.name != STORE_FACT_TOOL {
            anyhow::bail!("unknown tool: {}", call.name);
        }
        let mut fact = parse_fact_arguments(&call.arguments)?;
        fact.origin
            .get_or_insert_with(|| format!("session:{session_id}"));
        let stored = self.facts.store(fact).await?;
        debug!(chunk_id = %stored.chunk_id, "fact stored from chat");
        Ok(serde_json::to_string(&stored)?)
    }
}

async fn emit(tx: &mpsc::Sender<ChatEvent>, event: ChatEvent) {
    // A closed receiver means nobody is listening; the turn still completes.
    let _ = tx.send(event).await;
}

/// The context block handed to the model. Verified results only.
fn verified_context(found: &SearchResponse) -> String {
    if found.results.is_empty() {
        return format!(
            "Verified context: {NO_VERIFIED_MESSAGE}. Do not answer factual questions from \
             memory; say that no verified information was found."
        );
    }
    let mut block = String::from("Verified context:\n");
    for r in &found.results {
        block.push_str(&format!(
            "- {} ({}, {}) {}\n",
            r.citation_tag,
            r.confidence_tier,
            r.source_file,
            r.text.trim()
        ));
    }
    if found.degraded {
        block.push_str("(semantic search unavailable; results are lexical matches only)\n");
    }
    block
}

fn user_facing_error(e: &anyhow::Error) -> String {
    match e.downcast_ref::<CairnError>() {
        Some(typed) => typed.to_string(),
        None => format!("{e:#}"),
    }
}
