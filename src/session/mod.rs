//! Per-conversation state: message history, context assembly, and compaction.
//!
//! Sessions live in memory only. `save` writes a transcript section into today's daily
//! log under the workspace lock; `discard` drops the session without a trace.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::generation::{GenerationBackend, Message, Role};
use crate::index::chunker::{estimate_tokens, CHARS_PER_TOKEN};
use crate::workspace::lock::Actor;
use crate::workspace::{Workspace, MEMORY_FILE, SOUL_FILE};

/// Fixed rules that head every prompt. Caller context is appended after these, never
/// in place of them.
pub const BASE_INSTRUCTIONS: &str = "You are a personal assistant with a verified memory. \
Answer only from the verified context you are given and cite it with its [VERIFIED:xxxxxxxx] \
tag. If the verified context does not contain the answer, say \"no verified information \
found\" instead of guessing. Never present unverified content as fact. When the user tells \
you something worth remembering, call store_fact with its source and category.";

const SUMMARY_PREFIX: &str = "Summary of earlier conversation:";
const EXTRACTIVE_LINE_CHARS: usize = 160;

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    pub token_budget_used: usize,
    pub compaction_count: u32,
    pub created_at: String,
}

impl Session {
    fn new() -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            messages: Vec::new(),
            token_budget_used: 0,
            compaction_count: 0,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn recount(&mut self) {
        self.token_budget_used = self
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum();
    }
}

/// An assembled prompt: the system block followed by the session history.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub history: Vec<Message>,
}

impl Prompt {
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        messages.push(Message::system(self.system.clone()));
        messages.extend(self.history.iter().cloned());
        messages
    }
}

pub struct SessionManager {
    workspace: Workspace,
    backend: Arc<dyn GenerationBackend>,
    config: SessionConfig,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(
        workspace: Workspace,
        backend: Arc<dyn GenerationBackend>,
        config: SessionConfig,
    ) -> Self {
        Self {
            workspace,
            backend,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_session(&self) -> Session {
        let session = Session::new();
        debug!(session_id = %session.id, "session created");
        self.sessions().insert(session.id.clone(), session.clone());
        session
    }

    /// Resume `id` if it is live, otherwise start a new session. Returns the session id.
    pub fn ensure(&self, id: Option<&str>) -> String {
        if let Some(id) = id {
            if self.sessions().contains_key(id) {
                return id.to_string();
            }
            debug!(session_id = %id, "unknown session id, starting a new session");
        }
        self.create_session().id
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions().get(id).cloned()
    }

    /// Append a message and compact the history if it went over budget.
    pub async fn append_message(&self, id: &str, role: Role, text: &str) -> Result<()> {
        let over_budget = {
            let mut sessions = self.sessions();
            let session = sessions
                .get_mut(id)
                .with_context(|| format!("unknown session: {id}"))?;
            session.messages.push(Message::new(role, text));
            session.recount();
            session.token_budget_used > self.config.token_budget
        };
        if over_budget {
            self.compact(id).await?;
        }
        Ok(())
    }

    /// Replace all but the most recent messages with one summary entry.
    ///
    /// The kept tail shrinks below `keep_recent` when it alone would fill more than half
    /// the budget, and the summary is clipped to a quarter of it, so one compaction
    /// leaves room for further turns. Nothing happens when the only message before the
    /// tail is the previous summary.
    pub async fn compact(&self, id: &str) -> Result<()> {
        let budget = self.config.token_budget;
        let older: Vec<Message> = {
            let sessions = self.sessions();
            let session = sessions
                .get(id)
                .with_context(|| format!("unknown session: {id}"))?;
            let keep = kept_tail(&session.messages, self.config.keep_recent, budget);
            let split = session.messages.len() - keep;
            let older = &session.messages[..split];
            if older.is_empty() || (older.len() == 1 && is_summary(&older[0])) {
                debug!(session_id = %id, keep, "nothing new to compact");
                return Ok(());
            }
            older.to_vec()
        };

        let summary = match self.summarize(&older).await {
            Ok(s) if !s.trim().is_empty() => s,
            Ok(_) => extractive_summary(&older),
            Err(e) => {
                warn!(session_id = %id, error = %e, "summarizer failed, using extractive summary");
                extractive_summary(&older)
            }
        };

        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(id)
            .with_context(|| format!("session {id} ended during compaction"))?;
        let n = older.len().min(session.messages.len());
        session.messages.drain(..n);
        let summary = clip_to_tokens(summary.trim(), (budget / 4).max(1));
        session
            .messages
            .insert(0, Message::system(format!("{SUMMARY_PREFIX}\n{summary}")));
        session.compaction_count += 1;
        session.recount();
        info!(
            session_id = %id,
            replaced = n,
            compaction_count = session.compaction_count,
            tokens = session.token_budget_used,
            "session compacted"
        );
        Ok(())
    }

    async fn summarize(&self, messages: &[Message]) -> Result<String> {
        let prompt = [
            Message::system(
                "Summarize this conversation in a few short bullet points. Keep names, dates, \
                 decisions, and any [VERIFIED:...] tags exactly as written.",
            ),
            Message::user(transcript(messages)),
        ];
        Ok(self.backend.complete(&prompt, &[]).await?.text)
    }

    /// Assemble the prompt: instructions (plus caller context), long-term knowledge,
    /// personality, recent daily logs newest first, then the history.
    pub fn build_context(&self, id: &str, context: Option<&str>) -> Result<Prompt> {
        let history = self
            .get(id)
            .with_context(|| format!("unknown session: {id}"))?
            .messages;

        let mut system = String::from(BASE_INSTRUCTIONS);
        if let Some(extra) = context.map(str::trim).filter(|c| !c.is_empty()) {
            system.push_str("\n\n## Additional instructions\n");
            system.push_str(extra);
        }
        if let Some(memory) = self.workspace.read_optional(MEMORY_FILE)? {
            system.push_str("\n\n## Long-term memory\n");
            system.push_str(memory.trim());
        }
        if let Some(soul) = self.workspace.read_optional(SOUL_FILE)? {
            system.push_str("\n\n## Personality\n");
            system.push_str(soul.trim());
        }
        for (date, path) in self.workspace.recent_daily_logs(self.config.recent_daily_logs)? {
            match std::fs::read_to_string(&path) {
                Ok(log) => {
                    system.push_str(&format!("\n\n## Daily log {}\n", date.format("%Y-%m-%d")));
                    system.push_str(log.trim());
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable daily log"),
            }
        }

        Ok(Prompt { system, history })
    }

    /// Write the transcript to today's daily log and end the session.
    ///
    /// An empty session is removed without writing. Returns the log path when written.
    pub async fn save(&self, id: &str) -> Result<Option<PathBuf>> {
        let session = self
            .get(id)
            .with_context(|| format!("unknown session: {id}"))?;
        if session.messages.is_empty() {
            self.sessions().remove(id);
            return Ok(None);
        }

        let guard = self.workspace.acquire(Actor::Session, id).await?;
        let now = Local::now();
        let section = format!(
            "## Session {} ({})\n{}",
            &session.id[session.id.len().saturating_sub(8)..],
            now.format("%H:%M"),
            transcript(&session.messages)
        );
        let path = self
            .workspace
            .append_daily_log(&guard, now.date_naive(), &section)?;
        drop(guard);

        self.sessions().remove(id);
        info!(session_id = %id, path = %path.display(), "session saved");
        Ok(Some(path))
    }

    /// End the session without writing anything.
    pub fn discard(&self, id: &str) -> bool {
        let removed = self.sessions().remove(id).is_some();
        if removed {
            debug!(session_id = %id, "session discarded");
        }
        removed
    }
}

fn transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        out.push_str(&format!("**{}:** {}\n", m.role.as_str(), m.content.trim()));
    }
    out
}

fn is_summary(message: &Message) -> bool {
    message.role == Role::System && message.content.starts_with(SUMMARY_PREFIX)
}

/// Number of trailing messages to keep: at most `keep_recent`, shrunk (down to one) until
/// the tail fits in half the budget.
fn kept_tail(messages: &[Message], keep_recent: usize, budget: usize) -> usize {
    let mut keep = keep_recent.min(messages.len());
    let tail_tokens = |k: usize| -> usize {
        messages[messages.len() - k..]
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum()
    };
    while keep > 1 && tail_tokens(keep) > budget / 2 {
        keep -= 1;
    }
    keep
}

fn clip_to_tokens(text: &str, tokens: usize) -> String {
    let max_bytes = tokens * CHARS_PER_TOKEN;
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Fallback summary: the first sentence of each message, trimmed.
fn extractive_summary(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| {
            let content = m.content.trim();
            let first = content
                .split_inclusive(['.', '!', '?', '\n'])
                .next()
                .unwrap_or(content)
                .trim();
            let clipped: String = first.chars().take(EXTRACTIVE_LINE_CHARS).collect();
            format!("- {}: {}", m.role.as_str(), clipped)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
