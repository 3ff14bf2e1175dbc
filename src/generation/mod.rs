//! Chat-completion backend interface.
//!
//! The daemon never does inference itself. [`GenerationBackend`] is the seam; the
//! production implementation talks to any OpenAI-compatible endpoint ([`openai`]).

pub mod openai;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as produced by the model.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Incremental output of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Text(String),
    ToolCall(ToolCall),
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn complete(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<Completion>;

    /// Stream a completion into `tx`. Returns once the completion is finished.
    ///
    /// The default implementation calls [`complete`](Self::complete) and replays the result.
    async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        tx: mpsc::Sender<GenerationEvent>,
    ) -> Result<()> {
        let completion = self.complete(messages, tools).await?;
        if !completion.text.is_empty() {
            let _ = tx.send(GenerationEvent::Text(completion.text)).await;
        }
        for call in completion.tool_calls {
            let _ = tx.send(GenerationEvent::ToolCall(call)).await;
        }
        Ok(())
    }
}

/// Create the configured backend.
pub fn create_backend(
    config: &crate::config::GenerationConfig,
) -> Result<std::sync::Arc<dyn GenerationBackend>> {
    Ok(std::sync::Arc::new(openai::OpenAiCompatBackend::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned;

    #[async_trait]
    impl GenerationBackend for Canned {
        async fn complete(&self, _m: &[Message], _t: &[ToolSpec]) -> Result<Completion> {
            Ok(Completion {
                text: "hi".into(),
                tool_calls: vec![ToolCall {
                    id: "c1".into(),
                    name: "store_fact".into(),
                    arguments: "{}".into(),
                }],
            })
        }
    }

    #[tokio::test]
    async fn default_stream_replays_completion() {
        let (tx, mut rx) = mpsc::channel(8);
        Canned.stream(&[Message::user("x")], &[], tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(GenerationEvent::Text("hi".into())));
        assert!(matches!(rx.recv().await, Some(GenerationEvent::ToolCall(c)) if c.name == "store_fact"));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn tool_result_message_carries_call_id() {
        let m = Message::tool_result("c1", "ok");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("c1"));
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["role"], "tool");
        assert!(json.get("tool_calls").is_none());
    }
}
