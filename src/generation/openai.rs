//! OpenAI-compatible `/chat/completions` backend.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM, and anything else that speaks the same
//! wire format. Streaming reads the SSE body chunk by chunk, forwards text deltas as
//! they arrive, and accumulates tool-call deltas until the stream ends.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{Completion, GenerationBackend, GenerationEvent, Message, ToolCall, ToolSpec};
use crate::config::GenerationConfig;
use crate::error::CairnError;

pub struct OpenAiCompatBackend {
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatBackend {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout,
            client,
        })
    }

    fn body(&self, messages: &[Message], tools: &[ToolSpec], stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": to_api_messages(messages),
            "stream": stream,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::json!(to_api_tools(tools));
        }
        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request.send().await.map_err(|e| self.map_err(e))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %error_body, "generation backend returned error");
            anyhow::bail!("generation backend returned {status}: {error_body}");
        }
        Ok(response)
    }

    fn map_err(&self, e: reqwest::Error) -> anyhow::Error {
        if e.is_timeout() {
            CairnError::Timeout {
                step: "generation".into(),
                after: self.timeout,
            }
            .into()
        } else {
            anyhow::Error::new(e).context("generation request failed")
        }
    }
}

#[async_trait]
impl GenerationBackend for OpenAiCompatBackend {
    async fn complete(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<Completion> {
        debug!(model = %self.model, messages = messages.len(), "sending completion request");
        let response = self.send(&self.body(messages, tools, false)).await?;
        let api: ApiResponse = response
            .json()
            .await
            .map_err(|e| self.map_err(e))?;
        let choice = api
            .choices
            .into_iter()
            .next()
            .context("no choices in generation response")?;

        Ok(Completion {
            text: choice.message.content.unwrap_or_default(),
            tool_calls: choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments: tc.function.arguments,
                })
                .collect(),
        })
    }

    async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        tx: mpsc::Sender<GenerationEvent>,
    ) -> Result<()> {
        debug!(model = %self.model, messages = messages.len(), "sending streaming request");
        let mut response = self.send(&self.body(messages, tools, true)).await?;
        let mut parser = SseParser::default();

        while let Some(bytes) = response.chunk().await.map_err(|e| self.map_err(e))? {
            for text in parser.push(&String::from_utf8_lossy(&bytes)) {
                if tx.send(GenerationEvent::Text(text)).await.is_err() {
                    // Receiver dropped: the turn was cancelled.
                    return Ok(());
                }
            }
            if parser.done {
                break;
            }
        }

        for call in parser.finish() {
            let _ = tx.send(GenerationEvent::ToolCall(call)).await;
        }
        Ok(())
    }
}

/// Line-buffered parser for `data: {...}` SSE frames.
#[derive(Default)]
struct SseParser {
    buffer: String,
    tool_calls: BTreeMap<u32, ToolCall>,
    done: bool,
}

impl SseParser {
    /// Feed raw text; returns the content deltas completed by it.
    fn push(&mut self, raw: &str) -> Vec<String> {
        self.buffer.push_str(raw);
        let mut texts = Vec::new();

        while let Some(line_end) = self.buffer.find('\n') {
            let line = self.buffer[..line_end].trim_end_matches('\r').to_string();
            self.buffer.drain(..=line_end);

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                break;
            }
            match serde_json::from_str::<StreamResponse>(data) {
                Ok(chunk) => {
                    for choice in chunk.choices {
                        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                            texts.push(content);
                        }
                        for delta in choice.delta.tool_calls.unwrap_or_default() {
                            let acc = self.tool_calls.entry(delta.index).or_insert_with(|| ToolCall {
                                id: String::new(),
                                name: String::new(),
                                arguments: String::new(),
                            });
                            if let Some(id) = delta.id {
                                acc.id = id;
                            }
                            if let Some(function) = delta.function {
                                if let Some(name) = function.name {
                                    acc.name = name;
                                }
                                if let Some(args) = function.arguments {
                                    acc.arguments.push_str(&args);
                                }
                            }
                        }
                    }
                }
                Err(e) => trace!(data = %data, error = %e, "ignoring unparseable SSE chunk"),
            }
        }
        texts
    }

    /// Accumulated tool calls, in index order.
    fn finish(self) -> Vec<ToolCall> {
        self.tool_calls
            .into_values()
            .filter(|c| !c.name.is_empty())
            .collect()
    }
}

fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
    messages
        .iter()
        .map(|m| ApiMessage {
            role: m.role.as_str().to_string(),
            content: Some(m.content.clone()),
            tool_calls: if m.tool_calls.is_empty() {
                None
            } else {
                Some(
                    m.tool_calls
                        .iter()
                        .map(|tc| ApiToolCall {
                            id: tc.id.clone(),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: tc.name.clone(),
                                arguments: tc.arguments.clone(),
                            },
                        })
                        .collect(),
                )
            },
            tool_call_id: m.tool_call_id.clone(),
        })
        .collect()
}

fn to_api_tools(tools: &[ToolSpec]) -> Vec<ApiToolDefinition> {
    tools
        .iter()
        .map(|t| ApiToolDefinition {
            r#type: "function".into(),
            function: ApiToolFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

// --- wire types ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::Role;

    #[test]
    fn sse_parser_handles_split_lines_and_done() {
        let mut p = SseParser::default();
        let mut texts = p.push("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\ndata: {\"choi");
        texts.extend(p.push("ces\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n: keep-alive\n"));
        assert_eq!(texts, vec!["Hel", "lo"]);
        assert!(!p.done);

        assert!(p.push("data: [DONE]\n").is_empty());
        assert!(p.done);
    }

    #[test]
    fn sse_parser_accumulates_tool_call_deltas() {
        let mut p = SseParser::default();
        p.push(concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"store_fact\",\"arguments\":\"{\\\"text\\\":\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"x\\\"}\"}}]}}]}\n",
        ));
        let calls = p.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "store_fact");
        assert_eq!(calls[0].arguments, "{\"text\":\"x\"}");
    }

    #[test]
    fn api_messages_carry_tool_fields() {
        let mut assistant = Message::assistant("");
        assistant.tool_calls.push(ToolCall {
            id: "c1".into(),
            name: "store_fact".into(),
            arguments: "{}".into(),
        });
        let api = to_api_messages(&[assistant, Message::tool_result("c1", "stored")]);
        assert_eq!(api[0].role, Role::Assistant.as_str());
        assert_eq!(api[0].tool_calls.as_ref().unwrap()[0].function.name, "store_fact");
        assert_eq!(api[1].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn body_includes_tools_only_when_present() {
        let backend = OpenAiCompatBackend::new(&GenerationConfig::default()).unwrap();
        let body = backend.body(&[Message::user("hi")], &[], true);
        assert_eq!(body["stream"], true);
        assert!(body.get("tools").is_none());
    }
}
