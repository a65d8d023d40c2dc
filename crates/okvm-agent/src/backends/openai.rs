use crate::config::ModelConfig;
use crate::model::{ModelClient, ModelReply, ModelRequest};
use async_trait::async_trait;
use futures_util::StreamExt;
use okvm_core::{Message, OkvmError, OkvmResult, Role, ToolCall};
use okvm_tools::ToolDescriptor;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// OpenAI chat-completions compatible backend.
///
/// Works with OpenAI and any server that implements the same API (vLLM,
/// Ollama, OpenRouter, ...). Responses are requested as server-sent events
/// and text deltas are forwarded as they arrive.
pub struct OpenAiCompatClient {
    config: ModelConfig,
    http: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn build_body(&self, request: &ModelRequest) -> Value {
        let mut body = json!({
            "model": self.config.model_id,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": build_messages(&request.system_prompt, &request.history),
            "stream": true,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(build_tools(&request.tools));
        }
        body
    }
}

/// Maps history onto chat-completions messages.
///
/// Consecutive assistant tool requests collapse into one assistant message
/// carrying all of their `tool_calls`, which is the shape the API expects.
pub fn build_messages(system_prompt: &str, history: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(history.len() + 1);
    if !system_prompt.is_empty() {
        out.push(json!({ "role": "system", "content": system_prompt }));
    }

    let mut pending_calls: Vec<Value> = Vec::new();
    let mut pending_text = String::new();
    let flush = |out: &mut Vec<Value>, calls: &mut Vec<Value>, text: &mut String| {
        if !calls.is_empty() {
            let content = if text.is_empty() {
                Value::Null
            } else {
                Value::String(std::mem::take(text))
            };
            out.push(json!({
                "role": "assistant",
                "content": content,
                "tool_calls": std::mem::take(calls),
            }));
        }
    };

    for m in history {
        if let (Role::Assistant, Some(call)) = (m.role, &m.tool_call) {
            if !m.content.is_empty() {
                pending_text.push_str(&m.content);
            }
            pending_calls.push(json!({
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.arguments.to_string(),
                }
            }));
            continue;
        }
        flush(&mut out, &mut pending_calls, &mut pending_text);
        match m.role {
            Role::System => continue,
            Role::User => out.push(json!({ "role": "user", "content": m.content })),
            Role::Assistant => out.push(json!({ "role": "assistant", "content": m.content })),
            Role::Tool => out.push(json!({
                "role": "tool",
                "tool_call_id": m.tool_call_id.as_deref().unwrap_or_default(),
                "content": m.content,
            })),
        }
    }
    flush(&mut out, &mut pending_calls, &mut pending_text);
    out
}

fn build_tools(tools: &[ToolDescriptor]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters_schema,
                }
            })
        })
        .collect()
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

fn finish_calls(calls: BTreeMap<u64, PartialCall>) -> Vec<ToolCall> {
    calls
        .into_values()
        .map(|c| ToolCall {
            id: c.id,
            name: c.name,
            arguments: if c.arguments.trim().is_empty() {
                json!({})
            } else {
                // Malformed argument JSON is passed through as a string so
                // the registry rejects it and the model gets to retry.
                serde_json::from_str(&c.arguments).unwrap_or(Value::String(c.arguments))
            },
        })
        .collect()
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    async fn complete(
        &self,
        request: ModelRequest,
        deltas: mpsc::Sender<String>,
    ) -> OkvmResult<ModelReply> {
        let url = format!("{}/v1/chat/completions", self.config.base_url());
        let body = self.build_body(&request);

        let mut builder = self.http.post(&url).json(&body);
        if let Some(key) = self.config.resolved_api_key() {
            builder = builder.bearer_auth(key);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| OkvmError::Model(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let error_body = resp
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(OkvmError::Model(format!(
                "API error {status}: {error_body}"
            )));
        }

        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();
        let mut text = String::new();
        let mut calls: BTreeMap<u64, PartialCall> = BTreeMap::new();

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| OkvmError::Model(format!("stream read error: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer.drain(..=line_end);

                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'read;
                }
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                if let Some(err) = event.get("error") {
                    return Err(OkvmError::Model(format!("stream error: {err}")));
                }
                let delta = &event["choices"][0]["delta"];

                if let Some(content) = delta["content"].as_str() {
                    if !content.is_empty() {
                        text.push_str(content);
                        // A closed receiver means the turn is being torn down.
                        let _ = deltas.send(content.to_string()).await;
                    }
                }
                if let Some(tc_array) = delta["tool_calls"].as_array() {
                    for tc in tc_array {
                        let idx = tc["index"].as_u64().unwrap_or(0);
                        let entry = calls.entry(idx).or_default();
                        if let Some(id) = tc["id"].as_str() {
                            entry.id = id.to_string();
                        }
                        if let Some(name) = tc["function"]["name"].as_str() {
                            entry.name.push_str(name);
                        }
                        if let Some(args) = tc["function"]["arguments"].as_str() {
                            entry.arguments.push_str(args);
                        }
                    }
                }
            }
        }

        if calls.is_empty() {
            Ok(ModelReply::Final(text))
        } else {
            Ok(ModelReply::ToolCalls {
                content: (!text.is_empty()).then_some(text),
                calls: finish_calls(calls),
            })
        }
    }

    fn name(&self) -> &str {
        &self.config.model_id
    }
}
