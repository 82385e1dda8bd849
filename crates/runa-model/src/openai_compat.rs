// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-compatible `/chat/completions` streaming client.
//!
//! One POST per turn with `stream: true`; the response is an SSE byte
//! stream whose `data:` lines carry content, reasoning, and tool-call
//! deltas plus a final usage chunk (requested via
//! `stream_options.include_usage`) and the `[DONE]` sentinel.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::EventStream, ChatProvider, CompletionRequest, Message, MessageContent, ModelError,
    StreamEvent, UsageTotals,
};

pub struct OpenAiCompatProvider {
    model: String,
    api_key: Option<String>,
    chat_url: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// `base_url` ends before `/chat/completions`,
    /// e.g. `https://api.openai.com/v1`.
    pub fn new(base_url: &str, model: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            model: model.into(),
            api_key,
            chat_url: format!("{base}/chat/completions"),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn from_config(cfg: &runa_config::ProviderConfig) -> Self {
        Self::new(
            &cfg.base_url,
            cfg.model.clone(),
            cfg.resolve_api_key(),
            Duration::from_secs(cfg.timeout_s),
        )
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compat"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<EventStream, ModelError> {
        let model = if req.model.is_empty() { self.model.as_str() } else { req.model.as_str() };
        let messages = build_wire_messages(&req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(m) = req.max_tokens {
            body["max_tokens"] = json!(m);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        // Gateways that honour prompt_cache_key pin every turn of a session
        // to the same cached KV prefix.
        if let Some(key) = &req.cache_key {
            body["prompt_cache_key"] = json!(key);
        }

        debug!(
            model,
            tool_count = tools.len(),
            message_count = req.messages.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status, retry_after, &text));
        }

        // SSE events can be split across TCP packets.  Maintain a line
        // buffer across chunks; emit events only for complete lines.
        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<Result<StreamEvent, ModelError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(ModelError::Transport(e.to_string()))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

// ─── SSE parsing ─────────────────────────────────────────────────────────────

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<Result<StreamEvent, ModelError>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(Ok(ev));
        }
    }
    events
}

/// Parse a single complete SSE `data:` line into a [`StreamEvent`].
///
/// Returns `None` for empty lines, comments, and unparseable data.
fn parse_sse_data_line(line: &str) -> Option<StreamEvent> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(StreamEvent::Done);
    }
    let v: Value = serde_json::from_str(data).ok()?;
    parse_sse_chunk(&v)
}

fn parse_sse_chunk(v: &Value) -> Option<StreamEvent> {
    // Usage-only chunk (stream_options.include_usage).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        let prompt = usage["prompt_tokens"].as_u64().unwrap_or(0);
        let completion = usage["completion_tokens"].as_u64().unwrap_or(0);
        let total = usage["total_tokens"].as_u64().unwrap_or(prompt + completion);
        return Some(StreamEvent::Usage(UsageTotals {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        }));
    }

    let delta = &v["choices"][0]["delta"];

    // Tool-call delta.  Each SSE chunk carries one tool-call fragment in
    // practice; the `index` field routes accumulation for parallel calls.
    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return Some(StreamEvent::ToolCallDelta {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
        });
    }

    // Reasoning delta — `reasoning_content` (llama.cpp, Qwen, DeepSeek) with
    // `reasoning` (OpenRouter-style aggregators) as the fallback name.
    let reasoning = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(text) = reasoning.filter(|t| !t.is_empty()) {
        return Some(StreamEvent::ReasoningDelta(text.to_string()));
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            return Some(StreamEvent::ContentDelta(text.to_string()));
        }
    }

    None
}

// ─── Wire message building ───────────────────────────────────────────────────

/// Convert provider-native messages to the OpenAI wire-format JSON array.
///
/// **Parallel tool-call coalescing**: the wire format requires all tool
/// calls of one assistant turn inside a *single* assistant message as a
/// `tool_calls` array.  runa's logical history carries one `ToolCall`
/// message per call, so consecutive runs are merged here.
pub(crate) fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    fn tool_call_json(id: &str, function: &crate::FunctionCall) -> Value {
        json!({
            "id": id,
            "type": "function",
            "function": { "name": function.name, "arguments": function.arguments }
        })
    }

    let mut result: Vec<Value> = Vec::with_capacity(messages.len());
    let mut i = 0;

    while i < messages.len() {
        let m = &messages[i];

        if let MessageContent::ToolCall { tool_call_id, function } = &m.content {
            let mut calls = vec![tool_call_json(tool_call_id, function)];
            i += 1;
            while i < messages.len() {
                if let MessageContent::ToolCall { tool_call_id, function } = &messages[i].content {
                    calls.push(tool_call_json(tool_call_id, function));
                    i += 1;
                } else {
                    break;
                }
            }
            result.push(json!({ "role": "assistant", "tool_calls": calls }));
            continue;
        }

        let v = match &m.content {
            MessageContent::Text(t) => json!({ "role": m.role.as_str(), "content": t }),
            MessageContent::ToolResult { tool_call_id, content } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content.to_string(),
            }),
            MessageContent::ToolCall { .. } => unreachable!("handled above"),
        };
        result.push(v);
        i += 1;
    }

    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
