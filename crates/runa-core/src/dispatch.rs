// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use runa_model::{ToolResultContent, ToolSchema};

/// The outcome of one tool dispatch.  Dispatch never fails at the type
/// level: every failure mode is folded into an error outcome whose content
/// describes it, so one failing tool cannot take down its peers.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: ToolResultContent,
    pub is_error: bool,
    /// Raw server payload for clients that want it verbatim.
    pub raw_output: Option<serde_json::Value>,
}

impl ToolOutcome {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: ToolResultContent::Text(content.into()), is_error: false, raw_output: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { content: ToolResultContent::Text(message.into()), is_error: true, raw_output: None }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw_output = Some(raw);
        self
    }
}

/// A finished tool call: the call identity plus its outcome.
#[derive(Debug, Clone)]
pub struct CompletedTool {
    pub call_id: String,
    pub name: String,
    pub outcome: ToolOutcome,
}

/// The engine's seam to the tool protocol.  The MCP client implements this
/// for real servers; tests script it.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// The tool catalog in provider-native shape.
    fn catalog(&self) -> Vec<ToolSchema>;

    /// Execute one tool call.  Implementations map every failure to an
    /// error outcome rather than returning `Err`.
    async fn dispatch(&self, name: &str, arguments: &serde_json::Value) -> ToolOutcome;
}

/// Dispatcher for sessions created without tool servers.
pub struct NullDispatcher;

#[async_trait]
impl ToolDispatcher for NullDispatcher {
    fn catalog(&self) -> Vec<ToolSchema> {
        Vec::new()
    }

    async fn dispatch(&self, name: &str, _arguments: &serde_json::Value) -> ToolOutcome {
        ToolOutcome::error(format!("no tool server provides '{name}'"))
    }
}

/// Cut an oversized tool result at a line boundary, appending an explicit
/// omission notice so the model knows more content exists.  `cap_tokens` of
/// zero disables truncation.
pub fn truncate_tool_result(content: &str, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = cap_tokens * 4;
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let omitted_bytes = content.len() - cap_chars;
    let cut = content[..cap_chars].rfind('\n').map(|p| p + 1).unwrap_or(cap_chars);
    format!(
        "{}\n[... {omitted_bytes} bytes omitted; output truncated to fit the context budget ...]",
        &content[..cut]
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_dispatcher_has_empty_catalog_and_errors() {
        let d = NullDispatcher;
        assert!(d.catalog().is_empty());
        let out = d.dispatch("anything", &serde_json::json!({})).await;
        assert!(out.is_error);
        assert!(out.content.to_string().contains("anything"));
    }

    #[test]
    fn truncate_returns_original_when_under_cap() {
        assert_eq!(truncate_tool_result("short", 100), "short");
    }

    #[test]
    fn truncate_zero_cap_disables() {
        let long = "x".repeat(10_000);
        assert_eq!(truncate_tool_result(&long, 0), long);
    }

    #[test]
    fn truncate_cuts_at_line_boundary_with_notice() {
        let content = format!("{}\n{}", "a".repeat(10), "b".repeat(100));
        let out = truncate_tool_result(&content, 5); // 20-char cap
        assert!(!out.contains("bbb"));
        assert!(out.contains("omitted"));
    }

    #[test]
    fn truncate_hard_cuts_when_no_newline() {
        let content = "x".repeat(1000);
        let out = truncate_tool_result(&content, 10); // 40-char cap
        let kept = out.chars().take_while(|&c| c == 'x').count();
        assert_eq!(kept, 40);
        assert!(out.contains("omitted"));
    }
}
