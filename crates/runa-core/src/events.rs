// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use runa_model::{ToolResultContent, UsageTotals};
use serde::{Deserialize, Serialize};

/// Events emitted by the engine during a prompt call.  Consumers (the ACP
/// adapter, tests) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A hidden chain-of-thought fragment streamed from the model.
    ReasoningDelta(String),
    /// A visible text fragment streamed from the model.
    ContentDelta(String),
    /// The model opened a new tool call; arguments may still be streaming.
    ToolCallStarted {
        id: String,
        name: String,
        kind: ToolKind,
    },
    /// A fragment of a tool call's JSON argument string.
    ToolCallArgumentsDelta { id: String, delta: String },
    /// A tool call finished (successfully or not).
    ToolCallFinished {
        id: String,
        name: String,
        content: ToolResultContent,
        is_error: bool,
        raw_output: Option<serde_json::Value>,
    },
    /// Token usage reported by the provider for the latest turn.
    TokenUsage(UsageTotals),
    /// History was compacted mid-loop.
    Compacted {
        tokens_before: u64,
        tokens_after: u64,
    },
    /// The engine finished processing the current prompt.
    TurnComplete { stop_reason: StopReason },
    /// The prompt was cancelled; the partial text was persisted.
    Aborted { partial_text: String },
    /// A recoverable error was surfaced into the conversation.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    Cancelled,
    MaxTurnsReached,
    Error,
}

/// Presentation category of a tool, advertised to clients so they can pick
/// an icon and a rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Read,
    Edit,
    Execute,
    Search,
    Move,
    Delete,
    Other,
}

/// Best-effort classification by tool name.  MCP servers advertise names,
/// not kinds, so this is a heuristic over common naming conventions.
pub fn classify_tool_kind(name: &str) -> ToolKind {
    let lowered = name.to_lowercase();
    let base = lowered.rsplit("__").next().unwrap_or(&lowered);
    if base.contains("delete") || base.contains("remove") || base.starts_with("rm") {
        ToolKind::Delete
    } else if base.contains("move") || base.contains("rename") {
        ToolKind::Move
    } else if base.contains("edit") || base.contains("write") || base.contains("patch")
        || base.contains("apply")
    {
        ToolKind::Edit
    } else if base.contains("search") || base.contains("grep") || base.contains("find")
        || base.contains("glob") || base.contains("query")
    {
        ToolKind::Search
    } else if base.contains("read") || base.contains("cat") || base.contains("list")
        || base.contains("fetch") || base.contains("get")
    {
        ToolKind::Read
    } else if base.contains("run") || base.contains("exec") || base.contains("shell")
        || base.contains("command") || base.contains("bash")
    {
        ToolKind::Execute
    } else {
        ToolKind::Other
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_tool_names() {
        assert_eq!(classify_tool_kind("read_file"), ToolKind::Read);
        assert_eq!(classify_tool_kind("edit_file"), ToolKind::Edit);
        assert_eq!(classify_tool_kind("apply_patch"), ToolKind::Edit);
        assert_eq!(classify_tool_kind("run_terminal_command"), ToolKind::Execute);
        assert_eq!(classify_tool_kind("grep"), ToolKind::Search);
        assert_eq!(classify_tool_kind("delete_file"), ToolKind::Delete);
        assert_eq!(classify_tool_kind("rename_symbol"), ToolKind::Move);
        assert_eq!(classify_tool_kind("echo"), ToolKind::Other);
    }

    #[test]
    fn classification_looks_past_server_prefix() {
        assert_eq!(classify_tool_kind("files__read_file"), ToolKind::Read);
        assert_eq!(classify_tool_kind("shell__exec"), ToolKind::Execute);
    }

    #[test]
    fn stop_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&StopReason::MaxTurnsReached).unwrap(),
            "\"max_turns_reached\""
        );
        assert_eq!(serde_json::to_string(&StopReason::EndTurn).unwrap(), "\"end_turn\"");
    }
}
