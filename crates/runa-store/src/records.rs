// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use runa_model::{Role, ToolSchema};

/// Sampling and compaction parameters persisted per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Output-token headroom subtracted from the context budget.
    pub reserve_tokens: Option<u64>,
    pub compaction_threshold: u64,
    pub compaction_keep_head: usize,
    pub compaction_keep_tail: usize,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            temperature: None,
            top_p: None,
            max_tokens: None,
            reserve_tokens: None,
            compaction_threshold: 150_000,
            compaction_keep_head: 2,
            compaction_keep_tail: 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// One persisted session row.  `session_id` never changes, not even across
/// compactions.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub prompt_id: String,
    pub prompt_args: serde_json::Value,
    /// Rendered system prompt, deterministic from `(prompt_id, prompt_args)`.
    pub system_prompt: String,
    pub tool_definitions: Vec<ToolSchema>,
    pub request_params: RequestParams,
    pub model_identifier: String,
    pub workspace_path: String,
    pub mode: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One persisted conversation event.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub id: i64,
    pub session_id: String,
    pub conv_index: i64,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_call_name: Option<String>,
    pub tool_arguments: Option<serde_json::Value>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

impl EventRecord {
    /// The tool-call list carried by an assistant event, if any.
    /// Stored as a JSON array of `{id, name, arguments}` objects.
    pub fn tool_calls(&self) -> Vec<(String, String, serde_json::Value)> {
        let Some(serde_json::Value::Array(items)) = &self.tool_arguments else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| {
                Some((
                    item.get("id")?.as_str()?.to_string(),
                    item.get("name")?.as_str()?.to_string(),
                    item.get("arguments").cloned().unwrap_or(serde_json::Value::Null),
                ))
            })
            .collect()
    }
}

/// Fields for an event about to be appended; the store assigns id,
/// `conv_index`, and the timestamp.
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub role: Option<Role>,
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_call_name: Option<String>,
    pub tool_arguments: Option<serde_json::Value>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

impl NewEvent {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Some(Role::User), content: Some(text.into()), ..Default::default() }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Some(Role::System), content: Some(text.into()), ..Default::default() }
    }

    /// An assistant event carrying visible text and/or hidden reasoning.
    pub fn assistant(content: Option<String>, reasoning: Option<String>) -> Self {
        Self {
            role: Some(Role::Assistant),
            content,
            reasoning_content: reasoning,
            ..Default::default()
        }
    }

    /// An assistant event carrying the turn's tool-call list.
    /// `calls` is a JSON array of `{id, name, arguments}` objects.
    pub fn assistant_tool_calls(calls: serde_json::Value) -> Self {
        Self {
            role: Some(Role::Assistant),
            tool_arguments: Some(calls),
            ..Default::default()
        }
    }

    /// A tool-result event linked to the assistant call that issued it.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_call_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Some(Role::Tool),
            tool_call_id: Some(tool_call_id.into()),
            tool_call_name: Some(tool_call_name.into()),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, prompt: Option<i64>, completion: Option<i64>, total: Option<i64>) -> Self {
        self.prompt_tokens = prompt;
        self.completion_tokens = completion;
        self.total_tokens = total;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Record of one compaction: a middle range of events replaced by a summary.
#[derive(Debug, Clone)]
pub struct CompactionRecord {
    pub id: i64,
    pub session_id: String,
    pub before_count: i64,
    pub after_count: i64,
    pub head_kept: i64,
    pub tail_kept: i64,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}
