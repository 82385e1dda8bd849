use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

/// A single message in the conversation history, in provider-native shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: MessageContent::Text(text.into()) }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: MessageContent::Text(text.into()) }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: MessageContent::Text(text.into()) }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: id.into(),
                function: FunctionCall { name: name.into(), arguments: arguments.into() },
            },
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                tool_call_id: id.into(),
                content: ToolResultContent::Text(content.into()),
            },
        }
    }

    /// Construct a tool result carrying a structured file diff.
    pub fn tool_result_diff(id: impl Into<String>, diff: FileDiff) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                tool_call_id: id.into(),
                content: ToolResultContent::Diff(diff),
            },
        }
    }

    /// Return the plain text of this message, if it is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Approximate token count used for context management.
    ///
    /// 4-chars-per-token heuristic; only used when the provider did not
    /// report real usage totals.
    pub fn approx_tokens(&self) -> u64 {
        let chars = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::ToolCall { function, .. } => {
                function.name.len() + function.arguments.len()
            }
            MessageContent::ToolResult { content, .. } => content.to_string().len(),
        };
        ((chars / 4).max(1)) as u64
    }
}

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
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// The content of a message.
///
/// - `Text` – plain string (most messages)
/// - `ToolCall` – the assistant requests a tool invocation
/// - `ToolResult` – the result of a tool call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    ToolCall {
        tool_call_id: String,
        function: FunctionCall,
    },
    ToolResult {
        tool_call_id: String,
        content: ToolResultContent,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object
    pub arguments: String,
}

/// Content returned by a tool — plain text or a structured file diff.
///
/// File-edit tools report what changed as a diff so clients can render it
/// natively; every other tool returns text.  Providers always receive the
/// textual rendering (`Display`), the structured form is for persistence
/// and the client protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Diff(FileDiff),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileDiff {
    pub path: String,
    /// `None` when the file was created.
    pub old_text: Option<String>,
    pub new_text: String,
}

impl std::fmt::Display for ToolResultContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(t) => write!(f, "{t}"),
            Self::Diff(d) => {
                let verb = if d.old_text.is_some() { "Edited" } else { "Created" };
                write!(f, "{verb} {}:\n{}", d.path, d.new_text)
            }
        }
    }
}

impl From<String> for ToolResultContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for ToolResultContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    /// Model identifier; empty means the provider's configured default.
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Stable session identifier forwarded to providers that support an
    /// explicit prompt-cache key, pinning all turns of a session to the same
    /// cached KV prefix.
    pub cache_key: Option<String>,
}

// ─── Stream events ────────────────────────────────────────────────────────────

/// A single streamed chunk from the model, demultiplexed into a tagged
/// variant so consumers match instead of probing loose fields.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A fragment of the assistant's visible text.
    ContentDelta(String),
    /// A fragment of hidden chain-of-thought text.
    ReasoningDelta(String),
    /// A fragment of a tool call.  The first fragment for a call carries its
    /// `id` and function name; later fragments append to `arguments` and are
    /// routed by `index`.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// Token totals, typically in the final chunk before `Done`.
    Usage(UsageTotals),
    /// The stream finished normally.
    Done,
    /// A recoverable in-stream warning (non-fatal).
    Error(String),
}

/// Token usage from one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
