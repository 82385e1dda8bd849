// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: MIT
//! Deterministic providers for tests — no network access required.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;

use crate::{
    provider::EventStream, ChatProvider, CompletionRequest, ModelError, Role, StreamEvent,
    UsageTotals,
};

/// Echoes the last user message back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<EventStream, ModelError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<Result<StreamEvent, ModelError>> = vec![
            Ok(StreamEvent::ContentDelta(format!("MOCK: {reply}"))),
            Ok(StreamEvent::Usage(UsageTotals {
                prompt_tokens: 10,
                completion_tokens: 10,
                total_tokens: 20,
            })),
            Ok(StreamEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// One scripted response: the exact event sequence for one `complete` call.
///
/// A stalling script never terminates after its events — the stream hangs
/// forever, which is how tests hold the engine mid-stream while they fire a
/// cancellation.
#[derive(Clone)]
pub struct Script {
    pub events: Vec<StreamEvent>,
    pub stall: bool,
}

impl Script {
    pub fn events(events: Vec<StreamEvent>) -> Self {
        Self { events, stall: false }
    }

    pub fn stalling(events: Vec<StreamEvent>) -> Self {
        Self { events, stall: true }
    }

    /// A single text reply with usage, then `Done`.
    pub fn text(reply: impl Into<String>) -> Self {
        Self::events(vec![
            StreamEvent::ContentDelta(reply.into()),
            StreamEvent::Usage(UsageTotals { prompt_tokens: 5, completion_tokens: 5, total_tokens: 10 }),
            StreamEvent::Done,
        ])
    }

    /// A complete tool call in one fragment, then `Done`.
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        args_json: impl Into<String>,
    ) -> Self {
        Self::events(vec![
            StreamEvent::ToolCallDelta {
                index: 0,
                id: id.into(),
                name: name.into(),
                arguments: args_json.into(),
            },
            StreamEvent::Done,
        ])
    }
}

/// A pre-scripted provider.  Each `complete` call pops the next script from
/// the front of the queue, so tests can specify exact event sequences —
/// including split tool-call fragments and mid-stream stalls.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Script>>>,
    /// The last `CompletionRequest` seen, inspectable by tests.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
            calls: AtomicU32::new(0),
        }
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Script::text(reply)])
    }

    /// Convenience: one tool call, then a text reply on the next round.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Script::tool_call(tool_id, tool_name, args_json),
            Script::text(final_text),
        ])
    }

    /// Number of `complete` calls made so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn default_model(&self) -> &str {
        "scripted-mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<EventStream, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(req);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed.
                Script::events(vec![
                    StreamEvent::ContentDelta("[no more scripts]".into()),
                    StreamEvent::Done,
                ])
            } else {
                scripts.remove(0)
            }
        };
        let head = stream::iter(script.events.into_iter().map(Ok));
        if script.stall {
            Ok(Box::pin(head.chain(stream::pending())))
        } else {
            Ok(Box::pin(head))
        }
    }
}

/// Fails the first N `complete` calls with a transport error, then succeeds
/// with an empty stream.  `always_invalid` fails every call non-transiently.
pub struct FlakyProvider {
    failures_remaining: AtomicU32,
    attempts: AtomicU32,
    invalid: bool,
}

impl FlakyProvider {
    pub fn failing_times(n: u32) -> Self {
        Self { failures_remaining: AtomicU32::new(n), attempts: AtomicU32::new(0), invalid: false }
    }

    pub fn always_invalid() -> Self {
        Self { failures_remaining: AtomicU32::new(0), attempts: AtomicU32::new(0), invalid: true }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for FlakyProvider {
    fn name(&self) -> &str {
        "flaky-mock"
    }
    fn default_model(&self) -> &str {
        "flaky-mock-model"
    }

    async fn complete(&self, _req: CompletionRequest) -> Result<EventStream, ModelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.invalid {
            return Err(ModelError::InvalidRequest { status: 400, message: "bad request".into() });
        }
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ModelError::Transport("connection reset".into()));
        }
        Ok(Box::pin(stream::iter(vec![Ok(StreamEvent::Done)])))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::Message;

    fn req_with_user(text: &str) -> CompletionRequest {
        CompletionRequest { messages: vec![Message::user(text)], ..Default::default() }
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let p = MockProvider;
        let mut stream = p.complete(req_with_user("hi")).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        match first {
            StreamEvent::ContentDelta(t) => assert!(t.contains("MOCK: hi")),
            other => panic!("unexpected first event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mock_ends_with_done() {
        let p = MockProvider;
        let mut stream = p.complete(req_with_user("x")).await.unwrap();
        let mut events = Vec::new();
        while let Some(ev) = stream.next().await {
            events.push(ev.unwrap());
        }
        assert!(matches!(events.last(), Some(StreamEvent::Done)));
    }

    #[tokio::test]
    async fn scripted_pops_scripts_in_order() {
        let p = ScriptedProvider::tool_then_text("call-1", "shell", r#"{"command":"ls"}"#, "done");

        let mut events = Vec::new();
        let mut stream = p.complete(req_with_user("go")).await.unwrap();
        while let Some(ev) = stream.next().await {
            events.push(ev.unwrap());
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolCallDelta { name, .. } if name == "shell")));

        let mut events2 = Vec::new();
        let mut stream2 = p.complete(req_with_user("go")).await.unwrap();
        while let Some(ev) = stream2.next().await {
            events2.push(ev.unwrap());
        }
        assert!(events2
            .iter()
            .any(|e| matches!(e, StreamEvent::ContentDelta(t) if t == "done")));
        assert_eq!(p.calls(), 2);
    }

    #[tokio::test]
    async fn scripted_fallback_when_scripts_exhausted() {
        let p = ScriptedProvider::new(vec![]);
        let mut stream = p.complete(req_with_user("x")).await.unwrap();
        let ev = stream.next().await.unwrap().unwrap();
        assert!(matches!(ev, StreamEvent::ContentDelta(t) if t.contains("no more scripts")));
    }

    #[tokio::test]
    async fn scripted_records_last_request() {
        let p = ScriptedProvider::always_text("ok");
        let _ = p.complete(req_with_user("inspect me")).await.unwrap();
        let seen = p.last_request.lock().unwrap();
        assert_eq!(seen.as_ref().unwrap().messages[0].as_text(), Some("inspect me"));
    }

    #[tokio::test]
    async fn stalling_script_emits_events_then_hangs() {
        let p = ScriptedProvider::new(vec![Script::stalling(vec![
            StreamEvent::ContentDelta("a".into()),
            StreamEvent::ContentDelta("b".into()),
        ])]);
        let mut stream = p.complete(req_with_user("x")).await.unwrap();
        assert!(matches!(stream.next().await.unwrap().unwrap(), StreamEvent::ContentDelta(t) if t == "a"));
        assert!(matches!(stream.next().await.unwrap().unwrap(), StreamEvent::ContentDelta(t) if t == "b"));
        // The stream must now hang rather than terminate.
        let timed = tokio::time::timeout(std::time::Duration::from_millis(50), stream.next()).await;
        assert!(timed.is_err(), "stalling stream must not yield further items");
    }
}
