// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
//! Mid-loop history compaction.
//!
//! When a session's token total crosses its threshold, the middle of the
//! logical history is summarized by the same provider (tool calling
//! disabled, optionally on a cheaper model) and spliced out atomically:
//! head events, then the summary as a system-role event, then tail events.
//! The `session_id` and the message prefix stay stable, which is what keeps
//! the provider's prefix KV cache warm across the splice.

use futures::StreamExt;
use tracing::{debug, warn};

use runa_model::{ChatProvider, CompletionRequest, Message, Role, StreamEvent};
use runa_store::EventRecord;

use crate::{EngineError, Session};

const SUMMARIZE_PROMPT: &str = "\
You are a context compaction assistant. Summarise the conversation history \
below in a concise, information-dense way. You MUST preserve: every goal the \
user stated, every decision that was taken, every file that was edited, every \
outstanding TODO, and any error the agent is still recovering from. File \
paths, function names, and error messages are kept verbatim. The summary \
will replace the original history, so anything you drop is gone.";

/// Check the session's token total against its compaction threshold and
/// compact when crossed.  Returns the refreshed session on success, `None`
/// when below threshold or when summarization failed (non-fatal: the next
/// mid-react cycle retries).
pub async fn compact_if_needed(
    session: &Session,
    provider: &dyn ChatProvider,
    compaction_model: Option<&str>,
) -> Result<Option<Session>, EngineError> {
    let params = session.request_params();
    let total = session.token_total()?;
    if total <= params.compaction_threshold {
        return Ok(None);
    }
    debug!(
        session_id = session.id(),
        total,
        threshold = params.compaction_threshold,
        "token total over threshold, compacting"
    );
    force_compact(session, provider, compaction_model).await
}

/// Compact unconditionally (used when the provider rejected a request for
/// exceeding its context window).
pub async fn force_compact(
    session: &Session,
    provider: &dyn ChatProvider,
    compaction_model: Option<&str>,
) -> Result<Option<Session>, EngineError> {
    let params = session.request_params();
    let events = session.store().events(session.id())?;

    let Some((head_kept, tail_kept)) =
        split_boundaries(&events, params.compaction_keep_head, params.compaction_keep_tail)
    else {
        return Ok(None);
    };

    let middle = &events[head_kept..events.len() - tail_kept];
    let history_text = serialize_events(middle);

    let summary = match summarize(session, provider, &history_text, compaction_model).await {
        Ok(s) if !s.trim().is_empty() => s,
        Ok(_) => {
            warn!(session_id = session.id(), "compaction summary was empty; skipping this cycle");
            return Ok(None);
        }
        Err(e) => {
            warn!(session_id = session.id(), error = %e, "compaction summarization failed; skipping this cycle");
            return Ok(None);
        }
    };

    let summary_text = format!("[Conversation summary]\n{summary}");
    let record = session
        .store()
        .record_compaction(session.id(), head_kept, tail_kept, &summary_text)?;
    if record.is_none() {
        return Ok(None);
    }

    let mut refreshed = Session::load(session.store().clone(), session.id())?;
    refreshed.set_always_on(session.always_on().to_vec());
    Ok(Some(refreshed))
}

/// Compute `(head_kept, tail_kept)` in event terms, shifting either boundary
/// so an assistant tool-call event and its tool results are never split: a
/// cut that would orphan results grows the tail (or shrinks the head) until
/// the whole group sits on one side.
///
/// Returns `None` when no middle remains to compact.
fn split_boundaries(events: &[EventRecord], keep_head: usize, keep_tail: usize) -> Option<(usize, usize)> {
    if events.len() <= keep_head + keep_tail {
        return None;
    }

    let mut head_end = keep_head;
    while head_end > 0 && events[head_end].role == Role::Tool {
        head_end -= 1;
    }
    // The head must not end on a dangling tool-call event either.
    while head_end > 0 && !events[head_end - 1].tool_calls().is_empty() {
        head_end -= 1;
    }

    let mut tail_start = events.len() - keep_tail;
    while tail_start > head_end && events[tail_start].role == Role::Tool {
        tail_start -= 1;
    }

    if tail_start <= head_end {
        return None;
    }
    Some((head_end, events.len() - tail_start))
}

/// Serialise middle events into plain text for the summarization request.
/// Hidden reasoning is not included — it was never part of the visible
/// conversation and would bloat the prompt.
fn serialize_events(events: &[EventRecord]) -> String {
    events
        .iter()
        .filter_map(|e| {
            let calls = e.tool_calls();
            if !calls.is_empty() {
                let rendered: Vec<String> = calls
                    .iter()
                    .map(|(_, name, args)| format!("[tool_call: {name}({args})]"))
                    .collect();
                return Some(format!("Assistant: {}", rendered.join(" ")));
            }
            let content = e.content.as_deref()?;
            let role = match e.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => return Some(format!("Tool: [tool_result: {content}]")),
                Role::System => "System",
            };
            Some(format!("{role}: {content}"))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Run the tool-free summarization turn against the same provider, reusing
/// the session's cache key so the provider's prefix KV cache stays useful.
async fn summarize(
    session: &Session,
    provider: &dyn ChatProvider,
    history_text: &str,
    compaction_model: Option<&str>,
) -> Result<String, runa_model::ModelError> {
    let params = session.request_params();
    let req = CompletionRequest {
        messages: vec![
            Message::system(session.record().system_prompt.clone()),
            Message::user(format!("{SUMMARIZE_PROMPT}\n\n---\n\n{history_text}")),
        ],
        tools: Vec::new(),
        model: compaction_model.unwrap_or(&session.record().model_identifier).to_string(),
        temperature: params.temperature,
        top_p: params.top_p,
        max_tokens: params.max_tokens,
        cache_key: Some(session.id().to_string()),
    };

    let mut stream = provider.complete(req).await?;
    let mut summary = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::ContentDelta(t) => summary.push_str(&t),
            StreamEvent::Done => break,
            _ => {}
        }
    }
    Ok(summary)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
