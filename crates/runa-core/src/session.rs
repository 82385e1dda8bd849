// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use runa_model::{Message, ToolSchema, UsageTotals};
use runa_store::{NewEvent, RequestParams, SessionRecord, SessionStatus, Store, StoreError};

use crate::accumulator::ToolCallInput;
use crate::dispatch::CompletedTool;
use crate::prompts::render_template;

/// The in-memory working copy of one conversation, used by the engine for
/// the duration of a turn.
///
/// The store owns all persisted state; this view is truthful up to the last
/// flushed event.  All writes go through the store immediately.
#[derive(Clone, Debug)]
pub struct Session {
    store: Arc<Store>,
    record: SessionRecord,
    /// Always-on skill injections, re-supplied on every message build.
    always_on: Vec<Message>,
}

impl Session {
    /// Create and persist a new session.  The system prompt is rendered
    /// deterministically from the template and arguments, and cached on the
    /// session row.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        store: Arc<Store>,
        session_id: &str,
        prompt_template: &str,
        prompt_args: serde_json::Value,
        tool_definitions: Vec<ToolSchema>,
        request_params: RequestParams,
        model_identifier: &str,
        workspace_path: &str,
    ) -> Result<Self, StoreError> {
        let prompt_id = store.put_prompt(prompt_template)?;
        let system_prompt = render_template(prompt_template, &prompt_args);
        let record = store.create_session(
            session_id,
            &prompt_id,
            prompt_args,
            &system_prompt,
            &tool_definitions,
            request_params,
            model_identifier,
            workspace_path,
        )?;
        Ok(Self { store, record, always_on: Vec::new() })
    }

    /// Rehydrate a session from the store.
    pub fn load(store: Arc<Store>, session_id: &str) -> Result<Self, StoreError> {
        let record = store.load_session(session_id)?;
        Ok(Self { store, record, always_on: Vec::new() })
    }

    /// Re-read the persisted row, e.g. after a compaction spliced history.
    pub fn reload(&mut self) -> Result<(), StoreError> {
        self.record = self.store.load_session(&self.record.session_id)?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.record.session_id
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn request_params(&self) -> &RequestParams {
        &self.record.request_params
    }

    pub fn always_on(&self) -> &[Message] {
        &self.always_on
    }

    pub fn set_always_on(&mut self, injections: Vec<Message>) {
        self.always_on = injections;
    }

    pub fn set_status(&mut self, status: SessionStatus) -> Result<(), StoreError> {
        self.store.set_status(&self.record.session_id, status)?;
        self.record.status = status;
        Ok(())
    }

    pub fn set_mode(&mut self, mode: &str) -> Result<(), StoreError> {
        self.store.set_mode(&self.record.session_id, mode)?;
        self.record.mode = mode.to_string();
        Ok(())
    }

    pub fn set_model(&mut self, model: &str) -> Result<(), StoreError> {
        self.store.set_model(&self.record.session_id, model)?;
        self.record.model_identifier = model.to_string();
        Ok(())
    }

    pub fn update_request_params(&mut self, params: RequestParams) -> Result<(), StoreError> {
        self.store.update_request_params(&self.record.session_id, &params)?;
        self.record.request_params = params;
        Ok(())
    }

    // ─── Writes ──────────────────────────────────────────────────────────────

    pub fn add_user_message(&self, text: &str) -> Result<i64, StoreError> {
        self.store.append_event(&self.record.session_id, NewEvent::user(text))
    }

    /// Persist one assistant response: 0–2 assistant events (text/reasoning,
    /// then the tool-call list) plus one tool event per result, in the order
    /// the results completed.
    ///
    /// A turn that produced nothing at all still writes an empty assistant
    /// event, so "the model said nothing" is visible in history.  Re-running
    /// with the same tool results is idempotent: a result whose
    /// `tool_call_id` is already persisted is skipped.
    pub fn add_assistant_response(
        &self,
        reasoning: Option<String>,
        content: Option<String>,
        tool_calls: &[ToolCallInput],
        tool_results: &[CompletedTool],
        usage: Option<UsageTotals>,
    ) -> Result<(), StoreError> {
        let session_id = &self.record.session_id;
        let mut usage_pending = usage;
        let mut take_usage = |ev: NewEvent| -> NewEvent {
            match usage_pending.take() {
                Some(u) => ev.with_usage(
                    Some(u.prompt_tokens as i64),
                    Some(u.completion_tokens as i64),
                    Some(u.total_tokens as i64),
                ),
                None => ev,
            }
        };

        let wrote_nothing_else = tool_calls.is_empty() && tool_results.is_empty();
        if content.is_some() || reasoning.is_some() || wrote_nothing_else {
            let text = content.unwrap_or_default();
            let ev = NewEvent::assistant(Some(text), reasoning);
            self.store.append_event(session_id, take_usage(ev))?;
        }

        if !tool_calls.is_empty() {
            let calls: Vec<serde_json::Value> = tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "name": c.name,
                        "arguments": if c.parse_error.is_some() {
                            json!(c.raw_arguments)
                        } else {
                            c.arguments.clone()
                        },
                    })
                })
                .collect();
            let ev = NewEvent::assistant_tool_calls(serde_json::Value::Array(calls));
            self.store.append_event(session_id, take_usage(ev))?;
        }

        for completed in tool_results {
            if self.store.has_tool_event(session_id, &completed.call_id)? {
                debug!(
                    session_id,
                    tool_call_id = %completed.call_id,
                    "tool result already persisted; skipping duplicate"
                );
                continue;
            }
            let mut metadata = json!({ "is_error": completed.outcome.is_error });
            if let Some(raw) = &completed.outcome.raw_output {
                metadata["raw_output"] = raw.clone();
            }
            if let runa_model::ToolResultContent::Diff(diff) = &completed.outcome.content {
                metadata["diff"] = serde_json::to_value(diff)
                    .map_err(|e| StoreError::Integrity(e.to_string()))?;
            }
            let ev = NewEvent::tool_result(
                &completed.call_id,
                &completed.name,
                completed.outcome.content.to_string(),
            )
            .with_metadata(metadata);
            self.store.append_event(session_id, ev)?;
        }

        Ok(())
    }

    // ─── Reads ───────────────────────────────────────────────────────────────

    /// The logical message list the provider would receive right now.
    pub fn as_provider_messages(&self) -> Result<Vec<Message>, StoreError> {
        self.store.get_messages(&self.record.session_id, &self.always_on)
    }

    /// Total-token basis for compaction decisions: the most recent turn's
    /// provider-reported totals, or a 4-chars/token estimate over the
    /// logical message list when no turn reported usage.
    pub fn token_total(&self) -> Result<u64, StoreError> {
        if let Some(total) = self.store.latest_total_tokens(&self.record.session_id)? {
            return Ok(total.max(0) as u64);
        }
        let estimate = self
            .as_provider_messages()?
            .iter()
            .map(|m| m.approx_tokens())
            .sum();
        Ok(estimate)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
