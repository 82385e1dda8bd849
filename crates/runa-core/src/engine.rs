// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
//! The ReAct engine: request → stream → accumulate → tools → repeat.
//!
//! Each turn drives provider chunks into a [`TurnAccumulator`] that lives
//! outside the stream consumer, so the cancellation path can always persist
//! whatever was received so far.  Tool calls fan out concurrently with
//! per-call isolation; results persist in completion order.

use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use runa_config::{EngineConfig, SessionConfig};
use runa_model::{
    complete_with_retry, ChatProvider, CompletionRequest, ModelError, StreamEvent,
    ToolResultContent,
};

use crate::accumulator::TurnAccumulator;
use crate::compact::force_compact;
use crate::dispatch::{truncate_tool_result, CompletedTool, ToolDispatcher, ToolOutcome};
use crate::events::{classify_tool_kind, AgentEvent, StopReason};
use crate::hooks::{HookContext, HookPipeline};
use crate::{EngineError, Session, ToolCallInput};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Safety ceiling on model↔tool rounds within one prompt call.
    pub max_turns: u32,
    pub provider_retries: u32,
    /// Cap on persisted tool-result size in approximate tokens; 0 disables.
    pub tool_result_token_cap: usize,
    /// Persist the accumulator after every chunk (crash durability at the
    /// cost of a write per token).
    pub checkpoint_on_every_token: bool,
    /// Cheaper model used for forced compaction summaries.
    pub compaction_model: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_turns: 1_000,
            provider_retries: 3,
            tool_result_token_cap: 8_192,
            checkpoint_on_every_token: false,
            compaction_model: None,
        }
    }
}

impl EngineSettings {
    pub fn from_config(engine: &EngineConfig, session: &SessionConfig) -> Self {
        Self {
            max_turns: engine.max_turns,
            provider_retries: engine.provider_retries,
            tool_result_token_cap: engine.tool_result_token_cap,
            checkpoint_on_every_token: engine.checkpoint_on_every_token,
            compaction_model: session.compaction_model.clone(),
        }
    }
}

/// One engine serves one session turn at a time; the adapter owns one per
/// process and borrows a session into [`run`](Engine::run).
pub struct Engine {
    provider: Arc<dyn ChatProvider>,
    dispatcher: Arc<dyn ToolDispatcher>,
    hooks: HookPipeline,
    settings: EngineSettings,
}

/// How the stream-consumption loop ended.
enum StreamOutcome {
    Finished,
    Cancelled,
    Failed(ModelError),
}

impl Engine {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        dispatcher: Arc<dyn ToolDispatcher>,
        hooks: HookPipeline,
        settings: EngineSettings,
    ) -> Self {
        Self { provider, dispatcher, hooks, settings }
    }

    /// Run one prompt to completion: pre-request hooks, the turn loop, and
    /// post-react hooks (which may start another loop).
    pub async fn run(
        &self,
        session: &mut Session,
        user_prompt: &str,
        tx: mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<StopReason, EngineError> {
        if cancel.is_cancelled() {
            let _ = tx.send(AgentEvent::Aborted { partial_text: String::new() }).await;
            return Ok(StopReason::Cancelled);
        }

        let catalog = self.dispatcher.catalog();
        {
            let mut cx = HookContext {
                session: &mut *session,
                user_prompt: Some(user_prompt),
                tool_catalog: &catalog,
                latest_usage: None,
                final_text: None,
            };
            self.hooks.run_pre_request(&mut cx).await;
        }
        session.add_user_message(user_prompt)?;

        // Post-react hooks may request re-runs; cap them with the same
        // ceiling as the turn loop so a hook that never settles cannot spin.
        let mut reruns = 0u32;
        let stop_reason = loop {
            let (stop, final_text) = self.run_loop(session, &tx, cancel).await?;
            if stop != StopReason::EndTurn {
                break stop;
            }

            let follow_up = {
                let mut cx = HookContext {
                    session: &mut *session,
                    user_prompt: None,
                    tool_catalog: &catalog,
                    latest_usage: None,
                    final_text: Some(&final_text),
                };
                self.hooks.run_post_react(&mut cx).await
            };
            match follow_up {
                Some(follow_up) => {
                    reruns += 1;
                    if reruns > self.settings.max_turns {
                        break StopReason::MaxTurnsReached;
                    }
                    debug!(session_id = session.id(), "post-react hook requested a re-run");
                    session.add_user_message(&follow_up)?;
                }
                None => break StopReason::EndTurn,
            }
        };

        let _ = tx.send(AgentEvent::TurnComplete { stop_reason }).await;
        Ok(stop_reason)
    }

    /// The inner turn loop.  Returns the stop reason and the last turn's
    /// assistant text (fed to post-react hooks).
    async fn run_loop(
        &self,
        session: &mut Session,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<(StopReason, String), EngineError> {
        let mut turns = 0u32;
        let mut compacted_for_overflow = false;

        loop {
            turns += 1;
            if turns > self.settings.max_turns {
                let note = format!(
                    "Reached the maximum of {} turns for this prompt; stopping here. \
                     Send a new prompt to continue.",
                    self.settings.max_turns
                );
                session.add_assistant_response(None, Some(note.clone()), &[], &[], None)?;
                let _ = tx.send(AgentEvent::ContentDelta(note.clone())).await;
                return Ok((StopReason::MaxTurnsReached, note));
            }

            if cancel.is_cancelled() {
                let _ = tx.send(AgentEvent::Aborted { partial_text: String::new() }).await;
                return Ok((StopReason::Cancelled, String::new()));
            }

            // Provider request, raced against cancellation.
            let req = self.build_request(session)?;
            let stream_result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = tx.send(AgentEvent::Aborted { partial_text: String::new() }).await;
                    return Ok((StopReason::Cancelled, String::new()));
                }
                result = complete_with_retry(
                    self.provider.as_ref(), req, self.settings.provider_retries) => result,
            };

            let mut stream = match stream_result {
                Ok(s) => s,
                Err(ModelError::ContextLengthExceeded) if !compacted_for_overflow => {
                    compacted_for_overflow = true;
                    warn!(session_id = session.id(), "context window exceeded; forcing compaction and retrying");
                    let before = session.token_total()?;
                    match force_compact(
                        session,
                        self.provider.as_ref(),
                        self.settings.compaction_model.as_deref(),
                    )
                    .await?
                    {
                        Some(refreshed) => {
                            *session = refreshed;
                            let after = session.token_total()?;
                            let _ = tx
                                .send(AgentEvent::Compacted { tokens_before: before, tokens_after: after })
                                .await;
                            continue;
                        }
                        None => {
                            return self
                                .surface_error(
                                    session,
                                    tx,
                                    "The conversation no longer fits the model's context window \
                                     and compaction could not reduce it. Lower \
                                     compaction_threshold or keep_head/keep_tail and retry."
                                        .to_string(),
                                )
                                .await;
                        }
                    }
                }
                Err(ModelError::ContextLengthExceeded) => {
                    return self
                        .surface_error(
                            session,
                            tx,
                            "The conversation still exceeds the model's context window after \
                             compaction. Lower the compaction parameters and retry."
                                .to_string(),
                        )
                        .await;
                }
                Err(e) => {
                    return self.surface_error(session, tx, format!("The model request failed: {e}")).await;
                }
            };

            // Stream consumption: every chunk updates the accumulator, then
            // is mapped to a protocol-level update.  Cancellation is raced
            // against every read so a stalled stream cannot mask it.
            let mut acc = TurnAccumulator::new();
            let outcome = loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break StreamOutcome::Cancelled,
                    item = stream.next() => item,
                };
                match item {
                    None => break StreamOutcome::Finished,
                    Some(Ok(event)) => {
                        self.emit_stream_event(&acc, &event, tx).await;
                        let done = matches!(event, StreamEvent::Done);
                        acc.apply(&event);
                        if self.settings.checkpoint_on_every_token {
                            session
                                .store()
                                .save_turn_checkpoint(session.id(), &acc.reasoning, &acc.content)?;
                        }
                        if done {
                            break StreamOutcome::Finished;
                        }
                    }
                    Some(Err(e)) => break StreamOutcome::Failed(e),
                }
            };

            match outcome {
                StreamOutcome::Cancelled => {
                    acc.finalize_tool_calls();
                    self.persist_partial(session, &acc, &[])?;
                    let _ = tx.send(AgentEvent::Aborted { partial_text: acc.content.clone() }).await;
                    return Ok((StopReason::Cancelled, acc.content));
                }
                StreamOutcome::Failed(e) => {
                    acc.finalize_tool_calls();
                    self.persist_partial(session, &acc, &[])?;
                    return self.surface_error(session, tx, format!("The model stream failed: {e}")).await;
                }
                StreamOutcome::Finished => {}
            }

            acc.finalize_tool_calls();

            if cancel.is_cancelled() {
                self.persist_partial(session, &acc, &[])?;
                let _ = tx.send(AgentEvent::Aborted { partial_text: acc.content.clone() }).await;
                return Ok((StopReason::Cancelled, acc.content));
            }

            // No tool calls: this is the final response (an entirely empty
            // turn also ends the loop, recorded as an empty assistant event).
            if acc.tool_call_inputs.is_empty() {
                let final_text = acc.content.clone();
                session.add_assistant_response(
                    nonempty(&acc.reasoning),
                    Some(acc.content),
                    &[],
                    &[],
                    acc.usage,
                )?;
                session.store().clear_turn_checkpoint(session.id())?;
                return Ok((StopReason::EndTurn, final_text));
            }

            // Tool fan-out.
            let (results, tools_cancelled) =
                self.execute_tools(&acc.tool_call_inputs, tx, cancel).await;

            if tools_cancelled {
                self.persist_partial(session, &acc, &results)?;
                let _ = tx.send(AgentEvent::Aborted { partial_text: acc.content.clone() }).await;
                return Ok((StopReason::Cancelled, acc.content));
            }

            session.add_assistant_response(
                nonempty(&acc.reasoning),
                nonempty(&acc.content),
                &acc.tool_call_inputs,
                &results,
                acc.usage,
            )?;
            session.store().clear_turn_checkpoint(session.id())?;

            // Mid-react hooks; a replacement session (compaction) is adopted.
            let tokens_before = session.token_total()?;
            let replaced = {
                let mut cx = HookContext {
                    session: &mut *session,
                    user_prompt: None,
                    tool_catalog: &[],
                    latest_usage: acc.usage,
                    final_text: None,
                };
                self.hooks.run_mid_react(&mut cx).await
            };
            if replaced {
                let tokens_after = session.token_total()?;
                let _ = tx
                    .send(AgentEvent::Compacted { tokens_before, tokens_after })
                    .await;
            }
        }
    }

    /// Map one streamed chunk to its protocol-level update.  Must run
    /// *before* the chunk is applied so a fresh tool-call index is still
    /// recognisable as new.
    async fn emit_stream_event(
        &self,
        acc: &TurnAccumulator,
        event: &StreamEvent,
        tx: &mpsc::Sender<AgentEvent>,
    ) {
        match event {
            StreamEvent::ContentDelta(t) => {
                let _ = tx.send(AgentEvent::ContentDelta(t.clone())).await;
            }
            StreamEvent::ReasoningDelta(t) => {
                let _ = tx.send(AgentEvent::ReasoningDelta(t.clone())).await;
            }
            StreamEvent::ToolCallDelta { index, id, name, arguments } => {
                if acc.is_new_call(*index) {
                    let _ = tx
                        .send(AgentEvent::ToolCallStarted {
                            id: id.clone(),
                            name: name.clone(),
                            kind: classify_tool_kind(name),
                        })
                        .await;
                    if !arguments.is_empty() {
                        let _ = tx
                            .send(AgentEvent::ToolCallArgumentsDelta {
                                id: id.clone(),
                                delta: arguments.clone(),
                            })
                            .await;
                    }
                } else if !arguments.is_empty() {
                    let call_id = acc.call_id(*index).unwrap_or_default().to_string();
                    let _ = tx
                        .send(AgentEvent::ToolCallArgumentsDelta {
                            id: call_id,
                            delta: arguments.clone(),
                        })
                        .await;
                }
            }
            StreamEvent::Usage(u) => {
                let _ = tx.send(AgentEvent::TokenUsage(*u)).await;
            }
            StreamEvent::Error(msg) => {
                warn!(error = %msg, "model stream warning");
            }
            StreamEvent::Done => {}
        }
    }

    /// Dispatch every parseable call concurrently and collect outcomes in
    /// completion order.  Parse failures complete immediately as tool
    /// errors.  Returns early (with the results obtained so far) when the
    /// cancellation token fires; outstanding tasks are aborted.
    async fn execute_tools(
        &self,
        calls: &[ToolCallInput],
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> (Vec<CompletedTool>, bool) {
        let mut completed: Vec<CompletedTool> = Vec::with_capacity(calls.len());
        let mut pending = FuturesUnordered::new();
        let mut abort_handles = Vec::new();

        for call in calls {
            if let Some(parse_err) = &call.parse_error {
                let outcome =
                    ToolOutcome::error(format!("tool call arguments could not be parsed: {parse_err}"));
                self.emit_tool_finished(call.id.clone(), call.name.clone(), &outcome, tx).await;
                completed.push(CompletedTool {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    outcome,
                });
                continue;
            }

            let dispatcher = Arc::clone(&self.dispatcher);
            let dispatched = call.clone();
            let handle =
                tokio::spawn(async move { dispatcher.dispatch(&dispatched.name, &dispatched.arguments).await });
            abort_handles.push(handle.abort_handle());
            let call = call.clone();
            pending.push(async move {
                match handle.await {
                    Ok(outcome) => (call, outcome),
                    Err(e) => (call, ToolOutcome::error(format!("tool execution panicked: {e}"))),
                }
            });
        }

        while !pending.is_empty() {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    for handle in &abort_handles {
                        handle.abort();
                    }
                    return (completed, true);
                }
                next = pending.next() => next,
            };
            let Some((call, outcome)) = next else { break };
            let outcome = self.cap_outcome(outcome);
            self.emit_tool_finished(call.id.clone(), call.name.clone(), &outcome, tx).await;
            completed.push(CompletedTool { call_id: call.id, name: call.name, outcome });
        }

        (completed, false)
    }

    fn cap_outcome(&self, mut outcome: ToolOutcome) -> ToolOutcome {
        if let ToolResultContent::Text(text) = &outcome.content {
            let capped = truncate_tool_result(text, self.settings.tool_result_token_cap);
            if capped.len() != text.len() {
                outcome.content = ToolResultContent::Text(capped);
            }
        }
        outcome
    }

    async fn emit_tool_finished(
        &self,
        id: String,
        name: String,
        outcome: &ToolOutcome,
        tx: &mpsc::Sender<AgentEvent>,
    ) {
        let _ = tx
            .send(AgentEvent::ToolCallFinished {
                id,
                name,
                content: outcome.content.clone(),
                is_error: outcome.is_error,
                raw_output: outcome.raw_output.clone(),
            })
            .await;
    }

    /// Persist whatever the accumulator holds: reasoning + content +
    /// finalized tool-call inputs + any tool results already received.
    /// Writes nothing when nothing was received.
    fn persist_partial(
        &self,
        session: &Session,
        acc: &TurnAccumulator,
        results: &[CompletedTool],
    ) -> Result<(), EngineError> {
        if acc.reasoning.is_empty()
            && acc.content.is_empty()
            && acc.tool_call_inputs.is_empty()
            && results.is_empty()
        {
            return Ok(());
        }
        session.add_assistant_response(
            nonempty(&acc.reasoning),
            nonempty(&acc.content),
            &acc.tool_call_inputs,
            results,
            acc.usage,
        )?;
        session.store().clear_turn_checkpoint(session.id())?;
        Ok(())
    }

    /// Surface a turn-fatal failure as an assistant event plus an error
    /// update, with stop reason `error` (at most one per turn).
    async fn surface_error(
        &self,
        session: &Session,
        tx: &mpsc::Sender<AgentEvent>,
        message: String,
    ) -> Result<(StopReason, String), EngineError> {
        session.add_assistant_response(None, Some(message.clone()), &[], &[], None)?;
        let _ = tx.send(AgentEvent::Error(message.clone())).await;
        Ok((StopReason::Error, message))
    }

    fn build_request(&self, session: &Session) -> Result<CompletionRequest, EngineError> {
        let params = session.request_params();
        Ok(CompletionRequest {
            messages: session.as_provider_messages()?,
            tools: session.record().tool_definitions.clone(),
            model: session.record().model_identifier.clone(),
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: params.max_tokens,
            cache_key: Some(session.id().to_string()),
        })
    }
}

fn nonempty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
