// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
//! The turn's state accumulator.
//!
//! Allocated before each provider request and updated after every streamed
//! chunk, so the latest partial output is always readable from outside the
//! stream consumer.  Cancellation persists whatever is in here — tokens
//! already received are never lost.

use std::collections::HashMap;

use tracing::warn;

use runa_model::{StreamEvent, UsageTotals};

/// A tool call still being assembled from streamed fragments.
#[derive(Debug, Default, Clone)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub args_buf: String,
}

/// A finalized tool call, ready for dispatch.
#[derive(Debug, Clone)]
pub struct ToolCallInput {
    pub id: String,
    pub name: String,
    /// Parsed argument object; `{}` when the model sent none.
    pub arguments: serde_json::Value,
    /// The raw argument string as streamed, kept for display and replay.
    pub raw_arguments: String,
    /// Set when the arguments could not be parsed even after repair; such a
    /// call is not dispatched and surfaces as a failed tool event instead.
    pub parse_error: Option<String>,
}

#[derive(Default)]
pub struct TurnAccumulator {
    pub reasoning: String,
    pub content: String,
    /// Keyed by the provider's parallel-tool-call index.  OpenAI interleaves
    /// fragments for different calls by index; single-call providers use 0.
    pub pending: HashMap<u32, PendingToolCall>,
    /// Populated by [`finalize_tool_calls`](Self::finalize_tool_calls).
    pub tool_call_inputs: Vec<ToolCallInput>,
    pub usage: Option<UsageTotals>,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one streamed chunk into the accumulated state.
    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::ContentDelta(t) => self.content.push_str(t),
            StreamEvent::ReasoningDelta(t) => self.reasoning.push_str(t),
            StreamEvent::ToolCallDelta { index, id, name, arguments } => {
                let pending = self.pending.entry(*index).or_default();
                if !id.is_empty() {
                    pending.id = id.clone();
                }
                if !name.is_empty() {
                    pending.name = name.clone();
                }
                pending.args_buf.push_str(arguments);
            }
            StreamEvent::Usage(u) => self.usage = Some(*u),
            StreamEvent::Done | StreamEvent::Error(_) => {}
        }
    }

    /// Whether this fragment opens a call not seen before.  Callers check
    /// this *before* [`apply`](Self::apply) to decide whether to announce a
    /// new tool call.
    pub fn is_new_call(&self, index: u32) -> bool {
        !self.pending.contains_key(&index)
    }

    /// The call id a continuation fragment belongs to.
    pub fn call_id(&self, index: u32) -> Option<&str> {
        self.pending.get(&index).map(|p| p.id.as_str())
    }

    /// Nothing was produced at all — the turn counts as ended.
    pub fn is_empty(&self) -> bool {
        self.reasoning.is_empty() && self.content.is_empty() && self.pending.is_empty()
    }

    /// Join the argument fragments of every pending call and parse them.
    ///
    /// Calls with an empty name cannot be dispatched and are dropped —
    /// storing them would corrupt the history sent back on the next turn.
    /// An empty id gets a synthetic fallback so the turn can still complete.
    /// Unparseable arguments get one repair pass; if that also fails the
    /// call is kept but marked failed so it surfaces as a tool error.
    pub fn finalize_tool_calls(&mut self) {
        let mut sorted: Vec<(u32, PendingToolCall)> = self.pending.drain().collect();
        sorted.sort_by_key(|(idx, _)| *idx);

        for (i, (_, pending)) in sorted.into_iter().enumerate() {
            if pending.name.is_empty() {
                warn!(tool_call_id = %pending.id, "dropping tool call with empty name from model");
                continue;
            }
            let id = if pending.id.is_empty() {
                warn!(tool_name = %pending.name, "tool call had empty id; generating synthetic id");
                format!("call_synthetic_{i}")
            } else {
                pending.id
            };

            let (arguments, parse_error) = if pending.args_buf.trim().is_empty() {
                (serde_json::Value::Object(Default::default()), None)
            } else {
                match serde_json::from_str(&pending.args_buf) {
                    Ok(v) => (v, None),
                    Err(first_err) => match attempt_json_repair(&pending.args_buf) {
                        Some(v) => {
                            warn!(tool_name = %pending.name, tool_call_id = %id,
                                  "repaired invalid JSON arguments from model");
                            (v, None)
                        }
                        None => (
                            serde_json::Value::Object(Default::default()),
                            Some(format!("invalid JSON arguments: {first_err}")),
                        ),
                    },
                }
            };

            self.tool_call_inputs.push(ToolCallInput {
                id,
                name: pending.name,
                arguments,
                raw_arguments: pending.args_buf,
                parse_error,
            });
        }
    }
}

// ─── JSON repair ─────────────────────────────────────────────────────────────

/// Attempt to repair common JSON syntax errors in model-produced arguments:
/// invalid escape sequences inside strings, and truncated output missing
/// its closing quote/brace.
fn attempt_json_repair(raw: &str) -> Option<serde_json::Value> {
    let fixed = fix_invalid_json_escapes(raw);
    if let Ok(v) = serde_json::from_str(&fixed) {
        return Some(v);
    }

    if !fixed.trim_end().ends_with('}') {
        let mut completed = fixed;
        let quote_count = completed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        completed.push('}');
        if let Ok(v) = serde_json::from_str(&completed) {
            return Some(v);
        }
    }

    None
}

/// Replace invalid escape sequences inside string values with an escaped
/// backslash.  Valid JSON escapes are `"` `\` `/` `b` `f` `n` `r` `t` `u`;
/// models occasionally emit things like `\c` or `\(` which serde rejects.
fn fix_invalid_json_escapes(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len() + 16);
    let mut chars = raw.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(index: u32, id: &str, name: &str, args: &str) -> StreamEvent {
        StreamEvent::ToolCallDelta {
            index,
            id: id.into(),
            name: name.into(),
            arguments: args.into(),
        }
    }

    // ── Accumulation ──────────────────────────────────────────────────────────

    #[test]
    fn content_and_reasoning_accumulate_in_order() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&StreamEvent::ReasoningDelta("think ".into()));
        acc.apply(&StreamEvent::ContentDelta("ab".into()));
        acc.apply(&StreamEvent::ContentDelta("cd".into()));
        acc.apply(&StreamEvent::ReasoningDelta("more".into()));
        assert_eq!(acc.content, "abcd");
        assert_eq!(acc.reasoning, "think more");
    }

    #[test]
    fn partial_state_is_readable_mid_stream() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&StreamEvent::ContentDelta("abc".into()));
        // A cancellation checker reads the accumulator without touching the
        // stream consumer.
        assert_eq!(acc.content, "abc");
        assert!(acc.usage.is_none());
    }

    #[test]
    fn tool_call_fragments_join_by_index() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&delta(0, "call_a", "echo", "{\"te"));
        acc.apply(&delta(0, "", "", "xt\":\"hi\"}"));
        acc.finalize_tool_calls();

        assert_eq!(acc.tool_call_inputs.len(), 1);
        let call = &acc.tool_call_inputs[0];
        assert_eq!(call.id, "call_a");
        assert_eq!(call.name, "echo");
        assert_eq!(call.arguments, json!({"text": "hi"}));
        assert!(call.parse_error.is_none());
    }

    #[test]
    fn interleaved_parallel_calls_finalize_in_index_order() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&delta(1, "call_b", "fast", "{}"));
        acc.apply(&delta(0, "call_a", "slow", "{\"n\":"));
        acc.apply(&delta(0, "", "", "1}"));
        acc.finalize_tool_calls();

        let ids: Vec<&str> = acc.tool_call_inputs.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["call_a", "call_b"]);
    }

    #[test]
    fn is_new_call_and_call_id_track_indices() {
        let mut acc = TurnAccumulator::new();
        assert!(acc.is_new_call(0));
        acc.apply(&delta(0, "call_a", "echo", ""));
        assert!(!acc.is_new_call(0));
        assert_eq!(acc.call_id(0), Some("call_a"));
        assert!(acc.is_new_call(1));
    }

    #[test]
    fn usage_is_recorded() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&StreamEvent::Usage(UsageTotals {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }));
        assert_eq!(acc.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn empty_turn_is_detected() {
        let acc = TurnAccumulator::new();
        assert!(acc.is_empty());
        let mut acc2 = TurnAccumulator::new();
        acc2.apply(&StreamEvent::ContentDelta("x".into()));
        assert!(!acc2.is_empty());
    }

    // ── Finalization edge cases ───────────────────────────────────────────────

    #[test]
    fn empty_name_call_is_dropped() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&delta(0, "call_x", "", "{}"));
        acc.finalize_tool_calls();
        assert!(acc.tool_call_inputs.is_empty());
    }

    #[test]
    fn empty_id_gets_synthetic_fallback() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&delta(0, "", "echo", "{}"));
        acc.finalize_tool_calls();
        assert_eq!(acc.tool_call_inputs[0].id, "call_synthetic_0");
    }

    #[test]
    fn empty_arguments_become_empty_object() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&delta(0, "c", "echo", ""));
        acc.finalize_tool_calls();
        assert_eq!(acc.tool_call_inputs[0].arguments, json!({}));
        assert!(acc.tool_call_inputs[0].parse_error.is_none());
    }

    #[test]
    fn malformed_arguments_are_marked_failed_not_dropped() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&delta(0, "c", "echo", "{definitely not json"));
        acc.finalize_tool_calls();
        let call = &acc.tool_call_inputs[0];
        assert!(call.parse_error.is_some());
        assert_eq!(call.arguments, json!({}));
    }

    #[test]
    fn one_bad_call_does_not_poison_its_peers() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&delta(0, "bad", "echo", "{nope"));
        acc.apply(&delta(1, "good", "echo", "{\"ok\":true}"));
        acc.finalize_tool_calls();
        assert_eq!(acc.tool_call_inputs.len(), 2);
        assert!(acc.tool_call_inputs[0].parse_error.is_some());
        assert!(acc.tool_call_inputs[1].parse_error.is_none());
    }

    // ── JSON repair ───────────────────────────────────────────────────────────

    #[test]
    fn repairs_invalid_escape_sequences() {
        let v = attempt_json_repair(r#"{"path":"C:\projects\new"}"#).unwrap();
        assert_eq!(v["path"], "C:\\projects\\new");
    }

    #[test]
    fn repairs_truncated_object() {
        let v = attempt_json_repair(r#"{"text":"cut off"#).unwrap();
        assert_eq!(v["text"], "cut off");
    }

    #[test]
    fn repair_gives_up_on_hopeless_input() {
        assert!(attempt_json_repair("][").is_none());
    }

    #[test]
    fn valid_escapes_are_left_alone() {
        let fixed = fix_invalid_json_escapes(r#"{"s":"a\nb\t\"c\""}"#);
        assert_eq!(fixed, r#"{"s":"a\nb\t\"c\""}"#);
    }
}
