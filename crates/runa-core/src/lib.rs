// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
//! The agent core: sessions, the streaming ReAct engine, the hook pipeline,
//! and history compaction.

mod accumulator;
mod compact;
mod dispatch;
mod engine;
mod error;
mod events;
mod hooks;
mod prompts;
mod session;


pub use accumulator::{PendingToolCall, ToolCallInput, TurnAccumulator};
pub use compact::{compact_if_needed, force_compact};
pub use dispatch::{truncate_tool_result, CompletedTool, NullDispatcher, ToolDispatcher, ToolOutcome};
pub use engine::{Engine, EngineSettings};
pub use error::EngineError;
pub use events::{classify_tool_kind, AgentEvent, StopReason, ToolKind};
pub use hooks::{
    build_pipeline, BuiltinHookDeps, CompactorHook, HookContext, HookError, HookPipeline,
    MidReactHook, PostReactHook, PreRequestHook, RalphHook, SkillsInjectorHook,
};
pub use prompts::render_template;
pub use session::Session;
