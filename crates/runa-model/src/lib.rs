// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
//! Provider abstraction for streaming chat completions with tool calling.
//!
//! The [`ChatProvider`] trait is the only seam the rest of the workspace
//! depends on; [`OpenAiCompatProvider`] is the production implementation and
//! the mock providers back the test suites.

mod error;
pub mod mock;
mod openai_compat;
mod provider;
mod retry;
mod types;

pub use error::ModelError;
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{ChatProvider, EventStream};
pub use retry::complete_with_retry;
pub use types::{
    CompletionRequest, FileDiff, FunctionCall, Message, MessageContent, Role, StreamEvent,
    ToolResultContent, ToolSchema, UsageTotals,
};
