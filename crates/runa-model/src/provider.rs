// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, ModelError, StreamEvent};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ModelError>> + Send>>;

/// A streaming chat-completion provider with tool calling.
///
/// Providers are stateless beyond in-flight HTTP and safe to share across
/// sessions behind an `Arc`.  They never buffer across requests.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Human-readable provider name for status display and logs.
    fn name(&self) -> &str;

    /// Model identifier used when the request does not override it.
    fn default_model(&self) -> &str;

    /// Send a completion request and return a stream of demultiplexed chunks.
    async fn complete(&self, req: CompletionRequest) -> Result<EventStream, ModelError>;
}
