// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
//! The protocol adapter: maps Agent Client Protocol methods onto the engine
//! and manages session lifecycle, cancellation signals, and streaming
//! `session/update` notifications.
//!
//! The wire layer (JSON-RPC framing, request/response/update schemas) comes
//! from the `agent-client-protocol` crate; this crate supplies the agent
//! semantics behind it.

mod adapter;
mod server;

pub use adapter::{Adapter, DispatcherFactory, McpDispatcherFactory, Notifier};
pub use server::{serve_stdio, AgentAdapter, ChannelNotifier};

/// Re-exported protocol types so downstream crates and tests speak the same
/// schema without pinning the dependency themselves.
pub use agent_client_protocol as acp;
