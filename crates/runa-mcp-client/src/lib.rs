// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
//! MCP client — connects to external tool servers over stdio, http, or sse,
//! aggregates their tool catalogs, and dispatches `tools/call` requests for
//! the engine.

mod client;
mod jsonrpc;
mod transport;

pub use client::McpClient;
pub use jsonrpc::McpError;
pub use transport::{HttpTransport, McpTransport, SseTransport, StdioTransport};
