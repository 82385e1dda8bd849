// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use runa_config::ToolServerSpec;
use runa_core::{ToolDispatcher, ToolOutcome};
use runa_model::{FileDiff, ToolResultContent, ToolSchema};

use crate::jsonrpc::McpError;
use crate::transport::{HttpTransport, McpTransport, SseTransport, StdioTransport};

const PROTOCOL_VERSION: &str = "2024-11-05";

struct ServerHandle {
    name: String,
    transport: Box<dyn McpTransport>,
}

struct CatalogEntry {
    /// Name advertised to the model (possibly server-prefixed).
    advertised: String,
    /// Name the owning server knows the tool by.
    raw: String,
    server_idx: usize,
    schema: ToolSchema,
}

/// Aggregated view over every configured tool server.
///
/// One client per session: the session exclusively owns its tool-protocol
/// connections, and dropping the client releases them (stdio children are
/// killed on drop).
pub struct McpClient {
    servers: Vec<ServerHandle>,
    catalog: Vec<CatalogEntry>,
}

impl McpClient {
    /// Connect to each configured server, run the MCP initialize handshake,
    /// and aggregate the tool catalogs.  A tool name served by more than
    /// one server is disambiguated as `server__tool`.
    pub async fn connect(specs: &[ToolServerSpec]) -> Result<Self, McpError> {
        let mut servers = Vec::with_capacity(specs.len());
        for spec in specs {
            let transport: Box<dyn McpTransport> = match spec {
                ToolServerSpec::Stdio { name, command, args, env } => {
                    Box::new(StdioTransport::spawn(name, command, args, env)?)
                }
                ToolServerSpec::Http { url, .. } => Box::new(HttpTransport::new(url.clone())),
                ToolServerSpec::Sse { url, .. } => Box::new(SseTransport::new(url.clone())),
            };
            servers.push(ServerHandle { name: spec.name().to_string(), transport });
        }

        let mut client = Self { servers, catalog: Vec::new() };
        client.initialize_all().await?;
        client.refresh_catalog().await?;
        Ok(client)
    }

    async fn initialize_all(&self) -> Result<(), McpError> {
        for server in &self.servers {
            server
                .transport
                .request(
                    "initialize",
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {},
                        "clientInfo": { "name": "runa", "version": env!("CARGO_PKG_VERSION") },
                    }),
                )
                .await?;
            server.transport.notify("notifications/initialized", Value::Null).await?;
            debug!(server = %server.name, "tool server initialized");
        }
        Ok(())
    }

    async fn refresh_catalog(&mut self) -> Result<(), McpError> {
        let mut catalog: Vec<CatalogEntry> = Vec::new();
        for (idx, server) in self.servers.iter().enumerate() {
            let result = server.transport.request("tools/list", Value::Null).await?;
            let tools = result
                .get("tools")
                .and_then(|t| t.as_array())
                .ok_or_else(|| McpError::Protocol("tools/list result without a tools array".into()))?;
            for tool in tools {
                let Some(raw) = tool.get("name").and_then(|n| n.as_str()) else {
                    warn!(server = %server.name, "skipping tool without a name");
                    continue;
                };
                let description = tool
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_string();
                let parameters = tool
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({ "type": "object" }));

                let collides = catalog.iter().any(|e| e.advertised == raw);
                let advertised =
                    if collides { format!("{}__{raw}", server.name) } else { raw.to_string() };
                if collides {
                    debug!(server = %server.name, tool = raw, advertised, "tool name collision; prefixed");
                }

                catalog.push(CatalogEntry {
                    schema: ToolSchema {
                        name: advertised.clone(),
                        description,
                        parameters,
                    },
                    advertised,
                    raw: raw.to_string(),
                    server_idx: idx,
                });
            }
        }
        self.catalog = catalog;
        Ok(())
    }

    async fn call(&self, advertised: &str, arguments: &Value) -> Result<ToolOutcome, McpError> {
        let entry = self
            .catalog
            .iter()
            .find(|e| e.advertised == advertised)
            .ok_or_else(|| McpError::Protocol(format!("no tool server provides '{advertised}'")))?;
        let server = &self.servers[entry.server_idx];

        let result = server
            .transport
            .request("tools/call", json!({ "name": entry.raw, "arguments": arguments }))
            .await?;
        Ok(parse_tool_result(&result))
    }
}

/// Map a `tools/call` result into a [`ToolOutcome`].
///
/// `content` is an array of blocks; text blocks concatenate, and a diff
/// block (advertised by file-edit tools) becomes the structured form.
/// `isError` marks failures the server reports in-band.
fn parse_tool_result(result: &Value) -> ToolOutcome {
    let is_error = result.get("isError").and_then(|v| v.as_bool()).unwrap_or(false);
    let blocks = result.get("content").and_then(|c| c.as_array());

    let mut texts: Vec<String> = Vec::new();
    let mut diff: Option<FileDiff> = None;

    if let Some(blocks) = blocks {
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        texts.push(text.to_string());
                    }
                }
                Some("diff") => {
                    diff = Some(FileDiff {
                        path: block
                            .get("path")
                            .and_then(|p| p.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        old_text: block
                            .get("oldText")
                            .and_then(|t| t.as_str())
                            .map(str::to_string),
                        new_text: block
                            .get("newText")
                            .and_then(|t| t.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
                other => {
                    texts.push(format!("[unsupported content block: {}]", other.unwrap_or("?")));
                }
            }
        }
    }

    let content = match diff {
        Some(d) => ToolResultContent::Diff(d),
        None => ToolResultContent::Text(texts.join("\n")),
    };
    ToolOutcome { content, is_error, raw_output: Some(result.clone()) }
}

#[async_trait]
impl ToolDispatcher for McpClient {
    fn catalog(&self) -> Vec<ToolSchema> {
        self.catalog.iter().map(|e| e.schema.clone()).collect()
    }

    async fn dispatch(&self, name: &str, arguments: &Value) -> ToolOutcome {
        match self.call(name, arguments).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(tool = name, error = %e, "tool dispatch failed");
                ToolOutcome::error(format!("tool '{name}' failed: {e}"))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// A transport answering from a canned method → result table.
    struct TableTransport {
        responses: Mutex<std::collections::HashMap<String, Value>>,
    }

    impl TableTransport {
        fn new(entries: &[(&str, Value)]) -> Box<dyn McpTransport> {
            Box::new(Self {
                responses: Mutex::new(
                    entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl McpTransport for TableTransport {
        async fn request(&self, method: &str, _params: Value) -> Result<Value, McpError> {
            self.responses
                .lock()
                .unwrap()
                .get(method)
                .cloned()
                .ok_or_else(|| McpError::Server { code: -32601, message: method.to_string() })
        }

        async fn notify(&self, _method: &str, _params: Value) -> Result<(), McpError> {
            Ok(())
        }
    }

    fn tools_list(names: &[&str]) -> Value {
        json!({
            "tools": names
                .iter()
                .map(|n| json!({ "name": n, "description": format!("{n} tool"), "inputSchema": { "type": "object" } }))
                .collect::<Vec<_>>()
        })
    }

    async fn client_with(servers: Vec<(&str, Box<dyn McpTransport>)>) -> McpClient {
        let mut client = McpClient {
            servers: servers
                .into_iter()
                .map(|(name, transport)| ServerHandle { name: name.into(), transport })
                .collect(),
            catalog: Vec::new(),
        };
        client.refresh_catalog().await.unwrap();
        client
    }

    #[tokio::test]
    async fn catalog_aggregates_across_servers() {
        let client = client_with(vec![
            ("files", TableTransport::new(&[("tools/list", tools_list(&["read_file"]))])),
            ("shell", TableTransport::new(&[("tools/list", tools_list(&["exec"]))])),
        ])
        .await;
        let names: Vec<String> = client.catalog().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["read_file", "exec"]);
    }

    #[tokio::test]
    async fn colliding_tool_names_are_server_prefixed() {
        let client = client_with(vec![
            ("alpha", TableTransport::new(&[("tools/list", tools_list(&["search"]))])),
            ("beta", TableTransport::new(&[("tools/list", tools_list(&["search"]))])),
        ])
        .await;
        let names: Vec<String> = client.catalog().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["search", "beta__search"]);
    }

    #[tokio::test]
    async fn dispatch_routes_by_advertised_name() {
        let call_result = json!({ "content": [{ "type": "text", "text": "from beta" }] });
        let client = client_with(vec![
            ("alpha", TableTransport::new(&[("tools/list", tools_list(&["search"]))])),
            (
                "beta",
                TableTransport::new(&[
                    ("tools/list", tools_list(&["search"])),
                    ("tools/call", call_result),
                ]),
            ),
        ])
        .await;

        let outcome = client.dispatch("beta__search", &json!({"q": "x"})).await;
        assert!(!outcome.is_error);
        assert_eq!(outcome.content.to_string(), "from beta");
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_is_an_error_outcome() {
        let client = client_with(vec![(
            "files",
            TableTransport::new(&[("tools/list", tools_list(&["read_file"]))]),
        )])
        .await;
        let outcome = client.dispatch("ghost", &json!({})).await;
        assert!(outcome.is_error);
        assert!(outcome.content.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn server_failure_becomes_error_outcome_not_panic() {
        let client = client_with(vec![(
            "files",
            TableTransport::new(&[("tools/list", tools_list(&["read_file"]))]),
        )])
        .await;
        // tools/call is absent from the table → server error.
        let outcome = client.dispatch("read_file", &json!({"path": "/x"})).await;
        assert!(outcome.is_error);
    }

    // ── parse_tool_result ─────────────────────────────────────────────────────

    #[test]
    fn text_blocks_concatenate() {
        let out = parse_tool_result(&json!({
            "content": [
                { "type": "text", "text": "line one" },
                { "type": "text", "text": "line two" },
            ]
        }));
        assert_eq!(out.content.to_string(), "line one\nline two");
        assert!(!out.is_error);
        assert!(out.raw_output.is_some());
    }

    #[test]
    fn diff_block_becomes_structured_content() {
        let out = parse_tool_result(&json!({
            "content": [{
                "type": "diff",
                "path": "src/lib.rs",
                "oldText": "old",
                "newText": "new",
            }]
        }));
        match out.content {
            ToolResultContent::Diff(d) => {
                assert_eq!(d.path, "src/lib.rs");
                assert_eq!(d.old_text.as_deref(), Some("old"));
                assert_eq!(d.new_text, "new");
            }
            other => panic!("expected diff, got {other:?}"),
        }
    }

    #[test]
    fn is_error_flag_is_honored() {
        let out = parse_tool_result(&json!({
            "isError": true,
            "content": [{ "type": "text", "text": "it broke" }]
        }));
        assert!(out.is_error);
        assert_eq!(out.content.to_string(), "it broke");
    }

    #[test]
    fn unsupported_block_is_noted_not_dropped() {
        let out = parse_tool_result(&json!({
            "content": [{ "type": "audio", "data": "…" }]
        }));
        assert!(out.content.to_string().contains("unsupported"));
    }
}
