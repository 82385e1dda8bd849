// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::jsonrpc::{McpError, Notification, Request, Response};

/// One JSON-RPC connection to a tool server.
///
/// Implementations serialize requests internally; callers may share a
/// transport across tasks.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError>;

    /// Fire-and-forget; the server must not reply.
    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError>;
}

fn next_id(counter: &AtomicI64) -> i64 {
    counter.fetch_add(1, Ordering::Relaxed)
}

// ─── stdio ───────────────────────────────────────────────────────────────────

struct StdioIo {
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    /// Responses read while waiting for a different id (out-of-order reply).
    parked: HashMap<i64, Response>,
}

/// Line-delimited JSON-RPC over a child process's stdio.
///
/// The child is spawned with `kill_on_drop`, so dropping the transport (on
/// session close, error, or cancellation) releases the process.
pub struct StdioTransport {
    _child: Child,
    io: Mutex<StdioIo>,
    ids: AtomicI64,
    name: String,
}

impl StdioTransport {
    pub fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| McpError::Spawn { name: name.to_string(), source })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("child stdout unavailable".into()))?;

        debug!(server = name, command, "spawned stdio tool server");
        Ok(Self {
            _child: child,
            io: Mutex::new(StdioIo {
                stdin,
                lines: BufReader::new(stdout).lines(),
                parked: HashMap::new(),
            }),
            ids: AtomicI64::new(1),
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = next_id(&self.ids);
        let line = serde_json::to_string(&Request::new(id, method, params))
            .map_err(|e| McpError::Protocol(e.to_string()))?;

        let mut io = self.io.lock().await;
        io.stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        io.stdin.flush().await.map_err(|e| McpError::Transport(e.to_string()))?;

        if let Some(parked) = io.parked.remove(&id) {
            return parked.into_result();
        }

        loop {
            let line = io
                .lines
                .next_line()
                .await
                .map_err(|e| McpError::Transport(e.to_string()))?
                .ok_or_else(|| {
                    McpError::Transport(format!("tool server '{}' closed its stdout", self.name))
                })?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(resp) = serde_json::from_str::<Response>(&line) else {
                warn!(server = %self.name, "skipping unparseable line from tool server");
                continue;
            };
            match &resp.id {
                None => continue, // server-initiated notification; not ours
                Some(v) if v.as_i64() == Some(id) => return resp.into_result(),
                Some(v) => {
                    if let Some(other) = v.as_i64() {
                        io.parked.insert(other, resp);
                    }
                }
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let line = serde_json::to_string(&Notification::new(method, params))
            .map_err(|e| McpError::Protocol(e.to_string()))?;
        let mut io = self.io.lock().await;
        io.stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        io.stdin.flush().await.map_err(|e| McpError::Transport(e.to_string()))
    }
}

// ─── http ────────────────────────────────────────────────────────────────────

/// One JSON-RPC request per HTTP POST.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    ids: AtomicI64,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), url: url.into(), ids: AtomicI64::new(1) }
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<String, McpError> {
        let resp = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(McpError::Transport(format!("HTTP {}", resp.status())));
        }
        resp.text().await.map_err(|e| McpError::Transport(e.to_string()))
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = next_id(&self.ids);
        let body = self.post(&Request::new(id, method, params)).await?;
        let resp: Response = serde_json::from_str(&body)
            .map_err(|e| McpError::Protocol(format!("bad response body: {e}")))?;
        resp.into_result()
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        self.post(&Notification::new(method, params)).await.map(|_| ())
    }
}

// ─── sse ─────────────────────────────────────────────────────────────────────

/// POST requests whose responses may arrive as an SSE event stream.
///
/// The response body is drained and the first `data:` payload answering our
/// id wins; plain JSON bodies are accepted as a degenerate single-event
/// stream so servers may answer either way.
pub struct SseTransport {
    client: reqwest::Client,
    url: String,
    ids: AtomicI64,
}

impl SseTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), url: url.into(), ids: AtomicI64::new(1) }
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = next_id(&self.ids);
        let resp = self
            .client
            .post(&self.url)
            .header("accept", "application/json, text/event-stream")
            .json(&Request::new(id, method, params))
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(McpError::Transport(format!("HTTP {}", resp.status())));
        }
        let body = resp.text().await.map_err(|e| McpError::Transport(e.to_string()))?;

        for payload in sse_payloads(&body) {
            if let Ok(parsed) = serde_json::from_str::<Response>(payload) {
                if parsed.answers(id) {
                    return parsed.into_result();
                }
            }
        }
        // Plain JSON body fallback.
        let parsed: Response = serde_json::from_str(&body)
            .map_err(|e| McpError::Protocol(format!("no matching SSE event and body is not JSON: {e}")))?;
        parsed.into_result()
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&Notification::new(method, params))
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(McpError::Transport(format!("HTTP {}", resp.status())));
        }
        Ok(())
    }
}

/// Extract the `data:` payloads from an SSE body.
fn sse_payloads(body: &str) -> impl Iterator<Item = &str> {
    body.lines().filter_map(|line| line.strip_prefix("data:").map(str::trim))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
