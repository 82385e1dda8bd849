// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use agent_client_protocol::{
    AgentCapabilities, AuthenticateRequest, AuthenticateResponse, CancelNotification, Content,
    ContentBlock, ContentChunk, EmbeddedResourceResource, Error, Implementation,
    InitializeRequest, InitializeResponse, ListSessionsRequest, ListSessionsResponse,
    LoadSessionRequest, LoadSessionResponse, McpCapabilities, McpServer, NewSessionRequest,
    NewSessionResponse, PromptCapabilities, PromptRequest, PromptResponse, ProtocolVersion,
    SessionId, SessionInfo, SessionNotification, SessionUpdate, SetSessionModelRequest,
    SetSessionModelResponse, StopReason as AcpStopReason, TextContent, ToolCall as AcpToolCall,
    ToolCallContent, ToolCallId, ToolCallStatus, ToolCallUpdate, ToolCallUpdateFields,
    ToolKind as AcpToolKind,
};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use runa_config::{Config, ToolServerSpec};
use runa_core::{
    build_pipeline, classify_tool_kind, AgentEvent, BuiltinHookDeps, Engine, EngineSettings,
    HookError, HookPipeline, Session, StopReason, ToolDispatcher, ToolKind,
};
use runa_mcp_client::McpClient;
use runa_model::{ChatProvider, Message};
use runa_skills::SkillRegistry;
use runa_store::{EventRecord, RequestParams, SessionStatus, Store, StoreError};

const DEFAULT_SYSTEM_PROMPT: &str = "You are runa, a software engineering agent. \
You work inside the workspace at {{workspace}}. Use the available tools to \
inspect and change the workspace; explain what you did when you finish.";

/// Sink for `session/update` notifications.  The stdio server forwards them
/// to the protocol connection; tests collect them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: SessionNotification);
}

/// Builds the tool dispatcher for a session's configured tool servers.
/// Indirection so tests can inject scripted dispatchers instead of real
/// MCP connections.
#[async_trait]
pub trait DispatcherFactory: Send + Sync {
    async fn connect(&self, specs: &[ToolServerSpec]) -> Result<Arc<dyn ToolDispatcher>, Error>;
}

pub struct McpDispatcherFactory;

#[async_trait]
impl DispatcherFactory for McpDispatcherFactory {
    async fn connect(&self, specs: &[ToolServerSpec]) -> Result<Arc<dyn ToolDispatcher>, Error> {
        let client = McpClient::connect(specs)
            .await
            .map_err(|e| Error::new(-32000, format!("tool server unavailable: {e}")))?;
        Ok(Arc::new(client))
    }
}

/// Per-session state owned by the adapter.
///
/// The session mutex doubles as the turn lock: prompts on one session are
/// FIFO-serialized, and a prompt arriving while a cancel is pending waits
/// for the cancelled turn to finish persisting.  The cancellation token is
/// swapped fresh at the start of every prompt; `cancel` only trips the
/// current one and never blocks on the turn.
struct SessionHandle {
    session: tokio::sync::Mutex<Session>,
    dispatcher: Arc<dyn ToolDispatcher>,
    cancel: std::sync::Mutex<CancellationToken>,
}

impl SessionHandle {
    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        token
    }

    fn trip(&self) {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).cancel();
    }
}

/// The protocol adapter: maps ACP methods onto the engine and manages
/// session lifecycle, cancellation signals, and streaming updates.
///
/// All methods use the SDK's request/response types and return `Send`
/// futures; [`crate::AgentAdapter`] exposes this as the SDK's `?Send`
/// `Agent` trait at the connection boundary.
pub struct Adapter {
    store: Arc<Store>,
    provider: Arc<dyn ChatProvider>,
    skills: Arc<SkillRegistry>,
    factory: Arc<dyn DispatcherFactory>,
    notifier: Arc<dyn Notifier>,
    hooks: HookPipeline,
    settings: EngineSettings,
    default_model: String,
    session_defaults: RequestParams,
    handles: tokio::sync::Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl Adapter {
    pub fn new(
        store: Arc<Store>,
        provider: Arc<dyn ChatProvider>,
        skills: Arc<SkillRegistry>,
        factory: Arc<dyn DispatcherFactory>,
        notifier: Arc<dyn Notifier>,
        config: &Config,
    ) -> Result<Self, HookError> {
        let hooks = build_pipeline(
            &config.hooks.enabled,
            &BuiltinHookDeps {
                skills: skills.clone(),
                provider: provider.clone(),
                compaction_model: config.session.compaction_model.clone(),
            },
        )?;
        Ok(Self {
            store,
            provider,
            skills,
            factory,
            notifier,
            hooks,
            settings: EngineSettings::from_config(&config.engine, &config.session),
            default_model: config.provider.model.clone(),
            session_defaults: RequestParams {
                compaction_threshold: config.session.compaction_threshold,
                compaction_keep_head: config.session.compaction_keep_head,
                compaction_keep_tail: config.session.compaction_keep_tail,
                ..Default::default()
            },
            handles: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    // ─── initialize ──────────────────────────────────────────────────────────

    /// Capability advertisement only — never allocates sessions.
    pub async fn initialize(&self, req: InitializeRequest) -> Result<InitializeResponse, Error> {
        let protocol_version = if req.protocol_version <= ProtocolVersion::LATEST {
            req.protocol_version
        } else {
            ProtocolVersion::LATEST
        };

        Ok(InitializeResponse::new(protocol_version)
            .agent_capabilities(
                AgentCapabilities::new()
                    .load_session(true)
                    .prompt_capabilities(PromptCapabilities::new().image(true).embedded_context(true))
                    .mcp_capabilities(McpCapabilities::new().http(true).sse(true)),
            )
            .agent_info(Implementation::new("runa", env!("CARGO_PKG_VERSION"))))
    }

    /// runa defines no auth methods; authentication always succeeds.
    pub async fn authenticate(&self, _req: AuthenticateRequest) -> Result<AuthenticateResponse, Error> {
        Ok(AuthenticateResponse::new())
    }

    // ─── session/new ─────────────────────────────────────────────────────────

    pub async fn new_session(&self, req: NewSessionRequest) -> Result<NewSessionResponse, Error> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let workspace = req.cwd.display().to_string();
        self.create_session_with_id(&session_id, &workspace, &req.mcp_servers).await?;
        Ok(NewSessionResponse::new(session_id))
    }

    /// Session creation with a caller-chosen id, so duplicate detection is
    /// exercisable; `new_session` routes through this with a fresh UUID.
    pub async fn create_session_with_id(
        &self,
        session_id: &str,
        workspace: &str,
        servers: &[McpServer],
    ) -> Result<(), Error> {
        let specs = tool_server_specs(servers);
        let dispatcher = self.factory.connect(&specs).await?;
        let catalog = dispatcher.catalog();

        let mut session = Session::create(
            self.store.clone(),
            session_id,
            DEFAULT_SYSTEM_PROMPT,
            json!({ "workspace": workspace }),
            catalog,
            self.session_defaults.clone(),
            &self.default_model,
            workspace,
        )
        .map_err(|e| match e {
            StoreError::AlreadyExists(_) => Error::invalid_params().data(json!({
                "message": "duplicate session id",
                "sessionId": session_id,
            })),
            other => storage_error(other),
        })?;
        session.set_always_on(self.always_on_injections());

        debug!(session_id = %session_id, workspace = %workspace, "created session");
        self.handles.lock().await.insert(
            session_id.to_string(),
            Arc::new(SessionHandle {
                session: tokio::sync::Mutex::new(session),
                dispatcher,
                cancel: std::sync::Mutex::new(CancellationToken::new()),
            }),
        );
        Ok(())
    }

    // ─── session/load ────────────────────────────────────────────────────────

    /// Rehydrate a persisted session and replay its transcript to the client
    /// as `session/update` notifications before returning.  A previously
    /// completed or cancelled session re-enters `active`.
    pub async fn load_session(&self, req: LoadSessionRequest) -> Result<LoadSessionResponse, Error> {
        let session_id = req.session_id.to_string();
        let mut session =
            Session::load(self.store.clone(), &session_id).map_err(|e| match e {
                StoreError::NotFound(_) => unknown_session(&session_id),
                other => storage_error(other),
            })?;
        session.set_always_on(self.always_on_injections());
        if session.record().status.is_terminal() {
            session.set_status(SessionStatus::Active).map_err(storage_error)?;
        }

        let specs = tool_server_specs(&req.mcp_servers);
        let dispatcher = self.factory.connect(&specs).await?;

        let events = self.store.events(&session_id).map_err(storage_error)?;
        for update in replay_updates(&events) {
            self.notifier
                .send(SessionNotification::new(
                    SessionId::from(session_id.clone()),
                    update,
                ))
                .await;
        }

        self.handles.lock().await.insert(
            session_id.clone(),
            Arc::new(SessionHandle {
                session: tokio::sync::Mutex::new(session),
                dispatcher,
                cancel: std::sync::Mutex::new(CancellationToken::new()),
            }),
        );

        Ok(LoadSessionResponse::new())
    }

    // ─── session/prompt ──────────────────────────────────────────────────────

    pub async fn prompt(&self, req: PromptRequest) -> Result<PromptResponse, Error> {
        let session_id = req.session_id.to_string();
        let handle = self.handle(&session_id).await?;
        let text = extract_prompt_text(&req.prompt)?;

        // FIFO turn lock: a prompt racing a cancellation (or another prompt)
        // queues behind it.
        let mut session = handle.session.lock().await;
        let cancel = handle.fresh_token();
        if session.record().status.is_terminal() {
            session.set_status(SessionStatus::Active).map_err(storage_error)?;
        }

        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
        let notifier = self.notifier.clone();
        let notify_session_id = session_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Some(update) = translate_agent_event(event) {
                    notifier
                        .send(SessionNotification::new(
                            SessionId::from(notify_session_id.clone()),
                            update,
                        ))
                        .await;
                }
            }
        });

        let engine = Engine::new(
            self.provider.clone(),
            handle.dispatcher.clone(),
            self.hooks.clone(),
            self.settings.clone(),
        );
        let run = engine.run(&mut session, &text, tx, &cancel).await;
        let _ = forwarder.await;

        let stop_reason = match run {
            Ok(stop) => stop,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "prompt aborted");
                return Err(match e {
                    runa_core::EngineError::Store(s) => storage_error(s),
                    other => Error::internal_error().data(other.to_string()),
                });
            }
        };

        match stop_reason {
            StopReason::EndTurn => Ok(PromptResponse::new(AcpStopReason::EndTurn)),
            StopReason::MaxTurnsReached => Ok(PromptResponse::new(AcpStopReason::MaxTurnRequests)),
            StopReason::Cancelled => {
                session.set_status(SessionStatus::Cancelled).map_err(storage_error)?;
                Ok(PromptResponse::new(AcpStopReason::Cancelled))
            }
            StopReason::Error => Err(Error::new(
                -32000,
                "the turn failed; details were recorded in the conversation",
            )),
        }
    }

    // ─── session/cancel ──────────────────────────────────────────────────────

    /// Trip the session's cancellation signal.  Idempotent, never blocks on
    /// the running turn; cancelling an unknown session is a no-op.
    pub async fn cancel(&self, notif: CancelNotification) -> Result<(), Error> {
        let session_id = notif.session_id.to_string();
        match self.handles.lock().await.get(&session_id) {
            Some(handle) => handle.trip(),
            None => warn!(session_id = %session_id, "cancel for unknown session ignored"),
        }
        Ok(())
    }

    // ─── cheap session mutations ─────────────────────────────────────────────

    pub async fn list_sessions(&self, req: ListSessionsRequest) -> Result<ListSessionsResponse, Error> {
        let cwd_filter = req.cwd.as_ref().map(|p| p.display().to_string());
        let sessions = self.store.list_sessions(None).map_err(storage_error)?;
        let infos: Vec<SessionInfo> = sessions
            .into_iter()
            .filter(|s| cwd_filter.as_deref().map(|c| s.workspace_path == c).unwrap_or(true))
            .map(|s| {
                let mut info = SessionInfo::new(
                    SessionId::from(s.session_id),
                    PathBuf::from(s.workspace_path),
                );
                info.updated_at = Some(s.updated_at.to_rfc3339());
                info
            })
            .collect();
        let next_cursor: Option<String> = None;
        Ok(ListSessionsResponse::new(infos).next_cursor(next_cursor))
    }

    pub async fn set_session_model(
        &self,
        req: SetSessionModelRequest,
    ) -> Result<SetSessionModelResponse, Error> {
        let session_id = req.session_id.to_string();
        self.store
            .set_model(&session_id, &req.model_id.to_string())
            .map_err(|e| match e {
                StoreError::NotFound(_) => unknown_session(&session_id),
                other => storage_error(other),
            })?;
        if let Some(handle) = self.handles.lock().await.get(&session_id) {
            handle.session.lock().await.reload().map_err(storage_error)?;
        }
        Ok(SetSessionModelResponse::new())
    }

    /// Switch the session mode.  The protocol crate at this pin has no
    /// dedicated method for this, so it stays an adapter-level operation.
    pub async fn set_session_mode(&self, session_id: &str, mode_id: &str) -> Result<(), Error> {
        const MODES: &[&str] = &["default", "plan"];
        if !MODES.contains(&mode_id) {
            return Err(Error::invalid_params().data(json!({
                "message": "unknown mode",
                "modeId": mode_id,
            })));
        }
        self.store.set_mode(session_id, mode_id).map_err(|e| match e {
            StoreError::NotFound(_) => unknown_session(session_id),
            other => storage_error(other),
        })?;
        if let Some(handle) = self.handles.lock().await.get(session_id) {
            handle.session.lock().await.reload().map_err(storage_error)?;
        }
        Ok(())
    }

    /// Update one request parameter of a session.  Adapter-level for the
    /// same reason as [`set_session_mode`](Self::set_session_mode).
    pub async fn set_session_config_option(
        &self,
        session_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), Error> {
        let record = self.store.load_session(session_id).map_err(|e| match e {
            StoreError::NotFound(_) => unknown_session(session_id),
            other => storage_error(other),
        })?;
        let mut rp = record.request_params;
        match key {
            "temperature" => rp.temperature = value.as_f64().map(|f| f as f32),
            "top_p" => rp.top_p = value.as_f64().map(|f| f as f32),
            "max_tokens" => rp.max_tokens = value.as_u64().map(|n| n as u32),
            "reserve_tokens" => rp.reserve_tokens = value.as_u64(),
            "compaction_threshold" => {
                rp.compaction_threshold = value.as_u64().unwrap_or(rp.compaction_threshold)
            }
            "compaction_keep_head" => {
                rp.compaction_keep_head =
                    value.as_u64().unwrap_or(rp.compaction_keep_head as u64) as usize
            }
            "compaction_keep_tail" => {
                rp.compaction_keep_tail =
                    value.as_u64().unwrap_or(rp.compaction_keep_tail as u64) as usize
            }
            other => {
                return Err(Error::invalid_params().data(json!({
                    "message": "unknown config option",
                    "key": other,
                })))
            }
        }
        self.store.update_request_params(session_id, &rp).map_err(storage_error)?;
        if let Some(handle) = self.handles.lock().await.get(session_id) {
            handle.session.lock().await.reload().map_err(storage_error)?;
        }
        Ok(())
    }

    // ─── helpers ─────────────────────────────────────────────────────────────

    async fn handle(&self, session_id: &str) -> Result<Arc<SessionHandle>, Error> {
        self.handles
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| unknown_session(session_id))
    }

    fn always_on_injections(&self) -> Vec<Message> {
        self.skills
            .always_on()
            .filter_map(|meta| match self.skills.activate(&meta.name) {
                Ok(body) => Some(Message::user(format!("Context: {body}"))),
                Err(e) => {
                    warn!(skill = %meta.name, error = %e, "failed to activate always-on skill");
                    None
                }
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

fn unknown_session(session_id: &str) -> Error {
    Error::invalid_params().data(json!({
        "message": "unknown session",
        "sessionId": session_id,
    }))
}

fn storage_error(e: StoreError) -> Error {
    Error::new(-32000, e.to_string())
}

/// Map the protocol's tool-server specs to the MCP client's configuration.
/// Unknown transports are skipped with a warning (`McpServer` is
/// non-exhaustive).
fn tool_server_specs(servers: &[McpServer]) -> Vec<ToolServerSpec> {
    servers
        .iter()
        .filter_map(|server| match server {
            McpServer::Stdio(s) => Some(ToolServerSpec::Stdio {
                name: s.name.clone(),
                command: s.command.to_string_lossy().into_owned(),
                args: s.args.clone(),
                env: s.env.iter().map(|e| (e.name.clone(), e.value.clone())).collect(),
            }),
            McpServer::Http(s) => Some(ToolServerSpec::Http { name: s.name.clone(), url: s.url.clone() }),
            McpServer::Sse(s) => Some(ToolServerSpec::Sse { name: s.name.clone(), url: s.url.clone() }),
            other => {
                warn!(?other, "skipping tool server with unsupported transport");
                None
            }
        })
        .collect()
}

/// Flatten prompt blocks into the user message text.  Image, audio, and
/// resource blocks degrade to placeholder markers.
fn extract_prompt_text(blocks: &[ContentBlock]) -> Result<String, Error> {
    if blocks.is_empty() {
        return Err(Error::invalid_params().data(json!({
            "message": "prompt has no content blocks",
        })));
    }
    let mut content = String::new();
    for block in blocks {
        if !content.is_empty() {
            content.push('\n');
        }
        match block {
            ContentBlock::Text(text) => content.push_str(&text.text),
            ContentBlock::ResourceLink(link) => {
                content.push_str(&format!("[Resource: {}] {}", link.name, link.uri));
            }
            ContentBlock::Resource(resource) => match &resource.resource {
                EmbeddedResourceResource::TextResourceContents(text) => {
                    content.push_str(&format!("[Embedded resource: {}]\n{}", text.uri, text.text));
                }
                EmbeddedResourceResource::BlobResourceContents(blob) => {
                    content.push_str(&format!(
                        "[Embedded resource: {}] (blob, {} bytes)",
                        blob.uri,
                        blob.blob.len()
                    ));
                }
                _ => content.push_str("[Embedded resource: unsupported]"),
            },
            ContentBlock::Image(image) => {
                content.push_str(&format!("[Image attached: {}]", image.mime_type));
            }
            _ => content.push_str("[Unsupported content block]"),
        }
    }
    if content.trim().is_empty() {
        return Err(Error::invalid_params().data(json!({
            "message": "prompt blocks contained no text",
        })));
    }
    Ok(content)
}

fn text_chunk(text: String) -> ContentChunk {
    ContentChunk::new(ContentBlock::Text(TextContent::new(text)))
}

fn text_tool_content(text: String) -> Vec<ToolCallContent> {
    vec![ToolCallContent::Content(Content::new(ContentBlock::Text(TextContent::new(text))))]
}

fn acp_tool_kind(kind: ToolKind) -> AcpToolKind {
    match kind {
        ToolKind::Read => AcpToolKind::Read,
        ToolKind::Edit => AcpToolKind::Edit,
        ToolKind::Execute => AcpToolKind::Execute,
        ToolKind::Search => AcpToolKind::Search,
        ToolKind::Move => AcpToolKind::Move,
        ToolKind::Delete => AcpToolKind::Delete,
        ToolKind::Other => AcpToolKind::Other,
    }
}

/// Map one engine event to its wire update, if it has one.
fn translate_agent_event(event: AgentEvent) -> Option<SessionUpdate> {
    match event {
        AgentEvent::ContentDelta(text) => Some(SessionUpdate::AgentMessageChunk(text_chunk(text))),
        // Thinking deltas stay off the wire: the protocol pin has no
        // thought-chunk update.  Reasoning is still persisted per event.
        AgentEvent::ReasoningDelta(_) => None,
        AgentEvent::ToolCallStarted { id, name, kind } => Some(SessionUpdate::ToolCall(
            AcpToolCall::new(ToolCallId::from(id), name)
                .kind(acp_tool_kind(kind))
                .status(ToolCallStatus::InProgress),
        )),
        // Argument fragments have no per-delta update kind; the finished
        // update carries the full output instead.
        AgentEvent::ToolCallArgumentsDelta { .. } => None,
        AgentEvent::ToolCallFinished { id, name, content, is_error, raw_output } => {
            let status = if is_error { ToolCallStatus::Failed } else { ToolCallStatus::Completed };
            Some(SessionUpdate::ToolCallUpdate(ToolCallUpdate::new(
                ToolCallId::from(id),
                ToolCallUpdateFields::new()
                    .status(status)
                    .title(name)
                    .content(text_tool_content(content.to_string()))
                    .raw_output(raw_output),
            )))
        }
        AgentEvent::TokenUsage(_)
        | AgentEvent::Compacted { .. }
        | AgentEvent::TurnComplete { .. }
        | AgentEvent::Aborted { .. }
        | AgentEvent::Error(_) => None,
    }
}

/// Map the stored transcript into replay notifications, in order.
fn replay_updates(events: &[EventRecord]) -> Vec<SessionUpdate> {
    let mut updates = Vec::new();
    for event in events {
        match event.role {
            runa_model::Role::User => {
                if let Some(text) = &event.content {
                    updates.push(SessionUpdate::UserMessageChunk(text_chunk(text.clone())));
                }
            }
            runa_model::Role::System => {
                // Compaction summaries live as system-role events.
                if let Some(text) = &event.content {
                    updates.push(SessionUpdate::AgentMessageChunk(text_chunk(text.clone())));
                }
            }
            runa_model::Role::Assistant => {
                if let Some(text) = event.content.as_ref().filter(|t| !t.is_empty()) {
                    updates.push(SessionUpdate::AgentMessageChunk(text_chunk(text.clone())));
                }
                for (id, name, arguments) in event.tool_calls() {
                    updates.push(SessionUpdate::ToolCall(
                        AcpToolCall::new(ToolCallId::from(id), name.clone())
                            .kind(acp_tool_kind(classify_tool_kind(&name)))
                            .status(ToolCallStatus::InProgress)
                            .raw_input(arguments),
                    ));
                }
            }
            runa_model::Role::Tool => {
                let Some(id) = event.tool_call_id.clone() else { continue };
                let is_error = event
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("is_error"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let status = if is_error { ToolCallStatus::Failed } else { ToolCallStatus::Completed };
                let raw_output = event.metadata.as_ref().and_then(|m| m.get("raw_output")).cloned();
                let mut fields = ToolCallUpdateFields::new().status(status).raw_output(raw_output);
                if let Some(text) = &event.content {
                    fields = fields.content(text_tool_content(text.clone()));
                }
                updates.push(SessionUpdate::ToolCallUpdate(ToolCallUpdate::new(
                    ToolCallId::from(id),
                    fields,
                )));
            }
        }
    }
    updates
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
