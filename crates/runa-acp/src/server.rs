// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
//! SDK-based stdio server.
//!
//! The protocol crate's `AgentSideConnection` owns the JSON-RPC framing on
//! stdin/stdout.  It is `!Send`, so everything protocol-facing runs inside
//! a `LocalSet`; the engine keeps running on ordinary `tokio::spawn` tasks
//! and reaches the connection through an mpsc bridge:
//!
//! ```text
//! stdin → AgentSideConnection → AgentAdapter (?Send) → Adapter (Send)
//! Adapter → ChannelNotifier → mpsc → bridge task → connection → stdout
//! ```

use std::rc::Rc;
use std::sync::Arc;

use agent_client_protocol::{
    Agent, AgentSideConnection, AuthenticateRequest, AuthenticateResponse, CancelNotification,
    Client, Error, InitializeRequest, InitializeResponse, ListSessionsRequest,
    ListSessionsResponse, LoadSessionRequest, LoadSessionResponse, NewSessionRequest,
    NewSessionResponse, PromptRequest, PromptResponse, SessionNotification,
    SetSessionModelRequest, SetSessionModelResponse,
};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

use crate::adapter::{Adapter, Notifier};

/// Forwards `session/update` notifications into the bridge channel.  The
/// engine side is `Send`; the receiving end is drained inside the
/// `LocalSet` where the `!Send` connection lives.
pub struct ChannelNotifier {
    tx: mpsc::Sender<SessionNotification>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<SessionNotification>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn send(&self, notification: SessionNotification) {
        if self.tx.send(notification).await.is_err() {
            warn!("notification channel closed; dropping session update");
        }
    }
}

/// Exposes the `Send` [`Adapter`] through the SDK's `?Send` `Agent` trait
/// at the connection boundary.
pub struct AgentAdapter {
    inner: Arc<Adapter>,
}

impl AgentAdapter {
    pub fn new(inner: Arc<Adapter>) -> Self {
        Self { inner }
    }
}

#[async_trait(?Send)]
impl Agent for AgentAdapter {
    async fn initialize(&self, req: InitializeRequest) -> Result<InitializeResponse, Error> {
        self.inner.initialize(req).await
    }

    async fn authenticate(&self, req: AuthenticateRequest) -> Result<AuthenticateResponse, Error> {
        self.inner.authenticate(req).await
    }

    async fn new_session(&self, req: NewSessionRequest) -> Result<NewSessionResponse, Error> {
        self.inner.new_session(req).await
    }

    async fn load_session(&self, req: LoadSessionRequest) -> Result<LoadSessionResponse, Error> {
        self.inner.load_session(req).await
    }

    async fn prompt(&self, req: PromptRequest) -> Result<PromptResponse, Error> {
        self.inner.prompt(req).await
    }

    async fn cancel(&self, notif: CancelNotification) -> Result<(), Error> {
        self.inner.cancel(notif).await
    }

    async fn list_sessions(&self, req: ListSessionsRequest) -> Result<ListSessionsResponse, Error> {
        self.inner.list_sessions(req).await
    }

    async fn set_session_model(
        &self,
        req: SetSessionModelRequest,
    ) -> Result<SetSessionModelResponse, Error> {
        self.inner.set_session_model(req).await
    }
}

/// Serve the client protocol on stdin/stdout until EOF.
///
/// `updates` is the receiving end of the channel the adapter's
/// [`ChannelNotifier`] writes to.
pub async fn serve_stdio(
    adapter: Arc<Adapter>,
    mut updates: mpsc::Receiver<SessionNotification>,
) -> anyhow::Result<()> {
    let local = tokio::task::LocalSet::new();

    local
        .run_until(async move {
            let stdin = tokio::io::stdin().compat();
            let stdout = tokio::io::stdout().compat_write();

            // The connection is !Send and must stay inside the LocalSet.
            let (connection, io_task) =
                AgentSideConnection::new(AgentAdapter::new(adapter), stdout, stdin, |fut| {
                    tokio::task::spawn_local(fut);
                });
            let connection = Rc::new(connection);

            // Bridge task: drain engine-side notifications into the connection.
            let bridge = connection.clone();
            tokio::task::spawn_local(async move {
                while let Some(notification) = updates.recv().await {
                    if let Err(e) = bridge.session_notification(notification).await {
                        warn!(error = ?e, "failed to forward session update");
                    }
                }
                debug!("notification bridge ended (channel closed)");
            });

            debug!("serving client protocol on stdio");
            tokio::task::spawn_local(io_task)
                .await
                .map_err(|e| anyhow::anyhow!("protocol io task panicked: {e}"))?
                .map_err(|e| anyhow::anyhow!("protocol io error: {e}"))?;
            Ok(())
        })
        .await
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use agent_client_protocol::{ContentBlock, ProtocolVersion, SessionId};
    use runa_config::{Config, ToolServerSpec};
    use runa_core::{NullDispatcher, ToolDispatcher};
    use runa_model::mock::ScriptedProvider;
    use runa_skills::SkillRegistry;
    use runa_store::Store;

    struct NullFactory;

    #[async_trait]
    impl crate::adapter::DispatcherFactory for NullFactory {
        async fn connect(
            &self,
            _specs: &[ToolServerSpec],
        ) -> Result<Arc<dyn ToolDispatcher>, Error> {
            Ok(Arc::new(NullDispatcher))
        }
    }

    fn adapter() -> (Arc<Adapter>, mpsc::Receiver<SessionNotification>) {
        let (tx, rx) = mpsc::channel(64);
        let adapter = Adapter::new(
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(ScriptedProvider::always_text("served")),
            Arc::new(SkillRegistry::empty()),
            Arc::new(NullFactory),
            Arc::new(ChannelNotifier::new(tx)),
            &Config::default(),
        )
        .unwrap();
        (Arc::new(adapter), rx)
    }

    #[tokio::test]
    async fn agent_adapter_forwards_initialize() {
        let (adapter, _rx) = adapter();
        let agent = AgentAdapter::new(adapter);
        let resp = agent
            .initialize(InitializeRequest::new(ProtocolVersion::LATEST))
            .await
            .unwrap();
        assert!(resp.protocol_version <= ProtocolVersion::LATEST);
    }

    #[tokio::test]
    async fn agent_adapter_runs_a_full_prompt_and_updates_flow_through_channel() {
        let (adapter, mut rx) = adapter();
        let agent = AgentAdapter::new(adapter);

        let created = agent
            .new_session(NewSessionRequest::new(PathBuf::from("/tmp/w")))
            .await
            .unwrap();
        let resp = agent
            .prompt(PromptRequest::new(
                SessionId::from(created.session_id.to_string()),
                vec![ContentBlock::from("hi")],
            ))
            .await
            .unwrap();
        assert_eq!(serde_json::to_value(&resp).unwrap()["stopReason"], "end_turn");

        let mut saw_message = false;
        while let Ok(notification) = rx.try_recv() {
            let rendered = serde_json::to_string(&notification).unwrap_or_default();
            if rendered.contains("served") {
                saw_message = true;
            }
        }
        assert!(saw_message, "streamed update must reach the bridge channel");
    }

    #[tokio::test]
    async fn channel_notifier_survives_a_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let notifier = ChannelNotifier::new(tx);
        // Must not panic or error.
        notifier
            .send(SessionNotification::new(
                SessionId::from("s".to_string()),
                agent_client_protocol::SessionUpdate::AgentMessageChunk(
                    agent_client_protocol::ContentChunk::new(ContentBlock::from("late")),
                ),
            ))
            .await;
    }
}
