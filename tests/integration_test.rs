// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: MIT
/// Integration tests wiring the full stack the way the binary does:
/// config → store → skills → adapter, driven through the Agent Client
/// Protocol types against scripted providers.  No network, no real tool
/// servers.
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use runa_acp::acp::{
    ContentBlock, Error, LoadSessionRequest, NewSessionRequest, PromptRequest, SessionId,
    SessionNotification, SessionUpdate,
};
use runa_acp::{Adapter, DispatcherFactory, Notifier};
use runa_config::{Config, ToolServerSpec};
use runa_core::{NullDispatcher, ToolDispatcher};
use runa_model::mock::ScriptedProvider;
use runa_model::ChatProvider;
use runa_skills::SkillRegistry;
use runa_store::Store;

struct CollectingNotifier {
    updates: std::sync::Mutex<Vec<SessionUpdate>>,
}

impl CollectingNotifier {
    fn new() -> Arc<Self> {
        Arc::new(Self { updates: std::sync::Mutex::new(Vec::new()) })
    }

    fn rendered(&self) -> Vec<String> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|u| serde_json::to_string(u).unwrap_or_default())
            .collect()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn send(&self, notification: SessionNotification) {
        self.updates.lock().unwrap().push(notification.update);
    }
}

struct NullFactory;

#[async_trait]
impl DispatcherFactory for NullFactory {
    async fn connect(
        &self,
        _specs: &[ToolServerSpec],
    ) -> Result<Arc<dyn ToolDispatcher>, Error> {
        Ok(Arc::new(NullDispatcher))
    }
}

fn adapter_with_notifier(
    store: Arc<Store>,
    provider: Arc<dyn ChatProvider>,
    notifier: Arc<CollectingNotifier>,
) -> Arc<Adapter> {
    Arc::new(
        Adapter::new(
            store,
            provider,
            Arc::new(SkillRegistry::empty()),
            Arc::new(NullFactory),
            notifier,
            &Config::default(),
        )
        .unwrap(),
    )
}

fn text_prompt(session_id: &str, text: &str) -> PromptRequest {
    PromptRequest::new(
        SessionId::from(session_id.to_string()),
        vec![ContentBlock::from(text)],
    )
}

#[tokio::test]
async fn full_prompt_round_trip_persists_and_streams() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let notifier = CollectingNotifier::new();
    let provider: Arc<dyn ChatProvider> = Arc::new(ScriptedProvider::always_text("all done"));
    let adapter = adapter_with_notifier(store.clone(), provider, notifier.clone());

    let created = adapter
        .new_session(NewSessionRequest::new(PathBuf::from("/tmp/w")))
        .await
        .unwrap();
    let session_id = created.session_id.to_string();

    let resp = adapter.prompt(text_prompt(&session_id, "work")).await.unwrap();
    assert_eq!(serde_json::to_value(&resp).unwrap()["stopReason"], "end_turn");

    // The rendered system prompt was cached and the turn persisted.
    let record = store.load_session(&session_id).unwrap();
    assert!(record.system_prompt.contains("/tmp/w"));
    let events = store.events(&session_id).unwrap();
    assert_eq!(events.len(), 2);

    assert!(notifier.rendered().iter().any(|r| r.contains("all done")));
}

#[tokio::test]
async fn sessions_survive_a_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("runa.db");
    let session_id;

    // "First process": create a session and run one prompt.
    {
        let store = Arc::new(Store::open(&db_path).unwrap());
        let notifier = CollectingNotifier::new();
        let adapter = adapter_with_notifier(
            store,
            Arc::new(ScriptedProvider::always_text("first life")),
            notifier,
        );
        let created = adapter
            .new_session(NewSessionRequest::new(PathBuf::from("/tmp/w")))
            .await
            .unwrap();
        session_id = created.session_id.to_string();
        adapter.prompt(text_prompt(&session_id, "remember this")).await.unwrap();
    }

    // "Second process": load, replay, continue.
    let store = Arc::new(Store::open(&db_path).unwrap());
    let notifier = CollectingNotifier::new();
    let adapter = adapter_with_notifier(
        store,
        Arc::new(ScriptedProvider::always_text("second life")),
        notifier.clone(),
    );

    let req: LoadSessionRequest = serde_json::from_value(json!({
        "sessionId": session_id,
        "cwd": "/tmp/w",
        "mcpServers": [],
    }))
    .unwrap();
    adapter.load_session(req).await.unwrap();

    let rendered = notifier.rendered();
    assert!(rendered.iter().any(|r| r.contains("remember this")));
    assert!(rendered.iter().any(|r| r.contains("first life")));

    let resp = adapter.prompt(text_prompt(&session_id, "continue")).await.unwrap();
    assert_eq!(serde_json::to_value(&resp).unwrap()["stopReason"], "end_turn");
}
