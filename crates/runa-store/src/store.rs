// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::debug;

use runa_model::{Message, Role, ToolSchema};

use crate::{
    CompactionRecord, EventRecord, NewEvent, RequestParams, SessionRecord, SessionStatus,
    StoreError,
};

type Result<T> = std::result::Result<T, StoreError>;

/// The single owner of all persisted state.
///
/// Shared across sessions behind an `Arc`; the inner connection mutex
/// serializes writes (reads are short enough that sharing the same lock has
/// never shown up in a profile).
pub struct Store {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("creating {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| StoreError::Unavailable(format!("opening {}: {e}", db_path.display())))?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS prompts (
                prompt_id  TEXT PRIMARY KEY,
                template   TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                session_id       TEXT PRIMARY KEY,
                prompt_id        TEXT NOT NULL,
                prompt_args      TEXT NOT NULL,
                system_prompt    TEXT NOT NULL,
                tool_definitions TEXT NOT NULL,
                request_params   TEXT NOT NULL,
                model_identifier TEXT NOT NULL,
                workspace_path   TEXT NOT NULL,
                mode             TEXT NOT NULL DEFAULT 'default',
                status           TEXT NOT NULL DEFAULT 'active',
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                completed_at     TEXT,
                FOREIGN KEY (prompt_id) REFERENCES prompts(prompt_id)
            );

            CREATE TABLE IF NOT EXISTS events (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id        TEXT NOT NULL,
                conv_index        INTEGER NOT NULL,
                timestamp         TEXT NOT NULL,
                role              TEXT NOT NULL,
                content           TEXT,
                reasoning_content TEXT,
                tool_call_id      TEXT,
                tool_call_name    TEXT,
                tool_arguments    TEXT,
                prompt_tokens     INTEGER,
                completion_tokens INTEGER,
                total_tokens      INTEGER,
                metadata          TEXT,
                FOREIGN KEY (session_id) REFERENCES sessions(session_id)
            );

            CREATE TABLE IF NOT EXISTS compactions (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id   TEXT NOT NULL,
                before_count INTEGER NOT NULL,
                after_count  INTEGER NOT NULL,
                head_kept    INTEGER NOT NULL,
                tail_kept    INTEGER NOT NULL,
                summary      TEXT NOT NULL,
                timestamp    TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(session_id)
            );

            CREATE TABLE IF NOT EXISTS turn_checkpoints (
                session_id TEXT PRIMARY KEY,
                reasoning  TEXT NOT NULL,
                content    TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(session_id)
            );

            CREATE INDEX IF NOT EXISTS idx_events_session_conv
                ON events(session_id, conv_index);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }

    // ─── Prompts ─────────────────────────────────────────────────────────────

    /// Upsert a prompt template; the id is a content hash so a given
    /// `prompt_id` maps to exactly one template text forever.
    pub fn put_prompt(&self, template: &str) -> Result<String> {
        let prompt_id = prompt_id_for(template);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO prompts (prompt_id, template, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(prompt_id) DO NOTHING",
            params![prompt_id, template, Utc::now().to_rfc3339()],
        )?;
        Ok(prompt_id)
    }

    pub fn get_prompt(&self, prompt_id: &str) -> Result<String> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT template FROM prompts WHERE prompt_id = ?1",
            [prompt_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("prompt {prompt_id}")))
    }

    // ─── Sessions ────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_session(
        &self,
        session_id: &str,
        prompt_id: &str,
        prompt_args: serde_json::Value,
        system_prompt: &str,
        tool_definitions: &[ToolSchema],
        request_params: RequestParams,
        model_identifier: &str,
        workspace_path: &str,
    ) -> Result<SessionRecord> {
        let now = Utc::now();
        let conn = self.lock()?;

        let exists: Option<String> = conn
            .query_row(
                "SELECT session_id FROM sessions WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::AlreadyExists(format!("session {session_id}")));
        }

        conn.execute(
            r#"
            INSERT INTO sessions (session_id, prompt_id, prompt_args, system_prompt,
                                  tool_definitions, request_params, model_identifier,
                                  workspace_path, mode, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'default', 'active', ?9, ?9)
            "#,
            params![
                session_id,
                prompt_id,
                prompt_args.to_string(),
                system_prompt,
                serde_json::to_string(tool_definitions)?,
                serde_json::to_string(&request_params)?,
                model_identifier,
                workspace_path,
                now.to_rfc3339(),
            ],
        )?;
        debug!(session_id, model = model_identifier, "created session");

        Ok(SessionRecord {
            session_id: session_id.to_string(),
            prompt_id: prompt_id.to_string(),
            prompt_args,
            system_prompt: system_prompt.to_string(),
            tool_definitions: tool_definitions.to_vec(),
            request_params,
            model_identifier: model_identifier.to_string(),
            workspace_path: workspace_path.to_string(),
            mode: "default".into(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    pub fn load_session(&self, session_id: &str) -> Result<SessionRecord> {
        let conn = self.lock()?;
        conn.query_row(
            r#"
            SELECT session_id, prompt_id, prompt_args, system_prompt, tool_definitions,
                   request_params, model_identifier, workspace_path, mode, status,
                   created_at, updated_at, completed_at
            FROM sessions WHERE session_id = ?1
            "#,
            [session_id],
            row_to_session,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?
    }

    pub fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<SessionRecord>> {
        let conn = self.lock()?;
        let base = r#"
            SELECT session_id, prompt_id, prompt_args, system_prompt, tool_definitions,
                   request_params, model_identifier, workspace_path, mode, status,
                   created_at, updated_at, completed_at
            FROM sessions
        "#;
        let mut out = Vec::new();
        if let Some(status) = status {
            let mut stmt =
                conn.prepare(&format!("{base} WHERE status = ?1 ORDER BY updated_at DESC"))?;
            let rows = stmt.query_map([status.as_str()], row_to_session)?;
            for row in rows {
                out.push(row??);
            }
        } else {
            let mut stmt = conn.prepare(&format!("{base} ORDER BY updated_at DESC"))?;
            let rows = stmt.query_map([], row_to_session)?;
            for row in rows {
                out.push(row??);
            }
        }
        Ok(out)
    }

    pub fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let completed_at: Option<String> = status.is_terminal().then(|| now.clone());
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE sessions SET status = ?2, updated_at = ?3, completed_at = ?4 WHERE session_id = ?1",
            params![session_id, status.as_str(), now, completed_at],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    pub fn set_mode(&self, session_id: &str, mode: &str) -> Result<()> {
        self.update_session_field(session_id, "mode", mode)
    }

    pub fn set_model(&self, session_id: &str, model: &str) -> Result<()> {
        self.update_session_field(session_id, "model_identifier", model)
    }

    pub fn update_request_params(&self, session_id: &str, params_value: &RequestParams) -> Result<()> {
        let serialized = serde_json::to_string(params_value)?;
        self.update_session_field(session_id, "request_params", &serialized)
    }

    fn update_session_field(&self, session_id: &str, field: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        // `field` is a compile-time constant from the callers above, never
        // user input.
        let n = conn.execute(
            &format!("UPDATE sessions SET {field} = ?2, updated_at = ?3 WHERE session_id = ?1"),
            params![session_id, value, Utc::now().to_rfc3339()],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    // ─── Events ──────────────────────────────────────────────────────────────

    /// Append one event atomically, assigning the next `conv_index`.
    pub fn append_event(&self, session_id: &str, event: NewEvent) -> Result<i64> {
        let role = event
            .role
            .ok_or_else(|| StoreError::Integrity("event without a role".into()))?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT session_id FROM sessions WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }

        let conv_index: i64 = tx.query_row(
            "SELECT COALESCE(MAX(conv_index), -1) + 1 FROM events WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;

        let now = Utc::now().to_rfc3339();
        tx.execute(
            r#"
            INSERT INTO events (session_id, conv_index, timestamp, role, content,
                                reasoning_content, tool_call_id, tool_call_name,
                                tool_arguments, prompt_tokens, completion_tokens,
                                total_tokens, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                session_id,
                conv_index,
                now,
                role.as_str(),
                event.content,
                event.reasoning_content,
                event.tool_call_id,
                event.tool_call_name,
                event.tool_arguments.map(|v| v.to_string()),
                event.prompt_tokens,
                event.completion_tokens,
                event.total_tokens,
                event.metadata.map(|v| v.to_string()),
            ],
        )?;
        let event_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE sessions SET updated_at = ?2 WHERE session_id = ?1",
            params![session_id, now],
        )?;
        tx.commit()?;
        Ok(event_id)
    }

    /// All events of a session in conversation order.
    pub fn events(&self, session_id: &str) -> Result<Vec<EventRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, session_id, conv_index, timestamp, role, content, reasoning_content,
                   tool_call_id, tool_call_name, tool_arguments, prompt_tokens,
                   completion_tokens, total_tokens, metadata
            FROM events WHERE session_id = ?1 ORDER BY conv_index
            "#,
        )?;
        let rows = stmt.query_map([session_id], row_to_event)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Whether a tool-result event with this `tool_call_id` already exists.
    /// Backs the idempotent-resume guarantee: at most one result per call.
    pub fn has_tool_event(&self, session_id: &str, tool_call_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM events
                 WHERE session_id = ?1 AND role = 'tool' AND tool_call_id = ?2
                 LIMIT 1",
                params![session_id, tool_call_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Most recent provider-reported total token count, if any turn has one.
    pub fn latest_total_tokens(&self, session_id: &str) -> Result<Option<i64>> {
        let conn = self.lock()?;
        let total: Option<i64> = conn
            .query_row(
                "SELECT total_tokens FROM events
                 WHERE session_id = ?1 AND total_tokens IS NOT NULL
                 ORDER BY conv_index DESC LIMIT 1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(total)
    }

    // ─── Turn checkpoints ────────────────────────────────────────────────────

    /// Write-through snapshot of an in-flight turn's partial output.  Only
    /// maintained when `checkpoint_on_every_token` is enabled; a hard crash
    /// then loses at most the final chunk.
    pub fn save_turn_checkpoint(
        &self,
        session_id: &str,
        reasoning: &str,
        content: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO turn_checkpoints (session_id, reasoning, content, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(session_id) DO UPDATE SET
                reasoning = ?2, content = ?3, updated_at = ?4
            "#,
            params![session_id, reasoning, content, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn clear_turn_checkpoint(&self, session_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM turn_checkpoints WHERE session_id = ?1", [session_id])?;
        Ok(())
    }

    /// `(reasoning, content)` of an interrupted turn, if one was left behind.
    pub fn turn_checkpoint(&self, session_id: &str) -> Result<Option<(String, String)>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT reasoning, content FROM turn_checkpoints WHERE session_id = ?1",
                [session_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    // ─── Logical message reconstruction ──────────────────────────────────────

    /// Build the provider-native message list for this session right now:
    /// the rendered system prompt, any always-on injections the caller
    /// supplies, then every event since the last compaction cutoff (the
    /// physical event list — compaction already spliced it).
    ///
    /// Mapping rules:
    /// - an assistant event carrying a tool-call list expands to one
    ///   `ToolCall` message per call (the wire layer re-coalesces them);
    /// - a `tool` event maps to a `ToolResult` message;
    /// - an assistant event with only `reasoning_content` is not replayed to
    ///   the provider (hidden tokens are never resent);
    /// - a tool call that never received a result (crash or cancellation
    ///   between call and result) gets a synthetic "interrupted" result so
    ///   the reconstructed history is always well-formed for the provider.
    pub fn get_messages(
        &self,
        session_id: &str,
        always_on: &[Message],
    ) -> Result<Vec<Message>> {
        let session = self.load_session(session_id)?;
        let events = self.events(session_id)?;

        let resolved: std::collections::HashSet<String> = events
            .iter()
            .filter(|e| e.role == Role::Tool)
            .filter_map(|e| e.tool_call_id.clone())
            .collect();

        let mut messages = Vec::with_capacity(events.len() + always_on.len() + 1);
        messages.push(Message::system(session.system_prompt.clone()));
        messages.extend_from_slice(always_on);

        for event in &events {
            match event.role {
                Role::System | Role::User => {
                    if let Some(content) = &event.content {
                        messages.push(Message {
                            role: event.role,
                            content: runa_model::MessageContent::Text(content.clone()),
                        });
                    }
                }
                Role::Assistant => {
                    let calls = event.tool_calls();
                    if !calls.is_empty() {
                        let mut synthetic: Vec<Message> = Vec::new();
                        for (id, name, arguments) in calls {
                            let args_text = match &arguments {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            messages.push(Message::tool_call(id.clone(), name, args_text));
                            if !resolved.contains(&id) {
                                synthetic.push(Message::tool_result(
                                    id,
                                    "[interrupted before a result was recorded]",
                                ));
                            }
                        }
                        messages.extend(synthetic);
                    } else if let Some(content) = &event.content {
                        messages.push(Message::assistant(content.clone()));
                    }
                    // reasoning-only events carry no provider-visible text
                }
                Role::Tool => {
                    if let (Some(id), Some(content)) = (&event.tool_call_id, &event.content) {
                        messages.push(Message::tool_result(id.clone(), content.clone()));
                    }
                }
            }
        }

        Ok(messages)
    }

    // ─── Compaction ──────────────────────────────────────────────────────────

    /// Replace the middle of a session's event list with a summary, in one
    /// transaction: delete events between the head and tail, insert a
    /// system-role summary event at the first deleted `conv_index`, and
    /// record the compaction.  Fully applied or not at all.
    ///
    /// Returns `None` when there is no middle to compact.
    pub fn record_compaction(
        &self,
        session_id: &str,
        head_kept: usize,
        tail_kept: usize,
        summary: &str,
    ) -> Result<Option<CompactionRecord>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let indexes: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT conv_index FROM events WHERE session_id = ?1 ORDER BY conv_index",
            )?;
            let rows = stmt.query_map([session_id], |row| row.get(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        let before_count = indexes.len() as i64;
        if indexes.len() <= head_kept + tail_kept {
            return Ok(None);
        }

        let first_middle = indexes[head_kept];
        let last_middle = indexes[indexes.len() - tail_kept - 1];

        tx.execute(
            "DELETE FROM events
             WHERE session_id = ?1 AND conv_index >= ?2 AND conv_index <= ?3",
            params![session_id, first_middle, last_middle],
        )?;

        let now = Utc::now();
        tx.execute(
            r#"
            INSERT INTO events (session_id, conv_index, timestamp, role, content)
            VALUES (?1, ?2, ?3, 'system', ?4)
            "#,
            params![session_id, first_middle, now.to_rfc3339(), summary],
        )?;

        let after_count = before_count - (last_middle - first_middle + 1) + 1;
        tx.execute(
            r#"
            INSERT INTO compactions (session_id, before_count, after_count, head_kept,
                                     tail_kept, summary, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                session_id,
                before_count,
                after_count,
                head_kept as i64,
                tail_kept as i64,
                summary,
                now.to_rfc3339(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE sessions SET updated_at = ?2 WHERE session_id = ?1",
            params![session_id, now.to_rfc3339()],
        )?;
        tx.commit()?;

        debug!(session_id, before_count, after_count, "compacted session history");
        Ok(Some(CompactionRecord {
            id,
            session_id: session_id.to_string(),
            before_count,
            after_count,
            head_kept: head_kept as i64,
            tail_kept: tail_kept as i64,
            summary: summary.to_string(),
            timestamp: now,
        }))
    }

    pub fn compactions(&self, session_id: &str) -> Result<Vec<CompactionRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, session_id, before_count, after_count, head_kept, tail_kept,
                   summary, timestamp
            FROM compactions WHERE session_id = ?1 ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, session_id, before_count, after_count, head_kept, tail_kept, summary, ts) =
                row?;
            out.push(CompactionRecord {
                id,
                session_id,
                before_count,
                after_count,
                head_kept,
                tail_kept,
                summary,
                timestamp: parse_ts(&ts)?,
            });
        }
        Ok(out)
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn prompt_id_for(template: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template.as_bytes());
    hex::encode(hasher.finalize())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Integrity(format!("bad timestamp {s}: {e}")))
}

fn parse_json(s: Option<String>) -> Result<Option<serde_json::Value>> {
    match s {
        None => Ok(None),
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
    }
}

/// Maps a full session row.  Returns a nested result so rusqlite's own
/// error channel stays reserved for column access.
fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<SessionRecord>> {
    let prompt_args_raw: String = row.get(2)?;
    let tool_defs_raw: String = row.get(4)?;
    let params_raw: String = row.get(5)?;
    let status_raw: String = row.get(9)?;
    let created_raw: String = row.get(10)?;
    let updated_raw: String = row.get(11)?;
    let completed_raw: Option<String> = row.get(12)?;

    let record = (|| -> Result<SessionRecord> {
        Ok(SessionRecord {
            session_id: row.get(0)?,
            prompt_id: row.get(1)?,
            prompt_args: serde_json::from_str(&prompt_args_raw)?,
            system_prompt: row.get(3)?,
            tool_definitions: serde_json::from_str(&tool_defs_raw)?,
            request_params: serde_json::from_str(&params_raw)?,
            model_identifier: row.get(6)?,
            workspace_path: row.get(7)?,
            mode: row.get(8)?,
            status: status_raw
                .parse()
                .map_err(StoreError::Integrity)?,
            created_at: parse_ts(&created_raw)?,
            updated_at: parse_ts(&updated_raw)?,
            completed_at: completed_raw.as_deref().map(parse_ts).transpose()?,
        })
    })();
    Ok(record)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<EventRecord>> {
    let ts_raw: String = row.get(3)?;
    let role_raw: String = row.get(4)?;
    let args_raw: Option<String> = row.get(9)?;
    let metadata_raw: Option<String> = row.get(13)?;

    let record = (|| -> Result<EventRecord> {
        Ok(EventRecord {
            id: row.get(0)?,
            session_id: row.get(1)?,
            conv_index: row.get(2)?,
            timestamp: parse_ts(&ts_raw)?,
            role: role_raw.parse::<Role>().map_err(StoreError::Integrity)?,
            content: row.get(5)?,
            reasoning_content: row.get(6)?,
            tool_call_id: row.get(7)?,
            tool_call_name: row.get(8)?,
            tool_arguments: parse_json(args_raw)?,
            prompt_tokens: row.get(10)?,
            completion_tokens: row.get(11)?,
            total_tokens: row.get(12)?,
            metadata: parse_json(metadata_raw)?,
        })
    })();
    Ok(record)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use runa_model::MessageContent;
    use serde_json::json;

    fn store_with_session(session_id: &str) -> Store {
        let store = Store::open_in_memory().unwrap();
        let prompt_id = store.put_prompt("You are a test agent for {{project}}.").unwrap();
        store
            .create_session(
                session_id,
                &prompt_id,
                json!({"project": "runa"}),
                "You are a test agent for runa.",
                &[],
                RequestParams::default(),
                "test-model",
                "/tmp/w",
            )
            .unwrap();
        store
    }

    // ── Prompts ───────────────────────────────────────────────────────────────

    #[test]
    fn put_prompt_is_idempotent_and_content_addressed() {
        let store = Store::open_in_memory().unwrap();
        let a = store.put_prompt("template one").unwrap();
        let b = store.put_prompt("template one").unwrap();
        let c = store.put_prompt("template two").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(store.get_prompt(&a).unwrap(), "template one");
    }

    #[test]
    fn get_prompt_unknown_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(store.get_prompt("nope"), Err(StoreError::NotFound(_))));
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    #[test]
    fn create_and_load_session_round_trips() {
        let store = store_with_session("s1");
        let s = store.load_session("s1").unwrap();
        assert_eq!(s.session_id, "s1");
        assert_eq!(s.model_identifier, "test-model");
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.mode, "default");
        assert_eq!(s.prompt_args["project"], "runa");
    }

    #[test]
    fn duplicate_session_id_is_rejected() {
        let store = store_with_session("s1");
        let prompt_id = store.put_prompt("x").unwrap();
        let err = store
            .create_session("s1", &prompt_id, json!({}), "x", &[], RequestParams::default(), "m", "/w")
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn load_unknown_session_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(store.load_session("ghost"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn set_status_terminal_sets_completed_at() {
        let store = store_with_session("s1");
        store.set_status("s1", SessionStatus::Completed).unwrap();
        let s = store.load_session("s1").unwrap();
        assert_eq!(s.status, SessionStatus::Completed);
        assert!(s.completed_at.is_some());
    }

    #[test]
    fn set_mode_and_model_update_fields() {
        let store = store_with_session("s1");
        store.set_mode("s1", "plan").unwrap();
        store.set_model("s1", "bigger-model").unwrap();
        let s = store.load_session("s1").unwrap();
        assert_eq!(s.mode, "plan");
        assert_eq!(s.model_identifier, "bigger-model");
    }

    #[test]
    fn list_sessions_filters_by_status() {
        let store = store_with_session("s1");
        let prompt_id = store.put_prompt("y").unwrap();
        store
            .create_session("s2", &prompt_id, json!({}), "y", &[], RequestParams::default(), "m", "/w")
            .unwrap();
        store.set_status("s2", SessionStatus::Cancelled).unwrap();

        assert_eq!(store.list_sessions(None).unwrap().len(), 2);
        let active = store.list_sessions(Some(SessionStatus::Active)).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "s1");
    }

    // ── Events ────────────────────────────────────────────────────────────────

    #[test]
    fn append_event_assigns_monotonic_conv_index() {
        let store = store_with_session("s1");
        store.append_event("s1", NewEvent::user("one")).unwrap();
        store.append_event("s1", NewEvent::assistant(Some("two".into()), None)).unwrap();
        store.append_event("s1", NewEvent::user("three")).unwrap();

        let events = store.events("s1").unwrap();
        let idx: Vec<i64> = events.iter().map(|e| e.conv_index).collect();
        assert_eq!(idx, vec![0, 1, 2]);
    }

    #[test]
    fn append_event_to_unknown_session_fails() {
        let store = Store::open_in_memory().unwrap();
        let err = store.append_event("ghost", NewEvent::user("x")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn appended_event_is_visible_to_subsequent_reads() {
        let store = store_with_session("s1");
        store.append_event("s1", NewEvent::user("durable?")).unwrap();
        let events = store.events("s1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content.as_deref(), Some("durable?"));
    }

    #[test]
    fn usage_fields_round_trip() {
        let store = store_with_session("s1");
        store
            .append_event(
                "s1",
                NewEvent::assistant(Some("done".into()), None).with_usage(Some(100), Some(20), Some(120)),
            )
            .unwrap();
        let e = &store.events("s1").unwrap()[0];
        assert_eq!(e.prompt_tokens, Some(100));
        assert_eq!(e.total_tokens, Some(120));
        assert_eq!(store.latest_total_tokens("s1").unwrap(), Some(120));
    }

    #[test]
    fn latest_total_tokens_skips_null_rows() {
        let store = store_with_session("s1");
        store
            .append_event(
                "s1",
                NewEvent::assistant(Some("a".into()), None).with_usage(Some(10), Some(2), Some(12)),
            )
            .unwrap();
        store.append_event("s1", NewEvent::user("no usage here")).unwrap();
        assert_eq!(store.latest_total_tokens("s1").unwrap(), Some(12));
    }

    #[test]
    fn has_tool_event_detects_existing_result() {
        let store = store_with_session("s1");
        assert!(!store.has_tool_event("s1", "call_1").unwrap());
        store
            .append_event("s1", NewEvent::tool_result("call_1", "echo", "hi"))
            .unwrap();
        assert!(store.has_tool_event("s1", "call_1").unwrap());
    }

    // ── Logical message reconstruction ────────────────────────────────────────

    #[test]
    fn get_messages_starts_with_system_prompt_then_always_on() {
        let store = store_with_session("s1");
        store.append_event("s1", NewEvent::user("hello")).unwrap();
        let injection = Message::user("Context: skill body");
        let msgs = store.get_messages("s1", std::slice::from_ref(&injection)).unwrap();
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].as_text(), Some("Context: skill body"));
        assert_eq!(msgs[2].as_text(), Some("hello"));
    }

    #[test]
    fn get_messages_expands_tool_call_list() {
        let store = store_with_session("s1");
        store.append_event("s1", NewEvent::user("run both")).unwrap();
        store
            .append_event(
                "s1",
                NewEvent::assistant_tool_calls(json!([
                    {"id": "a", "name": "slow", "arguments": "{}"},
                    {"id": "b", "name": "fast", "arguments": "{}"},
                ])),
            )
            .unwrap();
        store.append_event("s1", NewEvent::tool_result("b", "fast", "b done")).unwrap();
        store.append_event("s1", NewEvent::tool_result("a", "slow", "a done")).unwrap();

        let msgs = store.get_messages("s1", &[]).unwrap();
        // system, user, 2 tool calls, 2 tool results (completion order)
        assert_eq!(msgs.len(), 6);
        assert!(matches!(&msgs[2].content, MessageContent::ToolCall { tool_call_id, .. } if tool_call_id == "a"));
        assert!(matches!(&msgs[3].content, MessageContent::ToolCall { tool_call_id, .. } if tool_call_id == "b"));
        assert!(matches!(&msgs[4].content, MessageContent::ToolResult { tool_call_id, .. } if tool_call_id == "b"));
        assert!(matches!(&msgs[5].content, MessageContent::ToolResult { tool_call_id, .. } if tool_call_id == "a"));
    }

    #[test]
    fn get_messages_synthesizes_result_for_interrupted_call() {
        let store = store_with_session("s1");
        store
            .append_event(
                "s1",
                NewEvent::assistant_tool_calls(json!([{"id": "orphan", "name": "slow", "arguments": "{}"}])),
            )
            .unwrap();

        let msgs = store.get_messages("s1", &[]).unwrap();
        let last = msgs.last().unwrap();
        match &last.content {
            MessageContent::ToolResult { tool_call_id, content } => {
                assert_eq!(tool_call_id, "orphan");
                assert!(content.to_string().contains("interrupted"));
            }
            other => panic!("expected synthetic tool result, got {other:?}"),
        }
    }

    #[test]
    fn get_messages_skips_reasoning_only_events() {
        let store = store_with_session("s1");
        store
            .append_event("s1", NewEvent::assistant(None, Some("private thoughts".into())))
            .unwrap();
        let msgs = store.get_messages("s1", &[]).unwrap();
        assert_eq!(msgs.len(), 1, "only the system prompt should remain");
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    fn fill_events(store: &Store, session_id: &str, n: usize) {
        for i in 0..n {
            let ev = if i % 2 == 0 {
                NewEvent::user(format!("user {i}"))
            } else {
                NewEvent::assistant(Some(format!("assistant {i}")), None)
            };
            store.append_event(session_id, ev).unwrap();
        }
    }

    #[test]
    fn record_compaction_splices_head_summary_tail() {
        let store = store_with_session("s1");
        fill_events(&store, "s1", 10);

        let record = store.record_compaction("s1", 2, 3, "SUMMARY").unwrap().unwrap();
        assert_eq!(record.before_count, 10);
        assert_eq!(record.after_count, 6); // 2 head + summary + 3 tail

        let events = store.events("s1").unwrap();
        assert_eq!(events.len(), 6);
        assert_eq!(events[0].content.as_deref(), Some("user 0"));
        assert_eq!(events[1].content.as_deref(), Some("assistant 1"));
        assert_eq!(events[2].role, Role::System);
        assert_eq!(events[2].content.as_deref(), Some("SUMMARY"));
        assert_eq!(events[3].content.as_deref(), Some("assistant 7"));
        assert_eq!(events[4].content.as_deref(), Some("user 8"));
        assert_eq!(events[5].content.as_deref(), Some("assistant 9"));
    }

    #[test]
    fn record_compaction_noop_when_nothing_in_middle() {
        let store = store_with_session("s1");
        fill_events(&store, "s1", 4);
        assert!(store.record_compaction("s1", 2, 2, "SUMMARY").unwrap().is_none());
        assert_eq!(store.events("s1").unwrap().len(), 4);
    }

    #[test]
    fn compaction_is_recorded_and_listable() {
        let store = store_with_session("s1");
        fill_events(&store, "s1", 8);
        store.record_compaction("s1", 1, 1, "first").unwrap().unwrap();
        let records = store.compactions("s1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].summary, "first");
        assert_eq!(records[0].head_kept, 1);
    }

    #[test]
    fn get_messages_after_compaction_shows_summary_in_place() {
        let store = store_with_session("s1");
        fill_events(&store, "s1", 10);
        store.record_compaction("s1", 2, 2, "the middle, summarized").unwrap().unwrap();

        let msgs = store.get_messages("s1", &[]).unwrap();
        // system prompt + 2 head + summary + 2 tail
        assert_eq!(msgs.len(), 6);
        assert_eq!(msgs[3].as_text(), Some("the middle, summarized"));
        assert_eq!(msgs[3].role, Role::System);
    }

    #[test]
    fn events_appended_after_compaction_continue_the_index_sequence() {
        let store = store_with_session("s1");
        fill_events(&store, "s1", 10);
        store.record_compaction("s1", 2, 2, "sum").unwrap().unwrap();
        store.append_event("s1", NewEvent::user("fresh")).unwrap();

        let events = store.events("s1").unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.content.as_deref(), Some("fresh"));
        let idx: Vec<i64> = events.iter().map(|e| e.conv_index).collect();
        let mut sorted = idx.clone();
        sorted.sort_unstable();
        assert_eq!(idx, sorted, "conv_index must remain monotonic after compaction");
    }

    #[test]
    fn session_id_unchanged_across_compactions() {
        let store = store_with_session("s1");
        fill_events(&store, "s1", 10);
        for _ in 0..3 {
            fill_events(&store, "s1", 6);
            store.record_compaction("s1", 1, 1, "sum").unwrap();
        }
        assert_eq!(store.load_session("s1").unwrap().session_id, "s1");
    }

    #[test]
    fn turn_checkpoint_upserts_and_clears() {
        let store = store_with_session("s1");
        assert!(store.turn_checkpoint("s1").unwrap().is_none());

        store.save_turn_checkpoint("s1", "think", "ab").unwrap();
        store.save_turn_checkpoint("s1", "think", "abc").unwrap();
        let (reasoning, content) = store.turn_checkpoint("s1").unwrap().unwrap();
        assert_eq!(reasoning, "think");
        assert_eq!(content, "abc");

        store.clear_turn_checkpoint("s1").unwrap();
        assert!(store.turn_checkpoint("s1").unwrap().is_none());
    }

    #[test]
    fn open_on_disk_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runa.db");
        {
            let store = Store::open(&path).unwrap();
            let prompt_id = store.put_prompt("p").unwrap();
            store
                .create_session("s1", &prompt_id, json!({}), "p", &[], RequestParams::default(), "m", "/w")
                .unwrap();
            store.append_event("s1", NewEvent::user("survives restart")).unwrap();
        }
        let store = Store::open(&path).unwrap();
        let events = store.events("s1").unwrap();
        assert_eq!(events[0].content.as_deref(), Some("survives restart"));
    }
}
