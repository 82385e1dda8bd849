// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
//! The three-station hook pipeline.
//!
//! | Station | Fires | May |
//! |---|---|---|
//! | pre-request | once per prompt, before the first provider call | append messages, load skills |
//! | mid-react | after each persisted assistant response | replace the session (compaction) |
//! | post-react | after the loop's last turn | return a follow-up prompt |
//!
//! Hook failures are isolated: a failing hook is logged by name and treated
//! as if it returned nothing.  For mid-react that means compaction is simply
//! skipped for that cycle.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use runa_model::{ChatProvider, ToolSchema, UsageTotals};
use runa_skills::{SkillFormat, SkillRegistry};

use crate::{compact_if_needed, Session};

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook misconfigured: unknown hook '{0}'")]
    Misconfigured(String),
}

/// What a hook can see and touch.  The context is handed to each hook in
/// registration order; a mid-react hook that replaces the session makes the
/// replacement visible to every later hook in the same cycle.
pub struct HookContext<'a> {
    pub session: &'a mut Session,
    pub user_prompt: Option<&'a str>,
    pub tool_catalog: &'a [ToolSchema],
    pub latest_usage: Option<UsageTotals>,
    pub final_text: Option<&'a str>,
}

#[async_trait]
pub trait PreRequestHook: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, cx: &mut HookContext<'_>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait MidReactHook: Send + Sync {
    fn name(&self) -> &str;
    /// Return a replacement session to adopt it for the rest of the loop.
    async fn run(&self, cx: &mut HookContext<'_>) -> anyhow::Result<Option<Session>>;
}

#[async_trait]
pub trait PostReactHook: Send + Sync {
    fn name(&self) -> &str;
    /// Return a prompt to start another loop ("ralph" self-verification).
    async fn run(&self, cx: &mut HookContext<'_>) -> anyhow::Result<Option<String>>;
}

#[derive(Default, Clone)]
pub struct HookPipeline {
    pre: Vec<Arc<dyn PreRequestHook>>,
    mid: Vec<Arc<dyn MidReactHook>>,
    post: Vec<Arc<dyn PostReactHook>>,
}

impl std::fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookPipeline")
            .field("pre", &self.pre.len())
            .field("mid", &self.mid.len())
            .field("post", &self.post.len())
            .finish()
    }
}

impl HookPipeline {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register_pre(&mut self, hook: Arc<dyn PreRequestHook>) {
        self.pre.push(hook);
    }

    pub fn register_mid(&mut self, hook: Arc<dyn MidReactHook>) {
        self.mid.push(hook);
    }

    pub fn register_post(&mut self, hook: Arc<dyn PostReactHook>) {
        self.post.push(hook);
    }

    pub async fn run_pre_request(&self, cx: &mut HookContext<'_>) {
        for hook in &self.pre {
            if let Err(e) = hook.run(cx).await {
                warn!(hook = hook.name(), error = %e, "pre-request hook failed; continuing");
            }
        }
    }

    /// Runs every mid-react hook; a returned replacement session is adopted
    /// immediately so subsequent hooks (and the engine) see it.  Returns
    /// whether any hook replaced the session.
    pub async fn run_mid_react(&self, cx: &mut HookContext<'_>) -> bool {
        let mut replaced = false;
        for hook in &self.mid {
            match hook.run(cx).await {
                Ok(Some(new_session)) => {
                    *cx.session = new_session;
                    replaced = true;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(hook = hook.name(), error = %e, "mid-react hook failed; continuing");
                }
            }
        }
        replaced
    }

    /// First hook to return a prompt wins; the remaining hooks are skipped.
    pub async fn run_post_react(&self, cx: &mut HookContext<'_>) -> Option<String> {
        for hook in &self.post {
            match hook.run(cx).await {
                Ok(Some(prompt)) => return Some(prompt),
                Ok(None) => {}
                Err(e) => {
                    warn!(hook = hook.name(), error = %e, "post-react hook failed; continuing");
                }
            }
        }
        None
    }
}

// ─── Builtin hooks ───────────────────────────────────────────────────────────

/// Pre-request: match skills against the incoming prompt and inject their
/// instructions.  Progressive skills only contribute their metadata block;
/// the model pulls the full body on demand.
pub struct SkillsInjectorHook {
    skills: Arc<SkillRegistry>,
}

impl SkillsInjectorHook {
    pub fn new(skills: Arc<SkillRegistry>) -> Self {
        Self { skills }
    }
}

#[async_trait]
impl PreRequestHook for SkillsInjectorHook {
    fn name(&self) -> &str {
        "skills_injector"
    }

    async fn run(&self, cx: &mut HookContext<'_>) -> anyhow::Result<()> {
        let Some(prompt) = cx.user_prompt else {
            return Ok(());
        };
        let matched = self.skills.matches(prompt);
        if matched.is_empty() {
            return Ok(());
        }

        let mut progressive: Vec<String> = Vec::new();
        for name in &matched {
            let Some(meta) = self.skills.get(name) else { continue };
            if meta.format == SkillFormat::Progressive {
                progressive.push(name.clone());
            } else {
                let body = self.skills.activate(name)?;
                cx.session.add_user_message(&format!("Context: {body}"))?;
            }
        }
        if !progressive.is_empty() {
            cx.session.add_user_message(&self.skills.as_prompt_block(&progressive))?;
        }
        Ok(())
    }
}

/// Mid-react: compact the session when its token total crosses the
/// threshold, replacing the session with the spliced view.
pub struct CompactorHook {
    provider: Arc<dyn ChatProvider>,
    compaction_model: Option<String>,
}

impl CompactorHook {
    pub fn new(provider: Arc<dyn ChatProvider>, compaction_model: Option<String>) -> Self {
        Self { provider, compaction_model }
    }
}

#[async_trait]
impl MidReactHook for CompactorHook {
    fn name(&self) -> &str {
        "compactor"
    }

    async fn run(&self, cx: &mut HookContext<'_>) -> anyhow::Result<Option<Session>> {
        let replaced = compact_if_needed(
            cx.session,
            self.provider.as_ref(),
            self.compaction_model.as_deref(),
        )
        .await?;
        Ok(replaced)
    }
}

/// Post-react self-verification: keep prompting the model to review its own
/// answer until it declares itself done.  The engine's `max_turns` ceiling
/// bounds the loop.
pub struct RalphHook;

const RALPH_DONE_MARKER: &str = "DONE";
const RALPH_PROMPT: &str = "\
Review your previous answer against the original request. If it fully \
satisfies the request, reply with the single word DONE. Otherwise continue \
working and fix what is missing.";

#[async_trait]
impl PostReactHook for RalphHook {
    fn name(&self) -> &str {
        "ralph"
    }

    async fn run(&self, cx: &mut HookContext<'_>) -> anyhow::Result<Option<String>> {
        match cx.final_text {
            Some(text) if text.contains(RALPH_DONE_MARKER) => Ok(None),
            Some(_) => Ok(Some(RALPH_PROMPT.to_string())),
            None => Ok(None),
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Dependencies the builtin hooks need at construction time.
pub struct BuiltinHookDeps {
    pub skills: Arc<SkillRegistry>,
    pub provider: Arc<dyn ChatProvider>,
    pub compaction_model: Option<String>,
}

/// Bind each enabled hook name to its station, preserving the configured
/// order.  Unknown names fail construction.
pub fn build_pipeline(
    enabled: &[String],
    deps: &BuiltinHookDeps,
) -> Result<HookPipeline, HookError> {
    let mut pipeline = HookPipeline::empty();
    for name in enabled {
        match name.as_str() {
            "skills_injector" => {
                pipeline.register_pre(Arc::new(SkillsInjectorHook::new(deps.skills.clone())));
            }
            "compactor" => {
                pipeline.register_mid(Arc::new(CompactorHook::new(
                    deps.provider.clone(),
                    deps.compaction_model.clone(),
                )));
            }
            "ralph" => {
                pipeline.register_post(Arc::new(RalphHook));
            }
            unknown => return Err(HookError::Misconfigured(unknown.to_string())),
        }
    }
    Ok(pipeline)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
