//! Skill handlers
//!
//! Skills are the only capabilities the reasoning agent may invoke: saving
//! and searching memories, patching memory metadata, dispatching the single
//! reply, and fetching conversation context. The agent reaches them either
//! through protocol callbacks or through the skill HTTP gateway; both paths
//! end up in [`SkillRegistry::dispatch`].
//!
//! Every handler returns the uniform [`SkillResult`]: validation failures
//! and adapter exceptions become `{success: false, error}` rather than
//! crashing the process.

mod context;
mod memory;
mod reply;

pub use reply::ReplyState;

use sdk::types::SkillResult;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::memory::MemoryLog;
use crate::session::{SessionRecord, SessionRegistry};

/// All skill names, as the agent addresses them.
pub const SKILL_NAMES: &[&str] = &[
    "memory-save",
    "memory-search",
    "memory-patch",
    "send-reply",
    "fetch-context",
];

/// Per-invocation context handed to each handler.
#[derive(Clone)]
pub struct SkillContext {
    /// The session this call is bound to; carries the workspace and the
    /// adapter handle.
    pub session: SessionRecord,
}

/// Dispatches skill invocations to their handlers.
pub struct SkillRegistry {
    memory: Arc<MemoryLog>,
    sessions: Arc<SessionRegistry>,
    reply_state: Arc<ReplyState>,
}

impl SkillRegistry {
    pub fn new(
        memory: Arc<MemoryLog>,
        sessions: Arc<SessionRegistry>,
        reply_state: Arc<ReplyState>,
    ) -> Self {
        Self {
            memory,
            sessions,
            reply_state,
        }
    }

    /// Whether `name` addresses a registered skill.
    pub fn is_skill(&self, name: &str) -> bool {
        SKILL_NAMES.contains(&name)
    }

    /// Registered skill names.
    pub fn names(&self) -> &'static [&'static str] {
        SKILL_NAMES
    }

    /// Shared reply-state map (cleared by the orchestrator per interaction).
    pub fn reply_state(&self) -> Arc<ReplyState> {
        Arc::clone(&self.reply_state)
    }

    /// Execute a skill by name.
    ///
    /// The caller must have resolved `name` through [`Self::is_skill`];
    /// unknown names still fail safely.
    pub async fn dispatch(&self, name: &str, params: &Value, ctx: &SkillContext) -> SkillResult {
        debug!("Dispatching skill '{}' for session {}", name, ctx.session.id);

        match name {
            "memory-save" => memory::save(&self.memory, params, ctx).await,
            "memory-search" => memory::search(&self.memory, params, ctx).await,
            "memory-patch" => memory::patch(&self.memory, params, ctx).await,
            "send-reply" => {
                reply::send_reply(&self.reply_state, &self.sessions, params, ctx).await
            }
            "fetch-context" => context::fetch_context(params, ctx).await,
            _ => SkillResult::fail(format!("Unknown skill: {}", name)),
        }
    }
}
