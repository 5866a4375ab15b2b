//! send-reply skill
//!
//! Dispatches the single outward-bound reply for a session. Single-reply is
//! enforced twice: here per `{workspace_key}:{channel_id}` interaction key,
//! and in the session registry per session id via an atomic compare-and-set.
//! Whichever detects a second attempt first rejects it.
//!
//! Both gates are claimed before the platform call, never checked-then-acted
//! across the await: the claim itself is the gate. A failed delivery rolls
//! both claims back so a retry can still produce the one allowed reply.

use sdk::types::SkillResult;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::{info, warn};

use super::SkillContext;
use crate::session::SessionRegistry;

/// Tracks which interactions have already replied.
///
/// Keyed by `{workspace_key}:{channel_id}`; the orchestrator clears the key
/// before each prompt so a new interaction on the same conversation starts
/// fresh.
pub struct ReplyState {
    replied: Mutex<HashSet<String>>,
}

impl ReplyState {
    pub fn new() -> Self {
        Self {
            replied: Mutex::new(HashSet::new()),
        }
    }

    fn key(workspace_key: &str, channel_id: &str) -> String {
        format!("{}:{}", workspace_key, channel_id)
    }

    /// Atomically claim the interaction; false when already replied.
    pub fn try_claim(&self, workspace_key: &str, channel_id: &str) -> bool {
        let mut replied = self.replied.lock().expect("reply state lock poisoned");
        replied.insert(Self::key(workspace_key, channel_id))
    }

    /// Whether the interaction has already replied.
    pub fn has_replied(&self, workspace_key: &str, channel_id: &str) -> bool {
        let replied = self.replied.lock().expect("reply state lock poisoned");
        replied.contains(&Self::key(workspace_key, channel_id))
    }

    /// Clear the reply flag for an interaction (start of a new prompt).
    pub fn clear(&self, workspace_key: &str, channel_id: &str) {
        let mut replied = self.replied.lock().expect("reply state lock poisoned");
        replied.remove(&Self::key(workspace_key, channel_id));
    }
}

impl Default for ReplyState {
    fn default() -> Self {
        Self::new()
    }
}

/// send-reply: validate, dispatch through the adapter, and mark the session.
pub async fn send_reply(
    reply_state: &ReplyState,
    sessions: &SessionRegistry,
    params: &Value,
    ctx: &SkillContext,
) -> SkillResult {
    let message = match params.get("message").and_then(|v| v.as_str()) {
        Some(s) => s,
        None => return SkillResult::fail("Missing or invalid 'message' parameter"),
    };

    let message = message.trim();
    if message.is_empty() {
        return SkillResult::fail("Message cannot be empty");
    }

    if let Some(attachments) = params.get("attachments") {
        if !attachments.is_null() {
            match attachments.as_array() {
                Some(list) => {
                    if !list.is_empty() {
                        warn!(
                            "send-reply received {} attachments; attachments are not delivered",
                            list.len()
                        );
                    }
                }
                None => {
                    return SkillResult::fail(
                        "Invalid 'attachments' parameter. Must be an array",
                    )
                }
            }
        }
    }

    let session = &ctx.session;

    // Claim both single-reply gates up front. Losing either claim means a
    // concurrent or earlier attempt holds the one allowed reply.
    if !reply_state.try_claim(&session.workspace.key, &session.channel_id) {
        return SkillResult::fail("Reply can only be sent once per interaction");
    }
    if !sessions.mark_reply_sent(&session.id) {
        reply_state.clear(&session.workspace.key, &session.channel_id);
        return SkillResult::fail("Reply can only be sent once per interaction");
    }

    let reply_to = session.trigger_event.message_id.as_str();
    match session
        .adapter
        .send_reply(&session.channel_id, message, Some(reply_to))
        .await
    {
        Ok(()) => {
            info!(
                "Reply dispatched for session {} on {}/{}",
                session.id, session.platform, session.channel_id
            );
            SkillResult::ok(json!({ "delivered": true }))
        }
        Err(e) => {
            // A failed delivery must not consume the single reply.
            reply_state.clear(&session.workspace.key, &session.channel_id);
            sessions.clear_reply_sent(&session.id);
            SkillResult::fail(e.to_string())
        }
    }
}
