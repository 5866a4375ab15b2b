//! Shared skill contract types
//!
//! These types define the wire contract between the engine, the skill HTTP
//! gateway, and externally spawned skill scripts. Both sides serialize them
//! as JSON, so field names are fixed here and must not drift.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A skill invocation as received by the HTTP gateway.
///
/// External skill scripts POST this body to `/api/skill/{name}`; the engine
/// builds the same shape internally when the agent invokes a skill through a
/// protocol callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillInvocation {
    /// Session token binding this call to one agent run (`sess_` prefixed)
    #[serde(rename = "sessionId")]
    pub session_id: String,

    /// Skill-specific parameters, validated by the handler
    #[serde(default)]
    pub parameters: Value,
}

/// Uniform result returned by every skill handler.
///
/// `success` is always present; exactly one of `data` / `error` accompanies
/// it. Adapter exceptions surface with their message as `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillResult {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SkillResult {
    /// Successful result carrying `data`.
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed result carrying an error message.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}
