//! Client-role callbacks
//!
//! While a prompt is in flight the agent calls back into us. This module
//! implements those callbacks: permission decisions, session update logging,
//! workspace-gated text file access, and direct in-process skill invocation
//! via `skill/invoke` (the protocol twin of the HTTP gateway surface).
//!
//! Permission policy: a tool call is auto-approved when it names a
//! registered skill, reads under the well-known skills directory, or is a
//! shell execution whose every command references the skill script path.
//! Everything else is rejected.

use async_trait::async_trait;
use sdk::types::SkillResult;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::connection::ClientHandler;
use super::protocol::{
    PermissionOutcome, ReadTextFileParams, ReadTextFileResult, RequestPermissionParams,
    RequestPermissionResult, RpcError, SessionNotification, SkillInvokeParams, ToolCallRef,
    WriteTextFileParams,
};
use crate::session::SessionRegistry;
use crate::skills::{SkillContext, SkillRegistry};
use crate::workspace::{Workspace, WorkspaceManager};

/// Implements the client side of the protocol for one agent session.
pub struct GatewayClient {
    workspace: Workspace,
    manager: WorkspaceManager,
    skills: Arc<SkillRegistry>,
    sessions: Arc<SessionRegistry>,
    /// Directory holding the external skill scripts the agent may run.
    skills_dir: PathBuf,
}

impl GatewayClient {
    pub fn new(
        workspace: Workspace,
        manager: WorkspaceManager,
        skills: Arc<SkillRegistry>,
        sessions: Arc<SessionRegistry>,
        skills_dir: PathBuf,
    ) -> Self {
        Self {
            workspace,
            manager,
            skills,
            sessions,
            skills_dir,
        }
    }

    /// The skill name a tool call refers to, if any.
    ///
    /// `rawInput.skill` is authoritative; the tool-call `title` is the
    /// fallback some agents use instead.
    fn skill_name(tool_call: &ToolCallRef) -> Option<String> {
        if let Some(raw_input) = &tool_call.raw_input {
            if let Some(skill) = raw_input.get("skill").and_then(|v| v.as_str()) {
                return Some(skill.to_string());
            }
        }
        tool_call.title.clone()
    }

    /// Whether this tool call should be auto-approved.
    fn approves(&self, tool_call: &ToolCallRef) -> bool {
        // (a) Named skill
        if let Some(name) = Self::skill_name(tool_call) {
            if self.skills.is_skill(&name) {
                return true;
            }
        }

        let skills_dir = self.skills_dir.to_string_lossy();

        // (b) Read under the skills directory
        if tool_call.kind.as_deref() == Some("read") {
            let all_in_skills_dir = !tool_call.locations.is_empty()
                && tool_call
                    .locations
                    .iter()
                    .all(|l| Path::new(&l.path).starts_with(&self.skills_dir));
            if all_in_skills_dir {
                return true;
            }
        }

        // (c) Shell execution where every command references the skill
        // script path
        if tool_call.kind.as_deref() == Some("execute") {
            if let Some(raw_input) = &tool_call.raw_input {
                if let Some(command) = raw_input.get("command").and_then(|v| v.as_str()) {
                    let commands: Vec<&str> = command
                        .split("&&")
                        .flat_map(|part| part.split(';'))
                        .map(|part| part.trim())
                        .filter(|part| !part.is_empty())
                        .collect();
                    if !commands.is_empty()
                        && commands.iter().all(|c| c.contains(skills_dir.as_ref()))
                    {
                        return true;
                    }
                }
            }
        }

        false
    }

    fn handle_permission(&self, params: Value) -> Result<Value, RpcError> {
        let request: RequestPermissionParams = serde_json::from_value(params)
            .map_err(|e| RpcError::invalid_params(format!("request_permission: {}", e)))?;

        let approve = self.approves(&request.tool_call);
        let wanted_kind = if approve { "allow" } else { "reject" };

        // Prefer the matching one-shot option; fall back to any option of
        // the right family.
        let option = request
            .options
            .iter()
            .find(|o| o.kind == format!("{}_once", wanted_kind))
            .or_else(|| request.options.iter().find(|o| o.kind.starts_with(wanted_kind)));

        debug!(
            "Permission {} for tool call {:?}",
            if approve { "granted" } else { "denied" },
            request.tool_call.title
        );

        let outcome = match option {
            Some(option) => PermissionOutcome::Selected {
                option_id: option.option_id.clone(),
            },
            None => PermissionOutcome::Cancelled,
        };

        serde_json::to_value(RequestPermissionResult { outcome })
            .map_err(|e| RpcError::invalid_params(e.to_string()))
    }

    async fn handle_read(&self, params: Value) -> Result<Value, RpcError> {
        let request: ReadTextFileParams = serde_json::from_value(params)
            .map_err(|e| RpcError::invalid_params(format!("read_text_file: {}", e)))?;

        let resolved = self
            .manager
            .validate_inside(&self.workspace, Path::new(&request.path))
            .map_err(|_| RpcError::access_denied("Access denied: path outside workspace"))?;

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| RpcError::invalid_params(format!("read failed: {}", e)))?;

        let content = match (request.line, request.limit) {
            (None, None) => content,
            (line, limit) => {
                let start = line.unwrap_or(1).saturating_sub(1) as usize;
                let count = limit.map(|n| n as usize).unwrap_or(usize::MAX);
                content
                    .lines()
                    .skip(start)
                    .take(count)
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };

        serde_json::to_value(ReadTextFileResult { content })
            .map_err(|e| RpcError::invalid_params(e.to_string()))
    }

    /// Direct skill invocation over the protocol.
    ///
    /// Authentication and dispatch mirror the HTTP gateway: the session
    /// token is resolved against the registry, the skill name against the
    /// registry of handlers, and the uniform `{success, data?, error?}`
    /// result is returned as the RPC result. Skill-level failures stay
    /// in-band; only unparseable params are protocol errors.
    async fn handle_skill_invoke(&self, params: Value) -> Result<Value, RpcError> {
        let request: SkillInvokeParams = serde_json::from_value(params)
            .map_err(|e| RpcError::invalid_params(format!("skill/invoke: {}", e)))?;

        let Some(session) = self.sessions.get(&request.session_id) else {
            return skill_result_value(SkillResult::fail("Invalid or expired session"));
        };

        if !self.skills.is_skill(&request.skill) {
            return skill_result_value(SkillResult::fail(format!(
                "Unknown skill: {}",
                request.skill
            )));
        }

        let ctx = SkillContext { session };
        let result = self
            .skills
            .dispatch(&request.skill, &request.parameters, &ctx)
            .await;
        skill_result_value(result)
    }

    async fn handle_write(&self, params: Value) -> Result<Value, RpcError> {
        let request: WriteTextFileParams = serde_json::from_value(params)
            .map_err(|e| RpcError::invalid_params(format!("write_text_file: {}", e)))?;

        let resolved = self
            .manager
            .validate_inside(&self.workspace, Path::new(&request.path))
            .map_err(|_| RpcError::access_denied("Access denied: path outside workspace"))?;

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RpcError::invalid_params(format!("write failed: {}", e)))?;
        }
        tokio::fs::write(&resolved, request.content)
            .await
            .map_err(|e| RpcError::invalid_params(format!("write failed: {}", e)))?;

        Ok(json!(null))
    }

    /// Log-only sink for session updates.
    fn handle_session_update(&self, params: Value) {
        let Ok(notification) = serde_json::from_value::<SessionNotification>(params) else {
            warn!("Unparseable session update");
            return;
        };

        let update = &notification.update;
        match update.get("sessionUpdate").and_then(|v| v.as_str()) {
            Some("agent_message_chunk") | Some("agent_thought_chunk") => {
                debug!("Agent chunk received");
            }
            Some("tool_call") => {
                let title = update.get("title").and_then(|v| v.as_str()).unwrap_or("?");
                info!("Agent tool call: {}", title);
            }
            Some("tool_call_update") => {
                let status = update.get("status").and_then(|v| v.as_str()).unwrap_or("");
                let id = update
                    .get("toolCallId")
                    .and_then(|v| v.as_str())
                    .unwrap_or("?");
                if status == "failed" {
                    error!("Agent tool call {} failed (status: {})", id, status);
                } else {
                    debug!("Agent tool call {} status: {}", id, status);
                }
            }
            Some("plan") => debug!("Agent plan update"),
            other => debug!("Session update: {:?}", other),
        }
    }
}

fn skill_result_value(result: SkillResult) -> Result<Value, RpcError> {
    serde_json::to_value(result).map_err(|e| RpcError::invalid_params(e.to_string()))
}

#[async_trait]
impl ClientHandler for GatewayClient {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "session/request_permission" => self.handle_permission(params),
            "skill/invoke" => self.handle_skill_invoke(params).await,
            "fs/read_text_file" => self.handle_read(params).await,
            "fs/write_text_file" => self.handle_write(params).await,
            other => Err(RpcError::method_not_found(other)),
        }
    }

    async fn handle_notification(&self, method: &str, params: Value) {
        match method {
            "session/update" => self.handle_session_update(params),
            other => debug!("Agent notification: {}", other),
        }
    }
}
