//! Session orchestrator
//!
//! Ties the whole pipeline together for one normalized event: resolve the
//! workspace, assemble context, register a session, spawn the agent
//! connector, send the prompt, and observe whether a reply was dispatched.
//! The connector is always disconnected and the session always removed, no
//! matter how the prompt ends.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::acp::{AgentConnector, GatewayClient};
use crate::adapter::{NormalizedEvent, PlatformAdapter};
use crate::config::Config;
use crate::context::ContextAssembler;
use crate::memory::MemoryLog;
use crate::session::{SessionRecord, SessionRegistry};
use crate::skills::{SkillRegistry, SKILL_NAMES};
use crate::workspace::WorkspaceManager;

/// User-visible fallback when the agent finishes without replying or fails.
pub const GENERIC_ERROR_REPLY: &str =
    "I encountered an issue processing your message. Please try again.";

/// How one orchestrated prompt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// The agent dispatched its reply through send-reply.
    ReplySent,
    /// The prompt completed cleanly but no reply was sent.
    NoReply { stop_reason: String },
    /// The prompt was cancelled (shutdown or protocol cancel).
    Cancelled,
    /// The prompt failed with an error.
    Failed(String),
}

/// Per-message pipeline driver.
pub struct SessionOrchestrator {
    config: Arc<Config>,
    workspaces: WorkspaceManager,
    memory: Arc<MemoryLog>,
    assembler: Arc<ContextAssembler>,
    sessions: Arc<SessionRegistry>,
    skills: Arc<SkillRegistry>,
}

impl SessionOrchestrator {
    pub fn new(
        config: Arc<Config>,
        workspaces: WorkspaceManager,
        memory: Arc<MemoryLog>,
        assembler: Arc<ContextAssembler>,
        sessions: Arc<SessionRegistry>,
        skills: Arc<SkillRegistry>,
    ) -> Self {
        Self {
            config,
            workspaces,
            memory,
            assembler,
            sessions,
            skills,
        }
    }

    /// Shared memory log (used by doctor checks).
    pub fn memory(&self) -> Arc<MemoryLog> {
        Arc::clone(&self.memory)
    }

    /// Run the full pipeline for one event.
    ///
    /// `shutdown` carries the daemon's stop flag; when it flips to true the
    /// in-flight prompt is cancelled.
    pub async fn handle_event(
        &self,
        adapter: Arc<dyn PlatformAdapter>,
        event: NormalizedEvent,
        shutdown: watch::Receiver<bool>,
    ) -> Result<PromptOutcome> {
        let workspace = self
            .workspaces
            .get_or_create(&event)
            .context("Failed to resolve workspace")?;

        let assembled = self
            .assembler
            .assemble(&event, &workspace, adapter.as_ref())
            .await
            .context("Failed to assemble context")?;
        let formatted = self.assembler.format(&assembled);

        let session_id = SessionRegistry::generate_id();
        let record = SessionRecord {
            id: session_id.clone(),
            platform: event.platform.clone(),
            channel_id: event.channel_id.clone(),
            user_id: event.user_id.clone(),
            workspace: workspace.clone(),
            adapter: Arc::clone(&adapter),
            trigger_event: event.clone(),
            started_at: Instant::now(),
            timeout_ms: self.config.session.timeout_ms,
            reply_sent: false,
        };
        self.sessions.register(record);

        let prompt_text = build_prompt(
            &formatted.system_message,
            &formatted.user_message,
            &session_id,
            self.config.gateway.port,
        );

        info!(
            "Session {} started for {} ({} estimated tokens)",
            session_id, workspace.key, formatted.estimated_tokens
        );

        let outcome = self
            .run_agent(&workspace, &event, &session_id, &prompt_text, shutdown)
            .await;

        // Teardown is unconditional.
        self.sessions.remove(&session_id);

        match &outcome {
            PromptOutcome::ReplySent => {
                info!("Session {} completed with a reply", session_id);
            }
            PromptOutcome::Cancelled => {
                info!("Session {} cancelled", session_id);
            }
            PromptOutcome::NoReply { stop_reason } => {
                warn!(
                    "Session {} ended without a reply (stop reason: {})",
                    session_id, stop_reason
                );
                self.dispatch_failure_notice(&adapter, &event).await;
            }
            PromptOutcome::Failed(message) => {
                error!("Session {} failed: {}", session_id, message);
                self.dispatch_failure_notice(&adapter, &event).await;
            }
        }

        Ok(outcome)
    }

    /// Spawn the connector, drive the prompt, and always disconnect.
    async fn run_agent(
        &self,
        workspace: &crate::workspace::Workspace,
        event: &NormalizedEvent,
        session_id: &str,
        prompt_text: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> PromptOutcome {
        let skills_dir = self.config.core.data_dir.join("skills");
        let client = Arc::new(GatewayClient::new(
            workspace.clone(),
            self.workspaces.clone(),
            Arc::clone(&self.skills),
            Arc::clone(&self.sessions),
            skills_dir,
        ));

        let connector =
            match AgentConnector::connect(&self.config.agent, workspace, client).await {
                Ok(connector) => connector,
                Err(e) => return PromptOutcome::Failed(e.to_string()),
            };

        let outcome = async {
            if let Err(e) = connector.create_session(&workspace.path, Vec::new()).await {
                return PromptOutcome::Failed(e.to_string());
            }
            if let Err(e) = connector.set_model(&self.config.agent.model).await {
                return PromptOutcome::Failed(e.to_string());
            }

            // A fresh interaction on this conversation may reply again.
            self.skills
                .reply_state()
                .clear(&workspace.key, &event.channel_id);

            let prompt_timeout = Duration::from_millis(self.config.agent.timeout_ms);
            let prompt = connector.prompt(prompt_text);
            tokio::pin!(prompt);

            tokio::select! {
                result = &mut prompt => match result {
                    Ok(prompt_result) => {
                        if self.sessions.has_reply_sent(session_id) {
                            PromptOutcome::ReplySent
                        } else if prompt_result.stop_reason == "cancelled" {
                            PromptOutcome::Cancelled
                        } else {
                            PromptOutcome::NoReply {
                                stop_reason: prompt_result.stop_reason,
                            }
                        }
                    }
                    Err(e) => PromptOutcome::Failed(e.to_string()),
                },
                _ = tokio::time::sleep(prompt_timeout) => {
                    connector.cancel().await;
                    PromptOutcome::Failed("agent prompt timed out".to_string())
                }
                _ = wait_for_stop(&mut shutdown) => {
                    connector.cancel().await;
                    PromptOutcome::Cancelled
                }
            }
        }
        .await;

        connector.disconnect().await;
        outcome
    }

    /// Tell the user something went wrong, without internal detail.
    async fn dispatch_failure_notice(
        &self,
        adapter: &Arc<dyn PlatformAdapter>,
        event: &NormalizedEvent,
    ) {
        if let Err(e) = adapter
            .send_reply(
                &event.channel_id,
                GENERIC_ERROR_REPLY,
                Some(&event.message_id),
            )
            .await
        {
            warn!("Failed to dispatch failure notice: {}", e);
        }
    }
}

/// Resolve when the shutdown flag flips to true; never resolve if the
/// channel closes without it.
async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Compose the final prompt sent to the agent.
///
/// Concatenates the system instructions, the formatted context, and the
/// closing instructions that name send-reply as the required terminal skill,
/// list the others, and describe both skill transports (the protocol's
/// skill/invoke request and the HTTP gateway).
pub fn build_prompt(
    system_message: &str,
    user_message: &str,
    session_id: &str,
    gateway_port: u16,
) -> String {
    let other_skills: Vec<&str> = SKILL_NAMES
        .iter()
        .copied()
        .filter(|name| *name != "send-reply")
        .collect();

    format!(
        "# System Instructions\n\n{system}\n\n\
         # Context and Message\n\n{user}\n\n\
         # Instructions\n\n\
         Respond to the current message. You MUST finish by invoking the \
         send-reply skill exactly once; it delivers your reply to the user \
         and is the only way to answer. Other available skills: {skills}.\n\
         Invoke a skill either with the skill/invoke request, params \
         {{\"sessionId\": \"{session}\", \"skill\": \"<name>\", \"parameters\": {{...}}}}, \
         or by POSTing to http://127.0.0.1:{port}/api/skill/<name> \
         with body {{\"sessionId\": \"{session}\", \"parameters\": {{...}}}}.",
        system = system_message,
        user = user_message,
        skills = other_skills.join(", "),
        port = gateway_port,
        session = session_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_prompt_section_order() {
        let prompt = build_prompt("SYSTEM", "USER CONTEXT", "sess_abc", 3001);

        let system_pos = prompt.find("# System Instructions").unwrap();
        let context_pos = prompt.find("# Context and Message").unwrap();
        let instructions_pos = prompt.find("# Instructions").unwrap();

        assert!(system_pos < context_pos);
        assert!(context_pos < instructions_pos);
        assert!(prompt.contains("SYSTEM"));
        assert!(prompt.contains("USER CONTEXT"));
    }

    #[test]
    fn test_build_prompt_names_skills_and_session() {
        let prompt = build_prompt("s", "u", "sess_abc", 3099);
        assert!(prompt.contains("send-reply"));
        assert!(prompt.contains("memory-save"));
        assert!(prompt.contains("memory-search"));
        assert!(prompt.contains("memory-patch"));
        assert!(prompt.contains("fetch-context"));
        assert!(prompt.contains("sess_abc"));
        assert!(prompt.contains(":3099"));
    }

    #[test]
    fn test_build_prompt_offers_both_skill_transports() {
        let prompt = build_prompt("s", "u", "sess_abc", 3001);
        assert!(prompt.contains("skill/invoke"));
        assert!(prompt.contains("http://127.0.0.1:3001/api/skill/"));
    }

    #[test]
    fn test_generic_error_reply_text() {
        assert_eq!(
            GENERIC_ERROR_REPLY,
            "I encountered an issue processing your message. Please try again."
        );
    }
}
