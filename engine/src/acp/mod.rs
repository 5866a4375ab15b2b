//! Agent connector
//!
//! Owns the external reasoning agent: spawns the configured binary with the
//! workspace as its root, speaks the agent client protocol over its
//! stdin/stdout, and routes the agent's callbacks to [`GatewayClient`].
//!
//! Lifecycle per session: `connect` (spawn + initialize) → `create_session`
//! → `set_model` → `prompt` → `disconnect`. `cancel` may interrupt a prompt
//! at any point and does not wait.

pub mod client;
pub mod connection;
pub mod protocol;

pub use client::GatewayClient;
pub use connection::{AcpConnection, ClientHandler};

use sdk::errors::GatewayError;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::workspace::Workspace;
use protocol::{
    AgentCapabilities, CancelParams, ContentBlock, InitializeParams, InitializeResult,
    NewSessionParams, NewSessionResult, PromptParams, PromptResult, SetSessionModelParams,
    ToolServer, METHOD_NOT_FOUND, PROTOCOL_VERSION,
};

/// Bounded wait for the initialize handshake.
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(15);

/// Drives one agent subprocess for one workspace.
pub struct AgentConnector {
    connection: Arc<AcpConnection>,
    capabilities: AgentCapabilities,
    agent_session_id: Mutex<Option<String>>,
}

impl AgentConnector {
    /// Spawn the configured agent with the workspace as its working
    /// directory and complete the `initialize` handshake.
    ///
    /// The environment is curated: PATH and HOME are inherited, the
    /// provider credential is injected, nothing else leaks through. A
    /// missing credential is a fatal configuration error. Handshake errors
    /// tear the process down.
    pub async fn connect(
        config: &AgentConfig,
        workspace: &Workspace,
        handler: Arc<dyn ClientHandler>,
    ) -> Result<Self, GatewayError> {
        let (command, args) = config.command_line();
        let (credential_name, credential_value) = config.credential()?;

        let mut env: Vec<(String, String)> = Vec::new();
        for inherited in ["PATH", "HOME"] {
            if let Ok(value) = std::env::var(inherited) {
                env.push((inherited.to_string(), value));
            }
        }
        env.push((credential_name.to_string(), credential_value));

        info!(
            "Spawning agent '{}' in workspace {}",
            command, workspace.key
        );
        let connection = Arc::new(AcpConnection::spawn(
            &command,
            &args,
            &workspace.path,
            &env,
            handler,
        )?);

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            client_capabilities: protocol::ClientCapabilities::ours(),
        };
        let init = tokio::time::timeout(
            INITIALIZE_TIMEOUT,
            connection.request("initialize", serde_json::to_value(&params).unwrap()),
        )
        .await;

        let init = match init {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                connection.terminate().await;
                return Err(e);
            }
            Err(_) => {
                connection.terminate().await;
                return Err(GatewayError::Agent(
                    "agent initialize timed out".to_string(),
                ));
            }
        };

        let init: InitializeResult = serde_json::from_value(init)
            .map_err(|e| GatewayError::AgentProtocol(format!("initialize result: {}", e)))?;
        debug!(
            "Agent initialized, protocol version {}",
            init.protocol_version
        );

        Ok(Self {
            connection,
            capabilities: init.agent_capabilities,
            agent_session_id: Mutex::new(None),
        })
    }

    /// Capabilities the agent reported during initialize.
    pub fn capabilities(&self) -> &AgentCapabilities {
        &self.capabilities
    }

    /// Create an agent session rooted at the workspace.
    ///
    /// Tool server transports are validated against the agent's capabilities
    /// before anything is sent; an unsupported transport is rejected here.
    pub async fn create_session(
        &self,
        cwd: &Path,
        tool_servers: Vec<ToolServer>,
    ) -> Result<String, GatewayError> {
        for server in &tool_servers {
            match server {
                ToolServer::Stdio { .. } => {}
                ToolServer::Http { name, .. } => {
                    if !self.capabilities.mcp_capabilities.http {
                        return Err(GatewayError::AgentProtocol(format!(
                            "agent does not support http tool server transport (server '{}')",
                            name
                        )));
                    }
                }
                ToolServer::Sse { name, .. } => {
                    if !self.capabilities.mcp_capabilities.sse {
                        return Err(GatewayError::AgentProtocol(format!(
                            "agent does not support sse tool server transport (server '{}')",
                            name
                        )));
                    }
                }
            }
        }

        let params = NewSessionParams {
            cwd: cwd.to_string_lossy().to_string(),
            mcp_servers: tool_servers,
        };
        let result = self
            .connection
            .request("session/new", serde_json::to_value(&params).unwrap())
            .await?;
        let result: NewSessionResult = serde_json::from_value(result)
            .map_err(|e| GatewayError::AgentProtocol(format!("session/new result: {}", e)))?;

        *self.agent_session_id.lock().await = Some(result.session_id.clone());
        debug!("Agent session {} created", result.session_id);
        Ok(result.session_id)
    }

    /// Set the model for the current session.
    ///
    /// Agents without model selection answer method-not-found; that is
    /// logged and tolerated.
    pub async fn set_model(&self, model: &str) -> Result<(), GatewayError> {
        let session_id = self.session_id().await?;
        let params = SetSessionModelParams {
            session_id,
            model_id: model.to_string(),
        };
        match self
            .connection
            .request("session/set_model", serde_json::to_value(&params).unwrap())
            .await
        {
            Ok(_) => Ok(()),
            Err(GatewayError::AgentProtocol(message))
                if message.contains(&METHOD_NOT_FOUND.to_string()) =>
            {
                warn!("Agent does not support model selection: {}", message);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Send the prompt and await completion.
    ///
    /// The reply path is driven by the agent's callbacks during this window;
    /// the prompt result only reports why the turn stopped.
    pub async fn prompt(&self, text: &str) -> Result<PromptResult, GatewayError> {
        let session_id = self.session_id().await?;
        let params = PromptParams {
            session_id,
            prompt: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
        };
        let result = self
            .connection
            .request("session/prompt", serde_json::to_value(&params).unwrap())
            .await?;
        let result: PromptResult = serde_json::from_value(result)
            .map_err(|e| GatewayError::AgentProtocol(format!("session/prompt result: {}", e)))?;
        Ok(result)
    }

    /// Fire-and-forget cancellation of the in-flight prompt.
    pub async fn cancel(&self) {
        let Ok(session_id) = self.session_id().await else {
            return;
        };
        let params = CancelParams { session_id };
        if let Err(e) = self
            .connection
            .notify("session/cancel", serde_json::to_value(&params).unwrap())
            .await
        {
            debug!("Cancel notification failed: {}", e);
        }
    }

    /// Tear the subprocess down: SIGTERM, bounded wait, kill. Errors are
    /// logged, never propagated. The connector is unusable afterwards.
    pub async fn disconnect(&self) {
        self.connection.terminate().await;
    }

    async fn session_id(&self) -> Result<String, GatewayError> {
        self.agent_session_id
            .lock()
            .await
            .clone()
            .ok_or_else(|| GatewayError::AgentProtocol("no agent session created".to_string()))
    }
}
