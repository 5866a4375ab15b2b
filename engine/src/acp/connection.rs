//! Agent subprocess connection
//!
//! Owns the child process and the newline-delimited JSON-RPC duplex over its
//! stdin/stdout. A single reader task decodes each line and dispatches it by
//! kind: responses complete pending request futures, agent-initiated
//! requests and notifications go to the [`ClientHandler`]. stderr is drained
//! concurrently and logged as warnings without backpressure on the protocol.

use async_trait::async_trait;
use sdk::errors::GatewayError;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::protocol::{
    IncomingKind, IncomingMessage, OutgoingNotification, OutgoingRequest, OutgoingResponse,
    RpcError,
};

/// Bounded wait for the child to exit after SIGTERM.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

/// Handles agent-initiated traffic (the client role of the protocol).
#[async_trait]
pub trait ClientHandler: Send + Sync {
    /// Handle a request from the agent and produce its result.
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError>;

    /// Handle a notification from the agent.
    async fn handle_notification(&self, method: &str, params: Value);
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, RpcError>>>>>;

/// A live JSON-RPC connection to the agent subprocess.
pub struct AcpConnection {
    child: Mutex<Option<Child>>,
    child_pid: Option<u32>,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    pending: PendingMap,
    next_id: AtomicI64,
    reader_handle: tokio::task::JoinHandle<()>,
    stderr_handle: tokio::task::JoinHandle<()>,
}

impl AcpConnection {
    /// Spawn the agent subprocess and start the reader tasks.
    ///
    /// The environment is curated: only the provided variables are passed,
    /// nothing is inherited implicitly.
    pub fn spawn(
        command: &str,
        args: &[String],
        cwd: &Path,
        env: &[(String, String)],
        handler: Arc<dyn ClientHandler>,
    ) -> Result<Self, GatewayError> {
        let mut child = Command::new(command)
            .args(args)
            .current_dir(cwd)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::Agent(format!("Failed to spawn '{}': {}", command, e)))?;

        let child_pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Agent("Agent stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::Agent("Agent stderr not captured".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Agent("Agent stdin not captured".to_string()))?;

        let stdin = Arc::new(tokio::sync::Mutex::new(Some(stdin)));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let reader_handle = {
            let pending = Arc::clone(&pending);
            let stdin = Arc::clone(&stdin);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            dispatch_line(&line, &pending, &stdin, &handler).await;
                        }
                        Ok(None) => {
                            debug!("Agent stdout closed");
                            break;
                        }
                        Err(e) => {
                            warn!("Agent stdout read error: {}", e);
                            break;
                        }
                    }
                }
                // Fail any requests still waiting so callers unblock.
                let mut map = pending.lock().expect("pending map lock poisoned");
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(RpcError {
                        code: super::protocol::ACCESS_DENIED,
                        message: "agent connection closed".to_string(),
                        data: None,
                    }));
                }
            })
        };

        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("agent stderr: {}", line);
            }
        });

        Ok(Self {
            child: Mutex::new(Some(child)),
            child_pid,
            stdin,
            pending,
            next_id: AtomicI64::new(1),
            reader_handle,
            stderr_handle,
        })
    }

    /// Send a request and await its response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending map lock poisoned");
            pending.insert(id, tx);
        }

        let frame = OutgoingRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let line = serde_json::to_string(&frame)
            .map_err(|e| GatewayError::AgentProtocol(format!("encode {}: {}", method, e)))?;

        if let Err(e) = self.write_line(&line).await {
            let mut pending = self.pending.lock().expect("pending map lock poisoned");
            pending.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(rpc_error)) => Err(GatewayError::AgentProtocol(format!(
                "{} failed: {}",
                method, rpc_error
            ))),
            Err(_) => Err(GatewayError::Agent(
                "agent connection closed before response".to_string(),
            )),
        }
    }

    /// Send a notification; no response expected.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), GatewayError> {
        let frame = OutgoingNotification {
            jsonrpc: "2.0",
            method,
            params,
        };
        let line = serde_json::to_string(&frame)
            .map_err(|e| GatewayError::AgentProtocol(format!("encode {}: {}", method, e)))?;
        self.write_line(&line).await
    }

    async fn write_line(&self, line: &str) -> Result<(), GatewayError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| GatewayError::Agent("agent stdin already closed".to_string()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| GatewayError::Agent(format!("write to agent: {}", e)))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| GatewayError::Agent(format!("write to agent: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| GatewayError::Agent(format!("flush to agent: {}", e)))?;
        Ok(())
    }

    /// Terminate the subprocess: close stdin, SIGTERM, bounded wait, kill.
    ///
    /// Errors during the wait are logged, never propagated.
    pub async fn terminate(&self) {
        // Closing stdin signals the agent that no more traffic is coming.
        {
            let mut guard = self.stdin.lock().await;
            guard.take();
        }

        let child = {
            let mut guard = self.child.lock().expect("child lock poisoned");
            guard.take()
        };

        let Some(mut child) = child else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = self.child_pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to agent {} failed: {}", pid, e);
            }
        }

        match tokio::time::timeout(SHUTDOWN_DEADLINE, child.wait()).await {
            Ok(Ok(status)) => debug!("Agent exited with {}", status),
            Ok(Err(e)) => warn!("Error waiting for agent exit: {}", e),
            Err(_) => {
                warn!("Agent did not exit within {:?}, killing", SHUTDOWN_DEADLINE);
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill agent: {}", e);
                }
            }
        }

        self.reader_handle.abort();
        self.stderr_handle.abort();

        // The reader normally fails pending requests on EOF; after an abort
        // that may not have happened, so drain here as well.
        let mut map = self.pending.lock().expect("pending map lock poisoned");
        for (_, tx) in map.drain() {
            let _ = tx.send(Err(RpcError {
                code: super::protocol::ACCESS_DENIED,
                message: "agent connection closed".to_string(),
                data: None,
            }));
        }
    }
}

/// Decode one line and route it.
async fn dispatch_line(
    line: &str,
    pending: &PendingMap,
    stdin: &Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    handler: &Arc<dyn ClientHandler>,
) {
    let message: IncomingMessage = match serde_json::from_str(line) {
        Ok(m) => m,
        Err(e) => {
            warn!("Unparseable agent frame ({} bytes): {}", line.len(), e);
            return;
        }
    };

    match message.classify() {
        IncomingKind::Response { id, result } => {
            let tx = {
                let mut map = pending.lock().expect("pending map lock poisoned");
                map.remove(&id)
            };
            match tx {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => warn!("Response for unknown request id {}", id),
            }
        }
        IncomingKind::Request { id, method, params } => {
            let result = handler.handle_request(&method, params).await;
            let response = match result {
                Ok(value) => OutgoingResponse {
                    jsonrpc: "2.0",
                    id,
                    result: Some(value),
                    error: None,
                },
                Err(rpc_error) => OutgoingResponse {
                    jsonrpc: "2.0",
                    id,
                    result: None,
                    error: Some(rpc_error),
                },
            };
            let Ok(line) = serde_json::to_string(&response) else {
                error!("Failed to encode response for {}", method);
                return;
            };
            let mut guard = stdin.lock().await;
            if let Some(stdin) = guard.as_mut() {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    warn!("Failed to answer agent request {}: {}", method, e);
                    return;
                }
                if stdin.write_all(b"\n").await.is_ok() {
                    let _ = stdin.flush().await;
                }
            }
        }
        IncomingKind::Notification { method, params } => {
            handler.handle_notification(&method, params).await;
        }
        IncomingKind::Malformed => {
            warn!("Malformed agent frame ({} bytes)", line.len());
        }
    }
}
