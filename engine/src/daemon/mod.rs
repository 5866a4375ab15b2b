//! Daemon lifecycle management
//!
//! This module provides the `DaemonManager` for running the Courier gateway
//! as a long-lived process. It handles:
//! - PID file management (~/.courier/courier.pid)
//! - Daemon start/stop/status operations
//! - Wiring adapters, router, orchestrator, gateway and sweeper together
//! - Graceful shutdown with bounded waits
//!
//! # Shutdown ordering
//!
//! On SIGTERM (or ctrl-c) the daemon:
//! 1. Stops admitting new events
//! 2. Signals every in-flight orchestration to cancel its agent prompt
//! 3. Disconnects all platform adapters
//! 4. Stops the skill gateway and the session sweeper
//! 5. Removes the PID file

use sdk::errors::GatewayError;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::adapter::{discord::DiscordAdapter, misskey::MisskeyAdapter, PlatformAdapter};
use crate::config::Config;
use crate::context::ContextAssembler;
use crate::gateway::SkillGateway;
use crate::memory::MemoryLog;
use crate::orchestrator::SessionOrchestrator;
use crate::router::EventRouter;
use crate::session::SessionRegistry;
use crate::skills::{ReplyState, SkillRegistry};
use crate::workspace::WorkspaceManager;

/// Result type for daemon operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Bounded wait for in-flight orchestrations during shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Event channel depth between adapters and the router loop.
const EVENT_BUFFER: usize = 256;

/// Daemon status information
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    /// Whether the daemon is currently running
    pub is_running: bool,

    /// Process ID if running
    pub pid: Option<u32>,

    /// Path to the PID file
    pub pid_file: PathBuf,
}

/// Daemon manager for lifecycle operations
pub struct DaemonManager {
    config: Arc<Config>,
    pid_file: PathBuf,
    shutdown: watch::Sender<bool>,
}

impl DaemonManager {
    /// Creates a new daemon manager
    pub fn new(config: Config) -> Result<Self> {
        let pid_file = Self::pid_file_path(&config)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            pid_file,
            shutdown,
        })
    }

    fn pid_file_path(config: &Config) -> Result<PathBuf> {
        fs::create_dir_all(&config.core.data_dir).map_err(GatewayError::Io)?;
        Ok(config.core.data_dir.join("courier.pid"))
    }

    /// Run the daemon until shutdown.
    ///
    /// Builds every component, connects the enabled adapters, and drives the
    /// event loop. Returns after a graceful shutdown completes.
    pub async fn run(&self) -> Result<()> {
        if self.is_daemon_running()? {
            return Err(GatewayError::DaemonAlreadyRunning);
        }
        self.write_pid_file()?;

        self.config.ensure_repo_root()?;

        // Shared components
        let workspaces = WorkspaceManager::new(
            &self.config.core.repo_root,
            &self.config.core.workspaces_dir,
        )?;
        let memory = Arc::new(MemoryLog::new(self.config.context.memory_max_chars));
        let assembler = Arc::new(ContextAssembler::new(
            self.config.context.clone(),
            Arc::clone(&memory),
        ));
        let sessions = Arc::new(SessionRegistry::new());
        let reply_state = Arc::new(ReplyState::new());
        let skills = Arc::new(SkillRegistry::new(
            Arc::clone(&memory),
            Arc::clone(&sessions),
            reply_state,
        ));

        let sweeper = sessions.start_sweeper(Duration::from_secs(
            self.config.session.sweep_interval_secs,
        ));

        let mut gateway = SkillGateway::start(
            &self.config.gateway,
            Arc::clone(&sessions),
            Arc::clone(&skills),
        )
        .await?;

        let orchestrator = Arc::new(SessionOrchestrator::new(
            Arc::clone(&self.config),
            workspaces,
            memory,
            assembler,
            sessions,
            skills,
        ));

        // Adapters
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
        let mut adapters: HashMap<String, Arc<dyn PlatformAdapter>> = HashMap::new();

        if self.config.platforms.discord.enabled {
            let adapter: Arc<dyn PlatformAdapter> =
                Arc::new(DiscordAdapter::new(self.config.platforms.discord.clone()));
            adapter.on_event(event_tx.clone());
            adapter.connect().await?;
            adapters.insert("discord".to_string(), adapter);
        }
        if self.config.platforms.misskey.enabled {
            let adapter: Arc<dyn PlatformAdapter> =
                Arc::new(MisskeyAdapter::new(self.config.platforms.misskey.clone()));
            adapter.on_event(event_tx.clone());
            adapter.connect().await?;
            adapters.insert("misskey".to_string(), adapter);
        }
        // Held so the channel stays open even with zero adapters; the loop
        // exits via the shutdown signal, never via channel closure.
        let _event_tx_keepalive = event_tx;

        if adapters.is_empty() {
            warn!("No platform adapters enabled; the gateway will be idle");
        }

        self.install_signal_handlers();
        info!("Courier daemon running (PID {})", std::process::id());

        // Event loop
        let router = EventRouter::new();
        let mut in_flight = JoinSet::new();
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };

                    let guard = match router.admit(&event) {
                        Ok(guard) => guard,
                        Err(e) => {
                            // Duplicate in flight; rejected without side effects.
                            warn!("{}", e);
                            continue;
                        }
                    };

                    let Some(adapter) = adapters.get(&event.platform).cloned() else {
                        warn!("Event from unknown platform '{}'", event.platform);
                        continue;
                    };

                    if let Some(route) = router.select_route(&event) {
                        info!("Event {} matched route '{}'", event.message_id, route);
                    }

                    let orchestrator = Arc::clone(&orchestrator);
                    let shutdown = self.shutdown.subscribe();
                    in_flight.spawn(async move {
                        let _guard = guard;
                        if let Err(e) = orchestrator.handle_event(adapter, event, shutdown).await {
                            error!("Orchestration failed: {:#}", e);
                        }
                    });
                }
                // Reap finished orchestrations so the set stays small.
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = result {
                        error!("Orchestration task panicked: {}", e);
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown requested, stopping event admission");
                        break;
                    }
                }
            }
        }

        // Graceful shutdown. The shutdown watch already tells every
        // orchestration to cancel its prompt.
        let _ = self.shutdown.send(true);

        let drained = tokio::time::timeout(DRAIN_DEADLINE, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "In-flight sessions did not finish within {:?}, aborting them",
                DRAIN_DEADLINE
            );
            in_flight.abort_all();
        }

        for (platform, adapter) in &adapters {
            if let Err(e) = adapter.disconnect().await {
                warn!("Failed to disconnect {}: {}", platform, e);
            }
        }

        gateway.stop();
        sweeper.abort();
        self.remove_pid_file();

        info!("Courier daemon stopped");
        Ok(())
    }

    /// Ask a running daemon (this process) to shut down.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    fn install_signal_handlers(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        error!("Failed to install SIGTERM handler: {}", e);
                        return;
                    }
                };
                tokio::select! {
                    _ = sigterm.recv() => info!("SIGTERM received"),
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("ctrl-c handler failed: {}", e);
                        } else {
                            info!("Interrupt received");
                        }
                    }
                }
            }
            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("ctrl-c handler failed: {}", e);
                }
            }
            let _ = shutdown.send(true);
        });
    }

    /// Stops a running daemon by PID file.
    pub async fn stop(config: &Config) -> Result<()> {
        let pid_file = Self::pid_file_path(config)?;
        let pid = Self::read_pid_file(&pid_file)?;

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            info!("Sending SIGTERM to daemon process {}", pid);
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| {
                GatewayError::Io(std::io::Error::other(format!(
                    "Failed to send SIGTERM: {}",
                    e
                )))
            })?;

            let wait = tokio::time::timeout(Duration::from_secs(35), async {
                while Self::is_process_running(pid) {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            })
            .await;
            if wait.is_err() {
                warn!("Daemon did not stop within 35 seconds");
            } else {
                info!("Daemon stopped");
            }
        }

        #[cfg(not(unix))]
        {
            return Err(GatewayError::Config(
                "Daemon stop is not supported on this platform".to_string(),
            ));
        }

        #[cfg(unix)]
        {
            if pid_file.exists() {
                fs::remove_file(&pid_file).map_err(GatewayError::Io)?;
            }
            Ok(())
        }
    }

    /// Gets the daemon status from the PID file.
    pub fn status(config: &Config) -> Result<DaemonStatus> {
        let pid_file = Self::pid_file_path(config)?;

        let (is_running, pid) = match Self::read_pid_file(&pid_file) {
            Ok(pid) => {
                if Self::is_process_running(pid) {
                    (true, Some(pid))
                } else {
                    // Stale PID file
                    (false, None)
                }
            }
            Err(_) => (false, None),
        };

        Ok(DaemonStatus {
            is_running,
            pid,
            pid_file,
        })
    }

    fn is_daemon_running(&self) -> Result<bool> {
        match Self::read_pid_file(&self.pid_file) {
            Ok(pid) => {
                if pid == std::process::id() {
                    return Ok(false);
                }
                Ok(Self::is_process_running(pid))
            }
            Err(_) => Ok(false),
        }
    }

    fn write_pid_file(&self) -> Result<()> {
        fs::write(&self.pid_file, std::process::id().to_string()).map_err(GatewayError::Io)
    }

    fn remove_pid_file(&self) {
        if self.pid_file.exists() {
            if let Err(e) = fs::remove_file(&self.pid_file) {
                warn!("Failed to remove PID file: {}", e);
            }
        }
    }

    fn read_pid_file(pid_file: &PathBuf) -> Result<u32> {
        let raw = fs::read_to_string(pid_file).map_err(GatewayError::Io)?;
        raw.trim()
            .parse()
            .map_err(|e| GatewayError::Config(format!("Invalid PID file: {}", e)))
    }

    fn is_process_running(pid: u32) -> bool {
        #[cfg(unix)]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;
            kill(Pid::from_raw(pid as i32), None).is_ok()
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            false
        }
    }
}
