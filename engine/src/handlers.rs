//! Command handlers
//!
//! Implements the CLI commands on top of the daemon manager and
//! configuration. Text output is for humans; `--json` switches to a
//! machine-readable shape.

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use crate::config::{AgentProvider, Config};
use crate::daemon::DaemonManager;

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Start the daemon and run until shutdown.
pub async fn handle_start(config: Config) -> Result<()> {
    let manager = DaemonManager::new(config).context("Failed to create daemon manager")?;
    manager.run().await.context("Daemon exited with an error")?;
    Ok(())
}

/// Stop a running daemon.
pub async fn handle_stop(config: &Config, format: OutputFormat) -> Result<()> {
    DaemonManager::stop(config)
        .await
        .context("Failed to stop daemon")?;
    match format {
        OutputFormat::Text => println!("Courier daemon stopped"),
        OutputFormat::Json => println!("{}", json!({ "stopped": true })),
    }
    Ok(())
}

/// Report daemon status.
pub async fn handle_status(config: &Config, format: OutputFormat) -> Result<()> {
    let status = DaemonManager::status(config).context("Failed to read daemon status")?;
    match format {
        OutputFormat::Text => {
            if status.is_running {
                println!(
                    "Courier daemon is running (PID {})",
                    status.pid.unwrap_or_default()
                );
            } else {
                println!("Courier daemon is not running");
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                json!({
                    "running": status.is_running,
                    "pid": status.pid,
                })
            );
        }
    }
    Ok(())
}

/// One diagnostic check result.
struct Check {
    name: &'static str,
    ok: bool,
    detail: String,
}

/// Run configuration and environment diagnostics.
pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let mut checks = Vec::new();

    // Repository root writable
    let repo_check = config.ensure_repo_root();
    checks.push(Check {
        name: "workspace root",
        ok: repo_check.is_ok(),
        detail: match &repo_check {
            Ok(()) => format!("{:?}", config.core.repo_root),
            Err(e) => e.to_string(),
        },
    });

    // Agent binary on PATH
    let (command, _) = config.agent.command_line();
    let found = find_in_path(&command);
    checks.push(Check {
        name: "agent binary",
        ok: found.is_some(),
        detail: match &found {
            Some(path) => format!("{:?}", path),
            None => format!("'{}' not found on PATH", command),
        },
    });

    // Agent credential
    let credential = config.agent.credential();
    checks.push(Check {
        name: match config.agent.provider {
            AgentProvider::Copilot => "github token",
            AgentProvider::Gemini => "gemini api key",
        },
        ok: credential.is_ok(),
        detail: match &credential {
            Ok((name, _)) => format!("{} configured", name),
            Err(e) => e.to_string(),
        },
    });

    // Platform tokens
    if config.platforms.discord.enabled {
        let ok = !config.platforms.discord.token.trim().is_empty();
        checks.push(Check {
            name: "discord token",
            ok,
            detail: if ok {
                "configured".to_string()
            } else {
                "discord is enabled but no token is set".to_string()
            },
        });
    }
    if config.platforms.misskey.enabled {
        let ok = !config.platforms.misskey.token.trim().is_empty();
        checks.push(Check {
            name: "misskey token",
            ok,
            detail: if ok {
                format!("configured for {}", config.platforms.misskey.host)
            } else {
                "misskey is enabled but no token is set".to_string()
            },
        });
    }

    // System prompt file, when configured
    if let Some(path) = &config.context.system_prompt_path {
        let ok = path.is_file();
        checks.push(Check {
            name: "system prompt",
            ok,
            detail: if ok {
                format!("{:?}", path)
            } else {
                format!("{:?} does not exist", path)
            },
        });
    }

    let all_ok = checks.iter().all(|c| c.ok);

    match format {
        OutputFormat::Text => {
            for check in &checks {
                let mark = if check.ok { "ok" } else { "FAIL" };
                println!("[{:>4}] {:<16} {}", mark, check.name, check.detail);
            }
            if all_ok {
                println!("\nAll checks passed");
            } else {
                println!("\nSome checks failed");
            }
        }
        OutputFormat::Json => {
            let entries: Vec<_> = checks
                .iter()
                .map(|c| json!({ "name": c.name, "ok": c.ok, "detail": c.detail }))
                .collect();
            println!("{}", json!({ "ok": all_ok, "checks": entries }));
        }
    }

    if all_ok {
        info!("Doctor: all checks passed");
        Ok(())
    } else {
        anyhow::bail!("doctor found problems")
    }
}

/// Locate an executable on PATH.
fn find_in_path(command: &str) -> Option<std::path::PathBuf> {
    let command_path = std::path::Path::new(command);
    if command_path.is_absolute() {
        return command_path.is_file().then(|| command_path.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(command);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
