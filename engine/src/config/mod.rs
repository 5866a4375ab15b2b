//! Configuration management
//!
//! This module handles loading, validation, and management of the Courier
//! configuration. Configuration is stored in TOML format at
//! ~/.courier/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Repository root, workspaces directory, log level, data directory
//! - **platforms**: Discord and Misskey adapter settings
//! - **agent**: External reasoning agent (copilot or gemini) and credentials
//! - **gateway**: Skill HTTP gateway bind host and port
//! - **context**: Context assembly limits
//! - **session**: Session timeout and sweeper interval
//!
//! # Path Expansion
//!
//! The configuration system automatically:
//! - Expands ~ to the user's home directory
//! - Creates the repository root if it doesn't exist
//!
//! # Validation
//!
//! `validate()` is called after load and fails fast on fatal problems:
//! a gateway host that is not a loopback interface, or a configured agent
//! whose credential is missing both from config and the environment.

use sdk::errors::GatewayError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Main configuration structure
///
/// This structure represents the complete Courier configuration loaded from
/// ~/.courier/config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// Platform adapter configuration
    #[serde(default)]
    pub platforms: PlatformsConfig,

    /// Reasoning agent configuration
    pub agent: AgentConfig,

    /// Skill gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Context assembly configuration
    #[serde(default)]
    pub context: ContextConfig,

    /// Session configuration
    #[serde(default)]
    pub session: SessionConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Repository root under which conversation workspaces live
    /// (supports ~ expansion)
    pub repo_root: PathBuf,

    /// Directory name for workspaces under the repository root
    #[serde(default = "default_workspaces_dir")]
    pub workspaces_dir: String,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Platform adapter enablement and settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlatformsConfig {
    /// Discord adapter settings
    #[serde(default)]
    pub discord: DiscordConfig,

    /// Misskey adapter settings
    #[serde(default)]
    pub misskey: MisskeyConfig,
}

/// Discord adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Enable the Discord adapter
    #[serde(default)]
    pub enabled: bool,

    /// Bot token (env fallback: DISCORD_TOKEN)
    #[serde(default)]
    pub token: String,

    /// Respond to direct messages
    #[serde(default = "default_true")]
    pub allow_dms: bool,

    /// Command prefix that triggers the bot without a mention
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,

    /// Maximum outgoing message length
    #[serde(default = "default_discord_max_len")]
    pub max_message_length: usize,

    /// Cap on reconnect attempts (0 = infinite)
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            allow_dms: true,
            command_prefix: default_command_prefix(),
            max_message_length: default_discord_max_len(),
            max_reconnect_attempts: 0,
        }
    }
}

/// Misskey adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MisskeyConfig {
    /// Enable the Misskey adapter
    #[serde(default)]
    pub enabled: bool,

    /// Instance host, e.g. "misskey.example.org"
    #[serde(default)]
    pub host: String,

    /// API token (env fallback: MISSKEY_TOKEN)
    #[serde(default)]
    pub token: String,

    /// Respond to specified-visibility notes (DMs)
    #[serde(default = "default_true")]
    pub allow_dms: bool,

    /// Command prefix that triggers the bot without a mention
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,

    /// Maximum outgoing note length
    #[serde(default = "default_misskey_max_len")]
    pub max_message_length: usize,

    /// Cap on reconnect attempts (0 = infinite)
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

impl Default for MisskeyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            token: String::new(),
            allow_dms: true,
            command_prefix: default_command_prefix(),
            max_message_length: default_misskey_max_len(),
            max_reconnect_attempts: 0,
        }
    }
}

/// Reasoning agent provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentProvider {
    /// GitHub Copilot CLI
    Copilot,
    /// Gemini CLI
    Gemini,
}

/// Reasoning agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Which external agent binary to drive
    pub provider: AgentProvider,

    /// Command to spawn (defaults per provider when empty)
    #[serde(default)]
    pub command: String,

    /// Arguments passed to the command (defaults per provider when empty)
    #[serde(default)]
    pub args: Vec<String>,

    /// Model identifier set on each agent session
    #[serde(default = "default_model")]
    pub model: String,

    /// GitHub token for the copilot provider (env fallback: GITHUB_TOKEN)
    #[serde(default)]
    pub github_token: String,

    /// Gemini API key for the gemini provider (env fallback: GEMINI_API_KEY)
    #[serde(default)]
    pub gemini_api_key: String,

    /// Per-prompt timeout in milliseconds
    #[serde(default = "default_prompt_timeout_ms")]
    pub timeout_ms: u64,
}

impl AgentConfig {
    /// Effective command line for the configured provider.
    pub fn command_line(&self) -> (String, Vec<String>) {
        if !self.command.is_empty() {
            return (self.command.clone(), self.args.clone());
        }
        match self.provider {
            AgentProvider::Copilot => (
                "copilot".to_string(),
                vec!["--acp".to_string(), "--stdio".to_string()],
            ),
            AgentProvider::Gemini => (
                "gemini".to_string(),
                vec!["--experimental-acp".to_string()],
            ),
        }
    }

    /// Resolve the credential for the configured provider.
    ///
    /// Config value wins; environment variable is the fallback. Returns the
    /// variable name the credential is injected under and its value.
    pub fn credential(&self) -> Result<(&'static str, String), GatewayError> {
        match self.provider {
            AgentProvider::Copilot => {
                let value = non_empty(&self.github_token)
                    .or_else(|| std::env::var("GITHUB_TOKEN").ok().and_then(|v| non_empty(&v)));
                match value {
                    Some(v) => Ok(("GITHUB_TOKEN", v)),
                    None => Err(GatewayError::Config(
                        "GitHub token not configured. Set github_token in config or the GITHUB_TOKEN environment variable".to_string(),
                    )),
                }
            }
            AgentProvider::Gemini => {
                let value = non_empty(&self.gemini_api_key).or_else(|| {
                    std::env::var("GEMINI_API_KEY").ok().and_then(|v| non_empty(&v))
                });
                match value {
                    Some(v) => Ok(("GEMINI_API_KEY", v)),
                    None => Err(GatewayError::Config(
                        "Gemini API key not configured. Set gemini_api_key in config or the GEMINI_API_KEY environment variable".to_string(),
                    )),
                }
            }
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Skill gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind host; must be a loopback interface
    #[serde(default = "default_gateway_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

/// Context assembly configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// How many recent messages to pull into the prompt
    #[serde(default = "default_recent_message_limit")]
    pub recent_message_limit: usize,

    /// Per-memory content cap in characters
    #[serde(default = "default_memory_max_chars")]
    pub memory_max_chars: usize,

    /// Token budget for the assembled prompt
    #[serde(default = "default_token_limit")]
    pub token_limit: usize,

    /// Path to the system prompt file (supports ~ expansion)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_path: Option<PathBuf>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            recent_message_limit: default_recent_message_limit(),
            memory_max_chars: default_memory_max_chars(),
            token_limit: default_token_limit(),
            system_prompt_path: None,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub timeout_ms: u64,

    /// Sweep interval for expired sessions, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_session_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_workspaces_dir() -> String {
    "workspaces".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.courier")
}

fn default_true() -> bool {
    true
}

fn default_command_prefix() -> String {
    "!ai".to_string()
}

fn default_discord_max_len() -> usize {
    2000
}

fn default_misskey_max_len() -> usize {
    3000
}

fn default_model() -> String {
    "default".to_string()
}

fn default_prompt_timeout_ms() -> u64 {
    300_000
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    3001
}

fn default_recent_message_limit() -> usize {
    20
}

fn default_memory_max_chars() -> usize {
    500
}

fn default_token_limit() -> usize {
    16_000
}

fn default_session_timeout_ms() -> u64 {
    300_000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// Default configuration file written on first run.
const DEFAULT_CONFIG: &str = r#"# Courier gateway configuration

[core]
# Root directory for per-conversation workspaces
repo_root = "~/.courier/repo"
workspaces_dir = "workspaces"
log_level = "info"
data_dir = "~/.courier"

[platforms.discord]
enabled = false
token = ""
allow_dms = true
command_prefix = "!ai"
max_message_length = 2000

[platforms.misskey]
enabled = false
host = ""
token = ""
allow_dms = true
command_prefix = "!ai"
max_message_length = 3000

[agent]
# "copilot" or "gemini"
provider = "copilot"
model = "default"
timeout_ms = 300000
# Credentials may also come from GITHUB_TOKEN / GEMINI_API_KEY
github_token = ""
gemini_api_key = ""

[gateway]
host = "127.0.0.1"
port = 3001

[context]
recent_message_limit = 20
memory_max_chars = 500
token_limit = 16000

[session]
timeout_ms = 300000
sweep_interval_secs = 60
"#;

impl Config {
    /// Load configuration from the default location, creating a commented
    /// default file on first run.
    pub fn load_or_create() -> Result<Self, GatewayError> {
        let path = Self::default_path()?;
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(GatewayError::Io)?;
            }
            fs::write(&path, DEFAULT_CONFIG).map_err(GatewayError::Io)?;
            tracing::info!("Wrote default configuration to {:?}", path);
        }
        Self::load_from_path(&path)
    }

    /// Load configuration from an explicit path.
    pub fn load_from_path(path: &Path) -> Result<Self, GatewayError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read {:?}: {}", path, e)))?;

        let mut config: Config = toml::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))?;

        config.core.repo_root = expand_tilde(&config.core.repo_root);
        config.core.data_dir = expand_tilde(&config.core.data_dir);
        if let Some(p) = config.context.system_prompt_path.take() {
            config.context.system_prompt_path = Some(expand_tilde(&p));
        }

        config.validate()?;
        Ok(config)
    }

    /// Default configuration file path: ~/.courier/config.toml
    pub fn default_path() -> Result<PathBuf, GatewayError> {
        let home = dirs::home_dir()
            .ok_or_else(|| GatewayError::Config("Could not determine home directory".to_string()))?;
        Ok(home.join(".courier").join("config.toml"))
    }

    /// Validate the configuration, failing fast on fatal problems.
    pub fn validate(&self) -> Result<(), GatewayError> {
        // The skill gateway must never listen on a non-loopback interface.
        let host = self.gateway.host.as_str();
        let is_loopback = host == "localhost"
            || IpAddr::from_str(host)
                .map(|ip| ip.is_loopback())
                .unwrap_or(false);
        if !is_loopback {
            return Err(GatewayError::Config(format!(
                "Gateway host must be a loopback interface, got '{}'",
                host
            )));
        }

        if self.platforms.misskey.enabled && self.platforms.misskey.host.trim().is_empty() {
            return Err(GatewayError::Config(
                "Misskey is enabled but no host is configured".to_string(),
            ));
        }

        if self.context.token_limit == 0 {
            return Err(GatewayError::Config(
                "context.token_limit must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Ensure the repository root exists, creating it if necessary.
    pub fn ensure_repo_root(&self) -> Result<(), GatewayError> {
        fs::create_dir_all(self.core.repo_root.join(&self.core.workspaces_dir))
            .map_err(GatewayError::Io)
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" {
        return dirs::home_dir().unwrap_or_else(|| path.to_path_buf());
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[core]
repo_root = "/tmp/courier-test"

[agent]
provider = "copilot"
"#
    }

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.agent.provider, AgentProvider::Copilot);
        assert_eq!(config.gateway.port, 3001);
        assert_eq!(config.context.recent_message_limit, 20);
        assert_eq!(config.session.sweep_interval_secs, 60);
    }

    #[test]
    fn test_default_config_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert!(!config.platforms.discord.enabled);
        assert!(!config.platforms.misskey.enabled);
        assert_eq!(config.platforms.discord.max_message_length, 2000);
        assert_eq!(config.platforms.misskey.max_message_length, 3000);
    }

    #[test]
    fn test_non_loopback_gateway_host_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.gateway.host = "0.0.0.0".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));

        config.gateway.host = "192.168.1.5".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_loopback_hosts_accepted() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        for host in ["127.0.0.1", "::1", "localhost"] {
            config.gateway.host = host.to_string();
            assert!(config.validate().is_ok(), "host {} should be accepted", host);
        }
    }

    #[test]
    fn test_agent_command_line_defaults() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        let (cmd, args) = config.agent.command_line();
        assert_eq!(cmd, "copilot");
        assert_eq!(args, vec!["--acp", "--stdio"]);
    }

    #[test]
    fn test_agent_command_line_override() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.agent.command = "/usr/local/bin/copilot-dev".to_string();
        config.agent.args = vec!["--stdio".to_string()];
        let (cmd, args) = config.agent.command_line();
        assert_eq!(cmd, "/usr/local/bin/copilot-dev");
        assert_eq!(args, vec!["--stdio"]);
    }

    #[test]
    fn test_credential_from_config_wins() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.agent.github_token = "ghp_config".to_string();
        let (name, value) = config.agent.credential().unwrap();
        assert_eq!(name, "GITHUB_TOKEN");
        assert_eq!(value, "ghp_config");
    }

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde(Path::new("~/x")), home.join("x"));
        assert_eq!(
            expand_tilde(Path::new("/absolute/x")),
            PathBuf::from("/absolute/x")
        );
    }

    #[test]
    fn test_misskey_enabled_requires_host() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.platforms.misskey.enabled = true;
        assert!(config.validate().is_err());
        config.platforms.misskey.host = "misskey.example.org".to_string();
        assert!(config.validate().is_ok());
    }
}
