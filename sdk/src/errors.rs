//! Error types and handling
//!
//! This module provides the error types used throughout the Courier gateway.
//! All errors implement the `CourierErrorExt` trait which provides
//! user-friendly hints and indicates whether errors are recoverable.
//!
//! # Security
//!
//! All error messages are scrubbed to ensure:
//! - No secrets (API keys, tokens) are included
//! - No file paths are exposed to remote users
//! - All messages are safe to display to end users

use thiserror::Error;

/// Trait for Courier error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All gateway errors implement this
/// trait.
pub trait CourierErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain:
    /// - Secrets (API keys, tokens, passwords)
    /// - File paths (for remote users)
    /// - Internal implementation details
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors typically require manual intervention or a configuration fix.
    fn is_recoverable(&self) -> bool;
}

/// Main gateway error type
///
/// This enum represents all possible errors that can occur in the Courier
/// gateway. Each variant includes context-specific information while ensuring
/// no sensitive data (secrets, internal paths) is exposed to remote users.
///
/// # Error Categories
///
/// - **Configuration**: Invalid or missing configuration (fatal at startup)
/// - **Platform**: Platform API or connection failures (retryable)
/// - **Agent**: Agent subprocess or protocol failures
/// - **Memory**: Memory log I/O failures (retryable on the next call)
/// - **Skill**: Per-request skill validation or execution failures
/// - **Workspace boundary**: Path escapes (never retried)
/// - **Session**: Unknown or expired sessions
///
/// # Examples
///
/// ```
/// use sdk::errors::{CourierErrorExt, GatewayError};
/// use std::path::PathBuf;
///
/// let error = GatewayError::WorkspaceBoundary(PathBuf::from("/etc/passwd"));
/// println!("Hint: {}", error.user_hint());
/// assert!(!error.is_recoverable());
///
/// let transient = GatewayError::Platform("rate limited".to_string());
/// assert!(transient.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum GatewayError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Platform adapter errors
    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Platform not connected: {0}")]
    PlatformNotConnected(String),

    // Agent subprocess / protocol errors
    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Agent protocol error: {0}")]
    AgentProtocol(String),

    #[error("Agent prompt cancelled")]
    PromptCancelled,

    // Memory log errors
    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Visibility scope error: {0}")]
    VisibilityScope(String),

    // Skill errors
    #[error("Skill error: {0}")]
    Skill(String),

    #[error("Unknown skill: {0}")]
    UnknownSkill(String),

    // Workspace boundary errors
    #[error("Path outside workspace: {0:?}")]
    WorkspaceBoundary(std::path::PathBuf),

    #[error("Path canonicalization failed for {0:?}: {1}")]
    PathCanonicalization(std::path::PathBuf, String),

    // Session errors
    #[error("Invalid or expired session")]
    InvalidSession,

    #[error("Reply already sent for this session")]
    ReplyAlreadySent,

    // Gateway / daemon errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Daemon already running")]
    DaemonAlreadyRunning,

    #[error("Duplicate event: {0}")]
    DuplicateEvent(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CourierErrorExt for GatewayError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",

            Self::Platform(_) => "Platform operation failed. Check your network and tokens",
            Self::PlatformNotConnected(_) => "Platform is not connected. The bot will reconnect",

            Self::Agent(_) => "The reasoning agent failed. Check the agent binary and credentials",
            Self::AgentProtocol(_) => "The reasoning agent sent an unexpected response",
            Self::PromptCancelled => "The request was cancelled",

            Self::Memory(_) => "Memory operation failed. It can be retried",
            Self::VisibilityScope(_) => "Private memories can only be saved in DM contexts",

            Self::Skill(_) => "Skill execution failed",
            Self::UnknownSkill(_) => "The requested skill is not available",

            Self::WorkspaceBoundary(_) => "Operation must be within the conversation workspace",
            Self::PathCanonicalization(_, _) => "Invalid path specified",

            Self::InvalidSession => "Session is unknown or has expired",
            Self::ReplyAlreadySent => "A reply was already sent for this session",

            Self::Gateway(_) => "Skill gateway operation failed",
            Self::DaemonAlreadyRunning => "Stop the existing daemon first with 'courier stop'",
            Self::DuplicateEvent(_) => "This message is already being processed",

            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Config(_)
            | Self::WorkspaceBoundary(_)
            | Self::VisibilityScope(_)
            | Self::DaemonAlreadyRunning
            | Self::ReplyAlreadySent
            | Self::DuplicateEvent(_) => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_boundary_errors_are_not_recoverable() {
        let err = GatewayError::WorkspaceBoundary(PathBuf::from("/etc"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_platform_errors_are_recoverable() {
        let err = GatewayError::Platform("timeout".to_string());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_hints_do_not_leak_paths() {
        let err = GatewayError::WorkspaceBoundary(PathBuf::from("/home/user/.ssh/id_rsa"));
        assert!(!err.user_hint().contains("/home"));
        assert!(!err.user_hint().contains(".ssh"));
    }

    #[test]
    fn test_duplicate_event_display() {
        let err = GatewayError::DuplicateEvent("discord:123".to_string());
        assert_eq!(err.to_string(), "Duplicate event: discord:123");
    }
}
