//! Platform adapter contract and adapters
//!
//! Adapters normalize native platform payloads into [`NormalizedEvent`]s,
//! deliver replies, and serve conversation history. The orchestrator only
//! ever sees the contract defined here; Discord and Misskey specifics stay
//! inside their modules.
//!
//! Adapters are responsible for filtering before emission: messages from the
//! bot itself or other bots are dropped, and an event is emitted only when
//! (a) DMs are allowed and the message is a DM, (b) the bot is directly
//! mentioned, or (c) the content starts with the configured command prefix.

pub mod discord;
pub mod misskey;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use sdk::errors::GatewayError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Platform-agnostic representation of an incoming user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub platform: String,
    pub channel_id: String,
    pub user_id: String,
    pub message_id: String,
    pub is_dm: bool,
    /// Empty when the message is not in a guild
    pub guild_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Historical platform message returned by history/search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformMessage {
    pub message_id: String,
    pub user_id: String,
    pub username: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_bot: bool,
}

/// What a platform adapter can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterCapabilities {
    pub fetch_history: bool,
    pub search: bool,
    pub dm: bool,
    pub guild: bool,
    pub reactions: bool,
    pub max_message_length: usize,
}

/// Adapter connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Channel sender adapters push normalized events into.
pub type EventSink = mpsc::Sender<NormalizedEvent>;

/// Contract every platform adapter implements.
///
/// All methods take `&self`; adapters use interior mutability so a single
/// `Arc<dyn PlatformAdapter>` can be shared between the orchestrator, the
/// skill handlers and the connection task.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Platform identifier used in workspace keys ("discord", "misskey").
    fn platform(&self) -> &str;

    /// Static capability flags for this adapter.
    fn capabilities(&self) -> AdapterCapabilities;

    /// Current connection state.
    fn connection_status(&self) -> ConnectionStatus;

    /// Register the sink that receives normalized events.
    ///
    /// Must be called before `connect`; events observed while no sink is
    /// registered are dropped.
    fn on_event(&self, sink: EventSink);

    /// Establish the platform connection. Spawns the read loop in the
    /// background and returns once it is running.
    async fn connect(&self) -> Result<(), GatewayError>;

    /// Tear down the platform connection.
    async fn disconnect(&self) -> Result<(), GatewayError>;

    /// Send a reply to a channel, optionally threaded to a message.
    async fn send_reply(
        &self,
        channel_id: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> Result<(), GatewayError>;

    /// Fetch up to `limit` recent messages from a channel, oldest first.
    async fn fetch_recent(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<PlatformMessage>, GatewayError>;

    /// Search messages related to a query within a guild.
    ///
    /// Only meaningful when `capabilities().search` is true; the default
    /// implementation reports the platform as unsupporting.
    async fn search_related(
        &self,
        _guild_id: &str,
        _channel_id: &str,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<PlatformMessage>, GatewayError> {
        Err(GatewayError::Platform(
            "Platform does not support message search".to_string(),
        ))
    }

    /// Resolve a display name for a user id.
    async fn get_username(&self, user_id: &str) -> Result<String, GatewayError>;

    /// Whether the given user id is the bot's own account.
    fn is_self(&self, user_id: &str) -> bool;
}

/// Truncate outgoing reply content to the platform maximum.
///
/// Content longer than `max_len` is cut to `max_len - 3` characters and
/// `...` is appended. Truncation is character-based so multi-byte content
/// never splits a codepoint.
pub fn prepare_reply_content(content: &str, max_len: usize) -> String {
    let char_count = content.chars().count();
    if char_count <= max_len {
        return content.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let truncated: String = content.chars().take(keep).collect();
    format!("{}...", truncated)
}

/// Exponential reconnect backoff with jitter.
///
/// Base 1s, cap 60s, doubling per attempt, ±10% jitter. Infinite by default
/// unless a max-attempts cap is configured.
#[derive(Debug)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
    max_attempts: Option<u32>,
}

impl ReconnectBackoff {
    pub fn new(max_attempts: Option<u32>) -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            attempt: 0,
            max_attempts,
        }
    }

    /// Delay before the next reconnect attempt, or `None` when the attempt
    /// cap is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let exp = self.attempt.min(6); // 2^6 s > 60 s cap
        self.attempt += 1;

        let raw = self.base.as_millis() as u64 * (1u64 << exp);
        let capped = raw.min(self.cap.as_millis() as u64);

        // ±10% jitter
        let jitter_range = capped / 10;
        let delay_ms = if jitter_range > 0 {
            let mut rng = rand::thread_rng();
            capped - jitter_range + rng.gen_range(0..=jitter_range * 2)
        } else {
            capped
        };

        Some(Duration::from_millis(delay_ms))
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
