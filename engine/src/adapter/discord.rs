//! Discord adapter
//!
//! REST for replies, history and user lookups; a gateway v10 websocket for
//! receiving events. Messages from bots (including ourselves) are filtered
//! out, and an event is emitted only for DMs (when allowed), direct
//! mentions, or the configured command prefix. Mention tokens are stripped
//! from the content before emission.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use regex::Regex;
use reqwest::Client;
use sdk::errors::GatewayError;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::{
    prepare_reply_content, AdapterCapabilities, ConnectionStatus, EventSink, NormalizedEvent,
    PlatformAdapter, PlatformMessage, ReconnectBackoff,
};
use crate::config::DiscordConfig;

const API_BASE: &str = "https://discord.com/api/v10";
const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
const INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 12) | (1 << 15);

#[derive(Deserialize, Debug)]
struct GatewayFrame {
    op: u8,
    #[serde(default)]
    d: serde_json::Value,
    #[serde(default)]
    s: Option<i64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Author {
    id: String,
    username: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Deserialize, Debug)]
struct InboundMessage {
    id: String,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    author: Author,
    #[serde(default)]
    content: String,
    timestamp: String,
    #[serde(default)]
    mentions: Vec<Author>,
}

#[derive(Deserialize, Debug)]
struct RestMessage {
    id: String,
    author: Author,
    #[serde(default)]
    content: String,
    timestamp: String,
}

/// State shared between the adapter handle and the gateway task.
struct Shared {
    event_sink: Mutex<Option<EventSink>>,
    status: Mutex<ConnectionStatus>,
    self_id: Mutex<Option<String>>,
    username_cache: Mutex<HashMap<String, String>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

#[derive(Clone)]
pub struct DiscordAdapter {
    config: DiscordConfig,
    client: Client,
    shared: Arc<Shared>,
}

impl DiscordAdapter {
    pub fn new(config: DiscordConfig) -> Self {
        Self {
            config,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            shared: Arc::new(Shared {
                event_sink: Mutex::new(None),
                status: Mutex::new(ConnectionStatus::Disconnected),
                self_id: Mutex::new(None),
                username_cache: Mutex::new(HashMap::new()),
                shutdown: Mutex::new(None),
            }),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.shared.status.lock().expect("status lock poisoned") = status;
    }

    fn set_self_id(&self, id: String) {
        *self.shared.self_id.lock().expect("self_id lock poisoned") = Some(id);
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.config.token)
    }

    fn parse_timestamp(raw: &str) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now())
    }

    /// Decide whether an inbound message becomes an event, and normalize it.
    fn normalize(&self, message: &InboundMessage) -> Option<NormalizedEvent> {
        let self_id = self
            .shared
            .self_id
            .lock()
            .expect("self_id lock poisoned")
            .clone()?;

        if message.author.bot || message.author.id == self_id {
            return None;
        }

        let is_dm = message.guild_id.is_none();
        let mentioned = message.mentions.iter().any(|m| m.id == self_id);
        let has_prefix = !self.config.command_prefix.is_empty()
            && message.content.starts_with(&self.config.command_prefix);

        if !((is_dm && self.config.allow_dms) || mentioned || has_prefix) {
            return None;
        }

        let mut content = message.content.clone();
        if mentioned {
            // Mention tokens look like <@id> or <@!id>
            if let Ok(re) = Regex::new(&format!(r"<@!?{}>", regex::escape(&self_id))) {
                content = re.replace_all(&content, "").trim().to_string();
            }
        }

        Some(NormalizedEvent {
            platform: "discord".to_string(),
            channel_id: message.channel_id.clone(),
            user_id: message.author.id.clone(),
            message_id: message.id.clone(),
            is_dm,
            guild_id: message.guild_id.clone().unwrap_or_default(),
            content,
            timestamp: Self::parse_timestamp(&message.timestamp),
        })
    }

    async fn emit(&self, event: NormalizedEvent) {
        let sink = self
            .shared
            .event_sink
            .lock()
            .expect("event sink lock poisoned")
            .clone();
        match sink {
            Some(sink) => {
                if let Err(e) = sink.send(event).await {
                    warn!("Event sink closed: {}", e);
                }
            }
            None => warn!("Discord event dropped: no sink registered"),
        }
    }

    /// Long-lived gateway loop with reconnect backoff.
    async fn run_gateway(self, mut stop: watch::Receiver<bool>) {
        let max_attempts = if self.config.max_reconnect_attempts == 0 {
            None
        } else {
            Some(self.config.max_reconnect_attempts)
        };
        let mut backoff = ReconnectBackoff::new(max_attempts);

        loop {
            if *stop.borrow() {
                break;
            }
            self.set_status(ConnectionStatus::Connecting);

            match tokio_tungstenite::connect_async(GATEWAY_URL).await {
                Ok((stream, _response)) => {
                    info!("Discord gateway connected");
                    if self.drive_connection(stream, &mut stop, &mut backoff).await {
                        // Clean shutdown requested
                        break;
                    }
                }
                Err(e) => {
                    error!("Discord gateway connect failed: {}", e);
                }
            }

            self.set_status(ConnectionStatus::Disconnected);
            let Some(delay) = backoff.next_delay() else {
                error!("Discord reconnect attempts exhausted");
                break;
            };
            info!("Discord reconnecting in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Drive one websocket connection. Returns true when shutdown was
    /// requested, false to reconnect.
    async fn drive_connection(
        &self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        stop: &mut watch::Receiver<bool>,
        backoff: &mut ReconnectBackoff,
    ) -> bool {
        let (mut write, mut read) = stream.split();
        let mut last_seq: Option<i64> = None;
        // A long placeholder until the hello frame supplies the real one.
        let mut heartbeat = tokio::time::interval(Duration::from_secs(40));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut hello_seen = false;

        loop {
            tokio::select! {
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = write.send(WsMessage::Pong(data)).await;
                            continue;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            info!("Discord gateway closed by server");
                            return false;
                        }
                        Some(Err(e)) => {
                            warn!("Discord gateway read error: {}", e);
                            return false;
                        }
                        _ => continue,
                    };

                    let frame: GatewayFrame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Unparseable gateway frame: {}", e);
                            continue;
                        }
                    };

                    if let Some(seq) = frame.s {
                        last_seq = Some(seq);
                    }

                    match frame.op {
                        // Hello: start heartbeating and identify
                        10 => {
                            let interval_ms = frame.d
                                .get("heartbeat_interval")
                                .and_then(|v| v.as_u64())
                                .unwrap_or(41_250);
                            heartbeat = tokio::time::interval(Duration::from_millis(interval_ms));
                            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                            hello_seen = true;

                            let identify = json!({
                                "op": 2,
                                "d": {
                                    "token": self.config.token,
                                    "intents": INTENTS,
                                    "properties": {
                                        "os": std::env::consts::OS,
                                        "browser": "courier",
                                        "device": "courier",
                                    }
                                }
                            });
                            if let Err(e) = write.send(WsMessage::Text(identify.to_string())).await {
                                warn!("Failed to identify: {}", e);
                                return false;
                            }
                        }
                        // Dispatch
                        0 => match frame.t.as_deref() {
                            Some("READY") => {
                                if let Some(id) = frame.d
                                    .get("user")
                                    .and_then(|u| u.get("id"))
                                    .and_then(|v| v.as_str())
                                {
                                    self.set_self_id(id.to_string());
                                }
                                self.set_status(ConnectionStatus::Connected);
                                backoff.reset();
                                info!("Discord ready");
                            }
                            Some("MESSAGE_CREATE") => {
                                let message: InboundMessage =
                                    match serde_json::from_value(frame.d) {
                                        Ok(message) => message,
                                        Err(e) => {
                                            debug!("Skipping message payload: {}", e);
                                            continue;
                                        }
                                    };
                                if let Some(event) = self.normalize(&message) {
                                    self.emit(event).await;
                                }
                            }
                            _ => {}
                        },
                        // Heartbeat request
                        1 => {
                            let beat = json!({"op": 1, "d": last_seq});
                            let _ = write.send(WsMessage::Text(beat.to_string())).await;
                        }
                        // Reconnect / invalid session
                        7 | 9 => {
                            info!("Discord asked for a reconnect (op {})", frame.op);
                            return false;
                        }
                        // Heartbeat ack
                        11 => {}
                        other => debug!("Unhandled gateway op {}", other),
                    }
                }
                _ = heartbeat.tick(), if hello_seen => {
                    let beat = json!({"op": 1, "d": last_seq});
                    if let Err(e) = write.send(WsMessage::Text(beat.to_string())).await {
                        warn!("Heartbeat failed: {}", e);
                        return false;
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return true;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PlatformAdapter for DiscordAdapter {
    fn platform(&self) -> &str {
        "discord"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            fetch_history: true,
            search: true,
            dm: true,
            guild: true,
            reactions: true,
            max_message_length: self.config.max_message_length,
        }
    }

    fn connection_status(&self) -> ConnectionStatus {
        *self.shared.status.lock().expect("status lock poisoned")
    }

    fn on_event(&self, sink: EventSink) {
        *self
            .shared
            .event_sink
            .lock()
            .expect("event sink lock poisoned") = Some(sink);
    }

    async fn connect(&self) -> Result<(), GatewayError> {
        if self.config.token.trim().is_empty() {
            return Err(GatewayError::Config(
                "Discord token not configured".to_string(),
            ));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.shared.shutdown.lock().expect("shutdown lock poisoned") = Some(stop_tx);

        tokio::spawn(self.clone().run_gateway(stop_rx));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), GatewayError> {
        if let Some(stop) = self
            .shared
            .shutdown
            .lock()
            .expect("shutdown lock poisoned")
            .take()
        {
            let _ = stop.send(true);
        }
        self.set_status(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn send_reply(
        &self,
        channel_id: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> Result<(), GatewayError> {
        let content = prepare_reply_content(content, self.config.max_message_length);

        let mut body = json!({ "content": content });
        if let Some(message_id) = reply_to {
            body["message_reference"] = json!({ "message_id": message_id });
        }

        let response = self
            .client
            .post(format!("{}/channels/{}/messages", API_BASE, channel_id))
            .header("Authorization", self.auth_header())
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Platform(format!("discord send: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::Platform(format!(
                "discord send returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn fetch_recent(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<PlatformMessage>, GatewayError> {
        let response = self
            .client
            .get(format!("{}/channels/{}/messages", API_BASE, channel_id))
            .query(&[("limit", limit.min(100).to_string())])
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| GatewayError::Platform(format!("discord history: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::Platform(format!(
                "discord history returned {}",
                response.status()
            )));
        }

        let messages: Vec<RestMessage> = response
            .json()
            .await
            .map_err(|e| GatewayError::Platform(format!("discord history parse: {}", e)))?;

        // Discord returns newest first; callers want oldest first.
        let mut result: Vec<PlatformMessage> = messages
            .into_iter()
            .map(|m| PlatformMessage {
                message_id: m.id,
                user_id: m.author.id,
                username: m.author.username,
                content: m.content,
                timestamp: Self::parse_timestamp(&m.timestamp),
                is_bot: m.author.bot,
            })
            .collect();
        result.reverse();
        Ok(result)
    }

    async fn search_related(
        &self,
        guild_id: &str,
        _channel_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PlatformMessage>, GatewayError> {
        let response = self
            .client
            .get(format!("{}/guilds/{}/messages/search", API_BASE, guild_id))
            .query(&[("content", query)])
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| GatewayError::Platform(format!("discord search: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::Platform(format!(
                "discord search returned {}",
                response.status()
            )));
        }

        // The search endpoint nests each hit in its own context array; the
        // first entry is the hit itself.
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Platform(format!("discord search parse: {}", e)))?;

        let mut result = Vec::new();
        if let Some(groups) = body.get("messages").and_then(|v| v.as_array()) {
            for group in groups.iter().take(limit) {
                let Some(hit) = group.as_array().and_then(|g| g.first()) else {
                    continue;
                };
                let Ok(message) = serde_json::from_value::<RestMessage>(hit.clone()) else {
                    continue;
                };
                result.push(PlatformMessage {
                    message_id: message.id,
                    user_id: message.author.id,
                    username: message.author.username,
                    content: message.content,
                    timestamp: Self::parse_timestamp(&message.timestamp),
                    is_bot: message.author.bot,
                });
            }
        }
        Ok(result)
    }

    async fn get_username(&self, user_id: &str) -> Result<String, GatewayError> {
        if let Some(cached) = self
            .shared
            .username_cache
            .lock()
            .expect("username cache lock poisoned")
            .get(user_id)
        {
            return Ok(cached.clone());
        }

        let response = self
            .client
            .get(format!("{}/users/{}", API_BASE, user_id))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| GatewayError::Platform(format!("discord user lookup: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::Platform(format!(
                "discord user lookup returned {}",
                response.status()
            )));
        }

        let user: Author = response
            .json()
            .await
            .map_err(|e| GatewayError::Platform(format!("discord user parse: {}", e)))?;

        self.shared
            .username_cache
            .lock()
            .expect("username cache lock poisoned")
            .insert(user_id.to_string(), user.username.clone());
        Ok(user.username)
    }

    fn is_self(&self, user_id: &str) -> bool {
        self.shared
            .self_id
            .lock()
            .expect("self_id lock poisoned")
            .as_deref()
            == Some(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter_with_self(self_id: &str) -> DiscordAdapter {
        let adapter = DiscordAdapter::new(DiscordConfig {
            enabled: true,
            token: "t".to_string(),
            allow_dms: true,
            command_prefix: "!ai".to_string(),
            max_message_length: 2000,
            max_reconnect_attempts: 0,
        });
        adapter.set_self_id(self_id.to_string());
        adapter
    }

    fn inbound(
        author_id: &str,
        bot: bool,
        guild: Option<&str>,
        content: &str,
        mentions: Vec<&str>,
    ) -> InboundMessage {
        InboundMessage {
            id: "m1".to_string(),
            channel_id: "c1".to_string(),
            guild_id: guild.map(|g| g.to_string()),
            author: Author {
                id: author_id.to_string(),
                username: "user".to_string(),
                bot,
            },
            content: content.to_string(),
            timestamp: "2024-05-01T12:00:00+00:00".to_string(),
            mentions: mentions
                .into_iter()
                .map(|id| Author {
                    id: id.to_string(),
                    username: "bot".to_string(),
                    bot: true,
                })
                .collect(),
        }
    }

    #[test]
    fn test_bot_and_self_messages_filtered() {
        let adapter = adapter_with_self("999");
        assert!(adapter
            .normalize(&inbound("42", true, None, "hello", vec![]))
            .is_none());
        assert!(adapter
            .normalize(&inbound("999", false, None, "hello", vec![]))
            .is_none());
    }

    #[test]
    fn test_dm_emitted_when_allowed() {
        let adapter = adapter_with_self("999");
        let event = adapter
            .normalize(&inbound("42", false, None, "hello", vec![]))
            .unwrap();
        assert!(event.is_dm);
        assert_eq!(event.guild_id, "");
        assert_eq!(event.content, "hello");
    }

    #[test]
    fn test_guild_message_needs_mention_or_prefix() {
        let adapter = adapter_with_self("999");

        // Plain guild chatter: ignored
        assert!(adapter
            .normalize(&inbound("42", false, Some("g1"), "hello", vec![]))
            .is_none());

        // Mention: emitted, token stripped
        let event = adapter
            .normalize(&inbound(
                "42",
                false,
                Some("g1"),
                "<@999> what's the weather",
                vec!["999"],
            ))
            .unwrap();
        assert_eq!(event.content, "what's the weather");
        assert_eq!(event.guild_id, "g1");
        assert!(!event.is_dm);

        // Nickname-form mention token also stripped
        let event = adapter
            .normalize(&inbound(
                "42",
                false,
                Some("g1"),
                "<@!999> hello there",
                vec!["999"],
            ))
            .unwrap();
        assert_eq!(event.content, "hello there");

        // Command prefix: emitted as-is
        let event = adapter
            .normalize(&inbound("42", false, Some("g1"), "!ai ping", vec![]))
            .unwrap();
        assert_eq!(event.content, "!ai ping");
    }

    #[test]
    fn test_dms_suppressed_when_disallowed() {
        let mut adapter = adapter_with_self("999");
        adapter.config.allow_dms = false;
        assert!(adapter
            .normalize(&inbound("42", false, None, "hello", vec![]))
            .is_none());
    }

    #[test]
    fn test_timestamp_parse_fallback() {
        let parsed = DiscordAdapter::parse_timestamp("2024-05-01T12:00:00+00:00");
        assert_eq!(parsed.timezone(), chrono::Utc);
        // Garbage falls back to now rather than failing the event
        let _ = DiscordAdapter::parse_timestamp("not a date");
    }

    #[test]
    fn test_is_self() {
        let adapter = adapter_with_self("999");
        assert!(adapter.is_self("999"));
        assert!(!adapter.is_self("42"));
    }
}
