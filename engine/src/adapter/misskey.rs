//! Misskey adapter
//!
//! Streaming websocket (`main` channel) for receiving mentions and DMs,
//! REST for notes and user lookups. Misskey models DMs as notes with
//! `specified` visibility; replies to those keep the same scope restricted
//! to the original author. The conversation channel is the remote user, so
//! `channel_id` carries their user id.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
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
use crate::config::MisskeyConfig;

#[derive(Deserialize, Debug, Clone)]
struct NoteUser {
    username: String,
    #[serde(default, rename = "isBot")]
    is_bot: bool,
}

#[derive(Deserialize, Debug, Clone)]
struct Note {
    id: String,
    #[serde(rename = "userId")]
    user_id: String,
    user: NoteUser,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    visibility: String,
    #[serde(default)]
    mentions: Vec<String>,
    #[serde(rename = "createdAt")]
    created_at: String,
}

/// Privacy scope of a seen note, remembered so replies can match it.
#[derive(Debug, Clone)]
struct NoteScope {
    visibility: String,
    author_id: String,
}

/// State shared between the adapter handle and the streaming task.
struct Shared {
    event_sink: Mutex<Option<EventSink>>,
    status: Mutex<ConnectionStatus>,
    self_id: Mutex<Option<String>>,
    self_username: Mutex<Option<String>>,
    username_cache: Mutex<HashMap<String, String>>,
    /// message_id -> scope of the originating note
    note_scopes: Mutex<HashMap<String, NoteScope>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

#[derive(Clone)]
pub struct MisskeyAdapter {
    config: MisskeyConfig,
    client: Client,
    shared: Arc<Shared>,
}

impl MisskeyAdapter {
    pub fn new(config: MisskeyConfig) -> Self {
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
                self_username: Mutex::new(None),
                username_cache: Mutex::new(HashMap::new()),
                note_scopes: Mutex::new(HashMap::new()),
                shutdown: Mutex::new(None),
            }),
        }
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("https://{}/api/{}", self.config.host, endpoint)
    }

    fn streaming_url(&self) -> String {
        format!("wss://{}/streaming?i={}", self.config.host, self.config.token)
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.shared.status.lock().expect("status lock poisoned") = status;
    }

    async fn api_post(
        &self,
        endpoint: &str,
        mut body: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        body["i"] = json!(self.config.token);
        let response = self
            .client
            .post(self.api_url(endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Platform(format!("misskey {}: {}", endpoint, e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::Platform(format!(
                "misskey {} returned {}",
                endpoint,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::Platform(format!("misskey {} parse: {}", endpoint, e)))
    }

    /// Resolve our own account so self-filtering and mention detection work.
    async fn resolve_self(&self) -> Result<(), GatewayError> {
        let me = self.api_post("i", json!({})).await?;
        let id = me
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::Platform("misskey i: no id".to_string()))?;
        let username = me
            .get("username")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        *self.shared.self_id.lock().expect("self_id lock poisoned") = Some(id.to_string());
        *self
            .shared
            .self_username
            .lock()
            .expect("self_username lock poisoned") = Some(username.to_string());
        Ok(())
    }

    fn parse_timestamp(raw: &str) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now())
    }

    /// Decide whether a note becomes an event, and normalize it.
    fn normalize(&self, note: &Note) -> Option<NormalizedEvent> {
        let self_id = self
            .shared
            .self_id
            .lock()
            .expect("self_id lock poisoned")
            .clone()?;

        if note.user.is_bot || note.user_id == self_id {
            return None;
        }

        let text = note.text.clone().unwrap_or_default();
        let is_dm = note.visibility == "specified";
        let mentioned = note.mentions.iter().any(|id| *id == self_id);
        let has_prefix = !self.config.command_prefix.is_empty()
            && text.starts_with(&self.config.command_prefix);

        if !((is_dm && self.config.allow_dms) || mentioned || has_prefix) {
            return None;
        }

        let mut content = text;
        if mentioned {
            if let Some(username) = self
                .shared
                .self_username
                .lock()
                .expect("self_username lock poisoned")
                .clone()
            {
                // Mentions render as @username or @username@host
                content = content
                    .split_whitespace()
                    .filter(|word| {
                        let stripped = word.strip_prefix('@').unwrap_or(word);
                        !(word.starts_with('@')
                            && (stripped == username
                                || stripped.starts_with(&format!("{}@", username))))
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
            }
        }

        // Remember the note scope so the reply can mirror it.
        self.shared
            .note_scopes
            .lock()
            .expect("note scopes lock poisoned")
            .insert(
                note.id.clone(),
                NoteScope {
                    visibility: note.visibility.clone(),
                    author_id: note.user_id.clone(),
                },
            );

        Some(NormalizedEvent {
            platform: "misskey".to_string(),
            // The conversation is with this user; there is no channel
            // concept for mentions and DMs.
            channel_id: note.user_id.clone(),
            user_id: note.user_id.clone(),
            message_id: note.id.clone(),
            is_dm,
            guild_id: String::new(),
            content,
            timestamp: Self::parse_timestamp(&note.created_at),
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
            None => warn!("Misskey event dropped: no sink registered"),
        }
    }

    /// Long-lived streaming loop with reconnect backoff.
    async fn run_streaming(self, mut stop: watch::Receiver<bool>) {
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

            if self.shared.self_id.lock().expect("self_id lock poisoned").is_none() {
                if let Err(e) = self.resolve_self().await {
                    error!("Misskey self lookup failed: {}", e);
                }
            }

            match tokio_tungstenite::connect_async(self.streaming_url()).await {
                Ok((stream, _response)) => {
                    info!("Misskey streaming connected");
                    if self.drive_connection(stream, &mut stop, &mut backoff).await {
                        break;
                    }
                }
                Err(e) => {
                    error!("Misskey streaming connect failed: {}", e);
                }
            }

            self.set_status(ConnectionStatus::Disconnected);
            let Some(delay) = backoff.next_delay() else {
                error!("Misskey reconnect attempts exhausted");
                break;
            };
            info!("Misskey reconnecting in {:?}", delay);
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

        // Join the main channel; mentions and specified notes arrive there.
        let connect = json!({
            "type": "connect",
            "body": { "channel": "main", "id": "main" }
        });
        if let Err(e) = write.send(WsMessage::Text(connect.to_string())).await {
            warn!("Misskey channel connect failed: {}", e);
            return false;
        }

        self.set_status(ConnectionStatus::Connected);
        backoff.reset();

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
                            info!("Misskey streaming closed by server");
                            return false;
                        }
                        Some(Err(e)) => {
                            warn!("Misskey streaming read error: {}", e);
                            return false;
                        }
                        _ => continue,
                    };

                    let frame: serde_json::Value = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Unparseable streaming frame: {}", e);
                            continue;
                        }
                    };

                    if frame.get("type").and_then(|v| v.as_str()) != Some("channel") {
                        continue;
                    }
                    let Some(body) = frame.get("body") else { continue };
                    let kind = body.get("type").and_then(|v| v.as_str()).unwrap_or("");

                    // `mention` covers both public mentions and specified
                    // (DM) notes addressed to us.
                    if kind == "mention" {
                        let Some(payload) = body.get("body") else { continue };
                        let note: Note = match serde_json::from_value(payload.clone()) {
                            Ok(note) => note,
                            Err(e) => {
                                debug!("Skipping note payload: {}", e);
                                continue;
                            }
                        };
                        if let Some(event) = self.normalize(&note) {
                            self.emit(event).await;
                        }
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
impl PlatformAdapter for MisskeyAdapter {
    fn platform(&self) -> &str {
        "misskey"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            fetch_history: true,
            search: false,
            dm: true,
            guild: false,
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
                "Misskey token not configured".to_string(),
            ));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.shared.shutdown.lock().expect("shutdown lock poisoned") = Some(stop_tx);

        tokio::spawn(self.clone().run_streaming(stop_rx));
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
        _channel_id: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> Result<(), GatewayError> {
        let content = prepare_reply_content(content, self.config.max_message_length);

        let mut body = json!({ "text": content });
        if let Some(note_id) = reply_to {
            body["replyId"] = json!(note_id);

            // Mirror the original note's privacy scope; specified notes go
            // back only to their author.
            let scope = self
                .shared
                .note_scopes
                .lock()
                .expect("note scopes lock poisoned")
                .get(note_id)
                .cloned();
            if let Some(scope) = scope {
                if scope.visibility == "specified" {
                    body["visibility"] = json!("specified");
                    body["visibleUserIds"] = json!([scope.author_id]);
                }
            }
        }

        self.api_post("notes/create", body).await?;
        Ok(())
    }

    async fn fetch_recent(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<PlatformMessage>, GatewayError> {
        // The conversation channel is the remote user.
        let body = json!({ "userId": channel_id, "limit": limit.min(100) });
        let notes = self.api_post("users/notes", body).await?;

        let notes: Vec<Note> = serde_json::from_value(notes)
            .map_err(|e| GatewayError::Platform(format!("misskey notes parse: {}", e)))?;

        // Newest first from the API; callers want oldest first.
        let mut result: Vec<PlatformMessage> = notes
            .into_iter()
            .map(|note| PlatformMessage {
                message_id: note.id,
                user_id: note.user_id,
                username: note.user.username,
                content: note.text.unwrap_or_default(),
                timestamp: Self::parse_timestamp(&note.created_at),
                is_bot: note.user.is_bot,
            })
            .collect();
        result.reverse();
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

        let user = self
            .api_post("users/show", json!({ "userId": user_id }))
            .await?;
        let username = user
            .get("username")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::Platform("misskey users/show: no username".to_string()))?
            .to_string();

        self.shared
            .username_cache
            .lock()
            .expect("username cache lock poisoned")
            .insert(user_id.to_string(), username.clone());
        Ok(username)
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

    fn adapter_with_self(id: &str, username: &str) -> MisskeyAdapter {
        let adapter = MisskeyAdapter::new(MisskeyConfig {
            enabled: true,
            host: "misskey.example.org".to_string(),
            token: "t".to_string(),
            allow_dms: true,
            command_prefix: "!ai".to_string(),
            max_message_length: 3000,
            max_reconnect_attempts: 0,
        });
        *adapter.shared.self_id.lock().unwrap() = Some(id.to_string());
        *adapter.shared.self_username.lock().unwrap() = Some(username.to_string());
        adapter
    }

    fn note(
        author_id: &str,
        bot: bool,
        visibility: &str,
        text: &str,
        mentions: Vec<&str>,
    ) -> Note {
        Note {
            id: "n1".to_string(),
            user_id: author_id.to_string(),
            user: NoteUser {
                username: "alice".to_string(),
                is_bot: bot,
            },
            text: Some(text.to_string()),
            visibility: visibility.to_string(),
            mentions: mentions.into_iter().map(|s| s.to_string()).collect(),
            created_at: "2024-05-01T12:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_specified_note_is_dm() {
        let adapter = adapter_with_self("self1", "courier");
        let event = adapter
            .normalize(&note("u1", false, "specified", "hello", vec![]))
            .unwrap();
        assert!(event.is_dm);
        assert_eq!(event.channel_id, "u1");
        assert_eq!(event.guild_id, "");
    }

    #[test]
    fn test_public_note_needs_mention() {
        let adapter = adapter_with_self("self1", "courier");
        assert!(adapter
            .normalize(&note("u1", false, "public", "hello", vec![]))
            .is_none());

        let event = adapter
            .normalize(&note(
                "u1",
                false,
                "public",
                "@courier what time is it",
                vec!["self1"],
            ))
            .unwrap();
        assert!(!event.is_dm);
        assert_eq!(event.content, "what time is it");
    }

    #[test]
    fn test_mention_with_host_stripped() {
        let adapter = adapter_with_self("self1", "courier");
        let event = adapter
            .normalize(&note(
                "u1",
                false,
                "public",
                "@courier@misskey.example.org hello",
                vec!["self1"],
            ))
            .unwrap();
        assert_eq!(event.content, "hello");
    }

    #[test]
    fn test_bot_notes_filtered() {
        let adapter = adapter_with_self("self1", "courier");
        assert!(adapter
            .normalize(&note("u1", true, "specified", "hello", vec![]))
            .is_none());
        assert!(adapter
            .normalize(&note("self1", false, "specified", "hello", vec![]))
            .is_none());
    }

    #[test]
    fn test_note_scope_remembered_for_reply() {
        let adapter = adapter_with_self("self1", "courier");
        adapter
            .normalize(&note("u1", false, "specified", "hello", vec![]))
            .unwrap();

        let scopes = adapter.shared.note_scopes.lock().unwrap();
        let scope = scopes.get("n1").unwrap();
        assert_eq!(scope.visibility, "specified");
        assert_eq!(scope.author_id, "u1");
    }

    #[test]
    fn test_search_capability_not_advertised() {
        let adapter = adapter_with_self("self1", "courier");
        assert!(!adapter.capabilities().search);
    }
}
