//! Skill gateway integration tests
//!
//! Boots the real HTTP gateway on an ephemeral loopback port and exercises
//! the full status table: authentication, unknown skills, single-reply
//! conflicts, session expiry, and method handling.

use async_trait::async_trait;
use courier_engine::adapter::{
    AdapterCapabilities, ConnectionStatus, EventSink, NormalizedEvent, PlatformAdapter,
    PlatformMessage,
};
use courier_engine::config::GatewayConfig;
use courier_engine::gateway::SkillGateway;
use courier_engine::memory::MemoryLog;
use courier_engine::session::{SessionRecord, SessionRegistry};
use courier_engine::skills::{ReplyState, SkillRegistry};
use courier_engine::workspace::Workspace;
use sdk::errors::GatewayError;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Adapter that records replies and serves empty history.
struct RecordingAdapter {
    sent: Mutex<Vec<String>>,
}

impl RecordingAdapter {
    fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PlatformAdapter for RecordingAdapter {
    fn platform(&self) -> &str {
        "discord"
    }
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            fetch_history: true,
            search: false,
            dm: true,
            guild: true,
            reactions: true,
            max_message_length: 2000,
        }
    }
    fn connection_status(&self) -> ConnectionStatus {
        ConnectionStatus::Connected
    }
    fn on_event(&self, _sink: EventSink) {}
    async fn connect(&self) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn disconnect(&self) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn send_reply(
        &self,
        _channel_id: &str,
        content: &str,
        _reply_to: Option<&str>,
    ) -> Result<(), GatewayError> {
        // Slow enough that concurrent requests overlap in this await.
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.sent.lock().unwrap().push(content.to_string());
        Ok(())
    }
    async fn fetch_recent(
        &self,
        _channel_id: &str,
        _limit: usize,
    ) -> Result<Vec<PlatformMessage>, GatewayError> {
        Ok(Vec::new())
    }
    async fn get_username(&self, user_id: &str) -> Result<String, GatewayError> {
        Ok(format!("user-{}", user_id))
    }
    fn is_self(&self, _user_id: &str) -> bool {
        false
    }
}

struct Harness {
    _temp: TempDir,
    gateway: SkillGateway,
    sessions: Arc<SessionRegistry>,
    adapter: Arc<RecordingAdapter>,
    workspace: Workspace,
    client: reqwest::Client,
}

impl Harness {
    async fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("discord").join("123").join("456");
        std::fs::create_dir_all(&path).unwrap();
        let workspace = Workspace {
            key: "discord/123/456".to_string(),
            path,
            is_dm: true,
            platform: "discord".to_string(),
            user_id: "123".to_string(),
            channel_id: "456".to_string(),
        };

        let sessions = Arc::new(SessionRegistry::new());
        let skills = Arc::new(SkillRegistry::new(
            Arc::new(MemoryLog::new(500)),
            Arc::clone(&sessions),
            Arc::new(ReplyState::new()),
        ));

        let config = GatewayConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let gateway = SkillGateway::start(&config, Arc::clone(&sessions), skills)
            .await
            .unwrap();

        Self {
            _temp: temp,
            gateway,
            sessions,
            adapter: Arc::new(RecordingAdapter::new()),
            workspace,
            client: reqwest::Client::new(),
        }
    }

    fn register_session(&self, id: &str, timeout_ms: u64) -> String {
        let event = NormalizedEvent {
            platform: "discord".to_string(),
            channel_id: "456".to_string(),
            user_id: "123".to_string(),
            message_id: "m1".to_string(),
            is_dm: true,
            guild_id: String::new(),
            content: "hi".to_string(),
            timestamp: chrono::Utc::now(),
        };
        self.sessions.register(SessionRecord {
            id: id.to_string(),
            platform: "discord".to_string(),
            channel_id: "456".to_string(),
            user_id: "123".to_string(),
            workspace: self.workspace.clone(),
            adapter: self.adapter.clone(),
            trigger_event: event,
            started_at: Instant::now(),
            timeout_ms,
            reply_sent: false,
        })
    }

    fn url(&self, skill: &str) -> String {
        format!("http://{}/api/skill/{}", self.gateway.addr(), skill)
    }

    async fn post(&self, skill: &str, body: Value) -> (u16, Value) {
        let response = self
            .client
            .post(self.url(skill))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap();
        (status, body)
    }
}

#[tokio::test]
async fn test_send_reply_once_then_conflict() {
    let harness = Harness::new().await;
    harness.register_session("sess_one", 60_000);

    let (status, body) = harness
        .post(
            "send-reply",
            json!({"sessionId": "sess_one", "parameters": {"message": "hi"}}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(harness.adapter.sent.lock().unwrap().len(), 1);

    // Second identical call: 409 with the exact body.
    let (status, body) = harness
        .post(
            "send-reply",
            json!({"sessionId": "sess_one", "parameters": {"message": "hi"}}),
        )
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Reply already sent for this session");
    assert_eq!(harness.adapter.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_send_reply_dispatches_exactly_once() {
    let harness = Arc::new(Harness::new().await);
    harness.register_session("sess_race", 60_000);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let harness = Arc::clone(&harness);
        handles.push(tokio::spawn(async move {
            harness
                .post(
                    "send-reply",
                    json!({"sessionId": "sess_race", "parameters": {"message": "hi"}}),
                )
                .await
                .0
        }));
    }

    let mut statuses = Vec::new();
    for handle in handles {
        statuses.push(handle.await.unwrap());
    }

    // Exactly one request wins the single reply; the rest are rejected by
    // whichever layer saw them second (409 from the gateway pre-check, 400
    // from the handler's claim).
    assert_eq!(statuses.iter().filter(|s| **s == 200).count(), 1);
    for status in &statuses {
        assert!(
            matches!(status, 200 | 400 | 409),
            "unexpected status {}",
            status
        );
    }
    assert_eq!(harness.adapter.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_skill_is_404() {
    let harness = Harness::new().await;
    harness.register_session("sess_two", 60_000);

    let (status, body) = harness
        .post(
            "does-not-exist",
            json!({"sessionId": "sess_two", "parameters": {}}),
        )
        .await;
    assert_eq!(status, 404);
    assert!(body["error"].as_str().unwrap().starts_with("Unknown skill"));
}

#[tokio::test]
async fn test_expired_session_is_401() {
    let harness = Harness::new().await;
    harness.register_session("sess_short", 100);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let (status, body) = harness
        .post(
            "send-reply",
            json!({"sessionId": "sess_short", "parameters": {"message": "hi"}}),
        )
        .await;
    assert_eq!(status, 401);
    assert_eq!(body["error"], "Invalid or expired session");
}

#[tokio::test]
async fn test_unknown_session_is_401() {
    let harness = Harness::new().await;
    let (status, body) = harness
        .post(
            "send-reply",
            json!({"sessionId": "sess_never", "parameters": {"message": "hi"}}),
        )
        .await;
    assert_eq!(status, 401);
    assert_eq!(body["error"], "Invalid or expired session");
}

#[tokio::test]
async fn test_missing_session_id_is_400() {
    let harness = Harness::new().await;
    let (status, body) = harness
        .post("send-reply", json!({"parameters": {"message": "hi"}}))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Missing sessionId");
}

#[tokio::test]
async fn test_handler_failure_is_400_with_handler_error() {
    let harness = Harness::new().await;
    harness.register_session("sess_v", 60_000);

    let (status, body) = harness
        .post(
            "memory-save",
            json!({"sessionId": "sess_v", "parameters": {}}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Missing or invalid 'content' parameter");
}

#[tokio::test]
async fn test_memory_skills_through_gateway() {
    let harness = Harness::new().await;
    harness.register_session("sess_mem", 60_000);

    let (status, body) = harness
        .post(
            "memory-save",
            json!({
                "sessionId": "sess_mem",
                "parameters": {"content": "User likes hiking in mountains"}
            }),
        )
        .await;
    assert_eq!(status, 200);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = harness
        .post(
            "memory-search",
            json!({
                "sessionId": "sess_mem",
                "parameters": {"query": "hiking mountains", "limit": 5}
            }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["count"], 1);
    assert_eq!(
        body["data"]["memories"][0]["content"],
        "User likes hiking in mountains"
    );
    assert_eq!(body["data"]["memories"][0]["id"], id);
}

#[tokio::test]
async fn test_method_and_path_handling() {
    let harness = Harness::new().await;

    // GET on the skill route: 405
    let response = harness
        .client
        .get(harness.url("send-reply"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 405);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Method not allowed");

    // OPTIONS preflight: 204 with CORS headers
    let response = harness
        .client
        .request(reqwest::Method::OPTIONS, harness.url("send-reply"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 204);
    assert!(response
        .headers()
        .contains_key("Access-Control-Allow-Origin"));

    // A path outside the skill route: 404 Not found
    let response = harness
        .client
        .post(format!("http://{}/api/other", harness.gateway.addr()))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Not found");
}

#[tokio::test]
async fn test_fetch_context_user_info_through_gateway() {
    let harness = Harness::new().await;
    harness.register_session("sess_info", 60_000);

    let (status, body) = harness
        .post(
            "fetch-context",
            json!({"sessionId": "sess_info", "parameters": {"type": "user_info"}}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["userId"], "123");
    assert_eq!(body["data"]["username"], "user-123");
    assert_eq!(body["data"]["platform"], "discord");
    assert_eq!(body["data"]["isDm"], true);
}

#[tokio::test]
async fn test_search_unsupported_platform_message() {
    let harness = Harness::new().await;
    harness.register_session("sess_srch", 60_000);

    let (status, body) = harness
        .post(
            "fetch-context",
            json!({
                "sessionId": "sess_srch",
                "parameters": {"type": "search_messages", "query": "x"}
            }),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Platform does not support message search");
}
