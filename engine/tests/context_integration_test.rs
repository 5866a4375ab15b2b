//! Context assembler integration tests
//!
//! Drives the assembler against a scripted fetcher adapter and the real
//! memory log, asserting the formatted prompt layout and determinism.

use async_trait::async_trait;
use courier_engine::adapter::{
    AdapterCapabilities, ConnectionStatus, EventSink, NormalizedEvent, PlatformAdapter,
    PlatformMessage,
};
use courier_engine::config::ContextConfig;
use courier_engine::context::{estimate_tokens, ContextAssembler};
use courier_engine::memory::{Importance, MemoryLog, Visibility};
use courier_engine::workspace::Workspace;
use sdk::errors::GatewayError;
use std::sync::Arc;
use tempfile::TempDir;

/// Fetcher with scripted history and search results.
struct ScriptedFetcher {
    history: Vec<PlatformMessage>,
    related: Vec<PlatformMessage>,
    search: bool,
}

fn message(id: &str, username: &str, content: &str, is_bot: bool) -> PlatformMessage {
    PlatformMessage {
        message_id: id.to_string(),
        user_id: format!("u-{}", username),
        username: username.to_string(),
        content: content.to_string(),
        timestamp: chrono::Utc::now(),
        is_bot,
    }
}

#[async_trait]
impl PlatformAdapter for ScriptedFetcher {
    fn platform(&self) -> &str {
        "discord"
    }
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            fetch_history: true,
            search: self.search,
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
        _content: &str,
        _reply_to: Option<&str>,
    ) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn fetch_recent(
        &self,
        _channel_id: &str,
        limit: usize,
    ) -> Result<Vec<PlatformMessage>, GatewayError> {
        Ok(self.history.iter().take(limit).cloned().collect())
    }
    async fn search_related(
        &self,
        _guild_id: &str,
        _channel_id: &str,
        _query: &str,
        limit: usize,
    ) -> Result<Vec<PlatformMessage>, GatewayError> {
        Ok(self.related.iter().take(limit).cloned().collect())
    }
    async fn get_username(&self, user_id: &str) -> Result<String, GatewayError> {
        Ok(user_id.trim_start_matches("u-").to_string())
    }
    fn is_self(&self, _user_id: &str) -> bool {
        false
    }
}

fn workspace(temp: &TempDir, is_dm: bool) -> Workspace {
    let path = temp.path().join("ws");
    std::fs::create_dir_all(&path).unwrap();
    Workspace {
        key: "discord/123/456".to_string(),
        path,
        is_dm,
        platform: "discord".to_string(),
        user_id: "123".to_string(),
        channel_id: "456".to_string(),
    }
}

fn trigger_event(guild: &str) -> NormalizedEvent {
    NormalizedEvent {
        platform: "discord".to_string(),
        channel_id: "456".to_string(),
        user_id: "alice".to_string(),
        message_id: "m9".to_string(),
        is_dm: guild.is_empty(),
        guild_id: guild.to_string(),
        content: "what did we decide?".to_string(),
        timestamp: chrono::Utc::now(),
    }
}

fn assembler(memory: Arc<MemoryLog>, token_limit: usize) -> ContextAssembler {
    ContextAssembler::new(
        ContextConfig {
            recent_message_limit: 20,
            memory_max_chars: 500,
            token_limit,
            system_prompt_path: None,
        },
        memory,
    )
}

#[tokio::test]
async fn test_full_assembly_with_memories_history_and_search() {
    let temp = TempDir::new().unwrap();
    let ws = workspace(&temp, false);
    let memory = Arc::new(MemoryLog::new(500));

    memory
        .add(&ws, "Team prefers Rust", Visibility::Public, Importance::High)
        .await
        .unwrap();
    memory
        .add(&ws, "Unimportant detail", Visibility::Public, Importance::Normal)
        .await
        .unwrap();

    let fetcher = ScriptedFetcher {
        history: vec![
            message("m1", "bob", "shall we pick a language?", false),
            message("m2", "courier", "happy to help compare", true),
        ],
        related: vec![message("m3", "carol", "rust was fast in the benchmark", false)],
        search: true,
    };

    let asm = assembler(Arc::clone(&memory), 100_000);
    let context = asm
        .assemble(&trigger_event("guild-1"), &ws, &fetcher)
        .await
        .unwrap();

    // Only high-importance memories make it in.
    assert_eq!(context.important_memories.len(), 1);
    assert_eq!(context.important_memories[0].content, "Team prefers Rust");
    assert_eq!(context.recent_messages.len(), 2);
    assert!(context.related_messages.is_some());
    assert_eq!(context.trigger_message.username, "alice");

    let formatted = asm.format(&context);
    let text = &formatted.user_message;

    assert!(text.contains("## Important Memories\n1. Team prefers Rust"));
    assert!(text.contains("[User] bob: shall we pick a language?"));
    assert!(text.contains("[Bot] courier: happy to help compare"));
    assert!(text.contains("## Related Messages from this Server"));
    assert!(text.contains("[User] carol: rust was fast in the benchmark"));
    assert!(text.contains("## Current Message\nalice: what did we decide?"));
    assert!(text.ends_with("Please respond to the current message above."));
}

#[tokio::test]
async fn test_no_search_outside_guilds() {
    let temp = TempDir::new().unwrap();
    let ws = workspace(&temp, true);
    let memory = Arc::new(MemoryLog::new(500));

    let fetcher = ScriptedFetcher {
        history: vec![message("m1", "bob", "hi", false)],
        related: vec![message("m3", "carol", "should not appear", false)],
        search: true,
    };

    let asm = assembler(memory, 100_000);
    // DM event: guild_id empty, so no related search even though the
    // fetcher supports it.
    let context = asm.assemble(&trigger_event(""), &ws, &fetcher).await.unwrap();
    assert!(context.related_messages.is_none());

    let formatted = asm.format(&context);
    assert!(!formatted
        .user_message
        .contains("## Related Messages from this Server"));
}

#[tokio::test]
async fn test_assembly_is_deterministic_given_same_inputs() {
    let temp = TempDir::new().unwrap();
    let ws = workspace(&temp, false);
    let memory = Arc::new(MemoryLog::new(500));
    memory
        .add(&ws, "stable fact", Visibility::Public, Importance::High)
        .await
        .unwrap();

    let fetcher = ScriptedFetcher {
        history: vec![message("m1", "bob", "hello", false)],
        related: vec![],
        search: false,
    };

    let asm = assembler(Arc::clone(&memory), 100_000);
    let a = asm.assemble(&trigger_event("g"), &ws, &fetcher).await.unwrap();
    let b = asm.assemble(&trigger_event("g"), &ws, &fetcher).await.unwrap();

    let fa = asm.format(&a);
    let fb = asm.format(&b);
    assert_eq!(fa.system_message, fb.system_message);
    assert_eq!(fa.user_message, fb.user_message);
    assert_eq!(fa.estimated_tokens, fb.estimated_tokens);
}

#[tokio::test]
async fn test_token_budget_enforced_end_to_end() {
    let temp = TempDir::new().unwrap();
    let ws = workspace(&temp, true);
    let memory = Arc::new(MemoryLog::new(500));

    let fetcher = ScriptedFetcher {
        history: (0..100)
            .map(|i| message(&format!("m{}", i), "bob", &format!("long message {} {}", i, "x".repeat(80)), false))
            .collect(),
        related: vec![],
        search: false,
    };

    let limit = 200;
    let asm = assembler(memory, limit);
    let context = asm.assemble(&trigger_event(""), &ws, &fetcher).await.unwrap();
    let formatted = asm.format(&context);

    assert!(formatted.estimated_tokens <= limit);
    assert_eq!(
        formatted.estimated_tokens,
        estimate_tokens(&formatted.system_message) + estimate_tokens(&formatted.user_message)
    );
    assert!(formatted.user_message.ends_with("..."));
}
