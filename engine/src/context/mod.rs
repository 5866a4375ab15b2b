//! Context assembly
//!
//! Builds the prompt context for one incoming event: the system prompt,
//! enabled high-importance memories, recent channel history, optionally
//! guild-related messages, and a synthetic trigger message. The output is a
//! pure function of its inputs so identical state always produces identical
//! prompts.

use chrono::{DateTime, Utc};
use sdk::errors::GatewayError;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::adapter::{NormalizedEvent, PlatformAdapter, PlatformMessage};
use crate::config::ContextConfig;
use crate::memory::{MemoryLog, ResolvedMemory};
use crate::workspace::Workspace;

/// Cap on guild-related messages pulled into the prompt.
const RELATED_MESSAGE_LIMIT: usize = 10;

/// Default system prompt used when no prompt file is configured.
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful conversational assistant. \
Answer the user's current message using the provided memories and conversation \
history. Keep replies concise and conversational.";

/// Synthetic trigger message built from the incoming event.
#[derive(Debug, Clone)]
pub struct TriggerMessage {
    pub username: String,
    pub content: String,
}

/// Everything the orchestrator needs to build a prompt.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub system_prompt: String,
    pub important_memories: Vec<ResolvedMemory>,
    pub recent_messages: Vec<PlatformMessage>,
    pub related_messages: Option<Vec<PlatformMessage>>,
    pub trigger_message: TriggerMessage,
    pub estimated_tokens: usize,
    pub assembled_at: DateTime<Utc>,
}

/// Final prompt strings after formatting and budget enforcement.
#[derive(Debug, Clone)]
pub struct FormattedContext {
    pub system_message: String,
    pub user_message: String,
    pub estimated_tokens: usize,
}

/// Assembles prompt context from memories and platform history.
pub struct ContextAssembler {
    config: ContextConfig,
    memory: Arc<MemoryLog>,
    /// Cached system prompt text; `None` until first load or after
    /// invalidation.
    system_prompt: RwLock<Option<String>>,
}

impl ContextAssembler {
    pub fn new(config: ContextConfig, memory: Arc<MemoryLog>) -> Self {
        Self {
            config,
            memory,
            system_prompt: RwLock::new(None),
        }
    }

    /// Drop the cached system prompt so the next assembly re-reads it.
    pub async fn invalidate_system_prompt(&self) {
        *self.system_prompt.write().await = None;
    }

    /// Load the system prompt, caching the file contents.
    async fn system_prompt(&self) -> String {
        if let Some(cached) = self.system_prompt.read().await.clone() {
            return cached;
        }

        let text = match &self.config.system_prompt_path {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(text) => text.trim_end().to_string(),
                Err(e) => {
                    warn!("Failed to read system prompt {:?}: {}", path, e);
                    DEFAULT_SYSTEM_PROMPT.to_string()
                }
            },
            None => DEFAULT_SYSTEM_PROMPT.to_string(),
        };

        *self.system_prompt.write().await = Some(text.clone());
        text
    }

    /// Assemble context for one event.
    ///
    /// History comes from the fetcher (the platform adapter); memories from
    /// the workspace memory log; related messages only when the event is in
    /// a guild and the fetcher advertises search.
    pub async fn assemble(
        &self,
        event: &NormalizedEvent,
        workspace: &Workspace,
        fetcher: &dyn PlatformAdapter,
    ) -> Result<AssembledContext, GatewayError> {
        let system_prompt = self.system_prompt().await;

        let important_memories = self.memory.important(workspace).await?;

        let recent_messages = match fetcher
            .fetch_recent(&event.channel_id, self.config.recent_message_limit)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Failed to fetch recent messages: {}", e);
                Vec::new()
            }
        };

        let related_messages = if !event.guild_id.is_empty() && fetcher.capabilities().search {
            match fetcher
                .search_related(
                    &event.guild_id,
                    &event.channel_id,
                    &event.content,
                    RELATED_MESSAGE_LIMIT,
                )
                .await
            {
                Ok(messages) if !messages.is_empty() => Some(messages),
                Ok(_) => None,
                Err(e) => {
                    debug!("Related message search failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let username = fetcher
            .get_username(&event.user_id)
            .await
            .unwrap_or_else(|_| event.user_id.clone());

        let trigger_message = TriggerMessage {
            username,
            content: event.content.clone(),
        };

        let mut context = AssembledContext {
            system_prompt,
            important_memories,
            recent_messages,
            related_messages,
            trigger_message,
            estimated_tokens: 0,
            assembled_at: Utc::now(),
        };

        let formatted = self.format(&context);
        context.estimated_tokens = formatted.estimated_tokens;

        Ok(context)
    }

    /// Compose the final system and user messages.
    ///
    /// Section order and headings are fixed for reproducibility. When the
    /// total estimate exceeds the token limit, the user message is truncated
    /// from the end (binary search on character length) so that
    /// `system + user <= token_limit`.
    pub fn format(&self, context: &AssembledContext) -> FormattedContext {
        let mut sections: Vec<String> = Vec::new();

        if !context.important_memories.is_empty() {
            let mut section = String::from("## Important Memories\n");
            for (i, memory) in context.important_memories.iter().enumerate() {
                section.push_str(&format!("{}. {}\n", i + 1, memory.content));
            }
            sections.push(section.trim_end().to_string());
        }

        let mut recent = String::from("## Recent Conversation\n");
        for message in &context.recent_messages {
            recent.push_str(&format_history_line(message));
        }
        sections.push(recent.trim_end().to_string());

        if let Some(related) = &context.related_messages {
            if !related.is_empty() {
                let mut section = String::from("## Related Messages from this Server\n");
                for message in related {
                    section.push_str(&format_history_line(message));
                }
                sections.push(section.trim_end().to_string());
            }
        }

        sections.push(format!(
            "## Current Message\n{}: {}\nPlease respond to the current message above.",
            context.trigger_message.username, context.trigger_message.content
        ));

        let mut user_message = sections.join("\n\n");
        let system_message = context.system_prompt.clone();

        let system_tokens = estimate_tokens(&system_message);
        let mut total = system_tokens + estimate_tokens(&user_message);

        if total > self.config.token_limit {
            let budget = self.config.token_limit.saturating_sub(system_tokens);
            user_message = truncate_to_budget(&user_message, budget);
            total = system_tokens + estimate_tokens(&user_message);
        }

        FormattedContext {
            system_message,
            user_message,
            estimated_tokens: total,
        }
    }
}

fn format_history_line(message: &PlatformMessage) -> String {
    let marker = if message.is_bot { "[Bot]" } else { "[User]" };
    format!("{} {}: {}\n", marker, message.username, message.content)
}

/// Deterministic, cheap token estimate.
///
/// Per codepoint: CJK ranges (U+3040–U+30FF, U+4E00–U+9FFF, U+AC00–U+D7AF)
/// count 1, other non-ASCII 0.5, ASCII 0.25; the total is multiplied by 1.10
/// and rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    let mut total = 0.0f64;
    for ch in text.chars() {
        let cp = ch as u32;
        total += if (0x3040..=0x30FF).contains(&cp)
            || (0x4E00..=0x9FFF).contains(&cp)
            || (0xAC00..=0xD7AF).contains(&cp)
        {
            1.0
        } else if cp > 0x7F {
            0.5
        } else {
            0.25
        };
    }
    (total * 1.10).ceil() as usize
}

/// Truncate text from the end with an ellipsis so its estimate fits the
/// budget. Binary search on character length.
fn truncate_to_budget(text: &str, budget: usize) -> String {
    if estimate_tokens(text) <= budget {
        return text.to_string();
    }

    let chars: Vec<char> = text.chars().collect();
    let mut low = 0usize;
    let mut high = chars.len();

    while low < high {
        let mid = (low + high).div_ceil(2);
        let candidate: String = chars[..mid].iter().collect::<String>() + "...";
        if estimate_tokens(&candidate) <= budget {
            low = mid;
        } else {
            high = mid - 1;
        }
    }

    if low == 0 {
        return String::new();
    }
    chars[..low].iter().collect::<String>() + "..."
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Importance, Visibility};

    fn memory(content: &str, ts: &str) -> ResolvedMemory {
        ResolvedMemory {
            id: format!("id-{}", ts),
            ts: ts.to_string(),
            enabled: true,
            visibility: Visibility::Public,
            importance: Importance::High,
            content: content.to_string(),
        }
    }

    fn message(username: &str, content: &str, is_bot: bool) -> PlatformMessage {
        PlatformMessage {
            message_id: "m".to_string(),
            user_id: "u".to_string(),
            username: username.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            is_bot,
        }
    }

    fn assembler(token_limit: usize) -> ContextAssembler {
        let config = ContextConfig {
            recent_message_limit: 20,
            memory_max_chars: 500,
            token_limit,
            system_prompt_path: None,
        };
        ContextAssembler::new(config, Arc::new(MemoryLog::new(500)))
    }

    fn context(
        memories: Vec<ResolvedMemory>,
        recent: Vec<PlatformMessage>,
        related: Option<Vec<PlatformMessage>>,
    ) -> AssembledContext {
        AssembledContext {
            system_prompt: "System prompt.".to_string(),
            important_memories: memories,
            recent_messages: recent,
            related_messages: related,
            trigger_message: TriggerMessage {
                username: "alice".to_string(),
                content: "what's up?".to_string(),
            },
            estimated_tokens: 0,
            assembled_at: Utc::now(),
        }
    }

    #[test]
    fn test_estimate_tokens_ascii() {
        // 40 ASCII chars -> ceil(40 * 0.25 * 1.10); the 1.10 factor is not
        // exactly representable, so the product lands just above 11
        assert_eq!(estimate_tokens(&"a".repeat(40)), 12);
        // 4 ASCII chars -> ceil(1.1) = 2
        assert_eq!(estimate_tokens("abcd"), 2);
    }

    #[test]
    fn test_estimate_tokens_cjk() {
        // 10 kanji -> ceil(10 * 1.0 * 1.10)
        assert_eq!(estimate_tokens(&"語".repeat(10)), 12);
        // hiragana and hangul also count as 1
        assert_eq!(estimate_tokens("あ"), 2); // ceil(1.1)
        assert_eq!(estimate_tokens("한"), 2);
    }

    #[test]
    fn test_estimate_tokens_other_non_ascii() {
        // é is non-ASCII, non-CJK -> 0.5 * 1.10 = 0.55 -> 1
        assert_eq!(estimate_tokens("é"), 1);
    }

    #[test]
    fn test_estimate_tokens_empty() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_format_section_order_and_headings() {
        let asm = assembler(100_000);
        let ctx = context(
            vec![memory("likes tea", "2024-01-01T00:00:00Z")],
            vec![message("bob", "hi", false), message("bot", "hello", true)],
            Some(vec![message("carol", "related", false)]),
        );

        let formatted = asm.format(&ctx);
        let text = &formatted.user_message;

        let memories_pos = text.find("## Important Memories").unwrap();
        let recent_pos = text.find("## Recent Conversation").unwrap();
        let related_pos = text.find("## Related Messages from this Server").unwrap();
        let current_pos = text.find("## Current Message").unwrap();

        assert!(memories_pos < recent_pos);
        assert!(recent_pos < related_pos);
        assert!(related_pos < current_pos);

        assert!(text.contains("1. likes tea"));
        assert!(text.contains("[User] bob: hi"));
        assert!(text.contains("[Bot] bot: hello"));
        assert!(text.contains("alice: what's up?"));
        assert!(text.ends_with("Please respond to the current message above."));
    }

    #[test]
    fn test_format_omits_empty_sections() {
        let asm = assembler(100_000);
        let ctx = context(vec![], vec![message("bob", "hi", false)], None);

        let formatted = asm.format(&ctx);
        assert!(!formatted.user_message.contains("## Important Memories"));
        assert!(!formatted
            .user_message
            .contains("## Related Messages from this Server"));
        assert!(formatted.user_message.contains("## Recent Conversation"));
    }

    #[test]
    fn test_format_is_deterministic() {
        let asm = assembler(100_000);
        let ctx = context(
            vec![memory("likes tea", "2024-01-01T00:00:00Z")],
            vec![message("bob", "hi", false)],
            None,
        );

        let a = asm.format(&ctx);
        let b = asm.format(&ctx);
        assert_eq!(a.user_message, b.user_message);
        assert_eq!(a.estimated_tokens, b.estimated_tokens);
    }

    #[test]
    fn test_token_limit_truncates_user_message() {
        let asm = assembler(60);
        let long_history: Vec<PlatformMessage> = (0..50)
            .map(|i| message("bob", &format!("message number {} with some padding", i), false))
            .collect();
        let ctx = context(vec![], long_history, None);

        let formatted = asm.format(&ctx);
        assert!(formatted.estimated_tokens <= 60);
        assert!(formatted.user_message.ends_with("..."));
    }

    #[test]
    fn test_truncate_to_budget_noop_when_within() {
        assert_eq!(truncate_to_budget("short", 100), "short");
    }

    #[test]
    fn test_truncate_to_budget_monotone() {
        let text = "a".repeat(1000);
        let small = truncate_to_budget(&text, 20);
        let large = truncate_to_budget(&text, 50);
        assert!(estimate_tokens(&small) <= 20);
        assert!(estimate_tokens(&large) <= 50);
        assert!(small.len() <= large.len());
    }
}
