//! fetch-context skill
//!
//! Lets the agent pull additional conversation context mid-prompt: recent
//! channel messages, a guild-wide message search, or basic user info.

use sdk::types::SkillResult;
use serde_json::{json, Value};

use super::SkillContext;
use crate::adapter::PlatformMessage;

/// Default message count for recent_messages and search_messages.
const DEFAULT_LIMIT: usize = 20;

fn message_to_value(message: &PlatformMessage) -> Value {
    json!({
        "messageId": message.message_id,
        "userId": message.user_id,
        "username": message.username,
        "content": message.content,
        "timestamp": message.timestamp.to_rfc3339(),
        "isBot": message.is_bot,
    })
}

fn parse_limit(params: &Value) -> Result<usize, SkillResult> {
    match params.get("limit") {
        None | Some(Value::Null) => Ok(DEFAULT_LIMIT),
        Some(value) => match value.as_u64() {
            Some(n) if n > 0 => Ok(n as usize),
            _ => Err(SkillResult::fail(
                "Invalid 'limit' parameter. Must be a positive number",
            )),
        },
    }
}

/// fetch-context: dispatch on the `type` parameter.
pub async fn fetch_context(params: &Value, ctx: &SkillContext) -> SkillResult {
    let kind = match params.get("type").and_then(|v| v.as_str()) {
        Some(s) => s,
        None => return SkillResult::fail("Missing or invalid 'type' parameter"),
    };

    match kind {
        "recent_messages" => recent_messages(params, ctx).await,
        "search_messages" => search_messages(params, ctx).await,
        "user_info" => user_info(ctx).await,
        _ => SkillResult::fail(
            "Invalid 'type' parameter. Must be one of: recent_messages, search_messages, user_info",
        ),
    }
}

async fn recent_messages(params: &Value, ctx: &SkillContext) -> SkillResult {
    let limit = match parse_limit(params) {
        Ok(n) => n,
        Err(fail) => return fail,
    };

    let session = &ctx.session;
    match session.adapter.fetch_recent(&session.channel_id, limit).await {
        Ok(messages) => {
            let values: Vec<Value> = messages.iter().map(message_to_value).collect();
            SkillResult::ok(json!({ "messages": values, "count": values.len() }))
        }
        Err(e) => SkillResult::fail(e.to_string()),
    }
}

async fn search_messages(params: &Value, ctx: &SkillContext) -> SkillResult {
    let query = match params.get("query").and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => s,
        _ => {
            return SkillResult::fail(
                "Missing or invalid 'query' parameter for search_messages type",
            )
        }
    };

    let limit = match parse_limit(params) {
        Ok(n) => n,
        Err(fail) => return fail,
    };

    let session = &ctx.session;
    if !session.adapter.capabilities().search {
        return SkillResult::fail("Platform does not support message search");
    }

    match session
        .adapter
        .search_related(&session.trigger_event.guild_id, &session.channel_id, query, limit)
        .await
    {
        Ok(messages) => {
            let values: Vec<Value> = messages.iter().map(message_to_value).collect();
            SkillResult::ok(json!({ "messages": values, "count": values.len() }))
        }
        Err(e) => SkillResult::fail(e.to_string()),
    }
}

async fn user_info(ctx: &SkillContext) -> SkillResult {
    let session = &ctx.session;
    let username = match session.adapter.get_username(&session.user_id).await {
        Ok(name) => name,
        Err(e) => return SkillResult::fail(e.to_string()),
    };

    SkillResult::ok(json!({
        "userId": session.user_id,
        "username": username,
        "platform": session.platform,
        "isDm": session.workspace.is_dm,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::test_record;

    fn ctx() -> SkillContext {
        SkillContext {
            session: test_record("sess_c", 60_000),
        }
    }

    #[tokio::test]
    async fn test_missing_type_rejected() {
        let result = fetch_context(&json!({}), &ctx()).await;
        assert_eq!(result.error.unwrap(), "Missing or invalid 'type' parameter");
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let result = fetch_context(&json!({"type": "weather"}), &ctx()).await;
        assert_eq!(
            result.error.unwrap(),
            "Invalid 'type' parameter. Must be one of: recent_messages, search_messages, user_info"
        );
    }

    #[tokio::test]
    async fn test_recent_messages_ok() {
        let result = fetch_context(&json!({"type": "recent_messages"}), &ctx()).await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["count"], 0);
    }

    #[tokio::test]
    async fn test_recent_messages_invalid_limit() {
        let result =
            fetch_context(&json!({"type": "recent_messages", "limit": -1}), &ctx()).await;
        assert_eq!(
            result.error.unwrap(),
            "Invalid 'limit' parameter. Must be a positive number"
        );
    }

    #[tokio::test]
    async fn test_search_requires_query() {
        let result = fetch_context(&json!({"type": "search_messages"}), &ctx()).await;
        assert_eq!(
            result.error.unwrap(),
            "Missing or invalid 'query' parameter for search_messages type"
        );
    }

    #[tokio::test]
    async fn test_search_unsupported_platform() {
        // NullAdapter advertises search = false
        let result =
            fetch_context(&json!({"type": "search_messages", "query": "x"}), &ctx()).await;
        assert_eq!(
            result.error.unwrap(),
            "Platform does not support message search"
        );
    }

    #[tokio::test]
    async fn test_user_info_shape() {
        let result = fetch_context(&json!({"type": "user_info"}), &ctx()).await;
        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["userId"], "u");
        assert_eq!(data["username"], "u");
        assert_eq!(data["platform"], "test");
        assert_eq!(data["isDm"], true);
    }
}
