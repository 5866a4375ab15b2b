//! Memory skills: memory-save, memory-search, memory-patch
//!
//! Validation messages are part of the external contract and must stay
//! byte-identical; downstream tooling parses them.

use sdk::types::SkillResult;
use serde_json::{json, Value};

use super::SkillContext;
use crate::memory::{
    memory_to_value, Importance, MemoryLog, PatchChanges, Visibility,
};

/// Default result count for memory-search.
const DEFAULT_SEARCH_LIMIT: usize = 10;

fn parse_visibility(value: &Value) -> Result<Visibility, SkillResult> {
    match value.as_str() {
        Some("public") => Ok(Visibility::Public),
        Some("private") => Ok(Visibility::Private),
        _ => Err(SkillResult::fail(
            "Invalid 'visibility' parameter. Must be 'public' or 'private'",
        )),
    }
}

fn parse_importance(value: &Value) -> Result<Importance, SkillResult> {
    match value.as_str() {
        Some("high") => Ok(Importance::High),
        Some("normal") => Ok(Importance::Normal),
        _ => Err(SkillResult::fail(
            "Invalid 'importance' parameter. Must be 'high' or 'normal'",
        )),
    }
}

/// Positive-integer limit with a default; anything else is rejected.
fn parse_limit(params: &Value, default: usize) -> Result<usize, SkillResult> {
    match params.get("limit") {
        None | Some(Value::Null) => Ok(default),
        Some(value) => match value.as_u64() {
            Some(n) if n > 0 => Ok(n as usize),
            _ => Err(SkillResult::fail(
                "Invalid 'limit' parameter. Must be a positive number",
            )),
        },
    }
}

/// memory-save: append one memory event.
pub async fn save(log: &MemoryLog, params: &Value, ctx: &SkillContext) -> SkillResult {
    let content = match params.get("content").and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => s,
        _ => return SkillResult::fail("Missing or invalid 'content' parameter"),
    };

    let visibility = match params.get("visibility") {
        None | Some(Value::Null) => Visibility::Public,
        Some(value) => match parse_visibility(value) {
            Ok(v) => v,
            Err(fail) => return fail,
        },
    };

    let importance = match params.get("importance") {
        None | Some(Value::Null) => Importance::Normal,
        Some(value) => match parse_importance(value) {
            Ok(v) => v,
            Err(fail) => return fail,
        },
    };

    if visibility == Visibility::Private && !ctx.session.workspace.is_dm {
        return SkillResult::fail("Private memories can only be saved in DM contexts");
    }

    match log
        .add(&ctx.session.workspace, content, visibility, importance)
        .await
    {
        Ok(event) => SkillResult::ok(json!({
            "id": event.id,
            "ts": event.ts,
            "enabled": event.enabled,
            "visibility": event.visibility,
            "importance": event.importance,
            "content": event.content,
        })),
        Err(e) => SkillResult::fail(e.to_string()),
    }
}

/// memory-search: resolve and filter memories by substring terms.
pub async fn search(log: &MemoryLog, params: &Value, ctx: &SkillContext) -> SkillResult {
    let query = match params.get("query").and_then(|v| v.as_str()) {
        Some(s) => s,
        None => return SkillResult::fail("Missing or invalid 'query' parameter"),
    };

    let limit = match parse_limit(params, DEFAULT_SEARCH_LIMIT) {
        Ok(n) => n,
        Err(fail) => return fail,
    };

    match log.search(&ctx.session.workspace, query, limit).await {
        Ok(memories) => {
            let values: Vec<Value> = memories.iter().map(memory_to_value).collect();
            SkillResult::ok(json!({ "memories": values, "count": values.len() }))
        }
        Err(e) => SkillResult::fail(e.to_string()),
    }
}

/// memory-patch: append one patch event toggling memory metadata.
pub async fn patch(log: &MemoryLog, params: &Value, ctx: &SkillContext) -> SkillResult {
    let memory_id = match params.get("memory_id").and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => s,
        _ => return SkillResult::fail("Missing or invalid 'memory_id' parameter"),
    };

    let mut changes = PatchChanges::default();

    if let Some(value) = params.get("enabled") {
        if !value.is_null() {
            match value.as_bool() {
                Some(b) => changes.enabled = Some(b),
                None => {
                    return SkillResult::fail("Invalid 'enabled' parameter. Must be a boolean")
                }
            }
        }
    }

    if let Some(value) = params.get("visibility") {
        if !value.is_null() {
            match parse_visibility(value) {
                Ok(v) => changes.visibility = Some(v),
                Err(fail) => return fail,
            }
        }
    }

    if let Some(value) = params.get("importance") {
        if !value.is_null() {
            match parse_importance(value) {
                Ok(v) => changes.importance = Some(v),
                Err(fail) => return fail,
            }
        }
    }

    if changes.is_empty() {
        return SkillResult::fail(
            "At least one of 'enabled', 'visibility', or 'importance' must be provided",
        );
    }

    match log.patch(&ctx.session.workspace, memory_id, changes).await {
        Ok(event) => SkillResult::ok(json!({
            "target_id": event.target_id,
            "ts": event.ts,
            "changes": event.changes,
        })),
        Err(e) => SkillResult::fail(e.to_string()),
    }
}
