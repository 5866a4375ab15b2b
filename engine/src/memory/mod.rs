//! Append-only memory log
//!
//! Each workspace carries its long-term memory as line-delimited JSON in
//! `memory.public.jsonl` and, for DM workspaces only, `memory.private.jsonl`.
//! Files are never rewritten: memories are appended once and later patch
//! events toggle their metadata. The effective state of a memory is the fold
//! of its original event and every subsequent patch in `ts` order.
//!
//! # Storage contract
//!
//! - One JSON object per line, UTF-8, LF endings.
//! - Appends are serialized per workspace through an in-process lock map, so
//!   a line is fully written before any subsequent line begins.
//! - Unreadable lines are skipped with a warning counter, never fatal.
//! - `memory.private.jsonl` must not be created for a non-DM workspace.

use chrono::{SecondsFormat, Utc};
use sdk::errors::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::workspace::Workspace;

/// File name for public memories.
pub const PUBLIC_FILE: &str = "memory.public.jsonl";

/// File name for private memories (DM workspaces only).
pub const PRIVATE_FILE: &str = "memory.private.jsonl";

/// Who may see a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

/// How strongly a memory is surfaced during context assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    High,
    Normal,
}

/// A memory creation event as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub ts: String,
    pub enabled: bool,
    pub visibility: Visibility,
    pub importance: Importance,
    pub content: String,
}

/// Metadata changes a patch may carry. `content`, `id` and `ts` are
/// immutable and can never appear here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance: Option<Importance>,
}

impl PatchChanges {
    pub fn is_empty(&self) -> bool {
        self.enabled.is_none() && self.visibility.is_none() && self.importance.is_none()
    }
}

/// A patch event as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub target_id: String,
    pub ts: String,
    pub changes: PatchChanges,
}

/// Either record kind, used when scanning a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum LogRecord {
    Memory(MemoryEventBody),
    Patch(PatchEventBody),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemoryEventBody {
    id: String,
    ts: String,
    enabled: bool,
    visibility: Visibility,
    importance: Importance,
    content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PatchEventBody {
    target_id: String,
    ts: String,
    changes: PatchChanges,
}

/// Effective state of a memory after folding its patches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedMemory {
    pub id: String,
    pub ts: String,
    pub enabled: bool,
    pub visibility: Visibility,
    pub importance: Importance,
    pub content: String,
}

/// Outcome of scanning one memory file.
#[derive(Debug, Default)]
struct ScanResult {
    resolved: Vec<ResolvedMemory>,
    skipped_lines: usize,
}

/// Append-only memory log over per-workspace JSONL files.
pub struct MemoryLog {
    /// Per-workspace-key append locks; appends within one workspace are
    /// serialized, different workspaces proceed independently.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,

    /// Per-result content cap applied to search results.
    max_chars: usize,
}

impl MemoryLog {
    pub fn new(max_chars: usize) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            max_chars,
        }
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Append a new memory event.
    ///
    /// Saving with `Visibility::Private` requires a DM workspace; the
    /// private file must never exist for a non-DM workspace.
    pub async fn add(
        &self,
        workspace: &Workspace,
        content: &str,
        visibility: Visibility,
        importance: Importance,
    ) -> Result<MemoryEvent, GatewayError> {
        if visibility == Visibility::Private && !workspace.is_dm {
            return Err(GatewayError::VisibilityScope(
                "private memories require a DM workspace".to_string(),
            ));
        }

        let event = MemoryEvent {
            kind: "memory".to_string(),
            id: generate_memory_id(),
            ts: now_ts(),
            enabled: true,
            visibility,
            importance,
            content: content.to_string(),
        };

        let file = self.file_for(workspace, visibility);
        let line = serde_json::to_string(&event)
            .map_err(|e| GatewayError::Memory(format!("serialize memory event: {}", e)))?;
        self.append_line(&workspace.key, &file, &line).await?;

        debug!("Appended memory {} to {:?}", event.id, file.file_name());
        Ok(event)
    }

    /// Append a patch event targeting an existing memory.
    ///
    /// The patch is persisted to the file that holds the target memory; if
    /// the target is unknown the patch goes to the public file and simply has
    /// no effect on resolution.
    pub async fn patch(
        &self,
        workspace: &Workspace,
        target_id: &str,
        changes: PatchChanges,
    ) -> Result<PatchEvent, GatewayError> {
        if changes.is_empty() {
            return Err(GatewayError::Memory(
                "patch must change at least one field".to_string(),
            ));
        }

        let event = PatchEvent {
            kind: "patch".to_string(),
            target_id: target_id.to_string(),
            ts: now_ts(),
            changes,
        };

        // Locate the file containing the target so the patch folds against it.
        let mut file = self.file_for(workspace, Visibility::Public);
        if workspace.is_dm {
            let private = self.file_for(workspace, Visibility::Private);
            if private.exists() {
                let scan = self.scan_file(&private).await?;
                if scan.resolved.iter().any(|m| m.id == target_id) {
                    file = private;
                }
            }
        }

        let line = serde_json::to_string(&event)
            .map_err(|e| GatewayError::Memory(format!("serialize patch event: {}", e)))?;
        self.append_line(&workspace.key, &file, &line).await?;

        debug!("Appended patch for {} to {:?}", target_id, file.file_name());
        Ok(event)
    }

    /// All enabled, high-importance memories, ascending by `ts`.
    pub async fn important(
        &self,
        workspace: &Workspace,
    ) -> Result<Vec<ResolvedMemory>, GatewayError> {
        let mut memories = self.resolve_all(workspace).await?;
        memories.retain(|m| m.enabled && m.importance == Importance::High);
        memories.sort_by(|a, b| a.ts.cmp(&b.ts));
        Ok(memories)
    }

    /// Case-insensitive substring search; the query is split on whitespace
    /// and every term must appear in the content. Results are ordered by
    /// `ts` descending and capped at `limit`; per-result content is capped
    /// at the configured maximum.
    pub async fn search(
        &self,
        workspace: &Workspace,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ResolvedMemory>, GatewayError> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();

        let mut memories = self.resolve_all(workspace).await?;
        memories.retain(|m| {
            let content = m.content.to_lowercase();
            terms.iter().all(|t| content.contains(t))
        });
        memories.sort_by(|a, b| b.ts.cmp(&a.ts));
        memories.truncate(limit);

        for m in &mut memories {
            if m.content.chars().count() > self.max_chars {
                m.content = m.content.chars().take(self.max_chars).collect();
            }
        }

        Ok(memories)
    }

    /// Resolve every memory visible to this workspace.
    ///
    /// Private memories are only read for DM workspaces.
    pub async fn resolve_all(
        &self,
        workspace: &Workspace,
    ) -> Result<Vec<ResolvedMemory>, GatewayError> {
        let mut result = Vec::new();
        let mut skipped = 0usize;

        let public = self.file_for(workspace, Visibility::Public);
        if public.exists() {
            let scan = self.scan_file(&public).await?;
            skipped += scan.skipped_lines;
            result.extend(scan.resolved);
        }

        if workspace.is_dm {
            let private = self.file_for(workspace, Visibility::Private);
            if private.exists() {
                let scan = self.scan_file(&private).await?;
                skipped += scan.skipped_lines;
                result.extend(scan.resolved);
            }
        }

        if skipped > 0 {
            warn!(
                "Skipped {} unreadable memory lines in workspace {}",
                skipped, workspace.key
            );
        }

        Ok(result)
    }

    fn file_for(&self, workspace: &Workspace, visibility: Visibility) -> PathBuf {
        match visibility {
            Visibility::Public => workspace.path.join(PUBLIC_FILE),
            Visibility::Private => workspace.path.join(PRIVATE_FILE),
        }
    }

    /// Append one line atomically with respect to other appends in the same
    /// workspace.
    async fn append_line(
        &self,
        workspace_key: &str,
        file: &PathBuf,
        line: &str,
    ) -> Result<(), GatewayError> {
        let lock = self.lock_for(workspace_key).await;
        let _guard = lock.lock().await;

        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
            .await
            .map_err(|e| GatewayError::Memory(format!("open {:?}: {}", file, e)))?;

        handle
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| GatewayError::Memory(format!("append to {:?}: {}", file, e)))?;
        handle
            .flush()
            .await
            .map_err(|e| GatewayError::Memory(format!("flush {:?}: {}", file, e)))?;

        Ok(())
    }

    /// Single-pass scan folding memory and patch events into resolved state.
    ///
    /// Patches to unknown ids are dropped from the resolved view. Patches are
    /// applied in `ts` order regardless of file position.
    async fn scan_file(&self, file: &PathBuf) -> Result<ScanResult, GatewayError> {
        let raw = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| GatewayError::Memory(format!("read {:?}: {}", file, e)))?;

        let mut memories: HashMap<String, ResolvedMemory> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut patches: Vec<PatchEventBody> = Vec::new();
        let mut skipped = 0usize;

        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(line) {
                Ok(LogRecord::Memory(m)) => {
                    if !memories.contains_key(&m.id) {
                        order.push(m.id.clone());
                    }
                    memories.insert(
                        m.id.clone(),
                        ResolvedMemory {
                            id: m.id,
                            ts: m.ts,
                            enabled: m.enabled,
                            visibility: m.visibility,
                            importance: m.importance,
                            content: m.content,
                        },
                    );
                }
                Ok(LogRecord::Patch(p)) => patches.push(p),
                Err(_) => skipped += 1,
            }
        }

        patches.sort_by(|a, b| a.ts.cmp(&b.ts));
        for patch in patches {
            if let Some(memory) = memories.get_mut(&patch.target_id) {
                if let Some(enabled) = patch.changes.enabled {
                    memory.enabled = enabled;
                }
                if let Some(visibility) = patch.changes.visibility {
                    memory.visibility = visibility;
                }
                if let Some(importance) = patch.changes.importance {
                    memory.importance = importance;
                }
            }
            // Unknown target: persisted but ignored during resolution.
        }

        let resolved = order
            .into_iter()
            .filter_map(|id| memories.remove(&id))
            .collect();

        Ok(ScanResult {
            resolved,
            skipped_lines: skipped,
        })
    }
}

/// ISO-8601 timestamp with millisecond precision.
fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Locally unique, roughly monotonic memory id: millisecond timestamp plus
/// a short random suffix.
fn generate_memory_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", millis, &suffix[..8])
}

/// Convert a resolved memory into a JSON value for skill results.
pub fn memory_to_value(memory: &ResolvedMemory) -> Value {
    serde_json::json!({
        "id": memory.id,
        "ts": memory.ts,
        "enabled": memory.enabled,
        "visibility": memory.visibility,
        "importance": memory.importance,
        "content": memory.content,
    })
}
