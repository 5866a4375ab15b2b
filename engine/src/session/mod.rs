//! Session registry
//!
//! Sessions bind one agent invocation to one workspace and one platform
//! event. They are identified by opaque `sess_` tokens handed to the agent
//! subprocess, which presents them back through the skill HTTP gateway.
//!
//! The registry is shared between the orchestrator (which owns the session
//! lifecycle) and the gateway (which authenticates calls and may flip
//! `reply_sent`). All operations are safe from multiple callers;
//! `mark_reply_sent` is an atomic compare-and-set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapter::{NormalizedEvent, PlatformAdapter};
use crate::workspace::Workspace;

/// One live agent session.
#[derive(Clone)]
pub struct SessionRecord {
    /// Opaque session token, `sess_` prefixed
    pub id: String,
    pub platform: String,
    pub channel_id: String,
    pub user_id: String,
    pub workspace: Workspace,
    /// Adapter handle used by skills bound to this session
    pub adapter: Arc<dyn PlatformAdapter>,
    /// The event that started this session
    pub trigger_event: NormalizedEvent,
    pub started_at: Instant,
    pub timeout_ms: u64,
    /// Whether the single allowed reply has been dispatched
    pub reply_sent: bool,
}

impl SessionRecord {
    pub fn is_expired(&self) -> bool {
        self.started_at.elapsed() > Duration::from_millis(self.timeout_ms)
    }
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("channel_id", &self.channel_id)
            .field("reply_sent", &self.reply_sent)
            .finish()
    }
}

/// Tracks live sessions and their single-reply state.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Generate a session id: `sess_` + millisecond timestamp + UUIDv4.
    /// Globally unique with overwhelming probability.
    pub fn generate_id() -> String {
        let millis = chrono::Utc::now().timestamp_millis();
        format!("sess_{:x}{}", millis, Uuid::new_v4().simple())
    }

    /// Register a session, returning its id.
    pub fn register(&self, record: SessionRecord) -> String {
        let id = record.id.clone();
        let mut sessions = self.sessions.lock().expect("session registry lock poisoned");
        sessions.insert(id.clone(), record);
        debug!("Registered session {}", id);
        id
    }

    /// Look up a live session.
    ///
    /// An expired entry is treated as absent and removed eagerly.
    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        let mut sessions = self.sessions.lock().expect("session registry lock poisoned");
        let expired = matches!(sessions.get(id), Some(record) if record.is_expired());
        if expired {
            sessions.remove(id);
            debug!("Session {} expired, removed on access", id);
            return None;
        }
        sessions.get(id).cloned()
    }

    /// Whether a live (non-expired) session exists.
    pub fn has(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Atomically flip `reply_sent` from false to true.
    ///
    /// Returns false when the session is unknown, expired, or the flag was
    /// already set. Two racing callers see exactly one `true`.
    pub fn mark_reply_sent(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("session registry lock poisoned");
        let expired = matches!(sessions.get(id), Some(record) if record.is_expired());
        if expired {
            sessions.remove(id);
            return false;
        }
        match sessions.get_mut(id) {
            Some(record) if !record.reply_sent => {
                record.reply_sent = true;
                true
            }
            _ => false,
        }
    }

    /// Whether the session has already dispatched its reply.
    pub fn has_reply_sent(&self, id: &str) -> bool {
        let sessions = self.sessions.lock().expect("session registry lock poisoned");
        sessions.get(id).map(|r| r.reply_sent).unwrap_or(false)
    }

    /// Roll back a reply claim after a failed dispatch.
    ///
    /// Only the caller that won `mark_reply_sent` may release it, and only
    /// when the platform delivery it guarded did not happen.
    pub fn clear_reply_sent(&self, id: &str) {
        let mut sessions = self.sessions.lock().expect("session registry lock poisoned");
        if let Some(record) = sessions.get_mut(id) {
            record.reply_sent = false;
        }
    }

    /// Remove a session.
    pub fn remove(&self, id: &str) -> Option<SessionRecord> {
        let mut sessions = self.sessions.lock().expect("session registry lock poisoned");
        let removed = sessions.remove(id);
        if removed.is_some() {
            debug!("Removed session {}", id);
        }
        removed
    }

    /// Number of live (possibly expired but unswept) sessions.
    pub fn active_count(&self) -> usize {
        let sessions = self.sessions.lock().expect("session registry lock poisoned");
        sessions.len()
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().expect("session registry lock poisoned");
        let before = sessions.len();
        sessions.retain(|_, record| !record.is_expired());
        before - sessions.len()
    }

    /// Spawn the periodic sweeper task.
    ///
    /// Runs until the returned handle is aborted (daemon shutdown).
    pub fn start_sweeper(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = registry.sweep_expired();
                if removed > 0 {
                    info!("Session sweeper removed {} expired sessions", removed);
                }
            }
        })
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::test_record;
    use super::*;

    #[test]
    fn test_generate_id_prefix_and_uniqueness() {
        let a = SessionRegistry::generate_id();
        let b = SessionRegistry::generate_id();
        assert!(a.starts_with("sess_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_register_get_remove() {
        let registry = SessionRegistry::new();
        let id = registry.register(test_record("sess_x", 60_000));
        assert!(registry.has(&id));
        assert_eq!(registry.active_count(), 1);

        registry.remove(&id);
        assert!(!registry.has(&id));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_mark_reply_sent_is_cas() {
        let registry = SessionRegistry::new();
        let id = registry.register(test_record("sess_x", 60_000));

        assert!(!registry.has_reply_sent(&id));
        assert!(registry.mark_reply_sent(&id));
        assert!(registry.has_reply_sent(&id));
        // Second attempt fails
        assert!(!registry.mark_reply_sent(&id));
    }

    #[test]
    fn test_mark_reply_sent_unknown_session() {
        let registry = SessionRegistry::new();
        assert!(!registry.mark_reply_sent("sess_missing"));
    }

    #[test]
    fn test_clear_reply_sent_reopens_the_claim() {
        let registry = SessionRegistry::new();
        let id = registry.register(test_record("sess_x", 60_000));

        assert!(registry.mark_reply_sent(&id));
        registry.clear_reply_sent(&id);
        assert!(!registry.has_reply_sent(&id));
        assert!(registry.mark_reply_sent(&id));
    }

    #[tokio::test]
    async fn test_expired_session_treated_as_absent() {
        let registry = SessionRegistry::new();
        let id = registry.register(test_record("sess_x", 10));

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(registry.get(&id).is_none());
        // Eagerly removed on access
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let registry = SessionRegistry::new();
        registry.register(test_record("sess_short", 10));
        registry.register(test_record("sess_long", 60_000));

        tokio::time::sleep(Duration::from_millis(30)).await;

        let removed = registry.sweep_expired();
        assert_eq!(removed, 1);
        assert!(registry.has("sess_long"));
        assert!(!registry.has("sess_short"));
    }

    #[test]
    fn test_concurrent_mark_reply_sent_single_winner() {
        let registry = Arc::new(SessionRegistry::new());
        let id = registry.register(test_record("sess_race", 60_000));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            handles.push(std::thread::spawn(move || registry.mark_reply_sent(&id)));
        }

        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }
}
