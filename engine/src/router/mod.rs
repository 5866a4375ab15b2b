//! Event routing and duplicate suppression
//!
//! The router sits between the platform adapters and the orchestrator. It
//! keeps an in-process set of active `{platform}:{message_id}` keys so a
//! second concurrent dispatch of the same message is rejected without side
//! effects, and supports simple predicate-based routes ahead of the default
//! orchestrator route.

use sdk::errors::GatewayError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::adapter::NormalizedEvent;

/// Predicates a route can match on.
#[derive(Debug, Clone)]
pub enum RoutePredicate {
    /// Match direct messages (true) or guild messages (false)
    IsDm(bool),
    /// Match a platform by name
    Platform(String),
    /// Match events whose content contains a keyword (case-insensitive)
    KeywordContains(String),
}

impl RoutePredicate {
    pub fn matches(&self, event: &NormalizedEvent) -> bool {
        match self {
            Self::IsDm(want) => event.is_dm == *want,
            Self::Platform(platform) => event.platform == *platform,
            Self::KeywordContains(keyword) => event
                .content
                .to_lowercase()
                .contains(&keyword.to_lowercase()),
        }
    }
}

/// A named predicate route.
pub struct Route {
    pub name: String,
    pub predicate: RoutePredicate,
}

/// Guards one message-id while its orchestration is in flight.
///
/// Dropping the guard releases the key, whether the dispatch succeeded or
/// panicked.
pub struct DispatchGuard {
    key: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock().expect("active event set lock poisoned");
        active.remove(&self.key);
    }
}

/// Deduplicates events and selects a route for them.
pub struct EventRouter {
    active: Arc<Mutex<HashSet<String>>>,
    routes: Vec<Route>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashSet::new())),
            routes: Vec::new(),
        }
    }

    /// Register a predicate route ahead of the default handler.
    pub fn add_route(&mut self, name: impl Into<String>, predicate: RoutePredicate) {
        self.routes.push(Route {
            name: name.into(),
            predicate,
        });
    }

    /// The name of the first matching route, or None for the default route.
    pub fn select_route(&self, event: &NormalizedEvent) -> Option<&str> {
        self.routes
            .iter()
            .find(|route| route.predicate.matches(event))
            .map(|route| route.name.as_str())
    }

    /// Admit an event for dispatch.
    ///
    /// Returns a guard that holds the `{platform}:{message_id}` key for the
    /// duration of the orchestration. A second admission of the same key
    /// while the first is in flight fails with a non-retryable error.
    pub fn admit(&self, event: &NormalizedEvent) -> Result<DispatchGuard, GatewayError> {
        let key = format!("{}:{}", event.platform, event.message_id);
        let mut active = self.active.lock().expect("active event set lock poisoned");
        if !active.insert(key.clone()) {
            warn!("Duplicate event rejected: {}", key);
            return Err(GatewayError::DuplicateEvent(key));
        }
        debug!("Admitted event {}", key);
        Ok(DispatchGuard {
            key,
            active: Arc::clone(&self.active),
        })
    }

    /// How many events are currently in flight.
    pub fn in_flight(&self) -> usize {
        let active = self.active.lock().expect("active event set lock poisoned");
        active.len()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}
