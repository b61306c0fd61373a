//! Session affinity: token format, store collaborator, in-memory default.
//!
//! The affinity cookie pins a client to one backend node. Its value is
//! `<opaque id>[.<route tag>]`; the route tag names the node that owns the
//! session. The connector only validates tokens — session state itself lives
//! behind the [`SessionStore`] collaborator.

use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

/// Fixed cookie name carrying the affinity token.
pub const AFFINITY_COOKIE_NAME: &str = "JSESSIONID";

// ========================================
// TOKEN
// ========================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityToken {
    pub id: String,
    pub route: Option<String>,
}

impl AffinityToken {
    /// Split `<id>[.<route>]` on the last dot.
    pub fn parse(raw: &str) -> Self {
        match raw.rsplit_once('.') {
            Some((id, route)) if !route.is_empty() => Self {
                id: id.to_string(),
                route: Some(route.to_string()),
            },
            _ => Self {
                id: raw.to_string(),
                route: None,
            },
        }
    }

    /// Fresh token bound to this node's route tag.
    pub fn mint(route_tag: &str) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            route: (!route_tag.is_empty()).then(|| route_tag.to_string()),
        }
    }

    /// Whether the token's route tag names the given node.
    pub fn routes_to(&self, route_tag: &str) -> bool {
        self.route.as_deref() == Some(route_tag)
    }
}

impl fmt::Display for AffinityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.route {
            Some(route) => write!(f, "{}.{}", self.id, route),
            None => write!(f, "{}", self.id),
        }
    }
}

// ========================================
// SESSION STORE
// ========================================

/// Lookup used only to validate an affinity token.
pub trait SessionStore: Send + Sync {
    /// True when the session id is known and not expired.
    fn is_live(&self, id: &str) -> bool;
}

/// In-memory store with a fixed TTL, refreshed on every validation hit.
pub struct InMemorySessionStore {
    sessions: DashMap<String, Instant>,
    ttl: Duration,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    pub fn register(&self, id: impl Into<String>) {
        self.sessions.insert(id.into(), Instant::now());
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for InMemorySessionStore {
    fn is_live(&self, id: &str) -> bool {
        let expired = match self.sessions.get_mut(id) {
            Some(mut seen) if seen.elapsed() <= self.ttl => {
                *seen = Instant::now();
                return true;
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.sessions.remove(id);
        }
        false
    }
}
