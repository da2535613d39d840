//! HTTP session table
//!
//! Sessions idle longer than the TTL are dropped, and the table never holds
//! more than `max_sessions` entries: inserting past the cap evicts the least
//! recently used session.

use crate::protocol::Session;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

struct Entry {
    session: Session,
    last_seen: Instant,
}

pub struct SessionStore {
    entries: DashMap<String, Entry>,
    ttl: Duration,
    max_sessions: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL, DEFAULT_MAX_SESSIONS)
    }
}

impl SessionStore {
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Copy of a live session, refreshing its idle clock
    pub fn get(&self, id: &str) -> Option<Session> {
        let now = Instant::now();
        {
            let mut entry = self.entries.get_mut(id)?;
            if now.duration_since(entry.last_seen) < self.ttl {
                entry.last_seen = now;
                return Some(entry.session.clone());
            }
        }
        debug!("session {} expired", id);
        self.entries
            .remove_if(id, |_, e| now.duration_since(e.last_seen) >= self.ttl);
        None
    }

    /// Store `session` under `id`, evicting idle and excess sessions first
    pub fn insert(&self, id: String, session: Session) {
        let now = Instant::now();
        if !self.entries.contains_key(&id) {
            self.cleanup();
            while self.entries.len() >= self.max_sessions {
                if !self.evict_lru() {
                    break;
                }
            }
        }
        self.entries.insert(
            id,
            Entry {
                session,
                last_seen: now,
            },
        );
    }

    pub fn remove(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Drop every session idle past the TTL; returns how many went
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.duration_since(e.last_seen) < self.ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("dropped {} idle sessions", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_lru(&self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.last_seen)
            .map(|e| e.key().clone());

        match oldest {
            Some(id) => {
                debug!("session table full, evicting {}", id);
                self.entries.remove(&id).is_some()
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initialized() -> Session {
        let mut session = Session::new();
        session.mark_initialized();
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_expire() {
        let store = SessionStore::new(Duration::from_secs(60), 16);
        store.insert("a".to_string(), initialized());
        store.insert("b".to_string(), initialized());

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(store.get("a").unwrap().is_initialized());

        tokio::time::advance(Duration::from_secs(30)).await;
        // "a" was touched 30s ago, "b" has been idle for 70s
        assert!(store.get("b").is_none());
        assert!(store.get("a").is_some());
        assert_eq!(store.len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.cleanup(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_evicts_least_recently_used() {
        let store = SessionStore::new(Duration::from_secs(3600), 2);
        store.insert("a".to_string(), initialized());
        tokio::time::advance(Duration::from_secs(1)).await;
        store.insert("b".to_string(), initialized());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.get("a").is_some());

        store.insert("c".to_string(), initialized());
        assert_eq!(store.len(), 2);
        assert!(store.get("b").is_none());
        assert!(store.get("a").is_some());
        assert!(store.get("c").is_some());

        // Re-storing a known id never evicts
        store.insert("a".to_string(), initialized());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remove() {
        let store = SessionStore::default();
        store.insert("a".to_string(), Session::new());
        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert_eq!(store.ttl(), DEFAULT_SESSION_TTL);
    }
}
