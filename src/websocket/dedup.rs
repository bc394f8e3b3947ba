//! Message de-duplication cache for the WS engine's `update_api_key`
//! built-in handler.
//!
//! Grounded on `wss/manager.py`'s `message_cache: {user_id: {session_id:
//! {msg_type: CachedMessage}}}` plus its TTL janitor. The nested dict is
//! flattened to a single `DashMap` keyed by the same triple; a fingerprint
//! (blake3 of the payload) stands in for the original's raw string compare
//! so the cache never holds a copy of a sensitive value like an API key.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Clone)]
struct Entry {
    fingerprint: String,
    cached_at: Instant,
}

/// Occupancy snapshot for the `/ws/health` endpoint.
pub struct DedupStats {
    pub users: usize,
    pub sessions: usize,
    pub messages: usize,
}

pub struct DedupCache {
    entries: DashMap<(String, String, String), Entry>,
    ttl: Duration,
}

fn fingerprint(payload: &str) -> String {
    blake3::hash(payload.as_bytes()).to_hex().to_string()
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Returns `true` if `(user, session, msg_type)` was already seen with
    /// the same payload within the TTL. Otherwise records the new
    /// fingerprint and returns `false`.
    pub fn check_and_record(&self, user: &str, session: &str, msg_type: &str, payload: &str) -> bool {
        let key = (user.to_string(), session.to_string(), msg_type.to_string());
        let print = fingerprint(payload);

        if let Some(entry) = self.entries.get(&key) {
            if entry.fingerprint == print && entry.cached_at.elapsed() < self.ttl {
                return true;
            }
        }

        self.entries.insert(
            key,
            Entry {
                fingerprint: print,
                cached_at: Instant::now(),
            },
        );
        false
    }

    /// Drop a cached entry so the next attempt is not suppressed, used when
    /// the asynchronous write behind a dedup'd message fails.
    pub fn evict(&self, user: &str, session: &str, msg_type: &str) {
        self.entries
            .remove(&(user.to_string(), session.to_string(), msg_type.to_string()));
    }

    pub fn cleanup_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.cached_at.elapsed() < ttl);
    }

    pub fn stats(&self) -> DedupStats {
        let mut users = std::collections::HashSet::new();
        let mut sessions = std::collections::HashSet::new();
        let messages = self.entries.len();

        for entry in self.entries.iter() {
            let (user, session, _) = entry.key();
            users.insert(user.clone());
            sessions.insert((user.clone(), session.clone()));
        }

        DedupStats {
            users: users.len(),
            sessions: sessions.len(),
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_payload_within_ttl_is_a_duplicate() {
        let cache = DedupCache::new(Duration::from_secs(60));
        assert!(!cache.check_and_record("alice", "s1", "update_api_key", "sk-1"));
        assert!(cache.check_and_record("alice", "s1", "update_api_key", "sk-1"));
    }

    #[test]
    fn different_payload_is_not_a_duplicate() {
        let cache = DedupCache::new(Duration::from_secs(60));
        assert!(!cache.check_and_record("alice", "s1", "update_api_key", "sk-1"));
        assert!(!cache.check_and_record("alice", "s1", "update_api_key", "sk-2"));
    }

    #[test]
    fn eviction_allows_retry() {
        let cache = DedupCache::new(Duration::from_secs(60));
        cache.check_and_record("alice", "s1", "update_api_key", "sk-1");
        cache.evict("alice", "s1", "update_api_key");
        assert!(!cache.check_and_record("alice", "s1", "update_api_key", "sk-1"));
    }

    #[test]
    fn stats_count_distinct_users_and_sessions() {
        let cache = DedupCache::new(Duration::from_secs(60));
        cache.check_and_record("alice", "s1", "update_api_key", "sk-1");
        cache.check_and_record("alice", "s2", "update_api_key", "sk-1");
        cache.check_and_record("bob", "s3", "update_api_key", "sk-1");
        let stats = cache.stats();
        assert_eq!(stats.users, 2);
        assert_eq!(stats.sessions, 3);
        assert_eq!(stats.messages, 3);
    }
}
