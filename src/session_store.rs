//! Session store (C4): KV-backed sessions with a batched write-behind path,
//! a TTL-bounded read cache, and throttled `last_access` touches.
//!
//! Grounded on `session/handler.py::SessionHandler` — the pending-updates
//! map drained by a 100ms background writer, the cache-ttl read-through,
//! and the touch-interval throttle are all carried over unchanged in shape,
//! expressed with `tokio::sync::Mutex` + `DashMap` instead of `asyncio.Lock`
//! + plain dicts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use deadpool_redis::redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::kv::Kv;
use crate::models::Session;

fn kv_key(session_id: &str) -> String {
    format!("sessions:{session_id}")
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

struct PendingUpdate {
    user: String,
    chat_id: String,
    updates: Value,
    last_access: i64,
}

pub struct SessionStore {
    kv: Arc<Kv>,
    events: Arc<EventBus>,
    config: SessionConfig,
    cache: DashMap<String, (Session, Instant)>,
    pending: Mutex<HashMap<String, PendingUpdate>>,
    last_touch: DashMap<String, Instant>,
}

impl SessionStore {
    pub fn new(kv: Arc<Kv>, events: Arc<EventBus>, config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            kv,
            events,
            config,
            cache: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            last_touch: DashMap::new(),
        })
    }

    /// Start the background flush loop. Returns its handle so callers can
    /// await it on shutdown.
    pub fn spawn_flush_task(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = store.config.flush_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = store.flush_pending().await {
                            tracing::error!(error = %e, "session batch writer failed");
                        }
                    }
                }
            }
        })
    }

    pub async fn get_or_create(
        &self,
        user: &str,
        chat_id: &str,
        session_id: Option<&str>,
    ) -> Result<(Session, String)> {
        if let Some(id) = session_id {
            if let Some(entry) = self.cache.get(id) {
                let (session, cached_at) = entry.value();
                if cached_at.elapsed() < self.config.cache_ttl() {
                    return Ok((session.clone(), id.to_string()));
                }
            }

            if let Some(raw) = self.kv.get(&kv_key(id)).await? {
                let session: Session = serde_json::from_str(&raw)?;
                self.cache.insert(id.to_string(), (session.clone(), Instant::now()));
                return Ok((session, id.to_string()));
            }
        }

        let new_id = uuid::Uuid::new_v4().to_string();
        let timestamp = now();
        let session = Session {
            session_id: new_id.clone(),
            user: user.to_string(),
            chat_id: chat_id.to_string(),
            data: serde_json::json!({ "conversation": [], "api_key": null }),
            created_at: timestamp,
            last_access: timestamp,
        };

        let serialized = serde_json::to_string(&session)?;
        self.kv
            .set_ex(&kv_key(&new_id), &serialized, self.config.timeout_secs)
            .await?;
        self.cache.insert(new_id.clone(), (session.clone(), Instant::now()));

        self.events
            .publish(Event::SessionNew {
                user: user.to_string(),
                session_id: new_id.clone(),
            })
            .await?;

        Ok((session, new_id))
    }

    /// Look up a session by id without creating one if it is missing.
    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        if let Some(entry) = self.cache.get(session_id) {
            let (session, cached_at) = entry.value();
            if cached_at.elapsed() < self.config.cache_ttl() {
                return Ok(Some(session.clone()));
            }
        }

        let Some(raw) = self.kv.get(&kv_key(session_id)).await? else {
            return Ok(None);
        };
        let session: Session = serde_json::from_str(&raw)?;
        self.cache.insert(session_id.to_string(), (session.clone(), Instant::now()));
        Ok(Some(session))
    }

    /// Enqueue a partial update for the next flush round. Never touches the
    /// KV directly — the background writer owns that.
    pub async fn update(&self, session_id: &str, user: &str, chat_id: &str, updates: Value) {
        let mut pending = self.pending.lock().await;
        match pending.get_mut(session_id) {
            Some(existing) => {
                merge_json(&mut existing.updates, &updates);
                existing.last_access = now();
            }
            None => {
                pending.insert(
                    session_id.to_string(),
                    PendingUpdate {
                        user: user.to_string(),
                        chat_id: chat_id.to_string(),
                        updates,
                        last_access: now(),
                    },
                );
            }
        }
    }

    async fn flush_pending(&self) -> Result<()> {
        let batch: HashMap<String, PendingUpdate> = {
            let mut pending = self.pending.lock().await;
            if pending.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *pending)
        };

        let mut conn = self.kv.connection().await?;
        let ids: Vec<&String> = batch.keys().collect();

        let mut read_pipe = deadpool_redis::redis::pipe();
        for id in &ids {
            read_pipe.get(kv_key(id));
        }
        let serialized: Vec<Option<String>> = read_pipe.query_async(&mut conn).await?;

        let mut write_pipe = deadpool_redis::redis::pipe();
        let mut to_publish = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();

        for (id, raw) in ids.iter().zip(serialized.into_iter()) {
            let update = &batch[id.as_str()];

            let Some(raw) = raw else {
                failed.push((update.user.clone(), (*id).clone()));
                continue;
            };
            let Ok(mut session) = serde_json::from_str::<Session>(&raw) else {
                failed.push((update.user.clone(), (*id).clone()));
                continue;
            };

            merge_json(&mut session.data, &update.updates);
            session.last_access = update.last_access;

            let Ok(reserialized) = serde_json::to_string(&session) else {
                failed.push((update.user.clone(), (*id).clone()));
                continue;
            };
            write_pipe.set_ex(kv_key(id), reserialized, self.config.timeout_secs);
            self.cache.insert((*id).clone(), (session, Instant::now()));
            to_publish.push((update.user.clone(), (*id).clone(), update.chat_id.clone()));
        }

        if !to_publish.is_empty() {
            if let Err(e) = write_pipe.query_async::<()>(&mut conn).await {
                tracing::error!(error = %e, "session batch write failed");
                failed.extend(to_publish.drain(..).map(|(user, session_id, _)| (user, session_id)));
            }
        }

        for (user, session_id, _chat_id) in to_publish {
            if let Err(e) = self.events.publish(Event::SessionUpdate { user, session_id }).await {
                tracing::warn!(error = %e, "failed to publish session update event");
            }
        }

        for (user, session_id) in failed {
            if let Err(e) = self
                .events
                .publish(Event::SessionWriteFailed { user, session_id })
                .await
            {
                tracing::warn!(error = %e, "failed to publish session write-failed event");
            }
        }

        Ok(())
    }

    /// Refresh `last_access`, but at most once per `touch_interval`. Cheap
    /// no-op on the common case of a socket that just touched recently.
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        let interval = self.config.touch_interval();

        if let Some(last) = self.last_touch.get(session_id) {
            if last.elapsed() < interval {
                return Ok(());
            }
        }

        let Some(raw) = self.kv.get(&kv_key(session_id)).await? else {
            return Ok(());
        };
        let Ok(mut session) = serde_json::from_str::<Session>(&raw) else {
            return Ok(());
        };

        session.last_access = now();
        let serialized = serde_json::to_string(&session)?;
        self.kv
            .set_ex(&kv_key(session_id), &serialized, self.config.timeout_secs)
            .await?;

        self.cache.insert(session_id.to_string(), (session, Instant::now()));
        self.last_touch.insert(session_id.to_string(), Instant::now());
        Ok(())
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        self.kv.del(&kv_key(session_id)).await?;
        self.cache.remove(session_id);
        self.last_touch.remove(session_id);
        Ok(())
    }

    pub async fn cleanup_user_sessions(&self, user: &str) -> Result<()> {
        let keys = self.kv.scan_match("sessions:*").await?;
        let mut deleted = 0;

        for key in keys {
            let Some(raw) = self.kv.get(&key).await? else { continue };
            let Ok(session) = serde_json::from_str::<Session>(&raw) else { continue };
            if session.user == user {
                self.kv.del(&key).await?;
                if let Some(id) = key.strip_prefix("sessions:") {
                    self.cache.remove(id);
                    self.last_touch.remove(id);
                }
                deleted += 1;
            }
        }

        if deleted > 0 {
            tracing::info!(user, deleted, "cleaned up sessions for user");
        }
        Ok(())
    }
}

fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                merge_json(base_map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (base, patch) => {
            *base = patch.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_json_overwrites_leaf_keys() {
        let mut base = serde_json::json!({ "api_key": null, "conversation": [] });
        let patch = serde_json::json!({ "api_key": "sk-123" });
        merge_json(&mut base, &patch);
        assert_eq!(base["api_key"], "sk-123");
        assert_eq!(base["conversation"], serde_json::json!([]));
    }

    #[test]
    fn merge_json_preserves_untouched_nested_keys() {
        let mut base = serde_json::json!({ "nested": { "a": 1, "b": 2 } });
        let patch = serde_json::json!({ "nested": { "a": 99 } });
        merge_json(&mut base, &patch);
        assert_eq!(base["nested"]["a"], 99);
        assert_eq!(base["nested"]["b"], 2);
    }
}
