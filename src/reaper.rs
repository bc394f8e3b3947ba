//! Reaper (C6): periodic sweeps that prune stale sessions and the
//! resources of long-inactive users, without ever deleting a user record.
//!
//! Grounded on `session/cleaner.py::SessionCleaner`. Per the design
//! decision recorded alongside this component, inactivity cleanup purges
//! sessions, connections, and live sockets for a user but always preserves
//! the `users:<name>` record itself — only an explicit `delete_account`
//! removes it.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::ReaperConfig;
use crate::connection_tracker::ConnectionTracker;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::kv::Kv;
use crate::models::Session;
use crate::session_store::SessionStore;

pub struct Reaper {
    kv: Arc<Kv>,
    events: Arc<EventBus>,
    sessions: Arc<SessionStore>,
    connections: Arc<ConnectionTracker>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(
        kv: Arc<Kv>,
        events: Arc<EventBus>,
        sessions: Arc<SessionStore>,
        connections: Arc<ConnectionTracker>,
        config: ReaperConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            kv,
            events,
            sessions,
            connections,
            config,
        })
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let reaper = Arc::clone(self);
        let interval = reaper.config.interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {
                        reaper.sweep_expired_sessions().await;
                        reaper.sweep_inactive_users().await;
                    }
                }
            }
        })
    }

    /// Delete any session key whose TTL has already lapsed (defensive — the
    /// KV's own expiry should have cleared it) or whose `last_access`
    /// predates the inactivity cutoff.
    pub async fn sweep_expired_sessions(&self) {
        let cutoff = Utc::now() - self.config.max_inactive();
        let cutoff_secs = cutoff.timestamp();

        let keys = match self.kv.scan_match("sessions:*").await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(error = %e, "expired-session sweep: scan failed");
                return;
            }
        };

        let mut swept = 0;
        let mut errored = 0;

        for key in keys {
            match self.reap_session_if_stale(&key, cutoff_secs).await {
                Ok(true) => swept += 1,
                Ok(false) => {}
                Err(e) => {
                    errored += 1;
                    tracing::warn!(key, error = %e, "expired-session sweep: skipping key");
                }
            }
        }

        tracing::info!(swept, errored, "expired-session sweep complete");
    }

    async fn reap_session_if_stale(&self, key: &str, cutoff_secs: i64) -> Result<bool> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(false);
        };
        let Ok(session) = serde_json::from_str::<Session>(&raw) else {
            self.kv.del(key).await?;
            return Ok(true);
        };

        if session.last_access < cutoff_secs {
            self.kv.del(key).await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// For each user whose `last_login` predates the inactivity cutoff,
    /// purge their sessions, connection, and any locally-held socket, but
    /// leave the `users:<name>` record untouched.
    pub async fn sweep_inactive_users(&self) {
        let cutoff = Utc::now() - self.config.max_inactive();
        let cutoff_secs = cutoff.timestamp();

        let keys = match self.kv.scan_match("users:*").await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(error = %e, "inactive-user sweep: scan failed");
                return;
            }
        };

        let mut cleaned = 0;
        let mut errored = 0;

        for key in keys {
            let Some(username) = key.strip_prefix("users:") else { continue };
            match self.cleanup_if_inactive(username, cutoff_secs).await {
                Ok(true) => cleaned += 1,
                Ok(false) => {}
                Err(e) => {
                    errored += 1;
                    tracing::warn!(user = username, error = %e, "inactive-user sweep: skipping user");
                }
            }
        }

        tracing::info!(cleaned, errored, "inactive-user sweep complete");
    }

    async fn cleanup_if_inactive(&self, username: &str, cutoff_secs: i64) -> Result<bool> {
        let fields = self.kv.hgetall(&format!("users:{username}")).await?;
        let last_login: i64 = fields.get("last_login").and_then(|v| v.parse().ok()).unwrap_or(0);

        if last_login >= cutoff_secs {
            return Ok(false);
        }

        self.sessions.cleanup_user_sessions(username).await?;
        self.connections.remove(username).await?;
        self.events
            .publish(Event::UserInactiveCleanup { user: username.to_string() })
            .await?;

        Ok(true)
    }
}
