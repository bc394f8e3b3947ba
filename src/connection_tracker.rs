//! Connection tracker (C5): KV-backed connection records plus the
//! per-replica live-socket registry backing cross-replica logout.
//!
//! Grounded on `session/connections.py::ConnectionManager` (hash record
//! shape, timestamp throttle, gateway-id recompute on every update) and on
//! `wss/registry.py`'s pub/sub-driven socket teardown for the local
//! registry half.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::kv::Kv;
use crate::models::Connection;

fn kv_key(user: &str) -> String {
    format!("connections:{user}")
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

pub struct ConnectionTracker {
    kv: Arc<Kv>,
    events: Arc<EventBus>,
    gateway_id: String,
    timeout_secs: u64,
    touch_interval_secs: u64,
    last_update: DashMap<String, Instant>,
    /// Live sockets held open by this replica, keyed by user. The WS engine
    /// registers a cancellation token on accept and removes it on close;
    /// a remote logout event cancels it to tear the socket down locally.
    live_sockets: DashMap<String, CancellationToken>,
}

impl ConnectionTracker {
    pub fn new(
        kv: Arc<Kv>,
        events: Arc<EventBus>,
        service: &ServiceConfig,
        timeout_secs: u64,
        touch_interval_secs: u64,
    ) -> Arc<Self> {
        let tracker = Arc::new(Self {
            kv,
            events,
            gateway_id: service.gateway_id(),
            timeout_secs,
            touch_interval_secs,
            last_update: DashMap::new(),
            live_sockets: DashMap::new(),
        });
        tracker.clone().spawn_logout_listener();
        tracker
    }

    /// Close any locally-held socket for a user whose session was logged
    /// out elsewhere (new login, explicit logout, or reaper sweep).
    fn spawn_logout_listener(self: Arc<Self>) {
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Event::SessionLogout { user, .. }) | Ok(Event::UserInactiveCleanup { user }) => {
                        if let Some((_, token)) = self.live_sockets.remove(&user) {
                            token.cancel();
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "connection tracker logout listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Register the live socket for a user on this replica. Returns the
    /// token the WS handler should select on alongside its read/write
    /// loops; cancellation means "close this socket now".
    pub fn register_live_socket(&self, user: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.live_sockets.insert(user.to_string(), token.clone());
        token
    }

    pub fn deregister_live_socket(&self, user: &str) {
        self.live_sockets.remove(user);
    }

    /// Number of sockets this replica currently holds open, for the WS
    /// health endpoint.
    pub fn live_socket_count(&self) -> usize {
        self.live_sockets.len()
    }

    pub async fn track(&self, user: &str, session_id: &str, ws_connected: bool) -> Result<()> {
        let key = kv_key(user);
        let fields: [(&str, String); 4] = [
            ("session_id", session_id.to_string()),
            ("gateway_id", self.gateway_id.clone()),
            ("ws_connected", if ws_connected { "1" } else { "0" }.to_string()),
            ("last_seen", now().to_string()),
        ];
        self.kv.hset_multiple(&key, &fields).await?;
        self.kv.expire(&key, self.timeout_secs as i64).await?;

        let event = if ws_connected {
            Event::ConnectionWs { user: user.to_string() }
        } else {
            Event::ConnectionHttp { user: user.to_string() }
        };
        self.events.publish(event).await?;

        Ok(())
    }

    pub async fn get(&self, user: &str) -> Result<Option<Connection>> {
        let fields = self.kv.hgetall(&kv_key(user)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        Ok(Some(Connection {
            session_id: fields.get("session_id").cloned().unwrap_or_default(),
            gateway_id: fields.get("gateway_id").cloned().unwrap_or_default(),
            ws_connected: fields.get("ws_connected").map(|v| v == "1").unwrap_or(false),
            last_seen: fields.get("last_seen").and_then(|v| v.parse().ok()).unwrap_or(0),
        }))
    }

    /// Refresh `last_seen` and this replica's gateway id, throttled to once
    /// per `touch_interval_secs`.
    pub async fn update_timestamp(&self, user: &str) -> Result<()> {
        let interval = std::time::Duration::from_secs(self.touch_interval_secs);

        if let Some(last) = self.last_update.get(user) {
            if last.elapsed() < interval {
                return Ok(());
            }
        }

        let key = kv_key(user);
        let fields: [(&str, String); 2] = [
            ("last_seen", now().to_string()),
            ("gateway_id", self.gateway_id.clone()),
        ];
        self.kv.hset_multiple(&key, &fields).await?;
        self.kv.expire(&key, self.timeout_secs as i64).await?;
        self.last_update.insert(user.to_string(), Instant::now());

        Ok(())
    }

    pub async fn remove(&self, user: &str) -> Result<()> {
        self.kv.del(&kv_key(user)).await?;
        self.last_update.remove(user);
        self.events
            .publish(Event::ConnectionRemoved { user: user.to_string() })
            .await?;
        Ok(())
    }
}
