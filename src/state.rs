//! Application state: explicit dependency injection for every component.
//!
//! A fixed, fully-wired set of components rather than a generic optional-
//! backend bag — this gateway has exactly one shape of state, known at
//! compile time.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;

use crate::auth_gate::AuthGate;
use crate::config::Config;
use crate::connection_tracker::ConnectionTracker;
use crate::credentials::Credentials;
use crate::error::Result;
use crate::events::EventBus;
use crate::forwarder::Forwarder;
use crate::kv::Kv;
use crate::reaper::Reaper;
use crate::registry::Registry;
use crate::session_store::SessionStore;
use crate::user_store::UserStore;
use crate::websocket::{DedupCache, PermissionTable};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub kv: Arc<Kv>,
    pub events: Arc<EventBus>,
    pub credentials: Arc<Credentials>,
    pub users: Arc<UserStore>,
    pub sessions: Arc<SessionStore>,
    pub connections: Arc<ConnectionTracker>,
    pub reaper: Arc<Reaper>,
    pub auth_gate: Arc<AuthGate>,
    pub registry: Arc<Registry>,
    pub forwarder: Arc<Forwarder>,
    pub ws_dedup: Arc<DedupCache>,
    pub ws_permissions: Arc<PermissionTable>,
}

impl AppState {
    /// Wire every component from a loaded config. Connects to the KV store
    /// eagerly — an unreachable KV is a startup failure, not a degraded
    /// mode this gateway can serve requests in.
    pub async fn build(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let kv = Arc::new(Kv::connect(&config.kv).await?);
        let events = Arc::new(EventBus::new(kv.clone()));
        let credentials = Arc::new(Credentials::new(&config.credentials)?);

        let users = UserStore::new(kv.clone(), events.clone(), credentials.clone());
        let sessions = SessionStore::new(kv.clone(), events.clone(), config.session.clone());
        let connections = ConnectionTracker::new(
            kv.clone(),
            events.clone(),
            &config.service,
            config.session.timeout_secs,
            config.session.touch_interval_secs,
        );
        let reaper = Reaper::new(
            kv.clone(),
            events.clone(),
            sessions.clone(),
            connections.clone(),
            config.reaper.clone(),
        );
        let auth_gate = AuthGate::new(credentials.clone(), sessions.clone(), connections.clone());
        let registry = Registry::new();
        let forwarder = Forwarder::new(config.forwarder.clone())?;

        let ws_dedup = Arc::new(DedupCache::new(config.websocket.dedup_cache_ttl()));
        let ws_permissions = Arc::new(PermissionTable::new());

        Ok(Self {
            config,
            kv,
            events,
            credentials,
            users,
            sessions,
            connections,
            reaper,
            auth_gate,
            registry,
            forwarder,
            ws_dedup,
            ws_permissions,
        })
    }

    pub fn dedup_cleanup_interval(&self) -> Duration {
        self.config.websocket.dedup_cleanup_interval()
    }
}

impl FromRef<AppState> for Arc<AuthGate> {
    fn from_ref(state: &AppState) -> Self {
        state.auth_gate.clone()
    }
}
