//! `/ws/health` response shape.
//!
//! Grounded on `wss/manager.py`'s `ws_health` route: KV reachability plus
//! the connection/cache occupancy and effective timing configuration an
//! operator dashboard or readiness probe would read.

use serde::Serialize;

use crate::config::WebSocketConfig;
use crate::websocket::dedup::DedupStats;

#[derive(Serialize)]
pub struct WsHealthConfig {
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub dedup_cache_ttl_secs: u64,
}

#[derive(Serialize)]
pub struct WsHealthResponse {
    pub status: &'static str,
    pub kv_healthy: bool,
    pub active_connections: usize,
    pub cache_users: usize,
    pub cache_sessions: usize,
    pub cache_messages: usize,
    pub config: WsHealthConfig,
}

pub fn build_response(kv_healthy: bool, active_connections: usize, stats: DedupStats, config: &WebSocketConfig) -> WsHealthResponse {
    WsHealthResponse {
        status: if kv_healthy { "healthy" } else { "degraded" },
        kv_healthy,
        active_connections,
        cache_users: stats.users,
        cache_sessions: stats.sessions,
        cache_messages: stats.messages,
        config: WsHealthConfig {
            ping_interval_secs: config.ping_interval_secs,
            pong_timeout_secs: config.pong_timeout_secs,
            inactivity_timeout_secs: config.inactivity_timeout_secs,
            dedup_cache_ttl_secs: config.dedup_cache_ttl_secs,
        },
    }
}
