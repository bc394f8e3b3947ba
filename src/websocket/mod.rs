//! WebSocket engine (C8): the authenticated, heartbeated connection that
//! backs `/ws/connect`, plus its `/ws/health` companion endpoint.

mod dedup;
mod handler;
mod health;
mod messages;
mod permissions;

pub use dedup::DedupCache;
pub use handler::run_connection;
pub use permissions::PermissionTable;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::state::AppState;

#[derive(Deserialize)]
pub struct ConnectQuery {
    session_id: String,
    token: String,
}

/// `WS /ws/connect?session_id=&token=`
pub async fn ws_connect(State(state): State<AppState>, Query(query): Query<ConnectQuery>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_connection(socket, state, query.session_id, query.token))
}

/// `GET /ws/health`
pub async fn ws_health(State(state): State<AppState>) -> impl IntoResponse {
    let kv_healthy = state.kv.is_healthy().await;
    let active_connections = state.connections.live_socket_count();
    let stats = state.ws_dedup.stats();
    let response = health::build_response(kv_healthy, active_connections, stats, &state.config.websocket);
    Json(response)
}
