//! HTTP handlers for the session and admin surfaces (section 6).
//!
//! Grounded on `session/manager.py`'s `setup_routes` and
//! `urls_registry/manager.py`'s `_setup_management_routes`: one `async fn`
//! per route, each pulling its principal via the `Principal` extractor
//! (auth gate, C7) and its dependencies via `State<AppState>`.

mod admin;
mod sessions;

pub use admin::{list_upstreams, register_upstream, unregister_upstream};
pub use sessions::{
    create_session, delete_account, get_session, get_user_connection, get_user_sessions, login,
    logout, register, update_session,
};

use axum::routing::{delete, get, post};
use axum::Router;

use crate::state::AppState;

/// The `/sessions/*` and `/api/*` router, mounted alongside `/ws/*` and the
/// ambient health routes by the binary's bootstrap.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions/register", post(register))
        .route("/sessions/login", post(login))
        .route("/sessions/logout", post(logout))
        .route("/sessions/delete_account", post(delete_account))
        .route("/sessions/create", post(create_session))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/update/{id}", post(update_session))
        .route("/sessions/users/{user}/sessions", get(get_user_sessions))
        .route("/sessions/users/{user}/connection", get(get_user_connection))
        .route("/api/register", post(register_upstream))
        .route("/api/unregister", delete(unregister_upstream))
        .route("/api/list", get(list_upstreams))
}
