//! # gateway-edge
//!
//! Authenticated WebSocket + HTTP gateway with KV-backed session coordination.
//!
//! A single replica holds no session state in memory beyond what it needs to
//! serve the sockets it currently has open: credentials, sessions, and
//! connection records all live in the KV store, so any replica can answer
//! for any user and a restart loses nothing but open sockets.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gateway_edge::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     let state = AppState::build(config.clone()).await?;
//!
//!     let app = Router::new()
//!         .route("/healthz", get(health))
//!         .route("/ready", get(readiness))
//!         .with_state(state);
//!
//!     Server::new(config).serve(app).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod auth_gate;
pub mod config;
pub mod connection_tracker;
pub mod credentials;
pub mod error;
pub mod events;
pub mod forwarder;
pub mod handlers;
pub mod health;
pub mod ids;
pub mod kv;
pub mod middleware;
pub mod models;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod session_store;
pub mod state;
pub mod user_store;
pub mod websocket;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::auth_gate::AuthGate;
    pub use crate::config::Config;
    pub use crate::connection_tracker::ConnectionTracker;
    pub use crate::credentials::Credentials;
    pub use crate::error::{Error, Result};
    pub use crate::events::{Event, EventBus};
    pub use crate::forwarder::Forwarder;
    pub use crate::health::{health, pool_metrics, readiness};
    pub use crate::ids::{MakeTypedRequestId, RequestId, RequestIdError};
    pub use crate::kv::Kv;
    pub use crate::middleware::{
        request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
        RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS,
    };
    pub use crate::models::{Claims, Connection, Principal, Role, Session};
    pub use crate::reaper::Reaper;
    pub use crate::registry::{Registry, UpstreamSpec};
    pub use crate::server::Server;
    pub use crate::session_store::SessionStore;
    pub use crate::state::AppState;
    pub use crate::user_store::UserStore;
    pub use crate::websocket::{DedupCache, PermissionTable};

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Extension, Router,
    };

    pub use serde::{Deserialize, Serialize};

    pub use tracing::{debug, error, info, instrument, trace, warn, Level, Span};

    pub use tokio;

    pub use async_trait::async_trait;

    pub use thiserror::Error;

    pub use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};

    pub use uuid::Uuid;

    pub use futures::{future, stream, Future, Stream, StreamExt, TryFutureExt, TryStreamExt};

    pub use http::{Method, Uri};
}
