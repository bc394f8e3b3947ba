//! `/api/*` handlers: admin-only management of the dynamic upstream
//! registry (C9).

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};
use crate::models::{Principal, Role};
use crate::registry::UpstreamSpec;
use crate::state::AppState;

fn require_admin(principal: &Principal) -> Result<()> {
    if principal.role == Role::Admin {
        Ok(())
    } else {
        Err(Error::Forbidden("admin role required".into()))
    }
}

pub async fn register_upstream(
    State(state): State<AppState>,
    principal: Principal,
    Json(spec): Json<UpstreamSpec>,
) -> Result<impl IntoResponse> {
    require_admin(&principal)?;
    let name = spec.name.clone();
    state.registry.register(spec);
    Ok((StatusCode::CREATED, Json(json!({ "message": "registered", "name": name }))))
}

#[derive(Deserialize)]
pub struct UnregisterQuery {
    name: String,
}

pub async fn unregister_upstream(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<UnregisterQuery>,
) -> Result<impl IntoResponse> {
    require_admin(&principal)?;

    if state.registry.unregister(&query.name) {
        Ok(Json(json!({ "message": "unregistered" })))
    } else {
        Err(Error::NotFound(format!("upstream {}", query.name)))
    }
}

pub async fn list_upstreams(State(state): State<AppState>, principal: Principal) -> Result<impl IntoResponse> {
    require_admin(&principal)?;
    Ok(Json(state.registry.list()))
}
