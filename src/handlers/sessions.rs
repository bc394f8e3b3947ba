//! `/sessions/*` handlers: registration, login/logout, account deletion,
//! and session CRUD.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::models::{Principal, Role};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct RegisterBody {
    username: String,
    contact: String,
    password: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse> {
    state.users.register(&body.username, &body.contact, &body.password).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "registered", "username": body.username })),
    ))
}

#[derive(Deserialize)]
pub struct LoginBody {
    username: String,
    password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> Result<impl IntoResponse> {
    let (token, session_id) = state
        .users
        .login(&body.username, &body.password, &state.sessions, &state.connections)
        .await?;

    Ok(Json(json!({
        "token": token,
        "token_type": "bearer",
        "expires_in": state.config.credentials.token_expiry_minutes * 60,
        "user": body.username,
        "session_id": session_id,
    })))
}

pub async fn logout(State(state): State<AppState>, principal: Principal) -> Result<impl IntoResponse> {
    state.users.logout(&principal.user_id, &state.connections).await?;
    Ok(Json(json!({ "message": "logged out" })))
}

pub async fn delete_account(State(state): State<AppState>, principal: Principal) -> Result<impl IntoResponse> {
    state
        .users
        .delete_account(&principal.user_id, &state.sessions, &state.connections)
        .await?;
    Ok(Json(json!({ "message": "account deleted" })))
}

#[derive(Deserialize, Default)]
pub struct CreateSessionBody {
    chat_id: Option<String>,
    session_id: Option<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<CreateSessionBody>,
) -> Result<impl IntoResponse> {
    let chat_id = body.chat_id.as_deref().unwrap_or("default");
    let (session, session_id) = state
        .sessions
        .get_or_create(&principal.user_id, chat_id, body.session_id.as_deref())
        .await?;

    Ok(Json(json!({
        "session_id": session_id,
        "user_id": session.user,
        "chat_id": session.chat_id,
        "data": session.data,
        "ws_url": format!("/ws/connect?session_id={session_id}"),
    })))
}

pub async fn get_session(
    State(state): State<AppState>,
    principal: Principal,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse> {
    let session = state
        .sessions
        .get(&session_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

    require_owner_or_admin(&principal, &session.user)?;

    Ok(Json(session))
}

#[derive(Deserialize)]
pub struct UpdateSessionBody {
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    data: Value,
}

pub async fn update_session(
    State(state): State<AppState>,
    principal: Principal,
    Path(session_id): Path<String>,
    Json(body): Json<UpdateSessionBody>,
) -> Result<impl IntoResponse> {
    let session = state
        .sessions
        .get(&session_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

    if session.user != principal.user_id {
        return Err(Error::Forbidden("only the session owner may update it".into()));
    }

    let chat_id = body.chat_id.as_deref().unwrap_or(&session.chat_id);
    state
        .sessions
        .update(&session_id, &principal.user_id, chat_id, body.data)
        .await;

    let refreshed = state.sessions.get(&session_id).await?.unwrap_or(session);
    Ok(Json(refreshed))
}

pub async fn get_user_sessions(
    State(state): State<AppState>,
    principal: Principal,
    Path(user): Path<String>,
) -> Result<impl IntoResponse> {
    require_owner_or_admin(&principal, &user)?;

    let keys = state.kv.scan_match("sessions:*").await?;
    let mut sessions = Vec::new();
    for key in keys {
        let Some(raw) = state.kv.get(&key).await? else { continue };
        let Ok(session) = serde_json::from_str::<crate::models::Session>(&raw) else { continue };
        if session.user == user {
            sessions.push(session);
        }
    }

    let count = sessions.len();
    Ok(Json(json!({ "sessions": sessions, "count": count })))
}

pub async fn get_user_connection(
    State(state): State<AppState>,
    principal: Principal,
    Path(user): Path<String>,
) -> Result<impl IntoResponse> {
    require_owner_or_admin(&principal, &user)?;

    let connection = state
        .connections
        .get(&user)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no connection tracked for {user}")))?;

    Ok(Json(connection))
}

fn require_owner_or_admin(principal: &Principal, owner: &str) -> Result<()> {
    if principal.user_id == owner || principal.role == Role::Admin {
        Ok(())
    } else {
        Err(Error::Forbidden("not the resource owner".into()))
    }
}
