//! Auth gate (C7): the single `authorize` path every authenticated entry
//! point (HTTP extractor and WS acceptance) runs through.
//!
//! Grounded on `session/manager.py`'s `get_current_user_with_activity` /
//! `verify_and_update_activity` — two call sites over one shared body in
//! the original; here a single `authorize` method serves both, since an
//! axum extractor and a plain async fn can both call it without the
//! decorator/dependency-injection split the original needed.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use std::sync::Arc;

use crate::connection_tracker::ConnectionTracker;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::models::Principal;
use crate::session_store::SessionStore;

pub struct AuthGate {
    credentials: Arc<Credentials>,
    sessions: Arc<SessionStore>,
    connections: Arc<ConnectionTracker>,
}

impl AuthGate {
    pub fn new(
        credentials: Arc<Credentials>,
        sessions: Arc<SessionStore>,
        connections: Arc<ConnectionTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            credentials,
            sessions,
            connections,
        })
    }

    /// Verify `token`, resolve (or lazily create) the caller's session and
    /// connection, and optionally assert that `expected_session` names the
    /// tracked session.
    pub async fn authorize(&self, token: &str, expected_session: Option<&str>) -> Result<Principal> {
        let claims = self.credentials.verify(token)?;
        let user_id = claims.sub;

        let session_id = match self.connections.get(&user_id).await? {
            Some(conn) => conn.session_id,
            None => {
                let (_, session_id) = self.sessions.get_or_create(&user_id, "default", None).await?;
                self.connections.track(&user_id, &session_id, false).await?;
                session_id
            }
        };

        if let Some(expected) = expected_session {
            if expected != session_id {
                return Err(Error::SessionMismatch);
            }
        }

        self.connections.update_timestamp(&user_id).await?;
        self.sessions.touch(&session_id).await?;

        Ok(Principal {
            user_id,
            role: claims.role,
            session_id,
        })
    }

    /// Periodic re-check for an already-accepted WS connection: re-verifies
    /// the bearer token (catching mid-socket expiry) and confirms it still
    /// names `user_id`, then confirms the tracked session for `user_id` is
    /// still `session_id`.
    pub async fn reverify(&self, token: &str, user_id: &str, session_id: &str) -> Result<()> {
        let claims = self.credentials.verify(token)?;
        if claims.sub != user_id {
            return Err(Error::SessionMismatch);
        }

        match self.connections.get(user_id).await? {
            Some(conn) if conn.session_id == session_id => Ok(()),
            _ => Err(Error::SessionMismatch),
        }
    }
}

/// Bearer token extracted from the `Authorization` header, extracted and
/// authorized against a shared `AuthGate`.
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
    Arc<AuthGate>: FromRef<S>,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let gate = Arc::<AuthGate>::from_ref(state);

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| Error::Auth("missing or invalid Authorization header".into()))?;

        gate.authorize(token, None).await
    }
}
