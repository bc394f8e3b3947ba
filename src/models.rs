//! Core data model shared across the store/tracker/engine components.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A user's role, used both for bearer-credential claims and for the WS
/// engine's role-based message authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            _ => Ok(Role::User),
        }
    }
}

/// User record, keyed by username in the KV (`users:<username>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password_digest: String,
    pub contact: String,
    pub role: Role,
    /// Unix timestamp of the last successful login.
    pub last_login: i64,
}

/// Session record, keyed by an opaque UUID in the KV (`sessions:<uuid>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user: String,
    pub chat_id: String,
    /// Opaque application data bag (API keys, conversation state, ...).
    #[serde(default)]
    pub data: Value,
    pub created_at: i64,
    pub last_access: i64,
}

/// Connection record, keyed by user in the KV (`connections:<user>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub session_id: String,
    pub gateway_id: String,
    pub ws_connected: bool,
    pub last_seen: i64,
}

/// The authenticated principal resolved by the auth gate (C7), returned to
/// both HTTP extractors and the WS acceptance path.
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
    pub session_id: String,
}

/// Bearer-credential claims issued and verified by the credential service
/// (C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: i64,
    pub iat: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn role_round_trips_through_json() {
        let json = serde_json::to_string(&Role::Admin).unwrap();
        assert_eq!(json, "\"admin\"");
        let role: Role = serde_json::from_str(&json).unwrap();
        assert_eq!(role, Role::Admin);
    }

    #[test]
    fn unknown_role_string_defaults_to_user() {
        assert_eq!(Role::from_str("nonsense").unwrap(), Role::User);
    }
}
