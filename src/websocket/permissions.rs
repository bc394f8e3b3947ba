//! Role-based message authorization for the WS engine.
//!
//! Grounded on `wss/manager.py`'s `message_permissions` dict and its
//! `add_message_permission` / `remove_message_permission` /
//! `get_role_permissions` admin methods, expressed over a `DashMap` so the
//! allow-list can be mutated at runtime without a lock around the whole
//! table.

use dashmap::{DashMap, DashSet};

use crate::models::Role;

const WILDCARD: &str = "*";

pub struct PermissionTable {
    roles: DashMap<String, DashSet<String>>,
}

impl Default for PermissionTable {
    fn default() -> Self {
        let roles = DashMap::new();

        let user_allowed = DashSet::new();
        for kind in ["update_api_key", "chat_message", "ping", "pong"] {
            user_allowed.insert(kind.to_string());
        }
        roles.insert(Role::User.as_str().to_string(), user_allowed);

        let admin_allowed = DashSet::new();
        admin_allowed.insert(WILDCARD.to_string());
        roles.insert(Role::Admin.as_str().to_string(), admin_allowed);

        Self { roles }
    }
}

impl PermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `role` may send `msg_type`, not accounting for the
    /// registry's `require_auth = false` escape hatch (checked separately
    /// by the caller, which has access to the registry).
    pub fn is_allowed(&self, role: Role, msg_type: &str) -> bool {
        match self.roles.get(role.as_str()) {
            Some(allowed) => allowed.contains(WILDCARD) || allowed.contains(msg_type),
            None => false,
        }
    }

    pub fn add(&self, role: &str, msg_type: &str) {
        self.roles
            .entry(role.to_string())
            .or_default()
            .insert(msg_type.to_string());
    }

    pub fn remove(&self, role: &str, msg_type: &str) {
        if let Some(allowed) = self.roles.get(role) {
            allowed.remove(msg_type);
        }
    }

    pub fn list(&self, role: &str) -> Vec<String> {
        self.roles
            .get(role)
            .map(|allowed| allowed.iter().map(|e| e.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_user_permissions_match_configuration() {
        let table = PermissionTable::new();
        assert!(table.is_allowed(Role::User, "update_api_key"));
        assert!(table.is_allowed(Role::User, "chat_message"));
        assert!(!table.is_allowed(Role::User, "anything_else"));
    }

    #[test]
    fn admin_wildcard_allows_everything() {
        let table = PermissionTable::new();
        assert!(table.is_allowed(Role::Admin, "anything_at_all"));
    }

    #[test]
    fn runtime_grant_and_revoke() {
        let table = PermissionTable::new();
        assert!(!table.is_allowed(Role::User, "custom_type"));
        table.add("user", "custom_type");
        assert!(table.is_allowed(Role::User, "custom_type"));
        table.remove("user", "custom_type");
        assert!(!table.is_allowed(Role::User, "custom_type"));
    }
}
