//! User store (C3): registration, login, logout, account deletion, and a
//! read-through cache over the KV-backed user record.
//!
//! Grounded on `session/users.py::UserManager` (register/login/logout/
//! delete_account flow, single-active-session-per-user policy on login),
//! using the same connection-pool idiom as the rest of the KV layer for
//! the underlying calls. The in-process cache is a plain `DashMap` rather
//! than a TTL-bounded one:
//! entries are invalidated explicitly by the register/delete events instead
//! of expiring, since user records change far less often than sessions.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::connection_tracker::ConnectionTracker;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::kv::Kv;
use crate::models::{Role, User};
use crate::session_store::SessionStore;

fn kv_key(username: &str) -> String {
    format!("users:{username}")
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

pub struct UserStore {
    kv: Arc<Kv>,
    events: Arc<EventBus>,
    credentials: Arc<Credentials>,
    cache: DashMap<String, User>,
}

impl UserStore {
    pub fn new(kv: Arc<Kv>, events: Arc<EventBus>, credentials: Arc<Credentials>) -> Arc<Self> {
        let store = Arc::new(Self {
            kv,
            events,
            credentials,
            cache: DashMap::new(),
        });
        store.clone().spawn_cache_listener();
        store
    }

    /// React to remote register/delete events so this replica's cache never
    /// serves a record another replica just wrote or removed.
    fn spawn_cache_listener(self: Arc<Self>) {
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Event::UserRegistered { user }) | Ok(Event::UserInactiveCleanup { user }) => {
                        self.cache.remove(&user);
                    }
                    Ok(Event::UserDeleted { user }) => {
                        self.cache.remove(&user);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "user cache listener lagged, dropping stale entries");
                        self.cache.clear();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    pub async fn register(&self, username: &str, contact: &str, password: &str) -> Result<()> {
        if self.get(username).await?.is_some() {
            return Err(Error::Conflict(format!("username {username} already exists")));
        }

        let digest = self.credentials.hash_password(password)?;
        let user = User {
            username: username.to_string(),
            password_digest: digest,
            contact: contact.to_string(),
            role: Role::User,
            last_login: now(),
        };

        self.persist(&user).await?;
        self.events
            .publish(Event::UserRegistered { user: username.to_string() })
            .await?;

        Ok(())
    }

    /// Verify credentials, stamp last-login, tear down any prior session for
    /// this user, and establish a fresh session and non-WS connection.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        sessions: &SessionStore,
        connections: &ConnectionTracker,
    ) -> Result<(String, String)> {
        let mut user = self
            .get(username)
            .await?
            .ok_or_else(|| Error::Auth("invalid username or password".into()))?;

        if !self.credentials.verify_password(password, &user.password_digest)? {
            return Err(Error::Auth("invalid username or password".into()));
        }

        user.last_login = now();
        self.persist(&user).await?;

        if let Some(existing) = connections.get(username).await? {
            sessions.delete(&existing.session_id).await?;
            connections.remove(username).await?;
            self.events
                .publish(Event::SessionLogout {
                    user: username.to_string(),
                    session_id: existing.session_id,
                })
                .await?;
        }

        let (_, session_id) = sessions.get_or_create(username, "default", None).await?;
        connections.track(username, &session_id, false).await?;

        let token = self.credentials.issue(username, user.role)?;
        Ok((token, session_id))
    }

    pub async fn logout(&self, username: &str, connections: &ConnectionTracker) -> Result<()> {
        if let Some(conn) = connections.get(username).await? {
            connections.remove(username).await?;
            self.events
                .publish(Event::SessionLogout {
                    user: username.to_string(),
                    session_id: conn.session_id,
                })
                .await?;
        }
        Ok(())
    }

    pub async fn delete_account(
        &self,
        username: &str,
        sessions: &SessionStore,
        connections: &ConnectionTracker,
    ) -> Result<()> {
        self.delete(username).await?;
        sessions.cleanup_user_sessions(username).await?;
        connections.remove(username).await?;
        self.events
            .publish(Event::AccountDeleted { user: username.to_string() })
            .await?;
        Ok(())
    }

    pub async fn get(&self, username: &str) -> Result<Option<User>> {
        if let Some(user) = self.cache.get(username) {
            return Ok(Some(user.clone()));
        }

        let fields = self.kv.hgetall(&kv_key(username)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let user = User {
            username: username.to_string(),
            password_digest: fields.get("password_digest").cloned().unwrap_or_default(),
            contact: fields.get("contact").cloned().unwrap_or_default(),
            role: fields
                .get("role")
                .map(|s| s.parse::<Role>().unwrap_or(Role::User))
                .unwrap_or(Role::User),
            last_login: fields
                .get("last_login")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        };

        self.cache.insert(username.to_string(), user.clone());
        Ok(Some(user))
    }

    async fn persist(&self, user: &User) -> Result<()> {
        let key = kv_key(&user.username);
        let fields: [(&str, String); 4] = [
            ("password_digest", user.password_digest.clone()),
            ("contact", user.contact.clone()),
            ("role", user.role.as_str().to_string()),
            ("last_login", user.last_login.to_string()),
        ];
        self.kv.hset_multiple(&key, &fields).await?;
        self.cache.insert(user.username.clone(), user.clone());
        Ok(())
    }

    async fn delete(&self, username: &str) -> Result<()> {
        self.kv.del(&kv_key(username)).await?;
        self.cache.remove(username);
        Ok(())
    }
}
