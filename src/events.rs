//! Pub/sub event bus over the KV connection (C1's publish/subscribe half)
//!
//! Replaces duck-typed event payloads with a tagged sum type, per the
//! design notes: subscribers pattern-match on `Event` instead of parsing a
//! channel-name convention and a JSON blob by hand.

use std::sync::Arc;

use deadpool_redis::redis::AsyncCommands;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::kv::Kv;

/// Every cross-replica event the gateway publishes or reacts to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Event {
    UserRegistered { user: String },
    UserDeleted { user: String },
    UserInactiveCleanup { user: String },
    SessionNew { user: String, session_id: String },
    SessionUpdate { user: String, session_id: String },
    SessionLogout { user: String, session_id: String },
    SessionWriteFailed { user: String, session_id: String },
    ConnectionWs { user: String },
    ConnectionHttp { user: String },
    ConnectionRemoved { user: String },
    AccountDeleted { user: String },
}

impl Event {
    /// The pub/sub channel name this event is published on, following the
    /// `events:<domain>:<verb>:<user>` convention.
    pub fn channel(&self) -> String {
        match self {
            Event::UserRegistered { user } => format!("events:user:register:{user}"),
            Event::UserDeleted { user } => format!("events:user:delete:{user}"),
            Event::UserInactiveCleanup { user } => format!("events:user:inactive_cleanup:{user}"),
            Event::SessionNew { user, .. } => format!("events:session:new:{user}"),
            Event::SessionUpdate { user, .. } => format!("events:session:update:{user}"),
            Event::SessionLogout { user, .. } => format!("events:session:logout:{user}"),
            Event::SessionWriteFailed { user, .. } => format!("events:session:write_failed:{user}"),
            Event::ConnectionWs { user } => format!("events:connection:ws:{user}"),
            Event::ConnectionHttp { user } => format!("events:connection:http:{user}"),
            Event::ConnectionRemoved { user } => format!("events:connection:removed:{user}"),
            Event::AccountDeleted { user } => format!("events:account:deleted:{user}"),
        }
    }

    /// Extract the user this event concerns, used by subscribers filtering
    /// on channel-pattern wildcards.
    pub fn user(&self) -> &str {
        match self {
            Event::UserRegistered { user }
            | Event::UserDeleted { user }
            | Event::UserInactiveCleanup { user }
            | Event::SessionNew { user, .. }
            | Event::SessionUpdate { user, .. }
            | Event::SessionLogout { user, .. }
            | Event::SessionWriteFailed { user, .. }
            | Event::ConnectionWs { user }
            | Event::ConnectionHttp { user }
            | Event::ConnectionRemoved { user }
            | Event::AccountDeleted { user } => user,
        }
    }
}

/// Publishes events to the KV and fans in pattern-subscriptions into a
/// local broadcast channel that every in-process subscriber shares.
///
/// Grounded on `EventManager`'s `publish(channel, data)` wrapper: a thin
/// layer between domain components and the raw pub/sub primitive, with no
/// references back into the stores it serves (avoiding the cyclic-object-graph
/// smell called out in the design notes).
#[derive(Clone)]
pub struct EventBus {
    kv: Arc<Kv>,
    local: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(kv: Arc<Kv>) -> Self {
        let (local, _) = broadcast::channel(1024);
        Self { kv, local }
    }

    /// Publish an event to the KV pub/sub channel derived from its variant.
    /// Also fans it into the local broadcast channel so same-process
    /// subscribers (the reaper, the connection tracker's cross-replica
    /// logout listener) observe events this replica itself publishes.
    pub async fn publish(&self, event: Event) -> Result<()> {
        let channel = event.channel();
        let payload = serde_json::to_string(&event)?;

        let mut conn = self.kv.connection().await?;
        let _: i64 = conn.publish(&channel, payload).await?;

        let _ = self.local.send(event);
        Ok(())
    }

    /// Subscribe to every event published locally or relayed from the KV
    /// listener task (see `spawn_kv_relay`).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.local.subscribe()
    }

    /// Spawn a background task that subscribes to the gateway's pub/sub
    /// channel patterns on the KV and relays every message into the local
    /// broadcast channel, so that events published by *other* replicas
    /// reach this replica's in-process subscribers.
    ///
    /// Grounded on `wss/registry.py`'s `pubsub_listener`, generalized from a
    /// single `events:session:logout:*` subscription to every channel this
    /// gateway recognises.
    pub fn spawn_kv_relay(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let kv = self.kv.clone();
        let local = self.local.clone();

        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                match Self::run_relay_once(&kv, &local, &cancel).await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::warn!(error = %e, "pub/sub relay connection lost, reconnecting");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }

    async fn run_relay_once(
        kv: &Kv,
        local: &broadcast::Sender<Event>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let conn = kv.pubsub_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.psubscribe("events:*").await?;
        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = stream.next() => {
                    let Some(msg) = msg else { return Ok(()) };
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping non-utf8 pub/sub payload");
                            continue;
                        }
                    };
                    match serde_json::from_str::<Event>(&payload) {
                        Ok(event) => {
                            let _ = local.send(event);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping malformed pub/sub payload");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_naming_follows_convention() {
        let event = Event::SessionLogout {
            user: "alice".into(),
            session_id: "s1".into(),
        };
        assert_eq!(event.channel(), "events:session:logout:alice");
        assert_eq!(event.user(), "alice");
    }

    #[test]
    fn event_round_trips_through_json() {
        let event = Event::UserInactiveCleanup { user: "bob".into() };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.channel(), event.channel());
    }
}
