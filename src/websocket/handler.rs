//! Per-socket WS engine (C8): acceptance, heartbeat, and message dispatch
//! for a single connection.
//!
//! Grounded on `wss/manager.py::WebsocketsManager`'s `setup_routes` /
//! `_ping_loop` / `_inactivity_monitor` / `_message_loop` / `handle_ws_message`.
//! The original runs these as three concurrent `asyncio` tasks per socket
//! (ping, inactivity, receive) coordinated through a shared `ConnectionState`
//! and torn down from `cleanup()`; here the same three loops run as
//! `tokio::select!` arms over one task, with a writer task fed by an
//! `mpsc::Sender<Message>` standing in for the original's direct
//! `websocket.send_text` calls (axum's `WebSocket` can't be written to from
//! more than one place at once).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::error::Error;
use crate::models::Role;
use crate::state::AppState;

use super::messages::{self, InboundFrame};

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// Liveness bookkeeping for one socket, shared between the receive loop and
/// the two monitor loops via atomics rather than a mutex — each field is
/// written from exactly one task and read from the others.
struct ConnectionHealth {
    last_activity: AtomicI64,
    last_pong: AtomicI64,
}

impl ConnectionHealth {
    fn new() -> Self {
        let t = now_secs();
        Self {
            last_activity: AtomicI64::new(t),
            last_pong: AtomicI64::new(t),
        }
    }

    fn touch_activity(&self) {
        self.last_activity.store(now_secs(), Ordering::Relaxed);
    }

    fn touch_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> i64 {
        now_secs() - self.last_activity.load(Ordering::Relaxed)
    }

    fn since_pong(&self) -> i64 {
        now_secs() - self.last_pong.load(Ordering::Relaxed)
    }
}

/// Send the close frame with `code`/`reason`, best-effort.
async fn close_with(out: &mpsc::Sender<Message>, code: u16, reason: &'static str) {
    let _ = out
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Runs one accepted socket end to end. The upgrade itself always succeeds;
/// authentication and the session-match check happen here, after accept, so
/// a rejection is a clean WS close frame rather than an HTTP error.
pub async fn run_connection(socket: WebSocket, state: AppState, session_id: String, token: String) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let is_close = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || is_close {
                break;
            }
        }
    });

    let principal = match state.auth_gate.authorize(&token, Some(&session_id)).await {
        Ok(principal) => principal,
        Err(Error::SessionMismatch) => {
            close_with(&out_tx, 1008, "Session mismatch").await;
            drop(out_tx);
            let _ = writer.await;
            return;
        }
        Err(_) => {
            close_with(&out_tx, 1008, "Authentication failed").await;
            drop(out_tx);
            let _ = writer.await;
            return;
        }
    };
    let user_id = principal.user_id;
    let session_id = principal.session_id;
    let role = principal.role;

    if let Err(e) = state.connections.track(&user_id, &session_id, true).await {
        tracing::warn!(error = %e, user_id, "failed to record ws connection");
    }

    let cancel = state.connections.register_live_socket(&user_id);
    let health = Arc::new(ConnectionHealth::new());

    let welcome = messages::welcome_frame(
        &user_id,
        &session_id,
        &state.config.service.gateway_id(),
        state.config.websocket.ping_interval_secs,
        state.config.websocket.inactivity_timeout_secs,
    );
    if out_tx.send(Message::Text(welcome.to_string().into())).await.is_err() {
        state.connections.deregister_live_socket(&user_id);
        writer.abort();
        return;
    }

    let ping_task = tokio::spawn(ping_loop(out_tx.clone(), health.clone(), state.config.websocket.clone()));
    let inactivity_task = tokio::spawn(inactivity_monitor(out_tx.clone(), health.clone(), state.config.websocket.clone()));

    receive_loop(&mut stream, &out_tx, &state, &user_id, &session_id, &token, role, &health, cancel.clone()).await;

    ping_task.abort();
    inactivity_task.abort();
    let _ = out_tx.send(Message::Close(None)).await;
    drop(out_tx);
    let _ = writer.await;

    state.connections.deregister_live_socket(&user_id);
    if let Err(e) = state.connections.remove(&user_id).await {
        tracing::warn!(error = %e, user_id, "failed to clear ws connection record");
    }
}

/// Every `ping_interval`, send a ping; five seconds later check whether a
/// pong has arrived within `pong_timeout` and close if not.
async fn ping_loop(out: mpsc::Sender<Message>, health: Arc<ConnectionHealth>, config: crate::config::WebSocketConfig) {
    let mut ticker = tokio::time::interval(config.ping_interval());
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let frame = messages::ping_frame(now_secs());
        if out.send(Message::Text(frame.to_string().into())).await.is_err() {
            return;
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        if health.since_pong() > config.pong_timeout_secs as i64 {
            close_with(&out, 1008, "Pong timeout").await;
            return;
        }
    }
}

/// Every ten seconds, close the socket if nothing has arrived within
/// `inactivity_timeout`.
async fn inactivity_monitor(out: mpsc::Sender<Message>, health: Arc<ConnectionHealth>, config: crate::config::WebSocketConfig) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if health.idle_for() > config.inactivity_timeout_secs as i64 {
            close_with(&out, 1008, "Inactivity timeout").await;
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn receive_loop(
    stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    out: &mpsc::Sender<Message>,
    state: &AppState,
    user_id: &str,
    session_id: &str,
    token: &str,
    role: Role,
    health: &Arc<ConnectionHealth>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let reverify_every = state.config.websocket.reverify_interval();
    let mut since_reverify = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                close_with(out, 1000, "Session ended").await;
                return;
            }
            frame = stream.next() => {
                let Some(frame) = frame else { return };
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(_) => return,
                };

                match frame {
                    Message::Close(_) => return,
                    Message::Text(text) => {
                        health.touch_activity();
                        if let Err(e) = state.connections.update_timestamp(user_id).await {
                            tracing::warn!(error = %e, user_id, "failed to touch ws connection timestamp");
                        }

                        if handle_text(&text, out, state, user_id, session_id, role, health).await.is_err() {
                            return;
                        }
                    }
                    Message::Ping(payload) => {
                        health.touch_activity();
                        let _ = out.send(Message::Pong(payload)).await;
                    }
                    Message::Pong(_) => {
                        health.touch_activity();
                        health.touch_pong();
                    }
                    Message::Binary(_) => {
                        health.touch_activity();
                    }
                }

                if since_reverify.elapsed() >= reverify_every {
                    since_reverify = tokio::time::Instant::now();
                    if state.auth_gate.reverify(token, user_id, session_id).await.is_err() {
                        close_with(out, 1008, "Session no longer valid").await;
                        return;
                    }
                }
            }
        }
    }
}

/// Returns `Err` only when the socket itself should close; application-level
/// problems (bad JSON, forbidden message, handler failure) are reported as
/// an `error` frame and the loop continues.
async fn handle_text(
    text: &str,
    out: &mpsc::Sender<Message>,
    state: &AppState,
    user_id: &str,
    session_id: &str,
    role: Role,
    health: &Arc<ConnectionHealth>,
) -> Result<(), ()> {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => {
            let _ = out.send(Message::Text(messages::error_frame("invalid message format").to_string().into())).await;
            return Ok(());
        }
    };

    match frame.kind.as_str() {
        "ping" => {
            let _ = out.send(Message::Text(messages::pong_frame(now_secs()).to_string().into())).await;
            return Ok(());
        }
        "pong" => {
            health.touch_pong();
            return Ok(());
        }
        _ => {}
    }

    let allowed = state.ws_permissions.is_allowed(role, &frame.kind)
        || state
            .registry
            .get(&frame.kind)
            .map(|spec| !spec.require_auth)
            .unwrap_or(false);

    if !allowed {
        let _ = out
            .send(Message::Text(messages::error_frame(format!("not permitted: {}", frame.kind)).to_string().into()))
            .await;
        return Ok(());
    }

    if frame.kind == "update_api_key" {
        handle_api_key_update(&frame, out, state, user_id, session_id).await;
        return Ok(());
    }

    if state.registry.ws_handler_names().iter().any(|n| n == &frame.kind) {
        dispatch_dynamic(&frame, out, state, user_id, session_id).await;
        return Ok(());
    }

    let _ = out
        .send(Message::Text(messages::error_frame(format!("unknown message type: {}", frame.kind)).to_string().into()))
        .await;
    Ok(())
}

async fn handle_api_key_update(frame: &InboundFrame, out: &mpsc::Sender<Message>, state: &AppState, user_id: &str, session_id: &str) {
    let key = frame.key.clone().unwrap_or_default();

    let duplicate = state.ws_dedup.check_and_record(user_id, session_id, "update_api_key", &key);
    let ack = messages::ack_frame(&key, session_id, &state.config.service.gateway_id());
    let _ = out.send(Message::Text(ack.to_string().into())).await;

    if duplicate {
        return;
    }

    state
        .sessions
        .update(session_id, user_id, "default", serde_json::json!({ "api_key": key }))
        .await;
}

async fn dispatch_dynamic(frame: &InboundFrame, out: &mpsc::Sender<Message>, state: &AppState, user_id: &str, session_id: &str) {
    let Some(spec) = state.registry.get(&frame.kind) else {
        let _ = out.send(Message::Text(messages::error_frame(format!("handler error: {}", frame.kind)).to_string().into())).await;
        return;
    };

    let envelope = serde_json::json!({
        "user_id": user_id,
        "session_id": session_id,
        "message": frame.data,
    });

    let url = format!("{}{}", spec.base_url, spec.path);
    let result = state
        .forwarder
        .forward(&spec.name, spec.method.clone(), &url, spec.headers_as_map(), Some(envelope))
        .await;

    let response = match result {
        Ok(value) => messages::dynamic_response_frame(&frame.kind, value),
        Err(e) => {
            tracing::warn!(error = %e, handler = %frame.kind, "dynamic ws handler failed");
            messages::error_frame(format!("handler error: {}", frame.kind))
        }
    };
    let _ = out.send(Message::Text(response.to_string().into())).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_health_tracks_activity_and_pong() {
        let health = ConnectionHealth::new();
        assert!(health.idle_for() <= 1);
        assert!(health.since_pong() <= 1);
        health.touch_activity();
        health.touch_pong();
        assert!(health.idle_for() <= 1);
    }
}
