//! Process bootstrap: load config, install tracing, wire every component,
//! spawn background tasks, and serve until a termination signal arrives.

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt};

use gateway_edge::config::Config;
use gateway_edge::error::Result;
use gateway_edge::events::Event;
use gateway_edge::handlers;
use gateway_edge::health::{health, pool_metrics, readiness};
use gateway_edge::server::Server;
use gateway_edge::state::AppState;
use gateway_edge::websocket::{ws_connect, ws_health};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    install_tracing(&config.service.log_level);

    tracing::info!(service = %config.service.name, "starting gateway");

    let state = AppState::build(config.clone()).await?;
    let shutdown = CancellationToken::new();

    let flush_task = state.sessions.spawn_flush_task(shutdown.clone());
    let reaper_task = state.reaper.spawn(shutdown.clone());
    let relay_task = state.events.spawn_kv_relay(shutdown.clone());
    let dedup_task = spawn_dedup_janitor(state.clone(), shutdown.clone());

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/ready", get(readiness))
        .route("/metrics/pool", get(pool_metrics))
        .route("/ws/health", get(ws_health))
        .route("/ws/connect", get(ws_connect))
        .merge(handlers::router())
        .with_state(state);

    Server::new(config).serve(app).await?;

    shutdown.cancel();
    for task in [flush_task, reaper_task, relay_task, dedup_task] {
        let _ = task.await;
    }

    Ok(())
}

/// Periodically evicts expired de-duplication cache entries so the WS
/// engine's fingerprint table never grows unbounded, and evicts on demand
/// when a session's batched write fails, so a failed `update_api_key`
/// write doesn't leave the retry permanently suppressed.
fn spawn_dedup_janitor(state: AppState, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let interval = state.dedup_cleanup_interval();
    let mut write_failures = state.events.subscribe();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => state.ws_dedup.cleanup_expired(),
                event = write_failures.recv() => {
                    if let Ok(Event::SessionWriteFailed { user, session_id }) = event {
                        state.ws_dedup.evict(&user, &session_id, "update_api_key");
                    }
                }
            }
        }
    })
}

fn install_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    fmt().with_env_filter(filter).with_target(true).init();
}
