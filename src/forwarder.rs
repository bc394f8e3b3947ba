//! Upstream forwarder (C10): a single shared HTTP client wrapping every
//! outbound call with retry-with-backoff and a per-upstream circuit
//! breaker.
//!
//! Retry-with-backoff is grounded on `utils/auto_retry.py`'s decorator,
//! generalized from a fixed delay to exponential backoff with a bounded
//! max, matching the thresholds this gateway's configuration names. The
//! breaker itself is a small addition built in the same exponential-
//! backoff idiom, closed/open/half-open per upstream name.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;

use crate::config::ForwarderConfig;
use crate::error::{Error, Result, UpstreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Wraps `reqwest::Client` with retry/backoff and one breaker state machine
/// per upstream name, so a failing upstream never trips the breaker for
/// another.
pub struct Forwarder {
    client: Client,
    config: ForwarderConfig,
    breakers: DashMap<String, Breaker>,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Result<Arc<Self>> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(Error::Http)?;

        Ok(Arc::new(Self {
            client,
            config,
            breakers: DashMap::new(),
        }))
    }

    /// Forward a request to `upstream_name` at `url`, retrying on timeout,
    /// network error, 5xx, or 429, and refusing outright while that
    /// upstream's breaker is open.
    pub async fn forward(
        &self,
        upstream_name: &str,
        method: Method,
        url: &str,
        headers: reqwest::header::HeaderMap,
        body: Option<Value>,
    ) -> Result<Value> {
        if self.is_open(upstream_name) {
            return Err(Error::Upstream(UpstreamError::BreakerOpen));
        }

        let mut attempt = 0;
        let mut delay = self.config.retry_base_delay();

        loop {
            attempt += 1;
            let mut request = self.client.request(method.clone(), url).headers(headers.clone());
            if let Some(body) = &body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        self.record_success(upstream_name);
                        return response.json::<Value>().await.map_err(Error::Http);
                    }

                    if !is_retryable_status(status) || attempt >= self.config.retry_max_attempts {
                        self.record_failure(upstream_name);
                        let text = response.text().await.unwrap_or_default();
                        return Err(Error::Upstream(UpstreamError::Http(status.as_u16(), text)));
                    }
                }
                Err(e) => {
                    if attempt >= self.config.retry_max_attempts {
                        self.record_failure(upstream_name);
                        return Err(Error::Http(e));
                    }
                }
            }

            tracing::warn!(upstream_name, attempt, "upstream call failed, retrying in {delay:?}");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.config.retry_max_delay());
        }
    }

    fn is_open(&self, upstream_name: &str) -> bool {
        let mut breaker = self
            .breakers
            .entry(upstream_name.to_string())
            .or_insert_with(Breaker::closed);

        match breaker.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let recovery = self.config.circuit_recovery_timeout();
                if breaker.opened_at.map(|t| t.elapsed() >= recovery).unwrap_or(false) {
                    breaker.state = BreakerState::HalfOpen;
                    false
                } else {
                    true
                }
            }
            BreakerState::HalfOpen => false,
        }
    }

    fn record_success(&self, upstream_name: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(upstream_name) {
            breaker.state = BreakerState::Closed;
            breaker.consecutive_failures = 0;
            breaker.opened_at = None;
        }
    }

    fn record_failure(&self, upstream_name: &str) {
        let mut breaker = self
            .breakers
            .entry(upstream_name.to_string())
            .or_insert_with(Breaker::closed);

        breaker.consecutive_failures += 1;

        let threshold = self.config.circuit_failure_threshold;
        if breaker.consecutive_failures >= threshold && breaker.state != BreakerState::Open {
            breaker.state = BreakerState::Open;
            breaker.opened_at = Some(Instant::now());
            tracing::warn!(upstream_name, threshold, "circuit breaker opened");
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder() -> Arc<Forwarder> {
        Forwarder::new(ForwarderConfig {
            retry_max_attempts: 3,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            circuit_failure_threshold: 2,
            circuit_recovery_timeout_secs: 1,
            request_timeout_secs: 1,
        })
        .unwrap()
    }

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let forwarder = forwarder();
        forwarder.record_failure("svc");
        assert!(!forwarder.is_open("svc"));
        forwarder.record_failure("svc");
        assert!(forwarder.is_open("svc"));
    }

    #[test]
    fn breaker_does_not_affect_other_upstreams() {
        let forwarder = forwarder();
        forwarder.record_failure("svc-a");
        forwarder.record_failure("svc-a");
        assert!(forwarder.is_open("svc-a"));
        assert!(!forwarder.is_open("svc-b"));
    }

    #[test]
    fn success_resets_breaker() {
        let forwarder = forwarder();
        forwarder.record_failure("svc");
        forwarder.record_success("svc");
        forwarder.record_failure("svc");
        assert!(!forwarder.is_open("svc"));
    }
}
