//! Route/handler registry (C9): the in-memory table backing dynamically
//! registered HTTP proxies and WS message handlers.
//!
//! Grounded on `urls_registry/manager.py::URLManager`. The HTTP layer's
//! route table is fixed at startup, so a single catch-all route at
//! `/api/proxy/:name` performs the per-request lookup instead of the
//! original's per-name route object that could be removed from the
//! router directly; "removable without restart" reduces to "absent from
//! this table."

use std::sync::Arc;

use dashmap::DashMap;
use reqwest::Method;
use serde::{Deserialize, Serialize};

/// A registered upstream, proxyable over HTTP and/or dispatched to from the
/// WS engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSpec {
    pub name: String,
    pub base_url: String,
    pub path: String,
    #[serde(with = "method_serde")]
    pub method: Method,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_require_auth")]
    pub require_auth: bool,
    #[serde(default)]
    pub ws_supported: bool,
}

fn default_timeout_secs() -> u64 {
    10
}
fn default_require_auth() -> bool {
    true
}

mod method_serde {
    use reqwest::Method;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(method: &Method, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(method.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Method, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Dynamic registry of proxy/handler specs, keyed by logical name.
///
/// Holds only data, not live axum route objects — the catch-all handler in
/// the HTTP layer and the WS engine's dispatch both consult this table on
/// every request rather than the router being mutated at runtime.
#[derive(Default)]
pub struct Registry {
    upstreams: DashMap<String, UpstreamSpec>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, spec: UpstreamSpec) {
        self.upstreams.insert(spec.name.clone(), spec);
    }

    /// Remove both the HTTP and WS mounts for `name`. Returns whether an
    /// entry existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.upstreams.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<UpstreamSpec> {
        self.upstreams.get(name).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<UpstreamSpec> {
        self.upstreams.iter().map(|e| e.value().clone()).collect()
    }

    /// Names registered with WS support, used by the engine to decide
    /// whether a message type should dispatch to a proxy handler.
    pub fn ws_handler_names(&self) -> Vec<String> {
        self.upstreams
            .iter()
            .filter(|e| e.value().ws_supported)
            .map(|e| e.key().clone())
            .collect()
    }
}

impl UpstreamSpec {
    /// This spec's static headers as a `reqwest::HeaderMap`, for use with
    /// the forwarder. Invalid header names/values are silently dropped
    /// rather than failing the whole request.
    pub fn headers_as_map(&self) -> reqwest::header::HeaderMap {
        let mut map = reqwest::header::HeaderMap::new();
        for (k, v) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                reqwest::header::HeaderValue::from_str(v),
            ) {
                map.insert(name, value);
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> UpstreamSpec {
        UpstreamSpec {
            name: name.to_string(),
            base_url: "https://example.com".into(),
            path: "/v1/widgets".into(),
            method: Method::GET,
            headers: Default::default(),
            timeout_secs: 10,
            require_auth: true,
            ws_supported: false,
        }
    }

    #[test]
    fn register_then_get_round_trips() {
        let registry = Registry::new();
        registry.register(spec("widgets"));
        assert!(registry.get("widgets").is_some());
    }

    #[test]
    fn unregister_removes_entry() {
        let registry = Registry::new();
        registry.register(spec("widgets"));
        assert!(registry.unregister("widgets"));
        assert!(registry.get("widgets").is_none());
        assert!(!registry.unregister("widgets"));
    }

    #[test]
    fn ws_handler_names_filters_by_support() {
        let registry = Registry::new();
        registry.register(spec("rest-only"));
        let mut ws = spec("ws-thing");
        ws.ws_supported = true;
        registry.register(ws);

        assert_eq!(registry.ws_handler_names(), vec!["ws-thing".to_string()]);
    }
}
