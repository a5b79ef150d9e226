//! WebDriver response payload rewriting.
//!
//! When session ids carry routing information (the IP-in-UUID topology),
//! the id the upstream driver minted must be replaced with the gateway's
//! id before the response reaches the client, and any WebSocket endpoint
//! the driver advertised (`webSocketUrl` for BiDi, `se:cdp` for
//! Chrome DevTools) must be rewritten to point back through the gateway.

use serde_json::{Map, Value};
use url::Url;

/// A decoded WebDriver response body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload(pub Map<String, Value>);

impl Payload {
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Session id from either the legacy top-level `sessionId` or the
    /// W3C `value.sessionId`.
    pub fn session_id(&self) -> Option<&str> {
        if let Some(id) = self.0.get("sessionId").and_then(Value::as_str) {
            return Some(id);
        }
        self.0
            .get("value")
            .and_then(Value::as_object)
            .and_then(|v| v.get("sessionId"))
            .and_then(Value::as_str)
    }

    /// Replace the nested `value.sessionId`. Payloads that carry a
    /// top-level `sessionId` are legacy-shaped and left alone. Returns
    /// whether a rewrite happened.
    pub fn update_session_id(&mut self, session_id: &str) -> bool {
        if self.0.get("sessionId").map(Value::is_string) == Some(true) {
            return false;
        }
        if let Some(value) = self.0.get_mut("value").and_then(Value::as_object_mut) {
            if value.get("sessionId").map(Value::is_string) == Some(true) {
                value.insert("sessionId".to_string(), Value::String(session_id.to_string()));
                return true;
            }
        }
        false
    }

    /// Rewrite the BiDi `webSocketUrl` capability to go through the
    /// gateway.
    pub fn rewrite_bidi_url(&mut self, scheme: &str, host: &str, old_id: &str, new_id: &str) {
        self.rewrite_capability_url("webSocketUrl", scheme, host, old_id, new_id);
    }

    /// Rewrite the Chrome `se:cdp` DevTools endpoint.
    pub fn rewrite_cdp_url(&mut self, scheme: &str, host: &str, old_id: &str, new_id: &str) {
        self.rewrite_capability_url("se:cdp", scheme, host, old_id, new_id);
    }

    fn rewrite_capability_url(
        &mut self,
        prop: &str,
        scheme: &str,
        host: &str,
        old_id: &str,
        new_id: &str,
    ) {
        let Some(caps) = self
            .0
            .get_mut("value")
            .and_then(Value::as_object_mut)
            .and_then(|v| v.get_mut("capabilities"))
            .and_then(Value::as_object_mut)
        else {
            return;
        };
        let Some(raw) = caps.get(prop).and_then(Value::as_str) else {
            return;
        };
        if raw.is_empty() {
            return;
        }
        let Ok(mut url) = Url::parse(raw) else {
            return;
        };
        if url.set_scheme(scheme).is_err() {
            return;
        }
        let (host_only, port) = split_authority(host);
        if url.set_host(Some(host_only)).is_err() {
            return;
        }
        if url.set_port(port).is_err() {
            return;
        }
        let path = url.path().replacen(old_id, new_id, 1);
        url.set_path(&path);
        caps.insert(prop.to_string(), Value::String(url.to_string()));
    }
}

fn split_authority(host: &str) -> (&str, Option<u16>) {
    match host.rsplit_once(':') {
        Some((h, p)) if !p.contains(']') => match p.parse() {
            Ok(port) => (h, Some(port)),
            Err(_) => (host, None),
        },
        _ => (host, None),
    }
}
