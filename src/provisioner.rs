//! Session provisioning: from a capabilities payload to a relayed
//! session-creation response.
//!
//! The happy path walks resolve, create, await-pod, await-http, relay.
//! Every step past pod creation is covered by a deadline, and a drop
//! guard deletes the pod on any failure or client disconnect, so an
//! abandoned handshake never leaks a browser.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use bytes::Bytes;
use futures::StreamExt;
use tokio::time::timeout;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::capabilities::SessionRequest;
use crate::catalog::{BrowserTemplate, Catalog};
use crate::payload::Payload;
use crate::platform::{Platform, PodHandle, PodPhase, ServiceSpec};
use crate::proxy::http::{EXTERNAL_URL_HEADER, FORWARDED_HEADER};
use crate::routing::{ip_authority, ip_to_uuid, strip_hub_prefix, RoutingMode};

/// Poll interval while waiting for the browser's HTTP server.
const READINESS_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub mode: RoutingMode,
    /// Headless service name (DNS routing mode).
    pub service: String,
    pub sidecar_port: u16,
    /// WebDriver port of the browser container, probed for readiness.
    pub browser_port: u16,
    /// Advertised in `X-Forwarded-Selenosis`.
    pub gateway_host: String,
    /// Relay attempts before giving up.
    pub attempts: usize,
    /// Deadline per relay attempt.
    pub wait_timeout: Duration,
    /// Deadline for the pod phase watch and again for HTTP readiness.
    pub readiness_timeout: Duration,
}

/// Where the gateway is reachable from the client's point of view,
/// derived from forwarded headers. The sidecar and the BiDi URL rewrite
/// both need it.
#[derive(Debug, Clone)]
pub struct ExternalBase {
    pub scheme: String,
    pub host: String,
}

impl ExternalBase {
    pub fn to_url_string(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }

    pub fn ws_scheme(&self) -> &'static str {
        if self.scheme == "https" {
            "wss"
        } else {
            "ws"
        }
    }
}

/// Successful outcome: the upstream's decoded response, relayed as-is
/// apart from IP-mode session-id rewriting.
#[derive(Debug)]
pub struct CreatedSession {
    pub status: StatusCode,
    pub body: serde_json::Value,
    pub session_id: String,
}

/// Deletes the pod unless the handshake completed.
struct CancelGuard {
    handle: Option<PodHandle>,
}

impl CancelGuard {
    fn new(handle: PodHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    fn defuse(&mut self) {
        self.handle.take();
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::info!(pod = handle.name(), "cancelling browser pod");
            handle.cancel();
        }
    }
}

pub struct Provisioner {
    platform: Arc<dyn Platform>,
    catalog: Arc<Catalog>,
    client: reqwest::Client,
    cfg: ProvisionerConfig,
}

impl Provisioner {
    pub fn new(
        platform: Arc<dyn Platform>,
        catalog: Arc<Catalog>,
        client: reqwest::Client,
        cfg: ProvisionerConfig,
    ) -> Self {
        Self {
            platform,
            catalog,
            client,
            cfg,
        }
    }

    /// Drive a session-creation request end to end.
    ///
    /// `request_path` is the path the client used (with or without the
    /// `/wd/hub` prefix); `external` is the gateway's client-facing
    /// base. If the caller disconnects, this future is dropped and the
    /// guard deletes the pod.
    pub async fn create_session(
        &self,
        body: Bytes,
        request_path: &str,
        external: &ExternalBase,
    ) -> Result<CreatedSession, ApiError> {
        let request = SessionRequest::parse(&body)
            .map_err(|err| ApiError::InvalidArgument(err.to_string()))?;

        let (caps, template) = self.resolve(&request)?;

        let session_id = format!("{}-{}", sanitize_image(&template.image), Uuid::new_v4());
        tracing::info!(
            session_id = %session_id,
            image = %template.image,
            "starting browser"
        );

        let service = self
            .platform
            .create_pod(ServiceSpec {
                session_id: session_id.clone(),
                requested: caps,
                template,
            })
            .await
            .map_err(|err| {
                ApiError::SessionNotCreated(format!("failed to start browser: {err}"))
            })?;

        let mut guard = CancelGuard::new(service.handle.clone());

        let pod_ip = self.await_pod(&session_id).await?;
        self.await_http(&session_id, pod_ip).await?;
        let (status, body, session_id) = self
            .relay(&session_id, pod_ip, body, request_path, external)
            .await?;

        guard.defuse();
        tracing::info!(session_id = %session_id, "browser session created");
        Ok(CreatedSession {
            status,
            body,
            session_id,
        })
    }

    /// First `firstMatch` candidate the catalog recognizes wins; with no
    /// match the last catalog error reaches the client.
    fn resolve(
        &self,
        request: &SessionRequest,
    ) -> Result<(crate::capabilities::Capabilities, BrowserTemplate), ApiError> {
        let mut last_err = None;
        for caps in request.candidates() {
            match self
                .catalog
                .find(caps.browser_name(), caps.browser_version())
            {
                Ok(template) => return Ok((caps, template)),
                Err(err) => last_err = Some(err),
            }
        }
        let err = last_err.map(|e| e.to_string()).unwrap_or_else(|| {
            "no capabilities requested".to_string()
        });
        Err(ApiError::InvalidArgument(err))
    }

    /// Consume pod phase events until the pod runs (and, in IP mode, has
    /// an address). Terminal phases and deletion are failures.
    async fn await_pod(&self, session_id: &str) -> Result<Option<IpAddr>, ApiError> {
        let stream = self
            .platform
            .watch_pod(session_id, self.cfg.readiness_timeout)
            .await
            .map_err(|err| {
                ApiError::SessionNotCreated(format!("failed to watch pod status: {err}"))
            })?;

        let need_ip = self.cfg.mode == RoutingMode::Ip;
        let wait = async move {
            let mut stream = stream;
            let mut pod_ip = None;
            while let Some(event) = stream.next().await {
                if event.pod_ip.is_some() {
                    pod_ip = event.pod_ip;
                }
                match event.phase {
                    PodPhase::Pending => continue,
                    PodPhase::Running => {
                        if need_ip && pod_ip.is_none() {
                            continue;
                        }
                        return Ok(pod_ip);
                    }
                    PodPhase::Succeeded | PodPhase::Failed => {
                        return Err("pod exited early".to_string())
                    }
                    PodPhase::Deleted => {
                        return Err("pod was deleted before becoming available".to_string())
                    }
                    PodPhase::Unknown => return Err("couldn't obtain pod state".to_string()),
                }
            }
            Err("pod wasn't running".to_string())
        };

        match timeout(self.cfg.readiness_timeout, wait).await {
            Ok(Ok(pod_ip)) => Ok(pod_ip),
            Ok(Err(reason)) => Err(ApiError::SessionNotCreated(format!(
                "pod is not ready after creation: {reason}"
            ))),
            Err(_) => Err(ApiError::SessionNotCreated(
                "pod is not ready after creation: readiness deadline exceeded".to_string(),
            )),
        }
    }

    /// HEAD-poll the browser's WebDriver port until anything answers.
    async fn await_http(&self, session_id: &str, pod_ip: Option<IpAddr>) -> Result<(), ApiError> {
        let authority = self.authority(session_id, pod_ip, self.cfg.browser_port);
        let url = format!("http://{authority}/");

        let probe = async {
            loop {
                match self.client.head(&url).send().await {
                    Ok(_) => return,
                    Err(_) => tokio::time::sleep(READINESS_POLL).await,
                }
            }
        };

        timeout(self.cfg.readiness_timeout, probe)
            .await
            .map_err(|_| {
                tracing::warn!(session_id, "browser http server never came up");
                ApiError::SessionNotCreated(format!("container service is not ready {url}"))
            })
    }

    /// Relay the original body into the pod under the bounded-attempt
    /// protocol: timeouts retry until the budget runs out, 404s retry
    /// immediately, anything else is the answer.
    async fn relay(
        &self,
        session_id: &str,
        pod_ip: Option<IpAddr>,
        body: Bytes,
        request_path: &str,
        external: &ExternalBase,
    ) -> Result<(StatusCode, serde_json::Value, String), ApiError> {
        let authority = self.authority(session_id, pod_ip, self.cfg.sidecar_port);
        let path = match self.cfg.mode {
            RoutingMode::Dns => request_path,
            RoutingMode::Ip => strip_hub_prefix(request_path),
        };
        let url = format!("http://{authority}{path}");

        let mut attempt = 0;
        let response = loop {
            attempt += 1;

            let mut request = self
                .client
                .post(&url)
                .header(axum::http::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
            request = match self.cfg.mode {
                RoutingMode::Dns => request.header(FORWARDED_HEADER, &self.cfg.gateway_host),
                RoutingMode::Ip => request.header(EXTERNAL_URL_HEADER, external.to_url_string()),
            };

            match timeout(self.cfg.wait_timeout, request.send()).await {
                Err(_) => {
                    tracing::warn!(session_id, attempt, "session attempt timeout");
                    if attempt < self.cfg.attempts {
                        continue;
                    }
                    return Err(ApiError::RetryExceeded);
                }
                Ok(Err(err)) => {
                    tracing::error!(session_id, attempt, %err, "session attempt failed");
                    return Err(ApiError::RetryExceeded);
                }
                Ok(Ok(response)) if response.status() == StatusCode::NOT_FOUND => {
                    tracing::debug!(session_id, attempt, "upstream still warming up");
                    if attempt < self.cfg.attempts {
                        continue;
                    }
                    return Err(ApiError::RetryExceeded);
                }
                Ok(Ok(response)) => break response,
            }
        };

        let status = response.status();
        let raw = response
            .bytes()
            .await
            .map_err(|_| ApiError::UpstreamResponse)?;
        let mut value: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|_| ApiError::UpstreamResponse)?;

        let mut session_id = session_id.to_string();
        if self.cfg.mode == RoutingMode::Ip {
            if let Some(ip) = pod_ip {
                session_id = ip_to_uuid(ip).to_string();
                value = rewrite_response(value, &session_id, external);
            }
        }

        Ok((status, value, session_id))
    }

    fn authority(&self, session_id: &str, pod_ip: Option<IpAddr>, port: u16) -> String {
        match pod_ip {
            Some(ip) if self.cfg.mode == RoutingMode::Ip => ip_authority(ip, port),
            _ => crate::routing::dns_authority(session_id, &self.cfg.service, port),
        }
    }
}

/// Swap the driver's session id for the routable one and point BiDi and
/// CDP endpoints back through the gateway.
fn rewrite_response(
    value: serde_json::Value,
    new_id: &str,
    external: &ExternalBase,
) -> serde_json::Value {
    let Some(mut payload) = Payload::from_value(value.clone()) else {
        return value;
    };
    let old_id = payload.session_id().map(str::to_string);
    payload.update_session_id(new_id);
    if let Some(old_id) = old_id {
        let scheme = external.ws_scheme();
        payload.rewrite_bidi_url(scheme, &external.host, &old_id, new_id);
        payload.rewrite_cdp_url(scheme, &external.host, &old_id, new_id);
    }
    payload.into_value()
}

/// Pod-name prefix from a container image: the last path fragment with
/// anything outside `[a-z0-9]` collapsed to dashes.
fn sanitize_image(image: &str) -> String {
    let fragment = image.rsplit('/').next().unwrap_or(image);
    if fragment.is_empty() {
        return "browser".to_string();
    }
    let mut out = String::with_capacity(fragment.len());
    let mut last_dash = false;
    for c in fragment.to_ascii_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "browser".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_image_keeps_tag_fragment() {
        assert_eq!(
            sanitize_image("selenoid/vnc:chrome_92.0"),
            "vnc-chrome-92-0"
        );
    }

    #[test]
    fn sanitize_image_plain_name() {
        assert_eq!(sanitize_image("chrome"), "chrome");
    }

    #[test]
    fn sanitize_image_registry_path() {
        assert_eq!(
            sanitize_image("registry.local:5000/browsers/Firefox:89.0"),
            "firefox-89-0"
        );
    }

    #[test]
    fn sanitize_image_empty_falls_back() {
        assert_eq!(sanitize_image(""), "browser");
        assert_eq!(sanitize_image("!!!"), "browser");
    }

    #[test]
    fn rewrite_response_swaps_nested_session_id() {
        let external = ExternalBase {
            scheme: "http".to_string(),
            host: "hub.example:4444".to_string(),
        };
        let value = json!({
            "value": {
                "sessionId": "driver-id",
                "capabilities": {
                    "webSocketUrl": "ws://10.0.0.9:4445/session/driver-id/bidi"
                }
            }
        });
        let out = rewrite_response(value, "routable-id", &external);
        assert_eq!(out["value"]["sessionId"], "routable-id");
        assert_eq!(
            out["value"]["capabilities"]["webSocketUrl"],
            "ws://hub.example:4444/session/routable-id/bidi"
        );
    }

    #[test]
    fn rewrite_response_leaves_legacy_shape() {
        let external = ExternalBase {
            scheme: "http".to_string(),
            host: "hub".to_string(),
        };
        let value = json!({"sessionId": "driver-id", "status": 0});
        let out = rewrite_response(value, "routable-id", &external);
        assert_eq!(out["sessionId"], "driver-id");
    }

    #[test]
    fn external_base_ws_scheme() {
        let http = ExternalBase {
            scheme: "http".into(),
            host: "h".into(),
        };
        let https = ExternalBase {
            scheme: "https".into(),
            host: "h".into(),
        };
        assert_eq!(http.ws_scheme(), "ws");
        assert_eq!(https.ws_scheme(), "wss");
    }
}
