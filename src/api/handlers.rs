use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::json;
use url::Url;

use crate::platform::ServiceStatus;
use crate::proxy::http::{EXTERNAL_URL_HEADER, FORWARDED_HEADER};
use crate::proxy::ws::{self, ForwardedContext, WsHooks};
use crate::proxy::is_websocket_upgrade;
use crate::provisioner::ExternalBase;
use crate::routing::{uuid_to_ip, ip_authority, RoutingMode};

use super::error::ApiError;
use super::AppState;

/// Client-facing base of the gateway, from forwarded headers when an
/// ingress sits in front of us.
fn external_base(headers: &HeaderMap, fallback_host: &str) -> ExternalBase {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http")
        .to_string();
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())
        .unwrap_or(fallback_host)
        .to_string();
    ExternalBase { scheme, host }
}

fn session_id_param(params: &HashMap<String, String>) -> Result<&str, ApiError> {
    params
        .get("sessionId")
        .map(String::as_str)
        .filter(|id| !id.is_empty())
        .ok_or(ApiError::InvalidSessionId)
}

fn target_url(authority: &str, uri: &Uri, path: &str) -> Result<Url, ApiError> {
    let mut target = format!("http://{authority}{path}");
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }
    Url::parse(&target).map_err(|_| ApiError::InvalidSessionId)
}

pub(super) async fn create_session(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let external = external_base(&headers, &state.config.gateway_host);
    match state
        .provisioner
        .create_session(body, uri.path(), &external)
        .await
    {
        Ok(created) => (created.status, Json(created.body)).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Proxy a session-scoped request into its pod, as WebSocket when the
/// client asks for an upgrade and as plain HTTP otherwise.
pub(super) async fn proxy_session(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    req: Request<axum::body::Body>,
) -> Response {
    let session_id = match session_id_param(&params) {
        Ok(id) => id.to_string(),
        Err(err) => return err.into_response(),
    };

    let authority = match state.resolver.resolve(&session_id) {
        Ok(authority) => authority,
        Err(_) => {
            tracing::error!(session_id, "invalid session id");
            return ApiError::InvalidSessionId.into_response();
        }
    };

    let path = state.resolver.upstream_path(req.uri().path()).to_string();

    if is_websocket_upgrade(req.headers()) {
        return proxy_session_ws(state, req, &authority, &path, &session_id).await;
    }

    tracing::info!(session_id, %authority, "proxying session");

    let target = match target_url(&authority, req.uri(), &path) {
        Ok(target) => target,
        Err(err) => return err.into_response(),
    };

    let external = external_base(req.headers(), &state.config.gateway_host);
    let set_headers = forwarded_headers(&state, &external);
    state.proxy.forward(req, target, &set_headers).await
}

fn forwarded_headers(state: &AppState, external: &ExternalBase) -> Vec<(HeaderName, HeaderValue)> {
    let (name, value) = match state.resolver.mode() {
        RoutingMode::Dns => (FORWARDED_HEADER, state.config.gateway_host.clone()),
        RoutingMode::Ip => (EXTERNAL_URL_HEADER, external.to_url_string()),
    };
    match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
        (Ok(name), Ok(value)) => vec![(name, value)],
        _ => Vec::new(),
    }
}

async fn proxy_session_ws(
    state: AppState,
    req: Request<axum::body::Body>,
    authority: &str,
    path: &str,
    session_id: &str,
) -> Response {
    use axum::extract::FromRequestParts;

    let (mut parts, _body) = req.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let mut target = format!("ws://{authority}{path}");
    if let Some(query) = parts.uri.query() {
        target.push('?');
        target.push_str(query);
    }
    let target = match Url::parse(&target) {
        Ok(target) => target,
        Err(_) => return ApiError::InvalidSessionId.into_response(),
    };

    tracing::info!(session_id, %target, "proxying websocket session");

    let external = external_base(&parts.headers, &state.config.gateway_host);
    let forwarded = ForwardedContext {
        host: external.host.clone(),
        client_addr: parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.to_string()),
        tls: external.scheme == "https",
    };

    let id = session_id.to_string();
    let hooks = WsHooks {
        on_close: Some(std::sync::Arc::new(move || {
            tracing::info!(session_id = %id, "websocket session closed");
        })),
        ..WsHooks::default()
    };

    ws::serve(upgrade, target, &parts.headers, forwarded, hooks).await
}

/// WebSocket relay to the VNC server in the pod.
pub(super) async fn vnc(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let session_id = match session_id_param(&params) {
        Ok(id) => id.to_string(),
        Err(err) => return err.into_response(),
    };

    let authority = match state
        .resolver
        .resolve_port(&session_id, state.config.vnc_port)
    {
        Ok(authority) => authority,
        Err(_) => return ApiError::InvalidSessionId.into_response(),
    };

    tracing::info!(session_id, %authority, "vnc request");

    let stream = match tokio::net::TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(session_id, %authority, %err, "vnc connection error");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    upgrade.on_upgrade(move |socket| async move {
        ws::pipe_tcp(socket, stream).await;
        tracing::info!(session_id, "vnc client disconnected");
    })
}

/// WebSocket stream of the browser container's logs.
pub(super) async fn logs(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let session_id = match session_id_param(&params) {
        Ok(id) => id.to_string(),
        Err(err) => return err.into_response(),
    };

    if state.resolver.resolve(&session_id).is_err() {
        return ApiError::InvalidSessionId.into_response();
    }

    tracing::info!(session_id, "stream logs request");

    let stream = match state.platform.stream_logs(&session_id).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(session_id, %err, "stream logs error");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    upgrade.on_upgrade(move |socket| async move {
        ws::pipe_stream(socket, stream).await;
        tracing::info!(session_id, "stream logs disconnected");
    })
}

/// Direct HTTP route into the pod; the id always carries the address
/// here, whatever the gateway's session topology is.
pub(super) async fn direct_http(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    req: Request<axum::body::Body>,
) -> Response {
    let session_id = match session_id_param(&params) {
        Ok(id) => id.to_string(),
        Err(err) => return err.into_response(),
    };
    let Ok(id) = uuid::Uuid::parse_str(&session_id) else {
        return ApiError::InvalidSessionId.into_response();
    };

    let authority = ip_authority(uuid_to_ip(id), state.resolver.sidecar_port());
    tracing::info!(session_id, %authority, "proxying api request to browser");

    let target = match target_url(&authority, req.uri(), req.uri().path()) {
        Ok(target) => target,
        Err(err) => return err.into_response(),
    };
    state.proxy.forward(req, target, &[]).await
}

pub(super) async fn hub_status(State(state): State<AppState>) -> Response {
    Json(json!({
        "value": {
            "message": "selenosis up and running",
            "ready": state.state.session_count(),
        }
    }))
    .into_response()
}

pub(super) async fn full_status(State(state): State<AppState>) -> Response {
    let sessions = state.state.sessions();
    let pending = sessions
        .iter()
        .filter(|s| s.status == ServiceStatus::Pending)
        .count();
    let active: Vec<_> = sessions
        .into_iter()
        .filter(|s| s.status == ServiceStatus::Running)
        .collect();

    Json(json!({
        "status": StatusCode::OK.as_u16(),
        "version": state.config.build_version,
        "selenosis": {
            "total": state.config.session_limit,
            "active": active.len(),
            "pending": pending,
            "config": state.catalog.versions(),
            "sessions": active,
        }
    }))
    .into_response()
}

pub(super) async fn healthz() -> StatusCode {
    StatusCode::OK
}
