//! HTTP/WebSocket surface of the gateway.

pub mod error;
mod handlers;

use std::sync::Arc;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{any, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::platform::Platform;
use crate::provisioner::Provisioner;
use crate::proxy::http::HttpReverseProxy;
use crate::registry;
use crate::routing::AddressResolver;

use handlers::*;

/// Knobs the handlers need beyond their collaborators.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Advertised to sidecars in `X-Forwarded-Selenosis`, and the
    /// fallback external host when no forwarded headers are present.
    pub gateway_host: String,
    /// Configured session cap, reported as `total` in `/status`.
    pub session_limit: i64,
    pub build_version: String,
    /// Browser container port the VNC relay dials.
    pub vnc_port: u16,
}

#[derive(Clone)]
pub struct AppState {
    pub provisioner: Arc<Provisioner>,
    pub platform: Arc<dyn Platform>,
    pub state: registry::State,
    pub catalog: Arc<Catalog>,
    pub proxy: HttpReverseProxy,
    pub resolver: AddressResolver,
    pub config: Arc<GatewayConfig>,
}

/// Tag every request with an id for log correlation; the header also
/// travels upstream so the sidecar logs line up with ours.
async fn request_id(mut req: Request, next: Next) -> Response {
    let id = Uuid::new_v4().to_string();
    if let Ok(value) = id.parse() {
        req.headers_mut().insert("selenosis-request-id", value);
    }
    let span = tracing::info_span!(
        "request",
        request_id = %id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    next.run(req).instrument(span).await
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // WebDriver, with and without the /wd/hub prefix.
        .route("/session", post(create_session))
        .route("/session/{sessionId}", any(proxy_session))
        .route("/session/{sessionId}/{*rest}", any(proxy_session))
        .route("/wd/hub/session", post(create_session))
        .route("/wd/hub/session/{sessionId}", any(proxy_session))
        .route("/wd/hub/session/{sessionId}/{*rest}", any(proxy_session))
        .route("/wd/hub/status", get(hub_status))
        // Gateway surface.
        .route("/status", get(full_status))
        .route("/healthz", get(healthz))
        // Sidecar relays.
        .route("/vnc/{sessionId}", get(vnc))
        .route("/logs/{sessionId}", get(logs))
        .route("/devtools/{sessionId}", any(proxy_session))
        .route("/devtools/{sessionId}/{*rest}", any(proxy_session))
        .route("/download/{sessionId}", any(proxy_session))
        .route("/download/{sessionId}/{*rest}", any(proxy_session))
        .route("/clipboard/{sessionId}", any(proxy_session))
        .route("/clipboard/{sessionId}/{*rest}", any(proxy_session))
        // Direct pod route keyed by the IP embedded in the UUID.
        .route(
            "/selenosis/v1/sessions/{sessionId}/proxy/http/{*rest}",
            any(direct_http),
        )
        .layer(middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
