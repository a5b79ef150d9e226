//! Single-shot HTTP reverse proxy.
//!
//! Built on one process-wide `reqwest::Client`; the transport is
//! constructed once at startup and handed to everything that forwards
//! requests. Bodies stream through in both directions, so large
//! screenshots and downloads never buffer fully in the gateway.

use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use url::Url;

/// Identifies this gateway to the sidecar (DNS routing mode).
pub const FORWARDED_HEADER: &str = "x-forwarded-selenosis";
/// External base URL of the gateway (IP routing mode); the sidecar uses
/// it to rewrite endpoint URLs it hands to the client.
pub const EXTERNAL_URL_HEADER: &str = "x-selenosis-external-url";

/// Headers that belong to a single hop and must not be forwarded.
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// The shared upstream transport: 30 s dial timeout, keep-alive,
/// redirects surfaced to the caller rather than followed.
pub fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
}

/// Forwards one request to one upstream.
#[derive(Clone)]
pub struct HttpReverseProxy {
    client: reqwest::Client,
}

impl HttpReverseProxy {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Send the request to `target`, overlaying `set_headers`, and relay
    /// the upstream response. Transport failures become `502`.
    pub async fn forward(
        &self,
        req: Request,
        target: Url,
        set_headers: &[(HeaderName, HeaderValue)],
    ) -> Response {
        let (parts, body) = req.into_parts();

        let mut headers = parts.headers;
        strip_hop_headers(&mut headers);
        for (name, value) in set_headers {
            headers.insert(name.clone(), value.clone());
        }

        let upstream = self
            .client
            .request(parts.method, target.clone())
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await;

        let upstream = match upstream {
            Ok(resp) => resp,
            Err(err) => {
                tracing::error!(%target, %err, "upstream request failed");
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_headers(&mut headers);

        let mut response = Response::builder()
            .status(status)
            .body(Body::from_stream(upstream.bytes_stream()))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
        *response.headers_mut() = headers;
        response
    }
}
