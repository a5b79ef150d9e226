//! WebSocket reverse proxy and relay pipes.
//!
//! The proxy dials the upstream first, with the client's headers minus
//! everything handshake-specific, and only upgrades the client once the
//! upstream handshake succeeded. Frames are then pumped in both
//! directions until either side closes; shutdown runs exactly once and
//! sends a normal-closure frame to both peers under a one second write
//! deadline, so a disconnect on one side tears the other down within a
//! read cycle.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_DEADLINE: Duration = Duration::from_secs(1);

pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Observation points on an established pipe. Each must be
/// non-blocking; they run inline with frame pumping.
#[derive(Clone, Default)]
pub struct WsHooks {
    pub on_connect: Option<Hook>,
    pub on_message: Option<Hook>,
    pub on_close: Option<Hook>,
}

/// Headers never copied onto the upstream handshake: hop-by-hop and
/// everything the WebSocket client library generates itself. `Origin`
/// is dropped so upstream origin checks see a same-host request.
const HANDSHAKE_HEADERS: &[HeaderName] = &[
    header::CONNECTION,
    header::UPGRADE,
    header::SEC_WEBSOCKET_KEY,
    header::SEC_WEBSOCKET_VERSION,
    header::SEC_WEBSOCKET_ACCEPT,
    header::SEC_WEBSOCKET_EXTENSIONS,
    header::SEC_WEBSOCKET_PROTOCOL,
    header::CONTENT_LENGTH,
    header::HOST,
    header::ORIGIN,
];

fn filter_handshake_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if HANDSHAKE_HEADERS.contains(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Client-side context carried onto the upstream handshake.
#[derive(Debug, Clone, Default)]
pub struct ForwardedContext {
    /// Original `Host` the client connected to.
    pub host: String,
    /// Client socket address, when known.
    pub client_addr: Option<String>,
    /// Whether the client connection arrived over TLS.
    pub tls: bool,
}

/// Dial `target`, then upgrade the client and pipe frames both ways.
pub async fn serve(
    upgrade: WebSocketUpgrade,
    target: Url,
    client_headers: &HeaderMap,
    forwarded: ForwardedContext,
    hooks: WsHooks,
) -> Response {
    let mut request = match target.as_str().into_client_request() {
        Ok(request) => request,
        Err(err) => {
            tracing::error!(%target, %err, "invalid upstream websocket url");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let headers = request.headers_mut();
    for (name, value) in filter_handshake_headers(client_headers) {
        if let Some(name) = name {
            headers.append(name, value);
        }
    }
    if let Ok(value) = forwarded.host.parse() {
        headers.insert("x-forwarded-host", value);
    }
    let proto = if forwarded.tls { "wss" } else { "ws" };
    headers.insert(
        "x-forwarded-proto",
        axum::http::HeaderValue::from_static(proto),
    );
    if let Some(addr) = &forwarded.client_addr {
        if let Ok(value) = addr.parse() {
            headers.insert("x-forwarded-for", value);
        }
    }

    let (upstream, response) = match connect_async(request).await {
        Ok(ok) => ok,
        Err(err) => {
            tracing::error!(%target, %err, "upstream websocket dial failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    // Keep whatever subprotocol the upstream negotiated.
    let mut upgrade = upgrade;
    if let Some(protocol) = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
    {
        upgrade = upgrade.protocols([protocol.to_string()]);
    }

    upgrade.on_upgrade(move |client| pipe_ws(client, upstream, hooks))
}

fn client_to_upstream(msg: ws::Message) -> Option<UpstreamMessage> {
    match msg {
        ws::Message::Text(text) => Some(UpstreamMessage::Text(text.as_str().into())),
        ws::Message::Binary(data) => Some(UpstreamMessage::Binary(data)),
        ws::Message::Ping(data) => Some(UpstreamMessage::Ping(data)),
        ws::Message::Pong(data) => Some(UpstreamMessage::Pong(data)),
        ws::Message::Close(_) => None,
    }
}

fn upstream_to_client(msg: UpstreamMessage) -> Option<ws::Message> {
    match msg {
        UpstreamMessage::Text(text) => Some(ws::Message::Text(text.as_str().into())),
        UpstreamMessage::Binary(data) => Some(ws::Message::Binary(data)),
        UpstreamMessage::Ping(data) => Some(ws::Message::Ping(data)),
        UpstreamMessage::Pong(data) => Some(ws::Message::Pong(data)),
        UpstreamMessage::Close(_) | UpstreamMessage::Frame(_) => None,
    }
}

fn client_close_frame() -> ws::Message {
    ws::Message::Close(Some(ws::CloseFrame {
        code: ws::close_code::NORMAL,
        reason: "closing".into(),
    }))
}

fn upstream_close_frame() -> UpstreamMessage {
    UpstreamMessage::Close(Some(UpstreamCloseFrame {
        code: CloseCode::Normal,
        reason: "closing".into(),
    }))
}

/// Pump frames between the client and the upstream until either side
/// closes or errors, then shut both down.
pub async fn pipe_ws(client: WebSocket, upstream: Upstream, hooks: WsHooks) {
    if let Some(hook) = &hooks.on_connect {
        hook();
    }

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let latch = CancellationToken::new();

    let forward = {
        let latch = latch.clone();
        let on_message = hooks.on_message.clone();
        async move {
            loop {
                tokio::select! {
                    _ = latch.cancelled() => break,
                    msg = client_rx.next() => {
                        let Some(Ok(msg)) = msg else { break };
                        if let Some(hook) = &on_message {
                            hook();
                        }
                        let Some(out) = client_to_upstream(msg) else { break };
                        if upstream_tx.send(out).await.is_err() {
                            break;
                        }
                    }
                }
            }
            latch.cancel();
            upstream_tx
        }
    };

    let backward = {
        let latch = latch.clone();
        let on_message = hooks.on_message.clone();
        async move {
            loop {
                tokio::select! {
                    _ = latch.cancelled() => break,
                    msg = upstream_rx.next() => {
                        let Some(Ok(msg)) = msg else { break };
                        if let Some(hook) = &on_message {
                            hook();
                        }
                        let Some(out) = upstream_to_client(msg) else { break };
                        if client_tx.send(out).await.is_err() {
                            break;
                        }
                    }
                }
            }
            latch.cancel();
            client_tx
        }
    };

    let (mut upstream_tx, mut client_tx) = tokio::join!(forward, backward);

    // Single shutdown path: normal closure to both peers, best effort.
    let _ = tokio::time::timeout(CLOSE_DEADLINE, client_tx.send(client_close_frame())).await;
    let _ = tokio::time::timeout(CLOSE_DEADLINE, upstream_tx.send(upstream_close_frame())).await;

    if let Some(hook) = &hooks.on_close {
        hook();
    }
}

/// Pipe a WebSocket client to a raw TCP upstream (the VNC relay).
/// Client frames are written as-is; TCP bytes come back as binary
/// frames.
pub async fn pipe_tcp(client: WebSocket, stream: TcpStream) {
    let (mut tcp_rx, mut tcp_tx) = stream.into_split();
    let (mut client_tx, mut client_rx) = client.split();
    let latch = CancellationToken::new();

    let forward = {
        let latch = latch.clone();
        async move {
            loop {
                tokio::select! {
                    _ = latch.cancelled() => break,
                    msg = client_rx.next() => {
                        let data = match msg {
                            Some(Ok(ws::Message::Binary(data))) => data,
                            Some(Ok(ws::Message::Text(text))) => Bytes::from(text.as_str().to_owned()),
                            Some(Ok(ws::Message::Ping(_) | ws::Message::Pong(_))) => continue,
                            _ => break,
                        };
                        if tcp_tx.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                }
            }
            latch.cancel();
            let _ = tcp_tx.shutdown().await;
        }
    };

    let backward = {
        let latch = latch.clone();
        async move {
            let mut buf = [0u8; 4096];
            loop {
                tokio::select! {
                    _ = latch.cancelled() => break,
                    read = tcp_rx.read(&mut buf) => {
                        let n = match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        let frame = ws::Message::Binary(Bytes::copy_from_slice(&buf[..n]));
                        if client_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
            latch.cancel();
            client_tx
        }
    };

    let (_, mut client_tx) = tokio::join!(forward, backward);
    let _ = tokio::time::timeout(CLOSE_DEADLINE, client_tx.send(client_close_frame())).await;
}

/// Stream a byte source (container logs) to a WebSocket client as
/// binary frames. Client frames are only read to notice the disconnect.
pub async fn pipe_stream(client: WebSocket, mut source: BoxStream<'static, std::io::Result<Bytes>>) {
    let (mut client_tx, mut client_rx) = client.split();

    loop {
        tokio::select! {
            chunk = source.next() => {
                let Some(Ok(chunk)) = chunk else { break };
                if client_tx.send(ws::Message::Binary(chunk)).await.is_err() {
                    break;
                }
            }
            msg = client_rx.next() => {
                match msg {
                    Some(Ok(ws::Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => continue,
                }
            }
        }
    }

    let _ = tokio::time::timeout(CLOSE_DEADLINE, client_tx.send(client_close_frame())).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_headers_are_filtered() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "Upgrade".parse().unwrap());
        headers.insert(header::UPGRADE, "websocket".parse().unwrap());
        headers.insert(header::SEC_WEBSOCKET_KEY, "abc".parse().unwrap());
        headers.insert(header::ORIGIN, "http://evil.example".parse().unwrap());
        headers.insert(header::HOST, "gateway".parse().unwrap());
        headers.insert(header::AUTHORIZATION, "Bearer tok".parse().unwrap());
        headers.insert(header::COOKIE, "a=b".parse().unwrap());

        let filtered = filter_handshake_headers(&headers);
        assert!(filtered.get(header::CONNECTION).is_none());
        assert!(filtered.get(header::SEC_WEBSOCKET_KEY).is_none());
        assert!(filtered.get(header::ORIGIN).is_none());
        assert!(filtered.get(header::HOST).is_none());
        assert_eq!(filtered.get(header::AUTHORIZATION).unwrap(), "Bearer tok");
        assert_eq!(filtered.get(header::COOKIE).unwrap(), "a=b");
    }

    #[test]
    fn text_and_binary_frames_cross_the_boundary() {
        let msg = client_to_upstream(ws::Message::Text("hi".into())).unwrap();
        assert!(matches!(msg, UpstreamMessage::Text(t) if t.as_str() == "hi"));

        let msg = upstream_to_client(UpstreamMessage::Binary(Bytes::from_static(b"\x01\x02")))
            .unwrap();
        assert!(matches!(msg, ws::Message::Binary(b) if b.as_ref() == b"\x01\x02"));
    }

    #[test]
    fn close_frames_terminate_translation() {
        assert!(client_to_upstream(ws::Message::Close(None)).is_none());
        assert!(upstream_to_client(UpstreamMessage::Close(None)).is_none());
    }
}
