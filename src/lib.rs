//! selenosis - Kubernetes-native Selenium hub
//!
//! A stateless gateway that accepts WebDriver protocol requests and, for
//! each new session, provisions a one-shot browser pod (browser container
//! plus a session-lifecycle sidecar), waits until it is reachable, relays
//! the session-creation request into it, and thereafter proxies every
//! WebDriver, VNC, log-streaming and DevTools request to that same pod
//! until the session ends.
//!
//! Architecture:
//! - API router: axum HTTP/WebSocket surface, one task per request
//! - Provisioner: drives capability resolution, pod creation, readiness
//!   and the bounded session-creation retry loop
//! - Platform: narrow contract over the Kubernetes API (create, watch,
//!   delete, logs, list, informer-style watch channel, quota)
//! - Registry: eventually-consistent in-memory mirror of browser and
//!   worker pods plus the pod-limit quota, fed by the platform watch
//! - Proxies: single-shot HTTP reverse proxy and a bidirectional
//!   WebSocket pipe (WS upstream, raw TCP for VNC, log streams)

pub mod api;
pub mod capabilities;
pub mod catalog;
pub mod payload;
pub mod platform;
pub mod provisioner;
pub mod proxy;
pub mod registry;
pub mod routing;
