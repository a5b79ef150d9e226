//! Narrow contract over the container platform.
//!
//! The gateway only ever creates a pod, watches it to readiness, deletes
//! it, follows its logs, enumerates labeled pods, and consumes an
//! informer-style event channel. Everything Kubernetes-specific lives in
//! [`kubernetes`]; the rest of the crate programs against [`Platform`]
//! so tests can substitute a mock.

pub mod kubernetes;

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::sync::mpsc;
use url::Url;

use crate::capabilities::Capabilities;
use crate::catalog::BrowserTemplate;

/// Label carried by every pod this gateway manages.
pub const APP_LABEL: &str = "selenosis.app.type";
/// Label holding the session id on browser pods.
pub const SESSION_LABEL: &str = "session";
/// Name of the single pod-limit quota object.
pub const QUOTA_NAME: &str = "selenosis-pod-limit";

/// WebDriver port of the browser container.
pub const BROWSER_PORT: u16 = 4444;
/// VNC port of the browser container.
pub const VNC_PORT: u16 = 5900;
/// Video streaming port of the browser container.
pub const VIDEO_PORT: u16 = 6099;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("pod already exists")]
    AlreadyExists,
    #[error("pod quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("platform transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceStatus {
    Pending,
    Running,
    Unknown,
}

/// Phase transitions observed while waiting for a single pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
    Deleted,
}

/// One event from a per-pod watch.
#[derive(Debug, Clone)]
pub struct PodEvent {
    pub phase: PodPhase,
    pub pod_ip: Option<IpAddr>,
}

/// The slice of the platform a [`PodHandle`] needs to do its job.
#[async_trait]
pub trait DeletesPods: Send + Sync {
    async fn delete_pod(&self, name: &str) -> Result<(), PlatformError>;
}

/// Deletes its pod when asked. Stored in every [`Service`] so whoever
/// holds the session can tear the pod down; calling it more than once is
/// harmless because the delete is idempotent.
#[derive(Clone)]
pub struct PodHandle {
    name: String,
    client: Arc<dyn DeletesPods>,
}

impl PodHandle {
    pub fn new(name: impl Into<String>, client: Arc<dyn DeletesPods>) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a best-effort delete of the pod.
    pub fn cancel(&self) {
        let name = self.name.clone();
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(err) = client.delete_pod(&name).await {
                tracing::warn!(pod = %name, %err, "pod delete failed");
            }
        });
    }
}

impl fmt::Debug for PodHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PodHandle").field("name", &self.name).finish()
    }
}

/// A live browser workload.
#[derive(Clone, Serialize)]
pub struct Service {
    #[serde(rename = "id")]
    pub session_id: String,
    #[serde(skip)]
    pub url: Url,
    /// Snapshot of the capabilities the session was requested with.
    pub labels: BTreeMap<String, String>,
    #[serde(skip)]
    pub handle: PodHandle,
    #[serde(skip)]
    pub status: ServiceStatus,
    pub started: DateTime<Utc>,
    /// Human-readable age, filled in when listing.
    pub uptime: String,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("session_id", &self.session_id)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// A background non-browser pod counted into the quota.
#[derive(Debug, Clone, Serialize)]
pub struct Worker {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    #[serde(skip)]
    pub status: ServiceStatus,
    pub started: DateTime<Utc>,
}

/// The single named resource quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    pub name: String,
    pub current_max_limit: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub enum PlatformObject {
    Service(Service),
    Worker(Worker),
    Quota(Quota),
}

/// One event from the cluster-wide watch channel.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub object: PlatformObject,
}

/// Everything needed to create a browser pod.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub session_id: String,
    pub requested: Capabilities,
    pub template: BrowserTemplate,
}

/// Labeled pods currently known to the platform.
#[derive(Debug, Default)]
pub struct PlatformState {
    pub services: Vec<Service>,
    pub workers: Vec<Worker>,
}

#[async_trait]
pub trait Platform: Send + Sync {
    /// Submit the pod. Returns the service in `Pending` state; readiness
    /// is the caller's business.
    async fn create_pod(&self, spec: ServiceSpec) -> Result<Service, PlatformError>;

    /// Phase transitions for exactly this pod. The stream ends on the
    /// deadline, on deletion, or on a terminal phase.
    async fn watch_pod(
        &self,
        name: &str,
        deadline: Duration,
    ) -> Result<BoxStream<'static, PodEvent>, PlatformError>;

    /// Best-effort delete with a short grace period. Deleting a pod that
    /// is already gone is not an error.
    async fn delete_pod(&self, name: &str) -> Result<(), PlatformError>;

    /// Follow the browser container's logs until the stream is dropped.
    async fn stream_logs(
        &self,
        name: &str,
    ) -> Result<BoxStream<'static, std::io::Result<Bytes>>, PlatformError>;

    /// Enumerate labeled browser and worker pods.
    async fn list(&self) -> Result<PlatformState, PlatformError>;

    /// Informer-style channel of add/update/delete events across
    /// browsers, workers and the quota object. The channel never closes
    /// while the receiver is held.
    fn watch(&self) -> mpsc::Receiver<Event>;

    async fn quota_get(&self) -> Result<Quota, PlatformError>;

    /// Create the quota object; racing against an existing one falls
    /// back to reading it.
    async fn quota_create(&self, limit: i64) -> Result<Quota, PlatformError>;

    async fn quota_update(&self, limit: i64) -> Result<Quota, PlatformError>;
}
