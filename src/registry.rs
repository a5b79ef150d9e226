//! Eventually-consistent in-memory mirror of the cluster: browser
//! sessions, worker pods and the pod-limit quota.
//!
//! The registry is the only mutable process-wide state. Each sub-map
//! sits behind its own `parking_lot::RwLock`; operations are O(1) and
//! never block on I/O while holding a lock. It is seeded from a full
//! list at startup and then reconciled from the platform watch channel,
//! so it may lag the cluster briefly. The proxy path never depends on it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::platform::{
    Event, EventType, Platform, PlatformObject, PlatformState, Quota, Service, Worker,
};

#[derive(Default)]
struct Inner {
    sessions: RwLock<HashMap<String, Service>>,
    workers: RwLock<HashMap<String, Worker>>,
    quota: RwLock<Option<Quota>>,
}

/// Shared cluster-state cache.
#[derive(Clone, Default)]
pub struct State {
    inner: Arc<Inner>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a full platform listing.
    pub fn seed(&self, state: PlatformState) {
        {
            let mut sessions = self.inner.sessions.write();
            for service in state.services {
                sessions.insert(service.session_id.clone(), service);
            }
        }
        let mut workers = self.inner.workers.write();
        for worker in state.workers {
            workers.insert(worker.name.clone(), worker);
        }
    }

    pub fn put_session(&self, service: Service) {
        if service.session_id.is_empty() {
            return;
        }
        self.inner
            .sessions
            .write()
            .insert(service.session_id.clone(), service);
    }

    pub fn delete_session(&self, session_id: &str) {
        self.inner.sessions.write().remove(session_id);
    }

    /// Snapshot of all known sessions with uptime filled in.
    pub fn sessions(&self) -> Vec<Service> {
        let sessions = self.inner.sessions.read();
        sessions
            .values()
            .map(|service| {
                let mut service = service.clone();
                let elapsed = (chrono::Utc::now() - service.started)
                    .to_std()
                    .unwrap_or_default();
                service.uptime = format!("{:.2}s", elapsed.as_secs_f64());
                service
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn put_worker(&self, worker: Worker) {
        self.inner
            .workers
            .write()
            .insert(worker.name.clone(), worker);
    }

    pub fn delete_worker(&self, name: &str) {
        self.inner.workers.write().remove(name);
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.read().len()
    }

    pub fn set_quota(&self, quota: Option<Quota>) {
        *self.inner.quota.write() = quota;
    }

    pub fn quota(&self) -> Option<Quota> {
        self.inner.quota.read().clone()
    }
}

/// Applies platform watch events to the cache and keeps the quota object
/// sized to `|workers| + session limit`. Quota writes are best effort;
/// failures are logged and the next event retries.
pub struct Reconciler {
    state: State,
    platform: Arc<dyn Platform>,
    session_limit: i64,
    manage_quota: bool,
}

impl Reconciler {
    pub fn new(
        state: State,
        platform: Arc<dyn Platform>,
        session_limit: i64,
        manage_quota: bool,
    ) -> Self {
        Self {
            state,
            platform,
            session_limit,
            manage_quota,
        }
    }

    /// Consume the watch channel until it closes. Meant to run as a
    /// dedicated background task for the life of the process.
    pub async fn run(self, mut events: mpsc::Receiver<Event>) {
        while let Some(event) = events.recv().await {
            self.apply(event).await;
        }
        tracing::warn!("platform watch channel closed");
    }

    async fn apply(&self, event: Event) {
        match event.object {
            PlatformObject::Service(service) => match event.event_type {
                EventType::Added | EventType::Updated => self.state.put_session(service),
                EventType::Deleted => self.state.delete_session(&service.session_id),
            },
            PlatformObject::Worker(worker) => {
                let name = worker.name.clone();
                match event.event_type {
                    EventType::Added | EventType::Updated => self.state.put_worker(worker),
                    EventType::Deleted => self.state.delete_worker(&name),
                }
                self.reconcile_quota_limit().await;
            }
            PlatformObject::Quota(quota) => match event.event_type {
                EventType::Added | EventType::Updated => self.state.set_quota(Some(quota)),
                EventType::Deleted => {
                    self.state.set_quota(None);
                    self.recreate_quota().await;
                }
            },
        }
    }

    fn desired_limit(&self) -> i64 {
        self.state.worker_count() as i64 + self.session_limit
    }

    async fn reconcile_quota_limit(&self) {
        if !self.manage_quota {
            return;
        }
        let desired = self.desired_limit();
        let current = self.state.quota().map(|q| q.current_max_limit);
        if current == Some(desired) {
            return;
        }
        match self.platform.quota_update(desired).await {
            Ok(quota) => self.state.set_quota(Some(quota)),
            Err(err) => tracing::warn!(%err, desired, "quota update failed"),
        }
    }

    async fn recreate_quota(&self) {
        if !self.manage_quota {
            return;
        }
        let desired = self.desired_limit();
        match self.platform.quota_create(desired).await {
            Ok(quota) => self.state.set_quota(Some(quota)),
            Err(err) => tracing::warn!(%err, desired, "quota recreate failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{
        DeletesPods, PlatformError, PodEvent, PodHandle, Quota, ServiceSpec, ServiceStatus,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream::BoxStream;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Platform stub that records quota writes.
    #[derive(Default)]
    struct QuotaRecorder {
        updates: Mutex<Vec<i64>>,
        creates: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl Platform for QuotaRecorder {
        async fn create_pod(&self, _spec: ServiceSpec) -> Result<Service, PlatformError> {
            unimplemented!("not used by the reconciler")
        }

        async fn watch_pod(
            &self,
            _name: &str,
            _deadline: Duration,
        ) -> Result<BoxStream<'static, PodEvent>, PlatformError> {
            unimplemented!("not used by the reconciler")
        }

        async fn delete_pod(&self, _name: &str) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn stream_logs(
            &self,
            _name: &str,
        ) -> Result<BoxStream<'static, std::io::Result<Bytes>>, PlatformError> {
            unimplemented!("not used by the reconciler")
        }

        async fn list(&self) -> Result<PlatformState, PlatformError> {
            Ok(PlatformState::default())
        }

        fn watch(&self) -> mpsc::Receiver<Event> {
            mpsc::channel(1).1
        }

        async fn quota_get(&self) -> Result<Quota, PlatformError> {
            Err(PlatformError::NotFound("quota".into()))
        }

        async fn quota_create(&self, limit: i64) -> Result<Quota, PlatformError> {
            self.creates.lock().push(limit);
            Ok(Quota {
                name: "selenosis-pod-limit".into(),
                current_max_limit: limit,
            })
        }

        async fn quota_update(&self, limit: i64) -> Result<Quota, PlatformError> {
            self.updates.lock().push(limit);
            Ok(Quota {
                name: "selenosis-pod-limit".into(),
                current_max_limit: limit,
            })
        }
    }

    struct NoopDeleter;

    #[async_trait]
    impl DeletesPods for NoopDeleter {
        async fn delete_pod(&self, _name: &str) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    fn service(id: &str, status: ServiceStatus) -> Service {
        Service {
            session_id: id.to_string(),
            url: url::Url::parse("http://example:4445").unwrap(),
            labels: Default::default(),
            handle: PodHandle::new(id, Arc::new(NoopDeleter)),
            status,
            started: chrono::Utc::now(),
            uptime: String::new(),
        }
    }

    fn worker(name: &str) -> Worker {
        Worker {
            name: name.to_string(),
            labels: Default::default(),
            status: ServiceStatus::Running,
            started: chrono::Utc::now(),
        }
    }

    fn event(event_type: EventType, object: PlatformObject) -> Event {
        Event { event_type, object }
    }

    #[test]
    fn sessions_add_update_delete() {
        let state = State::new();
        state.put_session(service("a", ServiceStatus::Pending));
        state.put_session(service("a", ServiceStatus::Running));
        state.put_session(service("b", ServiceStatus::Running));
        assert_eq!(state.session_count(), 2);

        state.delete_session("a");
        assert_eq!(state.session_count(), 1);
        assert_eq!(state.sessions()[0].session_id, "b");
    }

    #[test]
    fn empty_session_id_is_ignored() {
        let state = State::new();
        state.put_session(service("", ServiceStatus::Running));
        assert_eq!(state.session_count(), 0);
    }

    #[test]
    fn session_snapshot_has_uptime() {
        let state = State::new();
        let mut svc = service("a", ServiceStatus::Running);
        svc.started = chrono::Utc::now() - chrono::Duration::seconds(5);
        state.put_session(svc);
        let uptime = &state.sessions()[0].uptime;
        assert!(uptime.ends_with('s'), "uptime {uptime:?} not in seconds");
    }

    #[tokio::test]
    async fn worker_events_resize_quota() {
        let state = State::new();
        let platform = Arc::new(QuotaRecorder::default());
        let reconciler = Reconciler::new(state.clone(), platform.clone(), 10, true);

        reconciler
            .apply(event(
                EventType::Added,
                PlatformObject::Worker(worker("w1")),
            ))
            .await;
        assert_eq!(platform.updates.lock().as_slice(), &[11]);
        assert_eq!(state.quota().unwrap().current_max_limit, 11);

        reconciler
            .apply(event(
                EventType::Deleted,
                PlatformObject::Worker(worker("w1")),
            ))
            .await;
        assert_eq!(platform.updates.lock().as_slice(), &[11, 10]);
    }

    #[tokio::test]
    async fn quota_in_sync_is_left_alone() {
        let state = State::new();
        state.set_quota(Some(Quota {
            name: "selenosis-pod-limit".into(),
            current_max_limit: 11,
        }));
        let platform = Arc::new(QuotaRecorder::default());
        let reconciler = Reconciler::new(state.clone(), platform.clone(), 10, true);

        reconciler
            .apply(event(
                EventType::Added,
                PlatformObject::Worker(worker("w1")),
            ))
            .await;
        assert!(platform.updates.lock().is_empty());
    }

    #[tokio::test]
    async fn deleted_quota_is_recreated() {
        let state = State::new();
        let platform = Arc::new(QuotaRecorder::default());
        let reconciler = Reconciler::new(state.clone(), platform.clone(), 10, true);

        reconciler
            .apply(event(
                EventType::Deleted,
                PlatformObject::Quota(Quota {
                    name: "selenosis-pod-limit".into(),
                    current_max_limit: 10,
                }),
            ))
            .await;
        assert_eq!(platform.creates.lock().as_slice(), &[10]);
        assert_eq!(state.quota().unwrap().current_max_limit, 10);
    }

    #[tokio::test]
    async fn quota_management_can_be_disabled() {
        let state = State::new();
        let platform = Arc::new(QuotaRecorder::default());
        let reconciler = Reconciler::new(state.clone(), platform.clone(), 10, false);

        reconciler
            .apply(event(
                EventType::Added,
                PlatformObject::Worker(worker("w1")),
            ))
            .await;
        reconciler
            .apply(event(
                EventType::Deleted,
                PlatformObject::Quota(Quota {
                    name: "selenosis-pod-limit".into(),
                    current_max_limit: 10,
                }),
            ))
            .await;
        assert!(platform.updates.lock().is_empty());
        assert!(platform.creates.lock().is_empty());
        // Cache updates still happen.
        assert_eq!(state.worker_count(), 1);
    }

    #[tokio::test]
    async fn service_events_flow_into_cache() {
        let state = State::new();
        let platform = Arc::new(QuotaRecorder::default());
        let reconciler = Reconciler::new(state.clone(), platform, 10, false);

        reconciler
            .apply(event(
                EventType::Added,
                PlatformObject::Service(service("s1", ServiceStatus::Pending)),
            ))
            .await;
        reconciler
            .apply(event(
                EventType::Updated,
                PlatformObject::Service(service("s1", ServiceStatus::Running)),
            ))
            .await;
        assert_eq!(state.session_count(), 1);
        assert_eq!(state.sessions()[0].status, ServiceStatus::Running);

        reconciler
            .apply(event(
                EventType::Deleted,
                PlatformObject::Service(service("s1", ServiceStatus::Running)),
            ))
            .await;
        assert_eq!(state.session_count(), 0);
    }
}
