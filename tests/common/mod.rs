//! Shared harness for gateway integration tests: a platform mock, a
//! stub upstream, and a fully wired gateway bound to a loopback socket.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use url::Url;

use selenosis::api::{self, AppState, GatewayConfig};
use selenosis::catalog::Catalog;
use selenosis::platform::{
    DeletesPods, Event, Platform, PlatformError, PlatformState, PodEvent, PodHandle, PodPhase,
    Quota, Service, ServiceSpec, ServiceStatus, Worker,
};
use selenosis::provisioner::{Provisioner, ProvisionerConfig};
use selenosis::proxy::http::HttpReverseProxy;
use selenosis::registry::State;
use selenosis::routing::{AddressResolver, RoutingMode};

pub const BROWSERS_CONFIG: &str = r#"
chrome:
  defaultVersion: "68.0"
  path: /
  versions:
    "68.0":
      image: selenoid/vnc:chrome_68.0
    "92.0":
      image: selenoid/vnc:chrome_92.0
"#;

/// Records pod deletions so tests can assert cleanup happened.
#[derive(Clone, Default)]
pub struct DeleteLog {
    deleted: Arc<Mutex<Vec<String>>>,
}

impl DeleteLog {
    pub fn names(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    pub async fn wait_for_delete(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !self.deleted.lock().is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[async_trait]
impl DeletesPods for DeleteLog {
    async fn delete_pod(&self, name: &str) -> Result<(), PlatformError> {
        self.deleted.lock().push(name.to_string());
        Ok(())
    }
}

/// In-memory platform: pods "run" immediately at a fixed IP and log
/// lines are canned.
pub struct MockPlatform {
    pub pod_ip: IpAddr,
    pub created: Mutex<Vec<String>>,
    pub deletes: DeleteLog,
    pub log_lines: Vec<&'static str>,
    watch_senders: Mutex<Vec<mpsc::Sender<Event>>>,
}

impl MockPlatform {
    pub fn new(pod_ip: IpAddr) -> Self {
        Self {
            pod_ip,
            created: Mutex::new(Vec::new()),
            deletes: DeleteLog::default(),
            log_lines: vec!["chromedriver started\n", "listening on 4444\n"],
            watch_senders: Mutex::new(Vec::new()),
        }
    }

    pub fn loopback() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn create_pod(&self, spec: ServiceSpec) -> Result<Service, PlatformError> {
        self.created.lock().push(spec.session_id.clone());
        Ok(Service {
            url: Url::parse(&format!("http://{}:4445", self.pod_ip)).unwrap(),
            labels: spec.requested.to_label_map(),
            handle: PodHandle::new(&spec.session_id, Arc::new(self.deletes.clone())),
            status: ServiceStatus::Pending,
            started: chrono::Utc::now(),
            uptime: String::new(),
            session_id: spec.session_id,
        })
    }

    async fn watch_pod(
        &self,
        _name: &str,
        _deadline: Duration,
    ) -> Result<BoxStream<'static, PodEvent>, PlatformError> {
        let events = vec![
            PodEvent {
                phase: PodPhase::Pending,
                pod_ip: None,
            },
            PodEvent {
                phase: PodPhase::Running,
                pod_ip: Some(self.pod_ip),
            },
        ];
        Ok(futures::stream::iter(events).boxed())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), PlatformError> {
        self.deletes.delete_pod(name).await
    }

    async fn stream_logs(
        &self,
        _name: &str,
    ) -> Result<BoxStream<'static, std::io::Result<Bytes>>, PlatformError> {
        let chunks: Vec<std::io::Result<Bytes>> = self
            .log_lines
            .iter()
            .map(|line| Ok(Bytes::from_static(line.as_bytes())))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn list(&self) -> Result<PlatformState, PlatformError> {
        Ok(PlatformState::default())
    }

    fn watch(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(1);
        self.watch_senders.lock().push(tx);
        rx
    }

    async fn quota_get(&self) -> Result<Quota, PlatformError> {
        Err(PlatformError::NotFound("quota".into()))
    }

    async fn quota_create(&self, limit: i64) -> Result<Quota, PlatformError> {
        Ok(Quota {
            name: "selenosis-pod-limit".into(),
            current_max_limit: limit,
        })
    }

    async fn quota_update(&self, limit: i64) -> Result<Quota, PlatformError> {
        Ok(Quota {
            name: "selenosis-pod-limit".into(),
            current_max_limit: limit,
        })
    }
}

/// Knobs for [`spawn_gateway`]; defaults suit the happy path.
pub struct GatewayOptions {
    pub upstream_port: u16,
    pub attempts: usize,
    pub wait_timeout: Duration,
    pub vnc_port: u16,
}

impl GatewayOptions {
    pub fn new(upstream_port: u16) -> Self {
        Self {
            upstream_port,
            attempts: 5,
            wait_timeout: Duration::from_secs(5),
            vnc_port: 5900,
        }
    }
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub platform: Arc<MockPlatform>,
    pub state: State,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }
}

/// Wire up a full gateway in IP routing mode against the mock platform
/// and bind it to a loopback port. IP mode keeps the resolver pointed at
/// 127.0.0.1, where the test's stub upstream listens.
pub async fn spawn_gateway(options: GatewayOptions) -> TestGateway {
    let platform = Arc::new(MockPlatform::loopback());
    spawn_gateway_with(options, platform).await
}

pub async fn spawn_gateway_with(
    options: GatewayOptions,
    platform: Arc<MockPlatform>,
) -> TestGateway {
    let catalog = Arc::new(load_catalog(BROWSERS_CONFIG));
    let client = selenosis::proxy::http::build_client().unwrap();
    let state = State::new();

    let provisioner = Arc::new(Provisioner::new(
        platform.clone(),
        catalog.clone(),
        client.clone(),
        ProvisionerConfig {
            mode: RoutingMode::Ip,
            service: "selenosis".into(),
            sidecar_port: options.upstream_port,
            browser_port: options.upstream_port,
            gateway_host: "selenosis".into(),
            attempts: options.attempts,
            wait_timeout: options.wait_timeout,
            readiness_timeout: Duration::from_secs(2),
        },
    ));

    let app = api::router(AppState {
        provisioner,
        platform: platform.clone(),
        state: state.clone(),
        catalog,
        proxy: HttpReverseProxy::new(client),
        resolver: AddressResolver::new(RoutingMode::Ip, "selenosis", options.upstream_port),
        config: Arc::new(GatewayConfig {
            gateway_host: "selenosis".into(),
            session_limit: 10,
            build_version: "test".into(),
            vnc_port: options.vnc_port,
        }),
    });

    let addr = serve_router(app).await;
    TestGateway {
        addr,
        platform,
        state,
    }
}

pub fn load_catalog(content: &str) -> Catalog {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    let (_, path) = file.keep().unwrap();
    Catalog::load(path).unwrap()
}

/// Bind a router to 127.0.0.1:0 and serve it in the background.
pub async fn serve_router(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

/// A [`Service`] entry for seeding the state cache directly.
pub fn cached_service(id: &str, status: ServiceStatus) -> Service {
    Service {
        session_id: id.to_string(),
        url: Url::parse("http://example:4445").unwrap(),
        labels: BTreeMap::from([("browserName".to_string(), "chrome".to_string())]),
        handle: PodHandle::new(id, Arc::new(DeleteLog::default())),
        status,
        started: chrono::Utc::now(),
        uptime: String::new(),
    }
}

pub fn cached_worker(name: &str) -> Worker {
    Worker {
        name: name.to_string(),
        labels: BTreeMap::new(),
        status: ServiceStatus::Running,
        started: chrono::Utc::now(),
    }
}
