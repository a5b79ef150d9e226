//! Kubernetes implementation of the [`Platform`] contract.
//!
//! Browser pods carry two containers: the browser image itself and the
//! `seleniferous` sidecar that terminates the WebDriver socket and
//! deletes the pod when the session goes idle. The pod hostname is the
//! session id and its subdomain is the headless service, so in DNS
//! routing mode the pod is reachable as `<sessionId>.<service>`.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams, WatchEvent,
    WatchParams,
};
use kube::runtime::watcher;
use tokio::sync::mpsc;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::io::ReaderStream;
use url::Url;

use super::{
    DeletesPods, Event, EventType, Platform, PlatformError, PlatformObject, PlatformState,
    PodEvent, PodHandle, PodPhase, Quota, Service, ServiceSpec, ServiceStatus, Worker, APP_LABEL,
    BROWSER_PORT, QUOTA_NAME, SESSION_LABEL, VIDEO_PORT, VNC_PORT,
};

const BROWSER_CONTAINER: &str = "browser";
const SIDECAR_CONTAINER: &str = "seleniferous";
const VIDEO_CONTAINER: &str = "video";
const SHM_VOLUME: &str = "dshm";
const CAPABILITIES_ANNOTATION: &str = "capabilities";

/// Env var / annotation names recognized from capabilities.
const SCREEN_RESOLUTION: &str = "SCREEN_RESOLUTION";
const ENABLE_VNC: &str = "ENABLE_VNC";
const ENABLE_VIDEO: &str = "ENABLE_VIDEO";
const VIDEO_NAME: &str = "VIDEO_NAME";
const TIME_ZONE: &str = "TZ";

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub namespace: String,
    /// Headless service providing per-pod DNS.
    pub service: String,
    pub sidecar_port: u16,
    pub image_pull_secret: Option<String>,
    pub proxy_image: String,
    pub video_image: String,
    /// Passed to the sidecar, which self-deletes the pod on idle.
    pub idle_timeout: Duration,
    pub privileged_sidecar: bool,
}

pub struct Kubernetes {
    opts: ClientOptions,
    pods: Api<corev1::Pod>,
    quotas: Api<corev1::ResourceQuota>,
}

impl Kubernetes {
    /// Connect using in-cluster config, falling back to the local
    /// kubeconfig.
    pub async fn connect(opts: ClientOptions) -> Result<Self, kube::Error> {
        let client = kube::Client::try_default().await?;
        let pods = Api::namespaced(client.clone(), &opts.namespace);
        let quotas = Api::namespaced(client, &opts.namespace);
        Ok(Self { opts, pods, quotas })
    }

    fn deleter(&self) -> Arc<dyn DeletesPods> {
        Arc::new(PodScope {
            pods: self.pods.clone(),
        })
    }

    fn service_url(&self, session_id: &str) -> Url {
        dns_service_url(session_id, &self.opts.service, self.opts.sidecar_port)
    }
}

/// Just enough of the API to let a [`PodHandle`] delete its pod.
#[derive(Clone)]
struct PodScope {
    pods: Api<corev1::Pod>,
}

#[async_trait]
impl DeletesPods for PodScope {
    async fn delete_pod(&self, name: &str) -> Result<(), PlatformError> {
        delete_pod_with(&self.pods, name).await
    }
}

async fn delete_pod_with(pods: &Api<corev1::Pod>, name: &str) -> Result<(), PlatformError> {
    let dp = DeleteParams::default().grace_period(15);
    match pods.delete(name, &dp).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.reason == "NotFound" => Ok(()),
        Err(err) => Err(map_kube_err(err)),
    }
}

#[async_trait]
impl Platform for Kubernetes {
    async fn create_pod(&self, spec: ServiceSpec) -> Result<Service, PlatformError> {
        let prepared = prepare(spec);
        let pod = build_pod(&self.opts, &prepared);

        let created = self
            .pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(map_kube_err)?;

        let started = created
            .metadata
            .creation_timestamp
            .map(|t| t.0)
            .unwrap_or_else(chrono::Utc::now);

        Ok(Service {
            session_id: prepared.spec.session_id.clone(),
            url: self.service_url(&prepared.spec.session_id),
            labels: prepared.annotations,
            handle: PodHandle::new(&prepared.spec.session_id, self.deleter()),
            status: ServiceStatus::Pending,
            started,
            uptime: String::new(),
        })
    }

    async fn watch_pod(
        &self,
        name: &str,
        deadline: Duration,
    ) -> Result<BoxStream<'static, PodEvent>, PlatformError> {
        // The API server caps watch timeouts at roughly five minutes.
        let timeout = deadline.as_secs().clamp(1, 290) as u32;
        let wp = WatchParams::default()
            .fields(&format!("metadata.name={name}"))
            .timeout(timeout);

        let stream = self.pods.watch(&wp, "0").await.map_err(map_kube_err)?;
        let events = stream.filter_map(|event| async move {
            match event {
                Ok(WatchEvent::Added(pod)) | Ok(WatchEvent::Modified(pod)) => {
                    Some(pod_event(&pod))
                }
                Ok(WatchEvent::Deleted(_)) => Some(PodEvent {
                    phase: PodPhase::Deleted,
                    pod_ip: None,
                }),
                Ok(WatchEvent::Bookmark(_)) => None,
                Ok(WatchEvent::Error(err)) => {
                    tracing::warn!(%err, "pod watch error");
                    Some(PodEvent {
                        phase: PodPhase::Unknown,
                        pod_ip: None,
                    })
                }
                Err(err) => {
                    tracing::warn!(%err, "pod watch transport error");
                    None
                }
            }
        });
        Ok(events.boxed())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), PlatformError> {
        delete_pod_with(&self.pods, name).await
    }

    async fn stream_logs(
        &self,
        name: &str,
    ) -> Result<BoxStream<'static, std::io::Result<Bytes>>, PlatformError> {
        let lp = LogParams {
            container: Some(BROWSER_CONTAINER.to_string()),
            follow: true,
            ..LogParams::default()
        };
        let reader = self
            .pods
            .log_stream(name, &lp)
            .await
            .map_err(map_kube_err)?;
        Ok(ReaderStream::new(reader.compat()).boxed())
    }

    async fn list(&self) -> Result<PlatformState, PlatformError> {
        let lp = ListParams::default().labels(APP_LABEL);
        let pods = self.pods.list(&lp).await.map_err(map_kube_err)?;

        let mut state = PlatformState::default();
        for pod in pods {
            match classify_pod(&pod, &self.opts, self.deleter()) {
                Some(PlatformObject::Service(svc)) => state.services.push(svc),
                Some(PlatformObject::Worker(worker)) => state.workers.push(worker),
                _ => {}
            }
        }
        Ok(state)
    }

    fn watch(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(1);
        let pods = self.pods.clone();
        let quotas = self.quotas.clone();
        let opts = self.opts.clone();
        let deleter = self.deleter();

        tokio::spawn(async move {
            let pod_stream = watcher(pods, watcher::Config::default().labels(APP_LABEL));
            let quota_stream = watcher(quotas, watcher::Config::default().labels(APP_LABEL));
            let mut pod_stream = std::pin::pin!(pod_stream);
            let mut quota_stream = std::pin::pin!(quota_stream);

            // The shared informer coalesces adds and updates; track which
            // names we have seen so downstream consumers still get a
            // clean Added/Updated/Deleted stream.
            let mut known_pods: HashSet<String> = HashSet::new();
            let mut known_quotas: HashSet<String> = HashSet::new();

            loop {
                let event = tokio::select! {
                    ev = pod_stream.next() => match ev {
                        Some(Ok(ev)) => pod_watch_event(ev, &mut known_pods, &opts, &deleter),
                        Some(Err(err)) => {
                            tracing::warn!(%err, "pod watch stream error");
                            None
                        }
                        None => break,
                    },
                    ev = quota_stream.next() => match ev {
                        Some(Ok(ev)) => quota_watch_event(ev, &mut known_quotas),
                        Some(Err(err)) => {
                            tracing::warn!(%err, "quota watch stream error");
                            None
                        }
                        None => break,
                    },
                };

                if let Some(event) = event {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        rx
    }

    async fn quota_get(&self) -> Result<Quota, PlatformError> {
        let rq = self.quotas.get(QUOTA_NAME).await.map_err(map_kube_err)?;
        Ok(quota_from(&rq))
    }

    async fn quota_create(&self, limit: i64) -> Result<Quota, PlatformError> {
        let rq = quota_object(limit);
        match self.quotas.create(&PostParams::default(), &rq).await {
            Ok(created) => Ok(quota_from(&created)),
            Err(kube::Error::Api(ae)) if ae.reason == "AlreadyExists" => self.quota_get().await,
            Err(err) => Err(map_kube_err(err)),
        }
    }

    async fn quota_update(&self, limit: i64) -> Result<Quota, PlatformError> {
        let patch = serde_json::json!({
            "spec": {"hard": {"pods": limit.to_string()}}
        });
        let rq = self
            .quotas
            .patch(QUOTA_NAME, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(map_kube_err)?;
        Ok(quota_from(&rq))
    }
}

fn map_kube_err(err: kube::Error) -> PlatformError {
    match &err {
        kube::Error::Api(ae) if ae.reason == "AlreadyExists" => PlatformError::AlreadyExists,
        kube::Error::Api(ae) if ae.code == 403 && ae.message.contains("exceeded quota") => {
            PlatformError::QuotaExceeded(ae.message.clone())
        }
        kube::Error::Api(ae) if ae.reason == "NotFound" => {
            PlatformError::NotFound(ae.message.clone())
        }
        _ => PlatformError::Transport(err.to_string()),
    }
}

fn dns_service_url(session_id: &str, service: &str, port: u16) -> Url {
    Url::parse(&format!("http://{session_id}.{service}:{port}"))
        .expect("pod DNS url is always well formed")
}

fn pod_status(pod: &corev1::Pod) -> ServiceStatus {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Running") => ServiceStatus::Running,
        Some("Pending") => ServiceStatus::Pending,
        _ => ServiceStatus::Unknown,
    }
}

fn pod_event(pod: &corev1::Pod) -> PodEvent {
    let phase = match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Pending") => PodPhase::Pending,
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        _ => PodPhase::Unknown,
    };
    let pod_ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .and_then(|ip| ip.parse::<IpAddr>().ok());
    PodEvent { phase, pod_ip }
}

fn pod_started(pod: &corev1::Pod) -> chrono::DateTime<chrono::Utc> {
    pod.metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or_else(chrono::Utc::now)
}

/// Session capabilities recorded on the pod, for the status surface.
fn requested_capabilities(pod: &corev1::Pod) -> BTreeMap<String, String> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CAPABILITIES_ANNOTATION))
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

fn classify_pod(
    pod: &corev1::Pod,
    opts: &ClientOptions,
    deleter: Arc<dyn DeletesPods>,
) -> Option<PlatformObject> {
    let name = pod.metadata.name.clone()?;
    let labels = pod.metadata.labels.clone().unwrap_or_default();

    match labels.get(APP_LABEL).map(String::as_str) {
        Some("browser") => Some(PlatformObject::Service(Service {
            url: dns_service_url(&name, &opts.service, opts.sidecar_port),
            labels: requested_capabilities(pod),
            handle: PodHandle::new(&name, deleter),
            status: pod_status(pod),
            started: pod_started(pod),
            uptime: String::new(),
            session_id: name,
        })),
        Some("worker") => Some(PlatformObject::Worker(Worker {
            name,
            labels,
            status: pod_status(pod),
            started: pod_started(pod),
        })),
        _ => None,
    }
}

fn pod_watch_event(
    event: watcher::Event<corev1::Pod>,
    known: &mut HashSet<String>,
    opts: &ClientOptions,
    deleter: &Arc<dyn DeletesPods>,
) -> Option<Event> {
    let (pod, deleted) = match event {
        watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => (pod, false),
        watcher::Event::Delete(pod) => (pod, true),
        watcher::Event::Init | watcher::Event::InitDone => return None,
    };

    let name = pod.metadata.name.clone()?;
    let event_type = if deleted {
        known.remove(&name);
        EventType::Deleted
    } else if known.insert(name) {
        EventType::Added
    } else {
        EventType::Updated
    };

    let object = classify_pod(&pod, opts, deleter.clone())?;
    Some(Event { event_type, object })
}

fn quota_watch_event(
    event: watcher::Event<corev1::ResourceQuota>,
    known: &mut HashSet<String>,
) -> Option<Event> {
    let (rq, deleted) = match event {
        watcher::Event::Apply(rq) | watcher::Event::InitApply(rq) => (rq, false),
        watcher::Event::Delete(rq) => (rq, true),
        watcher::Event::Init | watcher::Event::InitDone => return None,
    };

    let name = rq.metadata.name.clone()?;
    let event_type = if deleted {
        known.remove(&name);
        EventType::Deleted
    } else if known.insert(name) {
        EventType::Added
    } else {
        EventType::Updated
    };

    Some(Event {
        event_type,
        object: PlatformObject::Quota(quota_from(&rq)),
    })
}

fn quota_from(rq: &corev1::ResourceQuota) -> Quota {
    let current_max_limit = rq
        .spec
        .as_ref()
        .and_then(|s| s.hard.as_ref())
        .and_then(|hard| hard.get("pods"))
        .and_then(|q| q.0.parse().ok())
        .unwrap_or(0);
    Quota {
        name: rq.metadata.name.clone().unwrap_or_default(),
        current_max_limit,
    }
}

fn quota_object(limit: i64) -> corev1::ResourceQuota {
    corev1::ResourceQuota {
        metadata: ObjectMeta {
            name: Some(QUOTA_NAME.to_string()),
            labels: Some(BTreeMap::from([(
                APP_LABEL.to_string(),
                "quota".to_string(),
            )])),
            ..ObjectMeta::default()
        },
        spec: Some(corev1::ResourceQuotaSpec {
            hard: Some(BTreeMap::from([(
                "pods".to_string(),
                Quantity(limit.to_string()),
            )])),
            ..corev1::ResourceQuotaSpec::default()
        }),
        ..corev1::ResourceQuota::default()
    }
}

/// A [`ServiceSpec`] with capability-driven env vars and annotations
/// already folded in, ready for manifest construction.
struct PreparedSpec {
    spec: ServiceSpec,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    video: bool,
}

fn upsert_env(env: &mut Vec<corev1::EnvVar>, name: &str, value: &str) {
    match env.iter_mut().find(|e| e.name == name) {
        Some(entry) => {
            entry.value = Some(value.to_string());
            entry.value_from = None;
        }
        None => env.push(corev1::EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..corev1::EnvVar::default()
        }),
    }
}

fn env_value(env: &[corev1::EnvVar], name: &str) -> Option<String> {
    env.iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.clone())
}

/// Fold the requested capabilities into the template's env vars and
/// compute the pod's labels and annotations.
fn prepare(mut spec: ServiceSpec) -> PreparedSpec {
    let mut annotations = BTreeMap::from([
        ("browserName".to_string(), spec.template.browser_name.clone()),
        (
            "browserVersion".to_string(),
            spec.template.browser_version.clone(),
        ),
    ]);
    if !spec.requested.test_name().is_empty() {
        annotations.insert("testName".to_string(), spec.requested.test_name().to_string());
    }

    let env = spec.template.spec.env_vars.get_or_insert_with(Vec::new);

    let resolution = spec.requested.screen_resolution().to_string();
    if !resolution.is_empty() {
        upsert_env(env, SCREEN_RESOLUTION, &resolution);
        annotations.insert(SCREEN_RESOLUTION.to_string(), resolution);
    } else if let Some(value) = env_value(env, SCREEN_RESOLUTION) {
        annotations.insert(SCREEN_RESOLUTION.to_string(), value);
    }

    if spec.requested.vnc_enabled() {
        upsert_env(env, ENABLE_VNC, "true");
        annotations.insert(ENABLE_VNC.to_string(), "true".to_string());
    } else if let Some(value) = env_value(env, ENABLE_VNC) {
        annotations.insert(ENABLE_VNC.to_string(), value);
    }

    let video = spec.requested.video_enabled();
    if video {
        upsert_env(env, ENABLE_VIDEO, "true");
        let video_name = format!("{}.mp4", spec.session_id);
        upsert_env(env, VIDEO_NAME, &video_name);
        annotations.insert(ENABLE_VIDEO.to_string(), "true".to_string());
        annotations.insert(VIDEO_NAME.to_string(), video_name);
    } else if let Some(value) = env_value(env, ENABLE_VIDEO) {
        annotations.insert(ENABLE_VIDEO.to_string(), value);
    }

    let tz = spec.requested.time_zone().to_string();
    if !tz.is_empty() {
        upsert_env(env, TIME_ZONE, &tz);
        annotations.insert(TIME_ZONE.to_string(), tz);
    } else if let Some(value) = env_value(env, TIME_ZONE) {
        annotations.insert(TIME_ZONE.to_string(), value);
    }

    let mut labels = spec.template.meta.labels.clone();
    labels.insert("type".to_string(), "browser".to_string());
    labels.insert(APP_LABEL.to_string(), "browser".to_string());
    labels.insert(SESSION_LABEL.to_string(), spec.session_id.clone());

    PreparedSpec {
        spec,
        labels,
        annotations,
        video,
    }
}

fn join_path(base: &str, leaf: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    format!("{trimmed}/{leaf}")
}

fn container_port(name: &str, port: u16) -> corev1::ContainerPort {
    corev1::ContainerPort {
        name: Some(name.to_string()),
        container_port: port as i32,
        ..corev1::ContainerPort::default()
    }
}

/// Pure construction of the pod manifest from a prepared spec.
fn build_pod(opts: &ClientOptions, prepared: &PreparedSpec) -> corev1::Pod {
    let template = &prepared.spec.template;
    let session_id = &prepared.spec.session_id;

    let mut annotations = template.meta.annotations.clone();
    for (k, v) in &prepared.annotations {
        annotations.insert(k.clone(), v.clone());
    }
    if let Ok(caps) = serde_json::to_string(&prepared.annotations) {
        annotations.insert(CAPABILITIES_ANNOTATION.to_string(), caps);
    }

    let mut volume_mounts = vec![corev1::VolumeMount {
        name: SHM_VOLUME.to_string(),
        mount_path: "/dev/shm".to_string(),
        ..corev1::VolumeMount::default()
    }];
    if let Some(extra) = &template.spec.volume_mounts {
        volume_mounts.extend(extra.iter().cloned());
    }

    let mut volumes = vec![corev1::Volume {
        name: SHM_VOLUME.to_string(),
        empty_dir: Some(corev1::EmptyDirVolumeSource {
            medium: Some("Memory".to_string()),
            ..corev1::EmptyDirVolumeSource::default()
        }),
        ..corev1::Volume::default()
    }];
    if let Some(extra) = &template.volumes {
        volumes.extend(extra.iter().cloned());
    }

    let browser = corev1::Container {
        name: BROWSER_CONTAINER.to_string(),
        image: Some(template.image.clone()),
        security_context: Some(corev1::SecurityContext {
            privileged: Some(template.privileged),
            capabilities: template.kernel_caps.as_ref().map(|caps| {
                corev1::Capabilities {
                    add: Some(caps.clone()),
                    ..corev1::Capabilities::default()
                }
            }),
            ..corev1::SecurityContext::default()
        }),
        env: template.spec.env_vars.clone(),
        ports: Some(vec![
            container_port("vnc", VNC_PORT),
            container_port("selenium", BROWSER_PORT),
            container_port("video", VIDEO_PORT),
        ]),
        resources: template.spec.resources.clone(),
        volume_mounts: Some(volume_mounts.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ..corev1::Container::default()
    };

    let sidecar = corev1::Container {
        name: SIDECAR_CONTAINER.to_string(),
        image: Some(opts.proxy_image.clone()),
        ports: Some(vec![container_port("selenium", opts.sidecar_port)]),
        command: Some(vec![
            format!("/{SIDECAR_CONTAINER}"),
            "--listen-port".to_string(),
            opts.sidecar_port.to_string(),
            "--proxy-default-path".to_string(),
            join_path(&template.path, "session"),
            "--idle-timeout".to_string(),
            format!("{}s", opts.idle_timeout.as_secs()),
            "--namespace".to_string(),
            opts.namespace.clone(),
        ]),
        security_context: opts.privileged_sidecar.then(|| corev1::SecurityContext {
            privileged: Some(true),
            ..corev1::SecurityContext::default()
        }),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ..corev1::Container::default()
    };

    let mut containers = vec![browser, sidecar];
    if prepared.video {
        containers.push(corev1::Container {
            name: VIDEO_CONTAINER.to_string(),
            image: Some(opts.video_image.clone()),
            env: template.spec.env_vars.clone(),
            volume_mounts: Some(volume_mounts),
            image_pull_policy: Some("IfNotPresent".to_string()),
            ..corev1::Container::default()
        });
    }

    let security_context = {
        let run_as = &template.run_as;
        (run_as.run_as_user.is_some() || run_as.run_as_group.is_some()).then(|| {
            corev1::PodSecurityContext {
                run_as_user: run_as.run_as_user,
                run_as_group: run_as.run_as_group,
                ..corev1::PodSecurityContext::default()
            }
        })
    };

    corev1::Pod {
        metadata: ObjectMeta {
            name: Some(session_id.clone()),
            labels: Some(prepared.labels.clone()),
            annotations: Some(annotations),
            ..ObjectMeta::default()
        },
        spec: Some(corev1::PodSpec {
            hostname: Some(session_id.clone()),
            subdomain: Some(opts.service.clone()),
            containers,
            volumes: Some(volumes),
            node_selector: template.spec.node_selector.clone(),
            host_aliases: template.spec.host_aliases.clone(),
            restart_policy: Some("Never".to_string()),
            affinity: template.spec.affinity.clone(),
            dns_config: template.spec.dns_config.clone(),
            tolerations: template.spec.tolerations.clone(),
            image_pull_secrets: opts.image_pull_secret.as_ref().map(|secret| {
                vec![corev1::LocalObjectReference {
                    name: secret.clone(),
                }]
            }),
            security_context,
            ..corev1::PodSpec::default()
        }),
        ..corev1::Pod::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::catalog::BrowserTemplate;
    use serde_json::json;

    fn options() -> ClientOptions {
        ClientOptions {
            namespace: "selenosis".to_string(),
            service: "selenosis".to_string(),
            sidecar_port: 4445,
            image_pull_secret: None,
            proxy_image: "alcounit/seleniferous:latest".to_string(),
            video_image: "selenoid/video-recorder:latest".to_string(),
            idle_timeout: Duration::from_secs(120),
            privileged_sidecar: false,
        }
    }

    fn template() -> BrowserTemplate {
        BrowserTemplate {
            browser_name: "chrome".to_string(),
            browser_version: "92.0".to_string(),
            image: "selenoid/vnc:chrome_92.0".to_string(),
            path: "/".to_string(),
            ..BrowserTemplate::default()
        }
    }

    fn spec_with_caps(caps: serde_json::Value) -> ServiceSpec {
        ServiceSpec {
            session_id: "chrome-92-abc".to_string(),
            requested: Capabilities(caps.as_object().unwrap().clone()),
            template: template(),
        }
    }

    #[test]
    fn manifest_core_invariants() {
        let prepared = prepare(spec_with_caps(json!({"browserName": "chrome"})));
        let pod = build_pod(&options(), &prepared);

        assert_eq!(pod.metadata.name.as_deref(), Some("chrome-92-abc"));
        let spec = pod.spec.unwrap();
        assert_eq!(spec.hostname.as_deref(), Some("chrome-92-abc"));
        assert_eq!(spec.subdomain.as_deref(), Some("selenosis"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));

        let names: Vec<_> = spec.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["browser", "seleniferous"]);

        let shm = &spec.volumes.unwrap()[0];
        assert_eq!(shm.name, "dshm");
        assert_eq!(
            shm.empty_dir.as_ref().unwrap().medium.as_deref(),
            Some("Memory")
        );
    }

    #[test]
    fn sidecar_command_carries_session_path() {
        let prepared = prepare(spec_with_caps(json!({})));
        let pod = build_pod(&options(), &prepared);
        let sidecar = &pod.spec.unwrap().containers[1];
        let command = sidecar.command.as_ref().unwrap().join(" ");
        assert_eq!(
            command,
            "/seleniferous --listen-port 4445 --proxy-default-path /session \
             --idle-timeout 120s --namespace selenosis"
        );
    }

    #[test]
    fn sidecar_privilege_is_opt_in() {
        let prepared = prepare(spec_with_caps(json!({})));
        let pod = build_pod(&options(), &prepared);
        assert!(pod.spec.unwrap().containers[1].security_context.is_none());

        let mut opts = options();
        opts.privileged_sidecar = true;
        let prepared = prepare(spec_with_caps(json!({})));
        let pod = build_pod(&opts, &prepared);
        let ctx = pod.spec.unwrap().containers[1]
            .security_context
            .clone()
            .unwrap();
        assert_eq!(ctx.privileged, Some(true));
    }

    #[test]
    fn video_capability_adds_container_and_env() {
        let prepared =
            prepare(spec_with_caps(json!({"browserName": "chrome", "enableVideo": true})));
        assert!(prepared.video);
        let pod = build_pod(&options(), &prepared);
        let spec = pod.spec.unwrap();
        assert_eq!(spec.containers.len(), 3);
        assert_eq!(spec.containers[2].name, "video");

        let env = spec.containers[0].env.as_ref().unwrap();
        assert_eq!(env_value(env, ENABLE_VIDEO).as_deref(), Some("true"));
        assert_eq!(
            env_value(env, VIDEO_NAME).as_deref(),
            Some("chrome-92-abc.mp4")
        );
    }

    #[test]
    fn capability_env_plumbing() {
        let prepared = prepare(spec_with_caps(json!({
            "browserName": "chrome",
            "screenResolution": "1920x1080x24",
            "enableVNC": true,
            "timeZone": "Europe/Berlin"
        })));
        let env = prepared.spec.template.spec.env_vars.as_ref().unwrap();
        assert_eq!(
            env_value(env, SCREEN_RESOLUTION).as_deref(),
            Some("1920x1080x24")
        );
        assert_eq!(env_value(env, ENABLE_VNC).as_deref(), Some("true"));
        assert_eq!(env_value(env, TIME_ZONE).as_deref(), Some("Europe/Berlin"));
        assert_eq!(prepared.annotations[SCREEN_RESOLUTION], "1920x1080x24");
        assert_eq!(prepared.annotations[TIME_ZONE], "Europe/Berlin");
    }

    #[test]
    fn template_env_defaults_surface_in_annotations() {
        let mut spec = spec_with_caps(json!({"browserName": "chrome"}));
        spec.template.spec.env_vars = Some(vec![corev1::EnvVar {
            name: SCREEN_RESOLUTION.to_string(),
            value: Some("1280x720x24".to_string()),
            ..corev1::EnvVar::default()
        }]);
        let prepared = prepare(spec);
        assert_eq!(prepared.annotations[SCREEN_RESOLUTION], "1280x720x24");
    }

    #[test]
    fn session_labels_present() {
        let prepared = prepare(spec_with_caps(json!({})));
        assert_eq!(prepared.labels[APP_LABEL], "browser");
        assert_eq!(prepared.labels[SESSION_LABEL], "chrome-92-abc");
        assert_eq!(prepared.labels["type"], "browser");
    }

    #[test]
    fn capabilities_annotation_is_json() {
        let prepared =
            prepare(spec_with_caps(json!({"browserName": "chrome", "name": "smoke-test"})));
        let pod = build_pod(&options(), &prepared);
        let annotations = pod.metadata.annotations.unwrap();
        let parsed: BTreeMap<String, String> =
            serde_json::from_str(&annotations[CAPABILITIES_ANNOTATION]).unwrap();
        assert_eq!(parsed["browserName"], "chrome");
        assert_eq!(parsed["testName"], "smoke-test");
    }

    #[test]
    fn join_path_normalizes_slashes() {
        assert_eq!(join_path("/wd/hub", "session"), "/wd/hub/session");
        assert_eq!(join_path("/", "session"), "/session");
        assert_eq!(join_path("", "session"), "/session");
    }

    #[test]
    fn quota_object_shape() {
        let rq = quota_object(12);
        assert_eq!(rq.metadata.name.as_deref(), Some(QUOTA_NAME));
        assert_eq!(quota_from(&rq).current_max_limit, 12);
    }

    #[test]
    fn image_pull_secret_is_optional() {
        let prepared = prepare(spec_with_caps(json!({})));
        let pod = build_pod(&options(), &prepared);
        assert!(pod.spec.unwrap().image_pull_secrets.is_none());

        let mut opts = options();
        opts.image_pull_secret = Some("registry-creds".to_string());
        let pod = build_pod(&opts, &prepared);
        let secrets = pod.spec.unwrap().image_pull_secrets.unwrap();
        assert_eq!(secrets[0].name, "registry-creds");
    }
}
