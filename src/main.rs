//! selenosis - Kubernetes-native Selenium hub.
//!
//! Startup wires the pieces together explicitly: load the browser
//! catalog, connect to the cluster, seed the state cache from a pod
//! listing, start the watch reconciler and the config watcher, then
//! serve the WebDriver surface until SIGINT/SIGTERM with a bounded
//! drain.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use selenosis::api::{self, AppState, GatewayConfig};
use selenosis::catalog::{self, Catalog};
use selenosis::platform::kubernetes::{ClientOptions, Kubernetes};
use selenosis::platform::{Platform, VNC_PORT, BROWSER_PORT};
use selenosis::provisioner::{Provisioner, ProvisionerConfig};
use selenosis::proxy::http::{build_client, HttpReverseProxy};
use selenosis::registry::{Reconciler, State};
use selenosis::routing::{AddressResolver, RoutingMode};

/// selenosis - Kubernetes-native Selenium hub
///
/// Accepts WebDriver session requests, starts a one-shot browser pod
/// per session and proxies all session traffic into it.
#[derive(Parser, Debug)]
#[command(name = "selenosis", version, about, long_about = None)]
struct Args {
    /// Address to bind the gateway
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:4444")]
    listen_addr: SocketAddr,

    /// Path to the browsers config file (YAML or JSON)
    #[arg(
        long = "browsers-config",
        env = "BROWSERS_CONFIG",
        default_value = "./config/browsers.yaml"
    )]
    browsers_config: PathBuf,

    /// Kubernetes namespace browser pods are created in
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Headless service providing per-pod DNS
    #[arg(long = "service-name", env = "SERVICE_NAME", default_value = "selenosis")]
    service_name: String,

    /// Port the session sidecar listens on
    #[arg(long = "proxy-port", env = "PROXY_PORT", default_value_t = 4445)]
    proxy_port: u16,

    /// Maximum number of concurrent browser sessions
    #[arg(long = "browser-limit", env = "BROWSER_LIMIT", default_value_t = 10)]
    browser_limit: i64,

    /// Session creation attempts before giving up
    #[arg(
        long = "session-retry-count",
        env = "SESSION_CREATE_ATTEMPTS",
        default_value_t = 5
    )]
    session_retry_count: usize,

    /// Deadline per session creation attempt
    #[arg(
        long = "browser-wait-timeout",
        env = "SESSION_CREATE_TIMEOUT",
        value_parser = parse_duration,
        default_value = "30s"
    )]
    browser_wait_timeout: Duration,

    /// Deadline for a freshly created pod to become reachable
    #[arg(
        long = "session-wait-timeout",
        value_parser = parse_duration,
        default_value = "60s"
    )]
    session_wait_timeout: Duration,

    /// Idle timeout handed to the sidecar, which deletes the pod
    #[arg(
        long = "session-idle-timeout",
        value_parser = parse_duration,
        default_value = "5m"
    )]
    session_idle_timeout: Duration,

    /// Pull secret attached to browser pods
    #[arg(long = "image-pull-secret-name", env = "IMAGE_PULL_SECRET_NAME")]
    image_pull_secret_name: Option<String>,

    /// Sidecar image
    #[arg(
        long = "proxy-image",
        env = "PROXY_IMAGE",
        default_value = "alcounit/seleniferous:latest"
    )]
    proxy_image: String,

    /// Video recorder image
    #[arg(
        long = "video-image",
        env = "VIDEO_IMAGE",
        default_value = "selenoid/video-recorder:latest-release"
    )]
    video_image: String,

    /// Session routing topology: per-pod DNS or pod IP embedded in the
    /// session UUID
    #[arg(long = "routing-mode", value_enum, default_value = "dns")]
    routing_mode: RoutingMode,

    /// Keep the pod-limit quota sized to workers + browser limit
    #[arg(long = "enable-quota-management")]
    enable_quota_management: bool,

    /// Run the sidecar container privileged
    #[arg(long = "privileged-sidecar")]
    privileged_sidecar: bool,

    /// Hostname advertised to sidecars
    #[arg(long = "hostname", env = "HOSTNAME", default_value = "selenosis")]
    gateway_host: String,

    /// Drain window after SIGINT/SIGTERM
    #[arg(
        long = "graceful-shutdown-timeout",
        value_parser = parse_duration,
        default_value = "10s"
    )]
    graceful_shutdown_timeout: Duration,
}

/// Durations as bare seconds or with an s/m/h suffix: `30`, `30s`,
/// `5m`, `1h`.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (number, multiplier) = match value.strip_suffix(['s', 'm', 'h']) {
        Some(number) => {
            let multiplier = match value.as_bytes()[value.len() - 1] {
                b'm' => 60,
                b'h' => 3600,
                _ => 1,
            };
            (number, multiplier)
        }
        None => (value, 1),
    };
    number
        .parse::<u64>()
        .map(|n| Duration::from_secs(n * multiplier))
        .map_err(|_| format!("invalid duration {value:?}"))
}

#[derive(Error, Debug)]
enum StartupError {
    #[error("failed to load browsers config: {0}")]
    Catalog(#[from] catalog::CatalogError),
    #[error("failed to build cluster client: {0}")]
    Platform(#[from] kube::Error),
    #[error("failed to build http transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, std::io::Error),
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "selenosis=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "selenosis starting");

    let catalog = Arc::new(Catalog::load(&args.browsers_config)?);
    tracing::info!(
        file = %args.browsers_config.display(),
        browsers = catalog.versions().len(),
        "browsers config loaded"
    );

    let platform: Arc<dyn Platform> = Arc::new(
        Kubernetes::connect(ClientOptions {
            namespace: args.namespace.clone(),
            service: args.service_name.clone(),
            sidecar_port: args.proxy_port,
            image_pull_secret: args.image_pull_secret_name.clone(),
            proxy_image: args.proxy_image.clone(),
            video_image: args.video_image.clone(),
            idle_timeout: args.session_idle_timeout,
            privileged_sidecar: args.privileged_sidecar,
        })
        .await?,
    );

    let client = build_client()?;
    let state = State::new();

    // Seed the cache; a failure here just means we start cold and let
    // the watch fill things in.
    match platform.list().await {
        Ok(listing) => {
            tracing::info!(
                sessions = listing.services.len(),
                workers = listing.workers.len(),
                "cluster state seeded"
            );
            state.seed(listing);
        }
        Err(err) => tracing::error!(%err, "failed to get list of active pods"),
    }

    if args.enable_quota_management {
        let desired = state.worker_count() as i64 + args.browser_limit;
        match platform.quota_create(desired).await {
            Ok(quota) => state.set_quota(Some(quota)),
            Err(err) => tracing::error!(%err, "failed to ensure pod-limit quota"),
        }
    }

    let events = platform.watch();
    tokio::spawn(
        Reconciler::new(
            state.clone(),
            platform.clone(),
            args.browser_limit,
            args.enable_quota_management,
        )
        .run(events),
    );
    tokio::spawn(catalog::watch_config(catalog.clone()));

    let provisioner = Arc::new(Provisioner::new(
        platform.clone(),
        catalog.clone(),
        client.clone(),
        ProvisionerConfig {
            mode: args.routing_mode,
            service: args.service_name.clone(),
            sidecar_port: args.proxy_port,
            browser_port: BROWSER_PORT,
            gateway_host: args.gateway_host.clone(),
            attempts: args.session_retry_count,
            wait_timeout: args.browser_wait_timeout,
            readiness_timeout: args.session_wait_timeout,
        },
    ));

    let app = api::router(AppState {
        provisioner,
        platform,
        state,
        catalog,
        proxy: HttpReverseProxy::new(client),
        resolver: AddressResolver::new(args.routing_mode, &args.service_name, args.proxy_port),
        config: Arc::new(GatewayConfig {
            gateway_host: args.gateway_host,
            session_limit: args.browser_limit,
            build_version: env!("CARGO_PKG_VERSION").to_string(),
            vnc_port: VNC_PORT,
        }),
    });

    let listener = tokio::net::TcpListener::bind(args.listen_addr)
        .await
        .map_err(|err| StartupError::Bind(args.listen_addr, err))?;
    tracing::info!(addr = %args.listen_addr, "gateway listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
        })
        .await
    });

    shutdown_signal().await;
    tracing::info!("shutting down");

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(args.graceful_shutdown_timeout, server).await {
        Ok(Ok(result)) => result?,
        Ok(Err(join_err)) => tracing::warn!(?join_err, "server task panicked"),
        Err(_) => tracing::warn!("drain window elapsed before all connections closed"),
    }

    tracing::info!("selenosis exiting");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::parse_from(["selenosis"]);
        assert_eq!(args.proxy_port, 4445);
        assert_eq!(args.session_retry_count, 5);
        assert_eq!(args.routing_mode, RoutingMode::Dns);
        assert!(!args.enable_quota_management);
    }
}
