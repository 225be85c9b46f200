use anyhow::{anyhow, Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::tokio::TokioIo;
use junction_core::{HeartbeatMonitor, MonitorConfig, RegistryStore, RoutingTableBuilder};
use junction_proxy::{policy_from_name, ControlApi, Forwarder, Gateway, MetricsCollector};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Runtime settings, environment-driven with sensible defaults.
#[derive(Debug)]
struct Settings {
    /// Routing front door.
    listen: SocketAddr,
    /// Registration protocol, health and metrics.
    control_listen: SocketAddr,
    monitor: MonitorConfig,
    max_staleness: Duration,
    forward_timeout: Duration,
    balance_policy: String,
}

impl Settings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            listen: env_or("JUNCTION_LISTEN", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            control_listen: env_or(
                "JUNCTION_CONTROL_LISTEN",
                SocketAddr::from(([0, 0, 0, 0], 8081)),
            )?,
            monitor: MonitorConfig {
                check_interval: Duration::from_secs(env_or(
                    "JUNCTION_CHECK_INTERVAL_SECS",
                    30u64,
                )?),
                lease_timeout: Duration::from_secs(env_or("JUNCTION_LEASE_TIMEOUT_SECS", 90u64)?),
                eviction_grace: Duration::from_secs(env_or("JUNCTION_EVICTION_GRACE_SECS", 0u64)?),
            },
            max_staleness: Duration::from_secs(env_or("JUNCTION_MAX_STALENESS_SECS", 5u64)?),
            forward_timeout: Duration::from_secs(env_or("JUNCTION_FORWARD_TIMEOUT_SECS", 30u64)?),
            balance_policy: env_or("JUNCTION_BALANCE_POLICY", "round-robin".to_string())?,
        })
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow!("invalid {}={}: {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;
    info!("Starting junction-gateway...");

    // Registry and the periodic tasks that keep it honest.
    let registry = Arc::new(RegistryStore::new());
    info!("Service registry initialized");

    let monitor = HeartbeatMonitor::new(registry.clone(), settings.monitor.clone());
    let _monitor_task = monitor.spawn();

    let builder = RoutingTableBuilder::new(registry.clone(), settings.max_staleness);
    let table = builder.table();
    builder.rebuild_now().await;
    let _builder_task = builder.spawn();
    info!("Routing table builder started");

    spawn_event_logger(registry.clone());

    let policy = policy_from_name(&settings.balance_policy)
        .ok_or_else(|| anyhow!("unknown balance policy: {}", settings.balance_policy))?;
    let metrics = Arc::new(MetricsCollector::new().context("metrics collector")?);

    let gateway = Arc::new(Gateway::new(
        registry.clone(),
        table,
        Forwarder::new(settings.forward_timeout),
        policy,
        metrics.clone(),
    ));
    let control = Arc::new(ControlApi::new(
        registry.clone(),
        metrics,
        settings.monitor.lease_timeout,
    ));

    let control_listener = TcpListener::bind(&settings.control_listen).await?;
    info!("Control listener on {}", settings.control_listen);
    tokio::task::spawn(accept_control_connections(control_listener, control));

    let listener = TcpListener::bind(&settings.listen).await?;
    info!("Routing listener on {}", settings.listen);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);

        let gateway = gateway.clone();
        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = gateway.clone();
                async move { gateway.handle(req).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving connection from {}: {}", peer_addr, e);
            }
        });
    }
}

/// Surface per-instance status-change events as structured log lines.
fn spawn_event_logger(registry: Arc<RegistryStore>) {
    let mut events = registry.subscribe_events();
    tokio::task::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(?event, "instance event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "instance event stream lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn accept_control_connections(listener: TcpListener, control: Arc<ControlApi>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let io = TokioIo::new(stream);
                let control = control.clone();
                tokio::task::spawn(async move {
                    let service = service_fn(move |req| {
                        let control = control.clone();
                        async move { control.handle(req).await }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Error serving control connection from {}: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("Error accepting control connection: {}", e);
            }
        }
    }
}
