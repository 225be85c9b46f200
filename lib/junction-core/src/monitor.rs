//! Heartbeat monitor that expires stale leases

use crate::registry::{ExpiryReport, RegistryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Lease expiry configuration.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Interval between expiry scans.
    pub check_interval: Duration,
    /// Lease lifetime. Kept at three times the check interval so one missed
    /// heartbeat does not flap an instance.
    pub lease_timeout: Duration,
    /// How long a `Down` instance is kept before eviction. Zero means
    /// immediate removal; a positive window absorbs transient network blips
    /// at the cost of slower route convergence.
    pub eviction_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(90),
            eviction_grace: Duration::ZERO,
        }
    }
}

/// Periodic task that walks the registry and expires instances whose lease
/// was not renewed in time.
pub struct HeartbeatMonitor {
    registry: Arc<RegistryStore>,
    config: MonitorConfig,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<RegistryStore>, config: MonitorConfig) -> Self {
        Self { registry, config }
    }

    /// One expiry pass. Exposed so tests can drive scans deterministically.
    pub async fn scan_once(&self) -> ExpiryReport {
        self.registry
            .expire_stale(self.config.lease_timeout, self.config.eviction_grace)
            .await
    }

    /// Run the scan loop. The monitor only logs outcomes; a scan that finds
    /// nothing to do is free, and the loop itself never takes the process
    /// down.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            check_interval_secs = self.config.check_interval.as_secs(),
            lease_timeout_secs = self.config.lease_timeout.as_secs(),
            eviction_grace_secs = self.config.eviction_grace.as_secs(),
            "heartbeat monitor started"
        );
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.check_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let report = self.scan_once().await;
                if report.marked_down.is_empty() && report.evicted.is_empty() {
                    debug!("heartbeat scan found no stale leases");
                } else {
                    info!(
                        marked_down = report.marked_down.len(),
                        evicted = report.evicted.len(),
                        "heartbeat scan expired stale leases"
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InstanceStatus;

    #[tokio::test(start_paused = true)]
    async fn test_unrenewed_lease_expires() {
        let registry = Arc::new(RegistryStore::new());
        registry
            .register("inventory", "a1", "10.0.0.5", 8081)
            .await
            .unwrap();

        let monitor = HeartbeatMonitor::new(
            registry.clone(),
            MonitorConfig {
                check_interval: Duration::from_secs(30),
                lease_timeout: Duration::from_secs(90),
                eviction_grace: Duration::ZERO,
            },
        );

        tokio::time::advance(Duration::from_secs(89)).await;
        let report = monitor.scan_once().await;
        assert!(report.marked_down.is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let report = monitor.scan_once().await;
        assert_eq!(report.marked_down.len(), 1);
        assert_eq!(report.evicted.len(), 1);
        assert!(registry.list_instances("inventory").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_lease_alive() {
        let registry = Arc::new(RegistryStore::new());
        let lease = registry
            .register("inventory", "a1", "10.0.0.5", 8081)
            .await
            .unwrap();
        let monitor = HeartbeatMonitor::new(registry.clone(), MonitorConfig::default());

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(25)).await;
            registry.renew(&lease).await.unwrap();
            let report = monitor.scan_once().await;
            assert!(report.marked_down.is_empty());
        }
        assert_eq!(registry.list_instances("inventory").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_evicts_on_schedule() {
        let registry = Arc::new(RegistryStore::new());
        registry
            .register("inventory", "a1", "10.0.0.5", 8081)
            .await
            .unwrap();

        let monitor = HeartbeatMonitor::new(
            registry.clone(),
            MonitorConfig {
                check_interval: Duration::from_secs(30),
                lease_timeout: Duration::from_secs(90),
                eviction_grace: Duration::ZERO,
            },
        );
        let handle = monitor.spawn();

        // Paused clock: sleeping past the lease timeout lets the interval
        // fire and the scan run before this task resumes.
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(registry.list_instances("inventory").await.is_empty());
        assert_eq!(registry.instance_count().await, 0);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_down_instance_revives_within_grace() {
        let registry = Arc::new(RegistryStore::new());
        let lease = registry
            .register("inventory", "a1", "10.0.0.5", 8081)
            .await
            .unwrap();
        let monitor = HeartbeatMonitor::new(
            registry.clone(),
            MonitorConfig {
                check_interval: Duration::from_secs(30),
                lease_timeout: Duration::from_secs(90),
                eviction_grace: Duration::from_secs(60),
            },
        );

        tokio::time::advance(Duration::from_secs(91)).await;
        let report = monitor.scan_once().await;
        assert_eq!(report.marked_down.len(), 1);
        assert!(report.evicted.is_empty());

        // The blip passes and the instance heartbeats again.
        registry.renew(&lease).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let report = monitor.scan_once().await;
        assert!(report.evicted.is_empty());

        let instances = registry.list_instances("inventory").await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].status, InstanceStatus::Up);
    }
}
