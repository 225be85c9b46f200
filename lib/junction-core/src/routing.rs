//! Routing table snapshots derived from the registry
//!
//! The table is rebuilt as a whole and swapped in atomically; readers hold a
//! reference to one immutable snapshot and never observe a partial update.

use crate::{InstanceStatus, RegistryStore};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Shared handle to the current routing snapshot.
pub type SharedRoutingTable = Arc<ArcSwap<RoutingTable>>;

/// A routable address of one `Up` instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteTarget {
    pub instance_id: String,
    pub address: String,
    pub port: u16,
}

impl RouteTarget {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Read-optimized snapshot mapping service name to its routable targets.
///
/// Targets are sorted by instance id so round-robin selection is
/// deterministic across rebuilds.
pub struct RoutingTable {
    version: u64,
    built_at: Instant,
    routes: HashMap<String, Arc<Vec<RouteTarget>>>,
}

impl RoutingTable {
    pub fn empty() -> Self {
        Self {
            version: 0,
            built_at: Instant::now(),
            routes: HashMap::new(),
        }
    }

    /// Targets for a service; `None` when no `Up` instance exists.
    pub fn lookup(&self, service: &str) -> Option<Arc<Vec<RouteTarget>>> {
        self.routes
            .get(service)
            .filter(|targets| !targets.is_empty())
            .cloned()
    }

    /// Registry version this snapshot was built from.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Time since this snapshot was built.
    pub fn age(&self) -> Duration {
        self.built_at.elapsed()
    }

    pub fn service_count(&self) -> usize {
        self.routes.len()
    }

    pub fn target_count(&self) -> usize {
        self.routes.values().map(|targets| targets.len()).sum()
    }
}

/// Rebuilds the routing table whenever the registry version advances or a
/// maximum staleness interval elapses, whichever comes first.
pub struct RoutingTableBuilder {
    registry: Arc<RegistryStore>,
    table: SharedRoutingTable,
    max_staleness: Duration,
}

impl RoutingTableBuilder {
    pub fn new(registry: Arc<RegistryStore>, max_staleness: Duration) -> Self {
        Self {
            registry,
            table: Arc::new(ArcSwap::from_pointee(RoutingTable::empty())),
            max_staleness,
        }
    }

    /// Handle for readers. Cheap to clone; `load_full()` never blocks.
    pub fn table(&self) -> SharedRoutingTable {
        self.table.clone()
    }

    /// Recompute the table from the registry and swap it in.
    ///
    /// The version is read before the entry snapshot: if a mutation lands in
    /// between, the recorded version is older than the content and the next
    /// wakeup rebuilds again, which is safe. The reverse would let a rebuild
    /// be skipped while content is stale.
    pub async fn rebuild_now(&self) {
        let version = self.registry.version();
        let entries = self.registry.all_entries().await;

        let routes: HashMap<String, Arc<Vec<RouteTarget>>> = entries
            .into_iter()
            .filter_map(|(service, instances)| {
                let targets: Vec<RouteTarget> = instances
                    .into_iter()
                    .filter(|i| i.status == InstanceStatus::Up)
                    .map(|i| RouteTarget {
                        instance_id: i.instance_id,
                        address: i.address,
                        port: i.port,
                    })
                    .collect();
                if targets.is_empty() {
                    None
                } else {
                    Some((service, Arc::new(targets)))
                }
            })
            .collect();

        let table = RoutingTable {
            version,
            built_at: Instant::now(),
            routes,
        };
        debug!(
            version,
            services = table.service_count(),
            targets = table.target_count(),
            "routing table rebuilt"
        );
        self.table.store(Arc::new(table));
    }

    /// Run the rebuild loop until the registry is dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        let mut version_rx = self.registry.subscribe_version();
        tokio::spawn(async move {
            let mut staleness_tick = tokio::time::interval(self.max_staleness);
            staleness_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = version_rx.changed() => {
                        if changed.is_err() {
                            warn!("registry dropped, stopping routing table builder");
                            break;
                        }
                        self.rebuild_now().await;
                    }
                    _ = staleness_tick.tick() => {
                        if self.table.load().version() != self.registry.version() {
                            self.rebuild_now().await;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InstanceStatus;

    #[tokio::test]
    async fn test_rebuild_contains_only_up_instances() {
        let registry = Arc::new(RegistryStore::new());
        registry
            .register("inventory", "a1", "10.0.0.5", 8081)
            .await
            .unwrap();
        registry
            .register_with_status("inventory", "b2", "10.0.0.6", 8082, InstanceStatus::Starting)
            .await
            .unwrap();

        let builder = RoutingTableBuilder::new(registry, Duration::from_secs(5));
        builder.rebuild_now().await;

        let table = builder.table().load_full();
        let targets = table.lookup("inventory").unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].instance_id, "a1");
        assert_eq!(targets[0].authority(), "10.0.0.5:8081");
    }

    #[tokio::test]
    async fn test_lookup_unknown_service() {
        let registry = Arc::new(RegistryStore::new());
        let builder = RoutingTableBuilder::new(registry, Duration::from_secs(5));
        builder.rebuild_now().await;

        assert!(builder.table().load_full().lookup("billing").is_none());
    }

    #[tokio::test]
    async fn test_targets_sorted_by_instance_id() {
        let registry = Arc::new(RegistryStore::new());
        registry
            .register("inventory", "b2", "10.0.0.6", 8082)
            .await
            .unwrap();
        registry
            .register("inventory", "a1", "10.0.0.5", 8081)
            .await
            .unwrap();

        let builder = RoutingTableBuilder::new(registry, Duration::from_secs(5));
        builder.rebuild_now().await;

        let table = builder.table().load_full();
        let targets = table.lookup("inventory").unwrap();
        let ids: Vec<&str> = targets
            .iter()
            .map(|t| t.instance_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a1", "b2"]);
    }

    #[tokio::test]
    async fn test_old_snapshot_stays_consistent_across_rebuild() {
        let registry = Arc::new(RegistryStore::new());
        registry
            .register("inventory", "a1", "10.0.0.5", 8081)
            .await
            .unwrap();

        let builder = RoutingTableBuilder::new(registry.clone(), Duration::from_secs(5));
        builder.rebuild_now().await;
        let old = builder.table().load_full();

        registry
            .register("inventory", "b2", "10.0.0.6", 8082)
            .await
            .unwrap();
        builder.rebuild_now().await;

        // The held snapshot still shows exactly the old membership; the
        // freshly loaded one shows exactly the new membership.
        assert_eq!(old.lookup("inventory").unwrap().len(), 1);
        let new = builder.table().load_full();
        assert_eq!(new.lookup("inventory").unwrap().len(), 2);
        assert!(new.version() > old.version());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_instance_absent_after_rebuild() {
        let registry = Arc::new(RegistryStore::new());
        registry
            .register("inventory", "a1", "10.0.0.5", 8081)
            .await
            .unwrap();

        let builder = RoutingTableBuilder::new(registry.clone(), Duration::from_secs(5));
        builder.rebuild_now().await;
        assert!(builder.table().load_full().lookup("inventory").is_some());

        tokio::time::advance(Duration::from_secs(91)).await;
        registry
            .expire_stale(Duration::from_secs(90), Duration::ZERO)
            .await;
        builder.rebuild_now().await;

        assert!(builder.table().load_full().lookup("inventory").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_builder_rebuilds_on_version_change() {
        let registry = Arc::new(RegistryStore::new());
        let builder = RoutingTableBuilder::new(registry.clone(), Duration::from_secs(5));
        let table = builder.table();
        let handle = builder.spawn();

        registry
            .register("inventory", "a1", "10.0.0.5", 8081)
            .await
            .unwrap();
        // Yield so the builder task observes the version change.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(table.load_full().lookup("inventory").is_some());
        handle.abort();
    }
}
