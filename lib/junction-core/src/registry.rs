//! Registry store for service instances and lease book-keeping

use crate::{Instance, InstanceStatus, LeaseHandle, RegistryError, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Status-change events published for operators.
///
/// Renewals are deliberately not events: at one renewal per instance per
/// few seconds they would drown every other signal.
#[derive(Clone, Debug)]
pub enum InstanceEvent {
    Registered {
        service: String,
        instance_id: String,
    },
    StatusChanged {
        service: String,
        instance_id: String,
        status: InstanceStatus,
    },
    Evicted {
        service: String,
        instance_id: String,
    },
    Deregistered {
        service: String,
        instance_id: String,
    },
}

/// Outcome of one heartbeat-monitor scan.
#[derive(Debug, Default)]
pub struct ExpiryReport {
    pub marked_down: Vec<LeaseHandle>,
    pub evicted: Vec<LeaseHandle>,
}

/// In-memory mapping from service name to its live instances.
///
/// All mutations are serialized behind a single write lock; reads take the
/// shared lock and never touch the network. Every mutating call bumps a
/// monotonic version counter published through a watch channel, which the
/// routing table builder uses to skip recomputation when nothing changed.
pub struct RegistryStore {
    entries: RwLock<HashMap<String, HashMap<String, Instance>>>,
    version_tx: watch::Sender<u64>,
    events_tx: broadcast::Sender<InstanceEvent>,
}

impl RegistryStore {
    pub fn new() -> Self {
        let (version_tx, _) = watch::channel(0u64);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            version_tx,
            events_tx,
        }
    }

    /// Register an instance with status `Up`, or renew it if the identical
    /// identity is already present.
    pub async fn register(
        &self,
        service: &str,
        instance_id: &str,
        address: &str,
        port: u16,
    ) -> Result<LeaseHandle> {
        self.register_with_status(service, instance_id, address, port, InstanceStatus::Up)
            .await
    }

    /// Register an instance with an explicit initial status.
    ///
    /// Re-registering an identical `(instance_id, address, port)` identity is
    /// idempotent and acts as a renewal. The same id at a different address
    /// fails with `DuplicateInstance`.
    pub async fn register_with_status(
        &self,
        service: &str,
        instance_id: &str,
        address: &str,
        port: u16,
        status: InstanceStatus,
    ) -> Result<LeaseHandle> {
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries
            .get_mut(service)
            .and_then(|instances| instances.get_mut(instance_id))
        {
            if existing.address != address || existing.port != port {
                return Err(RegistryError::DuplicateInstance {
                    service: service.to_string(),
                    instance_id: instance_id.to_string(),
                });
            }
            existing.last_renewal = Instant::now();
            existing.status = status;
            existing.down_since = None;
            drop(entries);
            self.bump_version();
            debug!(service, instance_id, "re-registration renewed existing lease");
            return Ok(LeaseHandle::new(service, instance_id));
        }

        let instance = Instance::new(service, instance_id, address, port, status);
        entries
            .entry(service.to_string())
            .or_default()
            .insert(instance_id.to_string(), instance);
        drop(entries);

        self.bump_version();
        self.emit(InstanceEvent::Registered {
            service: service.to_string(),
            instance_id: instance_id.to_string(),
        });
        info!(service, instance_id, address, port, "registered instance");
        Ok(LeaseHandle::new(service, instance_id))
    }

    /// Reset the lease renewal timestamp. A `Down` instance that renews
    /// before eviction comes back `Up`; after eviction the lease is gone and
    /// the client must re-register.
    pub async fn renew(&self, lease: &LeaseHandle) -> Result<()> {
        let mut entries = self.entries.write().await;
        let instance = entries
            .get_mut(&lease.service_name)
            .and_then(|instances| instances.get_mut(&lease.instance_id))
            .ok_or_else(|| RegistryError::NotFound {
                service: lease.service_name.clone(),
                instance_id: lease.instance_id.clone(),
            })?;

        instance.last_renewal = Instant::now();
        let revived = instance.status == InstanceStatus::Down;
        if revived {
            instance.status = InstanceStatus::Up;
            instance.down_since = None;
        }
        drop(entries);

        self.bump_version();
        if revived {
            self.emit(InstanceEvent::StatusChanged {
                service: lease.service_name.clone(),
                instance_id: lease.instance_id.clone(),
                status: InstanceStatus::Up,
            });
            info!(
                service = %lease.service_name,
                instance_id = %lease.instance_id,
                "instance revived by renewal"
            );
        }
        Ok(())
    }

    /// Remove an instance. Idempotent: deregistering an absent instance is a
    /// successful no-op.
    pub async fn deregister(&self, lease: &LeaseHandle) {
        let mut entries = self.entries.write().await;
        let removed = match entries.get_mut(&lease.service_name) {
            Some(instances) => {
                let removed = instances.remove(&lease.instance_id).is_some();
                if instances.is_empty() {
                    entries.remove(&lease.service_name);
                }
                removed
            }
            None => false,
        };
        drop(entries);

        if removed {
            self.bump_version();
            self.emit(InstanceEvent::Deregistered {
                service: lease.service_name.clone(),
                instance_id: lease.instance_id.clone(),
            });
            info!(
                service = %lease.service_name,
                instance_id = %lease.instance_id,
                "deregistered instance"
            );
        }
    }

    /// Explicit status transition, e.g. `Starting` -> `Up` once a service
    /// finishes warming up.
    pub async fn set_status(&self, lease: &LeaseHandle, status: InstanceStatus) -> Result<()> {
        let mut entries = self.entries.write().await;
        let instance = entries
            .get_mut(&lease.service_name)
            .and_then(|instances| instances.get_mut(&lease.instance_id))
            .ok_or_else(|| RegistryError::NotFound {
                service: lease.service_name.clone(),
                instance_id: lease.instance_id.clone(),
            })?;

        let changed = instance.status != status;
        instance.status = status;
        if status != InstanceStatus::Down {
            instance.down_since = None;
        } else if instance.down_since.is_none() {
            instance.down_since = Some(Instant::now());
        }
        drop(entries);

        self.bump_version();
        if changed {
            self.emit(InstanceEvent::StatusChanged {
                service: lease.service_name.clone(),
                instance_id: lease.instance_id.clone(),
                status,
            });
        }
        Ok(())
    }

    /// `Up` instances of a service, sorted by instance id for deterministic
    /// round-robin. Purely in-memory.
    pub async fn list_instances(&self, service: &str) -> Vec<Instance> {
        let entries = self.entries.read().await;
        let mut instances: Vec<Instance> = entries
            .get(service)
            .map(|instances| {
                instances
                    .values()
                    .filter(|i| i.status == InstanceStatus::Up)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        instances
    }

    /// Cloned snapshot of every entry, any status, for iteration by the
    /// heartbeat monitor and the routing table builder.
    pub async fn all_entries(&self) -> HashMap<String, Vec<Instance>> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(service, instances)| {
                let mut instances: Vec<Instance> = instances.values().cloned().collect();
                instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
                (service.clone(), instances)
            })
            .collect()
    }

    /// One pass of lease expiry: instances whose lease outlived
    /// `lease_timeout` are marked `Down`; `Down` instances past the grace
    /// window are evicted. Runs under a single write lock so concurrent
    /// renewals are either fully before or fully after the scan.
    pub async fn expire_stale(
        &self,
        lease_timeout: Duration,
        eviction_grace: Duration,
    ) -> ExpiryReport {
        let now = Instant::now();
        let mut report = ExpiryReport::default();
        let mut entries = self.entries.write().await;

        for (service, instances) in entries.iter_mut() {
            for instance in instances.values_mut() {
                if instance.status != InstanceStatus::Down
                    && now.duration_since(instance.last_renewal) > lease_timeout
                {
                    instance.status = InstanceStatus::Down;
                    instance.down_since = Some(now);
                    report.marked_down.push(instance.lease_handle());
                }
            }

            let expired: Vec<String> = instances
                .values()
                .filter(|i| {
                    i.status == InstanceStatus::Down
                        && i.down_since
                            .map(|since| now.duration_since(since) >= eviction_grace)
                            .unwrap_or(false)
                })
                .map(|i| i.instance_id.clone())
                .collect();
            for instance_id in expired {
                instances.remove(&instance_id);
                report.evicted.push(LeaseHandle::new(service.clone(), instance_id));
            }
        }
        entries.retain(|_, instances| !instances.is_empty());
        drop(entries);

        if !report.marked_down.is_empty() || !report.evicted.is_empty() {
            self.bump_version();
        }
        for lease in &report.marked_down {
            self.emit(InstanceEvent::StatusChanged {
                service: lease.service_name.clone(),
                instance_id: lease.instance_id.clone(),
                status: InstanceStatus::Down,
            });
        }
        for lease in &report.evicted {
            self.emit(InstanceEvent::Evicted {
                service: lease.service_name.clone(),
                instance_id: lease.instance_id.clone(),
            });
        }
        report
    }

    /// Current registry version. Advances on every mutating call.
    pub fn version(&self) -> u64 {
        *self.version_tx.borrow()
    }

    /// Watch channel that fires whenever the version advances.
    pub fn subscribe_version(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Broadcast channel of instance status-change events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events_tx.subscribe()
    }

    pub async fn service_count(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn instance_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .map(|instances| instances.len())
            .sum()
    }

    fn bump_version(&self) {
        self.version_tx.send_modify(|v| *v += 1);
    }

    fn emit(&self, event: InstanceEvent) {
        // Nobody listening is fine; events are observability, not control flow.
        let _ = self.events_tx.send(event);
    }
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new()
    }
}
