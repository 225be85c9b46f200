//! Instance and lease data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Lifecycle status of a registered instance.
///
/// Only `Up` instances are routable. `Starting` instances hold a lease but
/// are excluded from routing until promoted via a status update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Starting,
    Up,
    Down,
}

/// One running replica of a named service.
///
/// Owned exclusively by the [`RegistryStore`](crate::RegistryStore): created
/// on registration, mutated on renewal and status changes, removed on
/// deregistration or lease expiry.
#[derive(Clone, Debug)]
pub struct Instance {
    pub service_name: String,
    pub instance_id: String,
    pub address: String,
    pub port: u16,
    pub status: InstanceStatus,
    /// Wall-clock registration time, for observability only.
    pub registered_at: DateTime<Utc>,
    /// Monotonic timestamp of the last lease renewal.
    pub last_renewal: Instant,
    /// Set when the heartbeat monitor marks the instance down; drives the
    /// eviction grace window.
    pub down_since: Option<Instant>,
}

impl Instance {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        status: InstanceStatus,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            address: address.into(),
            port,
            status,
            registered_at: Utc::now(),
            last_renewal: Instant::now(),
            down_since: None,
        }
    }

    /// `address:port`, the authority component of downstream URLs.
    pub fn target_authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn lease_handle(&self) -> LeaseHandle {
        LeaseHandle {
            service_name: self.service_name.clone(),
            instance_id: self.instance_id.clone(),
        }
    }
}

/// A claim on a registered instance, returned by registration and consumed
/// by renewal and deregistration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LeaseHandle {
    pub service_name: String,
    pub instance_id: String,
}

impl LeaseHandle {
    pub fn new(service_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
        }
    }
}
