//! Core service registry and routing state
//!
//! This library provides:
//! - Registry store for managing service instances and their leases
//! - Heartbeat monitor that expires instances with stale leases
//! - Routing table builder producing immutable routing snapshots

pub mod error;
pub mod instance;
pub mod monitor;
pub mod registry;
pub mod routing;

pub use error::{RegistryError, Result};
pub use instance::{Instance, InstanceStatus, LeaseHandle};
pub use monitor::{HeartbeatMonitor, MonitorConfig};
pub use registry::{ExpiryReport, InstanceEvent, RegistryStore};
pub use routing::{RouteTarget, RoutingTable, RoutingTableBuilder, SharedRoutingTable};
