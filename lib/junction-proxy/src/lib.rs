//! Gateway routing front door
//!
//! This library provides:
//! - Request forwarder with pooled connections and bounded timeouts
//! - Pluggable load-balancing policies (round-robin by default)
//! - The per-request gateway state machine with failover retry
//! - Registration protocol handlers and Prometheus metrics

pub mod api;
pub mod balance;
pub mod forwarder;
pub mod gateway;
pub mod metrics;

pub use api::ControlApi;
pub use balance::{policy_from_name, BalancePolicy, LeastOutstanding, Random, RoundRobin};
pub use forwarder::{ForwardError, Forwarder};
pub use gateway::{Gateway, GatewayError};
pub use metrics::MetricsCollector;
