//! Load-balancing policies for selecting an instance per request

use dashmap::DashMap;
use junction_core::RouteTarget;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Selection strategy over the ordered target list of one service.
///
/// `select` is purely in-memory and must not block; targets arrive sorted by
/// instance id, so deterministic policies stay deterministic across routing
/// table rebuilds.
pub trait BalancePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index into `targets`, or `None` when the list is empty.
    fn select(&self, service: &str, targets: &[RouteTarget]) -> Option<usize>;

    /// Called when a forward attempt to the chosen instance begins.
    fn on_request_start(&self, _service: &str, _instance_id: &str) {}

    /// Called when the attempt finishes, success or not. Always paired with
    /// `on_request_start`.
    fn on_request_end(&self, _service: &str, _instance_id: &str) {}
}

/// Round-robin with an independent rotation cursor per service. The default
/// policy: with N targets, N consecutive requests visit each exactly once.
pub struct RoundRobin {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl BalancePolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(&self, service: &str, targets: &[RouteTarget]) -> Option<usize> {
        if targets.is_empty() {
            return None;
        }
        let cursor = self
            .cursors
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        Some(cursor.fetch_add(1, Ordering::Relaxed) % targets.len())
    }
}

/// Uniform random selection.
pub struct Random;

impl BalancePolicy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&self, _service: &str, targets: &[RouteTarget]) -> Option<usize> {
        if targets.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..targets.len()))
    }
}

/// Picks the instance with the fewest requests currently in flight; ties go
/// to the lexically lowest instance id.
pub struct LeastOutstanding {
    in_flight: DashMap<String, Arc<AtomicUsize>>,
}

impl LeastOutstanding {
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }

    fn gauge(&self, service: &str, instance_id: &str) -> Arc<AtomicUsize> {
        self.in_flight
            .entry(format!("{}/{}", service, instance_id))
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    fn load(&self, service: &str, instance_id: &str) -> usize {
        self.in_flight
            .get(&format!("{}/{}", service, instance_id))
            .map(|gauge| gauge.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Default for LeastOutstanding {
    fn default() -> Self {
        Self::new()
    }
}

impl BalancePolicy for LeastOutstanding {
    fn name(&self) -> &'static str {
        "least-outstanding"
    }

    fn select(&self, service: &str, targets: &[RouteTarget]) -> Option<usize> {
        targets
            .iter()
            .enumerate()
            .min_by_key(|(_, target)| self.load(service, &target.instance_id))
            .map(|(index, _)| index)
    }

    fn on_request_start(&self, service: &str, instance_id: &str) {
        self.gauge(service, instance_id).fetch_add(1, Ordering::Relaxed);
    }

    fn on_request_end(&self, service: &str, instance_id: &str) {
        self.gauge(service, instance_id).fetch_sub(1, Ordering::Relaxed);
    }
}

/// Resolve a policy by its configured name.
pub fn policy_from_name(name: &str) -> Option<Arc<dyn BalancePolicy>> {
    let policy: Arc<dyn BalancePolicy> = match name {
        "round-robin" => Arc::new(RoundRobin::new()),
        "random" => Arc::new(Random),
        "least-outstanding" => Arc::new(LeastOutstanding::new()),
        _ => return None,
    };
    debug!(policy = policy.name(), "load-balancing policy selected");
    Some(policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(ids: &[&str]) -> Vec<RouteTarget> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| RouteTarget {
                instance_id: id.to_string(),
                address: format!("10.0.0.{}", i + 1),
                port: 8080,
            })
            .collect()
    }

    #[test]
    fn test_round_robin_visits_each_once_per_cycle() {
        let policy = RoundRobin::new();
        let targets = targets(&["a1", "a2"]);

        let picks: Vec<usize> = (0..4)
            .map(|_| policy.select("inventory", &targets).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_round_robin_cursors_are_per_service() {
        let policy = RoundRobin::new();
        let inventory = targets(&["a1", "a2"]);
        let billing = targets(&["b1", "b2", "b3"]);

        assert_eq!(policy.select("inventory", &inventory), Some(0));
        // A different service starts its own rotation.
        assert_eq!(policy.select("billing", &billing), Some(0));
        assert_eq!(policy.select("inventory", &inventory), Some(1));
        assert_eq!(policy.select("billing", &billing), Some(1));
    }

    #[test]
    fn test_round_robin_empty_targets() {
        let policy = RoundRobin::new();
        assert_eq!(policy.select("inventory", &[]), None);
    }

    #[test]
    fn test_random_selects_in_bounds() {
        let policy = Random;
        let targets = targets(&["a1", "a2", "a3"]);
        for _ in 0..50 {
            let index = policy.select("inventory", &targets).unwrap();
            assert!(index < targets.len());
        }
        assert_eq!(policy.select("inventory", &[]), None);
    }

    #[test]
    fn test_least_outstanding_prefers_idle_instance() {
        let policy = LeastOutstanding::new();
        let targets = targets(&["a1", "a2"]);

        policy.on_request_start("inventory", "a1");
        assert_eq!(policy.select("inventory", &targets), Some(1));

        policy.on_request_start("inventory", "a2");
        policy.on_request_start("inventory", "a2");
        assert_eq!(policy.select("inventory", &targets), Some(0));

        policy.on_request_end("inventory", "a2");
        policy.on_request_end("inventory", "a2");
        policy.on_request_end("inventory", "a1");
        // All idle again: tie goes to the first (lexically lowest) target.
        assert_eq!(policy.select("inventory", &targets), Some(0));
    }

    #[test]
    fn test_policy_from_name() {
        assert!(policy_from_name("round-robin").is_some());
        assert!(policy_from_name("random").is_some());
        assert!(policy_from_name("least-outstanding").is_some());
        assert!(policy_from_name("sticky").is_none());
    }
}
