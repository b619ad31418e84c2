//! DispatchRouter: the front-edge strategy that maps a new client
//! session to a worker instance id. This is the stateless half of the
//! routing layer; `autoscale` delegates the stateful part to
//! [`crate::coordinator::LoadCoordinator`].

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    Session,
    Shared,
    Pool,
    Autoscale,
}

impl RoutingMode {
    pub fn from_env_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "session" => Some(Self::Session),
            "shared" => Some(Self::Shared),
            "pool" => Some(Self::Pool),
            "autoscale" => Some(Self::Autoscale),
            _ => None,
        }
    }
}

/// A 32-bit multiply-shift hash applied to UTF-16 code units, so a given
/// `sessionId` always lands on the same pool slot regardless of which
/// proxy implementation is fronting it.
pub fn pool_hash(session_id: &str) -> u32 {
    let mut h: u32 = 0;
    for unit in session_id.encode_utf16() {
        h = h
            .wrapping_shl(5)
            .wrapping_sub(h)
            .wrapping_add(unit as u32);
    }
    h
}

/// Stateless routing strategies (`session`/`shared`/`pool`). `autoscale` is
/// not handled here; the caller checks `RoutingMode::Autoscale` first and
/// routes to the `LoadCoordinator` instead.
pub struct DispatchRouter {
    pub mode: RoutingMode,
    pub pool_size: usize,
}

impl DispatchRouter {
    pub fn new(mode: RoutingMode, pool_size: usize) -> Self {
        Self { mode, pool_size }
    }

    /// Resolves a worker instance id for a stateless strategy. Panics if
    /// called with `RoutingMode::Autoscale`: that strategy has no
    /// stateless answer, the caller must consult the coordinator.
    pub fn route(&self, session_id: Option<&str>) -> String {
        match self.mode {
            RoutingMode::Session => session_id
                .map(|s| s.to_string())
                .unwrap_or_else(|| "anonymous".to_string()),
            RoutingMode::Shared => "shared".to_string(),
            RoutingMode::Pool => {
                let slot = match session_id {
                    Some(s) => (pool_hash(s) as usize) % self.pool_size,
                    None => rand::thread_rng().gen_range(0..self.pool_size),
                };
                format!("pool-{slot}")
            }
            RoutingMode::Autoscale => {
                panic!("autoscale routing must go through LoadCoordinator::assign")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_hash_is_stable_for_a_given_session_id() {
        let a = pool_hash("abc");
        let b = pool_hash("abc");
        assert_eq!(a, b);
    }

    #[test]
    fn pool_routing_is_deterministic_for_fixed_pool_size() {
        let router = DispatchRouter::new(RoutingMode::Pool, 5);
        let first = router.route(Some("abc"));
        let second = router.route(Some("abc"));
        assert_eq!(first, second);
        assert!(first.starts_with("pool-"));
    }

    #[test]
    fn session_routing_uses_session_id_verbatim() {
        let router = DispatchRouter::new(RoutingMode::Session, 5);
        assert_eq!(router.route(Some("user-42")), "user-42");
    }

    #[test]
    fn shared_routing_is_constant() {
        let router = DispatchRouter::new(RoutingMode::Shared, 5);
        assert_eq!(router.route(Some("anything")), "shared");
        assert_eq!(router.route(None), "shared");
    }

    #[test]
    fn pool_routing_without_session_id_stays_within_pool_size() {
        let router = DispatchRouter::new(RoutingMode::Pool, 3);
        for _ in 0..50 {
            let worker = router.route(None);
            let slot: usize = worker.strip_prefix("pool-").unwrap().parse().unwrap();
            assert!(slot < 3);
        }
    }
}
