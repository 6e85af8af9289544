use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::models::PeerAddress;

type Counts = Arc<Mutex<HashMap<PeerAddress, u32>>>;

/// Selection policy for chunk sources: per-peer admission control shared by
/// every task of the node. A peer is available while its assigned task
/// count is below the cap.
pub struct LoadBalancer {
    counts: Counts,
    max_tasks_per_peer: u32,
    select_attempts: u32,
    poll_interval: Duration,
}

/// Holding a lease keeps the peer's assigned count incremented; dropping it
/// releases exactly once, whatever path the attempt took.
pub struct PeerLease {
    peer: PeerAddress,
    counts: Counts,
}

impl PeerLease {
    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }
}

impl Drop for PeerLease {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().unwrap();
        if let Some(count) = counts.get_mut(&self.peer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.peer);
            }
        }
    }
}

impl LoadBalancer {
    pub fn new(max_tasks_per_peer: u32, select_attempts: u32, poll_interval: Duration) -> Self {
        Self {
            counts: Arc::new(Mutex::new(HashMap::new())),
            max_tasks_per_peer,
            select_attempts,
            poll_interval,
        }
    }

    /// Bounded wait for an eligible peer: up to `select_attempts` tries one
    /// poll interval apart, aborting immediately once `cancelled` reports
    /// true. Among eligible candidates the least-loaded wins, ties broken
    /// by candidate-list order.
    pub async fn select_available_peer(
        &self,
        candidates: &[PeerAddress],
        used: &HashSet<PeerAddress>,
        cancelled: impl Fn() -> bool,
    ) -> Option<PeerLease> {
        for attempt in 0..self.select_attempts {
            if cancelled() {
                return None;
            }
            if let Some(lease) = self.try_select(candidates, used) {
                return Some(lease);
            }
            if attempt + 1 < self.select_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        debug!(attempts = self.select_attempts, "no available peer");
        None
    }

    fn try_select(
        &self,
        candidates: &[PeerAddress],
        used: &HashSet<PeerAddress>,
    ) -> Option<PeerLease> {
        let mut counts = self.counts.lock().unwrap();
        let mut best: Option<(&PeerAddress, u32)> = None;
        for candidate in candidates {
            if used.contains(candidate) {
                continue;
            }
            let count = counts.get(candidate).copied().unwrap_or(0);
            if count >= self.max_tasks_per_peer {
                continue;
            }
            // Strict `<` keeps the first of equally loaded candidates.
            if best.map(|(_, current)| count < current).unwrap_or(true) {
                best = Some((candidate, count));
            }
        }
        let (peer, _) = best?;
        let peer = peer.clone();
        *counts.entry(peer.clone()).or_insert(0) += 1;
        drop(counts);
        Some(PeerLease {
            peer,
            counts: self.counts.clone(),
        })
    }

    pub fn assigned_count(&self, peer: &PeerAddress) -> u32 {
        self.counts.lock().unwrap().get(peer).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use crate::models::PeerAddress;
    use crate::peer::balancer::LoadBalancer;

    fn peer(n: u8) -> PeerAddress {
        PeerAddress::new(format!("10.0.0.{}", n), 9000)
    }

    fn balancer() -> LoadBalancer {
        LoadBalancer::new(3, 2, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn selects_least_loaded_with_deterministic_tie_break() {
        let balancer = balancer();
        let candidates = vec![peer(1), peer(2)];
        let none_used = HashSet::new();

        // Tie at zero: candidate-list order wins.
        let first = balancer
            .select_available_peer(&candidates, &none_used, || false)
            .await
            .unwrap();
        assert_eq!(*first.peer(), peer(1));

        // Peer 1 now carries load, so peer 2 is the minimum.
        let second = balancer
            .select_available_peer(&candidates, &none_used, || false)
            .await
            .unwrap();
        assert_eq!(*second.peer(), peer(2));
    }

    #[tokio::test]
    async fn lease_drop_releases_exactly_once() {
        let balancer = balancer();
        let candidates = vec![peer(1)];
        let none_used = HashSet::new();
        let lease = balancer
            .select_available_peer(&candidates, &none_used, || false)
            .await
            .unwrap();
        assert_eq!(balancer.assigned_count(&peer(1)), 1);
        drop(lease);
        assert_eq!(balancer.assigned_count(&peer(1)), 0);
    }

    #[tokio::test]
    async fn cap_is_never_exceeded() {
        let balancer = balancer();
        let candidates = vec![peer(1)];
        let none_used = HashSet::new();
        let mut leases = vec![];
        for _ in 0..3 {
            leases.push(
                balancer
                    .select_available_peer(&candidates, &none_used, || false)
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(balancer.assigned_count(&peer(1)), 3);

        // Fourth request finds nobody within the attempt budget.
        assert!(balancer
            .select_available_peer(&candidates, &none_used, || false)
            .await
            .is_none());

        drop(leases);
        assert_eq!(balancer.assigned_count(&peer(1)), 0);
    }

    #[tokio::test]
    async fn used_peers_are_excluded() {
        let balancer = balancer();
        let candidates = vec![peer(1), peer(2)];
        let used = HashSet::from([peer(1)]);
        let lease = balancer
            .select_available_peer(&candidates, &used, || false)
            .await
            .unwrap();
        assert_eq!(*lease.peer(), peer(2));

        let all_used = HashSet::from([peer(1), peer(2)]);
        assert!(balancer
            .select_available_peer(&candidates, &all_used, || false)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn cancellation_aborts_the_wait() {
        let balancer = LoadBalancer::new(3, 1000, Duration::from_millis(5));
        let candidates = vec![];
        let none_used = HashSet::new();
        let started = std::time::Instant::now();
        let selected = balancer
            .select_available_peer(&candidates, &none_used, || true)
            .await;
        assert!(selected.is_none());
        // Aborted on the first poll, not after 1000 attempts.
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
