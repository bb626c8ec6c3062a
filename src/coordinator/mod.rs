// # Multinode Pool Coordinator
//
// Divides a client-requested pool size across the healthy servers of the
// cluster so aggregate capacity tracks the requested limit. Every server
// runs the same arithmetic over the same connection hash and the same
// healthy count, so the cluster converges without any server-to-server
// coordination traffic.

pub mod health;

use dashmap::DashMap;

pub use health::ClusterHealthTracker;

/// Recorded sizing request for one connection hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolAllocation {
    pub requested_max: u32,
    pub requested_min_idle: u32,
    pub healthy_servers: u32,
}

impl PoolAllocation {
    /// This server's share of the requested maximum. Every healthy server
    /// gets at least one connection.
    pub fn current_max(&self) -> u32 {
        (self.requested_max / self.healthy_servers.max(1)).max(1)
    }

    /// This server's share of the requested idle floor.
    pub fn current_min_idle(&self) -> u32 {
        (self.requested_min_idle / self.healthy_servers.max(1)).min(self.current_max())
    }
}

/// Per-connection-hash allocation state.
pub struct MultinodePoolCoordinator {
    allocations: DashMap<String, PoolAllocation>,
}

impl MultinodePoolCoordinator {
    pub fn new() -> Self {
        Self {
            allocations: DashMap::new(),
        }
    }

    /// Records the client's request and returns the divided sizes for this
    /// server, assuming all listed endpoints are initially healthy.
    pub fn calculate_pool_sizes(
        &self,
        conn_hash: &str,
        requested_max: u32,
        requested_min_idle: u32,
        server_count: usize,
    ) -> (u32, u32) {
        let allocation = PoolAllocation {
            requested_max,
            requested_min_idle,
            healthy_servers: server_count.max(1) as u32,
        };
        let sizes = (allocation.current_max(), allocation.current_min_idle());
        tracing::debug!(
            "Pool sizing for {}: requested ({}, {}) across {} servers -> ({}, {})",
            conn_hash,
            requested_max,
            requested_min_idle,
            server_count,
            sizes.0,
            sizes.1
        );
        self.allocations.insert(conn_hash.to_string(), allocation);
        sizes
    }

    /// Recomputes the allocation after a healthy-count change. Returns the
    /// new divided sizes, or `None` when nothing is recorded for the hash or
    /// the count did not actually change.
    pub fn update_healthy_servers(&self, conn_hash: &str, healthy: usize) -> Option<(u32, u32)> {
        let mut allocation = self.allocations.get_mut(conn_hash)?;
        let healthy = healthy.max(1) as u32;
        if allocation.healthy_servers == healthy {
            return None;
        }
        tracing::info!(
            "Healthy server count for {} changed {} -> {}",
            conn_hash,
            allocation.healthy_servers,
            healthy
        );
        allocation.healthy_servers = healthy;
        Some((allocation.current_max(), allocation.current_min_idle()))
    }

    /// Lock-free snapshot of the recorded allocation.
    pub fn allocation(&self, conn_hash: &str) -> Option<PoolAllocation> {
        self.allocations.get(conn_hash).map(|a| a.clone())
    }
}

impl Default for MultinodePoolCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
