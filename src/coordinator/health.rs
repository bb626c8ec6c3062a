// # Cluster Health Tracker
//
// Servers learn about cluster topology passively: every client request
// carries the client's current health snapshot, and this tracker detects
// when the snapshot for a connection hash differs from the last one seen.
// A detected change is what triggers pool re-allocation on the request
// path; there is no dedicated health channel.

use dashmap::DashMap;

pub struct ClusterHealthTracker {
    last_seen: DashMap<String, String>,
}

impl ClusterHealthTracker {
    pub fn new() -> Self {
        Self {
            last_seen: DashMap::new(),
        }
    }

    /// Swaps in the new snapshot for the hash and reports whether it
    /// differed from the previous one. The first snapshot for a hash always
    /// counts as a change.
    pub fn has_health_changed(&self, conn_hash: &str, new_health: &str) -> bool {
        match self
            .last_seen
            .insert(conn_hash.to_string(), new_health.to_string())
        {
            None => true,
            Some(previous) => previous != new_health,
        }
    }

    /// Last snapshot seen for a hash, if any.
    pub fn last_seen(&self, conn_hash: &str) -> Option<String> {
        self.last_seen.get(conn_hash).map(|s| s.clone())
    }
}

impl Default for ClusterHealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_snapshot_counts_as_change() {
        let tracker = ClusterHealthTracker::new();
        assert!(tracker.has_health_changed("h", "s1:1059(UP);s2:1059(UP)"));
    }

    #[test]
    fn test_same_snapshot_twice_is_change_then_not() {
        let tracker = ClusterHealthTracker::new();
        let snapshot = "s1:1059(UP);s2:1059(DOWN)";
        assert!(tracker.has_health_changed("h", snapshot));
        assert!(!tracker.has_health_changed("h", snapshot));
    }

    #[test]
    fn test_changes_are_tracked_per_hash() {
        let tracker = ClusterHealthTracker::new();
        assert!(tracker.has_health_changed("h1", "s1:1059(UP)"));
        assert!(tracker.has_health_changed("h2", "s1:1059(UP)"));
        assert!(tracker.has_health_changed("h1", "s1:1059(DOWN)"));
        assert_eq!(tracker.last_seen("h1").unwrap(), "s1:1059(DOWN)");
    }
}
