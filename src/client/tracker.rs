// # Session Tracker
//
// Client-side registry of which server each bound session lives on. Every
// binding write goes through here, so the diagnostic dump of bound sessions
// is authoritative.

use crate::cluster::Endpoint;
use dashmap::DashMap;
use uuid::Uuid;

pub struct SessionTracker {
    bindings: DashMap<Uuid, Endpoint>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            bindings: DashMap::new(),
        }
    }

    pub fn register(&self, session_uuid: Uuid, endpoint: Endpoint) {
        if let Some(previous) = self.bindings.insert(session_uuid, endpoint.clone()) {
            tracing::warn!(
                "Session {} re-bound from {} to {}",
                session_uuid,
                previous,
                endpoint
            );
        } else {
            tracing::debug!("Session {} bound to {}", session_uuid, endpoint);
        }
    }

    pub fn unregister(&self, session_uuid: Uuid) -> Option<Endpoint> {
        self.bindings.remove(&session_uuid).map(|(_, ep)| ep)
    }

    pub fn endpoint_for(&self, session_uuid: Uuid) -> Option<Endpoint> {
        self.bindings.get(&session_uuid).map(|ep| ep.clone())
    }

    /// All current bindings, for diagnostics.
    pub fn bound_sessions(&self) -> Vec<(Uuid, Endpoint)> {
        self.bindings
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Number of sessions currently bound to an endpoint; used as the local
    /// load hint when picking a server for a new session.
    pub fn sessions_on(&self, endpoint: &Endpoint) -> usize {
        self.bindings
            .iter()
            .filter(|entry| entry.value() == endpoint)
            .count()
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_affinity() {
        let tracker = SessionTracker::new();
        let uuid = Uuid::new_v4();
        let ep = Endpoint::new("server1", 1059);

        tracker.register(uuid, ep.clone());
        assert_eq!(tracker.endpoint_for(uuid), Some(ep.clone()));
        assert_eq!(tracker.sessions_on(&ep), 1);

        assert_eq!(tracker.unregister(uuid), Some(ep));
        assert_eq!(tracker.endpoint_for(uuid), None);
    }

    #[test]
    fn test_every_registered_session_resolves() {
        let tracker = SessionTracker::new();
        let eps = [Endpoint::new("s1", 1059), Endpoint::new("s2", 1059)];
        let mut uuids = Vec::new();
        for i in 0..20 {
            let uuid = Uuid::new_v4();
            tracker.register(uuid, eps[i % 2].clone());
            uuids.push((uuid, eps[i % 2].clone()));
        }
        for (uuid, ep) in &uuids {
            assert_eq!(tracker.endpoint_for(*uuid).as_ref(), Some(ep));
        }
        assert_eq!(tracker.bound_sessions().len(), 20);
    }
}
