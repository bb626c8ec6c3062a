// # Multinode Connection Manager
//
// The client-side router. Holds the endpoint list parsed from the
// multinode URL, a channel and a health flag per endpoint, and the
// session-to-server bindings. Routing rules:
//
// 1. A bound session always routes to its bound endpoint; sessions are
//    never migrated. If the endpoint is DOWN the call fails fast with a
//    connection-level error.
// 2. A new non-XA session prefers UP endpoints, ties broken by the lowest
//    bound-session count, then round robin.
// 3. XA (and unified-mode) connects go to EVERY endpoint; the first
//    binding is the primary.
//
// Health flips DOWN only when the classifier says a failure was
// connection-level; a later successful call to the endpoint flips it UP.

use crate::classify::ErrorClassifier;
use crate::cluster::{format_cluster_health, Endpoint};
use crate::error::{ProxyError, Result, RpcStatus};
use crate::protocol::{ConnectionDetails, Request, Response, SessionInfo};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::channel::RpcChannel;
use super::tracker::SessionTracker;

/// Default per-call deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

struct EndpointState {
    channel: RpcChannel,
    healthy: AtomicBool,
}

/// Result of a connect: the primary session plus every binding (one for
/// non-XA, one per server in unified mode).
#[derive(Debug, Clone)]
pub struct ConnectResult {
    pub primary: SessionInfo,
    pub bindings: Vec<SessionInfo>,
}

pub struct MultinodeConnectionManager {
    /// Endpoint order fixed at startup; cluster-health strings follow it.
    endpoints: Vec<Endpoint>,
    states: DashMap<Endpoint, Arc<EndpointState>>,
    tracker: SessionTracker,
    round_robin: AtomicUsize,
    client_uuid: Uuid,
    deadline: Duration,
}

impl MultinodeConnectionManager {
    pub fn new(endpoints: Vec<Endpoint>, deadline: Duration) -> Self {
        let states = DashMap::new();
        for endpoint in &endpoints {
            states.insert(
                endpoint.clone(),
                Arc::new(EndpointState {
                    channel: RpcChannel::new(endpoint.clone(), deadline),
                    healthy: AtomicBool::new(true),
                }),
            );
        }
        Self {
            endpoints,
            states,
            tracker: SessionTracker::new(),
            round_robin: AtomicUsize::new(0),
            client_uuid: Uuid::new_v4(),
            deadline,
        }
    }

    pub fn client_uuid(&self) -> Uuid {
        self.client_uuid
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub fn is_healthy(&self, endpoint: &Endpoint) -> bool {
        self.states
            .get(endpoint)
            .map(|s| s.healthy.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Flips the endpoint DOWN, but only for connection-level causes.
    pub fn mark_unhealthy(&self, endpoint: &Endpoint, cause: &ProxyError) {
        if !ErrorClassifier::is_connection_level(cause) {
            return;
        }
        if let Some(state) = self.states.get(endpoint) {
            if state.healthy.swap(false, Ordering::SeqCst) {
                tracing::warn!("Endpoint {} marked DOWN: {}", endpoint, cause);
            }
        }
    }

    pub fn mark_healthy(&self, endpoint: &Endpoint) {
        if let Some(state) = self.states.get(endpoint) {
            if !state.healthy.swap(true, Ordering::SeqCst) {
                tracing::info!("Endpoint {} recovered, marked UP", endpoint);
            }
        }
    }

    /// Cancels every in-flight and future call on this client's channels.
    /// This is the shutdown path; cancellation surfaces to callers as a
    /// connection-level `Cancelled` status.
    pub fn cancel_all(&self) {
        for state in self.states.iter() {
            state.value().channel.cancel();
        }
    }

    /// Deterministic cluster-health snapshot in startup endpoint order.
    pub fn generate_cluster_health(&self) -> String {
        let states: Vec<(Endpoint, bool)> = self
            .endpoints
            .iter()
            .map(|ep| (ep.clone(), self.is_healthy(ep)))
            .collect();
        format_cluster_health(&states)
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// The endpoint a bound session lives on. Unknown sessions are a hard
    /// error with an authoritative dump of current bindings.
    pub fn affinity_server(&self, session_uuid: Uuid) -> Result<Endpoint> {
        self.tracker.endpoint_for(session_uuid).ok_or_else(|| {
            let bound = self
                .tracker
                .bound_sessions()
                .iter()
                .map(|(uuid, ep)| format!("{}@{}", uuid, ep))
                .collect::<Vec<_>>()
                .join(", ");
            ProxyError::SessionNotBound(format!(
                "Session {} has no associated server; available bound sessions: [{}]",
                session_uuid, bound
            ))
        })
    }

    /// Picks the endpoint for a new single-server session: UP endpoints
    /// only, fewest bound sessions first, round robin among ties.
    fn choose_endpoint(&self) -> Result<Endpoint> {
        let healthy: Vec<&Endpoint> = self
            .endpoints
            .iter()
            .filter(|ep| self.is_healthy(ep))
            .collect();
        if healthy.is_empty() {
            return Err(ProxyError::rpc(
                RpcStatus::Unavailable,
                "no healthy server endpoints".to_string(),
            ));
        }
        let min_load = healthy
            .iter()
            .map(|ep| self.tracker.sessions_on(ep))
            .min()
            .unwrap_or(0);
        let least_loaded: Vec<&Endpoint> = healthy
            .into_iter()
            .filter(|ep| self.tracker.sessions_on(ep) == min_load)
            .collect();
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % least_loaded.len();
        Ok(least_loaded[index].clone())
    }

    /// Sends a request to a specific endpoint, updating health from the
    /// outcome.
    pub async fn call_endpoint(&self, endpoint: &Endpoint, request: &Request) -> Result<Response> {
        let state = self.states.get(endpoint).map(|s| s.clone()).ok_or_else(|| {
            ProxyError::Configuration(format!("endpoint {} is not part of this cluster", endpoint))
        })?;
        let result = state.channel.call(request).await;
        match &result {
            Ok(_) => self.mark_healthy(endpoint),
            Err(e) => self.mark_unhealthy(endpoint, e),
        }
        result
    }

    /// Probes an endpoint for liveness. A successful round-trip flips the
    /// endpoint back UP; the returned value is the server's active-session
    /// count, usable as a load hint.
    pub async fn ping(&self, endpoint: &Endpoint) -> Result<u32> {
        match self.call_endpoint(endpoint, &Request::Ping).await? {
            Response::Pong { active_sessions } => Ok(active_sessions),
            other => Err(ProxyError::Internal(format!(
                "unexpected response to ping: {:?}",
                other
            ))),
        }
    }

    /// Routes a session-scoped request to the session's bound endpoint.
    /// DOWN endpoints fail fast; sessions are never silently migrated.
    pub async fn call_on_session(&self, session_uuid: Uuid, request: &Request) -> Result<Response> {
        let endpoint = self.affinity_server(session_uuid)?;
        if !self.is_healthy(&endpoint) {
            return Err(ProxyError::rpc(
                RpcStatus::Unavailable,
                format!("bound endpoint {} is DOWN", endpoint),
            ));
        }
        self.call_endpoint(&endpoint, request).await
    }

    // ------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------

    /// Opens a logical session. XA connections go to every endpoint
    /// (unified mode) with the first binding as primary; non-XA picks one
    /// endpoint by the routing rules.
    pub async fn connect(
        &self,
        url: &str,
        user: &str,
        password: &str,
        properties: &HashMap<String, String>,
        is_xa: bool,
    ) -> Result<ConnectResult> {
        let details = ConnectionDetails {
            url: url.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            client_uuid: self.client_uuid,
            is_xa,
            properties: properties.clone(),
            server_endpoints: self.endpoints.iter().map(|ep| ep.to_string()).collect(),
            cluster_health: self.generate_cluster_health(),
        };

        if is_xa {
            self.connect_to_all(details).await
        } else {
            self.connect_to_one(details).await
        }
    }

    async fn connect_to_one(&self, details: ConnectionDetails) -> Result<ConnectResult> {
        let endpoint = self.choose_endpoint()?;
        let info = self.connect_endpoint(&endpoint, &details).await?;
        Ok(ConnectResult {
            primary: info.clone(),
            bindings: vec![info],
        })
    }

    async fn connect_to_all(&self, details: ConnectionDetails) -> Result<ConnectResult> {
        let mut bindings = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            match self.connect_endpoint(endpoint, &details).await {
                Ok(info) => bindings.push(info),
                Err(e) => {
                    self.rollback_partial_connect(&bindings).await;
                    return Err(e);
                }
            }
        }
        let primary = bindings
            .first()
            .cloned()
            .ok_or_else(|| ProxyError::Internal("connect produced no bindings".to_string()))?;
        tracing::debug!(
            "Unified connect: {} bindings, primary session {} on {}",
            bindings.len(),
            primary.session_uuid,
            primary.target_server
        );
        Ok(ConnectResult { primary, bindings })
    }

    /// Unwinds the sessions a unified connect created before failing
    /// part-way. Without this the already-connected servers keep a
    /// registered session and a borrowed backend that no caller ever
    /// learns the UUID of, so they could never be terminated.
    async fn rollback_partial_connect(&self, bindings: &[SessionInfo]) {
        for session in bindings {
            if let Err(e) = self.terminate(session).await {
                tracing::warn!(
                    "Failed to unwind session {} on {} after partial unified connect: {}",
                    session.session_uuid,
                    session.target_server,
                    e
                );
            }
        }
    }

    async fn connect_endpoint(
        &self,
        endpoint: &Endpoint,
        details: &ConnectionDetails,
    ) -> Result<SessionInfo> {
        match self
            .call_endpoint(endpoint, &Request::Connect(details.clone()))
            .await?
        {
            Response::Connected(info) => {
                self.tracker.register(info.session_uuid, endpoint.clone());
                Ok(info)
            }
            other => Err(ProxyError::Internal(format!(
                "unexpected response to connect: {:?}",
                other
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Fan-out and termination
    // ------------------------------------------------------------------

    /// Runs one request per bound session, sequentially, collecting each
    /// server's outcome. Used for XA phase fan-out.
    pub async fn execute_on_all_servers<F>(
        &self,
        sessions: &[SessionInfo],
        build_request: F,
    ) -> Vec<(SessionInfo, Result<Response>)>
    where
        F: Fn(&SessionInfo) -> Request,
    {
        let mut results = Vec::with_capacity(sessions.len());
        for session in sessions {
            let request = build_request(session);
            let outcome = self.call_on_session(session.session_uuid, &request).await;
            results.push((session.clone(), outcome));
        }
        results
    }

    /// Terminates a bound session and drops its binding.
    pub async fn terminate(&self, session: &SessionInfo) -> Result<()> {
        let request = Request::TerminateSession {
            session: session.clone(),
            cluster_health: self.generate_cluster_health(),
        };
        let result = self.call_on_session(session.session_uuid, &request).await;
        self.tracker.unregister(session.session_uuid);
        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(n: usize) -> MultinodeConnectionManager {
        let endpoints: Vec<Endpoint> = (1..=n)
            .map(|i| Endpoint::new(format!("server{}", i), 1059))
            .collect();
        MultinodeConnectionManager::new(endpoints, DEFAULT_DEADLINE)
    }

    #[test]
    fn test_cluster_health_reflects_transitions() {
        let m = manager(2);
        assert_eq!(
            m.generate_cluster_health(),
            "server1:1059(UP);server2:1059(UP)"
        );

        let down = Endpoint::new("server2", 1059);
        m.mark_unhealthy(
            &down,
            &ProxyError::rpc(RpcStatus::Unavailable, "connection refused"),
        );
        assert_eq!(
            m.generate_cluster_health(),
            "server1:1059(UP);server2:1059(DOWN)"
        );

        m.mark_healthy(&down);
        assert_eq!(
            m.generate_cluster_health(),
            "server1:1059(UP);server2:1059(UP)"
        );
    }

    #[test]
    fn test_mark_unhealthy_ignores_database_errors() {
        let m = manager(2);
        let ep = Endpoint::new("server1", 1059);
        m.mark_unhealthy(
            &ep,
            &ProxyError::PoolExhausted {
                active: 5,
                max: 5,
                timeout: Duration::from_secs(1),
            },
        );
        assert!(m.is_healthy(&ep));
    }

    #[test]
    fn test_affinity_error_lists_bound_sessions() {
        let m = manager(2);
        let bound = Uuid::new_v4();
        m.tracker().register(bound, Endpoint::new("server1", 1059));

        let unknown = Uuid::new_v4();
        let err = m.affinity_server(unknown).unwrap_err();
        let message = err.to_string();
        assert!(message.contains(&unknown.to_string()));
        assert!(message.contains("has no associated server"));
        assert!(message.contains(&bound.to_string()));
    }

    #[test]
    fn test_choose_endpoint_skips_down_servers() {
        let m = manager(3);
        m.mark_unhealthy(
            &Endpoint::new("server1", 1059),
            &ProxyError::rpc(RpcStatus::Unavailable, "gone"),
        );
        for _ in 0..10 {
            let chosen = m.choose_endpoint().unwrap();
            assert_ne!(chosen.host, "server1");
        }
    }

    #[test]
    fn test_choose_endpoint_prefers_least_loaded() {
        let m = manager(2);
        // Three sessions on server1, none on server2.
        for _ in 0..3 {
            m.tracker()
                .register(Uuid::new_v4(), Endpoint::new("server1", 1059));
        }
        for _ in 0..5 {
            assert_eq!(m.choose_endpoint().unwrap().host, "server2");
        }
    }

    #[test]
    fn test_no_healthy_endpoint_is_connection_level() {
        let m = manager(1);
        m.mark_unhealthy(
            &Endpoint::new("server1", 1059),
            &ProxyError::rpc(RpcStatus::Unavailable, "gone"),
        );
        let err = m.choose_endpoint().unwrap_err();
        assert!(ErrorClassifier::is_connection_level(&err));
    }
}
