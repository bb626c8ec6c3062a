// # Statement Service
//
// Dispatches every RPC a proxy server accepts: connect, execute, the XA
// verbs, terminate, ping. Owns the wiring between the pools, the session
// manager, the multinode coordinator, the health tracker, and the XA
// registry.
//
// The cluster-health snapshot riding on each request is fed to the health
// tracker BEFORE the request is processed, so pool re-allocation happens
// opportunistically on the request path.

use crate::backend::pool::{BackendPool, PoolStatistics};
use crate::backend::provider::{DriverRegistry, PoolTarget, ProviderRegistry};
use crate::cluster::{count_healthy_servers, Endpoint};
use crate::config::{connection_hash, PoolSettings};
use crate::coordinator::{ClusterHealthTracker, MultinodePoolCoordinator};
use crate::error::{ErrorDetail, ProxyError, Result};
use crate::protocol::{
    ConnectionDetails, Request, Response, SessionInfo, SqlValue, XaRequest, XaResponse, XidProto,
    MAX_SQL_LENGTH,
};
use crate::xa::xid::flags::TMONEPHASE;
use crate::xa::{TerminateAction, XaTransactionRegistry, XidKey};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::session_manager::{BackendHandle, SessionManager};

pub struct StatementService {
    advertised: Endpoint,
    drivers: Arc<DriverRegistry>,
    providers: Arc<ProviderRegistry>,
    sessions: SessionManager,
    pools: DashMap<String, Arc<BackendPool>>,
    coordinator: MultinodePoolCoordinator,
    health: ClusterHealthTracker,
    registry: XaTransactionRegistry,
}

impl StatementService {
    /// Builds the service for one server. Driver and provider registries are
    /// constructed at startup and shared; everything else is per-server.
    pub fn new(
        advertised: Endpoint,
        drivers: Arc<DriverRegistry>,
        providers: Arc<ProviderRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            advertised,
            drivers,
            providers,
            sessions: SessionManager::new(),
            pools: DashMap::new(),
            coordinator: MultinodePoolCoordinator::new(),
            health: ClusterHealthTracker::new(),
            registry: XaTransactionRegistry::new(),
        })
    }

    pub fn advertised(&self) -> &Endpoint {
        &self.advertised
    }

    pub fn active_sessions(&self) -> u32 {
        self.sessions.active_sessions()
    }

    pub fn pool_statistics(&self, conn_hash: &str) -> Option<PoolStatistics> {
        self.pools.get(conn_hash).map(|pool| pool.statistics())
    }

    /// JSON dump of every pool's counters, for diagnostics.
    pub fn statistics_json(&self) -> String {
        let stats: std::collections::HashMap<String, PoolStatistics> = self
            .pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().statistics()))
            .collect();
        serde_json::to_string(&stats).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn branch_count(&self) -> usize {
        self.registry.branch_count()
    }

    /// Top-level entry point for one request.
    pub async fn handle(&self, request: Request) -> Response {
        if let (Some(hash), Some(health)) = (request.conn_hash(), request.cluster_health()) {
            let hash = hash.to_string();
            let health = health.to_string();
            self.observe_cluster_health(&hash, &health).await;
        }

        match self.dispatch(request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::debug!("Request failed: {}", error);
                Response::Error(ErrorDetail::from(&error))
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Response> {
        match request {
            Request::Connect(details) => self.connect(details).await,
            Request::Execute {
                session,
                sql,
                params,
                ..
            } => self.execute(session, sql, params).await,
            Request::XaStart(req) => self.xa_start(req).await,
            Request::XaEnd(req) => self.xa_end(req).await,
            Request::XaPrepare(req) => self.xa_prepare(req).await,
            Request::XaCommit(req) => self.xa_commit(req).await,
            Request::XaRollback(req) => self.xa_rollback(req).await,
            Request::XaForget(req) => self.xa_forget(req).await,
            Request::XaRecover(req) => self.xa_recover(req).await,
            Request::TerminateSession { session, .. } => self.terminate(session).await,
            Request::Ping => Ok(Response::Pong {
                active_sessions: self.sessions.active_sessions(),
            }),
        }
    }

    /// Detects health transitions and resizes the hash's live pool.
    async fn observe_cluster_health(&self, conn_hash: &str, cluster_health: &str) {
        if cluster_health.is_empty() {
            return;
        }
        if !self.health.has_health_changed(conn_hash, cluster_health) {
            return;
        }
        let healthy = count_healthy_servers(cluster_health);
        tracing::info!(
            "Cluster health changed for {}: '{}' ({} healthy)",
            conn_hash,
            cluster_health,
            healthy
        );
        if let Some((new_max, new_min)) = self.coordinator.update_healthy_servers(conn_hash, healthy)
        {
            if let Some(pool) = self.pools.get(conn_hash).map(|p| p.clone()) {
                pool.resize(new_max, new_min).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Connect / execute / terminate
    // ------------------------------------------------------------------

    async fn connect(&self, details: ConnectionDetails) -> Result<Response> {
        let settings = PoolSettings::from_properties(&details.properties, details.is_xa)?;
        let conn_hash = connection_hash(&details.url, &details.user, details.is_xa, &settings);

        // Connect requests carry no session, so the snapshot is observed
        // here once the hash is known.
        self.observe_cluster_health(&conn_hash, &details.cluster_health)
            .await;

        let pool = self.pool_for(&conn_hash, &details, &settings).await?;
        let backend = pool.borrow().await?;

        let info = SessionInfo {
            session_uuid: Uuid::new_v4(),
            client_uuid: details.client_uuid,
            conn_hash: conn_hash.clone(),
            is_xa: details.is_xa,
            target_server: self.advertised.to_string(),
        };
        tracing::info!(
            "Session {} connected (client {}, xa={}, hash {})",
            info.session_uuid,
            info.client_uuid,
            info.is_xa,
            &conn_hash[..12.min(conn_hash.len())]
        );
        self.sessions.register(info.clone(), backend);
        Ok(Response::Connected(info))
    }

    /// Finds or builds the pool for a connection hash. The divided sizes
    /// apply whenever the client supplied its endpoint list, regardless of
    /// cluster size.
    async fn pool_for(
        &self,
        conn_hash: &str,
        details: &ConnectionDetails,
        settings: &PoolSettings,
    ) -> Result<Arc<BackendPool>> {
        if let Some(pool) = self.pools.get(conn_hash) {
            return Ok(pool.clone());
        }

        let driver = self.drivers.find(&details.url)?;
        let mut divided = settings.clone();
        if !details.server_endpoints.is_empty() {
            let (max, min) = self.coordinator.calculate_pool_sizes(
                conn_hash,
                settings.maximum_pool_size,
                settings.minimum_idle,
                details.server_endpoints.len(),
            );
            divided.maximum_pool_size = max;
            divided.minimum_idle = min;
        }

        let target = PoolTarget {
            url: details.url.clone(),
            user: details.user.clone(),
            password: details.password.clone(),
        };
        let pool = if details.is_xa {
            self.providers
                .select_xa(&details.url, driver.name())?
                .create_pool(conn_hash, &target, &divided, driver)
                .await?
        } else {
            self.providers
                .select()?
                .create_pool(conn_hash, &target, &divided, driver)
                .await?
        };

        // A concurrent connect may have won the race; keep the first pool.
        let existing = self
            .pools
            .entry(conn_hash.to_string())
            .or_insert_with(|| pool.clone())
            .clone();
        if !Arc::ptr_eq(&existing, &pool) {
            pool.close().await;
        }
        Ok(existing)
    }

    async fn execute(
        &self,
        session: SessionInfo,
        sql: String,
        params: Vec<SqlValue>,
    ) -> Result<Response> {
        if sql.len() > MAX_SQL_LENGTH {
            return Err(ProxyError::Configuration(format!(
                "SQL statement too large: {} bytes (max: {})",
                sql.len(),
                MAX_SQL_LENGTH
            )));
        }
        let (_, handle) = self.sessions.backend_for(session.session_uuid)?;
        let mut guard = handle.lock().await;
        let backend = guard.as_mut().ok_or_else(|| {
            ProxyError::SessionNotFound(format!(
                "backend for session {} has been released",
                session.session_uuid
            ))
        })?;
        let result = backend.execute(&sql, &params).await?;
        Ok(Response::Executed(result))
    }

    async fn terminate(&self, session: SessionInfo) -> Result<Response> {
        let entry = self
            .sessions
            .remove_session(session.session_uuid)
            .ok_or_else(|| {
                ProxyError::SessionNotFound(format!(
                    "session {} is not registered on this server",
                    session.session_uuid
                ))
            })?;
        tracing::info!("Session {} terminated", session.session_uuid);

        if entry.info.is_xa {
            match self.registry.on_session_terminated(session.session_uuid) {
                TerminateAction::ReleaseNow => {
                    self.hibernate_backend(entry.backend_id).await;
                    self.release_backend(entry.backend_id, &entry.info.conn_hash)
                        .await;
                }
                TerminateAction::Deferred => {
                    tracing::debug!(
                        "Backend {} held for in-flight branch of session {}",
                        entry.backend_id,
                        session.session_uuid
                    );
                }
            }
        } else {
            self.release_backend(entry.backend_id, &entry.info.conn_hash)
                .await;
        }
        Ok(Response::Terminated)
    }

    async fn hibernate_backend(&self, backend_id: u64) {
        if let Some(handle) = self.sessions.backend_by_id(backend_id) {
            let mut guard = handle.lock().await;
            if let Some(backend) = guard.as_mut() {
                if backend.is_xa() {
                    if let Err(e) = backend.hibernate().await {
                        tracing::warn!("Hibernation of backend {} failed: {}", backend_id, e);
                    }
                }
            }
        }
    }

    /// Returns a backend session to its pool (or closes it when the pool is
    /// already gone).
    async fn release_backend(&self, backend_id: u64, conn_hash: &str) {
        let Some(mut backend) = self.sessions.take_backend(backend_id).await else {
            return;
        };
        match self.pools.get(conn_hash).map(|p| p.clone()) {
            Some(pool) => pool.give_back(backend).await,
            None => {
                if let Err(e) = backend.close().await {
                    tracing::warn!("Failed to close orphaned backend {}: {}", backend_id, e);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // XA verbs
    // ------------------------------------------------------------------

    /// Resolves the backend for an XA request. Terminal verbs may arrive
    /// after the session was terminated, in which case the branch context
    /// still knows the backend.
    fn xa_backend(&self, req: &XaRequest, xid: &XidKey) -> Result<BackendHandle> {
        match self.sessions.backend_for(req.session.session_uuid) {
            Ok((_, handle)) => Ok(handle),
            Err(session_err) => match self.registry.context(xid) {
                Some(ctx) => self
                    .sessions
                    .backend_by_id(ctx.backend_id)
                    .ok_or(session_err),
                None => Err(session_err),
            },
        }
    }

    fn xa_ok(session: SessionInfo) -> Response {
        Response::Xa(XaResponse {
            session,
            success: true,
            message: String::new(),
        })
    }

    async fn xa_start(&self, req: XaRequest) -> Result<Response> {
        let xid = XidKey::from(&req.xid);
        let (_, handle) = self.sessions.backend_for(req.session.session_uuid)?;
        let mut guard = handle.lock().await;
        let backend = guard.as_mut().ok_or_else(|| {
            ProxyError::SessionNotFound(format!(
                "backend for session {} has been released",
                req.session.session_uuid
            ))
        })?;
        self.registry
            .xa_start(
                &xid,
                req.flags,
                req.session.session_uuid,
                &req.session.conn_hash,
                backend,
            )
            .await?;
        Ok(Self::xa_ok(req.session))
    }

    async fn xa_end(&self, req: XaRequest) -> Result<Response> {
        let xid = XidKey::from(&req.xid);
        let handle = self.xa_backend(&req, &xid)?;
        let mut guard = handle.lock().await;
        let backend = guard
            .as_mut()
            .ok_or_else(|| ProxyError::SessionNotFound("backend released".to_string()))?;
        self.registry.xa_end(&xid, req.flags, backend).await?;
        Ok(Self::xa_ok(req.session))
    }

    async fn xa_prepare(&self, req: XaRequest) -> Result<Response> {
        let xid = XidKey::from(&req.xid);
        let handle = self.xa_backend(&req, &xid)?;
        let mut guard = handle.lock().await;
        let backend = guard
            .as_mut()
            .ok_or_else(|| ProxyError::SessionNotFound("backend released".to_string()))?;
        self.registry.xa_prepare(&xid, backend).await?;
        Ok(Self::xa_ok(req.session))
    }

    async fn xa_commit(&self, req: XaRequest) -> Result<Response> {
        let xid = XidKey::from(&req.xid);
        let one_phase = req.flags & TMONEPHASE != 0;
        let handle = self.xa_backend(&req, &xid)?;
        let action = {
            let mut guard = handle.lock().await;
            let backend = guard
                .as_mut()
                .ok_or_else(|| ProxyError::SessionNotFound("backend released".to_string()))?;
            self.registry.xa_commit(&xid, one_phase, backend).await?
        };
        if action.release_backend {
            self.release_backend(action.backend_id, &action.conn_hash)
                .await;
        }
        Ok(Self::xa_ok(req.session))
    }

    async fn xa_rollback(&self, req: XaRequest) -> Result<Response> {
        let xid = XidKey::from(&req.xid);
        let handle = self.xa_backend(&req, &xid)?;
        let action = {
            let mut guard = handle.lock().await;
            let backend = guard
                .as_mut()
                .ok_or_else(|| ProxyError::SessionNotFound("backend released".to_string()))?;
            self.registry.xa_rollback(&xid, backend).await?
        };
        if action.release_backend {
            self.release_backend(action.backend_id, &action.conn_hash)
                .await;
        }
        Ok(Self::xa_ok(req.session))
    }

    async fn xa_forget(&self, req: XaRequest) -> Result<Response> {
        let xid = XidKey::from(&req.xid);
        let handle = self.xa_backend(&req, &xid)?;
        let mut guard = handle.lock().await;
        let backend = guard
            .as_mut()
            .ok_or_else(|| ProxyError::SessionNotFound("backend released".to_string()))?;
        self.registry.xa_forget(&xid, backend).await?;
        Ok(Self::xa_ok(req.session))
    }

    async fn xa_recover(&self, req: XaRequest) -> Result<Response> {
        let xid = XidKey::from(&req.xid);
        let handle = self.xa_backend(&req, &xid)?;
        let mut guard = handle.lock().await;
        let backend = guard
            .as_mut()
            .ok_or_else(|| ProxyError::SessionNotFound("backend released".to_string()))?;
        let xids = self.registry.xa_recover(req.flags, backend).await?;
        Ok(Response::Recovered(
            xids.iter().map(XidProto::from).collect(),
        ))
    }
}
