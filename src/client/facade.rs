// # Logical Connection Facades
//
// The thin client-visible surface. A `ProxyDataSource` is built once per
// multinode URL; it hands out regular logical connections (one session on
// one server) and XA logical connections (unified mode: one session per
// server, first one primary).
//
// The XA facade keeps a small client-side state machine so protocol
// violations fail before any server round-trip. Server registries enforce
// the same machine authoritatively.

use crate::cluster::Endpoint;
use crate::config::ProxyUrl;
use crate::error::{ProxyError, Result};
use crate::protocol::{QueryResult, Request, Response, SessionInfo, SqlValue, XaRequest, XidProto};
use crate::xa::xid::{errors, flags};
use crate::xa::XidKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::manager::{ConnectResult, MultinodeConnectionManager, DEFAULT_DEADLINE};

/// Client entry point for one multinode URL.
pub struct ProxyDataSource {
    manager: Arc<MultinodeConnectionManager>,
    url: String,
    user: String,
    password: String,
    properties: HashMap<String, String>,
}

impl ProxyDataSource {
    pub fn new(url: &str, user: &str, password: &str) -> Result<Self> {
        Self::with_deadline(url, user, password, DEFAULT_DEADLINE)
    }

    pub fn with_deadline(
        url: &str,
        user: &str,
        password: &str,
        deadline: Duration,
    ) -> Result<Self> {
        let parsed = ProxyUrl::parse(url)?;
        let manager = Arc::new(MultinodeConnectionManager::new(
            parsed.endpoints.clone(),
            deadline,
        ));
        Ok(Self {
            manager,
            url: url.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            properties: parsed.properties,
        })
    }

    /// The router, exposed for health inspection and diagnostics.
    pub fn manager(&self) -> &Arc<MultinodeConnectionManager> {
        &self.manager
    }

    /// Opens a regular logical connection on one server.
    pub async fn connection(&self) -> Result<LogicalConnection> {
        let result = self
            .manager
            .connect(&self.url, &self.user, &self.password, &self.properties, false)
            .await?;
        Ok(LogicalConnection {
            manager: self.manager.clone(),
            session: result.primary,
        })
    }

    /// Opens an XA logical connection mirrored onto every server.
    pub async fn xa_connection(&self) -> Result<XaLogicalConnection> {
        let ConnectResult { primary, bindings } = self
            .manager
            .connect(&self.url, &self.user, &self.password, &self.properties, true)
            .await?;
        Ok(XaLogicalConnection {
            manager: self.manager.clone(),
            primary,
            bindings,
            state: Mutex::new(ClientXaState::Idle),
        })
    }
}

/// A non-XA logical connection bound to one server.
pub struct LogicalConnection {
    manager: Arc<MultinodeConnectionManager>,
    session: SessionInfo,
}

impl std::fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalConnection")
            .field("session", &self.session)
            .finish()
    }
}

impl LogicalConnection {
    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// The server this session is bound to.
    pub fn bound_endpoint(&self) -> Result<Endpoint> {
        self.manager.affinity_server(self.session.session_uuid)
    }

    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        let request = Request::Execute {
            session: self.session.clone(),
            sql: sql.to_string(),
            params: params.to_vec(),
            cluster_health: self.manager.generate_cluster_health(),
        };
        match self
            .manager
            .call_on_session(self.session.session_uuid, &request)
            .await?
        {
            Response::Executed(result) => Ok(result),
            other => Err(ProxyError::Internal(format!(
                "unexpected response to execute: {:?}",
                other
            ))),
        }
    }

    pub async fn close(self) -> Result<()> {
        self.manager.terminate(&self.session).await
    }
}

/// Client-side view of the current transaction on an XA connection.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientXaState {
    Idle,
    Active(XidKey),
    Ended(XidKey),
    Prepared(XidKey),
}

/// An XA logical connection mirrored onto all servers; each server hosts
/// one branch of the distributed transaction.
pub struct XaLogicalConnection {
    manager: Arc<MultinodeConnectionManager>,
    primary: SessionInfo,
    bindings: Vec<SessionInfo>,
    state: Mutex<ClientXaState>,
}

impl std::fmt::Debug for XaLogicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XaLogicalConnection")
            .field("primary", &self.primary)
            .field("bindings", &self.bindings)
            .field("state", &self.state)
            .finish()
    }
}

impl XaLogicalConnection {
    pub fn primary(&self) -> &SessionInfo {
        &self.primary
    }

    pub fn bindings(&self) -> &[SessionInfo] {
        &self.bindings
    }

    /// SQL executes on the primary server's branch.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        let request = Request::Execute {
            session: self.primary.clone(),
            sql: sql.to_string(),
            params: params.to_vec(),
            cluster_health: self.manager.generate_cluster_health(),
        };
        match self
            .manager
            .call_on_session(self.primary.session_uuid, &request)
            .await?
        {
            Response::Executed(result) => Ok(result),
            other => Err(ProxyError::Internal(format!(
                "unexpected response to execute: {:?}",
                other
            ))),
        }
    }

    pub async fn start(&self, xid: &XidKey, start_flags: i32) -> Result<()> {
        {
            let state = self.state.lock();
            match (start_flags, &*state) {
                (flags::TMNOFLAGS, ClientXaState::Idle) => {}
                (f, ClientXaState::Ended(current))
                    if (f == flags::TMJOIN || f == flags::TMRESUME) && current == xid => {}
                (flags::TMNOFLAGS, other) => {
                    return Err(ProxyError::xa(
                        errors::XAER_PROTO,
                        format!("cannot start {} while in {:?}", xid, other),
                    ))
                }
                (f, other) => {
                    return Err(ProxyError::xa(
                        errors::XAER_PROTO,
                        format!("cannot start with flags {:#x} from {:?}", f, other),
                    ))
                }
            }
        }
        self.fan_out(Request::XaStart, xid, start_flags).await?;
        *self.state.lock() = ClientXaState::Active(xid.clone());
        Ok(())
    }

    pub async fn end(&self, xid: &XidKey, end_flags: i32) -> Result<()> {
        self.expect_current(xid, |s| matches!(s, ClientXaState::Active(_)), "end")?;
        self.fan_out(Request::XaEnd, xid, end_flags).await?;
        *self.state.lock() = ClientXaState::Ended(xid.clone());
        Ok(())
    }

    pub async fn prepare(&self, xid: &XidKey) -> Result<()> {
        self.expect_current(xid, |s| matches!(s, ClientXaState::Ended(_)), "prepare")?;
        self.fan_out(Request::XaPrepare, xid, flags::TMNOFLAGS).await?;
        *self.state.lock() = ClientXaState::Prepared(xid.clone());
        Ok(())
    }

    pub async fn commit(&self, xid: &XidKey, one_phase: bool) -> Result<()> {
        if one_phase {
            self.expect_current(xid, |s| matches!(s, ClientXaState::Ended(_)), "commit")?;
        } else {
            self.expect_current(xid, |s| matches!(s, ClientXaState::Prepared(_)), "commit")?;
        }
        let commit_flags = if one_phase {
            flags::TMONEPHASE
        } else {
            flags::TMNOFLAGS
        };
        self.fan_out(Request::XaCommit, xid, commit_flags).await?;
        *self.state.lock() = ClientXaState::Idle;
        Ok(())
    }

    pub async fn rollback(&self, xid: &XidKey) -> Result<()> {
        self.expect_current(
            xid,
            |s| matches!(s, ClientXaState::Ended(_) | ClientXaState::Prepared(_)),
            "rollback",
        )?;
        self.fan_out(Request::XaRollback, xid, flags::TMNOFLAGS).await?;
        *self.state.lock() = ClientXaState::Idle;
        Ok(())
    }

    /// Asks the primary server's resource manager for prepared branches.
    pub async fn recover(&self) -> Result<Vec<XidKey>> {
        let request = Request::XaRecover(self.xa_request(&self.primary, &XidKey::generate(), flags::TMSTARTRSCAN));
        match self
            .manager
            .call_on_session(self.primary.session_uuid, &request)
            .await?
        {
            Response::Recovered(xids) => Ok(xids.iter().map(XidKey::from).collect()),
            other => Err(ProxyError::Internal(format!(
                "unexpected response to recover: {:?}",
                other
            ))),
        }
    }

    /// Forgets a heuristically completed branch on the primary server.
    pub async fn forget(&self, xid: &XidKey) -> Result<()> {
        let request = Request::XaForget(self.xa_request(&self.primary, xid, flags::TMNOFLAGS));
        self.manager
            .call_on_session(self.primary.session_uuid, &request)
            .await?;
        Ok(())
    }

    /// Terminates every mirrored session. Per-server failures are logged;
    /// the first one is surfaced after all servers were attempted.
    pub async fn close(self) -> Result<()> {
        let mut first_error = None;
        for session in &self.bindings {
            if let Err(e) = self.manager.terminate(session).await {
                tracing::warn!(
                    "Terminate of session {} on {} failed: {}",
                    session.session_uuid,
                    session.target_server,
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn xa_request(&self, session: &SessionInfo, xid: &XidKey, request_flags: i32) -> XaRequest {
        XaRequest {
            session: session.clone(),
            xid: XidProto::from(xid),
            flags: request_flags,
            cluster_health: self.manager.generate_cluster_health(),
        }
    }

    fn expect_current<F>(&self, xid: &XidKey, valid: F, verb: &str) -> Result<()>
    where
        F: Fn(&ClientXaState) -> bool,
    {
        let state = self.state.lock();
        let current = match &*state {
            ClientXaState::Active(current)
            | ClientXaState::Ended(current)
            | ClientXaState::Prepared(current) => Some(current),
            ClientXaState::Idle => None,
        };
        if current != Some(xid) || !valid(&state) {
            return Err(ProxyError::xa(
                errors::XAER_PROTO,
                format!("cannot {} {} while in {:?}", verb, xid, *state),
            ));
        }
        Ok(())
    }

    /// One XA phase across every branch, sequentially. All servers are
    /// attempted; the first failure is surfaced afterwards so a partial
    /// outcome is visible rather than silently truncated.
    async fn fan_out<F>(&self, make: F, xid: &XidKey, phase_flags: i32) -> Result<()>
    where
        F: Fn(XaRequest) -> Request,
    {
        let results = self
            .manager
            .execute_on_all_servers(&self.bindings, |session| {
                make(self.xa_request(session, xid, phase_flags))
            })
            .await;

        let mut first_error = None;
        for (session, outcome) in results {
            if let Err(e) = outcome {
                tracing::warn!(
                    "XA phase failed on {} (session {}): {}",
                    session.target_server,
                    session.session_uuid,
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
