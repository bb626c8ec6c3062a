// # XA Transaction Registry
//
// Server-side branch tracking. Every XA verb on a session goes through the
// registry, which enforces the branch state machine before touching the
// resource manager:
//
// ```text
// NONEXISTENT --start(TMNOFLAGS)--> ACTIVE
// ACTIVE      --end(TMSUCCESS|TMFAIL|TMSUSPEND)--> ENDED
// ENDED       --start(TMJOIN|TMRESUME)--> ACTIVE
// ENDED       --prepare--> PREPARED
// ENDED       --commit(onePhase)--> COMMITTED
// PREPARED    --commit--> COMMITTED
// ENDED|PREPARED --rollback--> ROLLEDBACK
// ```
//
// A backend session is returned to its pool only when BOTH the transaction
// has reached a terminal state AND the owning logical session has been
// terminated, in either order. Between transactions on a live session the
// backend is hibernated (logical connection closed and re-opened) so the
// next `start` finds the resource manager idle; most XA drivers otherwise
// leave the connection stuck in its ended state.

use crate::backend::session::BackendSession;
use crate::error::{ProxyError, Result};
use dashmap::DashMap;
use uuid::Uuid;

use super::xid::{errors, flags, XidKey};

/// Branch state as a tagged value. `transaction_complete` is orthogonal: a
/// COMMITTED branch is complete, but completeness also gates on session
/// close before the backend is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Active,
    Ended,
    Prepared,
    Committed,
    RolledBack,
}

/// Per-branch context. Holds arena indices (backend id, session uuid), never
/// object references, so there are no ownership cycles with the session
/// store.
#[derive(Debug, Clone)]
pub struct TxContext {
    pub xid: XidKey,
    pub backend_id: u64,
    pub session_uuid: Uuid,
    pub conn_hash: String,
    pub state: BranchState,
    pub transaction_complete: bool,
    pub session_closed: bool,
}

/// Outcome of a terminal branch verb: whether the backend session can go
/// back to its pool now.
#[derive(Debug, Clone)]
pub struct ReleaseAction {
    pub backend_id: u64,
    pub session_uuid: Uuid,
    pub conn_hash: String,
    pub release_backend: bool,
}

/// What to do with a terminated session's backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateAction {
    /// No incomplete branch remains; hibernate and release the backend.
    ReleaseNow,
    /// A branch is still in flight; the backend is released when the branch
    /// reaches a terminal state.
    Deferred,
}

pub struct XaTransactionRegistry {
    contexts: DashMap<XidKey, TxContext>,
    /// Current branch per owning session, so terminate can find in-flight
    /// work without scanning.
    by_session: DashMap<Uuid, XidKey>,
}

impl XaTransactionRegistry {
    pub fn new() -> Self {
        Self {
            contexts: DashMap::new(),
            by_session: DashMap::new(),
        }
    }

    /// `xa_start`. TMNOFLAGS registers a new branch; TMJOIN/TMRESUME
    /// re-activate an existing ended branch. Anything else is invalid.
    pub async fn xa_start(
        &self,
        xid: &XidKey,
        xa_flags: i32,
        session_uuid: Uuid,
        conn_hash: &str,
        backend: &mut BackendSession,
    ) -> Result<()> {
        match xa_flags {
            flags::TMNOFLAGS => {
                if self.contexts.contains_key(xid) {
                    return Err(ProxyError::xa(
                        errors::XAER_DUPID,
                        format!("{} is already registered on this server", xid),
                    ));
                }
                backend.xa_resource()?.xa_start(xid, xa_flags).await?;
                self.contexts.insert(
                    xid.clone(),
                    TxContext {
                        xid: xid.clone(),
                        backend_id: backend.id(),
                        session_uuid,
                        conn_hash: conn_hash.to_string(),
                        state: BranchState::Active,
                        transaction_complete: false,
                        session_closed: false,
                    },
                );
                self.by_session.insert(session_uuid, xid.clone());
                tracing::debug!("Branch {} started on backend {}", xid, backend.id());
                Ok(())
            }
            f if f == flags::TMJOIN || f == flags::TMRESUME => {
                self.expect_state(xid, BranchState::Ended, "join/resume")?;
                backend.xa_resource()?.xa_start(xid, xa_flags).await?;
                self.transition(xid, BranchState::Active)
            }
            other => Err(ProxyError::xa(
                errors::XAER_INVAL,
                format!("xa_start does not accept flags {:#x}", other),
            )),
        }
    }

    /// `xa_end` with TMSUCCESS, TMFAIL or TMSUSPEND.
    pub async fn xa_end(
        &self,
        xid: &XidKey,
        xa_flags: i32,
        backend: &mut BackendSession,
    ) -> Result<()> {
        if xa_flags != flags::TMSUCCESS && xa_flags != flags::TMFAIL && xa_flags != flags::TMSUSPEND
        {
            return Err(ProxyError::xa(
                errors::XAER_INVAL,
                format!("xa_end does not accept flags {:#x}", xa_flags),
            ));
        }
        self.expect_state(xid, BranchState::Active, "end")?;
        backend.xa_resource()?.xa_end(xid, xa_flags).await?;
        self.transition(xid, BranchState::Ended)
    }

    /// `xa_prepare`, first phase of 2PC.
    pub async fn xa_prepare(&self, xid: &XidKey, backend: &mut BackendSession) -> Result<()> {
        self.expect_state(xid, BranchState::Ended, "prepare")?;
        backend.xa_resource()?.xa_prepare(xid).await?;
        self.transition(xid, BranchState::Prepared)
    }

    /// `xa_commit`. One-phase commits an ended branch directly; two-phase
    /// requires a prior prepare.
    pub async fn xa_commit(
        &self,
        xid: &XidKey,
        one_phase: bool,
        backend: &mut BackendSession,
    ) -> Result<ReleaseAction> {
        let expected = if one_phase {
            BranchState::Ended
        } else {
            BranchState::Prepared
        };
        self.expect_state(xid, expected, "commit")?;
        backend.xa_resource()?.xa_commit(xid, one_phase).await?;
        self.finish_branch(xid, BranchState::Committed, backend).await
    }

    /// `xa_rollback` from ENDED or PREPARED.
    pub async fn xa_rollback(
        &self,
        xid: &XidKey,
        backend: &mut BackendSession,
    ) -> Result<ReleaseAction> {
        {
            let ctx = self.context_ref(xid)?;
            if ctx.state != BranchState::Ended && ctx.state != BranchState::Prepared {
                return Err(ProxyError::xa(
                    errors::XAER_PROTO,
                    format!("{} cannot roll back from {:?}", xid, ctx.state),
                ));
            }
        }
        backend.xa_resource()?.xa_rollback(xid).await?;
        self.finish_branch(xid, BranchState::RolledBack, backend).await
    }

    /// `xa_forget` for heuristically completed branches; pure pass-through
    /// to the resource manager, the registry holds nothing for them.
    pub async fn xa_forget(&self, xid: &XidKey, backend: &mut BackendSession) -> Result<()> {
        backend.xa_resource()?.xa_forget(xid).await
    }

    /// `xa_recover`: branches the resource manager reports as prepared.
    pub async fn xa_recover(
        &self,
        xa_flags: i32,
        backend: &mut BackendSession,
    ) -> Result<Vec<XidKey>> {
        backend.xa_resource()?.xa_recover(xa_flags).await
    }

    /// Marks the owning session terminated. If no incomplete branch remains
    /// the backend can be released immediately; otherwise release happens at
    /// the branch's terminal verb.
    pub fn on_session_terminated(&self, session_uuid: Uuid) -> TerminateAction {
        if let Some(entry) = self.by_session.get(&session_uuid) {
            let xid = entry.value().clone();
            drop(entry);
            if let Some(mut ctx) = self.contexts.get_mut(&xid) {
                if !ctx.transaction_complete {
                    ctx.session_closed = true;
                    tracing::debug!(
                        "Session {} terminated with branch {} in flight; release deferred",
                        session_uuid,
                        xid
                    );
                    return TerminateAction::Deferred;
                }
            }
        }
        TerminateAction::ReleaseNow
    }

    /// Number of branches currently tracked.
    pub fn branch_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn context(&self, xid: &XidKey) -> Option<TxContext> {
        self.contexts.get(xid).map(|c| c.clone())
    }

    /// Applies the terminal state, hibernates the backend so a later
    /// `xa_start` on this session finds an idle resource manager, and
    /// reports whether the dual condition is now satisfied.
    async fn finish_branch(
        &self,
        xid: &XidKey,
        terminal: BranchState,
        backend: &mut BackendSession,
    ) -> Result<ReleaseAction> {
        if let Err(e) = backend.hibernate().await {
            tracing::warn!("Hibernation of backend {} failed: {}", backend.id(), e);
        }

        let (_, mut ctx) = self.contexts.remove(xid).ok_or_else(|| {
            ProxyError::xa(
                errors::XAER_NOTA,
                format!("{} vanished before its terminal state was recorded", xid),
            )
        })?;
        ctx.state = terminal;
        ctx.transaction_complete = true;
        self.by_session.remove(&ctx.session_uuid);

        tracing::debug!(
            "Branch {} finished as {:?} (session closed: {})",
            xid,
            terminal,
            ctx.session_closed
        );
        Ok(ReleaseAction {
            backend_id: ctx.backend_id,
            session_uuid: ctx.session_uuid,
            conn_hash: ctx.conn_hash,
            release_backend: ctx.session_closed,
        })
    }

    fn context_ref(&self, xid: &XidKey) -> Result<TxContext> {
        self.contexts
            .get(xid)
            .map(|c| c.clone())
            .ok_or_else(|| {
                ProxyError::xa(
                    errors::XAER_NOTA,
                    format!("{} is not registered on this server", xid),
                )
            })
    }

    fn expect_state(&self, xid: &XidKey, expected: BranchState, verb: &str) -> Result<()> {
        let ctx = self.context_ref(xid)?;
        if ctx.state != expected {
            return Err(ProxyError::xa(
                errors::XAER_PROTO,
                format!("{} cannot {} from {:?}", xid, verb, ctx.state),
            ));
        }
        Ok(())
    }

    fn transition(&self, xid: &XidKey, next: BranchState) -> Result<()> {
        let mut ctx = self.contexts.get_mut(xid).ok_or_else(|| {
            ProxyError::xa(
                errors::XAER_NOTA,
                format!("{} is not registered on this server", xid),
            )
        })?;
        ctx.state = next;
        Ok(())
    }
}

impl Default for XaTransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDriver;
    use crate::backend::session::{DriverSessionFactory, SessionFactory};
    use std::sync::Arc;

    async fn xa_backend() -> BackendSession {
        let factory = DriverSessionFactory::new(
            Arc::new(MemoryDriver::new()),
            "odbp://s1:1059/db",
            "app",
            "pw",
            true,
            None,
        );
        factory.make_session(1).await.unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_two_phase() {
        let registry = XaTransactionRegistry::new();
        let mut backend = xa_backend().await;
        let session = Uuid::new_v4();
        let xid = XidKey::generate();

        registry
            .xa_start(&xid, flags::TMNOFLAGS, session, "h", &mut backend)
            .await
            .unwrap();
        registry
            .xa_end(&xid, flags::TMSUCCESS, &mut backend)
            .await
            .unwrap();
        registry.xa_prepare(&xid, &mut backend).await.unwrap();
        let action = registry.xa_commit(&xid, false, &mut backend).await.unwrap();

        assert!(!action.release_backend);
        assert_eq!(registry.branch_count(), 0);
    }

    #[tokio::test]
    async fn test_one_phase_commit_from_ended() {
        let registry = XaTransactionRegistry::new();
        let mut backend = xa_backend().await;
        let xid = XidKey::generate();

        registry
            .xa_start(&xid, flags::TMNOFLAGS, Uuid::new_v4(), "h", &mut backend)
            .await
            .unwrap();
        registry
            .xa_end(&xid, flags::TMSUCCESS, &mut backend)
            .await
            .unwrap();
        registry.xa_commit(&xid, true, &mut backend).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_transitions_are_rejected() {
        let registry = XaTransactionRegistry::new();
        let mut backend = xa_backend().await;
        let session = Uuid::new_v4();
        let xid = XidKey::generate();

        // Commit before start.
        assert!(registry.xa_commit(&xid, true, &mut backend).await.is_err());

        registry
            .xa_start(&xid, flags::TMNOFLAGS, session, "h", &mut backend)
            .await
            .unwrap();

        // Prepare while still active.
        let err = registry.xa_prepare(&xid, &mut backend).await.unwrap_err();
        match err {
            ProxyError::XaProtocol { code, .. } => assert_eq!(code, errors::XAER_PROTO),
            other => panic!("unexpected error: {:?}", other),
        }

        // Two-phase commit without prepare.
        registry
            .xa_end(&xid, flags::TMSUCCESS, &mut backend)
            .await
            .unwrap();
        assert!(registry.xa_commit(&xid, false, &mut backend).await.is_err());

        // Duplicate start of the same branch.
        let err = registry
            .xa_start(&xid, flags::TMNOFLAGS, session, "h", &mut backend)
            .await
            .unwrap_err();
        match err {
            ProxyError::XaProtocol { code, .. } => assert_eq!(code, errors::XAER_DUPID),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_reactivates_ended_branch() {
        let registry = XaTransactionRegistry::new();
        let mut backend = xa_backend().await;
        let xid = XidKey::generate();

        registry
            .xa_start(&xid, flags::TMNOFLAGS, Uuid::new_v4(), "h", &mut backend)
            .await
            .unwrap();
        registry
            .xa_end(&xid, flags::TMSUSPEND, &mut backend)
            .await
            .unwrap();
        registry
            .xa_start(&xid, flags::TMRESUME, Uuid::new_v4(), "h", &mut backend)
            .await
            .unwrap();
        assert_eq!(registry.context(&xid).unwrap().state, BranchState::Active);

        // Join/resume of a branch that was never started fails.
        let other = XidKey::generate();
        assert!(registry
            .xa_start(&other, flags::TMJOIN, Uuid::new_v4(), "h", &mut backend)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_dual_condition_commit_then_terminate() {
        let registry = XaTransactionRegistry::new();
        let mut backend = xa_backend().await;
        let session = Uuid::new_v4();
        let xid = XidKey::generate();

        registry
            .xa_start(&xid, flags::TMNOFLAGS, session, "h", &mut backend)
            .await
            .unwrap();
        registry
            .xa_end(&xid, flags::TMSUCCESS, &mut backend)
            .await
            .unwrap();
        let action = registry.xa_commit(&xid, true, &mut backend).await.unwrap();
        assert!(!action.release_backend);

        assert_eq!(
            registry.on_session_terminated(session),
            TerminateAction::ReleaseNow
        );
    }

    #[tokio::test]
    async fn test_dual_condition_terminate_then_rollback() {
        let registry = XaTransactionRegistry::new();
        let mut backend = xa_backend().await;
        let session = Uuid::new_v4();
        let xid = XidKey::generate();

        registry
            .xa_start(&xid, flags::TMNOFLAGS, session, "h", &mut backend)
            .await
            .unwrap();
        registry
            .xa_end(&xid, flags::TMFAIL, &mut backend)
            .await
            .unwrap();

        assert_eq!(
            registry.on_session_terminated(session),
            TerminateAction::Deferred
        );

        let action = registry.xa_rollback(&xid, &mut backend).await.unwrap();
        assert!(action.release_backend);
    }

    #[tokio::test]
    async fn test_backend_is_startable_after_finish() {
        // Hibernation between transactions restores the resource manager.
        let registry = XaTransactionRegistry::new();
        let mut backend = xa_backend().await;
        let session = Uuid::new_v4();

        let xid1 = XidKey::generate();
        registry
            .xa_start(&xid1, flags::TMNOFLAGS, session, "h", &mut backend)
            .await
            .unwrap();
        registry
            .xa_end(&xid1, flags::TMSUCCESS, &mut backend)
            .await
            .unwrap();
        registry.xa_commit(&xid1, true, &mut backend).await.unwrap();

        let xid2 = XidKey::generate();
        registry
            .xa_start(&xid2, flags::TMNOFLAGS, session, "h", &mut backend)
            .await
            .unwrap();
        assert_eq!(registry.context(&xid2).unwrap().state, BranchState::Active);
    }
}
