// # Backend Session Pool
//
// A bounded pool of backend sessions for one connection hash. Sessions are
// borrowed for the lifetime of a logical client session (possibly spanning
// many requests) and given back explicitly, so the borrow is a hand-off of
// ownership rather than a scoped guard.
//
// Live pool sizes can be changed at runtime by the multinode coordinator.
// Resizes keep `min_idle <= max_size` at every intermediate step: shrinking
// lowers `min_idle` before `max_size` and then soft-evicts excess idle
// sessions; growing raises `max_size` before `min_idle`.

use crate::config::PoolSettings;
use crate::error::{ProxyError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::timeout;

use super::session::{BackendSession, SessionFactory};

/// Point-in-time pool counters, serializable for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatistics {
    pub active: u32,
    pub idle: u32,
    pub total: u32,
    pub pending: u32,
    pub max_size: u32,
    pub min_idle: u32,
    pub borrows: u64,
    pub creations: u64,
    pub exhaustions: u64,
}

struct PoolState {
    idle: VecDeque<BackendSession>,
    active: usize,
    /// Creations in flight, counted against `max_size`.
    reserved: usize,
    max_size: u32,
    min_idle: u32,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.active + self.reserved
    }
}

pub struct BackendPool {
    name: String,
    factory: Arc<dyn SessionFactory>,
    state: Mutex<PoolState>,
    available: Notify,
    resize_lock: tokio::sync::Mutex<()>,
    connection_timeout: Duration,
    idle_timeout: Duration,
    max_lifetime: Duration,
    next_id: AtomicU64,
    pending: AtomicUsize,
    borrows: AtomicU64,
    creations: AtomicU64,
    exhaustions: AtomicU64,
}

enum BorrowAction {
    Reuse(BackendSession),
    Create(u64),
    Wait,
}

impl BackendPool {
    /// Creates the pool and fills it up to `min_idle`.
    pub async fn new(
        name: impl Into<String>,
        settings: &PoolSettings,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Arc<Self>> {
        settings.validate()?;
        let pool = Arc::new(Self {
            name: name.into(),
            factory,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: 0,
                reserved: 0,
                max_size: settings.maximum_pool_size,
                min_idle: settings.minimum_idle,
                closed: false,
            }),
            available: Notify::new(),
            resize_lock: tokio::sync::Mutex::new(()),
            connection_timeout: settings.connection_timeout,
            idle_timeout: settings.idle_timeout,
            max_lifetime: settings.max_lifetime,
            next_id: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            borrows: AtomicU64::new(0),
            creations: AtomicU64::new(0),
            exhaustions: AtomicU64::new(0),
        });
        pool.fill_to_min_idle().await;
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Borrows a backend session, waiting up to the configured connection
    /// timeout. Exhaustion surfaces as a database-level error; it must never
    /// be mistaken for the server being unreachable.
    pub async fn borrow(&self) -> Result<BackendSession> {
        let deadline = Instant::now() + self.connection_timeout;
        loop {
            let action = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(ProxyError::PoolClosed);
                }
                if let Some(session) = state.idle.pop_front() {
                    state.active += 1;
                    BorrowAction::Reuse(session)
                } else if state.total() < state.max_size as usize {
                    state.reserved += 1;
                    BorrowAction::Create(self.next_id.fetch_add(1, Ordering::SeqCst))
                } else {
                    BorrowAction::Wait
                }
            };

            match action {
                BorrowAction::Reuse(mut session) => {
                    if session.idle_time() > self.idle_timeout
                        || session.age() > self.max_lifetime
                        || !self.factory.validate(&mut session).await.unwrap_or(false)
                    {
                        self.discard_active(session).await;
                        continue;
                    }
                    session.mark_borrowed();
                    self.borrows.fetch_add(1, Ordering::Relaxed);
                    return Ok(session);
                }
                BorrowAction::Create(id) => match self.factory.make_session(id).await {
                    Ok(mut session) => {
                        {
                            let mut state = self.state.lock();
                            state.reserved -= 1;
                            state.active += 1;
                        }
                        self.creations.fetch_add(1, Ordering::Relaxed);
                        self.borrows.fetch_add(1, Ordering::Relaxed);
                        session.mark_borrowed();
                        return Ok(session);
                    }
                    Err(e) => {
                        self.state.lock().reserved -= 1;
                        self.available.notify_one();
                        return Err(e);
                    }
                },
                BorrowAction::Wait => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return Err(self.exhausted());
                    };
                    self.pending.fetch_add(1, Ordering::Relaxed);
                    let waited = timeout(remaining, self.available.notified()).await;
                    self.pending.fetch_sub(1, Ordering::Relaxed);
                    if waited.is_err() {
                        return Err(self.exhausted());
                    }
                }
            }
        }
    }

    fn exhausted(&self) -> ProxyError {
        self.exhaustions.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock();
        ProxyError::PoolExhausted {
            active: state.active,
            max: state.max_size as usize,
            timeout: self.connection_timeout,
        }
    }

    /// Returns a borrowed session to the pool.
    pub async fn give_back(&self, mut session: BackendSession) {
        let healthy = self.factory.passivate(&mut session).await.is_ok();
        let expired = session.age() > self.max_lifetime;

        let to_destroy = {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            if state.closed || !healthy || expired || state.total() >= state.max_size as usize {
                Some(session)
            } else {
                session.mark_returned();
                state.idle.push_back(session);
                None
            }
        };
        if let Some(session) = to_destroy {
            self.factory.destroy(session).await;
        }
        self.available.notify_one();
    }

    /// Drops an unhealthy borrowed session without returning it.
    async fn discard_active(&self, session: BackendSession) {
        tracing::debug!("Discarding backend session {} from pool {}", session.id(), self.name);
        {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.factory.destroy(session).await;
        self.available.notify_one();
    }

    /// Applies a coordinated size change. Ordering preserves
    /// `min_idle <= max_size` at every intermediate step.
    pub async fn resize(&self, new_max: u32, new_min: u32) {
        let _guard = self.resize_lock.lock().await;
        let (old_max, old_min) = {
            let state = self.state.lock();
            (state.max_size, state.min_idle)
        };
        if new_max == old_max && new_min == old_min {
            return;
        }
        tracing::info!(
            "Resizing pool {}: max {} -> {}, min_idle {} -> {}",
            self.name,
            old_max,
            new_max,
            old_min,
            new_min
        );

        if new_max < old_max {
            self.set_min_idle(new_min);
            self.set_max_size(new_max);
            self.evict_excess_idle().await;
        } else if new_max > old_max {
            self.set_max_size(new_max);
            self.set_min_idle(new_min);
        } else {
            self.set_min_idle(new_min);
        }
    }

    fn set_max_size(&self, value: u32) {
        self.state.lock().max_size = value;
    }

    fn set_min_idle(&self, value: u32) {
        self.state.lock().min_idle = value;
    }

    /// Soft-evicts idle sessions until the pool fits its maximum. Active
    /// sessions are never revoked; they shrink the pool as they come back.
    async fn evict_excess_idle(&self) {
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            while state.total() > state.max_size as usize {
                match state.idle.pop_back() {
                    Some(session) => evicted.push(session),
                    None => break,
                }
            }
        }
        for session in evicted {
            self.factory.destroy(session).await;
        }
    }

    /// Creates sessions until the pool holds `min_idle`. Creation failures
    /// are logged and stop the fill; the pool still serves what it has.
    pub async fn fill_to_min_idle(&self) {
        loop {
            let id = {
                let mut state = self.state.lock();
                if state.closed || state.total() >= state.min_idle as usize {
                    return;
                }
                state.reserved += 1;
                self.next_id.fetch_add(1, Ordering::SeqCst)
            };
            match self.factory.make_session(id).await {
                Ok(session) => {
                    let mut state = self.state.lock();
                    state.reserved -= 1;
                    state.idle.push_back(session);
                    drop(state);
                    self.creations.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.state.lock().reserved -= 1;
                    tracing::warn!("Failed to pre-fill pool {}: {}", self.name, e);
                    return;
                }
            }
        }
    }

    pub fn statistics(&self) -> PoolStatistics {
        let state = self.state.lock();
        PoolStatistics {
            active: state.active as u32,
            idle: state.idle.len() as u32,
            total: state.total() as u32,
            pending: self.pending.load(Ordering::Relaxed) as u32,
            max_size: state.max_size,
            min_idle: state.min_idle,
            borrows: self.borrows.load(Ordering::Relaxed),
            creations: self.creations.load(Ordering::Relaxed),
            exhaustions: self.exhaustions.load(Ordering::Relaxed),
        }
    }

    pub async fn close(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            state.idle.drain(..).collect::<Vec<_>>()
        };
        for session in drained {
            self.factory.destroy(session).await;
        }
        self.available.notify_waiters();
        tracing::info!("Closed pool {}", self.name);
    }
}
