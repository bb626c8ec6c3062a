// # Backend Session
//
// One pooled unit of work against the database: a regular physical
// connection, or an XA physical connection with its current logical
// connection. A backend session is owned by at most one logical client
// session at any moment; the pool borrow is the hand-off point.

use crate::error::{ProxyError, Result};
use crate::protocol::{QueryResult, SqlValue};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::driver::{DatabaseDriver, DbConnection, XaConnection};

enum BackendConnection {
    Regular(Box<dyn DbConnection>),
    Xa(Box<dyn XaConnection>),
}

pub struct BackendSession {
    id: u64,
    created_at: Instant,
    last_used_at: Instant,
    borrow_count: u64,
    inner: BackendConnection,
}

impl std::fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSession")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .field("borrow_count", &self.borrow_count)
            .finish()
    }
}

impl BackendSession {
    fn new(id: u64, inner: BackendConnection) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            borrow_count: 0,
            inner,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_xa(&self) -> bool {
        matches!(self.inner, BackendConnection::Xa(_))
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    pub(crate) fn mark_borrowed(&mut self) {
        self.borrow_count += 1;
        self.last_used_at = Instant::now();
    }

    pub(crate) fn mark_returned(&mut self) {
        self.last_used_at = Instant::now();
    }

    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        self.last_used_at = Instant::now();
        match &mut self.inner {
            BackendConnection::Regular(conn) => conn.execute(sql, params).await,
            BackendConnection::Xa(conn) => conn.execute(sql, params).await,
        }
    }

    pub async fn ping(&mut self) -> Result<()> {
        match &mut self.inner {
            BackendConnection::Regular(conn) => conn.ping().await,
            BackendConnection::Xa(conn) => conn.ping().await,
        }
    }

    /// The XA verb surface of this session. Errors for regular sessions.
    pub fn xa_resource(&mut self) -> Result<&mut dyn XaConnection> {
        match &mut self.inner {
            BackendConnection::Xa(conn) => Ok(conn.as_mut()),
            BackendConnection::Regular(_) => Err(ProxyError::Internal(
                "backend session is not XA-capable".to_string(),
            )),
        }
    }

    /// Clears per-transaction state when the session goes back to the pool.
    pub async fn reset(&mut self) -> Result<()> {
        match &mut self.inner {
            BackendConnection::Regular(conn) => conn.reset().await,
            BackendConnection::Xa(_) => Ok(()),
        }
    }

    /// Closes and re-opens the logical connection of an XA session,
    /// restoring the resource manager to an idle, startable state.
    pub async fn hibernate(&mut self) -> Result<()> {
        match &mut self.inner {
            BackendConnection::Xa(conn) => conn.reopen_logical().await,
            BackendConnection::Regular(_) => Err(ProxyError::Internal(
                "hibernate on a non-XA backend session".to_string(),
            )),
        }
    }

    /// Destroys the physical connection.
    pub async fn close(&mut self) -> Result<()> {
        match &mut self.inner {
            BackendConnection::Regular(conn) => conn.close().await,
            BackendConnection::Xa(conn) => conn.close().await,
        }
    }
}

/// Pool hooks for creating, validating and destroying backend sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn make_session(&self, id: u64) -> Result<BackendSession>;

    /// Liveness check before a session leaves the pool.
    async fn validate(&self, session: &mut BackendSession) -> Result<bool>;

    /// State reset as the session comes back to the pool.
    async fn passivate(&self, session: &mut BackendSession) -> Result<()>;

    /// Physical teardown; errors are logged, never propagated.
    async fn destroy(&self, mut session: BackendSession) {
        if let Err(e) = session.close().await {
            tracing::warn!("Failed to close backend session {}: {}", session.id(), e);
        }
    }
}

/// Factory producing sessions through a registered database driver.
pub struct DriverSessionFactory {
    driver: Arc<dyn DatabaseDriver>,
    url: String,
    user: String,
    password: String,
    xa: bool,
    validation_query: Option<String>,
}

impl DriverSessionFactory {
    pub fn new(
        driver: Arc<dyn DatabaseDriver>,
        url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        xa: bool,
        validation_query: Option<String>,
    ) -> Self {
        Self {
            driver,
            url: url.into(),
            user: user.into(),
            password: password.into(),
            xa,
            validation_query,
        }
    }
}

#[async_trait]
impl SessionFactory for DriverSessionFactory {
    async fn make_session(&self, id: u64) -> Result<BackendSession> {
        let inner = if self.xa {
            BackendConnection::Xa(
                self.driver
                    .connect_xa(&self.url, &self.user, &self.password)
                    .await?,
            )
        } else {
            BackendConnection::Regular(
                self.driver
                    .connect(&self.url, &self.user, &self.password)
                    .await?,
            )
        };
        tracing::debug!("Opened backend session {} (xa={})", id, self.xa);
        Ok(BackendSession::new(id, inner))
    }

    async fn validate(&self, session: &mut BackendSession) -> Result<bool> {
        let outcome = match &self.validation_query {
            Some(query) => session.execute(query, &[]).await.map(|_| ()),
            None => session.ping().await,
        };
        Ok(outcome.is_ok())
    }

    async fn passivate(&self, session: &mut BackendSession) -> Result<()> {
        session.reset().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDriver;

    #[tokio::test]
    async fn test_factory_round_trip() {
        let driver = Arc::new(MemoryDriver::new());
        let factory =
            DriverSessionFactory::new(driver, "odbp://s1:1059/db", "app", "pw", false, None);

        let mut session = factory.make_session(1).await.unwrap();
        assert!(!session.is_xa());
        assert!(factory.validate(&mut session).await.unwrap());
        factory.passivate(&mut session).await.unwrap();
        factory.destroy(session).await;
    }

    #[tokio::test]
    async fn test_xa_resource_only_on_xa_sessions() {
        let driver = Arc::new(MemoryDriver::new());
        let factory = DriverSessionFactory::new(
            driver.clone(),
            "odbp://s1:1059/db",
            "app",
            "pw",
            false,
            None,
        );
        let mut regular = factory.make_session(1).await.unwrap();
        assert!(regular.xa_resource().is_err());

        let xa_factory =
            DriverSessionFactory::new(driver, "odbp://s1:1059/db", "app", "pw", true, None);
        let mut xa = xa_factory.make_session(2).await.unwrap();
        assert!(xa.is_xa());
        assert!(xa.xa_resource().is_ok());
    }
}
