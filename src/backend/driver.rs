// # Database Driver Seam
//
// The proxy talks to databases exclusively through these trait objects. A
// driver is registered once at startup and selected by URL; nothing in the
// core links against a concrete database client.
//
// The XA surface mirrors the shape real XA drivers expose: one physical
// connection that vends a *logical* connection for SQL plus a resource
// manager interface for branch verbs. Most drivers leave the connection in
// an unusable state after a branch completes until the logical connection
// is re-opened; callers are expected to `reopen_logical` between
// transactions.

use crate::error::Result;
use crate::protocol::{QueryResult, SqlValue};
use crate::xa::xid::XidKey;
use async_trait::async_trait;

/// Factory for physical database connections, selected by URL.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Short driver identifier, e.g. `"memory"`.
    fn name(&self) -> &'static str;

    /// Whether this driver can serve the given backend URL.
    fn accepts(&self, url: &str) -> bool;

    async fn connect(&self, url: &str, user: &str, password: &str)
        -> Result<Box<dyn DbConnection>>;

    async fn connect_xa(&self, url: &str, user: &str, password: &str)
        -> Result<Box<dyn XaConnection>>;
}

/// One regular physical connection.
#[async_trait]
pub trait DbConnection: Send {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult>;

    /// Cheap liveness probe used by pool validation.
    async fn ping(&mut self) -> Result<()>;

    /// Clears per-session state before the connection is returned to a pool.
    async fn reset(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// One XA-capable physical connection plus its current logical connection.
#[async_trait]
pub trait XaConnection: Send {
    /// Executes on the current logical connection, inside whatever branch is
    /// associated with it.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult>;

    async fn ping(&mut self) -> Result<()>;

    /// Closes the current logical connection and opens a fresh one,
    /// restoring the resource manager to an idle state.
    async fn reopen_logical(&mut self) -> Result<()>;

    async fn xa_start(&mut self, xid: &XidKey, flags: i32) -> Result<()>;
    async fn xa_end(&mut self, xid: &XidKey, flags: i32) -> Result<()>;
    async fn xa_prepare(&mut self, xid: &XidKey) -> Result<()>;
    async fn xa_commit(&mut self, xid: &XidKey, one_phase: bool) -> Result<()>;
    async fn xa_rollback(&mut self, xid: &XidKey) -> Result<()>;
    async fn xa_forget(&mut self, xid: &XidKey) -> Result<()>;

    /// Lists branches the resource manager holds in prepared state.
    async fn xa_recover(&mut self, flags: i32) -> Result<Vec<XidKey>>;

    async fn close(&mut self) -> Result<()>;
}
