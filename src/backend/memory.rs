// # In-Memory Driver
//
// A self-contained backend used by the integration tests and the demo
// server. Tables are append-only row vectors shared per backend URL, so
// every proxy server pooling against the same URL sees the same data, the
// way separate servers share one real database.
//
// Supported statements: `INSERT INTO <table> VALUES (...)` with `?`
// placeholders, and `SELECT * FROM <table>`.
//
// The XA connection emulates the lifecycle of real XA drivers: statements
// executed inside a branch are staged, `prepare` parks the staged work in
// the shared store, `commit` publishes it, and after a branch completes the
// connection is unusable for a new `start` until the logical connection has
// been re-opened.

use crate::error::{ErrorDetail, ProxyError, Result, SqlErrorKind};
use crate::protocol::{QueryResult, SqlValue};
use crate::xa::xid::{errors, XidKey};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use super::driver::{DatabaseDriver, DbConnection, XaConnection};

type StagedRow = (String, Vec<SqlValue>);

/// Shared store backing every connection to one URL.
#[derive(Default)]
pub struct MemoryDatabase {
    tables: DashMap<String, Vec<Vec<SqlValue>>>,
    prepared: DashMap<XidKey, Vec<StagedRow>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_row(&self, table: &str, row: Vec<SqlValue>) {
        self.tables.entry(table.to_string()).or_default().push(row);
    }

    fn rows(&self, table: &str) -> Vec<Vec<SqlValue>> {
        self.tables
            .get(table)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    fn apply(&self, staged: Vec<StagedRow>) {
        for (table, row) in staged {
            self.insert_row(&table, row);
        }
    }

    /// Parks staged work durably under the branch id. Merging rather than
    /// replacing lets several branches of one global transaction prepare
    /// into the same store.
    fn park_prepared(&self, xid: XidKey, staged: Vec<StagedRow>) {
        self.prepared.entry(xid).or_default().extend(staged);
    }

    fn take_prepared(&self, xid: &XidKey) -> Option<Vec<StagedRow>> {
        self.prepared.remove(xid).map(|(_, staged)| staged)
    }

    fn prepared_xids(&self) -> Vec<XidKey> {
        self.prepared.iter().map(|entry| entry.key().clone()).collect()
    }
}

fn syntax_error(sql: &str) -> ProxyError {
    ProxyError::Sql(ErrorDetail::new(
        "42601",
        0,
        format!("unsupported statement: {}", sql),
        SqlErrorKind::SqlSyntaxException,
    ))
}

/// Parses a literal or binds the next `?` placeholder.
fn parse_value(token: &str, params: &[SqlValue], param_cursor: &mut usize) -> Result<SqlValue> {
    let token = token.trim();
    if token == "?" {
        let value = params.get(*param_cursor).cloned().ok_or_else(|| {
            ProxyError::Sql(ErrorDetail::new(
                "07001",
                0,
                format!("missing bind value for placeholder {}", *param_cursor + 1),
                SqlErrorKind::SqlException,
            ))
        })?;
        *param_cursor += 1;
        return Ok(value);
    }
    if token.eq_ignore_ascii_case("null") {
        return Ok(SqlValue::Null);
    }
    if token.eq_ignore_ascii_case("true") {
        return Ok(SqlValue::Bool(true));
    }
    if token.eq_ignore_ascii_case("false") {
        return Ok(SqlValue::Bool(false));
    }
    if token.starts_with('\'') && token.ends_with('\'') && token.len() >= 2 {
        return Ok(SqlValue::Text(token[1..token.len() - 1].to_string()));
    }
    if let Ok(v) = token.parse::<i64>() {
        return Ok(SqlValue::Int(v));
    }
    if let Ok(v) = token.parse::<f64>() {
        return Ok(SqlValue::Float(v));
    }
    Err(syntax_error(token))
}

/// Splits a VALUES list on commas, respecting single-quoted strings.
fn split_values(list: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    for ch in list.chars() {
        match ch {
            '\'' => {
                in_quote = !in_quote;
                current.push(ch);
            }
            ',' if !in_quote => {
                out.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

enum Statement {
    Insert { table: String, row_spec: Vec<String> },
    Select { table: String },
}

fn parse_statement(sql: &str) -> Result<Statement> {
    let trimmed = sql.trim().trim_end_matches(';');
    let upper = trimmed.to_uppercase();

    if upper.starts_with("INSERT INTO ") {
        let rest = &trimmed["INSERT INTO ".len()..];
        let (table, tail) = rest.split_once(char::is_whitespace).ok_or_else(|| syntax_error(sql))?;
        let tail = tail.trim();
        if !tail.to_uppercase().starts_with("VALUES") {
            return Err(syntax_error(sql));
        }
        let values = tail["VALUES".len()..].trim();
        let inner = values
            .strip_prefix('(')
            .and_then(|v| v.strip_suffix(')'))
            .ok_or_else(|| syntax_error(sql))?;
        return Ok(Statement::Insert {
            table: table.to_string(),
            row_spec: split_values(inner),
        });
    }

    if upper.starts_with("SELECT * FROM ") {
        let table = trimmed["SELECT * FROM ".len()..].trim();
        if table.is_empty() || table.contains(char::is_whitespace) {
            return Err(syntax_error(sql));
        }
        return Ok(Statement::Select {
            table: table.to_string(),
        });
    }

    Err(syntax_error(sql))
}

fn select_result(rows: Vec<Vec<SqlValue>>) -> QueryResult {
    let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
    QueryResult {
        columns: (1..=width).map(|i| format!("c{}", i)).collect(),
        rows,
        rows_affected: 0,
    }
}

fn insert_result() -> QueryResult {
    QueryResult {
        columns: Vec::new(),
        rows: Vec::new(),
        rows_affected: 1,
    }
}

// ============================================================================
// Regular connection
// ============================================================================

pub struct MemoryConnection {
    db: Arc<MemoryDatabase>,
    closed: bool,
}

impl MemoryConnection {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(ProxyError::Network("connection is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DbConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        self.check_open()?;
        match parse_statement(sql)? {
            Statement::Insert { table, row_spec } => {
                let mut cursor = 0;
                let row = row_spec
                    .iter()
                    .map(|token| parse_value(token, params, &mut cursor))
                    .collect::<Result<Vec<_>>>()?;
                self.db.insert_row(&table, row);
                Ok(insert_result())
            }
            Statement::Select { table } => Ok(select_result(self.db.rows(&table))),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.check_open()
    }

    async fn reset(&mut self) -> Result<()> {
        self.check_open()
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

// ============================================================================
// XA connection
// ============================================================================

/// Resource-manager side view of the branch on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RmPhase {
    Idle,
    Active,
    Ended,
    Prepared,
}

pub struct MemoryXaConnection {
    db: Arc<MemoryDatabase>,
    branch: Option<XidKey>,
    phase: RmPhase,
    staged: Vec<StagedRow>,
    /// Set after a branch completes; cleared by `reopen_logical`. While set,
    /// a new `xa_start` is rejected the way real drivers reject it.
    needs_reopen: bool,
    closed: bool,
}

impl MemoryXaConnection {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(ProxyError::Network("connection is closed".to_string()));
        }
        Ok(())
    }

    fn complete_branch(&mut self) {
        self.branch = None;
        self.phase = RmPhase::Idle;
        self.staged.clear();
        self.needs_reopen = true;
    }

    fn require_branch(&self, xid: &XidKey) -> Result<()> {
        match &self.branch {
            Some(current) if current == xid => Ok(()),
            Some(_) => Err(ProxyError::xa(
                errors::XAER_PROTO,
                format!("{} is not the branch associated with this connection", xid),
            )),
            None => Err(ProxyError::xa(
                errors::XAER_NOTA,
                format!("{} is not known to this resource manager", xid),
            )),
        }
    }
}

#[async_trait]
impl XaConnection for MemoryXaConnection {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        self.check_open()?;
        match parse_statement(sql)? {
            Statement::Insert { table, row_spec } => {
                let mut cursor = 0;
                let row = row_spec
                    .iter()
                    .map(|token| parse_value(token, params, &mut cursor))
                    .collect::<Result<Vec<_>>>()?;
                if self.phase == RmPhase::Active {
                    self.staged.push((table, row));
                } else {
                    // Outside a branch the logical connection is autocommit.
                    self.db.insert_row(&table, row);
                }
                Ok(insert_result())
            }
            Statement::Select { table } => {
                let mut rows = self.db.rows(&table);
                if self.phase == RmPhase::Active {
                    rows.extend(
                        self.staged
                            .iter()
                            .filter(|(t, _)| t == &table)
                            .map(|(_, row)| row.clone()),
                    );
                }
                Ok(select_result(rows))
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.check_open()
    }

    async fn reopen_logical(&mut self) -> Result<()> {
        self.check_open()?;
        if self.branch.is_some() {
            return Err(ProxyError::xa(
                errors::XAER_PROTO,
                "cannot re-open the logical connection while a branch is associated",
            ));
        }
        self.needs_reopen = false;
        Ok(())
    }

    async fn xa_start(&mut self, xid: &XidKey, flags: i32) -> Result<()> {
        use crate::xa::xid::flags::{TMJOIN, TMNOFLAGS, TMRESUME};
        self.check_open()?;
        match flags {
            TMNOFLAGS => {
                if self.needs_reopen {
                    return Err(ProxyError::xa(
                        errors::XAER_PROTO,
                        "connection still holds completed-transaction state; logical connection must be re-opened first",
                    ));
                }
                if self.branch.is_some() {
                    return Err(ProxyError::xa(
                        errors::XAER_PROTO,
                        "a branch is already associated with this connection",
                    ));
                }
                if self.db.prepared.contains_key(xid) {
                    return Err(ProxyError::xa(
                        errors::XAER_DUPID,
                        format!("{} already exists in prepared state", xid),
                    ));
                }
                self.branch = Some(xid.clone());
                self.phase = RmPhase::Active;
                Ok(())
            }
            f if f == TMJOIN || f == TMRESUME => {
                self.require_branch(xid)?;
                if self.phase != RmPhase::Ended {
                    return Err(ProxyError::xa(
                        errors::XAER_PROTO,
                        format!("{} is not in a joinable state", xid),
                    ));
                }
                self.phase = RmPhase::Active;
                Ok(())
            }
            other => Err(ProxyError::xa(
                errors::XAER_INVAL,
                format!("unsupported xa_start flags {:#x}", other),
            )),
        }
    }

    async fn xa_end(&mut self, xid: &XidKey, flags: i32) -> Result<()> {
        use crate::xa::xid::flags::{TMFAIL, TMSUCCESS, TMSUSPEND};
        self.check_open()?;
        self.require_branch(xid)?;
        if self.phase != RmPhase::Active {
            return Err(ProxyError::xa(
                errors::XAER_PROTO,
                format!("{} is not active", xid),
            ));
        }
        if flags != TMSUCCESS && flags != TMFAIL && flags != TMSUSPEND {
            return Err(ProxyError::xa(
                errors::XAER_INVAL,
                format!("unsupported xa_end flags {:#x}", flags),
            ));
        }
        if flags == TMFAIL {
            self.staged.clear();
        }
        self.phase = RmPhase::Ended;
        Ok(())
    }

    async fn xa_prepare(&mut self, xid: &XidKey) -> Result<()> {
        self.check_open()?;
        self.require_branch(xid)?;
        if self.phase != RmPhase::Ended {
            return Err(ProxyError::xa(
                errors::XAER_PROTO,
                format!("{} has not been ended", xid),
            ));
        }
        let staged = std::mem::take(&mut self.staged);
        self.db.park_prepared(xid.clone(), staged);
        self.phase = RmPhase::Prepared;
        Ok(())
    }

    async fn xa_commit(&mut self, xid: &XidKey, one_phase: bool) -> Result<()> {
        self.check_open()?;
        if self.branch.as_ref() == Some(xid) {
            if one_phase {
                if self.phase != RmPhase::Ended {
                    return Err(ProxyError::xa(
                        errors::XAER_PROTO,
                        format!("{} is not in a one-phase committable state", xid),
                    ));
                }
                let staged = std::mem::take(&mut self.staged);
                self.db.apply(staged);
            } else {
                if self.phase != RmPhase::Prepared {
                    return Err(ProxyError::xa(
                        errors::XAER_PROTO,
                        format!("{} has not been prepared", xid),
                    ));
                }
                if let Some(staged) = self.db.take_prepared(xid) {
                    self.db.apply(staged);
                }
            }
            self.complete_branch();
            return Ok(());
        }
        // Recovered branch committed from a different connection.
        match self.db.take_prepared(xid) {
            Some(staged) if !one_phase => {
                self.db.apply(staged);
                Ok(())
            }
            Some(staged) => {
                self.db.park_prepared(xid.clone(), staged);
                Err(ProxyError::xa(
                    errors::XAER_PROTO,
                    format!("{} is prepared; one-phase commit is invalid", xid),
                ))
            }
            None => Err(ProxyError::xa(
                errors::XAER_NOTA,
                format!("{} is not known to this resource manager", xid),
            )),
        }
    }

    async fn xa_rollback(&mut self, xid: &XidKey) -> Result<()> {
        self.check_open()?;
        if self.branch.as_ref() == Some(xid) {
            if self.phase == RmPhase::Prepared {
                self.db.take_prepared(xid);
            }
            self.complete_branch();
            return Ok(());
        }
        if self.db.take_prepared(xid).is_some() {
            return Ok(());
        }
        Err(ProxyError::xa(
            errors::XAER_NOTA,
            format!("{} is not known to this resource manager", xid),
        ))
    }

    async fn xa_forget(&mut self, xid: &XidKey) -> Result<()> {
        self.check_open()?;
        if self.db.take_prepared(xid).is_none() {
            return Err(ProxyError::xa(
                errors::XAER_NOTA,
                format!("{} has no heuristically completed state to forget", xid),
            ));
        }
        Ok(())
    }

    async fn xa_recover(&mut self, _flags: i32) -> Result<Vec<XidKey>> {
        self.check_open()?;
        Ok(self.db.prepared_xids())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Driver serving any URL from process-local shared stores. One instance is
/// shared by every server in an in-process cluster, which is what makes the
/// backends behave like a single database.
#[derive(Default)]
pub struct MemoryDriver {
    databases: DashMap<String, Arc<MemoryDatabase>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn database_for(&self, url: &str) -> Arc<MemoryDatabase> {
        self.databases
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(MemoryDatabase::new()))
            .clone()
    }
}

#[async_trait]
impl DatabaseDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn accepts(&self, _url: &str) -> bool {
        true
    }

    async fn connect(
        &self,
        url: &str,
        _user: &str,
        _password: &str,
    ) -> Result<Box<dyn DbConnection>> {
        Ok(Box::new(MemoryConnection {
            db: self.database_for(url),
            closed: false,
        }))
    }

    async fn connect_xa(
        &self,
        url: &str,
        _user: &str,
        _password: &str,
    ) -> Result<Box<dyn XaConnection>> {
        Ok(Box::new(MemoryXaConnection {
            db: self.database_for(url),
            branch: None,
            phase: RmPhase::Idle,
            staged: Vec::new(),
            needs_reopen: false,
            closed: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xa::xid::flags::{TMNOFLAGS, TMSUCCESS};

    #[tokio::test]
    async fn test_insert_and_select() {
        let driver = MemoryDriver::new();
        let mut conn = driver.connect("odbp://s1:1059/db", "app", "pw").await.unwrap();

        let result = conn
            .execute("INSERT INTO accounts VALUES (1, 'alice')", &[])
            .await
            .unwrap();
        assert_eq!(result.rows_affected, 1);

        let result = conn.execute("SELECT * FROM accounts", &[]).await.unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][1], SqlValue::Text("alice".to_string()));
    }

    #[tokio::test]
    async fn test_placeholders_bind_in_order() {
        let driver = MemoryDriver::new();
        let mut conn = driver.connect("odbp://s1:1059/db", "app", "pw").await.unwrap();
        conn.execute(
            "INSERT INTO t VALUES (?, ?)",
            &[SqlValue::Int(5), SqlValue::Text("five".to_string())],
        )
        .await
        .unwrap();
        let result = conn.execute("SELECT * FROM t", &[]).await.unwrap();
        assert_eq!(result.rows[0], vec![SqlValue::Int(5), SqlValue::Text("five".to_string())]);
    }

    #[tokio::test]
    async fn test_shared_store_per_url() {
        let driver = MemoryDriver::new();
        let mut a = driver.connect("odbp://s1:1059/db", "app", "pw").await.unwrap();
        let mut b = driver.connect("odbp://s1:1059/db", "app", "pw").await.unwrap();

        a.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
        let seen = b.execute("SELECT * FROM t", &[]).await.unwrap();
        assert_eq!(seen.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_xa_branch_staging_and_visibility() {
        let driver = MemoryDriver::new();
        let mut xa = driver.connect_xa("odbp://s1:1059/db", "app", "pw").await.unwrap();
        let mut other = driver.connect("odbp://s1:1059/db", "app", "pw").await.unwrap();

        let xid = XidKey::generate();
        xa.xa_start(&xid, TMNOFLAGS).await.unwrap();
        xa.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();

        // Uncommitted work is invisible to other connections...
        assert_eq!(other.execute("SELECT * FROM t", &[]).await.unwrap().rows.len(), 0);
        // ...but visible inside the branch.
        assert_eq!(xa.execute("SELECT * FROM t", &[]).await.unwrap().rows.len(), 1);

        xa.xa_end(&xid, TMSUCCESS).await.unwrap();
        xa.xa_prepare(&xid).await.unwrap();
        xa.xa_commit(&xid, false).await.unwrap();

        assert_eq!(other.execute("SELECT * FROM t", &[]).await.unwrap().rows.len(), 1);
    }

    #[tokio::test]
    async fn test_xa_start_requires_reopen_after_completion() {
        let driver = MemoryDriver::new();
        let mut xa = driver.connect_xa("odbp://s1:1059/db", "app", "pw").await.unwrap();

        let xid1 = XidKey::generate();
        xa.xa_start(&xid1, TMNOFLAGS).await.unwrap();
        xa.xa_end(&xid1, TMSUCCESS).await.unwrap();
        xa.xa_commit(&xid1, true).await.unwrap();

        // Without re-opening the logical connection, a new start is refused.
        let xid2 = XidKey::generate();
        let err = xa.xa_start(&xid2, TMNOFLAGS).await.unwrap_err();
        match err {
            ProxyError::XaProtocol { code, .. } => assert_eq!(code, errors::XAER_PROTO),
            other => panic!("unexpected error: {:?}", other),
        }

        xa.reopen_logical().await.unwrap();
        xa.xa_start(&xid2, TMNOFLAGS).await.unwrap();
    }

    #[tokio::test]
    async fn test_xa_recover_lists_prepared_branches() {
        let driver = MemoryDriver::new();
        let mut xa = driver.connect_xa("odbp://s1:1059/db", "app", "pw").await.unwrap();

        let xid = XidKey::generate();
        xa.xa_start(&xid, TMNOFLAGS).await.unwrap();
        xa.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
        xa.xa_end(&xid, TMSUCCESS).await.unwrap();
        xa.xa_prepare(&xid).await.unwrap();

        let mut probe = driver.connect_xa("odbp://s1:1059/db", "app", "pw").await.unwrap();
        let recovered = probe.xa_recover(0).await.unwrap();
        assert_eq!(recovered, vec![xid.clone()]);

        probe.xa_commit(&xid, false).await.unwrap();
        assert!(probe.xa_recover(0).await.unwrap().is_empty());
    }
}
