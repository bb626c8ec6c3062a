// XA Unified-Mode Integration Test
//
// Runs distributed transactions through an in-process cluster: unified
// session mirroring, sequential transactions on one logical connection
// (hibernation between them), two-phase commit, rollback, recovery, and
// the dual-condition backend release.

use odbp::backend::memory::MemoryDriver;
use odbp::backend::provider::{DriverRegistry, ProviderRegistry};
use odbp::client::ProxyDataSource;
use odbp::cluster::Endpoint;
use odbp::protocol::SqlValue;
use odbp::server::{ProxyServer, StatementService};
use odbp::xa::xid::flags::{TMNOFLAGS, TMSUCCESS};
use odbp::xa::XidKey;
use odbp::ProxyError;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct TestCluster {
    endpoints: Vec<Endpoint>,
    services: Vec<Arc<StatementService>>,
    handles: Vec<JoinHandle<()>>,
}

impl TestCluster {
    async fn start(server_count: usize) -> Self {
        let mut drivers = DriverRegistry::new();
        drivers.register(Arc::new(MemoryDriver::new()));
        let drivers = Arc::new(drivers);
        let providers = Arc::new(ProviderRegistry::with_defaults());

        let mut endpoints = Vec::new();
        let mut services = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..server_count {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let endpoint = Endpoint::new("127.0.0.1", addr.port());

            let service =
                StatementService::new(endpoint.clone(), drivers.clone(), providers.clone());
            let server = ProxyServer::new(service.clone());
            handles.push(tokio::spawn(async move {
                let _ = server.serve(listener).await;
            }));
            endpoints.push(endpoint);
            services.push(service);
        }
        Self {
            endpoints,
            services,
            handles,
        }
    }

    /// Stops one server, closing its listener so new connections are
    /// refused.
    fn kill(&mut self, index: usize) {
        self.handles[index].abort();
    }

    fn url(&self) -> String {
        let authority = self
            .endpoints
            .iter()
            .map(|ep| ep.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("odbp://{}/testdb", authority)
    }
}

#[tokio::test]
async fn test_unified_connect_mirrors_sessions_onto_all_servers() {
    let cluster = TestCluster::start(3).await;
    let ds = ProxyDataSource::new(&cluster.url(), "app", "pw").unwrap();

    let xa = ds.xa_connection().await.unwrap();
    assert_eq!(xa.bindings().len(), 3);

    // Every server populated target_server with its own address, in the
    // client's endpoint order; the first binding is the primary.
    for (binding, endpoint) in xa.bindings().iter().zip(&cluster.endpoints) {
        assert_eq!(binding.target_server, endpoint.to_string());
        assert!(binding.is_xa);
    }
    assert_eq!(xa.primary().session_uuid, xa.bindings()[0].session_uuid);

    for service in &cluster.services {
        assert_eq!(service.active_sessions(), 1);
    }
    assert_eq!(ds.manager().tracker().bound_sessions().len(), 3);

    xa.close().await.unwrap();
    for service in &cluster.services {
        assert_eq!(service.active_sessions(), 0);
    }
}

#[tokio::test]
async fn test_failed_unified_connect_unwinds_partial_sessions() {
    let mut cluster = TestCluster::start(3).await;
    // The last server is dead, so the unified connect fails after the
    // first two servers have already created sessions.
    cluster.kill(2);

    let ds = ProxyDataSource::new(&cluster.url(), "app", "pw").unwrap();
    let err = ds.xa_connection().await.unwrap_err();
    assert!(odbp::classify::ErrorClassifier::is_connection_level(&err));

    // The partial sessions were terminated, not leaked: nothing stays
    // registered server-side and no backend stays borrowed.
    for service in &cluster.services[..2] {
        assert_eq!(service.active_sessions(), 0);
    }
    assert!(ds.manager().tracker().bound_sessions().is_empty());

    // A retry against the repaired view of the cluster does not stack
    // orphaned sessions either.
    assert!(ds.xa_connection().await.is_err());
    for service in &cluster.services[..2] {
        assert_eq!(service.active_sessions(), 0);
    }
}

#[tokio::test]
async fn test_sequential_transactions_on_one_logical_connection() {
    let cluster = TestCluster::start(2).await;
    let ds = ProxyDataSource::new(&cluster.url(), "app", "pw").unwrap();
    let xa = ds.xa_connection().await.unwrap();

    // First transaction: insert and one-phase commit.
    let xid1 = XidKey::generate();
    xa.start(&xid1, TMNOFLAGS).await.unwrap();
    xa.execute(
        "INSERT INTO orders VALUES (?, ?)",
        &[SqlValue::Int(1), SqlValue::Text("widget".to_string())],
    )
    .await
    .unwrap();
    xa.end(&xid1, TMSUCCESS).await.unwrap();
    xa.commit(&xid1, true).await.unwrap();

    // Second transaction on the SAME logical connection. This only works
    // because every branch was hibernated after the first commit.
    let xid2 = XidKey::generate();
    xa.start(&xid2, TMNOFLAGS).await.unwrap();
    let rows = xa.execute("SELECT * FROM orders", &[]).await.unwrap();
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(rows.rows[0][1], SqlValue::Text("widget".to_string()));
    xa.end(&xid2, TMSUCCESS).await.unwrap();
    xa.commit(&xid2, true).await.unwrap();

    xa.close().await.unwrap();
}

#[tokio::test]
async fn test_two_phase_commit_across_branches() {
    let cluster = TestCluster::start(2).await;
    let ds = ProxyDataSource::new(&cluster.url(), "app", "pw").unwrap();
    let xa = ds.xa_connection().await.unwrap();

    let xid = XidKey::generate();
    xa.start(&xid, TMNOFLAGS).await.unwrap();
    xa.execute("INSERT INTO ledger VALUES (100)", &[]).await.unwrap();
    xa.end(&xid, TMSUCCESS).await.unwrap();
    xa.prepare(&xid).await.unwrap();
    xa.commit(&xid, false).await.unwrap();

    let rows = xa.execute("SELECT * FROM ledger", &[]).await.unwrap();
    assert_eq!(rows.rows.len(), 1);

    // All branches reached a terminal state.
    for service in &cluster.services {
        assert_eq!(service.branch_count(), 0);
    }
    xa.close().await.unwrap();
}

#[tokio::test]
async fn test_rollback_discards_branch_work() {
    let cluster = TestCluster::start(2).await;
    let ds = ProxyDataSource::new(&cluster.url(), "app", "pw").unwrap();
    let xa = ds.xa_connection().await.unwrap();

    let xid = XidKey::generate();
    xa.start(&xid, TMNOFLAGS).await.unwrap();
    xa.execute("INSERT INTO ledger VALUES (100)", &[]).await.unwrap();
    xa.end(&xid, TMSUCCESS).await.unwrap();
    xa.rollback(&xid).await.unwrap();

    let rows = xa.execute("SELECT * FROM ledger", &[]).await.unwrap();
    assert_eq!(rows.rows.len(), 0);
    xa.close().await.unwrap();
}

#[tokio::test]
async fn test_recover_reports_prepared_branch() {
    let cluster = TestCluster::start(2).await;
    let ds = ProxyDataSource::new(&cluster.url(), "app", "pw").unwrap();
    let xa = ds.xa_connection().await.unwrap();

    let xid = XidKey::generate();
    xa.start(&xid, TMNOFLAGS).await.unwrap();
    xa.execute("INSERT INTO ledger VALUES (7)", &[]).await.unwrap();
    xa.end(&xid, TMSUCCESS).await.unwrap();
    xa.prepare(&xid).await.unwrap();

    let recovered = xa.recover().await.unwrap();
    assert!(recovered.contains(&xid));

    xa.commit(&xid, false).await.unwrap();
    assert!(xa.recover().await.unwrap().is_empty());
    xa.close().await.unwrap();
}

#[tokio::test]
async fn test_dual_condition_releases_backend_only_after_both_events() {
    let cluster = TestCluster::start(1).await;
    let ds = ProxyDataSource::new(&cluster.url(), "app", "pw").unwrap();
    let xa = ds.xa_connection().await.unwrap();
    let hash = xa.primary().conn_hash.clone();
    let service = &cluster.services[0];

    let borrowed_before = service.pool_statistics(&hash).unwrap().active;
    assert_eq!(borrowed_before, 1);

    let xid = XidKey::generate();
    xa.start(&xid, TMNOFLAGS).await.unwrap();
    xa.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
    xa.end(&xid, TMSUCCESS).await.unwrap();
    xa.commit(&xid, true).await.unwrap();

    // Transaction complete, session still open: backend stays bound.
    assert_eq!(service.pool_statistics(&hash).unwrap().active, 1);

    xa.close().await.unwrap();
    // Both conditions met: backend returned to the pool.
    assert_eq!(service.pool_statistics(&hash).unwrap().active, 0);
}

#[tokio::test]
async fn test_client_side_protocol_enforcement() {
    let cluster = TestCluster::start(1).await;
    let ds = ProxyDataSource::new(&cluster.url(), "app", "pw").unwrap();
    let xa = ds.xa_connection().await.unwrap();

    let xid = XidKey::generate();

    // End before start.
    assert!(matches!(
        xa.end(&xid, TMSUCCESS).await.unwrap_err(),
        ProxyError::XaProtocol { .. }
    ));

    xa.start(&xid, TMNOFLAGS).await.unwrap();

    // Starting a second transaction while one is active.
    let other = XidKey::generate();
    assert!(matches!(
        xa.start(&other, TMNOFLAGS).await.unwrap_err(),
        ProxyError::XaProtocol { .. }
    ));

    // Two-phase commit without prepare.
    xa.end(&xid, TMSUCCESS).await.unwrap();
    assert!(matches!(
        xa.commit(&xid, false).await.unwrap_err(),
        ProxyError::XaProtocol { .. }
    ));

    // The branch can still recover by rolling back.
    xa.rollback(&xid).await.unwrap();
    xa.close().await.unwrap();
}

#[tokio::test]
async fn test_work_is_visible_across_the_cluster_after_commit() {
    // Two XA connections from two clients; the second reads what the first
    // committed, regardless of which server serves it.
    let cluster = TestCluster::start(2).await;
    let url = cluster.url();

    let writer_ds = ProxyDataSource::new(&url, "app", "pw").unwrap();
    let writer = writer_ds.xa_connection().await.unwrap();
    let xid = XidKey::generate();
    writer.start(&xid, TMNOFLAGS).await.unwrap();
    writer
        .execute("INSERT INTO shared VALUES (42)", &[])
        .await
        .unwrap();
    writer.end(&xid, TMSUCCESS).await.unwrap();
    writer.commit(&xid, true).await.unwrap();
    writer.close().await.unwrap();

    let reader_ds = ProxyDataSource::new(&url, "app", "pw").unwrap();
    let reader = reader_ds.connection().await.unwrap();
    let rows = reader.execute("SELECT * FROM shared", &[]).await.unwrap();
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(rows.rows[0][0], SqlValue::Int(42));
    reader.close().await.unwrap();
}
