// # Open DB Proxy Server
//
// Entry point for one proxy server node. Registers the available database
// drivers and pool providers, builds the statement service, and serves the
// RPC surface.

use odbp::backend::memory::MemoryDriver;
use odbp::backend::provider::{DriverRegistry, ProviderRegistry};
use odbp::cluster::Endpoint;
use odbp::server::{ProxyServer, StatementService};
use odbp::{Result, VERSION};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let listen = std::env::var("ODBP_LISTEN").unwrap_or_else(|_| "0.0.0.0:1059".to_string());
    let advertised = std::env::var("ODBP_ADVERTISED")
        .unwrap_or_else(|_| listen.clone())
        .parse::<Endpoint>()?;

    info!("Starting Open DB Proxy v{}", VERSION);
    info!("Advertised endpoint: {}", advertised);

    let mut drivers = DriverRegistry::new();
    drivers.register(Arc::new(MemoryDriver::new()));

    let providers = ProviderRegistry::with_defaults();

    let service = StatementService::new(advertised, Arc::new(drivers), Arc::new(providers));
    let server = ProxyServer::new(service);

    let result = server.run(&listen).await;
    if let Err(ref e) = result {
        tracing::error!("Server stopped with error: {}", e);
    }
    result
}
