// # Proxy Server Listener
//
// Accepts client connections and frames requests into the statement
// service: one task per connection, one request/response pair at a time per
// connection.

use crate::error::{ProxyError, Result};
use crate::protocol::{read_frame, write_frame, Request, Response};
use crate::server::StatementService;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// Upper bound on concurrently served client connections.
pub const MAX_CONCURRENT_CONNECTIONS: usize = 10_000;

pub struct ProxyServer {
    service: Arc<StatementService>,
    active_connections: Arc<AtomicUsize>,
}

impl ProxyServer {
    pub fn new(service: Arc<StatementService>) -> Self {
        Self {
            service,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Binds and serves. Blocks until the listener fails.
    pub async fn run(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::Network(e.to_string()))?;
        tracing::info!("Proxy server listening on {}", addr);
        self.serve(listener).await
    }

    /// Serves an already-bound listener. Useful when the caller needs the
    /// ephemeral port before accepting.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer) = listener
                .accept()
                .await
                .map_err(|e| ProxyError::Network(e.to_string()))?;

            let current = self.active_connections.load(Ordering::Relaxed);
            if current >= MAX_CONCURRENT_CONNECTIONS {
                tracing::warn!(
                    "Connection limit reached ({}/{}), rejecting {}",
                    current,
                    MAX_CONCURRENT_CONNECTIONS,
                    peer
                );
                continue;
            }
            tracing::debug!("Client connected from {}", peer);

            self.active_connections.fetch_add(1, Ordering::Relaxed);
            let service = self.service.clone();
            let active_connections = self.active_connections.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, service).await {
                    tracing::debug!("Connection from {} ended: {}", peer, e);
                }
                active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

async fn handle_connection(mut socket: TcpStream, service: Arc<StatementService>) -> Result<()> {
    loop {
        let request: Request = match read_frame(&mut socket).await {
            Ok(request) => request,
            // Clean disconnect between requests.
            Err(ProxyError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(e) => return Err(e),
        };
        let response: Response = service.handle(request).await;
        write_frame(&mut socket, &response).await?;
    }
}
