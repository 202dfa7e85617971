/*
    server.rs - TCP front end for the catalog service

    One task per connection; each connection handles its frames strictly in
    order, one response per request. When a connection closes, any
    transaction it began and never finished is rolled back.
*/

use super::service::{CatalogService, ConnectionTransactions};
use super::transport::{read_frame, write_frame};
use crate::datastore::context::Context;
use crate::datastore::errors::{StoreError, StoreResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub struct CatalogServer {
    listener: TcpListener,
    service: Arc<CatalogService>,
}

impl CatalogServer {
    pub async fn bind(addr: &str, service: Arc<CatalogService>) -> StoreResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StoreError::Transport(format!("Failed to bind {}: {}", addr, e)))?;
        Ok(CatalogServer { listener, service })
    }

    pub fn local_addr(&self) -> StoreResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| StoreError::Transport(format!("Failed to read local address: {}", e)))
    }

    /// Serve until the process exits
    pub async fn serve(self) -> StoreResult<()> {
        self.serve_until(&Context::background()).await
    }

    /// Serve until `ctx` is cancelled; open connections finish on their own
    pub async fn serve_until(self, ctx: &Context) -> StoreResult<()> {
        info!(addr = %self.local_addr()?, "Catalog service listening");
        let reaper = self.service.spawn_reaper(ctx);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("Catalog service shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let service = self.service.clone();
                        tokio::spawn(async move {
                            handle_connection(socket, peer, service).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                }
            }
        }
        if let Err(e) = reaper.await {
            warn!(error = %e, "Transaction reaper failed");
        }
        Ok(())
    }
}

async fn handle_connection(mut socket: TcpStream, peer: SocketAddr, service: Arc<CatalogService>) {
    debug!(%peer, "Catalog connection opened");
    if let Err(e) = socket.set_nodelay(true) {
        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let max_frame_size = service.max_frame_size();
    let mut owned = ConnectionTransactions::default();
    loop {
        let frame = match read_frame(&mut socket, max_frame_size).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, error = %e, "Dropping catalog connection");
                break;
            }
        };

        let response = service.handle_connection_frame(&frame, &mut owned).await;
        if let Err(e) = write_frame(&mut socket, &response, max_frame_size).await {
            warn!(%peer, error = %e, "Failed to write catalog response");
            break;
        }
    }
    if !owned.is_empty() {
        warn!(%peer, open = owned.len(), "Connection closed with open transactions");
        service.release(owned).await;
    }
    debug!(%peer, "Catalog connection closed");
}
