//! API Server
//!
//! Binds the REST router and serves it until a shutdown is requested.

use crate::controller::Controller;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use super::rest::RestRouter;

/// Requests a graceful shutdown of a running [`ApiServer`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle(broadcast::Sender<()>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(());
    }
}

/// REST API server
pub struct ApiServer {
    addr: SocketAddr,
    controller: Arc<Controller>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ApiServer {
    pub fn new(addr: SocketAddr, controller: Arc<Controller>) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Self {
            addr,
            controller,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Serve until a shutdown is requested through a [`ShutdownHandle`]
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server on {}: {}", self.addr, e)))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let app = RestRouter::new(self.controller).build();
        let mut shutdown_rx = self.shutdown_rx;

        info!(addr = ?listener.local_addr().ok(), "REST API listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::controller;

    #[tokio::test]
    async fn test_shutdown_before_run_stops_server() {
        let (ctrl, _db, _updater) = controller(0);
        let server = ApiServer::new("127.0.0.1:0".parse().unwrap(), Arc::new(ctrl));
        server.shutdown_handle().shutdown();

        tokio::time::timeout(std::time::Duration::from_secs(5), server.run())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_serves_health_until_shutdown() {
        let (ctrl, _db, _updater) = controller(0);
        let server = ApiServer::new("127.0.0.1:0".parse().unwrap(), Arc::new(ctrl));
        let handle = server.shutdown_handle();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(server.serve(listener));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));

        handle.shutdown();
        task.await.unwrap().unwrap();
    }
}
