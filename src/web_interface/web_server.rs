//! HTTP/WebSocket server wiring.

use std::net::SocketAddr;

use log::{error, info};
use tokio::sync::broadcast;

use crate::web_interface::routes::{routes, AppState};

pub struct WebServer {
    state: AppState,
}

impl WebServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Serves until the shutdown channel fires. Returns once the
    /// listener has drained.
    pub async fn start(&self, addr: SocketAddr, mut shutdown: broadcast::Receiver<()>) {
        let filter = routes(self.state.clone());

        let bound = warp::serve(filter).try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown.recv().await;
        });

        match bound {
            Ok((bound_addr, server)) => {
                info!("Server listening on {}", bound_addr);
                server.await;
                info!("Server stopped");
            }
            Err(e) => {
                error!("Failed to bind {}: {}", addr, e);
            }
        }
    }
}
