//! TCP listener for node streams

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_core::transport;

use super::DispatchServer;

/// Accepts node connections until `token` is cancelled, spawning one handler
/// task per connection
pub async fn serve(
    listener: TcpListener,
    server: Arc<DispatchServer>,
    token: CancellationToken,
) -> std::io::Result<()> {
    info!("Node stream listener on {}", listener.local_addr()?);

    loop {
        let (socket, peer) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            },
        };

        if let Err(e) = socket.set_nodelay(true) {
            debug!(%peer, "set_nodelay failed: {}", e);
        }

        let server = server.clone();
        tokio::spawn(async move {
            debug!(%peer, "node connection accepted");
            if let Err(e) = server.serve_stream(transport::accept(socket)).await {
                debug!(%peer, "node connection ended: {}", e);
            }
        });
    }

    Ok(())
}
