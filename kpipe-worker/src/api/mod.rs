//! Health and status HTTP server
//!
//! Talks to the workers only through the Status Store and the admin
//! controls; it never touches a stage directly.

pub mod control;
pub mod health;
pub mod status;

pub use control::control_routes;
pub use health::health_routes;
pub use status::status_routes;

use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::AppState;

/// Bind and serve until `shutdown` fires
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    let app = crate::build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Status server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Status server stopped");
    Ok(())
}
