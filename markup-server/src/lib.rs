//! HTTP surface, configuration and job handler for markup-sync.
//!
//! ```no_run
//! use markup_queue::{MemoryStore, Queue};
//! use markup_server::{AppState, create_router};
//!
//! # async fn example() -> std::io::Result<()> {
//! let queue = Queue::new(MemoryStore::new());
//! let app = create_router(AppState::new(queue));
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, app).await
//! # }
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod handlers;
pub mod housekeeping;
pub mod routes;

pub use command::{CommandError, CommandHandler};
pub use config::{EnvLoader, ServiceConfig};
pub use error::{ConfigError, ServerError};
pub use housekeeping::Housekeeper;
pub use routes::create_router;

use markup_log::info;
use markup_queue::Queue;
use std::future::Future;
use std::net::SocketAddr;

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Queue,
}

impl AppState {
    pub fn new(queue: Queue) -> Self {
        Self { queue }
    }
}

/// Serve the API on `addr` until `shutdown` resolves.
///
/// In-flight requests are allowed to finish.
pub async fn serve<F>(addr: SocketAddr, state: AppState, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("HTTP server stopped");
    Ok(())
}
