//! todosync server
//!
//! Holds the authoritative copy of every item and document, and tells
//! connected clients when something changed.
//!
//! # Configuration
//!
//! Environment variables:
//! - `TODOSYNC_PORT`: Port to listen on (default: 8080)
//! - `TODOSYNC_DATA_DIR`: Directory for the database (default: ~/.local/share/todosync-server)
//! - `TODOSYNC_HEARTBEAT_SECS`: Heartbeat interval on change streams (default: 30)
//! - `TODOSYNC_STREAM_BUFFER`: Frames buffered per stream connection (default: 64)
//!
//! # Endpoints
//!
//! - `GET /health`
//! - `GET|POST /api/items`, `PUT /api/items/{id}/completed`, `DELETE /api/items/{id}`
//! - `GET|POST /api/documents`, `GET|POST /api/document-bodies`
//! - `GET /api/changes/last`: change watermark for polling clients
//! - `GET /api/events`: text event stream of changes

use std::net::SocketAddr;
use std::sync::Arc;

use todosync::clock::SystemClock;
use todosync::server::{router, AppState, ChangeNotifier, ServerConfig, ServerStore};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "todosync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    let db_path = config.database_path();
    tracing::info!("Database: {}", db_path.display());

    let store = match ServerStore::open(&db_path).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    let notifier = Arc::new(ChangeNotifier::new(
        Arc::new(SystemClock),
        config.heartbeat_interval,
        config.stream_buffer,
    ));

    let app = router(AppState { store, notifier }).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
