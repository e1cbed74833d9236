//! The sync server: authoritative store, HTTP API and change fan-out.

pub mod config;
pub mod notifier;
pub mod routes;
pub mod store;

pub use config::ServerConfig;
pub use notifier::{ChangeNotifier, ConnectionRegistry, Subscription, Watermark};
pub use routes::{router, ApiError, AppState};
pub use store::{ServerStore, StorageError};
