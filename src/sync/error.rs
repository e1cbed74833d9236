use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The local replica could not be read or written. Always fatal to the
    /// operation that hit it.
    #[error("local storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("document {0} does not exist")]
    MissingParent(String),

    /// Only returned by operations that cannot complete without the server.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("sync not configured. Set sync.server_url in the config file or TODOSYNC_SERVER_URL.")]
    NotConfigured,
}
