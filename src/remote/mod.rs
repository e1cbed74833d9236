//! The authoritative store as seen from a client.
//!
//! [`RemoteStore`] is the seam between the sync engine and the network.
//! [`HttpRemote`] talks to `todosync-server`; [`MemoryRemote`] keeps the
//! same contract in process, with switches for reachability and
//! per-entity failures.

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::MemoryRemote;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::models::{Document, DocumentBody, Item};
use crate::protocol::Frame;

/// Frames received from the server's change stream, in order.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<Frame, RemoteError>> + Send>>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("server unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// True when the server could not be reached at all, as opposed to
    /// answering with an error.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RemoteError::Unreachable(_) | RemoteError::Timeout)
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list_items(&self) -> Result<Vec<Item>, RemoteError>;

    /// Creates the item, or returns the stored copy if the id already exists.
    async fn create_item(&self, item: &Item) -> Result<Item, RemoteError>;

    /// Sets the `completed` flag. Fails with `NotFound` for unknown ids.
    async fn set_completed(&self, id: &str, completed: bool) -> Result<Item, RemoteError>;

    /// Deletes the item. Deleting an unknown id succeeds.
    async fn delete_item(&self, id: &str) -> Result<(), RemoteError>;

    async fn list_documents(&self) -> Result<Vec<Document>, RemoteError>;

    async fn create_document(&self, document: &Document) -> Result<Document, RemoteError>;

    async fn list_document_bodies(&self) -> Result<Vec<DocumentBody>, RemoteError>;

    /// Fails with `Rejected` (409) when the parent document is missing.
    async fn create_document_body(&self, body: &DocumentBody) -> Result<DocumentBody, RemoteError>;

    /// Current change watermark in milliseconds.
    async fn last_change(&self) -> Result<i64, RemoteError>;

    /// Opens the push stream of change events.
    async fn subscribe(&self) -> Result<ChangeStream, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(RemoteError::Unreachable("refused".into()).is_connectivity());
        assert!(RemoteError::Timeout.is_connectivity());
        assert!(!RemoteError::NotFound("x".into()).is_connectivity());
        assert!(!RemoteError::Rejected {
            status: 500,
            message: "boom".into()
        }
        .is_connectivity());
    }
}
