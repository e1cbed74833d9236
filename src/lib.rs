//! todosync
//!
//! Offline-first replica of items and documents. Local writes always land
//! in an embedded SQLite store first; a reconciliation engine later merges
//! them with the authoritative server, and a change notifier tells other
//! clients when the server has moved on.

pub mod clock;
pub mod config;
pub mod db;
pub mod models;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use models::{
    ChangeEvent, ChangeKind, Document, DocumentBody, EntityKind, Item, PendingChange,
    PendingDelete,
};
pub use remote::{HttpRemote, MemoryRemote, RemoteError, RemoteStore};
pub use sync::{
    ConnectivityMonitor, PendingChangeTracker, ReconciliationEngine, Replica, SyncContext,
    SyncError, SyncSummary,
};
