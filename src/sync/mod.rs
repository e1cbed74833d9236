//! Offline-first synchronization.
//!
//! Local writes go through [`Replica`], which persists them (and any
//! unconfirmed intent in the [`PendingChangeTracker`]) before trying the
//! server. The [`ReconciliationEngine`] later merges the local replica
//! with the server; the [`ConnectivityMonitor`], the [`WatermarkPoller`]
//! and the [`StreamSubscriber`] decide when. [`SyncAgent`] runs all of
//! that in the background, and [`SyncContext`] wires it together.

mod agent;
mod connectivity;
mod context;
mod engine;
mod error;
mod pending;
mod poller;
mod replica;
mod subscriber;

pub use agent::{AgentSettings, SyncAgent};
pub use connectivity::ConnectivityMonitor;
pub use context::SyncContext;
pub use engine::{ReconciliationEngine, SyncSummary};
pub use error::SyncError;
pub use pending::PendingChangeTracker;
pub use poller::{PollOutcome, WatermarkPoller};
pub use replica::Replica;
pub use subscriber::{ChangeHandler, Handled, StreamSubscriber};
