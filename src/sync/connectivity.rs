//! Reachability of the sync server.
//!
//! Real remote calls are the ground truth; network-level hints only
//! speed things up. Every transition to reachable requests one
//! reconciliation through the shared trigger. The trigger is a
//! [`Notify`], which stores at most one permit, so a burst of requests
//! collapses into a single wake-up of the sync worker.

use std::sync::Arc;

use tokio::sync::{watch, Notify};

use crate::remote::RemoteError;

#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<bool>>,
    trigger: Arc<Notify>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor {
    /// Starts unreachable; the first successful call counts as a transition.
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
            trigger: Arc::new(Notify::new()),
        }
    }

    pub fn is_reachable(&self) -> bool {
        *self.state.borrow()
    }

    /// Receiver that observes every reachability change.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Resolves once a reconciliation has been requested.
    pub async fn sync_requested(&self) {
        self.trigger.notified().await;
    }

    pub fn request_sync(&self) {
        self.trigger.notify_one();
    }

    /// A real remote call succeeded (or the server answered at all).
    pub fn report_success(&self) {
        if self.set(true) {
            tracing::info!("sync server reachable");
            self.request_sync();
        }
    }

    /// Same as [`report_success`](Self::report_success) without requesting
    /// a reconciliation, for callers that are already reconciling.
    pub fn mark_reachable_quiet(&self) {
        if self.set(true) {
            tracing::info!("sync server reachable");
        }
    }

    /// A real remote call failed. Only connectivity failures flip the state.
    pub fn report_failure(&self, error: &RemoteError) {
        if error.is_connectivity() {
            if self.set(false) {
                tracing::warn!("sync server unreachable: {}", error);
            }
        } else {
            self.report_success();
        }
    }

    /// Records the outcome of a remote call.
    pub fn observe<T>(&self, result: &Result<T, RemoteError>) {
        match result {
            Ok(_) => self.report_success(),
            Err(e) => self.report_failure(e),
        }
    }

    /// Network-level online/offline signal. Going offline is trusted right
    /// away; coming online only asks for a real call to confirm it.
    pub fn network_hint(&self, online: bool) {
        if !online {
            if self.set(false) {
                tracing::info!("network offline");
            }
        } else if !self.is_reachable() {
            self.request_sync();
        }
    }

    fn set(&self, reachable: bool) -> bool {
        self.state.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn requested(monitor: &ConnectivityMonitor) -> bool {
        timeout(Duration::from_millis(50), monitor.sync_requested())
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn test_transition_to_reachable_requests_once() {
        let monitor = ConnectivityMonitor::new();
        assert!(!monitor.is_reachable());

        monitor.report_success();
        monitor.report_success();
        monitor.report_success();

        assert!(monitor.is_reachable());
        assert!(requested(&monitor).await);
        assert!(!requested(&monitor).await);
    }

    #[tokio::test]
    async fn test_failure_then_recovery() {
        let monitor = ConnectivityMonitor::new();
        monitor.mark_reachable_quiet();
        assert!(!requested(&monitor).await);

        monitor.report_failure(&RemoteError::Timeout);
        assert!(!monitor.is_reachable());

        monitor.observe::<()>(&Ok(()));
        assert!(monitor.is_reachable());
        assert!(requested(&monitor).await);
    }

    #[tokio::test]
    async fn test_server_error_still_counts_as_reachable() {
        let monitor = ConnectivityMonitor::new();
        monitor.report_failure(&RemoteError::Rejected {
            status: 500,
            message: "boom".to_string(),
        });
        assert!(monitor.is_reachable());
    }

    #[tokio::test]
    async fn test_network_hints() {
        let monitor = ConnectivityMonitor::new();
        monitor.mark_reachable_quiet();
        let mut changes = monitor.watch();

        monitor.network_hint(false);
        assert!(!monitor.is_reachable());
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();

        // Online hint does not flip the state by itself.
        monitor.network_hint(true);
        assert!(!monitor.is_reachable());
        assert!(!changes.has_changed().unwrap());
        assert!(requested(&monitor).await);
    }
}
