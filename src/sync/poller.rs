//! Watermark polling, the fallback for (and backup to) the change stream.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::ConnectivityMonitor;
use crate::remote::RemoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// First observation; remembered without triggering.
    Baseline(i64),
    Unchanged,
    /// The server moved on; a reconciliation was requested.
    Advanced(i64),
    Unreachable,
}

pub struct WatermarkPoller {
    remote: Arc<dyn RemoteStore>,
    monitor: ConnectivityMonitor,
    interval: Duration,
    last_seen: Option<i64>,
}

impl WatermarkPoller {
    pub fn new(remote: Arc<dyn RemoteStore>, monitor: ConnectivityMonitor, interval: Duration) -> Self {
        Self {
            remote,
            monitor,
            interval,
            last_seen: None,
        }
    }

    pub fn last_seen(&self) -> Option<i64> {
        self.last_seen
    }

    pub async fn poll_once(&mut self) -> PollOutcome {
        let timestamp = match self.remote.last_change().await {
            Ok(timestamp) => {
                self.monitor.report_success();
                timestamp
            }
            Err(e) => {
                self.monitor.report_failure(&e);
                return PollOutcome::Unreachable;
            }
        };

        match self.last_seen {
            None => {
                self.last_seen = Some(timestamp);
                PollOutcome::Baseline(timestamp)
            }
            Some(previous) if timestamp > previous => {
                self.last_seen = Some(timestamp);
                debug!(previous, timestamp, "server watermark advanced");
                self.monitor.request_sync();
                PollOutcome::Advanced(timestamp)
            }
            Some(_) => PollOutcome::Unchanged,
        }
    }

    /// Polls forever. Stops only when the task running it is aborted.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Item;
    use crate::remote::MemoryRemote;
    use tokio::time::timeout;

    async fn requested(monitor: &ConnectivityMonitor) -> bool {
        timeout(Duration::from_millis(50), monitor.sync_requested())
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn test_baseline_then_advance() {
        let remote = Arc::new(MemoryRemote::new());
        let monitor = ConnectivityMonitor::new();
        monitor.mark_reachable_quiet();
        let mut poller = WatermarkPoller::new(remote.clone(), monitor.clone(), Duration::from_secs(5));

        let baseline = remote.last_change().await.unwrap();
        assert_eq!(poller.poll_once().await, PollOutcome::Baseline(baseline));
        assert_eq!(poller.poll_once().await, PollOutcome::Unchanged);
        assert!(!requested(&monitor).await);

        remote.create_item(&Item::new("from elsewhere")).await.unwrap();
        let advanced = remote.last_change().await.unwrap();

        assert_eq!(poller.poll_once().await, PollOutcome::Advanced(advanced));
        assert!(requested(&monitor).await);
        assert_eq!(poller.last_seen(), Some(advanced));
    }

    #[tokio::test]
    async fn test_unreachable_keeps_baseline() {
        let remote = Arc::new(MemoryRemote::new());
        let monitor = ConnectivityMonitor::new();
        let mut poller = WatermarkPoller::new(remote.clone(), monitor.clone(), Duration::from_secs(5));

        poller.poll_once().await;
        let baseline = poller.last_seen();
        assert!(monitor.is_reachable());

        remote.set_reachable(false);
        assert_eq!(poller.poll_once().await, PollOutcome::Unreachable);
        assert!(!monitor.is_reachable());
        assert_eq!(poller.last_seen(), baseline);
    }
}
