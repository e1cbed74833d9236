//! Background sync for long-running clients.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{
    ChangeHandler, ConnectivityMonitor, ReconciliationEngine, Replica, StreamSubscriber,
    WatermarkPoller,
};
use crate::config::SyncConfig;
use crate::remote::RemoteStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub poll_interval: Duration,
    pub streaming: bool,
    pub reconnect_delay: Duration,
}

impl From<&SyncConfig> for AgentSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            streaming: config.streaming,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

/// Owns the sync worker, the watermark poller and (optionally) the stream
/// subscriber. Dropping the agent aborts all of them.
#[derive(Debug)]
pub struct SyncAgent {
    tasks: Vec<JoinHandle<()>>,
}

impl SyncAgent {
    /// Spawns the background tasks and requests a first reconciliation.
    pub fn start(
        engine: Arc<ReconciliationEngine>,
        replica: Replica,
        remote: Arc<dyn RemoteStore>,
        monitor: ConnectivityMonitor,
        settings: AgentSettings,
    ) -> Self {
        let mut tasks = vec![tokio::spawn(run_worker(engine, monitor.clone()))];

        let poller = WatermarkPoller::new(remote.clone(), monitor.clone(), settings.poll_interval);
        tasks.push(tokio::spawn(poller.run()));

        if settings.streaming {
            let handler = ChangeHandler::new(replica, monitor.clone());
            let subscriber =
                StreamSubscriber::new(remote, handler, monitor.clone(), settings.reconnect_delay);
            tasks.push(tokio::spawn(subscriber.run()));
        }

        monitor.request_sync();
        info!(
            poll_secs = settings.poll_interval.as_secs_f64(),
            streaming = settings.streaming,
            "sync agent started"
        );
        Self { tasks }
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().all(|task| !task.is_finished())
    }

    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for SyncAgent {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        debug!("sync agent stopped");
    }
}

async fn run_worker(engine: Arc<ReconciliationEngine>, monitor: ConnectivityMonitor) {
    loop {
        monitor.sync_requested().await;
        match engine.reconcile().await {
            Ok(Some(summary)) if !summary.is_noop() => info!("sync: {}", summary),
            Ok(Some(summary)) => debug!("sync: {}", summary),
            Ok(None) => {}
            Err(e) => error!("sync failed: {}", e),
        }
    }
}
