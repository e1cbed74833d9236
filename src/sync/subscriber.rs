//! Client side of the change stream.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{ConnectivityMonitor, Replica, SyncError};
use crate::models::{ChangeKind, EntityKind};
use crate::protocol::{ChangeNotice, Frame, CONNECTED_EVENT};
use crate::remote::RemoteStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Ignored,
    /// Item delete applied locally right away.
    Deleted { id: String, removed: bool },
    SyncRequested,
}

/// Turns stream frames into local effects.
#[derive(Clone)]
pub struct ChangeHandler {
    replica: Replica,
    monitor: ConnectivityMonitor,
}

impl ChangeHandler {
    pub fn new(replica: Replica, monitor: ConnectivityMonitor) -> Self {
        Self { replica, monitor }
    }

    pub async fn handle(&self, frame: &Frame) -> Result<Handled, SyncError> {
        let (name, data) = match frame {
            Frame::Comment(_) => return Ok(Handled::Ignored),
            Frame::Event { name, data } => (name.as_str(), data.as_str()),
        };

        // Anything may have changed while we were not connected.
        if name == CONNECTED_EVENT {
            self.monitor.request_sync();
            return Ok(Handled::SyncRequested);
        }

        let Some(entity) = EntityKind::from_event_name(name) else {
            debug!(event = name, "ignoring unknown event");
            return Ok(Handled::Ignored);
        };
        let notice: ChangeNotice = match serde_json::from_str(data) {
            Ok(notice) => notice,
            Err(e) => {
                warn!(event = name, "malformed change event: {}", e);
                return Ok(Handled::Ignored);
            }
        };

        if entity == EntityKind::Item && notice.kind == ChangeKind::Deleted {
            let removed = self.replica.apply_remote_delete(&notice.entity_id).await?;
            return Ok(Handled::Deleted {
                id: notice.entity_id,
                removed,
            });
        }

        self.monitor.request_sync();
        Ok(Handled::SyncRequested)
    }
}

/// Keeps a change stream open, reconnecting after it drops.
pub struct StreamSubscriber {
    remote: Arc<dyn RemoteStore>,
    handler: ChangeHandler,
    monitor: ConnectivityMonitor,
    reconnect_delay: Duration,
}

impl StreamSubscriber {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        handler: ChangeHandler,
        monitor: ConnectivityMonitor,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            remote,
            handler,
            monitor,
            reconnect_delay,
        }
    }

    /// Reads one connection until it ends or fails.
    pub async fn run_once(&self) {
        let mut stream = match self.remote.subscribe().await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("change stream unavailable: {}", e);
                self.monitor.report_failure(&e);
                return;
            }
        };
        self.monitor.report_success();
        info!("change stream connected");

        // Stream traffic is a transport-level signal: heartbeats hint that
        // the network is up, a broken connection hints that it is down.
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(frame) => {
                    if frame.is_heartbeat() {
                        self.monitor.network_hint(true);
                    }
                    if let Err(e) = self.handler.handle(&frame).await {
                        tracing::error!("failed to apply change event: {}", e);
                    }
                }
                Err(e) => {
                    warn!("change stream failed: {}", e);
                    if e.is_connectivity() {
                        self.monitor.network_hint(false);
                    }
                    return;
                }
            }
        }
        info!("change stream closed by server");
    }

    /// Reconnects forever. Stops only when the task running it is aborted.
    pub async fn run(self) {
        loop {
            self.run_once().await;
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }
}
