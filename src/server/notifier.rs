//! Change fan-out for connected stream subscribers.
//!
//! Every successful mutation advances the [`Watermark`] and is broadcast
//! to each registered connection. A connection whose channel is full or
//! closed is dropped from the registry on the spot; the mutator never
//! sees the failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{ChangeEvent, ChangeKind, EntityKind};
use crate::protocol::{change_frame, ConnectedNotice, Frame, CONNECTED_EVENT};

/// Process-wide "last mutation" timestamp, strictly increasing.
#[derive(Debug)]
pub struct Watermark {
    clock: Arc<dyn Clock>,
    last: Mutex<i64>,
}

impl Watermark {
    /// Starts at the clock's current time.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let start = clock.now_millis();
        Self {
            clock,
            last: Mutex::new(start),
        }
    }

    pub fn current(&self) -> i64 {
        *self.last.lock()
    }

    /// Moves to `max(previous + 1, now)` and returns the new value.
    pub fn advance(&self) -> i64 {
        let mut last = self.last.lock();
        let next = (*last + 1).max(self.clock.now_millis());
        *last = next;
        next
    }
}

/// Connection id to send-handle map, shared by accept, broadcast and
/// disconnect cleanup.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, mpsc::Sender<Frame>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, sender: mpsc::Sender<Frame>) {
        self.connections.write().insert(id, sender);
    }

    pub fn remove(&self, id: &Uuid) -> bool {
        self.connections.write().remove(id).is_some()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.connections.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues `frame` on every connection and returns how many accepted it.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let connections = self.connections.read();
            for (id, sender) in connections.iter() {
                match sender.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(connection = %id, "stream connection fell behind");
                        dead.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }

        if !dead.is_empty() {
            let mut connections = self.connections.write();
            for id in &dead {
                connections.remove(id);
                tracing::debug!(connection = %id, "dropped stream connection");
            }
        }
        delivered
    }
}

#[derive(Debug)]
pub struct ChangeNotifier {
    registry: Arc<ConnectionRegistry>,
    watermark: Watermark,
    clock: Arc<dyn Clock>,
    heartbeat_interval: Duration,
    buffer: usize,
}

impl ChangeNotifier {
    pub fn new(clock: Arc<dyn Clock>, heartbeat_interval: Duration, buffer: usize) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            watermark: Watermark::new(clock.clone()),
            clock,
            heartbeat_interval,
            buffer: buffer.max(1),
        }
    }

    pub fn last_change(&self) -> i64 {
        self.watermark.current()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Idle time after which a stream sends a keep-alive comment.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Records a successful mutation: advances the watermark and fans the
    /// event out to every open connection.
    pub fn publish(
        &self,
        kind: ChangeKind,
        entity: EntityKind,
        entity_id: &str,
        payload: Option<serde_json::Value>,
    ) -> ChangeEvent {
        let event = ChangeEvent {
            kind,
            entity,
            entity_id: entity_id.to_string(),
            payload,
            emitted_at: self.watermark.advance(),
        };

        match change_frame(&event) {
            Ok(frame) => {
                let delivered = self.registry.broadcast(&frame);
                tracing::debug!(
                    event = entity.event_name(),
                    kind = %kind,
                    entity_id,
                    delivered,
                    "published change"
                );
            }
            Err(e) => tracing::error!("failed to encode change event: {}", e),
        }
        event
    }

    /// Opens a new stream connection. The first frame is always
    /// `connected`.
    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.buffer + 1);

        let connected = ConnectedNotice {
            connection_id: id.to_string(),
            message: "connected".to_string(),
            timestamp: self.clock.now_millis(),
        };
        if let Ok(frame) = Frame::event(CONNECTED_EVENT, &connected) {
            // Fresh channel with spare capacity.
            let _ = sender.try_send(frame);
        }

        self.registry.register(id, sender);
        tracing::info!(connection = %id, open = self.registry.len(), "stream connected");

        Subscription {
            id,
            receiver,
            registry: self.registry.clone(),
        }
    }
}

/// One open stream connection.
///
/// Dropping it (including when the transport aborts and the response body
/// is dropped) deregisters the connection.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    receiver: mpsc::Receiver<Frame>,
    registry: Arc<ConnectionRegistry>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Frame> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|frame| (frame, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.registry.remove(&self.id) {
            tracing::info!(connection = %self.id, open = self.registry.len(), "stream closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::ChangeNotice;

    fn notifier(clock: Arc<ManualClock>) -> ChangeNotifier {
        ChangeNotifier::new(clock, Duration::from_secs(30), 8)
    }

    #[test]
    fn test_watermark_strictly_monotonic() {
        let clock = Arc::new(ManualClock::new(1_000));
        let watermark = Watermark::new(clock.clone());
        assert_eq!(watermark.current(), 1_000);

        assert_eq!(watermark.advance(), 1_001);
        assert_eq!(watermark.advance(), 1_002);

        clock.set(5_000);
        assert_eq!(watermark.advance(), 5_000);

        // Clock stepping backwards never moves the watermark back.
        clock.set(10);
        assert_eq!(watermark.advance(), 5_001);
    }

    #[tokio::test]
    async fn test_subscribe_sends_connected_first() {
        let notifier = notifier(Arc::new(ManualClock::new(0)));
        let mut subscription = notifier.subscribe();

        let frame = subscription.recv().await.unwrap();
        match frame {
            Frame::Event { name, data } => {
                assert_eq!(name, "connected");
                let notice: ConnectedNotice = serde_json::from_str(&data).unwrap();
                assert_eq!(notice.connection_id, subscription.id().to_string());
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert_eq!(notifier.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_connection() {
        let notifier = notifier(Arc::new(ManualClock::new(100)));
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();
        first.recv().await.unwrap();
        second.recv().await.unwrap();

        let event = notifier.publish(ChangeKind::Created, EntityKind::Item, "item-1", None);
        assert_eq!(event.emitted_at, 101);
        assert_eq!(notifier.last_change(), 101);

        for subscription in [&mut first, &mut second] {
            match subscription.recv().await.unwrap() {
                Frame::Event { name, data } => {
                    assert_eq!(name, "item-change");
                    let notice: ChangeNotice = serde_json::from_str(&data).unwrap();
                    assert_eq!(notice.entity_id, "item-1");
                    assert_eq!(notice.kind, ChangeKind::Created);
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let notifier = notifier(Arc::new(ManualClock::new(0)));
        let subscription = notifier.subscribe();
        let id = subscription.id();
        assert!(notifier.registry().contains(&id));

        drop(subscription);
        assert!(!notifier.registry().contains(&id));

        // Broadcasting afterwards neither errors nor reaches anyone.
        notifier.publish(ChangeKind::Deleted, EntityKind::Item, "gone", None);
        assert_eq!(notifier.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_handle_removed_on_broadcast() {
        let registry = ConnectionRegistry::new();
        let (open_tx, _open_rx) = mpsc::channel(4);
        let (closed_tx, closed_rx) = mpsc::channel(4);
        drop(closed_rx);

        registry.register(Uuid::new_v4(), open_tx);
        registry.register(Uuid::new_v4(), closed_tx);

        assert_eq!(registry.broadcast(&Frame::heartbeat()), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_full_handle_removed_on_broadcast() {
        let registry = ConnectionRegistry::new();
        let (sender, _receiver) = mpsc::channel(1);
        registry.register(Uuid::new_v4(), sender);

        assert_eq!(registry.broadcast(&Frame::heartbeat()), 1);
        assert_eq!(registry.broadcast(&Frame::heartbeat()), 0);
        assert!(registry.is_empty());
    }
}
