use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};

use super::{ChangeStream, RemoteError, RemoteStore};
use crate::clock::{Clock, SystemClock};
use crate::models::{ChangeEvent, ChangeKind, Document, DocumentBody, EntityKind, Item};
use crate::protocol::{change_frame, ConnectedNotice, Frame, CONNECTED_EVENT};
use crate::server::Watermark;

#[derive(Debug, Default)]
struct Collections {
    items: BTreeMap<String, Item>,
    documents: BTreeMap<String, Document>,
    bodies: BTreeMap<String, DocumentBody>,
}

/// In-process stand-in for the sync server.
///
/// Follows the same contract as the HTTP API, including change events
/// on [`RemoteStore::subscribe`]. Reachability can be switched off and
/// individual entity ids can be made to fail.
#[derive(Debug)]
pub struct MemoryRemote {
    collections: RwLock<Collections>,
    reachable: AtomicBool,
    failing: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
    watermark: Watermark,
    events: broadcast::Sender<Frame>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

struct CallGuard<'a>(&'a AtomicUsize);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            collections: RwLock::new(Collections::default()),
            reachable: AtomicBool::new(true),
            failing: Mutex::new(HashSet::new()),
            latency: Mutex::new(None),
            watermark: Watermark::new(clock),
            events,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Makes every call that touches `id` fail with a 500.
    pub fn fail_on(&self, id: &str) {
        self.failing.lock().insert(id.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// Delays every call, so overlapping callers can be observed.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Highest number of calls observed running at the same time.
    /// Sends a keep-alive comment to every open stream, as an idle server does.
    pub fn heartbeat(&self) {
        let _ = self.events.send(Frame::heartbeat());
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Total calls made, reachable or not.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn items(&self) -> Vec<Item> {
        self.collections.read().items.values().cloned().collect()
    }

    pub fn item(&self, id: &str) -> Option<Item> {
        self.collections.read().items.get(id).cloned()
    }

    pub fn documents(&self) -> Vec<Document> {
        self.collections.read().documents.values().cloned().collect()
    }

    pub fn bodies(&self) -> Vec<DocumentBody> {
        self.collections.read().bodies.values().cloned().collect()
    }

    async fn enter(&self, id: Option<&str>) -> Result<CallGuard<'_>, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = CallGuard(&self.in_flight);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.is_reachable() {
            return Err(RemoteError::Unreachable("memory remote is offline".to_string()));
        }
        if let Some(id) = id {
            if self.failing.lock().contains(id) {
                return Err(RemoteError::Rejected {
                    status: 500,
                    message: format!("injected failure for {}", id),
                });
            }
        }
        Ok(guard)
    }

    fn publish(&self, kind: ChangeKind, entity: EntityKind, id: &str, payload: Option<serde_json::Value>) {
        let event = ChangeEvent {
            kind,
            entity,
            entity_id: id.to_string(),
            payload,
            emitted_at: self.watermark.advance(),
        };
        if let Ok(frame) = change_frame(&event) {
            // No receivers is fine.
            let _ = self.events.send(frame);
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list_items(&self) -> Result<Vec<Item>, RemoteError> {
        let _guard = self.enter(None).await?;
        Ok(self.items())
    }

    async fn create_item(&self, item: &Item) -> Result<Item, RemoteError> {
        let _guard = self.enter(Some(&item.id)).await?;
        let stored = {
            let mut collections = self.collections.write();
            if let Some(existing) = collections.items.get(&item.id) {
                return Ok(existing.clone());
            }
            collections.items.insert(item.id.clone(), item.clone());
            item.clone()
        };
        self.publish(
            ChangeKind::Created,
            EntityKind::Item,
            &stored.id,
            serde_json::to_value(&stored).ok(),
        );
        Ok(stored)
    }

    async fn set_completed(&self, id: &str, completed: bool) -> Result<Item, RemoteError> {
        let _guard = self.enter(Some(id)).await?;
        let updated = {
            let mut collections = self.collections.write();
            let item = collections
                .items
                .get_mut(id)
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
            item.completed = completed;
            item.clone()
        };
        self.publish(
            ChangeKind::Updated,
            EntityKind::Item,
            id,
            Some(serde_json::json!({ "completed": completed })),
        );
        Ok(updated)
    }

    async fn delete_item(&self, id: &str) -> Result<(), RemoteError> {
        let _guard = self.enter(Some(id)).await?;
        let removed = self.collections.write().items.remove(id).is_some();
        if removed {
            self.publish(ChangeKind::Deleted, EntityKind::Item, id, None);
        }
        Ok(())
    }

    async fn list_documents(&self) -> Result<Vec<Document>, RemoteError> {
        let _guard = self.enter(None).await?;
        Ok(self.documents())
    }

    async fn create_document(&self, document: &Document) -> Result<Document, RemoteError> {
        let _guard = self.enter(Some(&document.id)).await?;
        {
            let mut collections = self.collections.write();
            if let Some(existing) = collections.documents.get(&document.id) {
                return Ok(existing.clone());
            }
            collections
                .documents
                .insert(document.id.clone(), document.clone());
        }
        self.publish(
            ChangeKind::Created,
            EntityKind::Document,
            &document.id,
            serde_json::to_value(document).ok(),
        );
        Ok(document.clone())
    }

    async fn list_document_bodies(&self) -> Result<Vec<DocumentBody>, RemoteError> {
        let _guard = self.enter(None).await?;
        Ok(self.bodies())
    }

    async fn create_document_body(&self, body: &DocumentBody) -> Result<DocumentBody, RemoteError> {
        let _guard = self.enter(Some(&body.id)).await?;
        {
            let mut collections = self.collections.write();
            if let Some(existing) = collections.bodies.get(&body.id) {
                return Ok(existing.clone());
            }
            if !collections.documents.contains_key(&body.document_id) {
                return Err(RemoteError::Rejected {
                    status: 409,
                    message: format!("document {} does not exist", body.document_id),
                });
            }
            collections.bodies.insert(body.id.clone(), body.clone());
        }
        self.publish(
            ChangeKind::Created,
            EntityKind::DocumentBody,
            &body.id,
            serde_json::to_value(body).ok(),
        );
        Ok(body.clone())
    }

    async fn last_change(&self) -> Result<i64, RemoteError> {
        let _guard = self.enter(None).await?;
        Ok(self.watermark.current())
    }

    async fn subscribe(&self) -> Result<ChangeStream, RemoteError> {
        let _guard = self.enter(None).await?;

        let connected = Frame::event(
            CONNECTED_EVENT,
            &ConnectedNotice {
                connection_id: uuid::Uuid::new_v4().to_string(),
                message: "connected".to_string(),
                timestamp: self.watermark.current(),
            },
        )
        .map_err(|e| RemoteError::Decode(e.to_string()))?;

        let receiver = self.events.subscribe();
        let changes = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(frame) => return Some((Ok(frame), receiver)),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(futures::stream::iter([Ok(connected)]).chain(changes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_create_item_is_idempotent() {
        let remote = MemoryRemote::new();
        let item = Item::new("milk");

        remote.create_item(&item).await.unwrap();
        let again = remote
            .create_item(&item.clone().with_completed(true))
            .await
            .unwrap();

        assert!(!again.completed);
        assert_eq!(remote.items().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_and_injected_failures() {
        let remote = MemoryRemote::new();
        let item = Item::new("eggs");

        remote.set_reachable(false);
        let err = remote.create_item(&item).await.unwrap_err();
        assert!(err.is_connectivity());

        remote.set_reachable(true);
        remote.fail_on(&item.id);
        let err = remote.create_item(&item).await.unwrap_err();
        assert!(!err.is_connectivity());

        remote.clear_failures();
        remote.create_item(&item).await.unwrap();
        assert!(remote.item(&item.id).is_some());
    }

    #[tokio::test]
    async fn test_set_completed_unknown_is_not_found() {
        let remote = MemoryRemote::new();
        let err = remote.set_completed("missing", true).await.unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_body_requires_parent() {
        let remote = MemoryRemote::new();
        let document = Document::new("notes");
        let body = DocumentBody::new(&document.id, "hello");

        let err = remote.create_document_body(&body).await.unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { status: 409, .. }));

        remote.create_document(&document).await.unwrap();
        remote.create_document_body(&body).await.unwrap();
        assert_eq!(remote.bodies().len(), 1);
    }

    #[tokio::test]
    async fn test_mutations_advance_watermark_and_stream() {
        let remote = MemoryRemote::with_clock(Arc::new(ManualClock::new(1_000)));
        let before = remote.last_change().await.unwrap();
        let mut stream = remote.subscribe().await.unwrap();

        let item = Item::new("bread");
        remote.create_item(&item).await.unwrap();
        remote.delete_item(&item.id).await.unwrap();
        // Unknown id: no event, no watermark movement.
        remote.delete_item(&item.id).await.unwrap();

        assert_eq!(remote.last_change().await.unwrap(), before + 2);

        let names: Vec<String> = stream
            .by_ref()
            .take(3)
            .map(|frame| match frame.unwrap() {
                Frame::Event { name, .. } => name,
                Frame::Comment(text) => text,
            })
            .collect()
            .await;
        assert_eq!(names, vec!["connected", "item-change", "item-change"]);
    }
}
