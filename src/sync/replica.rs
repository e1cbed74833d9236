//! Entry point for local mutations.
//!
//! Every write lands in the local store (and the pending-change ledger)
//! first and succeeds offline. The matching remote call is then tried
//! once; its outcome only feeds the connectivity monitor; anything left
//! unconfirmed is picked up by the next reconciliation pass.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{ConnectivityMonitor, PendingChangeTracker, SyncError};
use crate::db::LocalStore;
use crate::models::{Document, DocumentBody, Item};
use crate::remote::{RemoteError, RemoteStore};

#[derive(Clone)]
pub struct Replica {
    store: LocalStore,
    tracker: PendingChangeTracker,
    remote: Option<Arc<dyn RemoteStore>>,
    monitor: ConnectivityMonitor,
}

impl Replica {
    pub fn new(
        store: LocalStore,
        tracker: PendingChangeTracker,
        remote: Option<Arc<dyn RemoteStore>>,
        monitor: ConnectivityMonitor,
    ) -> Self {
        Self {
            store,
            tracker,
            remote,
            monitor,
        }
    }

    pub fn tracker(&self) -> &PendingChangeTracker {
        &self.tracker
    }

    fn observe<T>(&self, what: &str, id: &str, result: &Result<T, RemoteError>) {
        self.monitor.observe(result);
        if let Err(e) = result {
            warn!(id, "{} left for the next sync: {}", what, e);
        }
    }

    pub async fn create_item(&self, title: &str) -> Result<Item, SyncError> {
        let item = Item::new(title);
        self.store.items().insert(&item, false).await?;
        debug!(id = %item.id, "created item locally");

        if let Some(remote) = &self.remote {
            let result = remote.create_item(&item).await;
            self.observe("create", &item.id, &result);
            if result.is_ok() {
                self.store.items().mark_synced(&item.id).await?;
            }
        }
        Ok(item)
    }

    /// Sets an item's `completed` flag and records the intent until the
    /// server confirms it.
    pub async fn set_completed(&self, id: &str, completed: bool) -> Result<Item, SyncError> {
        let items = self.store.items();
        if !items.set_completed(id, completed).await? {
            return Err(SyncError::NotFound(id.to_string()));
        }
        let change = self.tracker.record(id, completed).await?;

        if let Some(remote) = &self.remote {
            // A NotFound here means the item was born offline; the next
            // pass creates it remotely with this value.
            let result = remote.set_completed(id, completed).await;
            if result.is_ok() {
                self.tracker.resolve_matching(&change).await?;
                items.mark_synced(id).await?;
            }
            self.observe("update", id, &result);
        }

        items
            .get(id)
            .await?
            .map(|local| local.record)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))
    }

    /// Deletes an item locally and records a tombstone until the server
    /// confirms the delete. Returns `false` if no local copy existed.
    pub async fn delete_item(&self, id: &str) -> Result<bool, SyncError> {
        self.tracker.record_delete(id).await?;
        let existed = self.store.items().delete(id).await?;

        if let Some(remote) = &self.remote {
            let result = remote.delete_item(id).await;
            if result.is_ok() {
                self.tracker.resolve_delete(id).await?;
            }
            self.observe("delete", id, &result);
        }
        Ok(existed)
    }

    /// Applies a delete announced by the server, without waiting for a
    /// reconciliation pass.
    pub async fn apply_remote_delete(&self, id: &str) -> Result<bool, SyncError> {
        let removed = self.store.items().delete(id).await?;
        self.tracker.resolve(id).await?;
        self.tracker.resolve_delete(id).await?;
        if removed {
            debug!(id, "removed item deleted on the server");
        }
        Ok(removed)
    }

    pub async fn create_document(
        &self,
        title: &str,
        content: Option<&str>,
    ) -> Result<(Document, Option<DocumentBody>), SyncError> {
        let document = Document::new(title);
        let body = content.map(|content| DocumentBody::new(&document.id, content));
        let documents = self.store.documents();
        documents.insert_with_body(&document, body.as_ref()).await?;

        if let Some(remote) = &self.remote {
            let result = remote.create_document(&document).await;
            self.observe("create document", &document.id, &result);
            if result.is_ok() {
                documents.mark_document_synced(&document.id).await?;
                if let Some(body) = &body {
                    let result = remote.create_document_body(body).await;
                    self.observe("create document body", &body.id, &result);
                    if result.is_ok() {
                        documents.mark_body_synced(&body.id).await?;
                    }
                }
            }
        }
        Ok((document, body))
    }

    pub async fn get_item(&self, id: &str) -> Result<Option<Item>, SyncError> {
        Ok(self.store.items().get(id).await?.map(|local| local.record))
    }

    /// Items, newest first.
    pub async fn list_items(&self) -> Result<Vec<Item>, SyncError> {
        let items = self.store.items().list().await?;
        Ok(items.into_iter().map(|local| local.record).collect())
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>, SyncError> {
        Ok(self
            .store
            .documents()
            .get_document(id)
            .await?
            .map(|local| local.record))
    }

    /// Documents, oldest first.
    pub async fn list_documents(&self) -> Result<Vec<Document>, SyncError> {
        let documents = self.store.documents().list_documents().await?;
        Ok(documents.into_iter().map(|local| local.record).collect())
    }

    pub async fn document_body(&self, document_id: &str) -> Result<Option<DocumentBody>, SyncError> {
        Ok(self.store.documents().body_for(document_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::init_db;
    use crate::remote::MemoryRemote;
    use tempfile::TempDir;

    struct TestContext {
        replica: Replica,
        store: LocalStore,
        remote: Arc<MemoryRemote>,
        monitor: ConnectivityMonitor,
        _temp_dir: TempDir,
    }

    async fn setup_replica() -> TestContext {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_db(&temp_dir.path().join("test.db")).await.unwrap();
        let store = LocalStore::new(pool.clone());
        let tracker = PendingChangeTracker::new(pool, Arc::new(ManualClock::new(1)));
        let remote = Arc::new(MemoryRemote::new());
        let monitor = ConnectivityMonitor::new();
        let replica = Replica::new(
            store.clone(),
            tracker,
            Some(remote.clone() as Arc<dyn RemoteStore>),
            monitor.clone(),
        );
        TestContext {
            replica,
            store,
            remote,
            monitor,
            _temp_dir: temp_dir,
        }
    }

    #[tokio::test]
    async fn test_create_item_online_mirrors_remote() {
        let ctx = setup_replica().await;

        let item = ctx.replica.create_item("Buy milk").await.unwrap();

        assert_eq!(ctx.remote.item(&item.id), Some(item.clone()));
        assert!(ctx.store.items().get(&item.id).await.unwrap().unwrap().synced);
        assert!(ctx.monitor.is_reachable());
    }

    #[tokio::test]
    async fn test_create_item_offline_stays_local() {
        let ctx = setup_replica().await;
        ctx.remote.set_reachable(false);

        let item = ctx.replica.create_item("Offline").await.unwrap();

        assert!(ctx.remote.item(&item.id).is_none());
        let local = ctx.store.items().get(&item.id).await.unwrap().unwrap();
        assert!(!local.synced);
        assert_eq!(ctx.replica.tracker().count().await.unwrap(), 0);
        assert!(!ctx.monitor.is_reachable());
    }

    #[tokio::test]
    async fn test_set_completed_resolves_on_confirmation() {
        let ctx = setup_replica().await;
        let item = ctx.replica.create_item("Toggle").await.unwrap();

        let updated = ctx.replica.set_completed(&item.id, true).await.unwrap();

        assert!(updated.completed);
        assert!(ctx.remote.item(&item.id).unwrap().completed);
        assert_eq!(ctx.replica.tracker().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_completed_offline_keeps_pending() {
        let ctx = setup_replica().await;
        let item = ctx.replica.create_item("Toggle").await.unwrap();
        ctx.remote.set_reachable(false);

        ctx.replica.set_completed(&item.id, true).await.unwrap();

        let pending = ctx.replica.tracker().get(&item.id).await.unwrap().unwrap();
        assert!(pending.desired_value);
        assert!(!ctx.remote.item(&item.id).unwrap().completed);
    }

    #[tokio::test]
    async fn test_set_completed_unknown_item() {
        let ctx = setup_replica().await;
        let err = ctx.replica.set_completed("missing", true).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert_eq!(ctx.replica.tracker().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_offline_leaves_tombstone() {
        let ctx = setup_replica().await;
        let item = ctx.replica.create_item("Doomed").await.unwrap();
        ctx.remote.set_reachable(false);

        assert!(ctx.replica.delete_item(&item.id).await.unwrap());

        assert!(ctx.replica.get_item(&item.id).await.unwrap().is_none());
        assert!(ctx.replica.tracker().is_tombstoned(&item.id).await.unwrap());
        assert!(ctx.remote.item(&item.id).is_some());
    }

    #[tokio::test]
    async fn test_apply_remote_delete_clears_bookkeeping() {
        let ctx = setup_replica().await;
        let item = ctx.replica.create_item("Shared").await.unwrap();
        ctx.remote.set_reachable(false);
        ctx.replica.set_completed(&item.id, true).await.unwrap();

        assert!(ctx.replica.apply_remote_delete(&item.id).await.unwrap());
        assert!(!ctx.replica.apply_remote_delete(&item.id).await.unwrap());

        assert_eq!(ctx.replica.tracker().count().await.unwrap(), 0);
        assert!(ctx.replica.list_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_document_with_body() {
        let ctx = setup_replica().await;

        let (document, body) = ctx
            .replica
            .create_document("Notes", Some("hello"))
            .await
            .unwrap();
        let body = body.unwrap();

        assert_eq!(ctx.remote.documents(), vec![document.clone()]);
        assert_eq!(ctx.remote.bodies(), vec![body.clone()]);
        assert_eq!(
            ctx.replica.document_body(&document.id).await.unwrap(),
            Some(body)
        );
        assert_eq!(ctx.replica.list_documents().await.unwrap(), vec![document]);
    }

    #[tokio::test]
    async fn test_without_remote_everything_is_local() {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_db(&temp_dir.path().join("test.db")).await.unwrap();
        let replica = Replica::new(
            LocalStore::new(pool.clone()),
            PendingChangeTracker::new(pool, Arc::new(ManualClock::new(1))),
            None,
            ConnectivityMonitor::new(),
        );

        let item = replica.create_item("solo").await.unwrap();
        replica.set_completed(&item.id, true).await.unwrap();

        assert_eq!(replica.tracker().count().await.unwrap(), 1);
        assert!(replica.get_item(&item.id).await.unwrap().unwrap().completed);
    }
}
