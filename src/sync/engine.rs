//! Reconciliation of the local replica with the server.
//!
//! A pass runs, in order:
//!
//! 0. push unconfirmed local deletes,
//! 1. push pending flag changes (creating the item remotely if needed),
//!    or, under [`ConflictPolicy::ServerWins`], drop the ones the server
//!    disagrees with,
//! 2. pull remote state for items without a local intent,
//! 3. push items that were created locally and never synced,
//! 4. drop synced items the server no longer has,
//!
//! followed by the append-only document pass. Each step sees the
//! previous step's results. Remote failures for one entity are logged
//! and counted, never propagated; only local storage errors abort a pass.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ConnectivityMonitor, PendingChangeTracker, SyncError};
use crate::config::ConflictPolicy;
use crate::db::LocalStore;
use crate::models::{Item, PendingChange};
use crate::remote::{RemoteError, RemoteStore};

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    /// False when the server could not be listed; nothing else ran.
    pub remote_reachable: bool,
    pub deletes_pushed: usize,
    pub pending_pushed: usize,
    pub pending_failed: usize,
    /// Local changes dropped because the server value won.
    pub pending_discarded: usize,
    pub pulled_updated: usize,
    pub pulled_inserted: usize,
    pub local_pushed: usize,
    pub local_push_failed: usize,
    pub deleted_locally: usize,
    pub documents_pushed: usize,
    pub documents_pulled: usize,
    /// Pending flag changes plus unconfirmed deletes left after the pass.
    pub residual_pending: usize,
}

impl SyncSummary {
    pub fn pushed(&self) -> usize {
        self.deletes_pushed + self.pending_pushed + self.local_pushed + self.documents_pushed
    }

    pub fn pulled(&self) -> usize {
        self.pulled_updated + self.pulled_inserted + self.deleted_locally + self.documents_pulled
    }

    /// Items whose state changed on either side.
    pub fn items_synced(&self) -> usize {
        self.deletes_pushed
            + self.pending_pushed
            + self.local_pushed
            + self.pulled_updated
            + self.pulled_inserted
            + self.deleted_locally
    }

    /// True when the pass neither moved nor failed to move anything.
    pub fn is_noop(&self) -> bool {
        self.pushed() == 0
            && self.pulled() == 0
            && self.pending_failed == 0
            && self.pending_discarded == 0
            && self.local_push_failed == 0
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.remote_reachable {
            return write!(f, "offline, {} pending", self.residual_pending);
        }
        write!(
            f,
            "pushed {}, pulled {}, {} pending",
            self.pushed(),
            self.pulled(),
            self.residual_pending
        )?;
        if self.pending_discarded > 0 {
            write!(f, ", {} overridden by server", self.pending_discarded)?;
        }
        let failed = self.pending_failed + self.local_push_failed;
        if failed > 0 {
            write!(f, ", {} failed", failed)?;
        }
        Ok(())
    }
}

pub struct ReconciliationEngine {
    store: LocalStore,
    tracker: PendingChangeTracker,
    remote: Arc<dyn RemoteStore>,
    monitor: ConnectivityMonitor,
    policy: ConflictPolicy,
    gate: Mutex<()>,
    follow_up: AtomicBool,
    last_summary: SyncMutex<Option<SyncSummary>>,
    passes: AtomicU64,
}

impl ReconciliationEngine {
    pub fn new(
        store: LocalStore,
        tracker: PendingChangeTracker,
        remote: Arc<dyn RemoteStore>,
        monitor: ConnectivityMonitor,
    ) -> Self {
        Self {
            store,
            tracker,
            remote,
            monitor,
            policy: ConflictPolicy::default(),
            gate: Mutex::new(()),
            follow_up: AtomicBool::new(false),
            last_summary: SyncMutex::new(None),
            passes: AtomicU64::new(0),
        }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Number of passes completed since creation.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    pub fn last_summary(&self) -> Option<SyncSummary> {
        self.last_summary.lock().clone()
    }

    /// Runs a reconciliation pass, unless one is already running.
    ///
    /// A call that arrives while a pass is in flight is folded into a
    /// single follow-up pass run by the current holder, and returns
    /// `Ok(None)`. Otherwise returns the summary of the last pass this
    /// call ran.
    pub async fn reconcile(&self) -> Result<Option<SyncSummary>, SyncError> {
        self.follow_up.store(true, Ordering::SeqCst);
        let mut last = None;

        loop {
            let Ok(guard) = self.gate.try_lock() else {
                debug!("reconciliation already running, coalesced");
                return Ok(last);
            };
            if !self.follow_up.swap(false, Ordering::SeqCst) {
                return Ok(last);
            }

            let summary = self.run_pass().await?;
            self.passes.fetch_add(1, Ordering::SeqCst);
            *self.last_summary.lock() = Some(summary.clone());
            last = Some(summary);
            drop(guard);

            if !self.follow_up.load(Ordering::SeqCst) {
                return Ok(last);
            }
        }
    }

    async fn run_pass(&self) -> Result<SyncSummary, SyncError> {
        let mut summary = SyncSummary::default();

        let remote_items = match self.remote.list_items().await {
            Ok(items) => items,
            Err(e) => {
                warn!("reconciliation skipped, server unavailable: {}", e);
                self.monitor.report_failure(&e);
                summary.residual_pending = self.residual().await?;
                return Ok(summary);
            }
        };
        self.monitor.mark_reachable_quiet();
        summary.remote_reachable = true;

        let mut remote: HashMap<String, Item> = remote_items
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect();

        self.push_deletes(&mut remote, &mut summary).await?;
        let pushed = self.push_pending(&mut remote, &mut summary).await?;
        self.pull_remote(&remote, &pushed, &mut summary).await?;
        let created = self.push_local(&remote, &pushed, &mut summary).await?;
        self.remove_deleted(&remote, &pushed, &created, &mut summary)
            .await?;
        self.sync_documents(&mut summary).await?;

        summary.residual_pending = self.residual().await?;
        info!(
            pushed = summary.pushed(),
            pulled = summary.pulled(),
            residual = summary.residual_pending,
            "reconciliation finished"
        );
        Ok(summary)
    }

    async fn residual(&self) -> Result<usize, SyncError> {
        let pending = self.tracker.count().await?;
        let deletes = self.tracker.tombstone_count().await?;
        Ok((pending + deletes) as usize)
    }

    async fn push_deletes(
        &self,
        remote: &mut HashMap<String, Item>,
        summary: &mut SyncSummary,
    ) -> Result<(), SyncError> {
        for tombstone in self.tracker.tombstones().await? {
            let id = &tombstone.entity_id;
            match self.remote.delete_item(id).await {
                Ok(()) => {
                    self.tracker.resolve_delete(id).await?;
                    self.store.items().delete(id).await?;
                    remote.remove(id);
                    summary.deletes_pushed += 1;
                    debug!(id = %id, "pushed delete");
                }
                Err(e) => warn!(id = %id, "delete not confirmed: {}", e),
            }
        }
        Ok(())
    }

    /// Phase 1. Returns the ids the server confirmed.
    async fn push_pending(
        &self,
        remote: &mut HashMap<String, Item>,
        summary: &mut SyncSummary,
    ) -> Result<HashSet<String>, SyncError> {
        let mut pushed = HashSet::new();

        for change in self.tracker.snapshot().await? {
            let id = change.entity_id.clone();
            let result = match remote.get(&id) {
                Some(current) if current.completed == change.desired_value => Ok(current.clone()),
                Some(current) if self.policy == ConflictPolicy::ServerWins => {
                    if self.tracker.resolve_matching(&change).await? {
                        debug!(id = %id, server = current.completed, "server value wins, dropping local change");
                        summary.pending_discarded += 1;
                    }
                    continue;
                }
                Some(_) => self.remote.set_completed(&id, change.desired_value).await,
                None => match self.store.items().get(&id).await? {
                    Some(local) => self.create_with_value(local.record, &change).await,
                    None => {
                        warn!(id = %id, "pending change for an item that exists nowhere, dropping it");
                        self.tracker.resolve_matching(&change).await?;
                        continue;
                    }
                },
            };

            match result {
                Ok(item) => {
                    if !self.tracker.resolve_matching(&change).await? {
                        self.requeue_if_diverged(&id, item.completed).await?;
                    }
                    self.store.items().mark_synced(&id).await?;
                    remote.insert(id.clone(), item);
                    pushed.insert(id);
                    summary.pending_pushed += 1;
                }
                Err(e) => {
                    warn!(id = %id, "pending change not pushed: {}", e);
                    summary.pending_failed += 1;
                }
            }
        }
        Ok(pushed)
    }

    /// A newer local write landed while `pushed` was in flight. Whatever
    /// order the two reached the server in, the local value must be
    /// pushed again unless it already matches.
    async fn requeue_if_diverged(&self, id: &str, pushed: bool) -> Result<(), SyncError> {
        let Some(local) = self.store.items().get(id).await? else {
            return Ok(());
        };
        if local.record.completed != pushed {
            debug!(id, local = local.record.completed, pushed, "newer local intent recorded during push, requeued");
            self.tracker.record(id, local.record.completed).await?;
            self.monitor.request_sync();
        }
        Ok(())
    }

    async fn create_with_value(
        &self,
        item: Item,
        change: &PendingChange,
    ) -> Result<Item, RemoteError> {
        let created = self
            .remote
            .create_item(&item.with_completed(change.desired_value))
            .await?;
        // Someone else created it first with another value.
        if created.completed != change.desired_value {
            return self
                .remote
                .set_completed(&change.entity_id, change.desired_value)
                .await;
        }
        Ok(created)
    }

    /// Phase 2.
    async fn pull_remote(
        &self,
        remote: &HashMap<String, Item>,
        pushed: &HashSet<String>,
        summary: &mut SyncSummary,
    ) -> Result<(), SyncError> {
        let items = self.store.items();

        for item in remote.values() {
            if pushed.contains(&item.id) {
                continue;
            }
            match items.get(&item.id).await? {
                Some(local) if local.record.completed != item.completed => {
                    if items.apply_remote_flag(&item.id, item.completed).await? {
                        debug!(id = %item.id, completed = item.completed, "took server value");
                        summary.pulled_updated += 1;
                    } else {
                        debug!(id = %item.id, "local intent pending, keeping local value");
                    }
                }
                Some(local) => {
                    if !local.synced {
                        items.mark_synced(&item.id).await?;
                    }
                }
                None => {
                    if items.insert_remote(item).await? {
                        debug!(id = %item.id, "pulled new item");
                        summary.pulled_inserted += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Phase 3. Returns the ids created remotely.
    async fn push_local(
        &self,
        remote: &HashMap<String, Item>,
        pushed: &HashSet<String>,
        summary: &mut SyncSummary,
    ) -> Result<HashSet<String>, SyncError> {
        let items = self.store.items();
        let pending: HashSet<String> = self
            .tracker
            .snapshot()
            .await?
            .into_iter()
            .map(|change| change.entity_id)
            .collect();
        let mut created = HashSet::new();

        // Oldest first.
        for local in items.list().await?.into_iter().rev() {
            let id = &local.record.id;
            if local.synced
                || remote.contains_key(id)
                || pushed.contains(id)
                || pending.contains(id)
            {
                continue;
            }
            match self.remote.create_item(&local.record).await {
                Ok(_) => {
                    items.mark_synced(id).await?;
                    created.insert(id.clone());
                    summary.local_pushed += 1;
                    debug!(id = %id, "pushed local item");
                }
                Err(e) => {
                    warn!(id = %id, "local item not pushed: {}", e);
                    summary.local_push_failed += 1;
                }
            }
        }
        Ok(created)
    }

    /// Phase 4.
    async fn remove_deleted(
        &self,
        remote: &HashMap<String, Item>,
        pushed: &HashSet<String>,
        created: &HashSet<String>,
        summary: &mut SyncSummary,
    ) -> Result<(), SyncError> {
        let items = self.store.items();

        for local in items.list().await? {
            let id = &local.record.id;
            if !local.synced
                || remote.contains_key(id)
                || pushed.contains(id)
                || created.contains(id)
            {
                continue;
            }
            if self.tracker.get(id).await?.is_some() || self.tracker.is_tombstoned(id).await? {
                continue;
            }
            if items.delete(id).await? {
                debug!(id = %id, "removed item deleted on the server");
                summary.deleted_locally += 1;
            }
        }
        Ok(())
    }

    async fn sync_documents(&self, summary: &mut SyncSummary) -> Result<(), SyncError> {
        let remote_documents = match self.remote.list_documents().await {
            Ok(documents) => documents,
            Err(e) => {
                warn!("document pass skipped: {}", e);
                return Ok(());
            }
        };
        let remote_bodies = match self.remote.list_document_bodies().await {
            Ok(bodies) => bodies,
            Err(e) => {
                warn!("document pass skipped: {}", e);
                return Ok(());
            }
        };

        let documents = self.store.documents();
        let mut remote_document_ids: HashSet<String> =
            remote_documents.iter().map(|d| d.id.clone()).collect();
        let remote_body_ids: HashSet<String> = remote_bodies.iter().map(|b| b.id.clone()).collect();

        for local in documents.list_documents().await? {
            let id = &local.record.id;
            if remote_document_ids.contains(id) {
                if !local.synced {
                    documents.mark_document_synced(id).await?;
                }
                continue;
            }
            match self.remote.create_document(&local.record).await {
                Ok(_) => {
                    documents.mark_document_synced(id).await?;
                    remote_document_ids.insert(id.clone());
                    summary.documents_pushed += 1;
                }
                Err(e) => warn!(id = %id, "document not pushed: {}", e),
            }
        }

        for local in documents.list_bodies().await? {
            let body = &local.record;
            if remote_body_ids.contains(&body.id) {
                if !local.synced {
                    documents.mark_body_synced(&body.id).await?;
                }
                continue;
            }
            if !remote_document_ids.contains(&body.document_id) {
                debug!(id = %body.id, "document body waits for its parent");
                continue;
            }
            match self.remote.create_document_body(body).await {
                Ok(_) => {
                    documents.mark_body_synced(&body.id).await?;
                    summary.documents_pushed += 1;
                }
                Err(e) => warn!(id = %body.id, "document body not pushed: {}", e),
            }
        }

        for document in &remote_documents {
            if documents.insert_document(document, true).await? {
                summary.documents_pulled += 1;
            }
        }
        for body in &remote_bodies {
            if documents.get_document(&body.document_id).await?.is_none() {
                continue;
            }
            if documents.insert_body(body, true).await? {
                summary.documents_pulled += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_totals() {
        let summary = SyncSummary {
            remote_reachable: true,
            deletes_pushed: 1,
            pending_pushed: 2,
            local_pushed: 3,
            pulled_updated: 4,
            pulled_inserted: 5,
            deleted_locally: 6,
            documents_pushed: 7,
            documents_pulled: 8,
            ..Default::default()
        };

        assert_eq!(summary.pushed(), 13);
        assert_eq!(summary.pulled(), 23);
        assert_eq!(summary.items_synced(), 21);
        assert!(!summary.is_noop());
    }

    #[test]
    fn test_summary_noop_and_display() {
        let summary = SyncSummary {
            remote_reachable: true,
            residual_pending: 2,
            ..Default::default()
        };
        assert!(summary.is_noop());
        assert_eq!(summary.to_string(), "pushed 0, pulled 0, 2 pending");

        let failed = SyncSummary {
            remote_reachable: true,
            pending_failed: 1,
            ..Default::default()
        };
        assert!(!failed.is_noop());
        assert_eq!(failed.to_string(), "pushed 0, pulled 0, 0 pending, 1 failed");

        assert_eq!(SyncSummary::default().to_string(), "offline, 0 pending");

        let overridden = SyncSummary {
            remote_reachable: true,
            pending_discarded: 1,
            pulled_updated: 1,
            ..Default::default()
        };
        assert!(!overridden.is_noop());
        assert_eq!(
            overridden.to_string(),
            "pushed 0, pulled 1, 0 pending, 1 overridden by server"
        );
    }
}
