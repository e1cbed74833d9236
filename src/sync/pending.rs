//! Durable ledger of local writes the server has not confirmed yet.
//!
//! Every method persists before returning, so an intent recorded just
//! before a crash is still there on the next start.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::clock::Clock;
use crate::models::{PendingChange, PendingDelete};

#[derive(sqlx::FromRow)]
struct PendingChangeRow {
    entity_id: String,
    desired_value: bool,
    recorded_at: i64,
}

impl From<PendingChangeRow> for PendingChange {
    fn from(row: PendingChangeRow) -> Self {
        PendingChange {
            entity_id: row.entity_id,
            desired_value: row.desired_value,
            recorded_at: row.recorded_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PendingDeleteRow {
    entity_id: String,
    recorded_at: i64,
}

impl From<PendingDeleteRow> for PendingDelete {
    fn from(row: PendingDeleteRow) -> Self {
        PendingDelete {
            entity_id: row.entity_id,
            recorded_at: row.recorded_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingChangeTracker {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl PendingChangeTracker {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Records the latest local intent for an item's `completed` flag,
    /// replacing any earlier unconfirmed one.
    pub async fn record(&self, entity_id: &str, value: bool) -> Result<PendingChange, sqlx::Error> {
        // An overwrite always gets a later `recorded_at` than the entry it
        // replaces, even within one clock tick.
        let recorded_at: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO pending_changes (entity_id, desired_value, recorded_at)
            VALUES (?, ?, ?)
            ON CONFLICT(entity_id) DO UPDATE SET
                desired_value = excluded.desired_value,
                recorded_at = MAX(excluded.recorded_at, pending_changes.recorded_at + 1)
            RETURNING recorded_at
            "#,
        )
        .bind(entity_id)
        .bind(value)
        .bind(self.clock.now_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(PendingChange {
            entity_id: entity_id.to_string(),
            desired_value: value,
            recorded_at,
        })
    }

    pub async fn get(&self, entity_id: &str) -> Result<Option<PendingChange>, sqlx::Error> {
        let row: Option<PendingChangeRow> =
            sqlx::query_as("SELECT * FROM pending_changes WHERE entity_id = ?")
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(PendingChange::from))
    }

    /// Removes the entry for `entity_id`, whatever it holds.
    pub async fn resolve(&self, entity_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM pending_changes WHERE entity_id = ?")
            .bind(entity_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes the entry only if it is still exactly `change`.
    ///
    /// Returns `false` when a newer intent replaced it in the meantime;
    /// that intent stays pending.
    pub async fn resolve_matching(&self, change: &PendingChange) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM pending_changes WHERE entity_id = ? AND desired_value = ? AND recorded_at = ?",
        )
        .bind(&change.entity_id)
        .bind(change.desired_value)
        .bind(change.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Copy of every entry, oldest first.
    pub async fn snapshot(&self) -> Result<Vec<PendingChange>, sqlx::Error> {
        let rows: Vec<PendingChangeRow> =
            sqlx::query_as("SELECT * FROM pending_changes ORDER BY recorded_at, entity_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(PendingChange::from).collect())
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_changes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Records a tombstone for a local delete and drops any pending flag
    /// change for the same entity, atomically.
    pub async fn record_delete(&self, entity_id: &str) -> Result<PendingDelete, sqlx::Error> {
        let tombstone = PendingDelete {
            entity_id: entity_id.to_string(),
            recorded_at: self.clock.now_millis(),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pending_changes WHERE entity_id = ?")
            .bind(entity_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO pending_deletes (entity_id, recorded_at)
            VALUES (?, ?)
            ON CONFLICT(entity_id) DO UPDATE SET recorded_at = excluded.recorded_at
            "#,
        )
        .bind(&tombstone.entity_id)
        .bind(tombstone.recorded_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(tombstone)
    }

    pub async fn resolve_delete(&self, entity_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM pending_deletes WHERE entity_id = ?")
            .bind(entity_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_tombstoned(&self, entity_id: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT entity_id FROM pending_deletes WHERE entity_id = ?")
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Unconfirmed deletes, oldest first.
    pub async fn tombstones(&self) -> Result<Vec<PendingDelete>, sqlx::Error> {
        let rows: Vec<PendingDeleteRow> =
            sqlx::query_as("SELECT * FROM pending_deletes ORDER BY recorded_at, entity_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(PendingDelete::from).collect())
    }

    pub async fn tombstone_count(&self) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_deletes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
