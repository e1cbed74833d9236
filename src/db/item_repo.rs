use sqlx::SqlitePool;

use super::{parse_timestamp, LocalRecord};
use crate::models::Item;

pub struct ItemRepository {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    id: String,
    title: String,
    completed: bool,
    created_at: String,
    synced: bool,
}

impl TryFrom<ItemRow> for LocalRecord<Item> {
    type Error = sqlx::Error;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        Ok(LocalRecord {
            record: Item {
                id: row.id,
                title: row.title,
                completed: row.completed,
                created_at: parse_timestamp(&row.created_at)?,
            },
            synced: row.synced,
        })
    }
}

impl ItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts an item unless one with the same id already exists.
    ///
    /// Returns `true` if a row was written.
    pub async fn insert(&self, item: &Item, synced: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO items (id, title, completed, created_at, synced)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&item.id)
        .bind(&item.title)
        .bind(item.completed)
        .bind(item.created_at.to_rfc3339())
        .bind(synced)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, id: &str) -> Result<Option<LocalRecord<Item>>, sqlx::Error> {
        let row: Option<ItemRow> = sqlx::query_as("SELECT * FROM items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(LocalRecord::<Item>::try_from).transpose()
    }

    /// All items, newest first.
    pub async fn list(&self) -> Result<Vec<LocalRecord<Item>>, sqlx::Error> {
        let rows: Vec<ItemRow> =
            sqlx::query_as("SELECT * FROM items ORDER BY created_at DESC, id DESC")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(LocalRecord::<Item>::try_from).collect()
    }

    /// Sets the `completed` flag. Returns `false` if the item does not exist.
    pub async fn set_completed(&self, id: &str, completed: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE items SET completed = ? WHERE id = ?")
            .bind(completed)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Inserts an item pulled from the server, unless it exists locally or
    /// has an unconfirmed local delete.
    pub async fn insert_remote(&self, item: &Item) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO items (id, title, completed, created_at, synced)
            SELECT ?, ?, ?, ?, 1
            WHERE NOT EXISTS (SELECT 1 FROM pending_deletes WHERE entity_id = ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&item.id)
        .bind(&item.title)
        .bind(item.completed)
        .bind(item.created_at.to_rfc3339())
        .bind(&item.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Takes the server's `completed` value, unless a local intent for the
    /// item is still pending. Returns `true` if the row changed.
    pub async fn apply_remote_flag(&self, id: &str, completed: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE items SET completed = ?, synced = 1
            WHERE id = ?
              AND NOT EXISTS (SELECT 1 FROM pending_changes WHERE entity_id = ?)
            "#,
        )
        .bind(completed)
        .bind(id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_synced(&self, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE items SET synced = 1 WHERE id = ? AND synced = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes an item. Returns `false` if it was already gone.
    pub async fn delete(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
