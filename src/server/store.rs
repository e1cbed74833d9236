//! The authoritative store held by the sync server.
//!
//! A single SQLite database under the server's data directory. Creates are
//! idempotent by id; bodies require their parent document.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

use crate::db::parse_timestamp;
use crate::models::{Document, DocumentBody, Item};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("document {0} does not exist")]
    MissingParent(String),
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    id: String,
    title: String,
    completed: bool,
    created_at: String,
}

impl TryFrom<ItemRow> for Item {
    type Error = sqlx::Error;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        Ok(Item {
            id: row.id,
            title: row.title,
            completed: row.completed,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    title: String,
    created_at: String,
}

impl TryFrom<DocumentRow> for Document {
    type Error = sqlx::Error;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        Ok(Document {
            id: row.id,
            title: row.title,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BodyRow {
    id: String,
    document_id: String,
    content: String,
    created_at: String,
}

impl TryFrom<BodyRow> for DocumentBody {
    type Error = sqlx::Error;

    fn try_from(row: BodyRow) -> Result<Self, Self::Error> {
        Ok(DocumentBody {
            id: row.id,
            document_id: row.document_id,
            content: row.content,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerStore {
    pool: SqlitePool,
}

impl ServerStore {
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::from)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .foreign_keys(true)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations/server")
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;

        Ok(Self { pool })
    }

    pub async fn list_items(&self) -> Result<Vec<Item>, StorageError> {
        let rows: Vec<ItemRow> = sqlx::query_as("SELECT * FROM items ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(Item::try_from)
            .collect::<Result<Vec<_>, sqlx::Error>>()?)
    }

    pub async fn get_item(&self, id: &str) -> Result<Option<Item>, StorageError> {
        let row: Option<ItemRow> = sqlx::query_as("SELECT * FROM items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Item::try_from).transpose()?)
    }

    /// Stores the item unless the id exists. Returns the stored item and
    /// whether this call created it.
    pub async fn create_item(&self, item: &Item) -> Result<(Item, bool), StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO items (id, title, completed, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&item.id)
        .bind(&item.title)
        .bind(item.completed)
        .bind(item.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok((item.clone(), true));
        }
        let existing = self
            .get_item(&item.id)
            .await?
            .unwrap_or_else(|| item.clone());
        Ok((existing, false))
    }

    pub async fn set_completed(&self, id: &str, completed: bool) -> Result<Option<Item>, StorageError> {
        sqlx::query("UPDATE items SET completed = ? WHERE id = ?")
            .bind(completed)
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.get_item(id).await
    }

    pub async fn delete_item(&self, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>, StorageError> {
        let rows: Vec<DocumentRow> =
            sqlx::query_as("SELECT * FROM documents ORDER BY created_at, id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(Document::try_from)
            .collect::<Result<Vec<_>, sqlx::Error>>()?)
    }

    pub async fn create_document(&self, document: &Document) -> Result<(Document, bool), StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO documents (id, title, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&document.id)
        .bind(&document.title)
        .bind(document.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok((document.clone(), true));
        }
        let row: Option<DocumentRow> = sqlx::query_as("SELECT * FROM documents WHERE id = ?")
            .bind(&document.id)
            .fetch_optional(&self.pool)
            .await?;
        let existing = row.map(Document::try_from).transpose()?;
        Ok((existing.unwrap_or_else(|| document.clone()), false))
    }

    pub async fn list_bodies(&self) -> Result<Vec<DocumentBody>, StorageError> {
        let rows: Vec<BodyRow> =
            sqlx::query_as("SELECT * FROM document_bodies ORDER BY created_at, id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(DocumentBody::try_from)
            .collect::<Result<Vec<_>, sqlx::Error>>()?)
    }

    /// Stores a body. Fails with `MissingParent` if its document is unknown.
    pub async fn create_body(&self, body: &DocumentBody) -> Result<(DocumentBody, bool), StorageError> {
        let mut tx = self.pool.begin().await?;

        let parent: Option<(String,)> = sqlx::query_as("SELECT id FROM documents WHERE id = ?")
            .bind(&body.document_id)
            .fetch_optional(&mut *tx)
            .await?;
        if parent.is_none() {
            return Err(StorageError::MissingParent(body.document_id.clone()));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO document_bodies (id, document_id, content, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&body.id)
        .bind(&body.document_id)
        .bind(&body.content)
        .bind(body.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let existing: Option<BodyRow> = if result.rows_affected() == 0 {
            sqlx::query_as("SELECT * FROM document_bodies WHERE id = ?")
                .bind(&body.id)
                .fetch_optional(&mut *tx)
                .await?
        } else {
            None
        };
        tx.commit().await?;

        match existing {
            Some(row) => Ok((DocumentBody::try_from(row)?, false)),
            None => Ok((body.clone(), result.rows_affected() > 0)),
        }
    }
}
