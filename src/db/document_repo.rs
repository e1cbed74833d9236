use sqlx::SqlitePool;

use super::{parse_timestamp, LocalRecord};
use crate::models::{Document, DocumentBody};

pub struct DocumentRepository {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    title: String,
    created_at: String,
    synced: bool,
}

#[derive(sqlx::FromRow)]
struct BodyRow {
    id: String,
    document_id: String,
    content: String,
    created_at: String,
    synced: bool,
}

impl TryFrom<DocumentRow> for LocalRecord<Document> {
    type Error = sqlx::Error;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        Ok(LocalRecord {
            record: Document {
                id: row.id,
                title: row.title,
                created_at: parse_timestamp(&row.created_at)?,
            },
            synced: row.synced,
        })
    }
}

impl TryFrom<BodyRow> for LocalRecord<DocumentBody> {
    type Error = sqlx::Error;

    fn try_from(row: BodyRow) -> Result<Self, Self::Error> {
        Ok(LocalRecord {
            record: DocumentBody {
                id: row.id,
                document_id: row.document_id,
                content: row.content,
                created_at: parse_timestamp(&row.created_at)?,
            },
            synced: row.synced,
        })
    }
}

impl DocumentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_document(
        &self,
        document: &Document,
        synced: bool,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO documents (id, title, created_at, synced)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&document.id)
        .bind(&document.title)
        .bind(document.created_at.to_rfc3339())
        .bind(synced)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Inserts a body. Fails with a foreign key error if its document is not
    /// stored locally.
    pub async fn insert_body(&self, body: &DocumentBody, synced: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO document_bodies (id, document_id, content, created_at, synced)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&body.id)
        .bind(&body.document_id)
        .bind(&body.content)
        .bind(body.created_at.to_rfc3339())
        .bind(synced)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Inserts a document and its optional body in one transaction.
    pub async fn insert_with_body(
        &self,
        document: &Document,
        body: Option<&DocumentBody>,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO documents (id, title, created_at, synced) VALUES (?, ?, ?, 0)")
            .bind(&document.id)
            .bind(&document.title)
            .bind(document.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;

        if let Some(body) = body {
            sqlx::query(
                "INSERT INTO document_bodies (id, document_id, content, created_at, synced) VALUES (?, ?, ?, ?, 0)",
            )
            .bind(&body.id)
            .bind(&body.document_id)
            .bind(&body.content)
            .bind(body.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<LocalRecord<Document>>, sqlx::Error> {
        let row: Option<DocumentRow> = sqlx::query_as("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(LocalRecord::<Document>::try_from).transpose()
    }

    /// All documents, oldest first.
    pub async fn list_documents(&self) -> Result<Vec<LocalRecord<Document>>, sqlx::Error> {
        let rows: Vec<DocumentRow> =
            sqlx::query_as("SELECT * FROM documents ORDER BY created_at ASC, id ASC")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(LocalRecord::<Document>::try_from).collect()
    }

    /// All bodies, oldest first.
    pub async fn list_bodies(&self) -> Result<Vec<LocalRecord<DocumentBody>>, sqlx::Error> {
        let rows: Vec<BodyRow> =
            sqlx::query_as("SELECT * FROM document_bodies ORDER BY created_at ASC, id ASC")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(LocalRecord::<DocumentBody>::try_from).collect()
    }

    pub async fn body_for(&self, document_id: &str) -> Result<Option<DocumentBody>, sqlx::Error> {
        let row: Option<BodyRow> =
            sqlx::query_as("SELECT * FROM document_bodies WHERE document_id = ? LIMIT 1")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row
            .map(LocalRecord::<DocumentBody>::try_from)
            .transpose()?
            .map(|local| local.record))
    }

    pub async fn mark_document_synced(&self, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE documents SET synced = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_body_synced(&self, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE document_bodies SET synced = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
