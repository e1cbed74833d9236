use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::new_id;

/// An append-only document (a post). Documents never conflict: once
/// created they are only ever copied between stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            title: title.into(),
            created_at: Utc::now(),
        }
    }
}

/// Content attached to at most one [`Document`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentBody {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl DocumentBody {
    pub fn new(document_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            document_id: document_id.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}
