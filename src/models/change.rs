use serde::{Deserialize, Serialize};
use std::fmt;

/// An unconfirmed local write of an item's `completed` flag.
///
/// At most one exists per entity; a newer local write replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub entity_id: String,
    pub desired_value: bool,
    /// Milliseconds since the Unix epoch.
    pub recorded_at: i64,
}

/// A local delete that the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDelete {
    pub entity_id: String,
    pub recorded_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The stored entity types that produce change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Item,
    Document,
    DocumentBody,
}

impl EntityKind {
    /// Event name used on the change stream, e.g. `item-change`.
    pub fn event_name(&self) -> &'static str {
        match self {
            EntityKind::Item => "item-change",
            EntityKind::Document => "document-change",
            EntityKind::DocumentBody => "document-body-change",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "item-change" => Some(EntityKind::Item),
            "document-change" => Some(EntityKind::Document),
            "document-body-change" => Some(EntityKind::DocumentBody),
            _ => None,
        }
    }
}

/// A successful server-side mutation, as handed to the change notifier.
/// Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub entity: EntityKind,
    pub entity_id: String,
    pub payload: Option<serde_json::Value>,
    /// Watermark value assigned when the event was emitted.
    pub emitted_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_roundtrip() {
        for kind in [EntityKind::Item, EntityKind::Document, EntityKind::DocumentBody] {
            assert_eq!(EntityKind::from_event_name(kind.event_name()), Some(kind));
        }
        assert_eq!(EntityKind::from_event_name("heartbeat"), None);
    }

    #[test]
    fn test_change_kind_serializes_lowercase() {
        let json = serde_json::to_string(&ChangeKind::Deleted).unwrap();
        assert_eq!(json, "\"deleted\"");
    }
}
