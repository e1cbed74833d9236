//! Wire types shared by the sync server and its clients.
//!
//! JSON bodies use camelCase field names. Change notifications travel over
//! a text event stream (see [`event_stream`]).

pub mod event_stream;

pub use event_stream::{EventStreamDecoder, Frame};

use serde::{Deserialize, Serialize};

use crate::models::{ChangeEvent, ChangeKind};

/// Event name of the first frame sent on every new stream.
pub const CONNECTED_EVENT: &str = "connected";

/// Text of the comment frame sent as a heartbeat.
pub const HEARTBEAT_COMMENT: &str = "heartbeat";

/// Payload of an `<entity>-change` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotice {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: i64,
}

impl From<&ChangeEvent> for ChangeNotice {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            kind: event.kind,
            entity_id: event.entity_id.clone(),
            data: event.payload.clone(),
            timestamp: event.emitted_at,
        }
    }
}

/// Builds the `<entity>-change` frame broadcast for a mutation.
pub fn change_frame(event: &ChangeEvent) -> Result<Frame, serde_json::Error> {
    Frame::event(event.entity.event_name(), &ChangeNotice::from(event))
}

/// Payload of the `connected` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedNotice {
    pub connection_id: String,
    pub message: String,
    pub timestamp: i64,
}

/// Response of `GET /api/changes/last`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastChangeResponse {
    pub timestamp: i64,
}

/// Body of `PUT /api/items/{id}/completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetCompletedRequest {
    pub completed: bool,
}
