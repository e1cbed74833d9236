mod change;
mod document;
mod item;

pub use change::{ChangeEvent, ChangeKind, EntityKind, PendingChange, PendingDelete};
pub use document::{Document, DocumentBody};
pub use item::Item;

/// Generates a new entity id.
///
/// ULIDs are unique across clients and sort by creation time, so an id
/// minted offline stays valid once the entity reaches the server.
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}
