//! Persistence seams consumed by the session hub.
//!
//! ```text
//! ┌─────────────┐  save / append_event   ┌──────────────────────────────┐
//! │  Note hub   │ ─────────────────────► │ ContentStore                 │
//! │ (authority) │                        │   notes  — content + version │
//! └──────┬──────┘                        │   events — edit log entries  │
//!        │ upsert / delete / clear       ├──────────────────────────────┤
//!        └─────────────────────────────► │ PresenceStore                │
//!                                        │   (note, user) → entry       │
//!                                        └──────────────────────────────┘
//! ```
//!
//! Both traits are synchronous and keyed per note, so hubs of different
//! notes never contend on the same rows. [`MemoryStore`] backs tests and
//! ephemeral servers; [`RocksStore`] is the durable implementation.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use notes_core::{EditLogEntry, NoteDocument};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::PresenceEntry;

/// Note content, version stamp and the append-only event history.
pub trait ContentStore: Send + Sync {
    /// Current content and version; `NotFound` for unknown notes.
    fn load(&self, note_id: Uuid) -> Result<NoteDocument, StoreError>;

    fn save(&self, note_id: Uuid, document: &NoteDocument) -> Result<(), StoreError>;

    fn append_event(&self, note_id: Uuid, entry: &EditLogEntry) -> Result<(), StoreError>;

    /// All events of a note in ascending sequence order.
    fn load_events(&self, note_id: Uuid) -> Result<Vec<EditLogEntry>, StoreError>;

    /// Create a note with initial content at version 0. Existing notes are
    /// left untouched and returned as stored.
    fn create(&self, note_id: Uuid, content: &str) -> Result<NoteDocument, StoreError>;
}

/// Presence rows keyed by `(note_id, user_id)`; the last write wins.
pub trait PresenceStore: Send + Sync {
    fn upsert(&self, entry: &PresenceEntry) -> Result<(), StoreError>;

    fn delete(&self, note_id: Uuid, user_id: Uuid) -> Result<(), StoreError>;

    fn list(&self, note_id: Uuid) -> Result<Vec<PresenceEntry>, StoreError>;

    /// Drop every row of a note. Returns how many were removed.
    fn clear(&self, note_id: Uuid) -> Result<usize, StoreError>;
}

/// Storage errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Note not found: {0}")]
    NotFound(Uuid),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
