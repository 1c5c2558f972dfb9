//! In-process store for tests and servers started without a data path.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use notes_core::{EditLogEntry, NoteDocument};
use uuid::Uuid;

use super::{ContentStore, PresenceStore, StoreError};
use crate::presence::PresenceEntry;

#[derive(Debug, Default)]
pub struct MemoryStore {
    notes: RwLock<HashMap<Uuid, NoteDocument>>,
    events: RwLock<HashMap<Uuid, Vec<EditLogEntry>>>,
    presence: RwLock<HashMap<(Uuid, Uuid), PresenceEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a note, replacing whatever was stored under `note_id`.
    pub fn insert_note(&self, note_id: Uuid, content: impl Into<String>) {
        write(&self.notes).insert(note_id, NoteDocument::new(content, 0));
        write(&self.events).remove(&note_id);
    }

    pub fn note_count(&self) -> usize {
        read(&self.notes).len()
    }

    pub fn event_count(&self, note_id: Uuid) -> usize {
        read(&self.events).get(&note_id).map_or(0, Vec::len)
    }
}

// A panicked writer never leaves a map half-updated, so poisoned locks are
// still safe to use.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl ContentStore for MemoryStore {
    fn load(&self, note_id: Uuid) -> Result<NoteDocument, StoreError> {
        read(&self.notes)
            .get(&note_id)
            .cloned()
            .ok_or(StoreError::NotFound(note_id))
    }

    fn save(&self, note_id: Uuid, document: &NoteDocument) -> Result<(), StoreError> {
        write(&self.notes).insert(note_id, document.clone());
        Ok(())
    }

    fn append_event(&self, note_id: Uuid, entry: &EditLogEntry) -> Result<(), StoreError> {
        write(&self.events).entry(note_id).or_default().push(entry.clone());
        Ok(())
    }

    fn load_events(&self, note_id: Uuid) -> Result<Vec<EditLogEntry>, StoreError> {
        let mut events = read(&self.events).get(&note_id).cloned().unwrap_or_default();
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    fn create(&self, note_id: Uuid, content: &str) -> Result<NoteDocument, StoreError> {
        let mut notes = write(&self.notes);
        Ok(notes
            .entry(note_id)
            .or_insert_with(|| NoteDocument::new(content, 0))
            .clone())
    }
}

impl PresenceStore for MemoryStore {
    fn upsert(&self, entry: &PresenceEntry) -> Result<(), StoreError> {
        write(&self.presence).insert((entry.note_id, entry.user_id), entry.clone());
        Ok(())
    }

    fn delete(&self, note_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        write(&self.presence).remove(&(note_id, user_id));
        Ok(())
    }

    fn list(&self, note_id: Uuid) -> Result<Vec<PresenceEntry>, StoreError> {
        let mut entries: Vec<PresenceEntry> = read(&self.presence)
            .values()
            .filter(|e| e.note_id == note_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(entries)
    }

    fn clear(&self, note_id: Uuid) -> Result<usize, StoreError> {
        let mut presence = write(&self.presence);
        let before = presence.len();
        presence.retain(|(note, _), _| *note != note_id);
        Ok(before - presence.len())
    }
}
