//! Append-only edit log with per-user undo/redo.
//!
//! ```text
//! entries:  #1 Edit(u2)  #2 Edit(u2)  #3 Undo(u2 → #2)  #4 Redo(u2 → #2)
//!
//! stacks[u2]:   after #2   undo [1, 2]   redo []
//!               after #3   undo [1]      redo [2]
//!               after #4   undo [1, 4]   redo []
//! ```
//!
//! Undo and redo never rewrite history: they apply a new forward operation
//! and append it. Stack transitions are a pure function of the entry kind,
//! so [`EditLog::restore`] rebuilds every user's stacks by replaying the
//! persisted entries.
//!
//! An inverse is applied at the position recorded in the original entry,
//! without transforming it against later edits by other authors. This is
//! exact when the undone region has not been touched since; edits that only
//! happened after it in the text never shift its offsets. Overlapping
//! concurrent edits can make the inverse land on moved text.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EditError;
use crate::op::Operation;

/// Why an entry was appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Ordinary edit (live or replayed from an offline batch).
    Edit,
    /// Inverse of the entry with sequence `reverts`.
    Undo { reverts: u64 },
    /// Re-application of the entry with sequence `reapplies`.
    Redo { reapplies: u64 },
    /// Appended conflict block from a rejected offline batch.
    Conflict,
}

/// One applied, concrete operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditLogEntry {
    pub sequence: u64,
    /// Document version immediately after this entry was applied.
    pub version: u64,
    pub author_id: Uuid,
    /// Milliseconds since the Unix epoch.
    pub applied_at: u64,
    pub kind: EntryKind,
    pub op: Operation,
}

/// Current text of a note and its version stamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteDocument {
    pub content: String,
    pub version: u64,
}

impl NoteDocument {
    pub fn new(content: impl Into<String>, version: u64) -> Self {
        Self {
            content: content.into(),
            version,
        }
    }
}

/// A user's undo/redo stacks, holding log sequence numbers (most recent last).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UndoState {
    undo_stack: Vec<u64>,
    redo_stack: Vec<u64>,
}

impl UndoState {
    pub fn undo_stack(&self) -> &[u64] {
        &self.undo_stack
    }

    pub fn redo_stack(&self) -> &[u64] {
        &self.redo_stack
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }
}

/// Result of an undo or redo request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOutcome {
    Applied(EditLogEntry),
    /// The relevant stack was empty; nothing changed.
    NoOp,
}

impl UndoOutcome {
    pub fn entry(&self) -> Option<&EditLogEntry> {
        match self {
            UndoOutcome::Applied(entry) => Some(entry),
            UndoOutcome::NoOp => None,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, UndoOutcome::NoOp)
    }
}

/// The authoritative document, its history, and everyone's undo state.
///
/// Owned by exactly one writer at a time.
#[derive(Debug, Clone)]
pub struct EditLog {
    note_id: Uuid,
    document: NoteDocument,
    /// Sorted by ascending sequence.
    entries: Vec<EditLogEntry>,
    stacks: HashMap<Uuid, UndoState>,
}

impl EditLog {
    /// Start a log for a note with no recorded history.
    pub fn new(note_id: Uuid, document: NoteDocument) -> Self {
        Self {
            note_id,
            document,
            entries: Vec::new(),
            stacks: HashMap::new(),
        }
    }

    /// Rebuild a log from persisted state.
    ///
    /// `document` must be the content after the last entry. Undo/redo stacks
    /// are reconstructed by replaying entry kinds in sequence order.
    pub fn restore(note_id: Uuid, mut document: NoteDocument, mut entries: Vec<EditLogEntry>) -> Self {
        entries.sort_by_key(|entry| entry.sequence);
        entries.dedup_by_key(|entry| entry.sequence);

        let mut stacks = HashMap::new();
        for entry in &entries {
            record_transition(&mut stacks, entry);
        }

        if let Some(last) = entries.last() {
            document.version = document.version.max(last.version);
        }

        log::debug!(
            "Restored edit log for note {note_id}: {} entries, version {}",
            entries.len(),
            document.version
        );

        Self {
            note_id,
            document,
            entries,
            stacks,
        }
    }

    /// Apply `op` on behalf of `author` and append it.
    ///
    /// On success the entry goes onto the author's undo stack and their redo
    /// stack is cleared. On failure nothing changes.
    pub fn append_edit(&mut self, author: Uuid, op: &Operation) -> Result<EditLogEntry, EditError> {
        self.commit(author, EntryKind::Edit, op)
    }

    pub(crate) fn append_conflict(&mut self, author: Uuid, op: &Operation) -> Result<EditLogEntry, EditError> {
        self.commit(author, EntryKind::Conflict, op)
    }

    /// Revert `user`'s most recent undoable entry.
    ///
    /// A user with nothing to undo gets [`UndoOutcome::NoOp`]; nobody can undo
    /// another author's work. Fails with `InvalidRange` (stacks untouched) if
    /// the inverse no longer fits the current content.
    pub fn undo(&mut self, user: Uuid) -> Result<UndoOutcome, EditError> {
        let Some(target) = self.stacks.get(&user).and_then(|s| s.undo_stack.last().copied()) else {
            return Ok(UndoOutcome::NoOp);
        };
        let Some(inverse) = self.entry(target).map(|entry| entry.op.invert()) else {
            log::warn!("Undo target #{target} missing from log of note {}", self.note_id);
            return Ok(UndoOutcome::NoOp);
        };

        self.commit(user, EntryKind::Undo { reverts: target }, &inverse)
            .map(UndoOutcome::Applied)
    }

    /// Re-apply `user`'s most recently undone entry at its recorded position.
    pub fn redo(&mut self, user: Uuid) -> Result<UndoOutcome, EditError> {
        let Some(target) = self.stacks.get(&user).and_then(|s| s.redo_stack.last().copied()) else {
            return Ok(UndoOutcome::NoOp);
        };
        let Some(original) = self.entry(target).map(|entry| entry.op.clone()) else {
            log::warn!("Redo target #{target} missing from log of note {}", self.note_id);
            return Ok(UndoOutcome::NoOp);
        };

        self.commit(user, EntryKind::Redo { reapplies: target }, &original)
            .map(UndoOutcome::Applied)
    }

    fn commit(&mut self, author: Uuid, kind: EntryKind, op: &Operation) -> Result<EditLogEntry, EditError> {
        let (content, concrete) = op.apply_to(&self.document.content)?;

        let sequence = self.document.version + 1;
        let entry = EditLogEntry {
            sequence,
            version: sequence,
            author_id: author,
            applied_at: now_millis(),
            kind,
            op: concrete,
        };

        self.document.content = content;
        self.document.version = sequence;
        record_transition(&mut self.stacks, &entry);
        self.entries.push(entry.clone());

        Ok(entry)
    }

    /// All entries in append order. Restartable: call again to re-enumerate.
    pub fn history(&self) -> std::slice::Iter<'_, EditLogEntry> {
        self.entries.iter()
    }

    /// Entries applied after the document reached `version`.
    pub fn entries_since(&self, version: u64) -> impl Iterator<Item = &EditLogEntry> {
        let start = self.entries.partition_point(|entry| entry.version <= version);
        self.entries[start..].iter()
    }

    pub fn entry(&self, sequence: u64) -> Option<&EditLogEntry> {
        self.entries
            .binary_search_by_key(&sequence, |entry| entry.sequence)
            .ok()
            .map(|index| &self.entries[index])
    }

    pub fn undo_state(&self, user: &Uuid) -> Option<&UndoState> {
        self.stacks.get(user)
    }

    pub fn note_id(&self) -> Uuid {
        self.note_id
    }

    pub fn document(&self) -> &NoteDocument {
        &self.document
    }

    pub fn content(&self) -> &str {
        &self.document.content
    }

    /// Content length in characters.
    pub fn content_len(&self) -> usize {
        self.document.content.chars().count()
    }

    pub fn version(&self) -> u64 {
        self.document.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Stack transition for one appended entry.
fn record_transition(stacks: &mut HashMap<Uuid, UndoState>, entry: &EditLogEntry) {
    let state = stacks.entry(entry.author_id).or_default();
    match entry.kind {
        EntryKind::Edit | EntryKind::Conflict => {
            state.undo_stack.push(entry.sequence);
            state.redo_stack.clear();
        }
        EntryKind::Undo { reverts } => {
            if state.undo_stack.last() == Some(&reverts) {
                state.undo_stack.pop();
            } else {
                state.undo_stack.retain(|seq| *seq != reverts);
            }
            state.redo_stack.push(reverts);
        }
        EntryKind::Redo { reapplies } => {
            if state.redo_stack.last() == Some(&reapplies) {
                state.redo_stack.pop();
            } else {
                state.redo_stack.retain(|seq| *seq != reapplies);
            }
            state.undo_stack.push(entry.sequence);
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
