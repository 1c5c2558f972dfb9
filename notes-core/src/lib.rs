//! # notes-core — Collaborative plain-text editing engine
//!
//! Synchronous, single-writer building blocks for a shared note:
//!
//! ```text
//!   OpPayload ──► Operation ──apply_to──► concrete Operation ──invert──► inverse
//!                      │
//!                      ▼
//!               ┌─────────────┐   undo / redo    ┌──────────────┐
//!               │   EditLog   │ ◄──────────────► │  UndoState   │
//!               │ (append-only│                  │  (per user)  │
//!               │  history)   │                  └──────────────┘
//!               └──────┬──────┘
//!                      │ entries_since(version)
//!                      ▼
//!               reconcile() ──► apply batch | append conflict block
//! ```
//!
//! ## Modules
//!
//! - [`op`] — Insert/Delete/Replace, exact inverses, affected ranges
//! - [`history`] — edit log with per-user undo/redo stacks
//! - [`reconcile`] — offline batch classification and conflict blocks
//! - [`error`] — error types
//!
//! Nothing here performs I/O; persistence and fan-out live in
//! `notes-collab`.

pub mod error;
pub mod history;
pub mod op;
pub mod reconcile;

pub use error::{EditError, ReconcileError};
pub use history::{EditLog, EditLogEntry, EntryKind, NoteDocument, UndoOutcome, UndoState};
pub use op::{ranges_overlap, OpPayload, OpType, Operation};
pub use reconcile::{
    conflict_block, reconcile, Reconciliation, SyncRequest, SyncResult, CONFLICT_LABEL,
    CONFLICT_MARKER,
};
