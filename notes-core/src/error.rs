use thiserror::Error;

use crate::history::EditLogEntry;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    #[error("Invalid range: position {position} + length {length} exceeds content length {content_len}")]
    InvalidRange {
        position: usize,
        length: usize,
        content_len: usize,
    },
}

/// A non-conflicting offline batch that stopped part-way.
///
/// Operations before the failing one stay committed; `committed` lists
/// their log entries so callers can persist and broadcast them.
#[derive(Error, Debug, Clone)]
#[error("Offline batch aborted after {} committed operation(s): {source}", .committed.len())]
pub struct ReconcileError {
    pub committed: Vec<EditLogEntry>,
    #[source]
    pub source: EditError,
}
