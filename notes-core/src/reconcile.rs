//! Offline batch reconciliation.
//!
//! A client that edited while disconnected sends its operations anchored to
//! `last_known_version`. The batch is judged as a unit against everything
//! applied since that version:
//!
//! ```text
//! affected   = ∪ affected_range(op)          for op in batch
//! intervening = log entries with version > last_known_version
//!
//! no overlap → apply batch in order as the user's own edits
//! overlap    → append one conflict block at the end of the note
//! ```
//!
//! A conflict never applies offline operations positionally over content
//! that moved underneath them, and never drops the user's text: it lands in
//! a clearly marked block for a human to resolve.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ReconcileError;
use crate::history::{EditLog, EditLogEntry};
use crate::op::{ranges_overlap, OpPayload, Operation};

/// Header line of an appended conflict block.
pub const CONFLICT_MARKER: &str = "🔄 Your Offline Changes";
/// Label preceding the offline text inside a conflict block.
pub const CONFLICT_LABEL: &str = "Your offline version:";

/// Offline batch as sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub last_known_version: u64,
    pub operations: Vec<OpPayload>,
}

/// Outcome reported back to the syncing client.
///
/// `success` means the batch was accepted and safely recorded, not that it
/// was merged transparently; `conflict` flags the appended block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub conflict: bool,
    pub applied_version: u64,
}

/// A sync outcome plus the log entries it appended.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub result: SyncResult,
    pub entries: Vec<EditLogEntry>,
}

/// Decide and apply an offline batch authored by `user`.
///
/// Non-conflicting batches are applied op by op; a range failure part-way
/// aborts the rest and reports the already committed entries in the error.
pub fn reconcile(
    log: &mut EditLog,
    user: Uuid,
    username: &str,
    last_known_version: u64,
    operations: &[Operation],
) -> Result<Reconciliation, ReconcileError> {
    if operations.is_empty() {
        return Ok(Reconciliation {
            result: SyncResult {
                success: true,
                conflict: false,
                applied_version: log.version(),
            },
            entries: Vec::new(),
        });
    }

    let affected: Vec<Range<usize>> = operations.iter().map(Operation::affected_range).collect();
    let conflicting = log.entries_since(last_known_version).find(|entry| {
        let touched = entry.op.affected_range();
        affected.iter().any(|range| ranges_overlap(range, &touched))
    });

    if let Some(entry) = conflicting {
        log::warn!(
            "Offline batch from {user} on note {} conflicts with #{} (known version {last_known_version}, now {})",
            log.note_id(),
            entry.sequence,
            log.version()
        );

        let block = conflict_block(username, operations);
        let append = Operation::insert(log.content_len(), block);
        let entry = log
            .append_conflict(user, &append)
            .map_err(|source| ReconcileError {
                committed: Vec::new(),
                source,
            })?;

        return Ok(Reconciliation {
            result: SyncResult {
                success: true,
                conflict: true,
                applied_version: entry.version,
            },
            entries: vec![entry],
        });
    }

    let mut committed = Vec::with_capacity(operations.len());
    for op in operations {
        match log.append_edit(user, op) {
            Ok(entry) => committed.push(entry),
            Err(source) => return Err(ReconcileError { committed, source }),
        }
    }

    log::debug!(
        "Applied {} offline operation(s) from {user} on note {}",
        committed.len(),
        log.note_id()
    );

    Ok(Reconciliation {
        result: SyncResult {
            success: true,
            conflict: false,
            applied_version: log.version(),
        },
        entries: committed,
    })
}

/// Human-resolvable block holding the offline text, in batch order.
pub fn conflict_block(username: &str, operations: &[Operation]) -> String {
    let offline_text: String = operations.iter().map(Operation::text).collect();
    format!("\n\n---\n{CONFLICT_MARKER} ({username})\n{CONFLICT_LABEL}\n{offline_text}\n---\n")
}
