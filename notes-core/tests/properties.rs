//! Property tests for the edit laws every note relies on:
//!  - Inverse:    apply(invert(apply(c, op))) = c
//!  - Undo/redo:  undoing a user's edits restores the content they started
//!    from, and redoing them restores the content they produced

use notes_core::{ranges_overlap, EditLog, NoteDocument, Operation, UndoOutcome};
use proptest::prelude::*;
use uuid::Uuid;

/// Arbitrary printable Unicode, multi-byte characters included.
fn content_strategy() -> impl Strategy<Value = String> {
    "\\PC{0,40}"
}

fn text_strategy() -> impl Strategy<Value = String> {
    "\\PC{0,8}"
}

/// Content paired with an operation that is in range for it.
fn content_and_op() -> impl Strategy<Value = (String, Operation)> {
    content_strategy().prop_flat_map(|content| {
        let len = content.chars().count();
        let op = prop_oneof![
            (0..=len, text_strategy()).prop_map(|(position, text)| Operation::insert(position, text)),
            (0..=len)
                .prop_flat_map(move |position| (Just(position), 0..=len - position))
                .prop_map(|(position, length)| Operation::delete(position, length)),
            (0..=len)
                .prop_flat_map(move |position| (Just(position), 0..=len - position, text_strategy()))
                .prop_map(|(position, length, text)| Operation::replace(position, length, text)),
        ];
        (Just(content), op)
    })
}

/// Raw edit shapes, folded into range by [`in_range`] against the content
/// they are applied to.
fn edit_script() -> impl Strategy<Value = Vec<(u8, usize, usize, String)>> {
    prop::collection::vec((0u8..3, any::<usize>(), any::<usize>(), text_strategy()), 1..8)
}

fn in_range(content: &str, (kind, a, b, text): &(u8, usize, usize, String)) -> Operation {
    let len = content.chars().count();
    let position = a % (len + 1);
    let length = b % (len - position + 1);
    match kind {
        0 => Operation::insert(position, text.clone()),
        1 => Operation::delete(position, length),
        _ => Operation::replace(position, length, text.clone()),
    }
}

// ============================================================================
// Operation laws
// ============================================================================

proptest! {
    #[test]
    fn inverse_restores_content((content, op) in content_and_op()) {
        let (applied, concrete) = op.apply_to(&content).unwrap();
        let (restored, _) = concrete.invert().apply_to(&applied).unwrap();
        prop_assert_eq!(restored, content);
    }

    #[test]
    fn inverse_of_inverse_reapplies((content, op) in content_and_op()) {
        let (applied, concrete) = op.apply_to(&content).unwrap();
        let (restored, inverse) = concrete.invert().apply_to(&applied).unwrap();
        let (reapplied, _) = inverse.invert().apply_to(&restored).unwrap();
        prop_assert_eq!(reapplied, applied);
    }

    #[test]
    fn overlap_is_symmetric(a in 0usize..50, b in 0usize..50, c in 0usize..50, d in 0usize..50) {
        let x = a.min(b)..a.max(b);
        let y = c.min(d)..c.max(d);
        prop_assert_eq!(ranges_overlap(&x, &y), ranges_overlap(&y, &x));
    }
}

// ============================================================================
// Edit log laws
// ============================================================================

proptest! {
    #[test]
    fn undo_then_redo_restores_content(content in content_strategy(), script in edit_script()) {
        let user = Uuid::new_v4();
        let mut log = EditLog::new(Uuid::new_v4(), NoteDocument::new(content.clone(), 0));
        for raw in &script {
            let op = in_range(log.content(), raw);
            log.append_edit(user, &op).unwrap();
        }
        let edited = log.content().to_string();

        for _ in &script {
            prop_assert!(matches!(log.undo(user).unwrap(), UndoOutcome::Applied(_)));
        }
        prop_assert_eq!(log.content(), content.as_str());
        prop_assert!(matches!(log.undo(user).unwrap(), UndoOutcome::NoOp));

        for _ in &script {
            prop_assert!(matches!(log.redo(user).unwrap(), UndoOutcome::Applied(_)));
        }
        prop_assert_eq!(log.content(), edited.as_str());
        prop_assert!(matches!(log.redo(user).unwrap(), UndoOutcome::NoOp));

        // Nothing is ever removed from the log.
        prop_assert_eq!(log.len(), script.len() * 3);
    }

    #[test]
    fn version_tracks_log_length(content in content_strategy(), script in edit_script()) {
        let user = Uuid::new_v4();
        let mut log = EditLog::new(Uuid::new_v4(), NoteDocument::new(content, 0));
        for raw in &script {
            let op = in_range(log.content(), raw);
            let entry = log.append_edit(user, &op).unwrap();
            prop_assert_eq!(entry.version, log.version());
        }
        prop_assert_eq!(log.version(), script.len() as u64);
    }
}
