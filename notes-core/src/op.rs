//! Edit operations over plain text and their exact inverses.
//!
//! Positions and lengths count Unicode scalar values (`char`), never bytes,
//! so multi-byte text can be sliced without landing inside a code point.
//!
//! ```text
//! content "abc"   Insert { position: 1, text: "X" }   →  "aXbc"
//! content "aXbc"  Delete { position: 1, length: 1 }   →  "abc"   (removed_text = "X")
//! ```

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::EditError;

/// Operation discriminant as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Insert,
    Delete,
    Replace,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => "insert",
            OpType::Delete => "delete",
            OpType::Replace => "replace",
        }
    }
}

/// Client-authored edit as it arrives from a caller.
///
/// Carries no `removed_text`: what an operation removes is always captured
/// from the live content at apply time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpPayload {
    pub op_type: OpType,
    pub position: usize,
    #[serde(default)]
    pub length: usize,
    #[serde(default)]
    pub text: String,
}

impl OpPayload {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Self {
            op_type: OpType::Insert,
            position,
            length: 0,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self {
            op_type: OpType::Delete,
            position,
            length,
            text: String::new(),
        }
    }

    pub fn replace(position: usize, length: usize, text: impl Into<String>) -> Self {
        Self {
            op_type: OpType::Replace,
            position,
            length,
            text: text.into(),
        }
    }
}

impl From<OpPayload> for Operation {
    fn from(payload: OpPayload) -> Self {
        match payload.op_type {
            // Insert ignores any client-supplied length.
            OpType::Insert => Operation::Insert {
                position: payload.position,
                text: payload.text,
            },
            OpType::Delete => Operation::Delete {
                position: payload.position,
                length: payload.length,
                removed_text: String::new(),
            },
            OpType::Replace => Operation::Replace {
                position: payload.position,
                length: payload.length,
                text: payload.text,
                removed_text: String::new(),
            },
        }
    }
}

/// A single edit over a note's text.
///
/// After [`Operation::apply_to`] the returned operation is *concrete*: its
/// `removed_text` holds exactly what was cut, which makes
/// [`Operation::invert`] exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert {
        position: usize,
        text: String,
    },
    Delete {
        position: usize,
        length: usize,
        removed_text: String,
    },
    Replace {
        position: usize,
        length: usize,
        text: String,
        removed_text: String,
    },
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Operation::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Operation::Delete {
            position,
            length,
            removed_text: String::new(),
        }
    }

    pub fn replace(position: usize, length: usize, text: impl Into<String>) -> Self {
        Operation::Replace {
            position,
            length,
            text: text.into(),
            removed_text: String::new(),
        }
    }

    pub fn op_type(&self) -> OpType {
        match self {
            Operation::Insert { .. } => OpType::Insert,
            Operation::Delete { .. } => OpType::Delete,
            Operation::Replace { .. } => OpType::Replace,
        }
    }

    pub fn position(&self) -> usize {
        match self {
            Operation::Insert { position, .. }
            | Operation::Delete { position, .. }
            | Operation::Replace { position, .. } => *position,
        }
    }

    /// Characters removed from the content; 0 for a pure insert.
    pub fn length(&self) -> usize {
        match self {
            Operation::Insert { .. } => 0,
            Operation::Delete { length, .. } | Operation::Replace { length, .. } => *length,
        }
    }

    /// Characters inserted into the content; empty for a pure delete.
    pub fn text(&self) -> &str {
        match self {
            Operation::Insert { text, .. } | Operation::Replace { text, .. } => text,
            Operation::Delete { .. } => "",
        }
    }

    pub fn removed_text(&self) -> &str {
        match self {
            Operation::Insert { .. } => "",
            Operation::Delete { removed_text, .. } | Operation::Replace { removed_text, .. } => {
                removed_text
            }
        }
    }

    /// Wire form of this operation (drops `removed_text`).
    pub fn to_payload(&self) -> OpPayload {
        OpPayload {
            op_type: self.op_type(),
            position: self.position(),
            length: self.length(),
            text: self.text().to_string(),
        }
    }

    /// Apply this operation to `content`.
    ///
    /// Returns the new content and the concrete operation with
    /// `removed_text` captured from `content`. Fails without side effects
    /// when `[position, position + length)` is not inside `content`.
    pub fn apply_to(&self, content: &str) -> Result<(String, Operation), EditError> {
        let content_len = content.chars().count();
        let position = self.position();
        let length = self.length();

        if position > content_len || length > content_len - position {
            return Err(EditError::InvalidRange {
                position,
                length,
                content_len,
            });
        }

        let start = byte_offset(content, position);
        let end = byte_offset(content, position + length);
        let removed = &content[start..end];
        let inserted = self.text();

        let mut updated = String::with_capacity(content.len() - removed.len() + inserted.len());
        updated.push_str(&content[..start]);
        updated.push_str(inserted);
        updated.push_str(&content[end..]);

        let concrete = match self {
            Operation::Insert { .. } => self.clone(),
            Operation::Delete { position, length, .. } => Operation::Delete {
                position: *position,
                length: *length,
                removed_text: removed.to_string(),
            },
            Operation::Replace {
                position,
                length,
                text,
                ..
            } => Operation::Replace {
                position: *position,
                length: *length,
                text: text.clone(),
                removed_text: removed.to_string(),
            },
        };

        Ok((updated, concrete))
    }

    /// The operation that, applied right after this concrete one, restores
    /// the prior content.
    pub fn invert(&self) -> Operation {
        match self {
            Operation::Insert { position, text } => Operation::Delete {
                position: *position,
                length: text.chars().count(),
                removed_text: text.clone(),
            },
            Operation::Delete {
                position,
                removed_text,
                ..
            } => Operation::Insert {
                position: *position,
                text: removed_text.clone(),
            },
            Operation::Replace {
                position,
                text,
                removed_text,
                ..
            } => Operation::Replace {
                position: *position,
                length: text.chars().count(),
                text: removed_text.clone(),
                removed_text: text.clone(),
            },
        }
    }

    /// Half-open interval this operation reads or writes:
    /// `[position, position + max(length, len(text)))`.
    ///
    /// Offsets come straight from clients and are not bounds-checked here;
    /// the end saturates at `usize::MAX`.
    pub fn affected_range(&self) -> Range<usize> {
        let position = self.position();
        let span = self.length().max(self.text().chars().count());
        position..position.saturating_add(span)
    }
}

/// Half-open interval intersection: `a0 < b1 && b0 < a1`.
///
/// Empty ranges (an empty insert, a zero-length delete) touch no text and
/// never overlap anything.
pub fn ranges_overlap(a: &Range<usize>, b: &Range<usize>) -> bool {
    !a.is_empty() && !b.is_empty() && a.start < b.end && b.start < a.end
}

/// Byte offset of the `char_index`-th character; `content.len()` at the end.
///
/// Callers must have bounds-checked `char_index <= content.chars().count()`.
fn byte_offset(content: &str, char_index: usize) -> usize {
    content
        .char_indices()
        .nth(char_index)
        .map_or(content.len(), |(offset, _)| offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(content: &str, op: Operation) {
        let (applied, concrete) = op.apply_to(content).unwrap();
        let (restored, _) = concrete.invert().apply_to(&applied).unwrap();
        assert_eq!(restored, content, "inverse of {op:?} did not restore content");
    }

    #[test]
    fn test_insert_in_middle() {
        let (content, concrete) = Operation::insert(1, "X").apply_to("abc").unwrap();
        assert_eq!(content, "aXbc");
        assert_eq!(concrete.removed_text(), "");
    }

    #[test]
    fn test_insert_at_end() {
        let (content, _) = Operation::insert(3, "d").apply_to("abc").unwrap();
        assert_eq!(content, "abcd");
    }

    #[test]
    fn test_delete_captures_removed_text() {
        let (content, concrete) = Operation::delete(4, 7).apply_to("hello there").unwrap();
        assert_eq!(content, "hell");
        assert_eq!(concrete.removed_text(), "o there");
    }

    #[test]
    fn test_replace_captures_removed_text() {
        let (content, concrete) = Operation::replace(0, 5, "Goodbye")
            .apply_to("Hello world")
            .unwrap();
        assert_eq!(content, "Goodbye world");
        assert_eq!(concrete.removed_text(), "Hello");
    }

    #[test]
    fn test_client_removed_text_is_ignored() {
        let forged = Operation::Delete {
            position: 0,
            length: 2,
            removed_text: "zz".into(),
        };
        let (_, concrete) = forged.apply_to("abc").unwrap();
        assert_eq!(concrete.removed_text(), "ab");
    }

    #[test]
    fn test_out_of_range_rejected() {
        let err = Operation::delete(2, 5).apply_to("abc").unwrap_err();
        assert_eq!(
            err,
            EditError::InvalidRange {
                position: 2,
                length: 5,
                content_len: 3
            }
        );
        assert!(Operation::insert(4, "x").apply_to("abc").is_err());
        assert!(Operation::replace(3, 1, "x").apply_to("abc").is_err());
    }

    #[test]
    fn test_huge_length_does_not_overflow() {
        assert!(Operation::delete(1, usize::MAX).apply_to("abc").is_err());
    }

    #[test]
    fn test_multibyte_positions_are_characters() {
        let (content, concrete) = Operation::replace(1, 2, "ö").apply_to("h€łlo").unwrap();
        assert_eq!(content, "hölo");
        assert_eq!(concrete.removed_text(), "€ł");

        let (content, _) = Operation::insert(2, "🔄").apply_to("日本語").unwrap();
        assert_eq!(content, "日本🔄語");
    }

    #[test]
    fn test_inverse_restores_content() {
        roundtrip("abc", Operation::insert(1, "X"));
        roundtrip("abc", Operation::insert(0, ""));
        roundtrip("hello there", Operation::delete(4, 7));
        roundtrip("Hello world test", Operation::replace(3, 5, "CONFLICT"));
        roundtrip("Hello world", Operation::replace(0, 5, ""));
        roundtrip("日本語テキスト", Operation::replace(2, 3, "🔄🔄"));
    }

    #[test]
    fn test_invert_shapes() {
        let inverse = Operation::insert(2, "xyz").invert();
        assert_eq!(inverse.op_type(), OpType::Delete);
        assert_eq!(inverse.position(), 2);
        assert_eq!(inverse.length(), 3);

        let (_, concrete) = Operation::replace(0, 3, "Hi").apply_to("Hey you").unwrap();
        let inverse = concrete.invert();
        assert_eq!(inverse.length(), 2);
        assert_eq!(inverse.text(), "Hey");
    }

    #[test]
    fn test_affected_range() {
        assert_eq!(Operation::insert(21, " Admin edit.").affected_range(), 21..33);
        assert_eq!(Operation::delete(4, 7).affected_range(), 4..11);
        assert_eq!(Operation::replace(0, 5, "Goodbye").affected_range(), 0..7);
        assert_eq!(Operation::replace(3, 5, "CONFLICT").affected_range(), 3..11);
        assert!(Operation::insert(5, "").affected_range().is_empty());
    }

    #[test]
    fn test_affected_range_saturates() {
        assert_eq!(Operation::insert(usize::MAX, "x").affected_range(), usize::MAX..usize::MAX);
        assert_eq!(Operation::delete(usize::MAX - 1, 10).affected_range(), usize::MAX - 1..usize::MAX);

        let err = Operation::insert(usize::MAX, "x").apply_to("abc").unwrap_err();
        assert!(matches!(err, EditError::InvalidRange { content_len: 3, .. }));
    }

    #[test]
    fn test_ranges_overlap() {
        assert!(ranges_overlap(&(0..7), &(3..11)));
        assert!(!ranges_overlap(&(0..7), &(21..33)));
        // Touching half-open intervals do not intersect.
        assert!(!ranges_overlap(&(0..5), &(5..9)));
        // Empty ranges never intersect, even strictly inside another.
        assert!(!ranges_overlap(&(4..4), &(0..10)));
        assert!(!ranges_overlap(&(0..10), &(4..4)));
        assert!(!ranges_overlap(&(0..0), &(0..0)));
    }

    #[test]
    fn test_payload_conversion() {
        let op: Operation = OpPayload {
            op_type: OpType::Insert,
            position: 1,
            length: 9,
            text: "X".into(),
        }
        .into();
        assert_eq!(op, Operation::insert(1, "X"));
        assert_eq!(op.length(), 0);

        let op: Operation = OpPayload::replace(3, 5, "CONFLICT").into();
        assert_eq!(op.to_payload(), OpPayload::replace(3, 5, "CONFLICT"));
    }

    #[test]
    fn test_payload_json_shape() {
        let payload: OpPayload =
            serde_json::from_str(r#"{"op_type":"insert","position":1,"text":"X"}"#).unwrap();
        assert_eq!(payload, OpPayload::insert(1, "X"));
        assert_eq!(payload.op_type.as_str(), "insert");
    }
}
