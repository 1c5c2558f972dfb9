use notes_core::EditError;
use thiserror::Error;
use uuid::Uuid;

use crate::auth::AuthError;
use crate::protocol::ErrorKind;
use crate::storage::StoreError;

/// Errors surfaced by the collaboration service and hubs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("User {user_id} is not a member of note {note_id}")]
    NotMember { note_id: Uuid, user_id: Uuid },

    #[error("Note not found: {0}")]
    NoteNotFound(Uuid),

    #[error(transparent)]
    InvalidRange(#[from] EditError),

    #[error("Storage error: {0}")]
    Store(StoreError),

    #[error("Note {note_id} already has {limit} live sessions")]
    SessionLimit { note_id: Uuid, limit: usize },

    #[error("Hub for note {0} is unavailable")]
    HubClosed(Uuid),

    #[error("Offline batch stopped after {applied} applied operation(s): {source}")]
    PartialSync {
        applied: usize,
        #[source]
        source: EditError,
    },
}

impl CollabError {
    /// Category reported to clients over the live channel.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CollabError::Unauthorized(_) => ErrorKind::Unauthorized,
            CollabError::NotMember { .. } => ErrorKind::NotMember,
            CollabError::NoteNotFound(_) => ErrorKind::NoteNotFound,
            CollabError::InvalidRange(_) | CollabError::PartialSync { .. } => ErrorKind::InvalidRange,
            CollabError::SessionLimit { .. } => ErrorKind::SessionLimit,
            CollabError::Store(_) | CollabError::HubClosed(_) => ErrorKind::Internal,
        }
    }
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => CollabError::NoteNotFound(id),
            other => CollabError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_maps_to_note_not_found() {
        let id = Uuid::new_v4();
        assert_eq!(CollabError::from(StoreError::NotFound(id)), CollabError::NoteNotFound(id));
        assert!(matches!(
            CollabError::from(StoreError::Database("io".into())),
            CollabError::Store(_)
        ));
    }

    #[test]
    fn test_error_kinds() {
        let range = EditError::InvalidRange {
            position: 9,
            length: 1,
            content_len: 3,
        };
        assert_eq!(CollabError::from(range.clone()).kind(), ErrorKind::InvalidRange);
        assert_eq!(
            CollabError::PartialSync { applied: 1, source: range }.kind(),
            ErrorKind::InvalidRange
        );
        assert_eq!(CollabError::from(AuthError::InvalidToken).kind(), ErrorKind::Unauthorized);
        assert_eq!(CollabError::HubClosed(Uuid::nil()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_invalid_range_message_is_transparent() {
        let err = CollabError::from(EditError::InvalidRange {
            position: 5,
            length: 2,
            content_len: 3,
        });
        assert!(err.to_string().contains("position 5"));
    }
}
