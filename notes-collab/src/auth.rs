//! Identity and membership seams.
//!
//! Token verification and workspace membership belong to the surrounding
//! application. The engine only needs a verified `(user_id, username)` for
//! a token and a yes/no answer for "may this user touch this note".

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use thiserror::Error;
use uuid::Uuid;

/// Verified identity of a connected user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub username: String,
}

impl AuthContext {
    pub fn new(user_id: Uuid, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Malformed token table entry: {0}")]
    MalformedEntry(String),
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<AuthContext, AuthError>;
}

pub trait MembershipCheck: Send + Sync {
    fn is_member(&self, note_id: Uuid, user_id: Uuid) -> bool;
}

/// Fixed token table.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    tokens: RwLock<HashMap<String, AuthContext>>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, ctx: AuthContext) {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.into(), ctx);
    }

    /// Parse `token=user_uuid:username` entries separated by commas.
    pub fn parse(table: &str) -> Result<Self, AuthError> {
        let auth = Self::new();
        for item in table.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let malformed = || AuthError::MalformedEntry(item.to_string());
            let (token, identity) = item.split_once('=').ok_or_else(malformed)?;
            let (user, username) = identity.split_once(':').ok_or_else(malformed)?;
            let user_id = Uuid::parse_str(user.trim()).map_err(|_| malformed())?;
            if token.trim().is_empty() || username.trim().is_empty() {
                return Err(malformed());
            }
            auth.insert(token.trim(), AuthContext::new(user_id, username.trim()));
        }
        Ok(auth)
    }

    pub fn len(&self) -> usize {
        self.tokens.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, token: &str) -> Result<AuthContext, AuthError> {
        self.tokens
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// Explicit `(note, user)` grants.
#[derive(Debug, Default)]
pub struct StaticMembership {
    grants: RwLock<HashSet<(Uuid, Uuid)>>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, note_id: Uuid, user_id: Uuid) {
        self.grants
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((note_id, user_id));
    }

    pub fn revoke(&self, note_id: Uuid, user_id: Uuid) {
        self.grants
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(note_id, user_id));
    }
}

impl MembershipCheck for StaticMembership {
    fn is_member(&self, note_id: Uuid, user_id: Uuid) -> bool {
        self.grants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(note_id, user_id))
    }
}

/// Every authenticated user may open every note.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenMembership;

impl MembershipCheck for OpenMembership {
    fn is_member(&self, _note_id: Uuid, _user_id: Uuid) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_authenticator() {
        let auth = StaticAuthenticator::new();
        let user = Uuid::new_v4();
        auth.insert("secret", AuthContext::new(user, "alice"));

        let ctx = auth.authenticate("secret").unwrap();
        assert_eq!(ctx.user_id, user);
        assert_eq!(ctx.username, "alice");
        assert_eq!(auth.authenticate("wrong"), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_parse_token_table() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let auth = StaticAuthenticator::parse(&format!("t1={a}:alice, t2={b}:bob,")).unwrap();

        assert_eq!(auth.len(), 2);
        assert_eq!(auth.authenticate("t2").unwrap(), AuthContext::new(b, "bob"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            StaticAuthenticator::parse("t1=not-a-uuid:alice"),
            Err(AuthError::MalformedEntry(_))
        ));
        assert!(StaticAuthenticator::parse("missing-separator").is_err());
        assert!(StaticAuthenticator::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_static_membership() {
        let members = StaticMembership::new();
        let note = Uuid::new_v4();
        let user = Uuid::new_v4();

        assert!(!members.is_member(note, user));
        members.grant(note, user);
        assert!(members.is_member(note, user));
        assert!(!members.is_member(Uuid::new_v4(), user));
        members.revoke(note, user);
        assert!(!members.is_member(note, user));
    }

    #[test]
    fn test_open_membership() {
        assert!(OpenMembership.is_member(Uuid::new_v4(), Uuid::new_v4()));
    }
}
