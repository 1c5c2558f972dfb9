//! Request/response surface of the engine.
//!
//! Every call is checked against [`MembershipCheck`] before any hub is
//! touched, then serialized through the note's hub. Callers pass an
//! already verified [`AuthContext`]; turning tokens into identities is the
//! transport's job.

use std::sync::Arc;

use notes_core::{OpPayload, SyncRequest, SyncResult};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::{AuthContext, MembershipCheck};
use crate::broadcast::HubRegistry;
use crate::error::CollabError;
use crate::hub::{AppliedEdit, HubCommand, HubDeps, HubHandle, HubStats, SessionRequest};
use crate::presence::PresenceCursor;
use crate::protocol::{DocumentState, HistoryEvent, ServerMessage};

#[derive(Clone)]
pub struct CollabService {
    registry: HubRegistry,
    membership: Arc<dyn MembershipCheck>,
}

impl CollabService {
    pub fn new(deps: HubDeps, membership: Arc<dyn MembershipCheck>) -> Self {
        Self {
            registry: HubRegistry::new(deps),
            membership,
        }
    }

    pub fn registry(&self) -> &HubRegistry {
        &self.registry
    }

    fn authorize(&self, note_id: Uuid, ctx: &AuthContext) -> Result<(), CollabError> {
        if self.membership.is_member(note_id, ctx.user_id) {
            Ok(())
        } else {
            log::warn!("User {} denied access to note {note_id}", ctx.user_id);
            Err(CollabError::NotMember {
                note_id,
                user_id: ctx.user_id,
            })
        }
    }

    /// Seed a note in the content store. Existing notes are left as they are.
    pub fn create_note(&self, note_id: Uuid, content: &str) -> Result<DocumentState, CollabError> {
        let document = self.registry.deps().content.create(note_id, content)?;
        Ok(DocumentState {
            content: document.content,
            version: document.version,
        })
    }

    /// Open a live session. The first message on the returned handle is
    /// the `presence_list` for this session.
    pub async fn join(&self, note_id: Uuid, ctx: AuthContext) -> Result<SessionHandle, CollabError> {
        self.authorize(note_id, &ctx)?;

        let (tx, rx) = mpsc::channel(self.registry.deps().config.outbound_capacity);
        let (hub, ack) = self
            .registry
            .request_with_hub(note_id, |reply| HubCommand::Join {
                ctx: ctx.clone(),
                outbound: tx.clone(),
                reply,
            })
            .await?;
        let ack = ack?;
        drop(tx);

        Ok(SessionHandle {
            session_id: ack.session_id,
            note_id,
            user: ctx,
            hub,
            outbound: rx,
            left: false,
        })
    }

    pub async fn apply_edit(
        &self,
        note_id: Uuid,
        ctx: &AuthContext,
        payload: OpPayload,
    ) -> Result<AppliedEdit, CollabError> {
        self.authorize(note_id, ctx)?;
        let author = ctx.user_id;
        self.registry
            .request_result(note_id, |reply| HubCommand::Apply {
                author,
                payload: payload.clone(),
                reply,
            })
            .await
    }

    /// Undo the caller's most recent edit. Nothing to undo is not an error.
    pub async fn undo(&self, note_id: Uuid, ctx: &AuthContext) -> Result<DocumentState, CollabError> {
        self.authorize(note_id, ctx)?;
        let user_id = ctx.user_id;
        self.registry
            .request_result(note_id, |reply| HubCommand::Undo { user_id, reply })
            .await
    }

    pub async fn redo(&self, note_id: Uuid, ctx: &AuthContext) -> Result<DocumentState, CollabError> {
        self.authorize(note_id, ctx)?;
        let user_id = ctx.user_id;
        self.registry
            .request_result(note_id, |reply| HubCommand::Redo { user_id, reply })
            .await
    }

    pub async fn history(&self, note_id: Uuid, ctx: &AuthContext) -> Result<Vec<HistoryEvent>, CollabError> {
        self.authorize(note_id, ctx)?;
        self.registry
            .request(note_id, |reply| HubCommand::History { reply })
            .await
    }

    /// Reconcile an offline batch. A conflicting batch still succeeds with
    /// `conflict` set; only a range failure part-way returns an error.
    pub async fn sync(
        &self,
        note_id: Uuid,
        ctx: &AuthContext,
        request: SyncRequest,
    ) -> Result<SyncResult, CollabError> {
        self.authorize(note_id, ctx)?;
        self.registry
            .request_result(note_id, |reply| HubCommand::Sync {
                ctx: ctx.clone(),
                request: request.clone(),
                reply,
            })
            .await
    }

    pub async fn snapshot(&self, note_id: Uuid, ctx: &AuthContext) -> Result<DocumentState, CollabError> {
        self.authorize(note_id, ctx)?;
        self.registry
            .request(note_id, |reply| HubCommand::Snapshot { reply })
            .await
    }

    /// Stats of the note's live hub; `None` when no hub is running.
    pub async fn hub_stats(&self, note_id: Uuid) -> Option<HubStats> {
        let hub = self.registry.get(&note_id).await?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        hub.send(HubCommand::Stats { reply: tx }).await.ok()?;
        rx.await.ok()
    }

    pub async fn live_notes(&self) -> usize {
        self.registry.hub_count().await
    }
}

/// A joined live session.
///
/// Dropping the handle without [`SessionHandle::leave`] still removes the
/// session: a best-effort `Leave` is queued, and failing that the hub
/// evicts the session once its queue reports closed.
pub struct SessionHandle {
    session_id: Uuid,
    note_id: Uuid,
    user: AuthContext,
    hub: HubHandle,
    outbound: mpsc::Receiver<Arc<ServerMessage>>,
    left: bool,
}

impl SessionHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn note_id(&self) -> Uuid {
        self.note_id
    }

    pub fn user(&self) -> &AuthContext {
        &self.user
    }

    /// Next message for this session; `None` once the hub dropped it.
    pub async fn recv(&mut self) -> Option<Arc<ServerMessage>> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<ServerMessage>> {
        self.outbound.try_recv().ok()
    }

    pub async fn edit(&self, payload: OpPayload) -> Result<(), CollabError> {
        self.send(HubCommand::Edit {
            session_id: self.session_id,
            payload,
        })
        .await
    }

    pub async fn presence(&self, cursor: PresenceCursor) -> Result<(), CollabError> {
        self.send(HubCommand::Presence {
            session_id: self.session_id,
            cursor,
        })
        .await
    }

    /// Undo, redo, sync or history; the reply arrives on this session's
    /// queue after any broadcast the request caused.
    pub async fn request(&self, request: SessionRequest) -> Result<(), CollabError> {
        self.send(HubCommand::Request {
            session_id: self.session_id,
            request,
        })
        .await
    }

    pub async fn leave(mut self) {
        self.left = true;
        let _ = self
            .hub
            .send(HubCommand::Leave {
                session_id: self.session_id,
            })
            .await;
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), CollabError> {
        self.hub
            .send(cmd)
            .await
            .map_err(|_| CollabError::HubClosed(self.note_id))
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.left
            && !self.hub.try_send(HubCommand::Leave {
                session_id: self.session_id,
            })
        {
            log::debug!("Session {} dropped without queuing leave", self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{OpenMembership, StaticMembership};
    use crate::hub::HubConfig;
    use crate::storage::MemoryStore;

    fn service_with(membership: Arc<dyn MembershipCheck>) -> (CollabService, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let note = Uuid::new_v4();
        store.insert_note(note, "abc");
        let deps = HubDeps::new(store.clone(), store, HubConfig::default());
        (CollabService::new(deps, membership), note)
    }

    #[tokio::test]
    async fn test_non_member_is_rejected_before_hub() {
        let (service, note) = service_with(Arc::new(StaticMembership::new()));
        let ctx = AuthContext::new(Uuid::new_v4(), "mallory");

        let err = service
            .apply_edit(note, &ctx, OpPayload::insert(0, "x"))
            .await
            .unwrap_err();
        assert_eq!(err, CollabError::NotMember { note_id: note, user_id: ctx.user_id });
        assert!(service.join(note, ctx.clone()).await.is_err());
        assert_eq!(service.live_notes().await, 0);
    }

    #[tokio::test]
    async fn test_apply_edit_returns_document() {
        let (service, note) = service_with(Arc::new(OpenMembership));
        let ctx = AuthContext::new(Uuid::new_v4(), "alice");

        let applied = service
            .apply_edit(note, &ctx, OpPayload::insert(1, "X"))
            .await
            .unwrap();
        assert_eq!(applied.document.content, "aXbc");
        assert_eq!(applied.document.version, 1);
        assert_eq!(applied.entry.author_id, ctx.user_id);
    }

    #[tokio::test]
    async fn test_invalid_range_leaves_document() {
        let (service, note) = service_with(Arc::new(OpenMembership));
        let ctx = AuthContext::new(Uuid::new_v4(), "alice");

        let err = service
            .apply_edit(note, &ctx, OpPayload::replace(2, 5, "zz"))
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::InvalidRange(_)));
        assert_eq!(service.snapshot(note, &ctx).await.unwrap().content, "abc");
    }

    #[tokio::test]
    async fn test_unknown_note() {
        let (service, _) = service_with(Arc::new(OpenMembership));
        let ctx = AuthContext::new(Uuid::new_v4(), "alice");
        let missing = Uuid::new_v4();
        assert_eq!(
            service.snapshot(missing, &ctx).await.unwrap_err(),
            CollabError::NoteNotFound(missing)
        );
    }

    #[tokio::test]
    async fn test_create_note_then_edit() {
        let (service, _) = service_with(Arc::new(OpenMembership));
        let ctx = AuthContext::new(Uuid::new_v4(), "alice");
        let note = Uuid::new_v4();

        assert_eq!(service.create_note(note, "fresh").unwrap().version, 0);
        let applied = service
            .apply_edit(note, &ctx, OpPayload::insert(5, "!"))
            .await
            .unwrap();
        assert_eq!(applied.document.content, "fresh!");
    }

    #[tokio::test]
    async fn test_dropped_session_leaves() {
        let (service, note) = service_with(Arc::new(OpenMembership));
        let session = service
            .join(note, AuthContext::new(Uuid::new_v4(), "alice"))
            .await
            .unwrap();
        assert_eq!(service.hub_stats(note).await.unwrap().sessions, 1);

        drop(session);
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            service.registry().wait_retired(note),
        )
        .await
        .unwrap();
        assert!(service.hub_stats(note).await.is_none());
    }
}
