//! The per-note session hub.
//!
//! One tokio task owns everything mutable about a live note: its
//! [`EditLog`] (content, version, per-user stacks) and its
//! [`SessionGroup`]. All mutation arrives as [`HubCommand`]s on one bounded
//! channel and is handled to completion before the next command is read,
//! so edits are applied, persisted and broadcast in a single FIFO order.
//!
//! ```text
//!  sessions ──edit/presence/leave──┐
//!                                  ▼
//!  service ──apply/undo/sync──► [mpsc] ──► NoteHub ──► EditLog
//!                                              │
//!                                              ├──► ContentStore (save, append_event)
//!                                              ├──► PresenceStore
//!                                              └──► SessionGroup ──► per-session queues
//! ```
//!
//! The hub retires as soon as it has no sessions after handling a command
//! and the store holds every entry it applied: it flushes the note's
//! presence rows, removes itself from the registry, closes its channel and
//! drops whatever was still queued. Dropped requests lose their reply
//! sender and are replayed by the registry on a fresh hub, which reloads
//! state from the store. Entries the store refused stay queued on the hub
//! and keep it live until a retry succeeds.

use std::collections::VecDeque;
use std::sync::Arc;

use notes_core::{
    reconcile, EditError, EditLog, EditLogEntry, NoteDocument, OpPayload, Operation, SyncRequest,
    SyncResult, UndoOutcome,
};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::broadcast::{BroadcastStats, HubTable, Outbound, SessionGroup};
use crate::error::CollabError;
use crate::presence::{PresenceCursor, PresenceEntry};
use crate::protocol::{DocumentState, ErrorKind, HistoryEvent, ServerMessage};
use crate::storage::{ContentStore, PresenceStore};

/// Per-hub limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    pub max_sessions: usize,
    pub command_capacity: usize,
    /// Outbound queue length of each session.
    pub outbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            command_capacity: 1024,
            outbound_capacity: 256,
        }
    }
}

/// Collaborators shared by every hub.
#[derive(Clone)]
pub struct HubDeps {
    pub content: Arc<dyn ContentStore>,
    pub presence: Arc<dyn PresenceStore>,
    pub config: HubConfig,
}

impl HubDeps {
    pub fn new(content: Arc<dyn ContentStore>, presence: Arc<dyn PresenceStore>, config: HubConfig) -> Self {
        Self {
            content,
            presence,
            config,
        }
    }
}

/// Result of a successful join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinAck {
    pub session_id: Uuid,
}

/// An applied edit as seen by the caller that submitted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEdit {
    pub entry: EditLogEntry,
    pub document: DocumentState,
}

/// Snapshot of a live hub for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubStats {
    pub hub_id: Uuid,
    pub note_id: Uuid,
    pub version: u64,
    pub log_len: usize,
    pub sessions: usize,
    pub broadcast: BroadcastStats,
}

/// Requests a live session makes over its own connection. Replies are
/// queued behind any broadcast the request caused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    Undo,
    Redo,
    Sync(SyncRequest),
    History,
}

type Reply<T> = oneshot::Sender<Result<T, CollabError>>;

pub enum HubCommand {
    Join {
        ctx: AuthContext,
        outbound: Outbound,
        reply: Reply<JoinAck>,
    },
    Leave {
        session_id: Uuid,
    },
    Edit {
        session_id: Uuid,
        payload: OpPayload,
    },
    Presence {
        session_id: Uuid,
        cursor: PresenceCursor,
    },
    Request {
        session_id: Uuid,
        request: SessionRequest,
    },
    Apply {
        author: Uuid,
        payload: OpPayload,
        reply: Reply<AppliedEdit>,
    },
    Undo {
        user_id: Uuid,
        reply: Reply<DocumentState>,
    },
    Redo {
        user_id: Uuid,
        reply: Reply<DocumentState>,
    },
    Sync {
        ctx: AuthContext,
        request: SyncRequest,
        reply: Reply<SyncResult>,
    },
    History {
        reply: oneshot::Sender<Vec<HistoryEvent>>,
    },
    Snapshot {
        reply: oneshot::Sender<DocumentState>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Sending side of a hub's command channel.
#[derive(Debug, Clone)]
pub struct HubHandle {
    hub_id: Uuid,
    note_id: Uuid,
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub fn hub_id(&self) -> Uuid {
        self.hub_id
    }

    pub fn note_id(&self) -> Uuid {
        self.note_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn send(&self, cmd: HubCommand) -> Result<(), SendError<HubCommand>> {
        self.tx.send(cmd).await
    }

    /// Best-effort send that never waits; used from `Drop`.
    pub(crate) fn try_send(&self, cmd: HubCommand) -> bool {
        self.tx.try_send(cmd).is_ok()
    }
}

/// Read a note and its history from storage.
///
/// Blocking. Also drops presence rows left behind by a previous process,
/// so it must only run while no hub for the note is registered.
pub(crate) fn load(note_id: Uuid, deps: &HubDeps) -> Result<EditLog, CollabError> {
    let document = deps.content.load(note_id)?;
    let events = deps.content.load_events(note_id)?;
    let log = EditLog::restore(note_id, document, events);

    match deps.presence.clear(note_id) {
        Ok(0) => {}
        Ok(n) => log::debug!("Cleared {n} stale presence row(s) for note {note_id}"),
        Err(e) => log::error!("Failed to clear presence for note {note_id}: {e}"),
    }
    Ok(log)
}

/// Start the hub task for a loaded note.
pub(crate) fn start(log: EditLog, deps: HubDeps, hubs: HubTable) -> HubHandle {
    let note_id = log.note_id();
    let (tx, rx) = mpsc::channel(deps.config.command_capacity);
    let hub_id = Uuid::new_v4();
    log::info!("Spawned hub {hub_id} for note {note_id} at version {}", log.version());

    let hub = NoteHub {
        hub_id,
        note_id,
        log,
        sessions: SessionGroup::new(),
        unpersisted: VecDeque::new(),
        snapshot_dirty: false,
        deps,
        hubs,
    };
    tokio::spawn(hub.run(rx));

    HubHandle { hub_id, note_id, tx }
}

struct NoteHub {
    hub_id: Uuid,
    note_id: Uuid,
    log: EditLog,
    sessions: SessionGroup,
    /// Entries the store refused, oldest first.
    unpersisted: VecDeque<EditLogEntry>,
    snapshot_dirty: bool,
    deps: HubDeps,
    hubs: HubTable,
}

impl NoteHub {
    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd);
            if self.sessions.is_empty() {
                if self.flush_pending() {
                    break;
                }
                log::warn!(
                    "Hub {} for note {} holds {} unsaved entr(ies), staying live",
                    self.hub_id,
                    self.note_id,
                    self.unpersisted.len()
                );
            }
        }
        self.retire(rx).await;
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Join { ctx, outbound, reply } => {
                let _ = reply.send(self.join(ctx, outbound));
            }
            HubCommand::Leave { session_id } => self.remove_sessions(vec![session_id], false),
            HubCommand::Edit { session_id, payload } => self.session_edit(session_id, payload),
            HubCommand::Presence { session_id, cursor } => self.presence(session_id, cursor),
            HubCommand::Request { session_id, request } => self.session_request(session_id, request),
            HubCommand::Apply { author, payload, reply } => {
                let result = self
                    .apply(author, &Operation::from(payload))
                    .map(|entry| AppliedEdit {
                        entry,
                        document: self.document_state(),
                    })
                    .map_err(CollabError::from);
                let _ = reply.send(result);
            }
            HubCommand::Undo { user_id, reply } => {
                let _ = reply.send(self.undo(user_id).map_err(CollabError::from));
            }
            HubCommand::Redo { user_id, reply } => {
                let _ = reply.send(self.redo(user_id).map_err(CollabError::from));
            }
            HubCommand::Sync { ctx, request, reply } => {
                let _ = reply.send(self.sync(&ctx, request));
            }
            HubCommand::History { reply } => {
                let _ = reply.send(self.history());
            }
            HubCommand::Snapshot { reply } => {
                let _ = reply.send(self.document_state());
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(HubStats {
                    hub_id: self.hub_id,
                    note_id: self.note_id,
                    version: self.log.version(),
                    log_len: self.log.len(),
                    sessions: self.sessions.len(),
                    broadcast: self.sessions.stats(),
                });
            }
        }
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    fn join(&mut self, ctx: AuthContext, outbound: Outbound) -> Result<JoinAck, CollabError> {
        let limit = self.deps.config.max_sessions;
        if self.sessions.len() >= limit {
            log::warn!("Rejecting {} on note {}: {limit} sessions already live", ctx.user_id, self.note_id);
            return Err(CollabError::SessionLimit {
                note_id: self.note_id,
                limit,
            });
        }

        let session_id = Uuid::new_v4();
        let entry = PresenceEntry::new(self.note_id, session_id, ctx.user_id, ctx.username);
        if let Err(e) = self.deps.presence.upsert(&entry) {
            log::error!("Failed to store presence for session {session_id}: {e}");
        }

        let list = ServerMessage::PresenceList {
            session_id,
            document: self.document_state(),
            entries: self.sessions.entries(),
        };
        self.sessions.add(entry.clone(), outbound);
        log::info!(
            "Session {session_id} ({}) joined note {} ({} live)",
            entry.username,
            self.note_id,
            self.sessions.len()
        );

        self.send_to(session_id, list);
        self.broadcast(ServerMessage::PresenceUpdate { presence: entry });
        Ok(JoinAck { session_id })
    }

    fn presence(&mut self, session_id: Uuid, cursor: PresenceCursor) {
        let Some(entry) = self.sessions.update_cursor(&session_id, cursor).cloned() else {
            log::debug!("Presence from unknown session {session_id} on note {}", self.note_id);
            return;
        };
        log::trace!("Session {session_id} cursor at {}", entry.cursor_pos);

        if let Err(e) = self.deps.presence.upsert(&entry) {
            log::error!("Failed to store presence for session {session_id}: {e}");
        }
        self.broadcast(ServerMessage::PresenceUpdate { presence: entry });
    }

    /// Drop sessions and announce each departure. Departure broadcasts can
    /// fail for further sessions, which are evicted in the same pass.
    fn remove_sessions(&mut self, sessions: Vec<Uuid>, evicted: bool) {
        let mut pending: Vec<(Uuid, bool)> = sessions.into_iter().map(|id| (id, evicted)).collect();
        while let Some((session_id, evicted)) = pending.pop() {
            let removed = if evicted {
                self.sessions.evict(&session_id)
            } else {
                self.sessions.remove(&session_id)
            };
            let Some(entry) = removed else {
                continue;
            };
            log::info!("Session {session_id} ({}) left note {}", entry.username, self.note_id);

            // Rows are per (note, user): keep the row while another session
            // of the same user is still here.
            let row = match self.sessions.latest_for_user(&entry.user_id) {
                Some(other) => self.deps.presence.upsert(other),
                None => self.deps.presence.delete(self.note_id, entry.user_id),
            };
            if let Err(e) = row {
                log::error!("Failed to update presence for note {}: {e}", self.note_id);
            }

            let left = Arc::new(ServerMessage::PresenceLeft {
                user_id: entry.user_id,
                session_id,
            });
            let failed = self.sessions.broadcast(&left);
            if !failed.is_empty() {
                log::warn!("Evicting {} session(s) on note {}", failed.len(), self.note_id);
                pending.extend(failed.into_iter().map(|id| (id, true)));
            }
        }
    }

    fn broadcast(&mut self, msg: ServerMessage) {
        let failed = self.sessions.broadcast(&Arc::new(msg));
        if !failed.is_empty() {
            log::warn!(
                "Evicting {} slow or closed session(s) on note {}",
                failed.len(),
                self.note_id
            );
            self.remove_sessions(failed, true);
        }
    }

    fn send_to(&mut self, session_id: Uuid, msg: ServerMessage) {
        if !self.sessions.send_to(&session_id, Arc::new(msg)) {
            log::warn!("Evicting slow or closed session {session_id} on note {}", self.note_id);
            self.remove_sessions(vec![session_id], true);
        }
    }

    fn session_edit(&mut self, session_id: Uuid, payload: OpPayload) {
        let Some(author) = self.sessions.get(&session_id).map(|e| e.user_id) else {
            log::debug!("Edit from unknown session {session_id} on note {}", self.note_id);
            return;
        };
        if let Err(e) = self.apply(author, &Operation::from(payload)) {
            log::warn!("Rejected edit from session {session_id}: {e}");
            self.send_to(session_id, ServerMessage::error(ErrorKind::InvalidRange, e.to_string()));
        }
    }

    fn session_request(&mut self, session_id: Uuid, request: SessionRequest) {
        let Some(entry) = self.sessions.get(&session_id).cloned() else {
            log::debug!("Request from unknown session {session_id} on note {}", self.note_id);
            return;
        };
        log::debug!("Session {session_id} requested {request:?}");

        let user = AuthContext::new(entry.user_id, entry.username);
        let reply = match request {
            SessionRequest::Undo => self.undo(user.user_id).map_err(CollabError::from),
            SessionRequest::Redo => self.redo(user.user_id).map_err(CollabError::from),
            SessionRequest::Sync(req) => {
                let reply = match self.sync(&user, req) {
                    Ok(result) => ServerMessage::SyncResult { result },
                    Err(e) => ServerMessage::error(e.kind(), e.to_string()),
                };
                self.send_to(session_id, reply);
                return;
            }
            SessionRequest::History => {
                let events = self.history();
                self.send_to(session_id, ServerMessage::History { events });
                return;
            }
        };

        let msg = match reply {
            Ok(document) => ServerMessage::Document { document },
            Err(e) => ServerMessage::error(e.kind(), e.to_string()),
        };
        self.send_to(session_id, msg);
    }

    // ─── Edits ────────────────────────────────────────────────────────

    fn apply(&mut self, author: Uuid, op: &Operation) -> Result<EditLogEntry, EditError> {
        let base = self.log.content().to_string();
        let entry = self.log.append_edit(author, op)?;
        self.publish(base, std::slice::from_ref(&entry));
        Ok(entry)
    }

    fn undo(&mut self, user_id: Uuid) -> Result<DocumentState, EditError> {
        let base = self.log.content().to_string();
        match self.log.undo(user_id)? {
            UndoOutcome::Applied(entry) => self.publish(base, std::slice::from_ref(&entry)),
            UndoOutcome::NoOp => log::debug!("Nothing to undo for {user_id} on note {}", self.note_id),
        }
        Ok(self.document_state())
    }

    fn redo(&mut self, user_id: Uuid) -> Result<DocumentState, EditError> {
        let base = self.log.content().to_string();
        match self.log.redo(user_id)? {
            UndoOutcome::Applied(entry) => self.publish(base, std::slice::from_ref(&entry)),
            UndoOutcome::NoOp => log::debug!("Nothing to redo for {user_id} on note {}", self.note_id),
        }
        Ok(self.document_state())
    }

    fn sync(&mut self, ctx: &AuthContext, request: SyncRequest) -> Result<SyncResult, CollabError> {
        let operations: Vec<Operation> = request.operations.into_iter().map(Operation::from).collect();
        let base = self.log.content().to_string();

        match reconcile(
            &mut self.log,
            ctx.user_id,
            &ctx.username,
            request.last_known_version,
            &operations,
        ) {
            Ok(outcome) => {
                self.publish(base, &outcome.entries);
                log::info!(
                    "Synced {} offline op(s) from {} on note {} (conflict: {})",
                    operations.len(),
                    ctx.username,
                    self.note_id,
                    outcome.result.conflict
                );
                Ok(outcome.result)
            }
            Err(err) => {
                log::warn!("Offline batch from {} on note {} failed: {err}", ctx.username, self.note_id);
                self.publish(base, &err.committed);
                Err(CollabError::PartialSync {
                    applied: err.committed.len(),
                    source: err.source,
                })
            }
        }
    }

    /// Persist and broadcast freshly appended entries. `base` is the
    /// content before the first of them; each broadcast carries the
    /// content as of its own entry.
    fn publish(&mut self, base: String, entries: &[EditLogEntry]) {
        self.flush_pending();

        let mut content = base;
        for entry in entries {
            content = match entry.op.apply_to(&content) {
                Ok((next, _)) => next,
                Err(_) => self.log.content().to_string(),
            };
            self.persist(entry, &content);

            log::debug!(
                "Applied #{} ({}) by {} on note {}",
                entry.sequence,
                entry.op.op_type().as_str(),
                entry.author_id,
                self.note_id
            );
            self.broadcast(ServerMessage::EditApplied {
                entry: entry.clone(),
                content: content.clone(),
                version: entry.version,
            });
        }
    }

    fn persist(&mut self, entry: &EditLogEntry, content: &str) {
        // Events land in sequence order: behind a refused one, queue the rest.
        if !self.unpersisted.is_empty() {
            self.unpersisted.push_back(entry.clone());
        } else if let Err(e) = self.deps.content.append_event(self.note_id, entry) {
            log::error!("Failed to persist entry #{} of note {}: {e}", entry.sequence, self.note_id);
            self.unpersisted.push_back(entry.clone());
        }

        let document = NoteDocument::new(content, entry.version);
        match self.deps.content.save(self.note_id, &document) {
            Ok(()) => self.snapshot_dirty = false,
            Err(e) => {
                log::error!("Failed to save note {} at version {}: {e}", self.note_id, entry.version);
                self.snapshot_dirty = true;
            }
        }
    }

    /// Retry writes the store refused earlier. `true` once it holds
    /// everything this hub applied.
    fn flush_pending(&mut self) -> bool {
        while let Some(entry) = self.unpersisted.front() {
            if let Err(e) = self.deps.content.append_event(self.note_id, entry) {
                log::error!("Still unable to persist entry #{} of note {}: {e}", entry.sequence, self.note_id);
                return false;
            }
            self.unpersisted.pop_front();
        }

        if self.snapshot_dirty {
            let document = NoteDocument::new(self.log.content(), self.log.version());
            if let Err(e) = self.deps.content.save(self.note_id, &document) {
                log::error!("Still unable to save note {}: {e}", self.note_id);
                return false;
            }
            log::info!("Note {} saved at version {} after earlier failures", self.note_id, self.log.version());
            self.snapshot_dirty = false;
        }
        true
    }

    fn history(&self) -> Vec<HistoryEvent> {
        self.log.history().map(HistoryEvent::from).collect()
    }

    fn document_state(&self) -> DocumentState {
        DocumentState {
            content: self.log.content().to_string(),
            version: self.log.version(),
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    async fn retire(self, mut rx: mpsc::Receiver<HubCommand>) {
        match self.deps.presence.clear(self.note_id) {
            Ok(n) => log::debug!("Flushed {n} presence row(s) for note {}", self.note_id),
            Err(e) => log::error!("Failed to flush presence for note {}: {e}", self.note_id),
        }

        {
            let mut hubs = self.hubs.write().await;
            if hubs.get(&self.note_id).map(HubHandle::hub_id) == Some(self.hub_id) {
                hubs.remove(&self.note_id);
            }
        }

        rx.close();
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }

        log::info!(
            "Retired hub {} for note {} at version {} ({dropped} queued command(s) replayed elsewhere)",
            self.hub_id,
            self.note_id,
            self.log.version()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::HubRegistry;
    use crate::storage::{MemoryStore, StoreError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: HubRegistry,
        note: Uuid,
    }

    fn fixture(content: &str, config: HubConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let note = Uuid::new_v4();
        store.insert_note(note, content);
        let registry = HubRegistry::new(HubDeps::new(store.clone(), store.clone(), config));
        Fixture { store, registry, note }
    }

    async fn join(f: &Fixture, name: &str, capacity: usize) -> (Uuid, AuthContext, mpsc::Receiver<Arc<ServerMessage>>) {
        let ctx = AuthContext::new(Uuid::new_v4(), name);
        let (tx, rx) = mpsc::channel(capacity);
        let ack = f
            .registry
            .request_result(f.note, |reply| HubCommand::Join {
                ctx: ctx.clone(),
                outbound: tx.clone(),
                reply,
            })
            .await
            .unwrap();
        (ack.session_id, ctx, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<Arc<ServerMessage>>) -> Arc<ServerMessage> {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for hub message")
            .expect("hub dropped the session")
    }

    #[tokio::test]
    async fn test_join_sends_list_then_update() {
        let f = fixture("abc", HubConfig::default());
        let (session_id, _, mut rx) = join(&f, "alice", 16).await;

        match &*next(&mut rx).await {
            ServerMessage::PresenceList {
                session_id: sid,
                document,
                entries,
            } => {
                assert_eq!(*sid, session_id);
                assert_eq!(document.content, "abc");
                assert!(entries.is_empty());
            }
            other => panic!("Expected presence_list, got {other:?}"),
        }
        assert_eq!(next(&mut rx).await.name(), "presence_update");
        assert_eq!(f.store.list(f.note).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_session_edit_broadcasts_and_persists() {
        let f = fixture("abc", HubConfig::default());
        let (sid, _, mut rx) = join(&f, "alice", 16).await;
        next(&mut rx).await;
        next(&mut rx).await;

        let hub = f.registry.get(&f.note).await.unwrap();
        hub.send(HubCommand::Edit {
            session_id: sid,
            payload: OpPayload::insert(1, "X"),
        })
        .await
        .unwrap();

        match &*next(&mut rx).await {
            ServerMessage::EditApplied { content, version, .. } => {
                assert_eq!(content, "aXbc");
                assert_eq!(*version, 1);
            }
            other => panic!("Expected edit_applied, got {other:?}"),
        }
        assert_eq!(f.store.load(f.note).unwrap().content, "aXbc");
        assert_eq!(f.store.event_count(f.note), 1);
    }

    #[tokio::test]
    async fn test_invalid_session_edit_errors_only_to_origin() {
        let f = fixture("abc", HubConfig::default());
        let (alice, _, mut alice_rx) = join(&f, "alice", 16).await;
        let (_bob, _, mut bob_rx) = join(&f, "bob", 16).await;
        while alice_rx.try_recv().is_ok() {}
        while bob_rx.try_recv().is_ok() {}

        let hub = f.registry.get(&f.note).await.unwrap();
        hub.send(HubCommand::Edit {
            session_id: alice,
            payload: OpPayload::delete(2, 10),
        })
        .await
        .unwrap();

        match &*next(&mut alice_rx).await {
            ServerMessage::Error { kind, .. } => assert_eq!(*kind, ErrorKind::InvalidRange),
            other => panic!("Expected error, got {other:?}"),
        }

        let stats = f
            .registry
            .request(f.note, |reply| HubCommand::Stats { reply })
            .await
            .unwrap();
        assert_eq!(stats.version, 0);
        assert_eq!(stats.sessions, 2);
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_limit() {
        let f = fixture(
            "",
            HubConfig {
                max_sessions: 1,
                ..HubConfig::default()
            },
        );
        let (_sid, _, _rx) = join(&f, "alice", 16).await;

        let (tx, _rx2) = mpsc::channel(16);
        let err = f
            .registry
            .request_result(f.note, |reply| HubCommand::Join {
                ctx: AuthContext::new(Uuid::new_v4(), "bob"),
                outbound: tx.clone(),
                reply,
            })
            .await
            .unwrap_err();
        assert_eq!(err, CollabError::SessionLimit { note_id: f.note, limit: 1 });
    }

    #[tokio::test]
    async fn test_slow_session_is_evicted() {
        let f = fixture("abc", HubConfig::default());
        // Room for presence_list and one presence_update only.
        let (slow, slow_ctx, _slow_rx) = join(&f, "slow", 2).await;
        let (_fast, _, mut fast_rx) = join(&f, "fast", 64).await;
        next(&mut fast_rx).await;
        next(&mut fast_rx).await;

        let stats = f
            .registry
            .request(f.note, |reply| HubCommand::Stats { reply })
            .await
            .unwrap();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.broadcast.sessions_evicted, 1);

        match &*next(&mut fast_rx).await {
            ServerMessage::PresenceLeft { user_id, session_id } => {
                assert_eq!(*user_id, slow_ctx.user_id);
                assert_eq!(*session_id, slow);
            }
            other => panic!("Expected presence_left, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_last_leave_retires_and_flushes_presence() {
        let f = fixture("abc", HubConfig::default());
        let (sid, _, _rx) = join(&f, "alice", 16).await;
        let hub = f.registry.get(&f.note).await.unwrap();

        hub.send(HubCommand::Leave { session_id: sid }).await.unwrap();
        timeout(Duration::from_secs(2), f.registry.wait_retired(f.note))
            .await
            .unwrap();

        assert!(f.store.list(f.note).unwrap().is_empty());
        assert_eq!(f.registry.hub_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_survives_retirement() {
        let f = fixture("abc", HubConfig::default());
        let user = Uuid::new_v4();

        // No sessions: each request spawns a hub that retires right after.
        for text in ["1", "2", "3"] {
            f.registry
                .request_result(f.note, |reply| HubCommand::Apply {
                    author: user,
                    payload: OpPayload::insert(0, text),
                    reply,
                })
                .await
                .unwrap();
        }

        let doc = f
            .registry
            .request_result(f.note, |reply| HubCommand::Undo { user_id: user, reply })
            .await
            .unwrap();
        assert_eq!(doc.content, "21abc");
        assert_eq!(doc.version, 4);
    }

    #[tokio::test]
    async fn test_out_of_range_sync_keeps_hub_live() {
        let f = fixture("abc", HubConfig::default());
        let (sid, ctx, mut rx) = join(&f, "alice", 16).await;
        next(&mut rx).await;
        next(&mut rx).await;
        let hub_id = f.registry.get(&f.note).await.unwrap().hub_id();

        let err = f
            .registry
            .request_result(f.note, |reply| HubCommand::Sync {
                ctx: ctx.clone(),
                request: SyncRequest {
                    last_known_version: 0,
                    operations: vec![OpPayload::insert(usize::MAX, "x")],
                },
                reply,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::PartialSync { applied: 0, .. }));

        let hub = f.registry.get(&f.note).await.unwrap();
        hub.send(HubCommand::Request {
            session_id: sid,
            request: SessionRequest::Sync(SyncRequest {
                last_known_version: 0,
                operations: vec![OpPayload::replace(usize::MAX - 1, usize::MAX, "x")],
            }),
        })
        .await
        .unwrap();
        match &*next(&mut rx).await {
            ServerMessage::Error { kind, .. } => assert_eq!(*kind, ErrorKind::InvalidRange),
            other => panic!("Expected error, got {other:?}"),
        }

        let stats = f
            .registry
            .request(f.note, |reply| HubCommand::Stats { reply })
            .await
            .unwrap();
        assert_eq!(stats.hub_id, hub_id);
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.version, 0);
    }

    /// Content store that refuses writes while `failing` is set.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Database("disk full".into()));
            }
            Ok(())
        }
    }

    impl ContentStore for FlakyStore {
        fn load(&self, note_id: Uuid) -> Result<NoteDocument, StoreError> {
            self.inner.load(note_id)
        }

        fn save(&self, note_id: Uuid, document: &NoteDocument) -> Result<(), StoreError> {
            self.check()?;
            self.inner.save(note_id, document)
        }

        fn append_event(&self, note_id: Uuid, entry: &EditLogEntry) -> Result<(), StoreError> {
            self.check()?;
            self.inner.append_event(note_id, entry)
        }

        fn load_events(&self, note_id: Uuid) -> Result<Vec<EditLogEntry>, StoreError> {
            self.inner.load_events(note_id)
        }

        fn create(&self, note_id: Uuid, content: &str) -> Result<NoteDocument, StoreError> {
            self.inner.create(note_id, content)
        }
    }

    #[tokio::test]
    async fn test_refused_writes_keep_hub_until_saved() {
        let memory = Arc::new(MemoryStore::new());
        let note = Uuid::new_v4();
        memory.insert_note(note, "abc");
        let store = Arc::new(FlakyStore {
            inner: memory.clone(),
            failing: AtomicBool::new(true),
        });
        let registry = HubRegistry::new(HubDeps::new(store.clone(), memory.clone(), HubConfig::default()));
        let user = Uuid::new_v4();

        let applied = registry
            .request_result(note, |reply| HubCommand::Apply {
                author: user,
                payload: OpPayload::insert(0, "X"),
                reply,
            })
            .await
            .unwrap();
        assert_eq!(applied.document.content, "Xabc");

        // Still served from memory: a reloaded hub would see "abc".
        let doc = registry
            .request(note, |reply| HubCommand::Snapshot { reply })
            .await
            .unwrap();
        assert_eq!(doc.content, "Xabc");
        assert_eq!(memory.load(note).unwrap().content, "abc");
        assert_eq!(memory.event_count(note), 0);

        store.failing.store(false, Ordering::SeqCst);
        registry
            .request(note, |reply| HubCommand::Snapshot { reply })
            .await
            .unwrap();
        timeout(Duration::from_secs(2), registry.wait_retired(note))
            .await
            .unwrap();

        let saved = memory.load(note).unwrap();
        assert_eq!(saved.content, "Xabc");
        assert_eq!(saved.version, 1);
        assert_eq!(memory.event_count(note), 1);

        let doc = registry
            .request_result(note, |reply| HubCommand::Undo { user_id: user, reply })
            .await
            .unwrap();
        assert_eq!(doc.content, "abc");
        assert_eq!(doc.version, 2);
    }
}
