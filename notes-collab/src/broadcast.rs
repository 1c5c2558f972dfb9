//! Per-note session fan-out and the note → hub table.
//!
//! [`SessionGroup`] is owned by a single hub task, so it needs no locks.
//! Every session has its own bounded outbound queue; a broadcast is a
//! `try_send` of one shared `Arc<ServerMessage>` into each queue. A queue
//! that is full or closed never stalls the hub: the send fails immediately
//! and the hub evicts that session, so the survivors see every message in
//! hub order with no gaps.
//!
//! [`HubRegistry`] maps note ids to live hubs. Lookups take the read lock;
//! a missing hub is spawned under the write lock with a double check.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use uuid::Uuid;

use crate::error::CollabError;
use crate::hub::{self, HubCommand, HubDeps, HubHandle};
use crate::presence::{PresenceCursor, PresenceEntry};
use crate::protocol::ServerMessage;

/// Outbound queue of one session.
pub type Outbound = mpsc::Sender<Arc<ServerMessage>>;

/// How many times a request chases a hub that retired under it.
const MAX_DISPATCH_ATTEMPTS: usize = 4;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub sessions_evicted: u64,
    pub active_sessions: usize,
}

struct SessionSlot {
    entry: PresenceEntry,
    outbound: Outbound,
}

/// Live sessions of one note, in join order.
#[derive(Default)]
pub struct SessionGroup {
    sessions: Vec<SessionSlot>,
    stats: BroadcastStats,
}

impl SessionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: PresenceEntry, outbound: Outbound) {
        self.sessions.push(SessionSlot { entry, outbound });
    }

    pub fn remove(&mut self, session_id: &Uuid) -> Option<PresenceEntry> {
        let idx = self.position(session_id)?;
        Some(self.sessions.remove(idx).entry)
    }

    /// Remove a session whose queue failed.
    pub fn evict(&mut self, session_id: &Uuid) -> Option<PresenceEntry> {
        let entry = self.remove(session_id)?;
        self.stats.sessions_evicted += 1;
        Some(entry)
    }

    pub fn get(&self, session_id: &Uuid) -> Option<&PresenceEntry> {
        self.sessions
            .iter()
            .find(|s| s.entry.session_id == *session_id)
            .map(|s| &s.entry)
    }

    /// Move a session's cursor, returning the updated entry.
    pub fn update_cursor(&mut self, session_id: &Uuid, cursor: PresenceCursor) -> Option<&PresenceEntry> {
        let idx = self.position(session_id)?;
        let slot = &mut self.sessions[idx];
        slot.entry.set_cursor(cursor);
        Some(&slot.entry)
    }

    /// Most recently joined live session of `user_id`, if any.
    pub fn latest_for_user(&self, user_id: &Uuid) -> Option<&PresenceEntry> {
        self.sessions
            .iter()
            .rev()
            .find(|s| s.entry.user_id == *user_id)
            .map(|s| &s.entry)
    }

    pub fn entries(&self) -> Vec<PresenceEntry> {
        self.sessions.iter().map(|s| s.entry.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Queue `msg` for every session. Returns the sessions whose queue was
    /// full or closed; the caller must evict them.
    pub fn broadcast(&mut self, msg: &Arc<ServerMessage>) -> Vec<Uuid> {
        let mut failed = Vec::new();
        for slot in &self.sessions {
            match slot.outbound.try_send(Arc::clone(msg)) {
                Ok(()) => self.stats.messages_sent += 1,
                Err(TrySendError::Full(_)) => {
                    self.stats.messages_dropped += 1;
                    failed.push(slot.entry.session_id);
                }
                Err(TrySendError::Closed(_)) => failed.push(slot.entry.session_id),
            }
        }
        failed
    }

    /// Queue `msg` for one session. `false` means the session must be evicted.
    pub fn send_to(&mut self, session_id: &Uuid, msg: Arc<ServerMessage>) -> bool {
        let Some(idx) = self.position(session_id) else {
            return true;
        };
        match self.sessions[idx].outbound.try_send(msg) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.stats.messages_dropped += 1;
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            active_sessions: self.sessions.len(),
            ..self.stats
        }
    }

    fn position(&self, session_id: &Uuid) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.entry.session_id == *session_id)
    }
}

pub(crate) type HubTable = Arc<RwLock<HashMap<Uuid, HubHandle>>>;

type SpawnGates = Arc<std::sync::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>;

/// Note id → live hub.
///
/// A hub is spawned on first use and removes itself from the table when
/// its last session leaves. Requests that race a retiring hub are retried
/// against a fresh one.
///
/// Spawning reads the note from storage with no table lock held; a
/// per-note gate keeps two callers from loading the same note at once.
#[derive(Clone)]
pub struct HubRegistry {
    hubs: HubTable,
    spawning: SpawnGates,
    deps: HubDeps,
}

impl HubRegistry {
    pub fn new(deps: HubDeps) -> Self {
        Self {
            hubs: Arc::new(RwLock::new(HashMap::new())),
            spawning: Arc::new(std::sync::Mutex::new(HashMap::new())),
            deps,
        }
    }

    pub fn deps(&self) -> &HubDeps {
        &self.deps
    }

    /// Get the live hub for a note, spawning it from storage if needed.
    pub async fn get_or_spawn(&self, note_id: Uuid) -> Result<HubHandle, CollabError> {
        // Fast path: read lock
        if let Some(hub) = self.get(&note_id).await {
            return Ok(hub);
        }

        // Slow path: one spawner per note
        let gate = self.spawn_gate(note_id);
        let spawned = {
            let _spawning = gate.lock().await;
            self.spawn(note_id).await
        };
        self.release_gate(note_id, gate);
        spawned
    }

    async fn spawn(&self, note_id: Uuid) -> Result<HubHandle, CollabError> {
        // Double-check after acquiring the gate
        if let Some(hub) = self.get(&note_id).await {
            return Ok(hub);
        }

        // A hub leaves the table only after its last write, so nothing is
        // still writing this note while it loads.
        let deps = self.deps.clone();
        let log = tokio::task::spawn_blocking(move || hub::load(note_id, &deps))
            .await
            .map_err(|e| {
                log::error!("Loading note {note_id} aborted: {e}");
                CollabError::HubClosed(note_id)
            })??;

        let hub = hub::start(log, self.deps.clone(), Arc::clone(&self.hubs));
        self.hubs.write().await.insert(note_id, hub.clone());
        Ok(hub)
    }

    fn spawn_gate(&self, note_id: Uuid) -> Arc<Mutex<()>> {
        let mut gates = self.spawning.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(note_id).or_default())
    }

    fn release_gate(&self, note_id: Uuid, gate: Arc<Mutex<()>>) {
        let mut gates = self.spawning.lock().unwrap_or_else(PoisonError::into_inner);
        // Held by the map and by us only: nobody else is waiting.
        let idle = gates
            .get(&note_id)
            .is_some_and(|current| Arc::ptr_eq(current, &gate) && Arc::strong_count(&gate) == 2);
        if idle {
            gates.remove(&note_id);
        }
    }

    /// Live hub for a note without spawning one.
    pub async fn get(&self, note_id: &Uuid) -> Option<HubHandle> {
        self.hubs
            .read()
            .await
            .get(note_id)
            .filter(|hub| !hub.is_closed())
            .cloned()
    }

    /// Send a request to the note's hub and wait for the reply.
    ///
    /// A hub that retires before answering drops the reply sender; the
    /// request is then replayed on a newly spawned hub. `make` may be
    /// called once per attempt.
    pub(crate) async fn request<T, F>(&self, note_id: Uuid, make: F) -> Result<T, CollabError>
    where
        F: Fn(oneshot::Sender<T>) -> HubCommand,
    {
        self.request_with_hub(note_id, make).await.map(|(_, value)| value)
    }

    /// Like [`Self::request`], also returning the hub that answered.
    pub(crate) async fn request_with_hub<T, F>(
        &self,
        note_id: Uuid,
        make: F,
    ) -> Result<(HubHandle, T), CollabError>
    where
        F: Fn(oneshot::Sender<T>) -> HubCommand,
    {
        for attempt in 1..=MAX_DISPATCH_ATTEMPTS {
            let hub = self.get_or_spawn(note_id).await?;
            let (tx, rx) = oneshot::channel();
            if hub.send(make(tx)).await.is_err() {
                log::debug!("Hub {} for note {note_id} closed (attempt {attempt})", hub.hub_id());
                continue;
            }
            match rx.await {
                Ok(value) => return Ok((hub, value)),
                Err(_) => {
                    log::debug!("Hub {} for note {note_id} retired mid-request (attempt {attempt})", hub.hub_id());
                }
            }
        }
        Err(CollabError::HubClosed(note_id))
    }

    /// [`Self::request`] for hubs that answer with a `Result`.
    pub(crate) async fn request_result<T, F>(&self, note_id: Uuid, make: F) -> Result<T, CollabError>
    where
        F: Fn(oneshot::Sender<Result<T, CollabError>>) -> HubCommand,
    {
        self.request(note_id, make).await?
    }

    pub async fn hub_count(&self) -> usize {
        self.hubs.read().await.len()
    }

    pub async fn active_notes(&self) -> Vec<Uuid> {
        self.hubs.read().await.keys().cloned().collect()
    }

    /// Wait until no hub is registered for `note_id`.
    pub async fn wait_retired(&self, note_id: Uuid) {
        while self.get(&note_id).await.is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
