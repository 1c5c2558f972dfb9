//! WebSocket client for a single note.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Live edits, presence and undo/redo over the session channel
//! - Offline queue: edits made while disconnected are replayed as one
//!   `sync` batch anchored at the last version seen from the server

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use notes_core::{EditLogEntry, OpPayload, SyncRequest, SyncResult};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::presence::{PresenceCursor, PresenceEntry};
use crate::protocol::{ClientMessage, DocumentState, ErrorKind, HistoryEvent, ProtocolError, ServerMessage};

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the note client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Join accepted; `present` lists the sessions that were already there.
    Joined {
        session_id: Uuid,
        document: DocumentState,
        present: Vec<PresenceEntry>,
    },
    PresenceChanged(PresenceEntry),
    PresenceLeft {
        user_id: Uuid,
        session_id: Uuid,
    },
    EditApplied {
        entry: EditLogEntry,
        content: String,
        version: u64,
    },
    /// Reply to undo or redo.
    Document(DocumentState),
    Synced(SyncResult),
    History(Vec<HistoryEvent>),
    Error {
        kind: ErrorKind,
        message: String,
    },
    Pong,
    /// Connection lost
    Disconnected,
}

impl ClientEvent {
    fn from_server(msg: ServerMessage) -> Option<Self> {
        let event = match msg {
            ServerMessage::PresenceList {
                session_id,
                document,
                entries,
            } => Self::Joined {
                session_id,
                document,
                present: entries,
            },
            ServerMessage::PresenceUpdate { presence } => Self::PresenceChanged(presence),
            ServerMessage::PresenceLeft { user_id, session_id } => Self::PresenceLeft { user_id, session_id },
            ServerMessage::EditApplied { entry, content, version } => Self::EditApplied { entry, content, version },
            ServerMessage::Document { document } => Self::Document(document),
            ServerMessage::SyncResult { result } => Self::Synced(result),
            ServerMessage::History { events } => Self::History(events),
            ServerMessage::Error { kind, message } => Self::Error { kind, message },
            ServerMessage::Pong => Self::Pong,
            ServerMessage::Ping => return None,
        };
        Some(event)
    }
}

/// Latest note version a server message reveals.
fn version_of(msg: &ServerMessage) -> Option<u64> {
    match msg {
        ServerMessage::PresenceList { document, .. } | ServerMessage::Document { document } => Some(document.version),
        ServerMessage::EditApplied { version, .. } => Some(*version),
        ServerMessage::SyncResult { result } => Some(result.applied_version),
        _ => None,
    }
}

/// Offline queue for edits made while disconnected.
///
/// The whole queue is replayed as a single sync batch on reconnection,
/// anchored at the version the client had seen when the first edit was
/// queued.
pub struct OfflineQueue {
    queue: VecDeque<OpPayload>,
    base_version: u64,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            base_version: 0,
            max_size,
        }
    }

    /// Queue an edit made on top of `known_version`.
    pub fn enqueue(&mut self, known_version: u64, payload: OpPayload) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        if self.queue.is_empty() {
            self.base_version = known_version;
        }
        self.queue.push_back(payload);
        true
    }

    /// Drain the queue into a sync batch; `None` when nothing is queued.
    pub fn take_batch(&mut self) -> Option<SyncRequest> {
        if self.queue.is_empty() {
            return None;
        }
        Some(SyncRequest {
            last_known_version: self.base_version,
            operations: self.queue.drain(..).collect(),
        })
    }

    /// Version the queued edits were made against.
    pub fn base_version(&self) -> Option<u64> {
        (!self.queue.is_empty()).then_some(self.base_version)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Connection parameters of a [`NoteClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port`
    pub server_url: String,
    pub token: String,
    pub note_id: Uuid,
    pub offline_queue_size: usize,
    pub join_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>, note_id: Uuid) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            note_id,
            offline_queue_size: 10_000,
            join_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared client state a reader task updates.
struct ReaderState {
    state: Arc<RwLock<ConnectionState>>,
    last_version: Arc<AtomicU64>,
    generation: Arc<AtomicU64>,
    current: u64,
}

/// The note client.
///
/// Manages a WebSocket connection to the server, forwards server messages
/// as [`ClientEvent`]s and queues edits while offline.
pub struct NoteClient {
    config: ClientConfig,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Highest note version seen from the server
    last_version: Arc<AtomicU64>,

    /// Bumped on every connect so a stale reader cannot mark a newer
    /// connection as lost
    generation: Arc<AtomicU64>,

    /// Offline queue for disconnected edits
    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<ClientMessage>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ClientEvent>,

    session_id: Option<Uuid>,
}

impl NoteClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let offline_queue = OfflineQueue::new(config.offline_queue_size);
        Self {
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            last_version: Arc::new(AtomicU64::new(0)),
            generation: Arc::new(AtomicU64::new(0)),
            offline_queue: Arc::new(Mutex::new(offline_queue)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            session_id: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the note, then replay any offline edits as one
    /// sync batch. Returns the new session id.
    pub async fn connect(&mut self) -> Result<Uuid, ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.config.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.config.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let encoded = match msg.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::error!("Failed to encode outgoing message: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let (joined_tx, joined_rx) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(Self::read_loop(
            ws_reader,
            out_tx.downgrade(),
            self.event_tx.clone(),
            ReaderState {
                state: self.state.clone(),
                last_version: self.last_version.clone(),
                generation: self.generation.clone(),
                current: generation,
            },
            joined_tx,
        ));

        let join = ClientMessage::Join {
            note_id: self.config.note_id,
            token: self.config.token.clone(),
        };
        if out_tx.send(join).await.is_err() {
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(ProtocolError::ConnectionClosed);
        }

        let session_id = match tokio::time::timeout(self.config.join_timeout, joined_rx).await {
            Ok(Ok(Ok(session_id))) => session_id,
            Ok(Ok(Err(e))) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
            Ok(Err(_)) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Timeout);
            }
        };

        // Replay offline queue
        let batch = self.offline_queue.lock().await.take_batch();
        if let Some(request) = batch {
            log::info!(
                "Replaying {} offline operation(s) from version {}",
                request.operations.len(),
                request.last_known_version
            );
            if out_tx.send(ClientMessage::Sync { request }).await.is_err() {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        }

        self.outgoing_tx = Some(out_tx);
        self.session_id = Some(session_id);
        *self.state.write().await = ConnectionState::Connected;
        log::info!("Joined note {} as session {session_id}", self.config.note_id);
        Ok(session_id)
    }

    /// Reader task: process incoming WebSocket messages.
    async fn read_loop(
        mut ws_reader: WsReader,
        out_tx: mpsc::WeakSender<ClientMessage>,
        event_tx: mpsc::Sender<ClientEvent>,
        reader: ReaderState,
        joined: oneshot::Sender<Result<Uuid, ProtocolError>>,
    ) {
        let mut joined = Some(joined);

        while let Some(frame) = ws_reader.next().await {
            let decoded = match frame {
                Ok(Message::Binary(data)) => ServerMessage::decode(&data),
                Ok(Message::Text(text)) => ServerMessage::from_json(text.as_str()),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            let msg = match decoded {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("Dropping undecodable server message: {e}");
                    continue;
                }
            };

            if let Some(version) = version_of(&msg) {
                reader.last_version.fetch_max(version, Ordering::SeqCst);
            }

            match &msg {
                ServerMessage::PresenceList { session_id, .. } => {
                    if let Some(tx) = joined.take() {
                        let _ = tx.send(Ok(*session_id));
                    }
                }
                ServerMessage::Error { kind, message } => {
                    if let Some(tx) = joined.take() {
                        let _ = tx.send(Err(ProtocolError::Rejected {
                            kind: *kind,
                            message: message.clone(),
                        }));
                        continue;
                    }
                }
                ServerMessage::Ping => {
                    if let Some(tx) = out_tx.upgrade() {
                        let _ = tx.send(ClientMessage::Ping).await;
                    }
                }
                _ => {}
            }

            if let Some(event) = ClientEvent::from_server(msg) {
                let _ = event_tx.send(event).await;
            }
        }

        // Connection lost
        if reader.generation.load(Ordering::SeqCst) == reader.current {
            *reader.state.write().await = ConnectionState::Disconnected;
        }
        let _ = event_tx.send(ClientEvent::Disconnected).await;
    }

    /// Send an edit, or queue it while disconnected.
    pub async fn edit(&self, payload: OpPayload) -> Result<(), ProtocolError> {
        if *self.state.read().await == ConnectionState::Connected {
            if let Some(ref tx) = self.outgoing_tx {
                let msg = ClientMessage::Edit {
                    payload: payload.clone(),
                };
                if tx.send(msg).await.is_ok() {
                    return Ok(());
                }
            }
        }

        let mut queue = self.offline_queue.lock().await;
        if !queue.enqueue(self.last_version.load(Ordering::SeqCst), payload) {
            return Err(ProtocolError::QueueFull(queue.len()));
        }
        Ok(())
    }

    /// Send a cursor update. Dropped silently when offline.
    pub async fn presence(&self, cursor: PresenceCursor) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(ClientMessage::presence(cursor)).await
    }

    pub async fn undo(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Undo).await
    }

    pub async fn redo(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Redo).await
    }

    pub async fn request_history(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::History).await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping).await
    }

    /// Leave the note and close the connection. Offline edits stay queued.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(ClientMessage::Leave).await;
        }
        self.session_id = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        match self.outgoing_tx {
            Some(ref tx) => tx.send(msg).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn note_id(&self) -> Uuid {
        self.config.note_id
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    /// Session id of the current connection, if joined.
    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn last_version(&self) -> u64 {
        self.last_version.load(Ordering::SeqCst)
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
