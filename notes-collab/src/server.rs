//! WebSocket server: one connection per live session.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── ContentStore (RocksDB | memory)
//!             ├── SyncServer ── CollabService ── HubRegistry ── NoteHub (note_id)
//! Client B ──┘      │                                              │
//!                   └── Authenticator                              ├── PresenceStore
//!                                                                  └── SessionGroup
//!                                                                        │
//!                                                     ┌──────────────────┼──────────┐
//!                                                     ▼                  ▼          ▼
//!                                                  Client A          Client B    Client C
//! ```
//!
//! Each connection:
//! - must send `join` as its first frame within `join_timeout_secs`
//! - is authenticated and membership-checked before any hub state is touched
//! - is answered in the codec of its last frame (binary = bincode, text = JSON)
//! - is pinged every `heartbeat_interval_secs` and dropped when silent for
//!   longer than `liveness_timeout_secs`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{Authenticator, MembershipCheck};
use crate::error::CollabError;
use crate::hub::{HubConfig, HubDeps, SessionRequest};
use crate::presence::PresenceCursor;
use crate::protocol::{ClientMessage, ErrorKind, ProtocolError, ServerMessage};
use crate::service::{CollabService, SessionHandle};
use crate::storage::{MemoryStore, RocksStore, StoreConfig, StoreError};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum live sessions per note
    pub max_sessions_per_note: usize,
    /// Outbound queue length of each session
    pub outbound_capacity: usize,
    /// Command queue length of each note hub
    pub hub_command_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Silence after which a connection is dropped
    pub liveness_timeout_secs: u64,
    /// Time allowed between accept and the `join` frame
    pub join_timeout_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_sessions_per_note: 100,
            outbound_capacity: 256,
            hub_command_capacity: 1024,
            heartbeat_interval_secs: 30,
            liveness_timeout_secs: 90,
            join_timeout_secs: 10,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `NOTES_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each `NOTES_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: lookup("NOTES_BIND_ADDR")
                .filter(|addr| !addr.trim().is_empty())
                .unwrap_or(defaults.bind_addr),
            max_sessions_per_note: parse_or(
                "NOTES_MAX_SESSIONS",
                lookup("NOTES_MAX_SESSIONS"),
                defaults.max_sessions_per_note,
            ),
            outbound_capacity: parse_nonzero(
                "NOTES_OUTBOUND_CAPACITY",
                lookup("NOTES_OUTBOUND_CAPACITY"),
                defaults.outbound_capacity,
            ),
            hub_command_capacity: parse_nonzero(
                "NOTES_HUB_COMMAND_CAPACITY",
                lookup("NOTES_HUB_COMMAND_CAPACITY"),
                defaults.hub_command_capacity,
            ),
            heartbeat_interval_secs: parse_nonzero(
                "NOTES_HEARTBEAT_SECS",
                lookup("NOTES_HEARTBEAT_SECS"),
                defaults.heartbeat_interval_secs,
            ),
            liveness_timeout_secs: parse_or(
                "NOTES_LIVENESS_TIMEOUT_SECS",
                lookup("NOTES_LIVENESS_TIMEOUT_SECS"),
                defaults.liveness_timeout_secs,
            ),
            join_timeout_secs: parse_or(
                "NOTES_JOIN_TIMEOUT_SECS",
                lookup("NOTES_JOIN_TIMEOUT_SECS"),
                defaults.join_timeout_secs,
            ),
            storage_path: lookup("NOTES_STORAGE_PATH")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring unparsable {key}={raw:?}");
            default
        }),
        None => default,
    }
}

/// Channel capacities and timer periods must be at least 1.
fn parse_nonzero<T: FromStr + Default + PartialEq + Copy>(key: &str, raw: Option<String>, default: T) -> T {
    let value = parse_or(key, raw, default);
    if value == T::default() {
        log::warn!("Ignoring {key}=0");
        return default;
    }
    value
}

impl From<&ServerConfig> for HubConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_sessions: config.max_sessions_per_note,
            command_capacity: config.hub_command_capacity,
            outbound_capacity: config.outbound_capacity,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_joins: u64,
    pub live_notes: usize,
}

/// Wire codec of a connection, following its most recent frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Binary,
    Json,
}

impl Codec {
    fn frame(self, msg: &ServerMessage) -> Result<Message, ProtocolError> {
        match self {
            Codec::Binary => Ok(Message::Binary(msg.encode()?.into())),
            Codec::Json => Ok(Message::Text(msg.to_json()?.into())),
        }
    }
}

/// Decode a data frame; `None` for control frames.
fn decode_frame(frame: &Message) -> Option<(Result<ClientMessage, ProtocolError>, Codec)> {
    match frame {
        Message::Binary(data) => Some((ClientMessage::decode(data), Codec::Binary)),
        Message::Text(text) => Some((ClientMessage::from_json(text.as_str()), Codec::Json)),
        _ => None,
    }
}

async fn send_message(ws_sender: &mut WsSink, codec: Codec, msg: &ServerMessage) -> Result<(), BoxError> {
    ws_sender.send(codec.frame(msg)?).await?;
    Ok(())
}

/// State shared by every connection task.
#[derive(Clone)]
struct Shared {
    config: ServerConfig,
    service: CollabService,
    authenticator: Arc<dyn Authenticator>,
    stats: Arc<RwLock<ServerStats>>,
}

/// The sync server.
pub struct SyncServer {
    shared: Shared,
}

impl SyncServer {
    pub fn new(config: ServerConfig, service: CollabService, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            shared: Shared {
                config,
                service,
                authenticator,
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        }
    }

    /// Build the engine from configuration: RocksDB when `storage_path`
    /// is set, the in-memory store otherwise.
    pub fn open(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        membership: Arc<dyn MembershipCheck>,
    ) -> Result<Self, StoreError> {
        let hub_config = HubConfig::from(&config);
        let deps = match &config.storage_path {
            Some(path) => {
                let store = Arc::new(RocksStore::open(StoreConfig::new(path.clone()))?);
                log::info!("Persisting notes to {}", path.display());
                HubDeps::new(store.clone(), store, hub_config)
            }
            None => {
                log::info!("No storage path configured, notes are kept in memory");
                let store = Arc::new(MemoryStore::new());
                HubDeps::new(store.clone(), store, hub_config)
            }
        };
        Ok(Self::new(config, CollabService::new(deps, membership), authenticator))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn service(&self) -> &CollabService {
        &self.shared.service
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.live_notes = self.shared.service.live_notes().await;
        stats
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Note server listening on {}", self.shared.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Shared) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::serve_connection(&mut ws_sender, &mut ws_receiver, addr, &shared).await;

        {
            let mut s = shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        let _ = ws_sender.close().await;
        log::info!("Connection from {addr} finished");
        result
    }

    async fn serve_connection(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        addr: SocketAddr,
        shared: &Shared,
    ) -> Result<(), BoxError> {
        let join_timeout = Duration::from_secs(shared.config.join_timeout_secs);
        let waited = timeout(join_timeout, Self::first_frame(ws_sender, ws_receiver)).await;
        let (first, codec) = match waited {
            Ok(Ok(Some(decoded))) => decoded,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                log::warn!("No join from {addr} within {join_timeout:?}");
                let msg = ServerMessage::error(ErrorKind::InvalidMessage, "join timeout");
                return Self::reject(ws_sender, Codec::Binary, shared, &msg).await;
            }
        };

        let (note_id, token) = match first {
            Ok(ClientMessage::Join { note_id, token }) => (note_id, token),
            Ok(other) => {
                log::warn!("Expected join from {addr}, got {other:?}");
                let msg = ServerMessage::error(ErrorKind::InvalidMessage, "first message must be join");
                return Self::reject(ws_sender, codec, shared, &msg).await;
            }
            Err(e) => {
                log::warn!("Failed to decode join from {addr}: {e}");
                let msg = ServerMessage::error(ErrorKind::InvalidMessage, e.to_string());
                return Self::reject(ws_sender, codec, shared, &msg).await;
            }
        };

        let user = match shared.authenticator.authenticate(&token) {
            Ok(user) => user,
            Err(e) => {
                log::warn!("Rejected token from {addr} for note {note_id}");
                let err = CollabError::from(e);
                let msg = ServerMessage::error(err.kind(), err.to_string());
                return Self::reject(ws_sender, codec, shared, &msg).await;
            }
        };

        let mut session = match shared.service.join(note_id, user).await {
            Ok(session) => session,
            Err(e) => {
                let msg = ServerMessage::error(e.kind(), e.to_string());
                return Self::reject(ws_sender, codec, shared, &msg).await;
            }
        };

        log::info!(
            "{} ({}) joined note {note_id} as session {} from {addr}",
            session.user().username,
            session.user().user_id,
            session.session_id()
        );

        let result = Self::session_loop(ws_sender, ws_receiver, &mut session, codec, addr, shared).await;
        session.leave().await;
        result
    }

    /// Wait for the first data frame. `None` when the peer went away first.
    async fn first_frame(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
    ) -> Result<Option<(Result<ClientMessage, ProtocolError>, Codec)>, BoxError> {
        while let Some(frame) = ws_receiver.next().await {
            match frame? {
                Message::Close(_) => return Ok(None),
                Message::Ping(data) => ws_sender.send(Message::Pong(data)).await?,
                other => {
                    if let Some(decoded) = decode_frame(&other) {
                        return Ok(Some(decoded));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn reject(ws_sender: &mut WsSink, codec: Codec, shared: &Shared, msg: &ServerMessage) -> Result<(), BoxError> {
        shared.stats.write().await.rejected_joins += 1;
        send_message(ws_sender, codec, msg).await
    }

    async fn session_loop(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        session: &mut SessionHandle,
        mut codec: Codec,
        addr: SocketAddr,
        shared: &Shared,
    ) -> Result<(), BoxError> {
        let heartbeat = Duration::from_secs(shared.config.heartbeat_interval_secs.max(1));
        let liveness = Duration::from_secs(shared.config.liveness_timeout_secs);
        let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            last_seen = Instant::now();
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(frame)) => {
                            last_seen = Instant::now();
                            let Some((decoded, frame_codec)) = decode_frame(&frame) else {
                                continue;
                            };
                            codec = frame_codec;
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += frame.len() as u64;
                            }

                            match decoded {
                                Ok(ClientMessage::Leave) => {
                                    log::debug!("Session {} asked to leave", session.session_id());
                                    break;
                                }
                                Ok(msg) => Self::dispatch(ws_sender, session, codec, msg).await?,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    let reply = ServerMessage::error(ErrorKind::InvalidMessage, e.to_string());
                                    send_message(ws_sender, codec, &reply).await?;
                                }
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                    }
                }

                // Outgoing hub message
                outbound = session.recv() => {
                    match outbound {
                        Some(msg) => send_message(ws_sender, codec, &msg).await?,
                        None => {
                            log::warn!(
                                "Session {} on note {} was dropped by its hub",
                                session.session_id(),
                                session.note_id()
                            );
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if last_seen.elapsed() > liveness {
                        log::warn!("No traffic from {addr} for {:?}, closing", last_seen.elapsed());
                        break;
                    }
                    send_message(ws_sender, codec, &ServerMessage::Ping).await?;
                }
            }
        }

        Ok(())
    }

    async fn dispatch(
        ws_sender: &mut WsSink,
        session: &SessionHandle,
        codec: Codec,
        msg: ClientMessage,
    ) -> Result<(), BoxError> {
        match msg {
            ClientMessage::Edit { payload } => session.edit(payload).await?,
            ClientMessage::Presence {
                cursor_pos,
                selection_start,
                selection_end,
            } => {
                session
                    .presence(PresenceCursor {
                        cursor_pos,
                        selection_start,
                        selection_end,
                    })
                    .await?
            }
            ClientMessage::Undo => session.request(SessionRequest::Undo).await?,
            ClientMessage::Redo => session.request(SessionRequest::Redo).await?,
            ClientMessage::History => session.request(SessionRequest::History).await?,
            ClientMessage::Sync { request } => session.request(SessionRequest::Sync(request)).await?,
            ClientMessage::Ping => send_message(ws_sender, codec, &ServerMessage::Pong).await?,
            ClientMessage::Join { .. } => {
                let reply = ServerMessage::error(ErrorKind::InvalidMessage, "session already joined");
                send_message(ws_sender, codec, &reply).await?;
            }
            ClientMessage::Leave => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::auth::{OpenMembership, StaticAuthenticator};

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_sessions_per_note, 100);
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.liveness_timeout_secs, 90);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_config_from_lookup_overlays_defaults() {
        let vars: HashMap<&str, &str> = [
            ("NOTES_BIND_ADDR", "0.0.0.0:7000"),
            ("NOTES_MAX_SESSIONS", "8"),
            ("NOTES_HEARTBEAT_SECS", "not-a-number"),
            ("NOTES_STORAGE_PATH", "/var/lib/notes"),
            ("NOTES_HUB_COMMAND_CAPACITY", "64"),
            ("NOTES_JOIN_TIMEOUT_SECS", " 3 "),
        ]
        .into_iter()
        .collect();

        let config = ServerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_sessions_per_note, 8);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/notes")));
        assert_eq!(config.hub_command_capacity, 64);
        assert_eq!(config.join_timeout_secs, 3);
        assert_eq!(config.liveness_timeout_secs, 90);
    }

    #[test]
    fn test_zero_capacities_fall_back_to_defaults() {
        let config = ServerConfig::from_lookup(|key| match key {
            "NOTES_OUTBOUND_CAPACITY" | "NOTES_HUB_COMMAND_CAPACITY" | "NOTES_HEARTBEAT_SECS" => Some("0".into()),
            _ => None,
        });
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.hub_command_capacity, 1024);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_empty_storage_path_means_memory() {
        let config = ServerConfig::from_lookup(|key| (key == "NOTES_STORAGE_PATH").then(String::new));
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_hub_config_from_server_config() {
        let config = ServerConfig {
            max_sessions_per_note: 3,
            outbound_capacity: 16,
            hub_command_capacity: 32,
            ..ServerConfig::default()
        };
        let hub = HubConfig::from(&config);
        assert_eq!(hub.max_sessions, 3);
        assert_eq!(hub.outbound_capacity, 16);
        assert_eq!(hub.command_capacity, 32);
    }

    #[test]
    fn test_codec_follows_frame_kind() {
        let join = ClientMessage::Join {
            note_id: uuid::Uuid::new_v4(),
            token: "t".into(),
        };
        let binary = Message::Binary(join.encode().unwrap().into());
        let text = Message::Text(join.to_json().unwrap().into());

        let (decoded, codec) = decode_frame(&binary).unwrap();
        assert_eq!(decoded.unwrap(), join);
        assert_eq!(codec, Codec::Binary);

        let (decoded, codec) = decode_frame(&text).unwrap();
        assert_eq!(decoded.unwrap(), join);
        assert_eq!(codec, Codec::Json);

        assert!(decode_frame(&Message::Pong(Vec::new().into())).is_none());
    }

    #[test]
    fn test_json_codec_writes_text_frames() {
        match Codec::Json.frame(&ServerMessage::Pong).unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), "\"pong\""),
            other => panic!("expected text frame, got {other:?}"),
        }
        assert!(matches!(Codec::Binary.frame(&ServerMessage::Pong).unwrap(), Message::Binary(_)));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = SyncServer::open(
            ServerConfig::default(),
            Arc::new(StaticAuthenticator::new()),
            Arc::new(OpenMembership),
        )
        .unwrap();
        let stats = server.stats().await;
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.live_notes, 0);
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("notes")),
            ..ServerConfig::default()
        };
        let server = SyncServer::open(config, Arc::new(StaticAuthenticator::new()), Arc::new(OpenMembership)).unwrap();

        let note = uuid::Uuid::new_v4();
        let doc = server.service().create_note(note, "persisted").unwrap();
        assert_eq!(doc.content, "persisted");
        assert_eq!(doc.version, 0);
    }
}
