//! # notes-collab — Live sessions, persistence and transport for shared notes
//!
//! Serializes every edit to a note through one hub task, persists it, and
//! fans it out to every connected session.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │ NoteClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │  bincode | JSON     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │ Authenticator
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │OfflineQueue │                     │CollabService│ ── MembershipCheck
//! └─────────────┘                     └──────┬──────┘
//!                                            │ HubRegistry
//!                                    ┌───────┴───────┐
//!                                    │ NoteHub       │ ── EditLog (notes-core)
//!                                    │ (one per note)│ ── ContentStore / PresenceStore
//!                                    └───────┬───────┘
//!                                            │ SessionGroup
//!                                            ▼
//!                                     per-session queues
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — live-channel messages, binary and JSON codecs
//! - [`presence`] — presence rows and cursor colors
//! - [`auth`] — identity and membership seams
//! - [`storage`] — content/presence store traits, memory and RocksDB stores
//! - [`broadcast`] — per-note session fan-out and the hub registry
//! - [`hub`] — the per-note actor
//! - [`service`] — request/response surface and live session handles
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client with offline queue

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod error;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod service;
pub mod storage;

// Re-exports for convenience
pub use auth::{AuthContext, AuthError, Authenticator, MembershipCheck, OpenMembership, StaticAuthenticator, StaticMembership};
pub use broadcast::{BroadcastStats, HubRegistry, SessionGroup};
pub use client::{ClientConfig, ClientEvent, ConnectionState, NoteClient, OfflineQueue};
pub use error::CollabError;
pub use hub::{AppliedEdit, HubConfig, HubDeps, HubHandle, HubStats, SessionRequest};
pub use presence::{CursorColor, PresenceCursor, PresenceEntry};
pub use protocol::{ClientMessage, DocumentState, ErrorKind, HistoryEvent, ProtocolError, ServerMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use service::{CollabService, SessionHandle};
pub use storage::{ContentStore, MemoryStore, PresenceStore, RocksStore, StoreConfig, StoreError};
