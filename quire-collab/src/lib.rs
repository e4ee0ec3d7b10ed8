//! # quire-collab: Collaborative editing and durable sync for Quire
//!
//! Pages live in CRDT fragments shared through a WebSocket relay, and are
//! backed up to a durable record store on a debounce.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    WebSocket     ┌─────────────┐
//! │ TransportClient  │ ◄──────────────► │ RelayServer │
//! │ (per session)    │   Binary Proto   │ (central)   │
//! └────────┬─────────┘                  └──────┬──────┘
//!          │                                   │
//!          ▼                                   ▼
//! ┌──────────────────┐                  ┌─────────────┐
//! │ FragmentManager  │                  │ DocumentRoom│──► SnapshotStore
//! │ (Yrs Doc)        │                  │ (authority) │
//! └────────┬─────────┘                  └─────────────┘
//!          │ local edits
//!          ▼
//! ┌──────────────────┐  status   ┌─────────────────────────┐
//! │ HybridSyncEngine │ ◄──────── │ ConnectionStatusTracker │
//! └────────┬─────────┘           └─────────────────────────┘
//!          ▼
//!     RecordStore (PageContentRecord)
//! ```
//!
//! ## Modules
//!
//! - [`fragment`]: per-page CRDT fragments, binding and one-time hydration
//! - [`status`]: two-axis connection status and derived sync mode
//! - [`engine`]: local buffer and debounced durable backup
//! - [`session`]: one open document wiring the above together
//! - [`service`]: documents, pages, templates and usage bumps
//! - [`storage`]: record and snapshot stores (memory, RocksDB)
//! - [`protocol`]: binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: room-based fan-out with backpressure
//! - [`server`]: WebSocket relay server
//! - [`client`]: reconnecting relay client with offline queue
//! - [`presence`]: collaborator identity, colour and focus

pub mod broadcast;
pub mod client;
pub mod engine;
pub mod fragment;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod service;
pub mod session;
pub mod status;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, DocumentRoom, RoomManager};
pub use client::{OfflineQueue, TransportClient, TransportConfig, TransportEvent};
pub use engine::{EngineStats, HybridSyncEngine, PageTarget, SyncConfig};
pub use fragment::{read_fragment, CollabError, FragmentBinding, FragmentManager};
pub use presence::{AwarenessMessage, PeerColor, PeerIdentity, PresenceRoster};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use server::{RelayError, RelayServer, ServerConfig, ServerStats};
pub use service::{
    DocumentContext, DocumentService, FromTemplateRequest, NewDocument, ParentResolution,
    SaveTemplateRequest, ServiceConfig, ServiceError, UsageRecorder,
};
pub use session::EditingSession;
pub use status::{ConnectionStatusTracker, CrdtState, DurableState, SyncMode, SyncStatus};
pub use storage::{
    MemoryStore, RecordStore, RocksStore, SnapshotMeta, SnapshotStore, StoreConfig, StoreError,
};
