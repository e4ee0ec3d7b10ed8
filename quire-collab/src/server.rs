//! WebSocket relay server: one room per document.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── DocumentRoom (document id) ── FragmentManager (Yrs Doc)
//! Client B ──┘         │                              │
//!                      │                              └── SnapshotStore
//!                      │                                   (on idle / room close)
//!             ┌────────┼────────┐
//!             ▼        ▼        ▼
//!          Client A  Client B  Client C       (BroadcastGroup fan-out)
//! ```
//!
//! Handshake: the client opens with `PeerJoined`, then `SyncStep1` with its
//! state vector. The server answers with `SyncStep2` (what the client
//! lacks) and its own `SyncStep1`, so the client can push what the server
//! lacks. After that only `Delta` and `Awareness` frames flow.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{DocumentRoom, Envelope, RoomManager};
use crate::fragment::CollabError;
use crate::presence::{AwarenessMessage, PeerIdentity};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::storage::{RocksStore, SnapshotStore, StoreConfig, StoreError};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// How often dirty rooms are snapshotted while peers are connected
    pub snapshot_interval: Duration,
    /// RocksDB path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            snapshot_interval: Duration::from_secs(30),
            storage_path: None,
        }
    }
}

impl ServerConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            snapshot_interval: Duration::from_millis(200),
            storage_path: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Crdt(#[from] CollabError),
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::Protocol(e.into())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_snapshots: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    persisted_snapshots: AtomicU64,
}

struct Inner {
    config: ServerConfig,
    rooms: RoomManager,
    stats: AtomicServerStats,
    snapshots: Option<Arc<dyn SnapshotStore>>,
}

/// The relay server. Cheap to clone.
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<Inner>,
}

impl RelayServer {
    /// Create a server, opening RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, RelayError> {
        let snapshots = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                Some(Arc::new(store) as Arc<dyn SnapshotStore>)
            }
            None => None,
        };
        Ok(Self::build(config, snapshots))
    }

    /// Create a server persisting into an existing snapshot store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: ServerConfig, snapshots: Option<Arc<dyn SnapshotStore>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                rooms: RoomManager::new(config.broadcast_capacity),
                config,
                stats: AtomicServerStats::default(),
                snapshots,
            }),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.inner.config.bind_addr
    }

    pub fn snapshot_store(&self) -> Option<&Arc<dyn SnapshotStore>> {
        self.inner.snapshots.as_ref()
    }

    /// Load every persisted room so returning peers find their state.
    pub async fn recover(&self) -> Result<usize, RelayError> {
        let Some(store) = &self.inner.snapshots else {
            return Ok(0);
        };

        let room_ids = store.list_snapshots()?;
        let mut recovered = 0;
        for room_id in &room_ids {
            let Some(state) = store.load_snapshot(*room_id)? else {
                continue;
            };
            let (room, _) = self.inner.rooms.get_or_create(*room_id).await;
            match room.fragments.apply_remote_update(&state) {
                Ok(()) => {
                    recovered += 1;
                    log::info!("Recovered room {room_id} from storage");
                }
                Err(e) => log::error!("Snapshot of room {room_id} is unreadable: {e}"),
            }
        }

        log::info!("Recovery complete: {recovered}/{} rooms restored", room_ids.len());
        Ok(recovered)
    }

    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        let listener = TcpListener::bind(&self.inner.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Recover, bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        self.recover().await?;
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        let snapshotter = self.spawn_snapshotter();
        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(RelayError::Io(e)),
            };
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };
        if let Some(task) = snapshotter {
            task.abort();
        }
        result
    }

    fn spawn_snapshotter(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.inner.snapshots.as_ref()?;
        let server = self.clone();
        let period = self.inner.config.snapshot_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                server.persist_dirty_rooms().await;
            }
        }))
    }

    /// Snapshot every room changed since its last snapshot.
    pub async fn persist_dirty_rooms(&self) -> usize {
        let mut persisted = 0;
        for room in self.inner.rooms.rooms().await {
            if room.take_dirty() {
                if self.persist_room(&room) {
                    persisted += 1;
                } else {
                    room.mark_dirty();
                }
            }
        }
        persisted
    }

    fn persist_room(&self, room: &DocumentRoom) -> bool {
        let Some(store) = &self.inner.snapshots else {
            return false;
        };
        let state = room.fragments.encode_state();
        match store.save_snapshot(room.room_id, &state) {
            Ok(meta) => {
                self.inner.stats.persisted_snapshots.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Persisted room {} v{} ({} -> {} bytes)",
                    room.room_id,
                    meta.version,
                    meta.snapshot_size,
                    meta.compressed_size
                );
                true
            }
            Err(e) => {
                log::error!("Failed to persist room {}: {e}", room.room_id);
                false
            }
        }
    }

    async fn open_room(&self, room_id: Uuid) -> Arc<DocumentRoom> {
        let (room, created) = self.inner.rooms.get_or_create(room_id).await;
        if !created {
            return room;
        }
        log::info!("Opened room {room_id}");
        if let Some(store) = &self.inner.snapshots {
            match store.load_snapshot(room_id) {
                Ok(Some(state)) => match room.fragments.apply_remote_update(&state) {
                    Ok(()) => log::info!("Loaded persisted snapshot for room {room_id}"),
                    Err(e) => log::error!("Snapshot of room {room_id} is unreadable: {e}"),
                },
                Ok(None) => {}
                Err(e) => log::warn!("Could not load snapshot for room {room_id}: {e}"),
            }
        }
        room
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), RelayError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        let stats = &self.inner.stats;
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let mut peer_id: Option<Uuid> = None;
        let mut room: Option<Arc<DocumentRoom>> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Envelope>> = None;

        let result: Result<(), RelayError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let bytes: Vec<u8> = match msg {
                            Some(Ok(Message::Binary(data))) => data.into(),
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        stats.total_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);

                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("Failed to decode frame from {addr}: {e}");
                                continue;
                            }
                        };

                        match sync_msg.msg_type {
                            MessageType::PeerJoined => {
                                if room.is_some() {
                                    log::warn!("Peer {} sent a second join; ignored", sync_msg.peer_id);
                                    continue;
                                }
                                let identity = sync_msg.peer_identity().unwrap_or_else(|_| {
                                    PeerIdentity::new(Uuid::nil(), "Anonymous")
                                });
                                let joined = self.open_room(sync_msg.room_id).await;

                                // Introduce the peers already in the room.
                                for (existing_id, existing) in joined.broadcast.peers().await {
                                    let intro = SyncMessage::peer_joined(existing_id, joined.room_id, &existing)?;
                                    ws_sender.send(Message::Binary(intro.encode()?.into())).await?;
                                }

                                broadcast_rx = Some(joined.broadcast.add_peer(sync_msg.peer_id, identity.clone()).await);
                                joined.broadcast.broadcast(&sync_msg)?;

                                let server_sv = SyncMessage::sync_step1(Uuid::nil(), joined.room_id, joined.fragments.state_vector());
                                ws_sender.send(Message::Binary(server_sv.encode()?.into())).await?;

                                log::info!(
                                    "Peer {} ({}) joined room {}",
                                    identity.name,
                                    sync_msg.peer_id,
                                    joined.room_id
                                );
                                peer_id = Some(sync_msg.peer_id);
                                room = Some(joined);
                            }

                            MessageType::SyncStep1 => {
                                let Some(joined) = &room else { continue };
                                match joined.fragments.encode_diff(&sync_msg.payload) {
                                    Ok(diff) => {
                                        let reply = SyncMessage::sync_step2(Uuid::nil(), joined.room_id, diff);
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    }
                                    Err(e) => log::warn!("Bad state vector from {addr}: {e}"),
                                }
                            }

                            MessageType::SyncStep2 | MessageType::Delta => {
                                let Some(joined) = &room else { continue };
                                if let Err(e) = joined.fragments.apply_remote_update(&sync_msg.payload) {
                                    log::warn!("Rejected update from {addr}: {e}");
                                    continue;
                                }
                                joined.mark_dirty();
                                // Handshake payloads reach the rest of the room as deltas.
                                let relayed = SyncMessage::delta(
                                    sync_msg.peer_id,
                                    joined.room_id,
                                    sync_msg.clock,
                                    sync_msg.payload,
                                );
                                joined.broadcast.broadcast(&relayed)?;
                            }

                            MessageType::Awareness => {
                                let Some(joined) = &room else { continue };
                                match sync_msg.awareness_message() {
                                    Ok(AwarenessMessage::Join(identity)) => {
                                        log::debug!("Presence: {} joined room {}", identity.name, joined.room_id);
                                    }
                                    Ok(AwarenessMessage::Leave { user_id }) => {
                                        log::debug!("Presence: {user_id} left room {}", joined.room_id);
                                    }
                                    Ok(AwarenessMessage::Focus { .. }) => {
                                        log::trace!("Presence: focus update in room {}", joined.room_id);
                                    }
                                    Err(e) => log::warn!("Bad awareness payload from {addr}: {e}"),
                                }
                                joined.broadcast.broadcast(&sync_msg)?;
                            }

                            MessageType::Ping => {
                                let pong = SyncMessage::pong(peer_id.unwrap_or(sync_msg.peer_id));
                                ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                            }

                            MessageType::PeerLeft | MessageType::Pong => {}
                        }
                    }

                    envelope = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match envelope {
                            Ok(envelope) => {
                                if Some(envelope.from) == peer_id {
                                    continue;
                                }
                                ws_sender.send(Message::Binary(envelope.bytes.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                // Missed deltas are recovered by a fresh handshake.
                                log::warn!("Peer {peer_id:?} lagged by {n} frames; resyncing");
                                if let Some(joined) = &room {
                                    let resync = SyncMessage::sync_step1(Uuid::nil(), joined.room_id, joined.fragments.state_vector());
                                    ws_sender.send(Message::Binary(resync.encode()?.into())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        if let (Some(pid), Some(joined)) = (peer_id, room) {
            self.leave_room(pid, &joined).await;
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn leave_room(&self, peer_id: Uuid, room: &DocumentRoom) {
        room.broadcast.remove_peer(&peer_id).await;
        if let Err(e) = room.broadcast.broadcast(&SyncMessage::peer_left(peer_id, room.room_id)) {
            log::warn!("Failed to announce departure of {peer_id}: {e}");
        }

        if let Some(closed) = self.inner.rooms.remove_if_empty(&room.room_id).await {
            if closed.take_dirty() {
                self.persist_room(&closed);
            }
            log::info!("Room {} closed (empty)", closed.room_id);
        }
    }

    pub async fn room(&self, room_id: &Uuid) -> Option<Arc<DocumentRoom>> {
        self.inner.rooms.get(room_id).await
    }

    pub async fn stats(&self) -> ServerStats {
        let stats = &self.inner.stats;
        ServerStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            total_messages: stats.total_messages.load(Ordering::Relaxed),
            total_bytes: stats.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.inner.rooms.room_count().await,
            persisted_snapshots: stats.persisted_snapshots.load(Ordering::Relaxed),
        }
    }
}
