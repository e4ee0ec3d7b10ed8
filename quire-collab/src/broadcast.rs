//! Per-document fan-out.
//!
//! Each document room owns one tokio broadcast channel; every connection
//! in the room holds a receiver buffering up to `capacity` frames. Frames
//! are encoded once and shared as `Arc<Vec<u8>>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::fragment::FragmentManager;
use crate::presence::PeerIdentity;
use crate::protocol::{ProtocolError, SyncMessage};

/// An encoded frame plus the connection that produced it, so receivers
/// can skip their own frames without decoding.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// Connections of one document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    peers: RwLock<HashMap<Uuid, PeerIdentity>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a connection and return its receiver.
    pub async fn add_peer(&self, peer_id: Uuid, identity: PeerIdentity) -> broadcast::Receiver<Envelope> {
        self.peers.write().await.insert(peer_id, identity);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerIdentity> {
        self.peers.write().await.remove(peer_id)
    }

    /// Send to every receiver in the room, sender included; receivers
    /// filter on [`Envelope::from`]. Returns the receiver count.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(msg.peer_id, bytes))
    }

    pub fn broadcast_raw(&self, from: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Envelope { from, bytes }).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Connected peers with their identities.
    pub async fn peers(&self) -> Vec<(Uuid, PeerIdentity)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(id, identity)| (*id, identity.clone()))
            .collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One live document room: authoritative CRDT state plus its connections.
pub struct DocumentRoom {
    pub room_id: Uuid,
    pub fragments: FragmentManager,
    pub broadcast: BroadcastGroup,
    /// Changed since the last snapshot.
    dirty: AtomicBool,
}

impl DocumentRoom {
    pub fn new(room_id: Uuid, capacity: usize) -> Self {
        Self {
            room_id,
            fragments: FragmentManager::new(room_id, PeerIdentity::system()),
            broadcast: BroadcastGroup::new(capacity),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clear the dirty flag, returning whether it was set.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Maps document ids to rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<DocumentRoom>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get(&self, room_id: &Uuid) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Get or create a room. The flag is true when the room was created.
    pub async fn get_or_create(&self, room_id: Uuid) -> (Arc<DocumentRoom>, bool) {
        if let Some(room) = self.rooms.read().await.get(&room_id) {
            return (room.clone(), false);
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&room_id) {
            return (room.clone(), false);
        }
        let room = Arc::new(DocumentRoom::new(room_id, self.default_capacity));
        rooms.insert(room_id, room.clone());
        (room, true)
    }

    /// Remove a room with no connections. Returns the removed room.
    pub async fn remove_if_empty(&self, room_id: &Uuid) -> Option<Arc<DocumentRoom>> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get(room_id)?;
        if room.broadcast.peer_count().await > 0 {
            return None;
        }
        rooms.remove(room_id)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn rooms(&self) -> Vec<Arc<DocumentRoom>> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }
}
