//! Reconnecting relay client for one document room.
//!
//! Provides:
//! - Connection lifecycle with exponential backoff
//! - Handshake and delta exchange wired straight into a [`FragmentManager`]
//! - Presence messages
//! - Offline queue for updates produced while disconnected
//!
//! The client owns the CRDT axis of the [`ConnectionStatusTracker`]; nothing
//! else writes it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use quire_core::model::DocumentId;

use crate::fragment::FragmentManager;
use crate::presence::{AwarenessMessage, PeerIdentity};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::status::{ConnectionStatusTracker, CrdtState};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Updates kept while offline before new ones are refused
    pub offline_queue_capacity: usize,
    pub event_capacity: usize,
    pub auto_reconnect: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            offline_queue_capacity: 10_000,
            event_capacity: 256,
            auto_reconnect: true,
        }
    }
}

impl TransportConfig {
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(200),
            offline_queue_capacity: 64,
            event_capacity: 64,
            auto_reconnect: true,
        }
    }
}

/// Events emitted to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    /// Handshake answer merged into the local room.
    StateSynced,
    /// A remote delta was merged into the local room.
    RemoteUpdate { peer_id: Uuid, clock: u64 },
    RemoteAwareness { peer_id: Uuid, message: AwarenessMessage },
    PeerJoined { peer_id: Uuid, identity: PeerIdentity },
    PeerLeft(Uuid),
}

/// Updates produced while disconnected, replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<(u64, Vec<u8>)>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns false when full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back((clock, payload));
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|(_, payload)| payload.len()).sum()
    }
}

struct Shared {
    config: TransportConfig,
    peer_id: Uuid,
    identity: PeerIdentity,
    room_id: DocumentId,
    fragments: Arc<FragmentManager>,
    tracker: Arc<ConnectionStatusTracker>,
    clock: AtomicU64,
    queue: Mutex<OfflineQueue>,
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    events: mpsc::Sender<TransportEvent>,
}

/// Relay client bound to one document room.
pub struct TransportClient {
    shared: Arc<Shared>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
}

impl TransportClient {
    pub fn new(
        config: TransportConfig,
        fragments: Arc<FragmentManager>,
        tracker: Arc<ConnectionStatusTracker>,
    ) -> Self {
        let (events, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(OfflineQueue::new(config.offline_queue_capacity)),
                config,
                peer_id: Uuid::new_v4(),
                identity: fragments.identity().clone(),
                room_id: fragments.room_id(),
                fragments,
                tracker,
                clock: AtomicU64::new(0),
                outgoing: Mutex::new(None),
                events,
            }),
            supervisor: std::sync::Mutex::new(None),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (only once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    pub fn peer_id(&self) -> Uuid {
        self.shared.peer_id
    }

    pub fn room_id(&self) -> DocumentId {
        self.shared.room_id
    }

    pub fn connection_state(&self) -> CrdtState {
        self.shared.tracker.status().crdt
    }

    pub fn clock(&self) -> u64 {
        self.shared.clock.load(Ordering::SeqCst)
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    /// Start the connection supervisor. Calling it twice restarts it.
    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move { shared.supervise().await });
        if let Ok(mut slot) = self.supervisor.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
    }

    /// Stop the supervisor and drop the connection.
    pub async fn stop(&self) {
        let task = self.supervisor.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            task.abort();
        }
        self.shared.outgoing.lock().await.take();
        self.shared.tracker.set_crdt(CrdtState::Disconnected);
        self.shared.emit(TransportEvent::Disconnected);
    }

    /// Send whatever changed locally since the last call. Returns whether
    /// anything was pending.
    pub async fn publish_local_changes(&self) -> Result<bool, ProtocolError> {
        let update = self
            .shared
            .fragments
            .take_pending_update()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        match update {
            Some(update) => {
                self.send_update(update).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Send a room update, or queue it while disconnected.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let clock = self.shared.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let msg = SyncMessage::delta(self.shared.peer_id, self.shared.room_id, clock, update);

        if self.shared.send(&msg).await.is_ok() {
            return Ok(());
        }
        let mut queue = self.shared.queue.lock().await;
        if queue.enqueue(clock, msg.payload) {
            log::trace!("Queued update {clock} for room {}", self.shared.room_id);
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed)
        }
    }

    /// Send a presence message. Dropped while offline.
    pub async fn send_awareness(&self, message: &AwarenessMessage) -> Result<(), ProtocolError> {
        let clock = self.clock();
        let msg = SyncMessage::awareness(self.shared.peer_id, self.shared.room_id, clock, message)?;
        match self.shared.send(&msg).await {
            Ok(()) | Err(ProtocolError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.shared.send(&SyncMessage::ping(self.shared.peer_id)).await
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.supervisor.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            log::trace!("Event channel full; dropped {event:?}");
        }
    }

    async fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let outgoing = self.outgoing.lock().await.clone();
        match outgoing {
            Some(tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut backoff = self.config.initial_backoff;
        self.tracker.set_crdt(CrdtState::Connecting);

        loop {
            match self.run_connection().await {
                Ok(()) => backoff = self.config.initial_backoff,
                Err(e) => log::debug!("Relay connection to room {} failed: {e}", self.room_id),
            }
            self.outgoing.lock().await.take();

            if !self.config.auto_reconnect {
                self.tracker.set_crdt(CrdtState::Disconnected);
                self.emit(TransportEvent::Disconnected);
                return;
            }

            self.tracker.set_crdt(CrdtState::Reconnecting);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// One connection from open to close. `Ok` once the connection was
    /// established, whatever ended it.
    async fn run_connection(&self) -> Result<(), ProtocolError> {
        let url = format!("{}/{}", self.config.server_url, self.room_id);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
        });

        let join = SyncMessage::peer_joined(self.peer_id, self.room_id, &self.identity)?;
        let step1 = SyncMessage::sync_step1(self.peer_id, self.room_id, self.fragments.state_vector());
        for msg in [join, step1] {
            out_tx
                .send(msg.encode()?)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        *self.outgoing.lock().await = Some(out_tx.clone());

        self.tracker.set_crdt(CrdtState::Connected);
        self.emit(TransportEvent::Connected);
        log::info!("Connected to room {} as {}", self.room_id, self.peer_id);

        let queued = self.queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates", queued.len());
            for (clock, payload) in queued {
                let msg = SyncMessage::delta(self.peer_id, self.room_id, clock, payload);
                let _ = out_tx.send(msg.encode()?).await;
            }
        }

        while let Some(frame) = ws_reader.next().await {
            let bytes: Vec<u8> = match frame {
                Ok(Message::Binary(data)) => data.into(),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            let msg = match SyncMessage::decode(&bytes) {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("Undecodable frame from relay: {e}");
                    continue;
                }
            };
            if msg.peer_id == self.peer_id {
                continue;
            }
            self.clock.fetch_max(msg.clock, Ordering::SeqCst);
            self.handle_message(msg, &out_tx).await;
        }

        writer.abort();
        log::info!("Disconnected from room {}", self.room_id);
        self.emit(TransportEvent::Disconnected);
        Ok(())
    }

    async fn handle_message(&self, msg: SyncMessage, out_tx: &mpsc::Sender<Vec<u8>>) {
        match msg.msg_type {
            MessageType::SyncStep1 => match self.fragments.encode_diff(&msg.payload) {
                Ok(diff) => {
                    let reply = SyncMessage::sync_step2(self.peer_id, self.room_id, diff);
                    if let Ok(encoded) = reply.encode() {
                        let _ = out_tx.send(encoded).await;
                    }
                }
                Err(e) => log::warn!("Bad state vector from relay: {e}"),
            },
            MessageType::SyncStep2 => match self.fragments.apply_remote_update(&msg.payload) {
                Ok(()) => self.emit(TransportEvent::StateSynced),
                Err(e) => log::warn!("Could not apply handshake state: {e}"),
            },
            MessageType::Delta => match self.fragments.apply_remote_update(&msg.payload) {
                Ok(()) => self.emit(TransportEvent::RemoteUpdate {
                    peer_id: msg.peer_id,
                    clock: msg.clock,
                }),
                Err(e) => log::warn!("Could not apply delta from {}: {e}", msg.peer_id),
            },
            MessageType::Awareness => {
                if let Ok(message) = msg.awareness_message() {
                    self.emit(TransportEvent::RemoteAwareness {
                        peer_id: msg.peer_id,
                        message,
                    });
                }
            }
            MessageType::PeerJoined => {
                if let Ok(identity) = msg.peer_identity() {
                    self.emit(TransportEvent::PeerJoined {
                        peer_id: msg.peer_id,
                        identity,
                    });
                }
            }
            MessageType::PeerLeft => self.emit(TransportEvent::PeerLeft(msg.peer_id)),
            MessageType::Ping | MessageType::Pong => {}
        }
    }
}
