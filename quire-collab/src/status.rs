//! Two-axis connection status.
//!
//! ```text
//!  CRDT transport ─────┐
//!  (TransportClient)   ├──► ConnectionStatusTracker ──► watch<SyncStatus>
//!  durable query ──────┘          (pure derivation)
//! ```
//!
//! | CRDT                         | Durable    | Mode               |
//! |------------------------------|------------|--------------------|
//! | connected                    | connected  | real-time          |
//! | connecting/reconnecting/down | connected  | durable-only       |
//! | connected                    | connecting | backup-unavailable |
//! | connecting/reconnecting/down | connecting | local-only         |

use tokio::sync::watch;

/// State of the collaborative transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CrdtState {
    #[default]
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// State of the durable backup channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DurableState {
    #[default]
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncMode {
    /// Both channels up.
    RealTime,
    /// Only the durable store is reachable.
    DurableOnly,
    /// Neither channel is reachable; edits stay in the local buffer.
    LocalOnly,
    /// Peers are live but nothing is being backed up.
    BackupUnavailable,
}

impl SyncMode {
    pub fn derive(crdt: CrdtState, durable: DurableState) -> Self {
        match (crdt, durable) {
            (CrdtState::Connected, DurableState::Connected) => SyncMode::RealTime,
            (CrdtState::Connected, DurableState::Connecting) => SyncMode::BackupUnavailable,
            (_, DurableState::Connected) => SyncMode::DurableOnly,
            (_, DurableState::Connecting) => SyncMode::LocalOnly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::RealTime => "real-time",
            SyncMode::DurableOnly => "durable-only",
            SyncMode::LocalOnly => "local-only",
            SyncMode::BackupUnavailable => "backup-unavailable",
        }
    }
}

/// Reconciled status published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    pub crdt: CrdtState,
    pub durable: DurableState,
    pub mode: SyncMode,
}

impl SyncStatus {
    pub fn new(crdt: CrdtState, durable: DurableState) -> Self {
        Self {
            crdt,
            durable,
            mode: SyncMode::derive(crdt, durable),
        }
    }

    pub fn is_durable_reachable(&self) -> bool {
        self.durable == DurableState::Connected
    }

    pub fn is_crdt_connected(&self) -> bool {
        self.crdt == CrdtState::Connected
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::new(CrdtState::default(), DurableState::default())
    }
}

/// Observes both channels and publishes the derived [`SyncStatus`].
///
/// Has no side effects beyond publishing.
pub struct ConnectionStatusTracker {
    tx: watch::Sender<SyncStatus>,
}

impl Default for ConnectionStatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStatusTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::default());
        Self { tx }
    }

    pub fn status(&self) -> SyncStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Record a transport state change.
    pub fn set_crdt(&self, crdt: CrdtState) {
        self.publish(|status| status.crdt = crdt);
    }

    pub fn set_durable(&self, durable: DurableState) {
        self.publish(|status| status.durable = durable);
    }

    /// Feed the outcome of the durable content query.
    ///
    /// A defined result, even an empty one, means the durable channel is
    /// reachable. An undefined result (page switch, query error) means it is
    /// connecting again.
    pub fn on_durable_query<T>(&self, result: Option<&T>) {
        let durable = if result.is_some() {
            DurableState::Connected
        } else {
            DurableState::Connecting
        };
        self.set_durable(durable);
    }

    fn publish(&self, change: impl FnOnce(&mut SyncStatus)) {
        self.tx.send_if_modified(|status| {
            let before = *status;
            change(status);
            *status = SyncStatus::new(status.crdt, status.durable);
            if *status != before {
                log::debug!("Sync mode {} ({:?}/{:?})", status.mode.as_str(), status.crdt, status.durable);
                true
            } else {
                false
            }
        });
    }
}
