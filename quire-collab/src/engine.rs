//! Hybrid sync engine: local buffer + debounced durable backup.
//!
//! ```text
//! editor change ──► on_local_change(page, accessor)
//!                      │
//!                      ├─► PageBuffer (latest content, revision, dirty)
//!                      │
//!                      └─► debounce task: sleep(debounce) ─► revision still current?
//!                                                              │ yes
//!                                       durable reachable? ◄───┘
//!                                          │ yes          │ no
//!                                          ▼              ▼
//!                              put(PageContentRecord)   stay dirty
//!                                          │
//!                                on_synced(page_id)
//!
//! durable axis reconnects ──► watch_reconnects ──► replay every dirty page
//! ```
//!
//! Writes are last-write-wins and idempotent: replaying the latest buffered
//! content twice is harmless. CRDT replication is independent of all this;
//! the engine never touches transport state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use quire_core::content::{Node, PageContent};
use quire_core::model::{now_millis, DocumentId, PageContentRecord, PageId, UserId};

use crate::status::SyncStatus;
use crate::storage::{RecordStore, StoreError};

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Keep the latest content of every page in memory until it is durable.
    pub local_buffer: bool,
    /// Write page content to the durable store at all.
    pub durable_backup: bool,
    /// Quiet period before a durable write.
    pub debounce: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_buffer: true,
            durable_backup: true,
            debounce: Duration::from_millis(1500),
        }
    }
}

impl SyncConfig {
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

/// Page a change belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageTarget {
    pub page_id: PageId,
    pub document_id: DocumentId,
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub changes: u64,
    pub writes: u64,
    pub failures: u64,
    /// Debounced writes dropped because the durable axis was down.
    pub skipped: u64,
}

#[derive(Default)]
struct AtomicEngineStats {
    changes: AtomicU64,
    writes: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
}

impl AtomicEngineStats {
    fn snapshot(&self) -> EngineStats {
        EngineStats {
            changes: self.changes.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

struct PageBuffer {
    document_id: DocumentId,
    content: PageContent,
    revision: u64,
    dirty: bool,
    timer: Option<JoinHandle<()>>,
}

/// Called with the page id after each successful durable write.
pub type SyncedCallback = Arc<dyn Fn(PageId) + Send + Sync>;

struct Shared<S> {
    store: Arc<S>,
    status: watch::Receiver<SyncStatus>,
    config: SyncConfig,
    actor: UserId,
    buffers: Mutex<HashMap<PageId, PageBuffer>>,
    on_synced: Mutex<Option<SyncedCallback>>,
    stats: AtomicEngineStats,
}

/// Buffers local edits and backs them up to the durable store.
///
/// Must be used inside a tokio runtime.
pub struct HybridSyncEngine<S: RecordStore + 'static> {
    shared: Arc<Shared<S>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: RecordStore + 'static> HybridSyncEngine<S> {
    pub fn new(
        store: Arc<S>,
        status: watch::Receiver<SyncStatus>,
        config: SyncConfig,
        actor: UserId,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                status,
                config,
                actor,
                buffers: Mutex::new(HashMap::new()),
                on_synced: Mutex::new(None),
                stats: AtomicEngineStats::default(),
            }),
            reconnect_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    pub fn set_on_synced(&self, callback: SyncedCallback) {
        if let Ok(mut slot) = self.shared.on_synced.lock() {
            *slot = Some(callback);
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.stats.snapshot()
    }

    /// Record a local edit.
    ///
    /// `accessor` yields the editor's current document; only allow-listed
    /// blocks reach the buffer and the durable store.
    pub fn on_local_change<F>(&self, page: PageTarget, accessor: F)
    where
        F: FnOnce() -> Node,
    {
        let content = PageContent::from_doc(&accessor());
        self.shared.stats.changes.fetch_add(1, Ordering::Relaxed);

        let Ok(mut buffers) = self.shared.buffers.lock() else {
            log::warn!("Sync buffer lock poisoned; dropping change for page {}", page.page_id);
            return;
        };
        let buffer = buffers.entry(page.page_id).or_insert_with(|| PageBuffer {
            document_id: page.document_id,
            content: PageContent::empty(),
            revision: 0,
            dirty: false,
            timer: None,
        });
        buffer.content = content;
        buffer.revision += 1;
        buffer.dirty = true;

        if !self.shared.config.durable_backup {
            return;
        }

        if let Some(timer) = buffer.timer.take() {
            timer.abort();
        }
        let shared = Arc::clone(&self.shared);
        let page_id = page.page_id;
        let revision = buffer.revision;
        buffer.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(shared.config.debounce).await;
            shared.flush_page(page_id, Some(revision));
        }));
    }

    /// Latest buffered content of a page, if any.
    pub fn buffered(&self, page_id: PageId) -> Option<PageContent> {
        let buffers = self.shared.buffers.lock().ok()?;
        buffers.get(&page_id).map(|b| b.content.clone())
    }

    pub fn is_dirty(&self, page_id: PageId) -> bool {
        self.shared
            .buffers
            .lock()
            .map(|b| b.get(&page_id).is_some_and(|p| p.dirty))
            .unwrap_or(false)
    }

    pub fn dirty_pages(&self) -> Vec<PageId> {
        self.shared.dirty_pages()
    }

    /// Write every dirty page now, bypassing the debounce. Returns the
    /// number of pages written.
    pub fn flush_all(&self) -> usize {
        self.shared.replay_dirty()
    }

    /// Replay dirty pages every time the durable axis becomes reachable.
    pub fn watch_reconnects(&self) {
        let shared = Arc::clone(&self.shared);
        let mut rx = self.shared.status.clone();
        let task = tokio::spawn(async move {
            let mut was_reachable = rx.borrow_and_update().is_durable_reachable();
            while rx.changed().await.is_ok() {
                let reachable = rx.borrow_and_update().is_durable_reachable();
                if reachable && !was_reachable {
                    let replayed = shared.replay_dirty();
                    if replayed > 0 {
                        log::info!("Durable store back; replayed {replayed} buffered page(s)");
                    }
                }
                was_reachable = reachable;
            }
        });

        if let Ok(mut slot) = self.reconnect_task.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
    }

    /// Stop timers and drop buffers and bindings.
    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.reconnect_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        if let Ok(mut buffers) = self.shared.buffers.lock() {
            for (_, buffer) in buffers.drain() {
                if let Some(timer) = buffer.timer {
                    timer.abort();
                }
            }
        }
    }
}

impl<S: RecordStore + 'static> Drop for HybridSyncEngine<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<S: RecordStore> Shared<S> {
    fn dirty_pages(&self) -> Vec<PageId> {
        self.buffers
            .lock()
            .map(|b| b.iter().filter(|(_, p)| p.dirty).map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    fn replay_dirty(&self) -> usize {
        self.dirty_pages()
            .into_iter()
            .filter(|page_id| self.flush_page(*page_id, None))
            .count()
    }

    /// Write a page's buffered content. With `expected` set, only if the
    /// buffer is still at that revision. Returns whether a write happened.
    fn flush_page(&self, page_id: PageId, expected: Option<u64>) -> bool {
        let record = {
            let Ok(buffers) = self.buffers.lock() else {
                return false;
            };
            let Some(buffer) = buffers.get(&page_id) else {
                return false;
            };
            if !buffer.dirty || expected.is_some_and(|rev| rev != buffer.revision) {
                return false;
            }
            if !self.status.borrow().is_durable_reachable() {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Durable store unreachable; page {page_id} stays buffered");
                return false;
            }
            (
                buffer.revision,
                PageContentRecord {
                    page_id,
                    document_id: buffer.document_id,
                    content: buffer.content.clone(),
                    updated_at: now_millis(),
                    updated_by: self.actor,
                },
            )
        };

        let (revision, record) = record;
        match self.store.put(&record) {
            Ok(()) => {
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
                self.mark_clean(page_id, revision);
                log::debug!("Backed up page {page_id} (rev {revision})");
                let callback = self.on_synced.lock().ok().and_then(|c| c.clone());
                if let Some(callback) = callback {
                    callback(page_id);
                }
                true
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Durable write for page {page_id} failed: {e}");
                self.after_failure(page_id, &e);
                false
            }
        }
    }

    fn mark_clean(&self, page_id: PageId, revision: u64) {
        let Ok(mut buffers) = self.buffers.lock() else {
            return;
        };
        if let Some(buffer) = buffers.get_mut(&page_id) {
            // A newer edit arrived while writing; it stays dirty.
            if buffer.revision == revision {
                buffer.dirty = false;
                if !self.config.local_buffer {
                    buffers.remove(&page_id);
                }
            }
        }
    }

    fn after_failure(&self, page_id: PageId, error: &StoreError) {
        if self.config.local_buffer {
            return;
        }
        // Without a local buffer there is nothing to replay from.
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.remove(&page_id);
        }
        log::warn!("Dropped unbuffered content of page {page_id} after {error}");
    }
}
