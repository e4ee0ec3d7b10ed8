//! In-memory record and snapshot store.
//!
//! Same semantics as [`RocksStore`](super::RocksStore) (JSON-encoded
//! records, exact secondary indexes, id-ordered scans), held behind one
//! `RwLock`. `set_available(false)` makes every call fail with
//! [`StoreError::Unavailable`], which is how outages are simulated.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

use super::{
    decode_record, encode_record, Record, RecordStore, SnapshotMeta, SnapshotStore, StoreError,
};

const MAX_ID: Uuid = Uuid::from_bytes([0xff; 16]);

type IndexKey = (&'static str, String, Vec<u8>, Uuid);

#[derive(Default)]
struct Inner {
    records: BTreeMap<(&'static str, Uuid), Vec<u8>>,
    indexes: BTreeSet<IndexKey>,
    snapshots: BTreeMap<Uuid, (Vec<u8>, SnapshotMeta)>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    available: AtomicBool,
    writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }

    /// Toggle simulated availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of successful record and snapshot writes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.check()?;
        self.inner.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.check()?;
        self.inner.write().map_err(|_| StoreError::Poisoned)
    }
}

impl RecordStore for MemoryStore {
    fn put<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let id = record.id();
        let value = encode_record(record)?;
        let mut inner = self.write()?;

        if let Some(previous) = inner.records.get(&(R::COLLECTION, id)) {
            let previous: R = decode_record(previous)?;
            for entry in previous.index_entries() {
                inner
                    .indexes
                    .remove(&(R::COLLECTION, entry.index.to_string(), entry.key, id));
            }
        }
        for entry in record.index_entries() {
            inner
                .indexes
                .insert((R::COLLECTION, entry.index.to_string(), entry.key, id));
        }
        inner.records.insert((R::COLLECTION, id), value);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn get<R: Record>(&self, id: Uuid) -> Result<Option<R>, StoreError> {
        let inner = self.read()?;
        inner
            .records
            .get(&(R::COLLECTION, id))
            .map(|bytes| decode_record(bytes))
            .transpose()
    }

    fn delete<R: Record>(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.write()?;
        let Some(previous) = inner.records.remove(&(R::COLLECTION, id)) else {
            return Ok(false);
        };
        let previous: R = decode_record(&previous)?;
        for entry in previous.index_entries() {
            inner
                .indexes
                .remove(&(R::COLLECTION, entry.index.to_string(), entry.key, id));
        }
        Ok(true)
    }

    fn scan_index<R: Record>(&self, index: &str, key: &[u8]) -> Result<Vec<R>, StoreError> {
        let inner = self.read()?;
        let lower = (R::COLLECTION, index.to_string(), key.to_vec(), Uuid::nil());
        let upper = (R::COLLECTION, index.to_string(), key.to_vec(), MAX_ID);

        let mut records = Vec::new();
        for (_, _, _, id) in inner.indexes.range(lower..=upper) {
            if let Some(bytes) = inner.records.get(&(R::COLLECTION, *id)) {
                records.push(decode_record(bytes)?);
            }
        }
        Ok(records)
    }

    fn scan_all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let inner = self.read()?;
        inner
            .records
            .range((R::COLLECTION, Uuid::nil())..=(R::COLLECTION, MAX_ID))
            .map(|(_, bytes)| decode_record(bytes))
            .collect()
    }
}

impl SnapshotStore for MemoryStore {
    fn save_snapshot(&self, room_id: Uuid, state: &[u8]) -> Result<SnapshotMeta, StoreError> {
        let mut inner = self.write()?;
        let previous = inner.snapshots.get(&room_id).map(|(_, meta)| meta.clone());
        let meta = SnapshotMeta::next(previous, room_id, state.len(), state.len());
        inner
            .snapshots
            .insert(room_id, (state.to_vec(), meta.clone()));
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(meta)
    }

    fn load_snapshot(&self, room_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.read()?;
        Ok(inner.snapshots.get(&room_id).map(|(state, _)| state.clone()))
    }

    fn snapshot_meta(&self, room_id: Uuid) -> Result<Option<SnapshotMeta>, StoreError> {
        let inner = self.read()?;
        Ok(inner.snapshots.get(&room_id).map(|(_, meta)| meta.clone()))
    }

    fn list_snapshots(&self) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.read()?;
        Ok(inner.snapshots.keys().copied().collect())
    }
}
