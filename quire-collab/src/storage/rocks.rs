//! RocksDB-backed record and snapshot store.
//!
//! Column families:
//! - `records`:       JSON records, keyed by `collection \0 id`
//! - `indexes`:       secondary index entries (empty values)
//! - `snapshots`:     encoded CRDT room state (LZ4 compressed)
//! - `snapshot_meta`: per-room snapshot bookkeeping (bincode)
//!
//! Index key layout:
//! ```text
//! collection \0 index \0 len(key):u16 BE │ key │ record id (16 bytes)
//! ```
//! The length prefix keeps `scan_index` exact: a key that is a prefix of
//! another key never matches it.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use super::{
    decode_record, encode_record, IndexEntry, Record, RecordStore, SnapshotMeta, SnapshotStore,
    StoreError,
};

const CF_RECORDS: &str = "records";
const CF_INDEXES: &str = "indexes";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_SNAPSHOT_META: &str = "snapshot_meta";

const COLUMN_FAMILIES: &[&str] = &[CF_RECORDS, CF_INDEXES, CF_SNAPSHOTS, CF_SNAPSHOT_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl SnapshotMeta {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed durable store.
///
/// Every `put`, `delete` and `save_snapshot` is one atomic `WriteBatch`.
/// Writes are serialized so that stale index entries are computed against
/// the record actually being replaced.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened record store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_RECORDS | CF_SNAPSHOT_META => {
                opts.set_max_write_buffer_number(2);
            }
            CF_INDEXES => {
                // Many tiny keys, always range-scanned.
                opts.set_max_write_buffer_number(4);
            }
            CF_SNAPSHOTS => {
                // Values are already LZ4 compressed.
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Force a flush of the memtables.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock.lock().map_err(|_| StoreError::Poisoned)
    }

    fn collection_prefix(collection: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(collection.len() + 1);
        key.extend_from_slice(collection.as_bytes());
        key.push(0);
        key
    }

    fn record_key(collection: &str, id: Uuid) -> Vec<u8> {
        let mut key = Self::collection_prefix(collection);
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn index_prefix(collection: &str, index: &str, value: &[u8]) -> Vec<u8> {
        let mut key = Self::collection_prefix(collection);
        key.extend_from_slice(index.as_bytes());
        key.push(0);
        key.extend_from_slice(&(value.len() as u16).to_be_bytes());
        key.extend_from_slice(value);
        key
    }

    fn index_key(collection: &str, entry: &IndexEntry, id: Uuid) -> Vec<u8> {
        let mut key = Self::index_prefix(collection, entry.index, &entry.key);
        key.extend_from_slice(id.as_bytes());
        key
    }

    /// Trailing 16 bytes of a key as a record id.
    fn trailing_id(key: &[u8]) -> Result<Uuid, StoreError> {
        if key.len() < 16 {
            return Err(StoreError::Deserialization("Key too short for id".into()));
        }
        let bytes: [u8; 16] = key[key.len() - 16..]
            .try_into()
            .map_err(|_| StoreError::Deserialization("Invalid UUID key".into()))?;
        Ok(Uuid::from_bytes(bytes))
    }

    /// Visit every key under `prefix` in `cf`, in key order.
    fn scan_prefix(
        &self,
        cf_name: &str,
        prefix: &[u8],
        mut visit: impl FnMut(&[u8], &[u8]) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            visit(&key, &value)?;
        }
        Ok(())
    }
}

impl RecordStore for RocksStore {
    fn put<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let cf_records = self.cf(CF_RECORDS)?;
        let cf_indexes = self.cf(CF_INDEXES)?;
        let id = record.id();
        let key = Self::record_key(R::COLLECTION, id);
        let value = encode_record(record)?;

        let _guard = self.lock()?;
        let mut batch = WriteBatch::default();

        if let Some(previous) = self.db.get_cf(&cf_records, &key)? {
            let previous: R = decode_record(&previous)?;
            for entry in previous.index_entries() {
                batch.delete_cf(&cf_indexes, Self::index_key(R::COLLECTION, &entry, id));
            }
        }
        for entry in record.index_entries() {
            batch.put_cf(&cf_indexes, Self::index_key(R::COLLECTION, &entry, id), b"");
        }
        batch.put_cf(&cf_records, &key, &value);

        self.db.write_opt(batch, &self.write_opts())?;
        log::trace!("put {}/{id} ({} bytes)", R::COLLECTION, value.len());
        Ok(())
    }

    fn get<R: Record>(&self, id: Uuid) -> Result<Option<R>, StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        match self.db.get_cf(&cf, Self::record_key(R::COLLECTION, id))? {
            Some(bytes) => decode_record(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn delete<R: Record>(&self, id: Uuid) -> Result<bool, StoreError> {
        let cf_records = self.cf(CF_RECORDS)?;
        let cf_indexes = self.cf(CF_INDEXES)?;
        let key = Self::record_key(R::COLLECTION, id);

        let _guard = self.lock()?;
        let Some(previous) = self.db.get_cf(&cf_records, &key)? else {
            return Ok(false);
        };
        let previous: R = decode_record(&previous)?;

        let mut batch = WriteBatch::default();
        for entry in previous.index_entries() {
            batch.delete_cf(&cf_indexes, Self::index_key(R::COLLECTION, &entry, id));
        }
        batch.delete_cf(&cf_records, &key);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(true)
    }

    fn scan_index<R: Record>(&self, index: &str, key: &[u8]) -> Result<Vec<R>, StoreError> {
        let prefix = Self::index_prefix(R::COLLECTION, index, key);
        let mut ids = Vec::new();
        self.scan_prefix(CF_INDEXES, &prefix, |k, _| {
            if k.len() == prefix.len() + 16 {
                ids.push(Self::trailing_id(k)?);
            }
            Ok(())
        })?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get::<R>(id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn scan_all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let prefix = Self::collection_prefix(R::COLLECTION);
        let mut records = Vec::new();
        self.scan_prefix(CF_RECORDS, &prefix, |k, v| {
            if k.len() == prefix.len() + 16 {
                records.push(decode_record(v)?);
            }
            Ok(())
        })?;
        Ok(records)
    }
}

impl SnapshotStore for RocksStore {
    fn save_snapshot(&self, room_id: Uuid, state: &[u8]) -> Result<SnapshotMeta, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_SNAPSHOT_META)?;

        let compressed = lz4_flex::compress_prepend_size(state);

        let _guard = self.lock()?;
        let previous = self.snapshot_meta(room_id)?;
        let meta = SnapshotMeta::next(previous, room_id, state.len(), compressed.len());

        let key = room_id.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, &key, &compressed);
        batch.put_cf(&cf_meta, &key, &meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        log::debug!(
            "Saved snapshot for room {room_id}: v{} {} → {} bytes",
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    fn load_snapshot(&self, room_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    fn snapshot_meta(&self, room_id: Uuid) -> Result<Option<SnapshotMeta>, StoreError> {
        let cf = self.cf(CF_SNAPSHOT_META)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(bytes) => SnapshotMeta::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn list_snapshots(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_SNAPSHOT_META)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            if key.len() == 16 {
                ids.push(Self::trailing_id(&key)?);
            }
        }
        Ok(ids)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
