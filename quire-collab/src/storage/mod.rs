//! Durable storage for records and collaborative snapshots.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐   put/get/scan    ┌──────────────────────────────┐
//! │ DocumentService  │ ────────────────► │ RecordStore                  │
//! │ HybridSyncEngine │                   │  documents, pages, templates │
//! └──────────────────┘                   │  page_contents, directory    │
//!                                        └──────────────────────────────┘
//! ┌──────────────────┐   save/load       ┌──────────────────────────────┐
//! │ RelayServer      │ ────────────────► │ SnapshotStore                │
//! │ DocumentService  │                   │  encoded CRDT room state     │
//! └──────────────────┘                   └──────────────────────────────┘
//! ```
//!
//! Two implementations: [`MemoryStore`] (tests, embedded use) and
//! [`RocksStore`] (RocksDB column families, LZ4-compressed snapshots).
//! Every single call is atomic; multi-call flows are not.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use quire_core::directory::{Client, Department, Project, Task, User, UserRole};
use quire_core::model::{Document, Page, PageContentRecord};
use quire_core::template::{Template, TemplateCategory};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Secondary index names.
pub mod index {
    /// Pages and page contents by owning document.
    pub const BY_DOCUMENT: &str = "document";
    /// Tasks by project.
    pub const BY_PROJECT: &str = "project";
    /// Templates by stable key.
    pub const BY_KEY: &str = "key";
    /// Templates by category.
    pub const BY_CATEGORY: &str = "category";
    /// Users by role.
    pub const BY_ROLE: &str = "role";
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Parent page {parent} does not belong to document {document}")]
    InvalidParent { parent: Uuid, document: Uuid },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// One secondary index entry of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub index: &'static str,
    pub key: Vec<u8>,
}

impl IndexEntry {
    pub fn by_id(index: &'static str, id: Uuid) -> Self {
        Self { index, key: id.as_bytes().to_vec() }
    }

    pub fn by_str(index: &'static str, key: &str) -> Self {
        Self { index, key: key.as_bytes().to_vec() }
    }
}

/// A row of a durable collection.
pub trait Record: Serialize + DeserializeOwned {
    const COLLECTION: &'static str;

    fn id(&self) -> Uuid;

    fn index_entries(&self) -> Vec<IndexEntry> {
        Vec::new()
    }
}

/// Request/response record store (insert, get, patch, indexed scans).
///
/// Scans return records in id order; ids are time-ordered so this is
/// insertion order.
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record and its index entries.
    fn put<R: Record>(&self, record: &R) -> Result<(), StoreError>;

    fn get<R: Record>(&self, id: Uuid) -> Result<Option<R>, StoreError>;

    /// Delete a record. Returns whether it existed.
    fn delete<R: Record>(&self, id: Uuid) -> Result<bool, StoreError>;

    /// All records whose `index` entry equals `key`.
    fn scan_index<R: Record>(&self, index: &str, key: &[u8]) -> Result<Vec<R>, StoreError>;

    fn scan_all<R: Record>(&self) -> Result<Vec<R>, StoreError>;

    /// Read-modify-write. Returns the updated record, or `None` when absent.
    fn patch<R, F>(&self, id: Uuid, f: F) -> Result<Option<R>, StoreError>
    where
        R: Record,
        F: FnOnce(&mut R),
    {
        let Some(mut record) = self.get::<R>(id)? else {
            return Ok(None);
        };
        f(&mut record);
        self.put(&record)?;
        Ok(Some(record))
    }
}

/// Bookkeeping stored next to each room snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub room_id: Uuid,
    /// Incremented on every save.
    pub version: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    pub updated_at: u64,
}

impl SnapshotMeta {
    pub(crate) fn next(previous: Option<SnapshotMeta>, room_id: Uuid, raw: usize, compressed: usize) -> Self {
        Self {
            room_id,
            version: previous.map_or(1, |m| m.version + 1),
            snapshot_size: raw as u64,
            compressed_size: compressed as u64,
            updated_at: quire_core::now_millis(),
        }
    }
}

/// Persistence of encoded CRDT room state (one room per document).
pub trait SnapshotStore: Send + Sync {
    fn save_snapshot(&self, room_id: Uuid, state: &[u8]) -> Result<SnapshotMeta, StoreError>;

    fn load_snapshot(&self, room_id: Uuid) -> Result<Option<Vec<u8>>, StoreError>;

    fn snapshot_meta(&self, room_id: Uuid) -> Result<Option<SnapshotMeta>, StoreError>;

    fn list_snapshots(&self) -> Result<Vec<Uuid>, StoreError>;
}

// ─── Record impls ─────────────────────────────────────────────────────

impl Record for Document {
    const COLLECTION: &'static str = "documents";

    fn id(&self) -> Uuid {
        self.id
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        self.project_id
            .map(|p| IndexEntry::by_id(index::BY_PROJECT, p))
            .into_iter()
            .collect()
    }
}

impl Record for Page {
    const COLLECTION: &'static str = "pages";

    fn id(&self) -> Uuid {
        self.id
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![IndexEntry::by_id(index::BY_DOCUMENT, self.document_id)]
    }
}

impl Record for PageContentRecord {
    const COLLECTION: &'static str = "page_contents";

    fn id(&self) -> Uuid {
        self.page_id
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![IndexEntry::by_id(index::BY_DOCUMENT, self.document_id)]
    }
}

impl Record for Template {
    const COLLECTION: &'static str = "templates";

    fn id(&self) -> Uuid {
        self.id
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        let mut entries = vec![IndexEntry::by_str(index::BY_CATEGORY, self.category.as_str())];
        if let Some(key) = &self.key {
            entries.push(IndexEntry::by_str(index::BY_KEY, key));
        }
        entries
    }
}

impl Record for Client {
    const COLLECTION: &'static str = "clients";

    fn id(&self) -> Uuid {
        self.id
    }
}

impl Record for Department {
    const COLLECTION: &'static str = "departments";

    fn id(&self) -> Uuid {
        self.id
    }
}

impl Record for Project {
    const COLLECTION: &'static str = "projects";

    fn id(&self) -> Uuid {
        self.id
    }
}

impl Record for User {
    const COLLECTION: &'static str = "users";

    fn id(&self) -> Uuid {
        self.id
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![IndexEntry::by_str(index::BY_ROLE, role_key(self.role))]
    }
}

impl Record for Task {
    const COLLECTION: &'static str = "tasks";

    fn id(&self) -> Uuid {
        self.id
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![IndexEntry::by_id(index::BY_PROJECT, self.project_id)]
    }
}

/// Index key for a user role.
pub fn role_key(role: UserRole) -> &'static str {
    match role {
        UserRole::Admin => "admin",
        UserRole::Manager => "manager",
        UserRole::Member => "member",
        UserRole::Client => "client",
    }
}

/// Index key for a template category.
pub fn category_key(category: TemplateCategory) -> &'static [u8] {
    category.as_str().as_bytes()
}

pub(crate) fn encode_record<R: Record>(record: &R) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(record).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode_record<R: Record>(bytes: &[u8]) -> Result<R, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
}
