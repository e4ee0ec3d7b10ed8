//! Request/response operations over the document model.
//!
//! [`DocumentService`] is split by concern:
//! - [`documents`]: create documents with pages, metadata updates, context reads
//! - [`templates`]: template resolution, instantiation and save-as-template
//! - [`usage`]: the best-effort channel for template usage bumps
//!
//! Every store call is atomic on its own; the flows built from several
//! calls (insert page, then look up its parent) are not.

pub mod documents;
pub mod templates;
pub mod usage;

use std::sync::Arc;

use uuid::Uuid;

use crate::fragment::CollabError;
use crate::storage::{RecordStore, SnapshotStore, StoreError};

pub use documents::{DocumentContext, NewDocument};
pub use templates::{FromTemplateRequest, SaveTemplateRequest};
pub use usage::{UsageBump, UsageRecorder, UsageStats};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crdt(#[from] CollabError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ServiceError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        ServiceError::NotFound { kind, id }
    }
}

/// How sub-pages of a page spec find their parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParentResolution {
    /// Query the document's top-level pages by descending order and take
    /// the first. Racy under concurrent page creation.
    #[default]
    MostRecentTopLevel,
    /// Use the id of the page just inserted.
    Explicit,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub parent_resolution: ParentResolution,
    /// Write the initial fragments of new documents to the snapshot store.
    pub seed_rooms: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            parent_resolution: ParentResolution::MostRecentTopLevel,
            seed_rooms: true,
        }
    }
}

/// Document, page and template operations.
pub struct DocumentService<S: RecordStore + SnapshotStore + 'static> {
    store: Arc<S>,
    config: ServiceConfig,
    usage: Option<UsageRecorder>,
}

impl<S: RecordStore + SnapshotStore + 'static> DocumentService<S> {
    pub fn new(store: Arc<S>, config: ServiceConfig) -> Self {
        Self {
            store,
            config,
            usage: None,
        }
    }

    /// Route usage bumps through a detached worker instead of applying
    /// them inline.
    pub fn with_usage_recorder(mut self, recorder: UsageRecorder) -> Self {
        self.usage = Some(recorder);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }
}
