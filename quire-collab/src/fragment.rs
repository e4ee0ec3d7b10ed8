//! Per-page CRDT fragments inside a document room.
//!
//! Every document is one Yrs `Doc` (the room). Every page owns one named
//! root-level array inside it (the fragment):
//!
//! ```text
//! Doc (room = document id)
//!  ├── "page:2f1c…_91"  [ block JSON, block JSON, … ]
//!  ├── "page:77ab…_04"  [ block JSON, … ]
//!  └── …
//! ```
//!
//! Each array element is one top-level block of the page, serialized as
//! JSON. Concurrent edits merge at block granularity. The fragment keeps
//! full fidelity: blocks outside the durable allow-list survive here and
//! are only dropped on the way to the durable store.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Array, ArrayRef, Doc, Out, ReadTxn, StateVector, Transact, Update};

use quire_core::content::{sanitize_doc, Node, PageContent};
use quire_core::model::DocumentId;

use crate::presence::PeerIdentity;

/// CRDT errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollabError {
    #[error("Failed to decode CRDT payload: {0}")]
    Decode(String),

    #[error("Failed to apply CRDT update: {0}")]
    Apply(String),

    #[error("Fragment manager lock poisoned")]
    Poisoned,
}

impl From<yrs::encoding::read::Error> for CollabError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CollabError::Decode(e.to_string())
    }
}

/// Stable, namespaced fragment name for a page's content binding id.
///
/// `"page:"` followed by the id lowercased, with every non-alphanumeric
/// character replaced by `_`.
pub fn fragment_name(content_id: &str) -> String {
    let mut name = String::with_capacity(5 + content_id.len());
    name.push_str("page:");
    name.extend(content_id.chars().map(|c| {
        if c.is_ascii_alphanumeric() {
            c.to_ascii_lowercase()
        } else {
            '_'
        }
    }));
    name
}

// ───────────────────────────────────────────────────────────────────
// Binding
// ───────────────────────────────────────────────────────────────────

/// An editor's handle on one page fragment.
///
/// Cloning is cheap; clones address the same region.
#[derive(Clone)]
pub struct FragmentBinding {
    content_id: String,
    name: String,
    fragment: ArrayRef,
    doc: Doc,
    identity: PeerIdentity,
}

impl FragmentBinding {
    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    pub fn fragment_name(&self) -> &str {
        &self.name
    }

    /// Shared room document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Local presence identity.
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.fragment.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty, or exactly one empty paragraph.
    pub fn is_pristine(&self) -> bool {
        let doc = self.read_doc();
        match doc.content.as_slice() {
            [] => true,
            [only] => only.is_empty_paragraph(),
            _ => false,
        }
    }

    /// Full-fidelity editor document held by the fragment.
    pub fn read_doc(&self) -> Node {
        let txn = self.doc.transact();
        let blocks = self
            .fragment
            .iter(&txn)
            .filter_map(|value| decode_block(&self.name, value))
            .collect();
        Node::doc(blocks)
    }

    /// Durable view: allow-listed blocks only.
    pub fn read_content(&self) -> PageContent {
        PageContent::from_doc(&self.read_doc())
    }

    /// Replace the whole fragment with the given document's blocks.
    pub fn replace(&self, doc: &Node) {
        let doc = sanitize_doc(doc.clone());
        let mut txn = self.doc.transact_mut();
        let len = self.fragment.len(&txn);
        if len > 0 {
            self.fragment.remove_range(&mut txn, 0, len);
        }
        for block in &doc.content {
            self.fragment.push_back(&mut txn, block.to_json());
        }
    }

    /// Insert a block at `index` (clamped to the end).
    pub fn insert_block(&self, index: u32, block: &Node) {
        let block = wrap_stray_text(block);
        let mut txn = self.doc.transact_mut();
        let index = index.min(self.fragment.len(&txn));
        self.fragment.insert(&mut txn, index, block.to_json());
    }

    pub fn push_block(&self, block: &Node) {
        let block = wrap_stray_text(block);
        let mut txn = self.doc.transact_mut();
        self.fragment.push_back(&mut txn, block.to_json());
    }

    /// Replace the block at `index`. Returns false when out of range.
    pub fn update_block(&self, index: u32, block: &Node) -> bool {
        let block = wrap_stray_text(block);
        let mut txn = self.doc.transact_mut();
        if index >= self.fragment.len(&txn) {
            return false;
        }
        self.fragment.remove(&mut txn, index);
        self.fragment.insert(&mut txn, index, block.to_json());
        true
    }

    /// Remove the block at `index`. Returns false when out of range.
    pub fn remove_block(&self, index: u32) -> bool {
        let mut txn = self.doc.transact_mut();
        if index >= self.fragment.len(&txn) {
            return false;
        }
        self.fragment.remove(&mut txn, index);
        true
    }
}

fn wrap_stray_text(block: &Node) -> Node {
    if block.is_text() {
        Node::element("paragraph", vec![block.clone()])
    } else {
        block.clone()
    }
}

fn decode_block(fragment: &str, value: Out) -> Option<Node> {
    match value {
        Out::Any(Any::String(raw)) => match serde_json::from_str::<Node>(&raw) {
            Ok(node) => Some(node),
            Err(e) => {
                log::warn!("Skipping malformed block in {fragment}: {e}");
                None
            }
        },
        other => {
            log::warn!("Skipping non-JSON element in {fragment}: {other:?}");
            None
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Manager
// ───────────────────────────────────────────────────────────────────

/// Owns the shared room document of one open document and hands out
/// page bindings.
///
/// Hydration state is session scoped: a new manager hydrates again.
pub struct FragmentManager {
    room_id: DocumentId,
    doc: Doc,
    identity: PeerIdentity,
    bindings: Mutex<HashMap<String, ArrayRef>>,
    hydrated: Mutex<HashSet<String>>,
    /// State vector of everything already handed to the transport.
    sent: Mutex<StateVector>,
}

impl FragmentManager {
    pub fn new(room_id: DocumentId, identity: PeerIdentity) -> Self {
        Self {
            room_id,
            doc: Doc::new(),
            identity,
            bindings: Mutex::new(HashMap::new()),
            hydrated: Mutex::new(HashSet::new()),
            sent: Mutex::new(StateVector::default()),
        }
    }

    /// Start from a persisted room state. The loaded state counts as
    /// already sent.
    pub fn from_state(
        room_id: DocumentId,
        identity: PeerIdentity,
        state: &[u8],
    ) -> Result<Self, CollabError> {
        let manager = Self::new(room_id, identity);
        manager.apply_remote_update(state)?;
        let sv = manager.doc.transact().state_vector();
        *manager.sent.lock().map_err(|_| CollabError::Poisoned)? = sv;
        Ok(manager)
    }

    pub fn room_id(&self) -> DocumentId {
        self.room_id
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Bind an editor to the page fragment named by `content_id`.
    ///
    /// Idempotent: binding the same id again addresses the same region.
    pub fn bind(&self, content_id: &str) -> Result<FragmentBinding, CollabError> {
        let name = fragment_name(content_id);
        let mut bindings = self.bindings.lock().map_err(|_| CollabError::Poisoned)?;
        let fragment = bindings
            .entry(content_id.to_string())
            .or_insert_with(|| {
                log::debug!("Binding fragment {name} in room {}", self.room_id);
                self.doc.get_or_insert_array(name.as_str())
            })
            .clone();

        Ok(FragmentBinding {
            content_id: content_id.to_string(),
            name,
            fragment,
            doc: self.doc.clone(),
            identity: self.identity.clone(),
        })
    }

    /// One-time hydration from the durable store.
    ///
    /// Call once the durable content query has resolved: `Some` when a
    /// durable record exists, `None` when it resolved empty. The fragment
    /// is overwritten only if it is still pristine. Returns whether the
    /// fragment was overwritten. Later calls for the same binding in this
    /// session are no-ops.
    pub fn hydrate_once(
        &self,
        binding: &FragmentBinding,
        durable: Option<&PageContent>,
    ) -> Result<bool, CollabError> {
        let mut hydrated = self.hydrated.lock().map_err(|_| CollabError::Poisoned)?;
        if !hydrated.insert(binding.content_id.clone()) {
            return Ok(false);
        }

        let Some(content) = durable else {
            return Ok(false);
        };
        if content.is_empty() || !binding.is_pristine() {
            return Ok(false);
        }

        binding.replace(&content.to_doc());
        log::debug!(
            "Hydrated {} with {} durable block(s)",
            binding.name,
            content.blocks.len()
        );
        Ok(true)
    }

    pub fn is_hydrated(&self, content_id: &str) -> bool {
        self.hydrated
            .lock()
            .map(|h| h.contains(content_id))
            .unwrap_or(false)
    }

    // ─── Transport ────────────────────────────────────────────────────

    /// Encoded state vector of the room (sync step 1 payload).
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Full room state, for snapshots.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything a peer with the given state vector is missing.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, CollabError> {
        let sv = StateVector::decode_v1(remote_sv)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Incremental update since the previous call, or `None` when nothing
    /// changed.
    pub fn take_pending_update(&self) -> Result<Option<Vec<u8>>, CollabError> {
        let mut sent = self.sent.lock().map_err(|_| CollabError::Poisoned)?;
        let txn = self.doc.transact();
        let current = txn.state_vector();
        if current == *sent {
            return Ok(None);
        }
        let update = txn.encode_diff_v1(&sent);
        *sent = current;
        Ok(Some(update))
    }

    /// Merge an update received from the transport.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<(), CollabError> {
        let update = Update::decode_v1(update)?;
        let mut sent = self.sent.lock().map_err(|_| CollabError::Poisoned)?;
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| CollabError::Apply(e.to_string()))?;
        }
        // Nothing local was pending: the remote changes need no echo.
        if before == *sent {
            *sent = self.doc.transact().state_vector();
        }
        log::trace!("Applied remote update to room {}", self.room_id);
        Ok(())
    }
}

/// Read one page fragment out of an encoded room state.
///
/// Returns `None` when the room has no fragment for the page.
pub fn read_fragment(state: &[u8], content_id: &str) -> Result<Option<Node>, CollabError> {
    let doc = Doc::new();
    {
        let update = Update::decode_v1(state)?;
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CollabError::Apply(e.to_string()))?;
    }

    let name = fragment_name(content_id);
    let txn = doc.transact();
    let Some(fragment) = txn.get_array(name.as_str()) else {
        return Ok(None);
    };
    let blocks = fragment
        .iter(&txn)
        .filter_map(|value| decode_block(&name, value))
        .collect();
    Ok(Some(Node::doc(blocks)))
}
