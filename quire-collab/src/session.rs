//! One open document: fragments, connection status and durable backup.
//!
//! ```text
//!                 ┌──────────────────────── EditingSession ────────────────────────┐
//!  open_page ───► │ durable query ─► tracker (durable axis) ─► hydrate_once(binding) │
//!                 │                                                                 │
//!  local edit ──► │ binding ─► HybridSyncEngine ─► PageContentRecord (debounced)    │
//!                 │    │                                                            │
//!                 │    └────► TransportClient ─► relay (CRDT axis)                  │
//!                 └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sessions are constructed explicitly per open document; nothing here is
//! process-wide. Must be used inside a tokio runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use quire_core::model::{DocumentId, Page, PageId, PageTree, TemplateId, UserId};

use crate::client::{TransportClient, TransportConfig, TransportEvent};
use crate::engine::{HybridSyncEngine, PageTarget, SyncConfig, SyncedCallback};
use crate::fragment::{FragmentBinding, FragmentManager};
use crate::presence::PeerIdentity;
use crate::protocol::ProtocolError;
use crate::service::{DocumentService, SaveTemplateRequest, ServiceError};
use crate::status::{ConnectionStatusTracker, SyncStatus};
use crate::storage::{RecordStore, SnapshotStore};

struct OpenPage {
    page: Page,
    binding: FragmentBinding,
}

/// Editing state of one open document.
pub struct EditingSession<S: RecordStore + SnapshotStore + 'static> {
    service: Arc<DocumentService<S>>,
    actor: UserId,
    fragments: Arc<FragmentManager>,
    tracker: Arc<ConnectionStatusTracker>,
    engine: HybridSyncEngine<S>,
    transport: Option<TransportClient>,
    pages: Mutex<HashMap<PageId, OpenPage>>,
    active: Mutex<Option<PageId>>,
}

impl<S: RecordStore + SnapshotStore + 'static> EditingSession<S> {
    /// Open `document_id`, starting from its persisted room state when the
    /// snapshot store has one.
    pub fn open(
        service: Arc<DocumentService<S>>,
        document_id: DocumentId,
        identity: PeerIdentity,
        config: SyncConfig,
    ) -> Result<Self, ServiceError> {
        let actor = identity.user_id;
        let fragments = match service.store().load_snapshot(document_id)? {
            Some(state) => FragmentManager::from_state(document_id, identity, &state)?,
            None => FragmentManager::new(document_id, identity),
        };

        let tracker = Arc::new(ConnectionStatusTracker::new());
        let engine = HybridSyncEngine::new(
            Arc::clone(service.store()),
            tracker.subscribe(),
            config,
            actor,
        );
        engine.watch_reconnects();

        log::info!("Opened editing session for document {document_id}");
        Ok(Self {
            service,
            actor,
            fragments: Arc::new(fragments),
            tracker,
            engine,
            transport: None,
            pages: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
        })
    }

    pub fn document_id(&self) -> DocumentId {
        self.fragments.room_id()
    }

    pub fn fragments(&self) -> &Arc<FragmentManager> {
        &self.fragments
    }

    pub fn tracker(&self) -> &Arc<ConnectionStatusTracker> {
        &self.tracker
    }

    pub fn engine(&self) -> &HybridSyncEngine<S> {
        &self.engine
    }

    pub fn status(&self) -> SyncStatus {
        self.tracker.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.tracker.subscribe()
    }

    pub fn set_on_synced(&self, callback: SyncedCallback) {
        self.engine.set_on_synced(callback);
    }

    /// The document's page tree. A document without pages gets a default
    /// page first.
    pub fn page_tree(&self) -> Result<PageTree, ServiceError> {
        self.service.ensure_pages(self.actor, &self.fragments)
    }

    /// Switch the editor to `page_id` and return its fragment binding.
    ///
    /// The durable axis drops back to connecting for the switch and becomes
    /// connected once the content query resolves, even to nothing. A
    /// failed content query is logged and leaves the axis connecting; the
    /// page still opens on whatever the fragment holds.
    pub fn open_page(&self, page_id: PageId) -> Result<FragmentBinding, ServiceError> {
        self.tracker.on_durable_query::<()>(None);

        let page = self
            .service
            .get_page(page_id)?
            .ok_or_else(|| ServiceError::not_found("page", page_id))?;
        if page.document_id != self.document_id() {
            return Err(ServiceError::InvalidInput(format!(
                "page {page_id} belongs to document {}",
                page.document_id
            )));
        }

        let binding = self.fragments.bind(&page.content_id)?;
        match self.service.page_content(page_id) {
            Ok(record) => {
                self.tracker.on_durable_query(Some(&record));
                let durable = record.as_ref().map(|r| &r.content);
                self.fragments.hydrate_once(&binding, durable)?;
            }
            Err(e) => log::warn!("Durable content query for page {page_id} failed: {e}"),
        }

        if let Ok(mut pages) = self.pages.lock() {
            pages.insert(
                page_id,
                OpenPage {
                    page,
                    binding: binding.clone(),
                },
            );
        }
        if let Ok(mut active) = self.active.lock() {
            *active = Some(page_id);
        }
        Ok(binding)
    }

    pub fn active_page(&self) -> Option<PageId> {
        self.active.lock().ok().and_then(|active| *active)
    }

    /// Binding of a page opened earlier in this session.
    pub fn binding(&self, page_id: PageId) -> Option<FragmentBinding> {
        let pages = self.pages.lock().ok()?;
        pages.get(&page_id).map(|open| open.binding.clone())
    }

    /// Report an edit made through a page's binding.
    pub fn on_local_change(&self, page_id: PageId) -> Result<(), ServiceError> {
        let (target, binding) = {
            let pages = self
                .pages
                .lock()
                .map_err(|_| ServiceError::InvalidInput("session page table poisoned".into()))?;
            let open = pages
                .get(&page_id)
                .ok_or_else(|| ServiceError::not_found("open page", page_id))?;
            (
                PageTarget {
                    page_id,
                    document_id: open.page.document_id,
                },
                open.binding.clone(),
            )
        };
        self.engine.on_local_change(target, || binding.read_doc());
        Ok(())
    }

    /// Connect to a relay. The transport then owns the CRDT axis.
    ///
    /// Returns the transport's event stream; remote updates are already
    /// applied to the fragments when their events arrive.
    pub fn connect(&mut self, config: TransportConfig) -> Option<tokio::sync::mpsc::Receiver<TransportEvent>> {
        let mut client = TransportClient::new(config, Arc::clone(&self.fragments), Arc::clone(&self.tracker));
        let events = client.take_event_rx();
        client.start();
        self.transport = Some(client);
        events
    }

    pub fn transport(&self) -> Option<&TransportClient> {
        self.transport.as_ref()
    }

    /// Send local fragment changes to the relay. Without a relay this is a
    /// no-op.
    pub async fn publish(&self) -> Result<bool, ProtocolError> {
        match &self.transport {
            Some(client) => client.publish_local_changes().await,
            None => Ok(false),
        }
    }

    /// Save the document as a template from the live fragments.
    pub fn save_as_template(&self, request: SaveTemplateRequest) -> Result<TemplateId, ServiceError> {
        if request.document_id != self.document_id() {
            return Err(ServiceError::InvalidInput(format!(
                "session is for document {}, not {}",
                self.document_id(),
                request.document_id
            )));
        }
        let state = self.fragments.encode_state();
        self.service
            .save_as_template_with_state(self.actor, request, Some(&state))
    }

    /// Persist the room state to the snapshot store.
    pub fn persist_snapshot(&self) -> Result<(), ServiceError> {
        let meta = self
            .service
            .store()
            .save_snapshot(self.document_id(), &self.fragments.encode_state())?;
        log::debug!(
            "Persisted room {} ({} bytes)",
            self.document_id(),
            meta.snapshot_size
        );
        Ok(())
    }

    /// End the session: write dirty pages if the durable store is
    /// reachable, stop the relay connection, persist local-only room state,
    /// then drop timers, buffers and bindings.
    pub async fn close(mut self) -> Result<(), ServiceError> {
        if self.tracker.status().is_durable_reachable() {
            let written = self.engine.flush_all();
            if written > 0 {
                log::debug!("Flushed {written} page(s) on close");
            }
        }

        match self.transport.take() {
            Some(client) => {
                if let Err(e) = client.publish_local_changes().await {
                    log::warn!("Final publish for room {} failed: {e}", self.document_id());
                }
                client.stop().await;
            }
            None => self.persist_snapshot()?,
        }

        self.engine.shutdown();
        if let Ok(mut pages) = self.pages.lock() {
            pages.clear();
        }
        log::info!("Closed editing session for document {}", self.document_id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{NewDocument, ServiceConfig};
    use crate::status::{DurableState, SyncMode};
    use crate::storage::MemoryStore;
    use quire_core::content::Node;
    use quire_core::model::PageContentRecord;
    use quire_core::template::{PageSpec, TemplateCategory};
    use quire_core::Template;
    use std::time::Duration;
    use uuid::Uuid;

    fn setup() -> (Arc<DocumentService<MemoryStore>>, DocumentId, PeerIdentity) {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(DocumentService::new(store, ServiceConfig::default()));
        let identity = PeerIdentity::new(Uuid::new_v4(), "Ada");
        let spec = PageSpec::new("Intro")
            .with_content(r#"{"type":"doc","content":[{"type":"paragraph","content":[{"type":"text","text":"hello"}]}]}"#);
        let doc_id = service
            .create_document_with_pages(identity.user_id, NewDocument::new("Doc").with_pages(vec![spec]))
            .unwrap();
        (service, doc_id, identity)
    }

    #[tokio::test]
    async fn test_open_page_connects_durable_axis() {
        let (service, doc_id, identity) = setup();
        let session = EditingSession::open(service, doc_id, identity, SyncConfig::for_testing()).unwrap();
        assert_eq!(session.status().mode, SyncMode::LocalOnly);

        let page = session.page_tree().unwrap().top_level[0].clone();
        let binding = session.open_page(page.id).unwrap();
        assert_eq!(session.status().durable, DurableState::Connected);
        assert_eq!(session.status().mode, SyncMode::DurableOnly);
        assert_eq!(binding.read_content().plain_text(), "hello");
        assert_eq!(session.active_page(), Some(page.id));
    }

    #[tokio::test]
    async fn test_edits_reach_durable_record() {
        let (service, doc_id, identity) = setup();
        let session =
            EditingSession::open(Arc::clone(&service), doc_id, identity, SyncConfig::for_testing()).unwrap();
        let page = session.page_tree().unwrap().top_level[0].clone();
        let binding = session.open_page(page.id).unwrap();

        binding.push_block(&Node::paragraph("world"));
        session.on_local_change(page.id).unwrap();
        session.close().await.unwrap();

        let record: PageContentRecord = service.page_content(page.id).unwrap().unwrap();
        assert_eq!(record.content.blocks.len(), 2);
        assert!(record.content.plain_text().contains("world"));
    }

    #[tokio::test]
    async fn test_local_only_close_persists_room() {
        let (service, doc_id, identity) = setup();
        let session =
            EditingSession::open(Arc::clone(&service), doc_id, identity.clone(), SyncConfig::for_testing())
                .unwrap();
        let page = session.page_tree().unwrap().top_level[0].clone();
        session.open_page(page.id).unwrap().push_block(&Node::paragraph("kept"));
        session.close().await.unwrap();

        let reopened = EditingSession::open(service, doc_id, identity, SyncConfig::for_testing()).unwrap();
        let binding = reopened.open_page(page.id).unwrap();
        assert!(binding.read_content().plain_text().contains("kept"));
    }

    #[tokio::test]
    async fn test_store_outage_keeps_edits_buffered() {
        let (service, doc_id, identity) = setup();
        let session =
            EditingSession::open(Arc::clone(&service), doc_id, identity, SyncConfig::for_testing()).unwrap();
        let page = session.page_tree().unwrap().top_level[0].clone();
        let binding = session.open_page(page.id).unwrap();

        service.store().set_available(false);
        binding.push_block(&Node::paragraph("offline"));
        session.on_local_change(page.id).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(session.engine().is_dirty(page.id));

        service.store().set_available(true);
        assert_eq!(session.engine().flush_all(), 1);
        assert!(!session.engine().is_dirty(page.id));
    }

    #[tokio::test]
    async fn test_open_page_from_other_document_is_rejected() {
        let (service, doc_id, identity) = setup();
        let other = service
            .create_document_with_pages(identity.user_id, NewDocument::new("Other"))
            .unwrap();
        let foreign = service.list_pages(other).unwrap().top_level[0].id;

        let session = EditingSession::open(service, doc_id, identity, SyncConfig::for_testing()).unwrap();
        assert!(matches!(session.open_page(foreign), Err(ServiceError::InvalidInput(_))));
        assert!(matches!(
            session.on_local_change(foreign),
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_save_as_template_uses_unpersisted_edits() {
        let (service, doc_id, identity) = setup();
        let session =
            EditingSession::open(Arc::clone(&service), doc_id, identity, SyncConfig::for_testing()).unwrap();
        let page = session.page_tree().unwrap().top_level[0].clone();
        session.open_page(page.id).unwrap().push_block(&Node::paragraph("draft"));

        let template_id = session
            .save_as_template(SaveTemplateRequest {
                document_id: doc_id,
                name: "Draft".into(),
                description: String::new(),
                category: TemplateCategory::UserCreated,
                is_public: false,
            })
            .unwrap();
        let template: Template = service.store().get(template_id).unwrap().unwrap();
        assert!(template.snapshot.pages[0].content.as_deref().unwrap().contains("draft"));
    }
}
