//! Documents, pages and their resolved context.

use quire_core::content::{sanitize_raw, PageContent};
use quire_core::directory::{Client, Department, Project, Task, User, UserRole};
use quire_core::model::{
    now_millis, Document, DocumentId, DocumentMetadata, DocumentType, Page, PageContentRecord,
    PageId, PageTree, UserId,
};
use quire_core::template::PageSpec;

use super::{DocumentService, ParentResolution, ServiceError};
use crate::fragment::FragmentManager;
use crate::presence::PeerIdentity;
use crate::storage::{index, role_key, RecordStore, SnapshotStore, StoreError};

/// Input of [`DocumentService::create_document_with_pages`].
#[derive(Debug, Clone, Default)]
pub struct NewDocument {
    pub title: String,
    pub document_type: Option<DocumentType>,
    pub metadata: Option<DocumentMetadata>,
    /// `None` or empty: one "Untitled" page with empty content.
    pub pages: Option<Vec<PageSpec>>,
}

impl NewDocument {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, document_type: DocumentType) -> Self {
        self.document_type = Some(document_type);
        self
    }

    pub fn with_metadata(mut self, metadata: DocumentMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_pages(mut self, pages: Vec<PageSpec>) -> Self {
        self.pages = Some(pages);
        self
    }
}

/// A document with its references resolved. Missing references are `None`.
#[derive(Debug, Clone)]
pub struct DocumentContext {
    pub document: Document,
    pub client: Option<Client>,
    pub project: Option<Project>,
    pub department: Option<Department>,
    /// Client-role users belonging to the project's department.
    pub client_users: Vec<User>,
    /// Tasks of the project, when it resolves.
    pub tasks: Vec<Task>,
    pub pages: PageTree,
}

impl<S: RecordStore + SnapshotStore + 'static> DocumentService<S> {
    /// Create a document, its pages, their initial fragments and durable
    /// content records. Returns the new document id.
    pub fn create_document_with_pages(
        &self,
        actor: UserId,
        request: NewDocument,
    ) -> Result<DocumentId, ServiceError> {
        let NewDocument {
            title,
            document_type,
            metadata,
            pages,
        } = request;

        let document = Document::new(
            title,
            document_type.unwrap_or_default(),
            metadata.unwrap_or_default(),
            actor,
        );
        self.store.put(&document)?;

        let specs = match pages {
            Some(specs) if !specs.is_empty() => specs,
            _ => vec![PageSpec::new("Untitled").with_order(0)],
        };

        let room = FragmentManager::new(document.id, PeerIdentity::system());
        for (index, spec) in specs.iter().enumerate() {
            let order = spec.order.unwrap_or(index as i64);
            let inserted = self.create_page(&room, &document, None, spec, order, actor)?;

            for (sub_index, sub_spec) in spec.subpages.iter().enumerate() {
                let parent = match self.config.parent_resolution {
                    ParentResolution::MostRecentTopLevel => self.most_recent_top_level(document.id)?,
                    ParentResolution::Explicit => Some(inserted),
                };
                let order = sub_spec.order.unwrap_or(sub_index as i64 + 1);
                self.create_page(&room, &document, parent, sub_spec, order, actor)?;
            }
        }

        if self.config.seed_rooms {
            let meta = self.store.save_snapshot(document.id, &room.encode_state())?;
            log::debug!(
                "Seeded room {} ({} bytes)",
                document.id,
                meta.snapshot_size
            );
        }

        log::info!(
            "Created document {} \"{}\" with {} top-level page(s)",
            document.id,
            document.title,
            specs.len()
        );
        Ok(document.id)
    }

    fn create_page(
        &self,
        room: &FragmentManager,
        document: &Document,
        parent: Option<PageId>,
        spec: &PageSpec,
        order: i64,
        actor: UserId,
    ) -> Result<PageId, ServiceError> {
        let page = Page::new(document.id, parent, spec.title.clone(), order).with_icon(spec.icon.clone());
        self.insert_page(&page)?;

        let doc = sanitize_raw(spec.content.as_deref());
        room.bind(&page.content_id)?.replace(&doc);

        self.store.put(&PageContentRecord {
            page_id: page.id,
            document_id: document.id,
            content: PageContent::from_doc(&doc),
            updated_at: now_millis(),
            updated_by: actor,
        })?;
        Ok(page.id)
    }

    /// Page tree of the document behind `room`. A document left without
    /// pages gets the default "Untitled" page, bound in `room`.
    pub fn ensure_pages(&self, actor: UserId, room: &FragmentManager) -> Result<PageTree, ServiceError> {
        let document = self
            .get_document(room.room_id())?
            .ok_or_else(|| ServiceError::not_found("document", room.room_id()))?;

        let tree = self.list_pages(document.id)?;
        if !tree.is_empty() {
            return Ok(tree);
        }

        log::info!("Document {} has no pages; adding the default page", document.id);
        let spec = PageSpec::new("Untitled").with_order(0);
        self.create_page(room, &document, None, &spec, 0, actor)?;
        self.list_pages(document.id)
    }

    /// Insert a page row. A parent must belong to the same document.
    pub fn insert_page(&self, page: &Page) -> Result<(), ServiceError> {
        if let Some(parent_id) = page.parent_page_id {
            let parent: Option<Page> = self.store.get(parent_id)?;
            if parent.map(|p| p.document_id) != Some(page.document_id) {
                return Err(StoreError::InvalidParent {
                    parent: parent_id,
                    document: page.document_id,
                }
                .into());
            }
        }
        self.store.put(page)?;
        Ok(())
    }

    /// Top-level page with the highest order.
    fn most_recent_top_level(&self, document_id: DocumentId) -> Result<Option<PageId>, ServiceError> {
        let pages: Vec<Page> = self.store.scan_index(index::BY_DOCUMENT, document_id.as_bytes())?;
        Ok(pages
            .into_iter()
            .filter(Page::is_top_level)
            .max_by_key(Page::sort_key)
            .map(|p| p.id))
    }

    /// Shallow-merge `patch` into the document's metadata and keep the
    /// top-level reference copies in step.
    pub fn update_document_metadata(
        &self,
        actor: UserId,
        document_id: DocumentId,
        patch: DocumentMetadata,
    ) -> Result<Document, ServiceError> {
        self.store
            .patch::<Document, _>(document_id, |doc| doc.apply_metadata(patch, actor))?
            .ok_or_else(|| ServiceError::not_found("document", document_id))
    }

    pub fn get_document(&self, document_id: DocumentId) -> Result<Option<Document>, ServiceError> {
        Ok(self.store.get(document_id)?)
    }

    /// Load a document with its references and page tree. `None` when the
    /// document does not exist.
    pub fn get_document_with_context(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<DocumentContext>, ServiceError> {
        let Some(document) = self.get_document(document_id)? else {
            return Ok(None);
        };

        let client_id = document.client_id.or(document.metadata.client_id);
        let project_id = document.project_id.or(document.metadata.project_id);
        let department_id = document.department_id.or(document.metadata.department_id);

        let client: Option<Client> = client_id.map(|id| self.store.get(id)).transpose()?.flatten();
        let project: Option<Project> = project_id.map(|id| self.store.get(id)).transpose()?.flatten();
        let department: Option<Department> =
            department_id.map(|id| self.store.get(id)).transpose()?.flatten();

        let client_users = match project.as_ref().and_then(|p| p.department_id) {
            Some(project_department) => self
                .store
                .scan_index::<User>(index::BY_ROLE, role_key(UserRole::Client).as_bytes())?
                .into_iter()
                .filter(|user| user.is_client_of(project_department))
                .collect(),
            None => Vec::new(),
        };

        let tasks = match &project {
            Some(project) => self.store.scan_index(index::BY_PROJECT, project.id.as_bytes())?,
            None => Vec::new(),
        };

        let pages = self.list_pages(document_id)?;

        Ok(Some(DocumentContext {
            document,
            client,
            project,
            department,
            client_users,
            tasks,
            pages,
        }))
    }

    /// The document's pages as a sorted tree.
    pub fn list_pages(&self, document_id: DocumentId) -> Result<PageTree, ServiceError> {
        let pages: Vec<Page> = self.store.scan_index(index::BY_DOCUMENT, document_id.as_bytes())?;
        Ok(PageTree::build(pages))
    }

    pub fn get_page(&self, page_id: PageId) -> Result<Option<Page>, ServiceError> {
        Ok(self.store.get(page_id)?)
    }

    /// Durable content of a page.
    pub fn page_content(&self, page_id: PageId) -> Result<Option<PageContentRecord>, ServiceError> {
        Ok(self.store.get(page_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::read_fragment;
    use crate::service::ServiceConfig;
    use crate::storage::MemoryStore;
    use quire_core::directory::TaskStatus;
    use std::sync::Arc;
    use uuid::Uuid;

    fn service() -> DocumentService<MemoryStore> {
        DocumentService::new(Arc::new(MemoryStore::new()), ServiceConfig::default())
    }

    #[test]
    fn test_no_pages_creates_untitled() {
        let svc = service();
        let id = svc
            .create_document_with_pages(Uuid::new_v4(), NewDocument::new("Empty"))
            .unwrap();

        let tree = svc.list_pages(id).unwrap();
        assert_eq!(tree.len(), 1);
        let page = &tree.top_level[0];
        assert_eq!(page.title, "Untitled");
        assert_eq!(page.order, 0);

        let content = svc.page_content(page.id).unwrap().unwrap();
        assert!(content.content.is_empty());
        assert_eq!(svc.get_document(id).unwrap().unwrap().document_type, DocumentType::Blank);
    }

    #[test]
    fn test_subpages_parented_with_default_orders() {
        let svc = service();
        let spec = PageSpec::new("Parent")
            .with_subpages(vec![PageSpec::new("First"), PageSpec::new("Second")]);
        let id = svc
            .create_document_with_pages(Uuid::new_v4(), NewDocument::new("Doc").with_pages(vec![spec]))
            .unwrap();

        let tree = svc.list_pages(id).unwrap();
        assert_eq!(tree.top_level.len(), 1);
        let parent = &tree.top_level[0];
        let children = tree.children_of(parent.id);
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].order, 1);
        assert_eq!(children[1].order, 2);
        assert_eq!(children[0].title, "First");
    }

    #[test]
    fn test_parent_resolution_strategies_agree() {
        let specs = vec![
            PageSpec::new("A").with_subpages(vec![PageSpec::new("A1")]),
            PageSpec::new("B").with_subpages(vec![PageSpec::new("B1"), PageSpec::new("B2")]),
        ];
        let mut shapes = Vec::new();
        for resolution in [ParentResolution::MostRecentTopLevel, ParentResolution::Explicit] {
            let svc = DocumentService::new(
                Arc::new(MemoryStore::new()),
                ServiceConfig {
                    parent_resolution: resolution,
                    ..ServiceConfig::default()
                },
            );
            let id = svc
                .create_document_with_pages(Uuid::new_v4(), NewDocument::new("D").with_pages(specs.clone()))
                .unwrap();
            let tree = svc.list_pages(id).unwrap();
            let shape: Vec<(String, Vec<String>)> = tree
                .top_level
                .iter()
                .map(|p| {
                    let children = tree.children_of(p.id).iter().map(|c| c.title.clone()).collect();
                    (p.title.clone(), children)
                })
                .collect();
            shapes.push(shape);
        }
        assert_eq!(shapes[0], shapes[1]);
        assert_eq!(shapes[0][1].1, vec!["B1".to_string(), "B2".to_string()]);
    }

    #[test]
    fn test_content_is_sanitized_and_seeded() {
        let svc = service();
        let raw = r#"{"type":"doc","content":[{"type":"text","text":"stray"}]}"#;
        let id = svc
            .create_document_with_pages(
                Uuid::new_v4(),
                NewDocument::new("D").with_pages(vec![PageSpec::new("P").with_content(raw)]),
            )
            .unwrap();
        let page = svc.list_pages(id).unwrap().top_level[0].clone();

        let state = svc.store().load_snapshot(id).unwrap().unwrap();
        let live = read_fragment(&state, &page.content_id).unwrap().unwrap();
        assert_eq!(live.content.len(), 1);
        assert_eq!(live.content[0].kind, "paragraph");
        assert_eq!(live.plain_text(), "stray");

        let durable = svc.page_content(page.id).unwrap().unwrap();
        assert_eq!(durable.content.plain_text(), "stray");
    }

    #[test]
    fn test_metadata_merge_duplicates_client_only() {
        let svc = service();
        let department = Uuid::new_v4();
        let client = Uuid::new_v4();
        let id = svc
            .create_document_with_pages(
                Uuid::new_v4(),
                NewDocument::new("D").with_metadata(DocumentMetadata::default().with_department(department)),
            )
            .unwrap();

        let actor = Uuid::new_v4();
        let updated = svc
            .update_document_metadata(actor, id, DocumentMetadata::default().with_client(client))
            .unwrap();
        assert_eq!(updated.metadata.client_id, Some(client));
        assert_eq!(updated.metadata.department_id, Some(department));
        assert_eq!(updated.client_id, Some(client));
        assert_eq!(updated.department_id, Some(department));
        assert_eq!(updated.modified_by, actor);

        let stored = svc.get_document(id).unwrap().unwrap();
        assert_eq!(stored, updated);
    }

    #[test]
    fn test_update_missing_document() {
        let svc = service();
        let missing = Uuid::new_v4();
        let err = svc
            .update_document_metadata(Uuid::new_v4(), missing, DocumentMetadata::default())
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { kind: "document", id } if id == missing));
    }

    #[test]
    fn test_insert_page_rejects_foreign_parent() {
        let svc = service();
        let other_doc = Uuid::new_v4();
        let foreign = Page::new(other_doc, None, "Foreign", 0);
        svc.insert_page(&foreign).unwrap();

        let child = Page::new(Uuid::new_v4(), Some(foreign.id), "Child", 0);
        assert!(matches!(
            svc.insert_page(&child),
            Err(ServiceError::Store(StoreError::InvalidParent { .. }))
        ));
    }

    #[test]
    fn test_ensure_pages_adds_default_page_once() {
        let svc = service();
        let actor = Uuid::new_v4();
        let document = Document::new("Bare", DocumentType::Blank, DocumentMetadata::default(), actor);
        svc.store().put(&document).unwrap();

        let room = FragmentManager::new(document.id, PeerIdentity::system());
        let tree = svc.ensure_pages(actor, &room).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.top_level[0].title, "Untitled");
        assert!(room.bind(&tree.top_level[0].content_id).unwrap().read_content().is_empty());

        let again = svc.ensure_pages(actor, &room).unwrap();
        assert_eq!(again.top_level[0].id, tree.top_level[0].id);

        let missing = FragmentManager::new(Uuid::new_v4(), PeerIdentity::system());
        assert!(matches!(
            svc.ensure_pages(actor, &missing),
            Err(ServiceError::NotFound { kind: "document", .. })
        ));
    }

    #[test]
    fn test_context_resolves_references() {
        let svc = service();
        let store = svc.store();
        let client = Client {
            id: Uuid::new_v4(),
            name: "Acme".into(),
        };
        let department = Department {
            id: Uuid::new_v4(),
            client_id: Some(client.id),
            name: "Design".into(),
        };
        let project = Project {
            id: Uuid::new_v4(),
            client_id: Some(client.id),
            department_id: Some(department.id),
            name: "Relaunch".into(),
        };
        let contact = User {
            id: Uuid::new_v4(),
            name: "Casey".into(),
            email: "casey@acme.test".into(),
            role: UserRole::Client,
            department_ids: vec![department.id],
        };
        let outsider = User {
            department_ids: vec![Uuid::new_v4()],
            id: Uuid::new_v4(),
            ..contact.clone()
        };
        let task = Task {
            id: Uuid::new_v4(),
            project_id: project.id,
            sprint_id: None,
            title: "Wireframes".into(),
            status: TaskStatus::Todo,
        };
        store.put(&client).unwrap();
        store.put(&department).unwrap();
        store.put(&project).unwrap();
        store.put(&contact).unwrap();
        store.put(&outsider).unwrap();
        store.put(&task).unwrap();

        let metadata = DocumentMetadata::default()
            .with_client(client.id)
            .with_project(project.id)
            .with_department(department.id);
        let id = svc
            .create_document_with_pages(Uuid::new_v4(), NewDocument::new("D").with_metadata(metadata))
            .unwrap();

        let ctx = svc.get_document_with_context(id).unwrap().unwrap();
        assert_eq!(ctx.client, Some(client));
        assert_eq!(ctx.project, Some(project));
        assert_eq!(ctx.department, Some(department));
        assert_eq!(ctx.client_users, vec![contact]);
        assert_eq!(ctx.tasks, vec![task]);
        assert_eq!(ctx.pages.len(), 1);
    }

    #[test]
    fn test_context_missing_references_are_none() {
        let svc = service();
        let metadata = DocumentMetadata::default().with_project(Uuid::new_v4());
        let id = svc
            .create_document_with_pages(Uuid::new_v4(), NewDocument::new("D").with_metadata(metadata))
            .unwrap();

        let ctx = svc.get_document_with_context(id).unwrap().unwrap();
        assert!(ctx.project.is_none());
        assert!(ctx.client_users.is_empty());
        assert!(ctx.tasks.is_empty());
        assert!(svc.get_document_with_context(Uuid::new_v4()).unwrap().is_none());
    }
}
