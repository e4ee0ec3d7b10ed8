//! Template resolution, instantiation and save-as-template.
//!
//! Resolution order:
//! ```text
//! template_id ──► template_key ──► category default ──► seeded "blank"
//!  (if found)      (if found or      (most used, then      (created if
//!                   a built-in key)   most recently used,   absent)
//!                                     then newest)
//! ```

use quire_core::content::{sanitize_doc, EMPTY_DOC_JSON};
use quire_core::model::{DocumentId, DocumentMetadata, DocumentType, Page, TemplateId, UserId};
use quire_core::model::{ClientId, DepartmentId, ProjectId};
use quire_core::template::{
    builtin_template, PageSpec, Template, TemplateCategory, TemplateSnapshot, BLANK_TEMPLATE_KEY,
    PROJECT_BRIEF_TEMPLATE_KEY,
};

use super::documents::NewDocument;
use super::usage::{apply_bump, UsageBump};
use super::{DocumentService, ServiceError};
use crate::fragment::read_fragment;
use crate::storage::{category_key, index, RecordStore, SnapshotStore};

/// Input of [`DocumentService::create_document_from_template`].
#[derive(Debug, Clone, Default)]
pub struct FromTemplateRequest {
    /// Defaults to the snapshot's document title.
    pub title: Option<String>,
    pub template_id: Option<TemplateId>,
    pub template_key: Option<String>,
    /// Selects the category default; defaults to the template's category.
    pub document_type: Option<DocumentType>,
    pub project_id: Option<ProjectId>,
    pub client_id: Option<ClientId>,
    pub department_id: Option<DepartmentId>,
    pub metadata: Option<DocumentMetadata>,
}

/// Input of [`DocumentService::save_as_template`].
#[derive(Debug, Clone)]
pub struct SaveTemplateRequest {
    pub document_id: DocumentId,
    pub name: String,
    pub description: String,
    pub category: TemplateCategory,
    pub is_public: bool,
}

impl<S: RecordStore + SnapshotStore + 'static> DocumentService<S> {
    /// Resolve a template and expand it into a new document.
    ///
    /// The usage bump is best effort: its failure never fails creation.
    pub fn create_document_from_template(
        &self,
        actor: UserId,
        request: FromTemplateRequest,
    ) -> Result<DocumentId, ServiceError> {
        let template = self.resolve_template(&request)?;
        let snapshot = &template.snapshot;

        let mut metadata = snapshot.metadata.clone().unwrap_or_default();
        metadata.template_id = Some(template.id);
        if let Some(overrides) = request.metadata {
            metadata.merge(overrides);
        }
        if let Some(id) = request.project_id {
            metadata.project_id = Some(id);
        }
        if let Some(id) = request.client_id {
            metadata.client_id = Some(id);
        }
        if let Some(id) = request.department_id {
            metadata.department_id = Some(id);
        }

        let title = request
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| snapshot.document_title.clone());
        let document_type = request
            .document_type
            .unwrap_or_else(|| template.category.document_type());

        let document_id = self.create_document_with_pages(
            actor,
            NewDocument {
                title,
                document_type: Some(document_type),
                metadata: Some(metadata),
                pages: Some(snapshot.pages.clone()),
            },
        )?;

        self.record_usage(template.id);
        log::info!(
            "Instantiated template {} ({}) as document {document_id}",
            template.id,
            template.name
        );
        Ok(document_id)
    }

    fn record_usage(&self, template_id: TemplateId) {
        match &self.usage {
            Some(recorder) => recorder.record(template_id),
            None => {
                let bump = UsageBump {
                    template_id,
                    used_at: quire_core::now_millis(),
                };
                if let Err(e) = apply_bump(self.store.as_ref(), bump) {
                    log::warn!("Usage bump for template {template_id} failed: {e}");
                }
            }
        }
    }

    /// Pick the template a request resolves to.
    pub fn resolve_template(&self, request: &FromTemplateRequest) -> Result<Template, ServiceError> {
        if let Some(id) = request.template_id {
            match self.store.get::<Template>(id)? {
                Some(template) => return Ok(template),
                None => log::warn!("Template {id} not found; falling back"),
            }
        }

        if let Some(key) = &request.template_key {
            if let Some(template) = self.template_by_key(key)? {
                return Ok(template);
            }
            if builtin_template(key).is_some() {
                return self.ensure_builtin(key);
            }
            log::warn!("Template key {key:?} not found; falling back");
        }

        if let Some(document_type) = request.document_type {
            if let Some(template) = self.category_default(TemplateCategory::from(document_type))? {
                return Ok(template);
            }
        }

        self.ensure_builtin(BLANK_TEMPLATE_KEY)
    }

    fn template_by_key(&self, key: &str) -> Result<Option<Template>, ServiceError> {
        let matches: Vec<Template> = self.store.scan_index(index::BY_KEY, key.as_bytes())?;
        Ok(matches.into_iter().next())
    }

    /// Best active template of a category. Seeds the project brief when its
    /// category is empty.
    fn category_default(&self, category: TemplateCategory) -> Result<Option<Template>, ServiceError> {
        let best = self
            .store
            .scan_index::<Template>(index::BY_CATEGORY, category_key(category))?
            .into_iter()
            .filter(|t| t.is_active)
            .max_by_key(Template::popularity);

        match best {
            Some(template) => Ok(Some(template)),
            None if category == TemplateCategory::ProjectBrief => {
                self.ensure_builtin(PROJECT_BRIEF_TEMPLATE_KEY).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Fetch a built-in template by key, creating it on first use.
    pub fn ensure_builtin(&self, key: &str) -> Result<Template, ServiceError> {
        if let Some(existing) = self.template_by_key(key)? {
            return Ok(existing);
        }
        let template = builtin_template(key)
            .ok_or_else(|| ServiceError::InvalidInput(format!("no built-in template {key:?}")))?;
        self.store.put(&template)?;
        log::info!("Seeded built-in template {key:?} ({})", template.id);
        Ok(template)
    }

    /// Make sure every built-in template exists.
    pub fn ensure_seeded_templates(&self) -> Result<Vec<Template>, ServiceError> {
        [BLANK_TEMPLATE_KEY, PROJECT_BRIEF_TEMPLATE_KEY]
            .into_iter()
            .map(|key| self.ensure_builtin(key))
            .collect()
    }

    /// Active templates, most popular first.
    pub fn list_templates(
        &self,
        category: Option<TemplateCategory>,
    ) -> Result<Vec<Template>, ServiceError> {
        let mut templates: Vec<Template> = match category {
            Some(category) => self.store.scan_index(index::BY_CATEGORY, category_key(category))?,
            None => self.store.scan_all()?,
        };
        templates.retain(|t| t.is_active);
        templates.sort_by_key(|t| std::cmp::Reverse(t.popularity()));
        Ok(templates)
    }

    /// Save a document's current content as a new template, reading live
    /// content from the room snapshot.
    pub fn save_as_template(
        &self,
        actor: UserId,
        request: SaveTemplateRequest,
    ) -> Result<TemplateId, ServiceError> {
        let state = match self.store.load_snapshot(request.document_id) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("Room {} unreadable, using durable content: {e}", request.document_id);
                None
            }
        };
        self.save_as_template_with_state(actor, request, state.as_deref())
    }

    /// Like [`save_as_template`](Self::save_as_template), with the live
    /// room state supplied by the caller (an open editing session).
    pub fn save_as_template_with_state(
        &self,
        actor: UserId,
        request: SaveTemplateRequest,
        room_state: Option<&[u8]>,
    ) -> Result<TemplateId, ServiceError> {
        let document = self
            .get_document(request.document_id)?
            .ok_or_else(|| ServiceError::not_found("document", request.document_id))?;
        let tree = self.list_pages(document.id)?;

        let mut pages = Vec::with_capacity(tree.top_level.len());
        for page in &tree.top_level {
            let subpages = tree
                .children_of(page.id)
                .iter()
                .map(|child| self.page_spec(child, room_state, Vec::new()))
                .collect::<Result<Vec<_>, _>>()?;
            pages.push(self.page_spec(page, room_state, subpages)?);
        }

        let mut template = Template::new(
            request.name,
            request.description,
            request.category,
            TemplateSnapshot {
                document_title: document.title.clone(),
                metadata: Some(document.metadata.clone()),
                pages,
            },
        );
        template.is_public = request.is_public;
        template.created_by = Some(actor);
        self.store.put(&template)?;

        log::info!("Saved document {} as template {}", document.id, template.id);
        Ok(template.id)
    }

    fn page_spec(
        &self,
        page: &Page,
        room_state: Option<&[u8]>,
        subpages: Vec<PageSpec>,
    ) -> Result<PageSpec, ServiceError> {
        Ok(PageSpec {
            title: page.title.clone(),
            icon: page.icon.clone(),
            order: Some(page.order),
            content: Some(self.live_content(page, room_state)?),
            subpages,
        })
    }

    /// Live fragment content, else the durable record, else an empty doc.
    fn live_content(&self, page: &Page, room_state: Option<&[u8]>) -> Result<String, ServiceError> {
        if let Some(state) = room_state {
            match read_fragment(state, &page.content_id) {
                Ok(Some(doc)) => return Ok(sanitize_doc(doc).to_json()),
                Ok(None) => {}
                Err(e) => log::warn!("Room state for page {} unreadable: {e}", page.id),
            }
        }
        Ok(match self.page_content(page.id)? {
            Some(record) => record.content.to_json(),
            None => EMPTY_DOC_JSON.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceConfig, UsageRecorder};
    use crate::storage::MemoryStore;
    use quire_core::content::Node;
    use quire_core::model::PageContentRecord;
    use std::sync::Arc;
    use uuid::Uuid;

    fn service() -> DocumentService<MemoryStore> {
        DocumentService::new(Arc::new(MemoryStore::new()), ServiceConfig::default())
    }

    fn user_template(svc: &DocumentService<MemoryStore>, name: &str, category: TemplateCategory) -> Template {
        let snapshot = TemplateSnapshot {
            document_title: name.to_string(),
            metadata: None,
            pages: vec![PageSpec::new(name)],
        };
        let template = Template::new(name, "", category, snapshot);
        svc.store().put(&template).unwrap();
        template
    }

    #[test]
    fn test_resolution_priority() {
        let svc = service();
        let by_id = user_template(&svc, "by id", TemplateCategory::MeetingNotes);
        let by_key = user_template(&svc, "by key", TemplateCategory::MeetingNotes).with_key("weekly");
        svc.store().put(&by_key).unwrap();
        let mut popular = user_template(&svc, "popular", TemplateCategory::MeetingNotes);
        popular.usage_count = 10;
        svc.store().put(&popular).unwrap();

        let mut request = FromTemplateRequest {
            template_id: Some(by_id.id),
            template_key: Some("weekly".into()),
            document_type: Some(DocumentType::MeetingNotes),
            ..FromTemplateRequest::default()
        };
        assert_eq!(svc.resolve_template(&request).unwrap().id, by_id.id);

        request.template_id = None;
        assert_eq!(svc.resolve_template(&request).unwrap().id, by_key.id);

        request.template_key = None;
        assert_eq!(svc.resolve_template(&request).unwrap().id, popular.id);

        request.document_type = None;
        let blank = svc.resolve_template(&request).unwrap();
        assert_eq!(blank.key.as_deref(), Some(BLANK_TEMPLATE_KEY));
        // Seeded once.
        assert_eq!(svc.resolve_template(&request).unwrap().id, blank.id);
    }

    #[test]
    fn test_category_default_tie_breaks_on_recency() {
        let svc = service();
        let mut older = user_template(&svc, "older", TemplateCategory::Retrospective);
        let mut newer = user_template(&svc, "newer", TemplateCategory::Retrospective);
        older.usage_count = 3;
        newer.usage_count = 3;
        older.last_used_at = Some(100);
        newer.last_used_at = Some(200);
        svc.store().put(&older).unwrap();
        svc.store().put(&newer).unwrap();

        let request = FromTemplateRequest {
            document_type: Some(DocumentType::Retrospective),
            ..FromTemplateRequest::default()
        };
        assert_eq!(svc.resolve_template(&request).unwrap().id, newer.id);
    }

    #[test]
    fn test_project_brief_is_seeded_for_its_category() {
        let svc = service();
        let request = FromTemplateRequest {
            document_type: Some(DocumentType::ProjectBrief),
            ..FromTemplateRequest::default()
        };
        let template = svc.resolve_template(&request).unwrap();
        assert_eq!(template.key.as_deref(), Some(PROJECT_BRIEF_TEMPLATE_KEY));
    }

    #[test]
    fn test_unknown_id_and_key_fall_through() {
        let svc = service();
        let request = FromTemplateRequest {
            template_id: Some(Uuid::new_v4()),
            template_key: Some("nope".into()),
            ..FromTemplateRequest::default()
        };
        let template = svc.resolve_template(&request).unwrap();
        assert_eq!(template.key.as_deref(), Some(BLANK_TEMPLATE_KEY));
    }

    #[test]
    fn test_instantiation_applies_overrides_and_bumps_usage() {
        let svc = service();
        let project = Uuid::new_v4();
        let request = FromTemplateRequest {
            template_key: Some(PROJECT_BRIEF_TEMPLATE_KEY.into()),
            project_id: Some(project),
            ..FromTemplateRequest::default()
        };
        let actor = Uuid::new_v4();
        let doc_id = svc.create_document_from_template(actor, request).unwrap();

        let doc = svc.get_document(doc_id).unwrap().unwrap();
        assert_eq!(doc.document_type, DocumentType::ProjectBrief);
        assert_eq!(doc.project_id, Some(project));
        let template = svc.ensure_builtin(PROJECT_BRIEF_TEMPLATE_KEY).unwrap();
        assert_eq!(doc.metadata.template_id, Some(template.id));
        assert_eq!(template.usage_count, 1);
        assert!(!svc.list_pages(doc_id).unwrap().is_empty());
    }

    #[test]
    fn test_stray_text_in_snapshot_is_wrapped() {
        let svc = service();
        let snapshot = TemplateSnapshot {
            document_title: "Legacy".into(),
            metadata: None,
            pages: vec![PageSpec::new("Old")
                .with_content(r#"{"type":"doc","content":[{"type":"text","text":"loose"}]}"#)],
        };
        let template = Template::new("Legacy", "", TemplateCategory::General, snapshot);
        svc.store().put(&template).unwrap();

        let doc_id = svc
            .create_document_from_template(
                Uuid::new_v4(),
                FromTemplateRequest {
                    template_id: Some(template.id),
                    ..FromTemplateRequest::default()
                },
            )
            .unwrap();
        let page = svc.list_pages(doc_id).unwrap().top_level[0].clone();
        let state = svc.store().load_snapshot(doc_id).unwrap().unwrap();
        let live = read_fragment(&state, &page.content_id).unwrap().unwrap();
        assert!(live.content.iter().all(|n| !n.is_text()));
    }

    #[tokio::test]
    async fn test_usage_failure_does_not_fail_creation() {
        let store = Arc::new(MemoryStore::new());
        let (recorder, _worker) =
            UsageRecorder::spawn(|_| Err(ServiceError::InvalidInput("injected".into())));
        let svc = DocumentService::new(store, ServiceConfig::default()).with_usage_recorder(recorder.clone());

        let doc_id = svc
            .create_document_from_template(Uuid::new_v4(), FromTemplateRequest::default())
            .unwrap();
        assert!(svc.get_document(doc_id).unwrap().is_some());
        assert_eq!(recorder.stats().queued, 1);
    }

    #[test]
    fn test_save_as_template_one_level() {
        let svc = service();
        let spec = PageSpec::new("Parent").with_subpages(vec![PageSpec::new("Child")]);
        let doc_id = svc
            .create_document_with_pages(Uuid::new_v4(), NewDocument::new("Doc").with_pages(vec![spec]))
            .unwrap();

        let template_id = svc
            .save_as_template(
                Uuid::new_v4(),
                SaveTemplateRequest {
                    document_id: doc_id,
                    name: "Mine".into(),
                    description: "".into(),
                    category: TemplateCategory::UserCreated,
                    is_public: true,
                },
            )
            .unwrap();

        let template: Template = svc.store().get(template_id).unwrap().unwrap();
        assert_eq!(template.snapshot.pages.len(), 1);
        assert_eq!(template.snapshot.pages[0].subpages.len(), 1);
        assert_eq!(template.snapshot.pages[0].subpages[0].title, "Child");
        assert!(template.is_public);
        assert_eq!(template.snapshot.document_title, "Doc");
    }

    #[test]
    fn test_save_as_template_prefers_live_content() {
        let svc = service();
        let doc_id = svc
            .create_document_with_pages(Uuid::new_v4(), NewDocument::new("Doc"))
            .unwrap();
        let page = svc.list_pages(doc_id).unwrap().top_level[0].clone();

        // Live edit that never reached the durable record.
        let state = svc.store().load_snapshot(doc_id).unwrap().unwrap();
        let room = crate::fragment::FragmentManager::from_state(
            doc_id,
            crate::presence::PeerIdentity::system(),
            &state,
        )
        .unwrap();
        room.bind(&page.content_id).unwrap().replace(&Node::doc(vec![Node::paragraph("live")]));
        svc.store().save_snapshot(doc_id, &room.encode_state()).unwrap();

        // And a stale durable record.
        svc.store()
            .put(&PageContentRecord {
                page_id: page.id,
                document_id: doc_id,
                content: quire_core::PageContent::new(vec![quire_core::Block::paragraph("stale")]),
                updated_at: 0,
                updated_by: Uuid::nil(),
            })
            .unwrap();

        let request = SaveTemplateRequest {
            document_id: doc_id,
            name: "Live".into(),
            description: String::new(),
            category: TemplateCategory::General,
            is_public: false,
        };
        let template_id = svc.save_as_template(Uuid::new_v4(), request.clone()).unwrap();
        let template: Template = svc.store().get(template_id).unwrap().unwrap();
        assert!(template.snapshot.pages[0].content.as_deref().unwrap().contains("live"));

        // Without a room, the durable record is used.
        let template_id = svc.save_as_template_with_state(Uuid::new_v4(), request, None).unwrap();
        let template: Template = svc.store().get(template_id).unwrap().unwrap();
        assert!(template.snapshot.pages[0].content.as_deref().unwrap().contains("stale"));
    }

    #[test]
    fn test_save_missing_document() {
        let svc = service();
        let request = SaveTemplateRequest {
            document_id: Uuid::new_v4(),
            name: "x".into(),
            description: String::new(),
            category: TemplateCategory::General,
            is_public: false,
        };
        assert!(matches!(
            svc.save_as_template(Uuid::new_v4(), request),
            Err(ServiceError::NotFound { kind: "document", .. })
        ));
    }

    #[test]
    fn test_list_templates() {
        let svc = service();
        svc.ensure_seeded_templates().unwrap();
        svc.ensure_seeded_templates().unwrap();
        let mut retired = user_template(&svc, "retired", TemplateCategory::General);
        retired.is_active = false;
        svc.store().put(&retired).unwrap();

        assert_eq!(svc.list_templates(None).unwrap().len(), 2);
        assert_eq!(svc.list_templates(Some(TemplateCategory::Blank)).unwrap().len(), 1);
        assert!(svc.list_templates(Some(TemplateCategory::General)).unwrap().is_empty());
    }
}
