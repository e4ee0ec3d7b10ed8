//! Document lifecycle against RocksDB: template expansion, editing
//! sessions with debounced backup, save-as-template and reopen.

use quire_collab::engine::SyncConfig;
use quire_collab::fragment::read_fragment;
use quire_collab::presence::PeerIdentity;
use quire_collab::service::{
    DocumentService, FromTemplateRequest, NewDocument, ParentResolution, SaveTemplateRequest,
    ServiceConfig, UsageRecorder,
};
use quire_collab::session::EditingSession;
use quire_collab::status::{DurableState, SyncMode};
use quire_collab::storage::{RecordStore, RocksStore, SnapshotStore, StoreConfig};
use quire_core::content::{Node, PageContent};
use quire_core::model::{DocumentMetadata, DocumentType, PageContentRecord};
use quire_core::template::{PageSpec, Template, TemplateCategory, PROJECT_BRIEF_TEMPLATE_KEY};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

fn open_service(path: &Path) -> Arc<DocumentService<RocksStore>> {
    let store = RocksStore::open(StoreConfig::for_testing(path)).unwrap();
    Arc::new(DocumentService::new(Arc::new(store), ServiceConfig::default()))
}

#[tokio::test]
async fn test_edit_session_backs_up_and_survives_reopen() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("db");
    let identity = PeerIdentity::new(Uuid::new_v4(), "Grace");

    let (doc_id, page_id) = {
        let service = open_service(&db);
        let doc_id = service
            .create_document_from_template(
                identity.user_id,
                FromTemplateRequest {
                    title: Some("Launch".into()),
                    document_type: Some(DocumentType::ProjectBrief),
                    ..FromTemplateRequest::default()
                },
            )
            .unwrap();

        let session =
            EditingSession::open(Arc::clone(&service), doc_id, identity.clone(), SyncConfig::for_testing())
                .unwrap();
        let page = session.page_tree().unwrap().top_level[0].clone();
        let binding = session.open_page(page.id).unwrap();
        assert_eq!(session.status().durable, DurableState::Connected);
        assert_eq!(session.status().mode, SyncMode::DurableOnly);

        binding.push_block(&Node::paragraph("Ship it"));
        session.on_local_change(page.id).unwrap();

        timeout(Duration::from_secs(5), async {
            while session.engine().is_dirty(page.id) {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(session.engine().stats().writes, 1);

        session.close().await.unwrap();
        (doc_id, page.id)
    };
    // Aborted engine tasks release their store handle once polled.
    sleep(Duration::from_millis(50)).await;

    let service = open_service(&db);
    let record: PageContentRecord = service.page_content(page_id).unwrap().unwrap();
    assert!(record.content.plain_text().contains("Ship it"));

    let page = service.get_page(page_id).unwrap().unwrap();
    let state = service.store().load_snapshot(doc_id).unwrap().unwrap();
    let live = read_fragment(&state, &page.content_id).unwrap().unwrap();
    assert!(live.plain_text().contains("Ship it"));

    let session = EditingSession::open(service, doc_id, identity, SyncConfig::for_testing()).unwrap();
    let binding = session.open_page(page_id).unwrap();
    assert_eq!(PageContent::from_doc(&binding.read_doc()), record.content);
}

#[tokio::test]
async fn test_hydration_from_durable_record_when_room_is_missing() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let service = Arc::new(DocumentService::new(
        Arc::clone(&store),
        ServiceConfig {
            seed_rooms: false,
            ..ServiceConfig::default()
        },
    ));
    let identity = PeerIdentity::new(Uuid::new_v4(), "Linus");
    let spec = PageSpec::new("Notes")
        .with_content(r#"{"type":"doc","content":[{"type":"paragraph","content":[{"type":"text","text":"from the record"}]}]}"#);
    let doc_id = service
        .create_document_with_pages(identity.user_id, NewDocument::new("Doc").with_pages(vec![spec]))
        .unwrap();
    assert!(store.load_snapshot(doc_id).unwrap().is_none());

    let session = EditingSession::open(service, doc_id, identity, SyncConfig::for_testing()).unwrap();
    let page = session.page_tree().unwrap().top_level[0].clone();
    let binding = session.open_page(page.id).unwrap();
    assert_eq!(binding.read_content().plain_text(), "from the record");
    assert!(session.fragments().is_hydrated(&page.content_id));
}

#[tokio::test]
async fn test_template_instantiation_on_rocks() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let (recorder, _worker) = UsageRecorder::for_store(Arc::clone(&store));
    let service = DocumentService::new(Arc::clone(&store), ServiceConfig::default())
        .with_usage_recorder(recorder.clone());

    let project = Uuid::new_v4();
    let overrides = DocumentMetadata {
        sprint_id: Some(Uuid::new_v4()),
        ..DocumentMetadata::default()
    };
    let doc_id = service
        .create_document_from_template(
            Uuid::new_v4(),
            FromTemplateRequest {
                template_key: Some(PROJECT_BRIEF_TEMPLATE_KEY.into()),
                project_id: Some(project),
                metadata: Some(overrides.clone()),
                ..FromTemplateRequest::default()
            },
        )
        .unwrap();

    let doc = service.get_document(doc_id).unwrap().unwrap();
    assert_eq!(doc.project_id, Some(project));
    assert_eq!(doc.metadata.sprint_id, overrides.sprint_id);
    assert_eq!(doc.document_type, DocumentType::ProjectBrief);

    let template = service.ensure_builtin(PROJECT_BRIEF_TEMPLATE_KEY).unwrap();
    assert_eq!(doc.metadata.template_id, Some(template.id));

    timeout(Duration::from_secs(5), async {
        while recorder.stats().applied < 1 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let bumped: Template = store.get(template.id).unwrap().unwrap();
    assert_eq!(bumped.usage_count, 1);
    assert!(bumped.last_used_at.is_some());

    // Every page of the template landed in the room and in the durable store.
    let tree = service.list_pages(doc_id).unwrap();
    assert_eq!(tree.top_level.len(), template.snapshot.pages.len());
    let state = store.load_snapshot(doc_id).unwrap().unwrap();
    for page in &tree.top_level {
        assert!(read_fragment(&state, &page.content_id).unwrap().is_some());
        assert!(service.page_content(page.id).unwrap().is_some());
    }
}

#[tokio::test]
async fn test_metadata_patch_on_rocks() {
    let dir = tempdir().unwrap();
    let service = open_service(&dir.path().join("db"));
    let actor = Uuid::new_v4();
    let project = Uuid::new_v4();
    let client = Uuid::new_v4();

    let doc_id = service
        .create_document_with_pages(
            actor,
            NewDocument::new("Doc").with_metadata(DocumentMetadata::default().with_project(project)),
        )
        .unwrap();
    let updated = service
        .update_document_metadata(actor, doc_id, DocumentMetadata::default().with_client(client))
        .unwrap();

    assert_eq!(updated.metadata.project_id, Some(project));
    assert_eq!(updated.metadata.client_id, Some(client));
    assert_eq!(updated.client_id, Some(client));
    assert_eq!(updated.project_id, Some(project));
    assert_eq!(service.get_document(doc_id).unwrap().unwrap(), updated);
}

#[tokio::test]
async fn test_parent_strategies_on_rocks() {
    for strategy in [ParentResolution::MostRecentTopLevel, ParentResolution::Explicit] {
        let dir = tempdir().unwrap();
        let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let service = DocumentService::new(
            store,
            ServiceConfig {
                parent_resolution: strategy,
                ..ServiceConfig::default()
            },
        );
        let spec = PageSpec::new("Parent")
            .with_subpages(vec![PageSpec::new("One"), PageSpec::new("Two")]);
        let doc_id = service
            .create_document_with_pages(Uuid::new_v4(), NewDocument::new("Doc").with_pages(vec![spec]))
            .unwrap();

        let tree = service.list_pages(doc_id).unwrap();
        assert_eq!(tree.top_level.len(), 1);
        let children = tree.children_of(tree.top_level[0].id);
        let orders: Vec<i64> = children.iter().map(|p| p.order).collect();
        assert_eq!(orders, vec![1, 2], "{strategy:?}");
    }
}

#[tokio::test]
async fn test_save_as_template_then_instantiate() {
    let dir = tempdir().unwrap();
    let service = open_service(&dir.path().join("db"));
    let actor = Uuid::new_v4();
    let spec = PageSpec::new("Agenda").with_subpages(vec![PageSpec::new("Actions")]);
    let doc_id = service
        .create_document_with_pages(
            actor,
            NewDocument::new("Weekly")
                .with_type(DocumentType::MeetingNotes)
                .with_pages(vec![spec]),
        )
        .unwrap();

    let template_id = service
        .save_as_template(
            actor,
            SaveTemplateRequest {
                document_id: doc_id,
                name: "Weekly sync".into(),
                description: "Agenda and actions".into(),
                category: TemplateCategory::MeetingNotes,
                is_public: true,
            },
        )
        .unwrap();

    // The saved template is now the meeting-notes default.
    let copy = service
        .create_document_from_template(
            actor,
            FromTemplateRequest {
                document_type: Some(DocumentType::MeetingNotes),
                ..FromTemplateRequest::default()
            },
        )
        .unwrap();
    let doc = service.get_document(copy).unwrap().unwrap();
    assert_eq!(doc.metadata.template_id, Some(template_id));
    assert_eq!(doc.title, "Weekly");

    let tree = service.list_pages(copy).unwrap();
    assert_eq!(tree.top_level.len(), 1);
    assert_eq!(tree.top_level[0].title, "Agenda");
    let children = tree.children_of(tree.top_level[0].id);
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].title, "Actions");
}
