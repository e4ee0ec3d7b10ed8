//! Document and page records.
//!
//! A document owns an ordered forest of pages. Every page is bound to exactly
//! one collaborative fragment through its `content_id`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::SystemTime;
use uuid::Uuid;

pub type DocumentId = Uuid;
pub type PageId = Uuid;
pub type TemplateId = Uuid;
pub type UserId = Uuid;
pub type ClientId = Uuid;
pub type ProjectId = Uuid;
pub type DepartmentId = Uuid;
pub type SprintId = Uuid;
pub type TaskId = Uuid;

/// Allocate a record id. Ids are time-ordered so that sorting by id falls
/// back to insertion order.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Document classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    ProjectBrief,
    MeetingNotes,
    WikiArticle,
    ResourceDoc,
    Retrospective,
    #[default]
    Blank,
}

impl DocumentType {
    pub const ALL: [DocumentType; 6] = [
        DocumentType::ProjectBrief,
        DocumentType::MeetingNotes,
        DocumentType::WikiArticle,
        DocumentType::ResourceDoc,
        DocumentType::Retrospective,
        DocumentType::Blank,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::ProjectBrief => "project_brief",
            DocumentType::MeetingNotes => "meeting_notes",
            DocumentType::WikiArticle => "wiki_article",
            DocumentType::ResourceDoc => "resource_doc",
            DocumentType::Retrospective => "retrospective",
            DocumentType::Blank => "blank",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

/// Document lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    Draft,
    Active,
    Archived,
}

/// Free-form document metadata.
///
/// The typed references are the ones the rest of the system queries on.
/// Anything else a caller stores lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<DepartmentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprint_id: Option<SprintId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<Uuid>,
    /// Dynamic field bindings (field name → bound value).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub dynamic_fields: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DocumentMetadata {
    pub fn with_client(mut self, id: ClientId) -> Self {
        self.client_id = Some(id);
        self
    }

    pub fn with_project(mut self, id: ProjectId) -> Self {
        self.project_id = Some(id);
        self
    }

    pub fn with_department(mut self, id: DepartmentId) -> Self {
        self.department_id = Some(id);
        self
    }

    /// Shallow merge: every key present in `patch` overwrites ours.
    ///
    /// `dynamic_fields` is a single key, so a non-empty patch replaces the
    /// whole binding map.
    pub fn merge(&mut self, patch: DocumentMetadata) {
        let DocumentMetadata {
            client_id,
            project_id,
            department_id,
            sprint_id,
            template_id,
            dynamic_fields,
            extra,
        } = patch;

        if client_id.is_some() {
            self.client_id = client_id;
        }
        if project_id.is_some() {
            self.project_id = project_id;
        }
        if department_id.is_some() {
            self.department_id = department_id;
        }
        if sprint_id.is_some() {
            self.sprint_id = sprint_id;
        }
        if template_id.is_some() {
            self.template_id = template_id;
        }
        if !dynamic_fields.is_empty() {
            self.dynamic_fields = dynamic_fields;
        }
        for (key, value) in extra {
            self.extra.insert(key, value);
        }
    }
}

/// A top-level unit of work product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub status: DocumentStatus,
    pub owner_id: UserId,
    pub document_type: DocumentType,
    pub metadata: DocumentMetadata,
    // Copies of the metadata references, kept for indexed queries.
    pub client_id: Option<ClientId>,
    pub project_id: Option<ProjectId>,
    pub department_id: Option<DepartmentId>,
    pub created_at: u64,
    pub created_by: UserId,
    pub modified_at: u64,
    pub modified_by: UserId,
}

impl Document {
    pub fn new(
        title: impl Into<String>,
        document_type: DocumentType,
        metadata: DocumentMetadata,
        actor: UserId,
    ) -> Self {
        let now = now_millis();
        let mut doc = Self {
            id: new_id(),
            title: title.into(),
            status: DocumentStatus::Draft,
            owner_id: actor,
            document_type,
            metadata: DocumentMetadata::default(),
            client_id: None,
            project_id: None,
            department_id: None,
            created_at: now,
            created_by: actor,
            modified_at: now,
            modified_by: actor,
        };
        doc.duplicate_references(&metadata);
        doc.metadata = metadata;
        doc
    }

    /// Merge a metadata patch, keep the top-level copies in step, and stamp
    /// the modification.
    pub fn apply_metadata(&mut self, patch: DocumentMetadata, actor: UserId) {
        self.duplicate_references(&patch);
        self.metadata.merge(patch);
        self.modified_at = now_millis();
        self.modified_by = actor;
    }

    fn duplicate_references(&mut self, from: &DocumentMetadata) {
        if let Some(id) = from.client_id {
            self.client_id = Some(id);
        }
        if let Some(id) = from.department_id {
            self.department_id = Some(id);
        }
        if let Some(id) = from.project_id {
            self.project_id = Some(id);
        }
    }
}

/// A node in a document's page forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: PageId,
    pub document_id: DocumentId,
    pub parent_page_id: Option<PageId>,
    /// Names the collaborative fragment holding this page's content.
    pub content_id: String,
    pub title: String,
    pub icon: Option<String>,
    pub order: i64,
    pub created_at: u64,
}

impl Page {
    pub fn new(
        document_id: DocumentId,
        parent_page_id: Option<PageId>,
        title: impl Into<String>,
        order: i64,
    ) -> Self {
        Self {
            id: new_id(),
            document_id,
            parent_page_id,
            content_id: Uuid::new_v4().to_string(),
            title: title.into(),
            icon: None,
            order,
            created_at: now_millis(),
        }
    }

    pub fn with_icon(mut self, icon: Option<String>) -> Self {
        self.icon = icon;
        self
    }

    pub fn is_top_level(&self) -> bool {
        self.parent_page_id.is_none()
    }

    /// Sibling ordering. Duplicate `order` values are tolerated and resolved
    /// by creation time, then id.
    pub fn sort_key(&self) -> (i64, u64, Uuid) {
        (self.order, self.created_at, self.id)
    }
}

/// Sort pages into sibling order.
pub fn sort_pages(pages: &mut [Page]) {
    pages.sort_by_key(Page::sort_key);
}

/// A document's pages split into top-level pages and children by parent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageTree {
    pub top_level: Vec<Page>,
    pub children: HashMap<PageId, Vec<Page>>,
}

impl PageTree {
    pub fn build(pages: Vec<Page>) -> Self {
        let mut tree = PageTree::default();
        for page in pages {
            match page.parent_page_id {
                None => tree.top_level.push(page),
                Some(parent) => tree.children.entry(parent).or_default().push(page),
            }
        }
        sort_pages(&mut tree.top_level);
        for siblings in tree.children.values_mut() {
            sort_pages(siblings);
        }
        tree
    }

    pub fn children_of(&self, page_id: PageId) -> &[Page] {
        self.children.get(&page_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.top_level.len() + self.children.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Durable copy of a page's content, written by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageContentRecord {
    pub page_id: PageId,
    pub document_id: DocumentId,
    pub content: crate::content::PageContent,
    pub updated_at: u64,
    pub updated_by: UserId,
}
