//! Reusable document blueprints.
//!
//! A template stores a snapshot of a document: its title, optional metadata
//! and an ordered list of page specs (with at most one level of sub-pages).
//! Instantiating a template expands the snapshot into live pages.

use serde::{Deserialize, Serialize};

use crate::content::{Block, PageContent};
use crate::model::{new_id, now_millis, DocumentMetadata, DocumentType, TemplateId, UserId};

/// Key of the seeded fallback template.
pub const BLANK_TEMPLATE_KEY: &str = "blank";
/// Key of the seeded project brief template.
pub const PROJECT_BRIEF_TEMPLATE_KEY: &str = "project_brief";

/// Template category: the document types plus two template-only buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateCategory {
    ProjectBrief,
    MeetingNotes,
    WikiArticle,
    ResourceDoc,
    Retrospective,
    Blank,
    General,
    UserCreated,
}

impl TemplateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateCategory::ProjectBrief => "project_brief",
            TemplateCategory::MeetingNotes => "meeting_notes",
            TemplateCategory::WikiArticle => "wiki_article",
            TemplateCategory::ResourceDoc => "resource_doc",
            TemplateCategory::Retrospective => "retrospective",
            TemplateCategory::Blank => "blank",
            TemplateCategory::General => "general",
            TemplateCategory::UserCreated => "user_created",
        }
    }

    /// Document type a document created from this category gets.
    pub fn document_type(&self) -> DocumentType {
        match self {
            TemplateCategory::ProjectBrief => DocumentType::ProjectBrief,
            TemplateCategory::MeetingNotes => DocumentType::MeetingNotes,
            TemplateCategory::WikiArticle => DocumentType::WikiArticle,
            TemplateCategory::ResourceDoc => DocumentType::ResourceDoc,
            TemplateCategory::Retrospective => DocumentType::Retrospective,
            TemplateCategory::Blank | TemplateCategory::General | TemplateCategory::UserCreated => {
                DocumentType::Blank
            }
        }
    }
}

impl From<DocumentType> for TemplateCategory {
    fn from(value: DocumentType) -> Self {
        match value {
            DocumentType::ProjectBrief => TemplateCategory::ProjectBrief,
            DocumentType::MeetingNotes => TemplateCategory::MeetingNotes,
            DocumentType::WikiArticle => TemplateCategory::WikiArticle,
            DocumentType::ResourceDoc => TemplateCategory::ResourceDoc,
            DocumentType::Retrospective => TemplateCategory::Retrospective,
            DocumentType::Blank => TemplateCategory::Blank,
        }
    }
}

/// One page of a template snapshot (or of a create-document request).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageSpec {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    /// Serialized `doc` JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Child pages. Only one level is expanded; deeper specs are ignored.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subpages: Vec<PageSpec>,
}

impl PageSpec {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_subpages(mut self, subpages: Vec<PageSpec>) -> Self {
        self.subpages = subpages;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateSnapshot {
    pub document_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DocumentMetadata>,
    #[serde(default)]
    pub pages: Vec<PageSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub key: Option<String>,
    pub name: String,
    pub description: String,
    pub category: TemplateCategory,
    pub snapshot: TemplateSnapshot,
    pub usage_count: u64,
    pub last_used_at: Option<u64>,
    pub is_active: bool,
    pub is_public: bool,
    pub created_by: Option<UserId>,
    pub created_at: u64,
}

impl Template {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: TemplateCategory,
        snapshot: TemplateSnapshot,
    ) -> Self {
        Self {
            id: new_id(),
            key: None,
            name: name.into(),
            description: description.into(),
            category,
            snapshot,
            usage_count: 0,
            last_used_at: None,
            is_active: true,
            is_public: false,
            created_by: None,
            created_at: now_millis(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Bump usage statistics.
    pub fn record_usage(&mut self, at: u64) {
        self.usage_count += 1;
        self.last_used_at = Some(at);
    }

    /// Ranking for category defaults: most used, then most recently used,
    /// then most recently created.
    pub fn popularity(&self) -> (u64, u64, u64) {
        (self.usage_count, self.last_used_at.unwrap_or(0), self.created_at)
    }
}

/// Built-in templates, seeded lazily by key.
pub fn builtin_template(key: &str) -> Option<Template> {
    match key {
        BLANK_TEMPLATE_KEY => Some(blank_template()),
        PROJECT_BRIEF_TEMPLATE_KEY => Some(project_brief_template()),
        _ => None,
    }
}

fn blank_template() -> Template {
    let snapshot = TemplateSnapshot {
        document_title: "Untitled".to_string(),
        metadata: None,
        pages: vec![PageSpec::new("Untitled")
            .with_order(0)
            .with_content(PageContent::empty().to_json())],
    };
    let mut template = Template::new(
        "Blank",
        "An empty document with a single page",
        TemplateCategory::Blank,
        snapshot,
    )
    .with_key(BLANK_TEMPLATE_KEY);
    template.is_public = true;
    template
}

fn project_brief_template() -> Template {
    let overview = PageContent::new(vec![
        Block::heading(1, "Overview"),
        Block::paragraph("Summarize the project, the client and the problem being solved."),
    ]);
    let stakeholders = PageContent::new(vec![
        Block::heading(2, "Stakeholders"),
        Block::bullet("Client sponsor"),
        Block::bullet("Project lead"),
    ]);
    let goals = PageContent::new(vec![
        Block::heading(1, "Goals"),
        Block::bullet("Primary goal"),
        Block::bullet("Success metric"),
    ]);
    let scope = PageContent::new(vec![
        Block::heading(1, "Scope & Deliverables"),
        Block::paragraph("What is in scope, what is out of scope, and what gets delivered."),
    ]);
    let timeline = PageContent::new(vec![
        Block::heading(1, "Timeline"),
        Block::paragraph("Key milestones and sprint plan."),
    ]);

    let snapshot = TemplateSnapshot {
        document_title: "Project Brief".to_string(),
        metadata: None,
        pages: vec![
            PageSpec::new("Overview")
                .with_icon("📋")
                .with_order(0)
                .with_content(overview.to_json())
                .with_subpages(vec![PageSpec::new("Stakeholders")
                    .with_order(1)
                    .with_content(stakeholders.to_json())]),
            PageSpec::new("Goals")
                .with_icon("🎯")
                .with_order(1)
                .with_content(goals.to_json()),
            PageSpec::new("Scope & Deliverables")
                .with_order(2)
                .with_content(scope.to_json()),
            PageSpec::new("Timeline")
                .with_icon("🗓")
                .with_order(3)
                .with_content(timeline.to_json()),
        ],
    };
    let mut template = Template::new(
        "Project Brief",
        "Overview, goals, scope and timeline for a new project",
        TemplateCategory::ProjectBrief,
        snapshot,
    )
    .with_key(PROJECT_BRIEF_TEMPLATE_KEY);
    template.is_public = true;
    template
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_keys() {
        let blank = builtin_template(BLANK_TEMPLATE_KEY).unwrap();
        assert_eq!(blank.key.as_deref(), Some(BLANK_TEMPLATE_KEY));
        assert_eq!(blank.snapshot.pages.len(), 1);
        assert_eq!(blank.category, TemplateCategory::Blank);

        let brief = builtin_template(PROJECT_BRIEF_TEMPLATE_KEY).unwrap();
        assert_eq!(brief.category, TemplateCategory::ProjectBrief);
        assert_eq!(brief.snapshot.pages[0].subpages.len(), 1);

        assert!(builtin_template("kanban").is_none());
    }

    #[test]
    fn test_builtin_content_parses() {
        let brief = builtin_template(PROJECT_BRIEF_TEMPLATE_KEY).unwrap();
        for spec in &brief.snapshot.pages {
            let content = PageContent::parse(spec.content.as_deref().unwrap()).unwrap();
            assert!(!content.is_empty());
        }
    }

    #[test]
    fn test_popularity_ordering() {
        let snapshot = TemplateSnapshot::default();
        let mut popular = Template::new("A", "", TemplateCategory::General, snapshot.clone());
        let mut recent = Template::new("B", "", TemplateCategory::General, snapshot);
        popular.usage_count = 5;
        popular.last_used_at = Some(1);
        recent.usage_count = 5;
        recent.last_used_at = Some(2);

        assert!(recent.popularity() > popular.popularity());
        recent.usage_count = 4;
        assert!(popular.popularity() > recent.popularity());
    }

    #[test]
    fn test_record_usage() {
        let mut t = Template::new("A", "", TemplateCategory::General, TemplateSnapshot::default());
        t.record_usage(42);
        t.record_usage(43);
        assert_eq!(t.usage_count, 2);
        assert_eq!(t.last_used_at, Some(43));
    }

    #[test]
    fn test_category_document_type_mapping() {
        assert_eq!(TemplateCategory::General.document_type(), DocumentType::Blank);
        assert_eq!(
            TemplateCategory::from(DocumentType::Retrospective),
            TemplateCategory::Retrospective
        );
    }

    #[test]
    fn test_page_spec_serde_skips_empty_subpages() {
        let spec = PageSpec::new("Notes");
        let raw = serde_json::to_value(&spec).unwrap();
        assert!(raw.get("subpages").is_none());
        let back: PageSpec = serde_json::from_value(raw).unwrap();
        assert_eq!(back, spec);
    }
}
