//! # quire-core: Document, page and template model for Quire
//!
//! Plain data types shared by the collaboration layer:
//!
//! - [`model`]: documents, pages, the page tree and durable page content
//! - [`content`]: the `doc` JSON codec, sanitizer and durable allow-list
//! - [`template`]: template snapshots and the built-in seeds
//! - [`directory`]: clients, projects, departments, users and tasks
//!
//! Nothing here performs I/O.

pub mod content;
pub mod directory;
pub mod model;
pub mod template;

pub use content::{Block, BlockKind, ContentError, Mark, Node, PageContent};
pub use directory::{Client, Department, Project, Task, TaskStatus, User, UserRole};
pub use model::{
    now_millis, new_id, Document, DocumentId, DocumentMetadata, DocumentStatus, DocumentType,
    Page, PageContentRecord, PageId, PageTree, TemplateId, UserId,
};
pub use template::{PageSpec, Template, TemplateCategory, TemplateSnapshot};
