//! Page content codec.
//!
//! Persisted page content is a JSON tree with a `doc` root:
//!
//! ```text
//! { "type": "doc", "content": [ <block>, <block>, ... ] }
//! ```
//!
//! Two views of the same tree exist:
//!
//! - [`Node`]: the editor-side tree, full fidelity. This is what the CRDT
//!   fragment carries and what template snapshots store.
//! - [`PageContent`]: the durable-side tree. Top-level blocks are restricted
//!   to the allow-listed [`BlockKind`]s; everything else is dropped before a
//!   durable write.
//!
//! Both views share the same invariant: no top-level text nodes. A stray text
//! node at the top level is wrapped in a paragraph before it reaches a
//! fragment or the durable store.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Root node type of every serialized page.
pub const DOC_TYPE: &str = "doc";
/// Inline text node type.
pub const TEXT_TYPE: &str = "text";

/// Serialized form of an empty page.
pub const EMPTY_DOC_JSON: &str = r#"{"type":"doc","content":[]}"#;

/// Content codec errors.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("Malformed content JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected root node of type 'doc', found '{0}'")]
    UnexpectedRoot(String),
}

// ───────────────────────────────────────────────────────────────────
// Editor-side tree
// ───────────────────────────────────────────────────────────────────

/// An inline mark (bold, link, ...) attached to a text node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Map<String, Value>>,
}

impl Mark {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), attrs: None }
    }
}

/// A node of the editor document tree.
///
/// Element nodes always serialize `content` (possibly `[]`); text nodes
/// never do.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Node {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attrs: Option<Map<String, Value>>,
    #[serde(default)]
    pub content: Vec<Node>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub marks: Vec<Mark>,
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", &self.kind)?;
        if let Some(attrs) = &self.attrs {
            map.serialize_entry("attrs", attrs)?;
        }
        if !self.is_text() {
            map.serialize_entry("content", &self.content)?;
        }
        if let Some(text) = &self.text {
            map.serialize_entry("text", text)?;
        }
        if !self.marks.is_empty() {
            map.serialize_entry("marks", &self.marks)?;
        }
        map.end()
    }
}

impl Node {
    /// An element node with children.
    pub fn element(kind: impl Into<String>, content: Vec<Node>) -> Self {
        Self {
            kind: kind.into(),
            attrs: None,
            content,
            text: None,
            marks: Vec::new(),
        }
    }

    /// A `doc` root holding the given blocks.
    pub fn doc(content: Vec<Node>) -> Self {
        Self::element(DOC_TYPE, content)
    }

    /// An empty `doc` root.
    pub fn empty_doc() -> Self {
        Self::doc(Vec::new())
    }

    /// An inline text node.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: TEXT_TYPE.to_string(),
            attrs: None,
            content: Vec::new(),
            text: Some(text.into()),
            marks: Vec::new(),
        }
    }

    /// A paragraph holding a single text run (or nothing for empty text).
    pub fn paragraph(text: &str) -> Self {
        let content = if text.is_empty() {
            Vec::new()
        } else {
            vec![Node::text(text)]
        };
        Self::element(BlockKind::Paragraph.as_str(), content)
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attrs.get_or_insert_with(Map::new).insert(key.into(), value);
        self
    }

    pub fn with_marks(mut self, marks: Vec<Mark>) -> Self {
        self.marks = marks;
        self
    }

    pub fn is_text(&self) -> bool {
        self.kind == TEXT_TYPE
    }

    pub fn is_doc(&self) -> bool {
        self.kind == DOC_TYPE
    }

    /// A paragraph with no content (the editor's pristine block).
    pub fn is_empty_paragraph(&self) -> bool {
        self.kind == BlockKind::Paragraph.as_str() && self.content.is_empty()
    }

    /// Concatenated text of this subtree. Blocks are separated by newlines.
    pub fn plain_text(&self) -> String {
        if let Some(text) = &self.text {
            return text.clone();
        }
        let inline = self.content.iter().all(Node::is_text);
        let parts: Vec<String> = self.content.iter().map(Node::plain_text).collect();
        if inline {
            parts.concat()
        } else {
            parts.join("\n")
        }
    }

    /// Serialize this node as JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            log::warn!("Failed to serialize node '{}': {e}", self.kind);
            EMPTY_DOC_JSON.to_string()
        })
    }
}

/// Parse a serialized editor document. The root must be a `doc` node.
pub fn parse_doc(raw: &str) -> Result<Node, ContentError> {
    let node: Node = serde_json::from_str(raw)?;
    if !node.is_doc() {
        return Err(ContentError::UnexpectedRoot(node.kind));
    }
    Ok(node)
}

/// Parse a serialized editor document, falling back to an empty `doc`.
pub fn parse_doc_or_empty(raw: &str) -> Node {
    match parse_doc(raw) {
        Ok(doc) => doc,
        Err(e) => {
            log::warn!("Replacing malformed page content with an empty doc: {e}");
            Node::empty_doc()
        }
    }
}

/// Wrap every top-level text node in its own paragraph.
///
/// Other top-level nodes are kept untouched, including kinds outside the
/// durable allow-list.
pub fn sanitize_doc(doc: Node) -> Node {
    let Node { kind, attrs, content, text, marks } = doc;
    let content = content
        .into_iter()
        .map(|node| {
            if node.is_text() {
                Node::element(BlockKind::Paragraph.as_str(), vec![node])
            } else {
                node
            }
        })
        .collect();
    Node { kind, attrs, content, text, marks }
}

/// Parse and sanitize raw snapshot content in one step.
pub fn sanitize_raw(raw: Option<&str>) -> Node {
    match raw {
        Some(raw) if !raw.trim().is_empty() => sanitize_doc(parse_doc_or_empty(raw)),
        _ => Node::empty_doc(),
    }
}

// ───────────────────────────────────────────────────────────────────
// Durable-side tree
// ───────────────────────────────────────────────────────────────────

/// Block kinds retained by durable writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Paragraph,
    Heading,
    BulletListItem,
    NumberedListItem,
    CheckListItem,
    Table,
    Image,
    Video,
    Audio,
    File,
    CodeBlock,
}

impl BlockKind {
    pub const ALL: [BlockKind; 11] = [
        BlockKind::Paragraph,
        BlockKind::Heading,
        BlockKind::BulletListItem,
        BlockKind::NumberedListItem,
        BlockKind::CheckListItem,
        BlockKind::Table,
        BlockKind::Image,
        BlockKind::Video,
        BlockKind::Audio,
        BlockKind::File,
        BlockKind::CodeBlock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Paragraph => "paragraph",
            BlockKind::Heading => "heading",
            BlockKind::BulletListItem => "bulletListItem",
            BlockKind::NumberedListItem => "numberedListItem",
            BlockKind::CheckListItem => "checkListItem",
            BlockKind::Table => "table",
            BlockKind::Image => "image",
            BlockKind::Video => "video",
            BlockKind::Audio => "audio",
            BlockKind::File => "file",
            BlockKind::CodeBlock => "codeBlock",
        }
    }

    /// Look up an allow-listed kind by its node type.
    pub fn from_type(kind: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == kind)
    }
}

/// A top-level block of durable page content.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: BlockKind,
    pub attrs: Option<Map<String, Value>>,
    pub content: Vec<Node>,
}

impl Block {
    pub fn new(kind: BlockKind, content: Vec<Node>) -> Self {
        Self { kind, attrs: None, content }
    }

    pub fn paragraph(text: &str) -> Self {
        let content = if text.is_empty() {
            Vec::new()
        } else {
            vec![Node::text(text)]
        };
        Self::new(BlockKind::Paragraph, content)
    }

    pub fn heading(level: u8, text: &str) -> Self {
        let mut block = Self::new(BlockKind::Heading, vec![Node::text(text)]);
        block
            .attrs
            .get_or_insert_with(Map::new)
            .insert("level".to_string(), Value::from(level));
        block
    }

    pub fn bullet(text: &str) -> Self {
        Self::new(BlockKind::BulletListItem, vec![Node::text(text)])
    }

    /// Convert an editor node into a block. Returns `None` for kinds outside
    /// the allow-list.
    pub fn from_node(node: Node) -> Option<Self> {
        let kind = BlockKind::from_type(&node.kind)?;
        Some(Self {
            kind,
            attrs: node.attrs,
            content: node.content,
        })
    }

    pub fn to_node(&self) -> Node {
        Node {
            kind: self.kind.as_str().to_string(),
            attrs: self.attrs.clone(),
            content: self.content.clone(),
            text: None,
            marks: Vec::new(),
        }
    }
}

/// Durable page content: a `doc` root holding allow-listed blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageContent {
    pub blocks: Vec<Block>,
}

impl PageContent {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Build durable content from an editor document: stray text nodes are
    /// wrapped, non-allow-listed blocks are dropped.
    pub fn from_doc(doc: &Node) -> Self {
        let sanitized = sanitize_doc(doc.clone());
        let total = sanitized.content.len();
        let blocks: Vec<Block> = sanitized
            .content
            .into_iter()
            .filter_map(Block::from_node)
            .collect();
        if blocks.len() < total {
            log::debug!(
                "Dropped {} block(s) outside the durable allow-list",
                total - blocks.len()
            );
        }
        Self { blocks }
    }

    /// Editor view of this content.
    pub fn to_doc(&self) -> Node {
        Node::doc(self.blocks.iter().map(Block::to_node).collect())
    }

    pub fn to_json(&self) -> String {
        self.to_doc().to_json()
    }

    /// Strict parse: malformed JSON or a non-`doc` root is an error.
    pub fn parse(raw: &str) -> Result<Self, ContentError> {
        Ok(Self::from_doc(&parse_doc(raw)?))
    }

    /// Lenient parse: malformed content becomes an empty page.
    pub fn parse_or_empty(raw: &str) -> Self {
        Self::from_doc(&parse_doc_or_empty(raw))
    }

    pub fn plain_text(&self) -> String {
        self.to_doc().plain_text()
    }
}

impl Serialize for PageContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_doc().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PageContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let node = Node::deserialize(deserializer)?;
        if !node.is_doc() {
            return Err(serde::de::Error::custom(format!(
                "expected root node of type 'doc', found '{}'",
                node.kind
            )));
        }
        Ok(Self::from_doc(&node))
    }
}
