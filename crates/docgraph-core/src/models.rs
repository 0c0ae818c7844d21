//! Core data models: documents, nodes, edges, embeddings, tags and filters.
//!
//! These are the rows owned by a [`Store`](crate::store::Store). The
//! shredder produces them, the search engines read them.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// A source document as last ingested.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    /// Content-addressed id: a pure function of path and content.
    pub doc_id: String,
    pub source_path: String,
    /// SHA-256 of the raw bytes.
    pub content_hash: String,
    /// Text of the first heading, if any.
    pub title: Option<String>,
    pub raw_text: String,
}

/// Block type of a [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Synthetic per-document root.
    Root,
    Heading,
    Paragraph,
    Code,
    ListItem,
    Quote,
    Table,
    Html,
    Rule,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Heading => "heading",
            NodeKind::Paragraph => "paragraph",
            NodeKind::Code => "code",
            NodeKind::ListItem => "list_item",
            NodeKind::Quote => "quote",
            NodeKind::Table => "table",
            NodeKind::Html => "html",
            NodeKind::Rule => "rule",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(NodeKind::Root),
            "heading" => Ok(NodeKind::Heading),
            "paragraph" => Ok(NodeKind::Paragraph),
            "code" => Ok(NodeKind::Code),
            "list_item" => Ok(NodeKind::ListItem),
            "quote" => Ok(NodeKind::Quote),
            "table" => Ok(NodeKind::Table),
            "html" => Ok(NodeKind::Html),
            "rule" => Ok(NodeKind::Rule),
            other => Err(format!("unknown node kind: {}", other)),
        }
    }
}

/// A single addressable content block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub node_id: String,
    pub doc_id: String,
    pub kind: NodeKind,
    /// Heading level (1-6) for headings, `None` otherwise.
    pub level: Option<u8>,
    /// Document order, starting at 0 for the root.
    pub order_index: i64,
    pub raw_content: String,
    pub short_id: String,
    /// SHA-256 of `raw_content`, used to detect stale embeddings.
    pub content_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    ParentChild,
    Reference,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::ParentChild => "parent_child",
            EdgeType::Reference => "reference",
        }
    }
}

impl FromStr for EdgeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parent_child" => Ok(EdgeType::ParentChild),
            "reference" => Ok(EdgeType::Reference),
            other => Err(format!("unknown edge type: {}", other)),
        }
    }
}

/// A typed directed relationship between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Edge {
    pub edge_type: EdgeType,
    pub src_node_id: String,
    pub dst_node_id: String,
}

/// An embedding vector for one node under one model.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub node_id: String,
    pub model_id: String,
    pub vector: Vec<f32>,
}

impl Embedding {
    /// Vector length, stored alongside the blob and checked against queries.
    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    Collection,
    Topic,
}

impl TagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagKind::Collection => "collection",
            TagKind::Topic => "topic",
        }
    }
}

impl FromStr for TagKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collection" => Ok(TagKind::Collection),
            "topic" => Ok(TagKind::Topic),
            other => Err(format!("unknown tag kind: {}", other)),
        }
    }
}

/// What a tag is attached to. Document tags are stored against the
/// document's source path so they survive content changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagTarget {
    Document(String),
    Node(String),
}

/// Optional result filters shared by both search engines and the outline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    pub collection: Option<String>,
    pub topic: Option<String>,
    pub scope_path_prefix: Option<String>,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        self.collection.is_none() && self.topic.is_none() && self.scope_path_prefix.is_none()
    }

    /// Whether the path filter admits `source_path`.
    pub fn admits_path(&self, source_path: &str) -> bool {
        match &self.scope_path_prefix {
            Some(prefix) => source_path.starts_with(prefix.as_str()),
            None => true,
        }
    }
}

/// A ranked search result before enrichment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredNode {
    pub node_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Same path and content hash already stored; nothing written.
    Unchanged,
    Created,
    Replaced,
}

/// Summary of a single-document ingest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub doc_id: String,
    pub source_path: String,
    pub outcome: IngestOutcome,
    pub nodes: usize,
    pub edges: usize,
    pub references_resolved: usize,
    pub references_unresolved: usize,
    pub embeddings_stale: usize,
    pub embeddings_removed: usize,
}

impl IngestReport {
    pub fn unchanged(doc_id: &str, source_path: &str) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            source_path: source_path.to_string(),
            outcome: IngestOutcome::Unchanged,
            nodes: 0,
            edges: 0,
            references_resolved: 0,
            references_unresolved: 0,
            embeddings_stale: 0,
            embeddings_removed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_kind_roundtrip_names() {
        for kind in [
            NodeKind::Root,
            NodeKind::Heading,
            NodeKind::Paragraph,
            NodeKind::Code,
            NodeKind::ListItem,
            NodeKind::Quote,
            NodeKind::Table,
            NodeKind::Html,
            NodeKind::Rule,
        ] {
            assert_eq!(kind.as_str().parse::<NodeKind>().unwrap(), kind);
        }
        assert!("chapter".parse::<NodeKind>().is_err());
    }

    #[test]
    fn test_embedding_dimensions_follow_vector() {
        let e = Embedding {
            node_id: "n".into(),
            model_id: "m".into(),
            vector: vec![1.0, 2.0, 3.0],
        };
        assert_eq!(e.dimensions(), 3);
    }

    #[test]
    fn test_filters_path_prefix() {
        let f = Filters {
            scope_path_prefix: Some("docs/".into()),
            ..Default::default()
        };
        assert!(!f.is_empty());
        assert!(f.admits_path("docs/intro.md"));
        assert!(!f.admits_path("notes/intro.md"));
        assert!(Filters::default().admits_path("anything"));
    }
}
