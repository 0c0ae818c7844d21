//! Markdown shredder: raw document bytes → forest of typed nodes.
//!
//! One synchronous pass over pulldown-cmark block events. The tree is
//! built in an arena with parent indices, driven by an explicit frame
//! stack instead of recursion, so pathological nesting costs heap, not
//! call stack.
//!
//! # Structure rules
//!
//! 1. Every non-empty document gets a synthetic root at index 0.
//! 2. A heading closes every open heading of equal or higher level and
//!    becomes the parent of the content that follows it.
//! 3. Paragraphs, code blocks, quotes, tables, HTML blocks and rules are
//!    leaves under the nearest open heading (or the root).
//! 4. List items are leaves, or list parents when they contain nested
//!    lists. An item's content stops where its first nested list starts.
//! 5. Anything inside a quote, table or item body is absorbed into that
//!    node rather than split out.
//!
//! Reference candidates are collected from inline links, autolinks and
//! `[[target]]` identifiers. Links with a URL scheme are external and
//! skipped. Resolution against stored nodes is the store's job.

use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;

use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag};
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::ids;
use crate::models::{Document, Edge, EdgeType, Node, NodeKind};

/// A shredded node plus its position in the arena.
#[derive(Debug, Clone)]
pub struct ShreddedNode {
    pub node: Node,
    /// Arena index of the parent; `None` only for the root.
    pub parent: Option<usize>,
    pub structural_path: String,
}

/// An outgoing link that still has to be resolved against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReference {
    /// Arena index of the node containing the link.
    pub src: usize,
    pub target: String,
}

/// Output of [`shred`]: the document row, its node forest and the raw
/// reference candidates. Nothing in here has touched storage yet.
#[derive(Debug, Clone)]
pub struct ShreddedDocument {
    pub document: Document,
    pub nodes: Vec<ShreddedNode>,
    pub references: Vec<RawReference>,
}

impl ShreddedDocument {
    /// Parent-child edges in document order.
    pub fn parent_child_edges(&self) -> Vec<Edge> {
        self.nodes
            .iter()
            .filter_map(|n| {
                n.parent.map(|p| Edge {
                    edge_type: EdgeType::ParentChild,
                    src_node_id: self.nodes[p].node.node_id.clone(),
                    dst_node_id: n.node.node_id.clone(),
                })
            })
            .collect()
    }

    pub fn root(&self) -> Option<&Node> {
        self.nodes.first().map(|n| &n.node)
    }
}

#[derive(Debug, Clone, Copy)]
enum Frame {
    /// Heading whose title text is being collected.
    Heading(usize),
    /// Node-owning block whose inner content is not split further.
    Leaf(usize),
    Item(usize),
    List,
    /// Inline tag or absorbed block.
    Inline,
}

struct ArenaNode {
    kind: NodeKind,
    level: Option<u8>,
    parent: Option<usize>,
    span: Range<usize>,
    /// Content end for list items that contain nested lists.
    cut: Option<usize>,
    structural_path: String,
    title: Option<String>,
}

struct ForestBuilder<'a> {
    text: &'a str,
    arena: Vec<ArenaNode>,
    frames: Vec<Frame>,
    /// Open headings as `(level, arena index)`.
    sections: Vec<(u8, usize)>,
    ordinals: HashMap<(usize, String), usize>,
    references: Vec<RawReference>,
    heading_text: String,
}

/// Shred one document.
///
/// Fails with [`GraphError::Input`] for a bad path and
/// [`GraphError::Parse`] for bytes that are not valid UTF-8. Either
/// way nothing is produced, so callers never see a partial forest.
pub fn shred(source_path: &str, bytes: &[u8]) -> Result<ShreddedDocument> {
    let path = ids::normalize_path(source_path)?;
    let text = std::str::from_utf8(bytes).map_err(|e| GraphError::Parse {
        path: path.clone(),
        reason: format!("invalid UTF-8 at byte {}", e.valid_up_to()),
    })?;

    let doc_id = ids::doc_id(&path, bytes)?;
    let anchor = ids::doc_anchor(&path)?;

    let mut builder = ForestBuilder::new(text);
    if !text.trim().is_empty() {
        builder.walk();
    }
    let (nodes, references, title) = builder.finish(&doc_id, &anchor, &path);

    debug!(
        path = %path,
        nodes = nodes.len(),
        references = references.len(),
        "shredded document"
    );

    Ok(ShreddedDocument {
        document: Document {
            doc_id,
            source_path: path,
            content_hash: ids::content_hash(bytes),
            title,
            raw_text: text.to_string(),
        },
        nodes,
        references,
    })
}

impl<'a> ForestBuilder<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            arena: Vec::new(),
            frames: Vec::new(),
            sections: Vec::new(),
            ordinals: HashMap::new(),
            references: Vec::new(),
            heading_text: String::new(),
        }
    }

    fn walk(&mut self) {
        self.arena.push(ArenaNode {
            kind: NodeKind::Root,
            level: None,
            parent: None,
            span: 0..0,
            cut: None,
            structural_path: "root".to_string(),
            title: None,
        });

        let options = Options::ENABLE_TABLES
            | Options::ENABLE_FOOTNOTES
            | Options::ENABLE_STRIKETHROUGH
            | Options::ENABLE_TASKLISTS
            | Options::ENABLE_YAML_STYLE_METADATA_BLOCKS;

        for (event, range) in Parser::new_ext(self.text, options).into_offset_iter() {
            match event {
                Event::Start(tag) => self.start(tag, range),
                Event::End(_) => self.end(),
                Event::Text(t) | Event::Code(t) => {
                    if self.in_heading() {
                        self.heading_text.push_str(&t);
                    }
                }
                Event::Rule => {
                    if !self.absorbed() {
                        let parent = self.block_parent();
                        self.push_node(NodeKind::Rule, None, parent, range);
                    }
                }
                _ => {}
            }
        }
    }

    fn start(&mut self, tag: Tag<'_>, range: Range<usize>) {
        let absorbed = self.absorbed();
        let nested_list = matches!(self.frames.last(), Some(Frame::Item(_)));
        let frame = match tag {
            Tag::Heading { level, .. } if !absorbed => {
                let level = heading_level(level);
                while let Some(&(open, _)) = self.sections.last() {
                    if open >= level {
                        self.sections.pop();
                    } else {
                        break;
                    }
                }
                let parent = self.section_parent();
                let idx = self.push_node(NodeKind::Heading, Some(level), parent, range);
                self.sections.push((level, idx));
                self.heading_text.clear();
                Frame::Heading(idx)
            }
            Tag::Paragraph | Tag::FootnoteDefinition(_) if !absorbed => {
                self.leaf(NodeKind::Paragraph, range)
            }
            Tag::CodeBlock(_) if !absorbed => self.leaf(NodeKind::Code, range),
            Tag::BlockQuote(_) if !absorbed => self.leaf(NodeKind::Quote, range),
            Tag::Table(_) if !absorbed => self.leaf(NodeKind::Table, range),
            Tag::HtmlBlock if !absorbed => self.leaf(NodeKind::Html, range),
            // A list directly inside an item ends that item's own text.
            Tag::List(_) if nested_list || !absorbed => {
                if let Some(Frame::Item(idx)) = self.frames.last() {
                    let idx = *idx;
                    self.arena[idx].cut.get_or_insert(range.start);
                }
                Frame::List
            }
            Tag::Item if !absorbed => {
                let parent = self.block_parent();
                Frame::Item(self.push_node(NodeKind::ListItem, None, parent, range))
            }
            Tag::Link { dest_url, .. } => {
                self.record_reference(dest_url.as_ref());
                Frame::Inline
            }
            _ => Frame::Inline,
        };
        self.frames.push(frame);
    }

    fn end(&mut self) {
        if let Some(Frame::Heading(idx)) = self.frames.pop() {
            let title = self.heading_text.trim().to_string();
            let slug = ids::slugify(&title);
            let parent = self.arena[idx].parent.unwrap_or(0);
            let key = format!("heading:{}", slug);
            let ordinal = self.next_ordinal(parent, &key);
            self.arena[idx].structural_path =
                format!("{}/{}#{}", self.arena[parent].structural_path, key, ordinal);
            self.arena[idx].title = Some(title);
            self.heading_text.clear();
        }
    }

    fn leaf(&mut self, kind: NodeKind, range: Range<usize>) -> Frame {
        let parent = self.block_parent();
        Frame::Leaf(self.push_node(kind, None, parent, range))
    }

    /// Blocks inside a leaf, a heading, or directly inside a list item
    /// are part of that node's content. Nested lists are the exception,
    /// see `start`.
    fn absorbed(&self) -> bool {
        matches!(self.frames.last(), Some(Frame::Item(_)))
            || self
                .frames
                .iter()
                .any(|f| matches!(f, Frame::Leaf(_) | Frame::Heading(_)))
    }

    fn in_heading(&self) -> bool {
        self.frames.iter().any(|f| matches!(f, Frame::Heading(_)))
    }

    fn section_parent(&self) -> usize {
        self.sections.last().map(|&(_, idx)| idx).unwrap_or(0)
    }

    /// Innermost enclosing list item, else the open section.
    fn block_parent(&self) -> usize {
        self.frames
            .iter()
            .rev()
            .find_map(|f| match f {
                Frame::Item(idx) => Some(*idx),
                _ => None,
            })
            .unwrap_or_else(|| self.section_parent())
    }

    /// Innermost node that owns inline content at this point.
    fn owner(&self) -> usize {
        self.frames
            .iter()
            .rev()
            .find_map(|f| match f {
                Frame::Heading(idx) | Frame::Leaf(idx) | Frame::Item(idx) => Some(*idx),
                _ => None,
            })
            .unwrap_or_else(|| self.section_parent())
    }

    fn next_ordinal(&mut self, parent: usize, key: &str) -> usize {
        let counter = self.ordinals.entry((parent, key.to_string())).or_insert(0);
        let ordinal = *counter;
        *counter += 1;
        ordinal
    }

    fn push_node(
        &mut self,
        kind: NodeKind,
        level: Option<u8>,
        parent: usize,
        span: Range<usize>,
    ) -> usize {
        // Heading paths need the title, so they are filled in by `end`.
        let structural_path = if kind == NodeKind::Heading {
            String::new()
        } else {
            let ordinal = self.next_ordinal(parent, kind.as_str());
            format!(
                "{}/{}#{}",
                self.arena[parent].structural_path,
                kind.as_str(),
                ordinal
            )
        };
        self.arena.push(ArenaNode {
            kind,
            level,
            parent: Some(parent),
            span,
            cut: None,
            structural_path,
            title: None,
        });
        self.arena.len() - 1
    }

    fn record_reference(&mut self, dest: &str) {
        let dest = dest.trim();
        if dest.is_empty() || is_external(dest) {
            return;
        }
        let src = self.owner();
        self.references.push(RawReference {
            src,
            target: dest.to_string(),
        });
    }

    fn finish(
        mut self,
        doc_id: &str,
        anchor: &str,
        path: &str,
    ) -> (Vec<ShreddedNode>, Vec<RawReference>, Option<String>) {
        let title = self
            .arena
            .iter()
            .find_map(|n| n.title.clone())
            .filter(|t| !t.is_empty());

        let mut nodes = Vec::with_capacity(self.arena.len());
        for (idx, entry) in self.arena.iter().enumerate() {
            let raw_content = if entry.kind == NodeKind::Root {
                title.clone().unwrap_or_else(|| file_label(path))
            } else {
                let end = entry.cut.unwrap_or(entry.span.end);
                self.text[entry.span.start..end].trim().to_string()
            };

            if entry.kind != NodeKind::Code && entry.kind != NodeKind::Root {
                for target in identifier_links(&raw_content) {
                    self.references.push(RawReference { src: idx, target });
                }
            }

            let node_id = ids::node_id(anchor, &entry.structural_path);
            nodes.push(ShreddedNode {
                node: Node {
                    short_id: ids::short_id(&node_id),
                    content_hash: ids::content_hash(raw_content.as_bytes()),
                    node_id,
                    doc_id: doc_id.to_string(),
                    kind: entry.kind,
                    level: entry.level,
                    order_index: idx as i64,
                    raw_content,
                },
                parent: entry.parent,
                structural_path: entry.structural_path.clone(),
            });
        }

        (nodes, self.references, title)
    }
}

fn heading_level(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

fn is_external(dest: &str) -> bool {
    dest.contains("://") || dest.starts_with("mailto:") || dest.starts_with("tel:")
}

fn file_label(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

/// `[[target]]` identifiers in a block's raw text.
fn identifier_links(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(open) = rest.find("[[") {
        let after = &rest[open + 2..];
        match after.find("]]") {
            Some(close) => {
                let target = after[..close].trim();
                if !target.is_empty() && !target.contains('\n') {
                    out.push(target.to_string());
                }
                rest = &after[close + 2..];
            }
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(doc: &ShreddedDocument) -> Vec<NodeKind> {
        doc.nodes.iter().map(|n| n.node.kind).collect()
    }

    fn find<'d>(doc: &'d ShreddedDocument, needle: &str) -> &'d ShreddedNode {
        doc.nodes
            .iter()
            .find(|n| n.node.kind != NodeKind::Root && n.node.raw_content.contains(needle))
            .unwrap_or_else(|| panic!("no node containing {:?}", needle))
    }

    #[test]
    fn test_three_headings_forest() {
        let text = "# Alpha\n\nfirst para\n\n# Beta\n\nsecond para\n\n# Gamma\n\nthird para\n";
        let doc = shred("notes/three.md", text.as_bytes()).unwrap();

        let k = kinds(&doc);
        assert_eq!(k.iter().filter(|k| **k == NodeKind::Root).count(), 1);
        assert_eq!(k.iter().filter(|k| **k == NodeKind::Heading).count(), 3);
        assert_eq!(k.iter().filter(|k| **k == NodeKind::Paragraph).count(), 3);

        for (heading, para) in [("Alpha", "first"), ("Beta", "second"), ("Gamma", "third")] {
            let h = find(&doc, heading);
            assert_eq!(h.parent, Some(0));
            let p = find(&doc, para);
            assert_eq!(doc.nodes[p.parent.unwrap()].node.node_id, h.node.node_id);
        }
        assert_eq!(doc.parent_child_edges().len(), 6);
        assert_eq!(doc.document.title.as_deref(), Some("Alpha"));
    }

    #[test]
    fn test_heading_levels_nest_and_close() {
        let text = "# A\n\n## A1\n\npara a1\n\n### A1x\n\n## A2\n\npara a2\n\n# B\n";
        let doc = shred("n.md", text.as_bytes()).unwrap();
        let a = find(&doc, "# A").node.node_id.clone();
        let a1 = find(&doc, "## A1");
        let a1x = find(&doc, "### A1x");
        let a2 = find(&doc, "## A2");
        let b = find(&doc, "# B");
        assert_eq!(doc.nodes[a1.parent.unwrap()].node.node_id, a);
        assert_eq!(doc.nodes[a1x.parent.unwrap()].node.node_id, a1.node.node_id);
        assert_eq!(doc.nodes[a2.parent.unwrap()].node.node_id, a);
        assert_eq!(b.parent, Some(0));
        assert_eq!(a1.node.level, Some(2));
    }

    #[test]
    fn test_headingless_document_has_synthetic_root() {
        let doc = shred("plain.md", b"just text\n\nmore text\n").unwrap();
        assert_eq!(doc.nodes[0].node.kind, NodeKind::Root);
        assert_eq!(doc.nodes[0].node.raw_content, "plain");
        assert!(doc.nodes[1..].iter().all(|n| n.parent == Some(0)));
        assert_eq!(doc.nodes.len(), 3);
        assert!(doc.document.title.is_none());
    }

    #[test]
    fn test_empty_document_has_no_nodes_but_hash() {
        let doc = shred("empty.md", b"  \n\n").unwrap();
        assert!(doc.nodes.is_empty());
        assert!(doc.references.is_empty());
        assert_eq!(doc.document.content_hash, ids::content_hash(b"  \n\n"));
    }

    #[test]
    fn test_invalid_utf8_rejected_whole() {
        let err = shred("bad.md", &[b'#', b' ', 0xff, 0xfe]).unwrap_err();
        match err {
            GraphError::Parse { path, reason } => {
                assert_eq!(path, "bad.md");
                assert!(reason.contains("UTF-8"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_path_is_input_error() {
        assert!(matches!(
            shred("", b"# x").unwrap_err(),
            GraphError::Input { .. }
        ));
    }

    #[test]
    fn test_list_items_and_nested_list_parent() {
        let text = "# L\n\n- one\n- two\n  - two.a\n  - two.b\n- three\n";
        let doc = shred("list.md", text.as_bytes()).unwrap();
        let items: Vec<&ShreddedNode> = doc
            .nodes
            .iter()
            .filter(|n| n.node.kind == NodeKind::ListItem)
            .collect();
        assert_eq!(items.len(), 5);

        let two = items
            .iter()
            .find(|n| n.node.raw_content.contains("two") && !n.node.raw_content.contains("two."))
            .unwrap();
        assert!(!two.node.raw_content.contains("two.a"));
        let two_a = find(&doc, "two.a");
        assert_eq!(doc.nodes[two_a.parent.unwrap()].node.node_id, two.node.node_id);

        let heading = find(&doc, "# L");
        let three = find(&doc, "three");
        assert_eq!(doc.nodes[three.parent.unwrap()].node.node_id, heading.node.node_id);
    }

    #[test]
    fn test_nested_item_text_belongs_to_child_only() {
        let before = shred("n.md", b"- one\n  - inner old\n    - deepest\n").unwrap();
        let holders = before
            .nodes
            .iter()
            .filter(|n| n.node.raw_content.contains("deepest"))
            .count();
        assert_eq!(holders, 1);
        assert_eq!(find(&before, "one").node.raw_content, "- one");
        assert_eq!(find(&before, "inner").node.raw_content, "- inner old");

        // editing a nested item leaves its ancestors' hashes alone
        let after = shred("n.md", b"- one\n  - inner new\n    - deepest\n").unwrap();
        assert_eq!(
            find(&before, "one").node.content_hash,
            find(&after, "one").node.content_hash
        );
        assert_ne!(
            find(&before, "inner").node.content_hash,
            find(&after, "inner").node.content_hash
        );
    }

    #[test]
    fn test_code_quote_table_rule_are_leaves() {
        let text = "# T\n\n```rust\nfn main() {}\n```\n\n> quoted\n> - not an item\n\n| a | b |\n|---|---|\n| 1 | 2 |\n\n---\n";
        let doc = shred("t.md", text.as_bytes()).unwrap();
        let k = kinds(&doc);
        assert!(k.contains(&NodeKind::Code));
        assert!(k.contains(&NodeKind::Quote));
        assert!(k.contains(&NodeKind::Table));
        assert!(k.contains(&NodeKind::Rule));
        assert!(!k.contains(&NodeKind::ListItem));
        assert!(find(&doc, "fn main").node.raw_content.starts_with("```"));
    }

    #[test]
    fn test_references_collected() {
        let text = "# R\n\nSee [other](other.md#setup), <https://example.com> and [[abc12345]].\n\n```\n[[not-a-ref]]\n```\n";
        let doc = shred("r.md", text.as_bytes()).unwrap();
        let targets: Vec<&str> = doc.references.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["other.md#setup", "abc12345"]);
        let para = find(&doc, "See [other]");
        let para_idx = doc
            .nodes
            .iter()
            .position(|n| n.node.node_id == para.node.node_id)
            .unwrap();
        assert!(doc.references.iter().all(|r| r.src == para_idx));
    }

    #[test]
    fn test_node_ids_stable_when_sibling_section_changes() {
        let before = shred("s.md", b"# One\n\nalpha\n\n# Two\n\nbeta\n").unwrap();
        let after = shred("s.md", b"# One\n\nalpha\n\n# Two\n\nbeta changed\n").unwrap();
        assert_ne!(before.document.doc_id, after.document.doc_id);

        let alpha_before = find(&before, "alpha");
        let alpha_after = find(&after, "alpha");
        assert_eq!(alpha_before.node.node_id, alpha_after.node.node_id);
        assert_eq!(alpha_before.node.content_hash, alpha_after.node.content_hash);

        let beta_before = find(&before, "beta");
        let beta_after = find(&after, "beta");
        assert_eq!(beta_before.node.node_id, beta_after.node.node_id);
        assert_ne!(beta_before.node.content_hash, beta_after.node.content_hash);
    }

    #[test]
    fn test_duplicate_headings_get_distinct_ids() {
        let doc = shred("d.md", b"# Notes\n\n# Notes\n").unwrap();
        let headings: Vec<&ShreddedNode> = doc
            .nodes
            .iter()
            .filter(|n| n.node.kind == NodeKind::Heading)
            .collect();
        assert_eq!(headings.len(), 2);
        assert_ne!(headings[0].node.node_id, headings[1].node.node_id);
    }

    #[test]
    fn test_order_index_follows_document_order() {
        let doc = shred("o.md", b"# A\n\none\n\ntwo\n\n## B\n\nthree\n").unwrap();
        for (i, n) in doc.nodes.iter().enumerate() {
            assert_eq!(n.node.order_index, i as i64);
        }
    }

    #[test]
    fn test_deeply_nested_lists_do_not_recurse() {
        let mut text = String::new();
        for depth in 0..100 {
            text.push_str(&"  ".repeat(depth));
            text.push_str(&format!("- level{}\n", depth));
        }
        let doc = shred("deep.md", text.as_bytes()).unwrap();
        let items = doc
            .nodes
            .iter()
            .filter(|n| n.node.kind == NodeKind::ListItem)
            .count();
        assert_eq!(items, 100);
        let last = find(&doc, "level99");
        let mut depth = 0;
        let mut cursor = last.parent;
        while let Some(p) = cursor {
            depth += 1;
            cursor = doc.nodes[p].parent;
        }
        assert_eq!(depth, 100);
    }

    #[test]
    fn test_front_matter_is_not_a_node() {
        let doc = shred("fm.md", b"---\ntitle: x\n---\n\n# Real\n").unwrap();
        assert!(doc.nodes.iter().all(|n| !n.node.raw_content.contains("title: x")));
        assert_eq!(doc.document.title.as_deref(), Some("Real"));
    }
}
