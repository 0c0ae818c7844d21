//! Read-only tree view of a document.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use serde::Serialize;

use crate::error::Result;
use crate::models::{EdgeType, Filters, Node};
use crate::search::preview;
use crate::store::GraphStore;

const LABEL_CHARS: usize = 72;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutlineEntry {
    pub node: Node,
    /// 0 for the root.
    pub depth: usize,
}

/// Pre-order walk of a document's parent-child forest.
///
/// With non-empty `filters`, only nodes admitted by the filters are
/// kept, together with their ancestors so the tree stays navigable.
/// The walk uses an explicit stack, so nesting depth is not limited by
/// the call stack.
pub async fn outline<S: GraphStore + ?Sized>(
    store: &S,
    doc_id: &str,
    filters: &Filters,
) -> Result<Vec<OutlineEntry>> {
    store.get_document(doc_id).await?;
    let nodes = store.document_nodes(doc_id).await?;
    if nodes.is_empty() {
        return Ok(Vec::new());
    }
    let edges = store.document_edges(doc_id).await?;

    let by_id: HashMap<&str, &Node> = nodes.iter().map(|n| (n.node_id.as_str(), n)).collect();
    let mut children: HashMap<&str, Vec<&Node>> = HashMap::new();
    let mut parent: HashMap<&str, &str> = HashMap::new();
    for e in edges.iter().filter(|e| e.edge_type == EdgeType::ParentChild) {
        let src = by_id.get(e.src_node_id.as_str());
        let dst = by_id.get(e.dst_node_id.as_str());
        if let (Some(&src), Some(&dst)) = (src, dst) {
            children.entry(src.node_id.as_str()).or_default().push(dst);
            parent.insert(dst.node_id.as_str(), src.node_id.as_str());
        }
    }
    for list in children.values_mut() {
        list.sort_by_key(|n| n.order_index);
    }

    let keep: Option<HashSet<String>> = if filters.is_empty() {
        None
    } else {
        let matching = store.filtered_node_ids(doc_id, filters).await?;
        let mut keep = HashSet::new();
        for id in &matching {
            let mut cursor = Some(id.as_str());
            while let Some(current) = cursor {
                if !keep.insert(current.to_string()) {
                    break;
                }
                cursor = parent.get(current).copied();
            }
        }
        Some(keep)
    };

    let mut roots: Vec<&Node> = nodes
        .iter()
        .filter(|n| !parent.contains_key(n.node_id.as_str()))
        .collect();
    roots.sort_by_key(|n| n.order_index);

    let mut out = Vec::with_capacity(nodes.len());
    let mut stack: Vec<(&Node, usize)> = roots.into_iter().rev().map(|n| (n, 0)).collect();
    while let Some((node, depth)) = stack.pop() {
        if let Some(keep) = &keep {
            if !keep.contains(&node.node_id) {
                continue;
            }
        }
        out.push(OutlineEntry {
            node: node.clone(),
            depth,
        });
        if let Some(kids) = children.get(node.node_id.as_str()) {
            stack.extend(kids.iter().rev().map(|k| (*k, depth + 1)));
        }
    }
    Ok(out)
}

/// Indented text rendering, one node per line:
/// `  [short_id] kind: first line of content`.
pub fn render_outline(entries: &[OutlineEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        let first_line = entry.node.raw_content.lines().next().unwrap_or("");
        let _ = writeln!(
            out,
            "{}[{}] {}: {}",
            "  ".repeat(entry.depth),
            entry.node.short_id,
            entry.node.kind,
            preview(first_line, LABEL_CHARS)
        );
    }
    out
}
