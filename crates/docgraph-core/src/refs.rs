//! Reference target interpretation.
//!
//! A raw link target is turned into an ordered list of [`Lookup`]s. A
//! store tries them in order and the first hit wins:
//!
//! 1. exact node id, then doc id (32 hex chars; a doc id resolves to its root)
//! 2. short id (8 hex chars, must be unique)
//! 3. source path, relative to the linking document first, optionally
//!    with a `#fragment` naming a heading slug
//! 4. a bare `#fragment` within the linking document

use crate::ids::{self, SHORT_ID_LEN};
use crate::models::{Node, NodeKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    NodeId(String),
    DocId(String),
    ShortId(String),
    Path {
        path: String,
        fragment: Option<String>,
    },
    /// Heading slug in the linking document.
    Fragment(String),
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Lookups for `target` as written in the document at `src_path`.
pub fn lookups(src_path: &str, target: &str) -> Vec<Lookup> {
    let target = target.trim();
    if target.is_empty() {
        return Vec::new();
    }

    if is_hex(target) {
        if target.len() == 32 {
            return vec![
                Lookup::NodeId(target.to_string()),
                Lookup::DocId(target.to_string()),
            ];
        }
        if target.len() == SHORT_ID_LEN {
            return vec![Lookup::ShortId(target.to_string())];
        }
    }

    let (path_part, fragment) = match target.split_once('#') {
        Some((p, f)) => (p, Some(ids::slugify(f)).filter(|f| !f.is_empty())),
        None => (target, None),
    };

    if path_part.is_empty() {
        return fragment.map(Lookup::Fragment).into_iter().collect();
    }

    let path_part = path_part.replace("%20", " ");
    let mut candidates = Vec::new();
    if let Some(joined) = join_relative(src_path, &path_part) {
        candidates.push(joined);
    }
    if let Some(bare) = normalize_segments(path_part.trim_start_matches('/')) {
        if !candidates.contains(&bare) {
            candidates.push(bare);
        }
    }
    candidates
        .into_iter()
        .map(|path| Lookup::Path {
            path,
            fragment: fragment.clone(),
        })
        .collect()
}

/// Resolve `link` against the directory of `src_path`.
fn join_relative(src_path: &str, link: &str) -> Option<String> {
    if link.starts_with('/') {
        return None;
    }
    let dir = match src_path.rfind('/') {
        Some(idx) => &src_path[..idx],
        None => "",
    };
    if dir.is_empty() {
        normalize_segments(link)
    } else {
        normalize_segments(&format!("{}/{}", dir, link))
    }
}

/// Collapse `.` and `..` segments. `None` if `..` climbs above the root.
fn normalize_segments(path: &str) -> Option<String> {
    let mut out: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop()?;
            }
            s => out.push(s),
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out.join("/"))
    }
}

/// First heading (in document order) whose slug equals `fragment`.
pub fn heading_for_fragment<'a>(nodes: &'a [Node], fragment: &str) -> Option<&'a Node> {
    let mut headings: Vec<&Node> = nodes
        .iter()
        .filter(|n| n.kind == NodeKind::Heading)
        .collect();
    headings.sort_by_key(|n| n.order_index);
    headings
        .into_iter()
        .find(|n| ids::slugify(&n.raw_content) == fragment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heading(id: &str, order: i64, raw: &str) -> Node {
        Node {
            node_id: id.into(),
            doc_id: "d".into(),
            kind: NodeKind::Heading,
            level: Some(2),
            order_index: order,
            raw_content: raw.into(),
            short_id: ids::short_id(id),
            content_hash: ids::content_hash(raw.as_bytes()),
        }
    }

    #[test]
    fn test_hex_targets() {
        let full = "0123456789abcdef0123456789abcdef";
        assert_eq!(
            lookups("a.md", full),
            vec![Lookup::NodeId(full.into()), Lookup::DocId(full.into())]
        );
        assert_eq!(
            lookups("a.md", "0123abcd"),
            vec![Lookup::ShortId("0123abcd".into())]
        );
    }

    #[test]
    fn test_relative_paths_and_fragments() {
        assert_eq!(
            lookups("notes/a.md", "b.md#Getting Started"),
            vec![
                Lookup::Path {
                    path: "notes/b.md".into(),
                    fragment: Some("getting-started".into())
                },
                Lookup::Path {
                    path: "b.md".into(),
                    fragment: Some("getting-started".into())
                },
            ]
        );
        assert_eq!(
            lookups("notes/deep/a.md", "../b.md"),
            vec![
                Lookup::Path {
                    path: "notes/b.md".into(),
                    fragment: None
                },
            ]
        );
        assert_eq!(
            lookups("a.md", "#setup"),
            vec![Lookup::Fragment("setup".into())]
        );
        assert!(lookups("a.md", "#").is_empty());
    }

    #[test]
    fn test_heading_for_fragment_takes_first_in_order() {
        let nodes = vec![
            heading("h2", 5, "## Setup"),
            heading("h1", 2, "# Setup"),
            heading("h3", 7, "## Other"),
        ];
        assert_eq!(heading_for_fragment(&nodes, "setup").unwrap().node_id, "h1");
        assert!(heading_for_fragment(&nodes, "missing").is_none());
    }
}
