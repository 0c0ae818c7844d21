//! Deterministic identifiers for documents and nodes.
//!
//! Every id is a truncated SHA-256 hex digest over a domain-separated
//! input, so identical input always yields the identical id and no id
//! depends on ingestion order or wall-clock time.
//!
//! Nodes are scoped by the document's *anchor* (a digest of its
//! normalised path) rather than by the versioned `doc_id`. Editing one
//! section of a document therefore leaves the ids of untouched sections,
//! and the embeddings keyed on them, in place.

use sha2::{Digest, Sha256};

use crate::error::{GraphError, Result};

/// Hex characters kept from the digest for document and node ids.
const ID_HEX_LEN: usize = 32;

/// Hex characters in a node's short alias.
pub const SHORT_ID_LEN: usize = 8;

/// SHA-256 hex digest of arbitrary bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Validate and normalise a source path.
///
/// Backslashes become forward slashes and a leading `./` is dropped.
/// Empty paths and paths containing NUL are rejected.
pub fn normalize_path(path: &str) -> Result<String> {
    if path.trim().is_empty() {
        return Err(GraphError::Input {
            path: path.to_string(),
            reason: "source path is empty".to_string(),
        });
    }
    if path.contains('\0') {
        return Err(GraphError::Input {
            path: path.escape_default().to_string(),
            reason: "source path contains a NUL byte".to_string(),
        });
    }

    let mut normalized = path.trim().replace('\\', "/");
    while let Some(rest) = normalized.strip_prefix("./") {
        normalized = rest.to_string();
    }
    if normalized.is_empty() || normalized.ends_with('/') {
        return Err(GraphError::Input {
            path: path.to_string(),
            reason: "source path does not name a file".to_string(),
        });
    }
    Ok(normalized)
}

/// Content-addressed document id over `(path, content)`.
pub fn doc_id(path: &str, content: &[u8]) -> Result<String> {
    let path = normalize_path(path)?;
    Ok(digest(&["doc", &path, &content_hash(content)]))
}

/// Stable anchor for all nodes of the document at `path`.
pub fn doc_anchor(path: &str) -> Result<String> {
    let path = normalize_path(path)?;
    Ok(digest(&["anchor", &path]))
}

/// Node id from a document anchor and a structural path such as
/// `heading:install#0/paragraph#1`.
pub fn node_id(anchor: &str, structural_path: &str) -> String {
    digest(&["node", anchor, structural_path])
}

/// Short human-scannable alias for a node id.
pub fn short_id(node_id: &str) -> String {
    node_id.chars().take(SHORT_ID_LEN).collect()
}

/// Lowercase, dash-separated slug used in structural paths and
/// `#fragment` links.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(ch.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let hex = format!("{:x}", hasher.finalize());
    hex[..ID_HEX_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_id_deterministic() {
        let a = doc_id("notes/a.md", b"# Title").unwrap();
        let b = doc_id("notes/a.md", b"# Title").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), ID_HEX_LEN);
    }

    #[test]
    fn test_doc_id_depends_on_path_and_content() {
        let base = doc_id("notes/a.md", b"x").unwrap();
        assert_ne!(base, doc_id("notes/b.md", b"x").unwrap());
        assert_ne!(base, doc_id("notes/a.md", b"y").unwrap());
    }

    #[test]
    fn test_path_normalization_is_applied() {
        assert_eq!(
            doc_id("./notes\\a.md", b"x").unwrap(),
            doc_id("notes/a.md", b"x").unwrap()
        );
        assert_eq!(normalize_path("././a.md").unwrap(), "a.md");
    }

    #[test]
    fn test_bad_paths_rejected() {
        for bad in ["", "   ", "a\0b.md", "./", "docs/"] {
            let err = doc_id(bad, b"x").unwrap_err();
            assert!(matches!(err, GraphError::Input { .. }), "{:?}", bad);
        }
    }

    #[test]
    fn test_node_id_scoped_by_anchor() {
        let anchor = doc_anchor("a.md").unwrap();
        let other = doc_anchor("b.md").unwrap();
        assert_eq!(node_id(&anchor, "root"), node_id(&anchor, "root"));
        assert_ne!(node_id(&anchor, "root"), node_id(&other, "root"));
        assert_ne!(
            node_id(&anchor, "paragraph#0"),
            node_id(&anchor, "paragraph#1")
        );
    }

    #[test]
    fn test_short_id_is_prefix() {
        let id = node_id("anchor", "root");
        let short = short_id(&id);
        assert_eq!(short.len(), SHORT_ID_LEN);
        assert!(id.starts_with(&short));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Getting Started!"), "getting-started");
        assert_eq!(slugify("  API: v2 / Auth "), "api-v2-auth");
        assert_eq!(slugify("Über Größe"), "über-größe");
        assert_eq!(slugify("***"), "");
    }
}
