//! `dg tag`: attach or detach collection and topic tags.
//!
//! Document tags are keyed by source path, so they survive re-ingestion
//! of changed content. Node tags disappear with their node.

use anyhow::{bail, Result};

use docgraph_core::models::{TagKind, TagTarget};
use docgraph_core::store::Store;

use crate::config::Config;
use crate::get::{lookup_document, lookup_node};
use crate::sqlite_store::SqliteStore;

/// What the command line pointed at.
#[derive(Debug, Clone)]
pub enum TagSubject {
    /// Doc id or source path.
    Document(String),
    /// Node id or short id.
    Node(String),
}

/// Resolve a subject to a store-level target.
pub async fn resolve_subject<S: Store + ?Sized>(store: &S, subject: &TagSubject) -> Result<TagTarget> {
    Ok(match subject {
        TagSubject::Document(key) => TagTarget::Document(lookup_document(store, key).await?.doc_id),
        TagSubject::Node(id) => TagTarget::Node(lookup_node(store, id).await?.node_id),
    })
}

pub async fn run_tag(
    config: &Config,
    kind: TagKind,
    name: &str,
    subject: &TagSubject,
    remove: bool,
) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let result = apply(&store, kind, name, subject, remove).await;
    store.close().await;
    let changed = result?;

    let verb = if remove { "untagged" } else { "tagged" };
    if remove && !changed {
        bail!("{} tag '{}' was not set", kind.as_str(), name);
    }
    println!("{} {} '{}'", verb, kind.as_str(), name);
    Ok(())
}

async fn apply<S: Store + ?Sized>(
    store: &S,
    kind: TagKind,
    name: &str,
    subject: &TagSubject,
    remove: bool,
) -> Result<bool> {
    let target = resolve_subject(store, subject).await?;
    if remove {
        Ok(store.untag(kind, name, &target).await?)
    } else {
        store.tag(kind, name, &target).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docgraph_core::models::Filters;
    use docgraph_core::search::search_fts;
    use docgraph_core::store::memory::InMemoryStore;

    #[tokio::test]
    async fn test_tag_by_path_filters_search() {
        let store = InMemoryStore::new();
        store.ingest("ops/run.md", b"# Run\n\nneedle here\n").await.unwrap();
        store.ingest("dev/build.md", b"# Build\n\nneedle there\n").await.unwrap();

        let subject = TagSubject::Document("ops/run.md".into());
        assert!(apply(&store, TagKind::Collection, "ops", &subject, false).await.unwrap());

        let filters = Filters {
            collection: Some("ops".into()),
            ..Default::default()
        };
        let hits = search_fts(&store, "needle", 10, &filters).await.unwrap();
        assert_eq!(hits.len(), 1);

        assert!(apply(&store, TagKind::Collection, "ops", &subject, true).await.unwrap());
        assert!(!apply(&store, TagKind::Collection, "ops", &subject, true).await.unwrap());
    }
}
