//! Storage abstraction for docgraph.
//!
//! The store is split along the seams the engines actually need:
//!
//! | Trait | Used by |
//! |-------|---------|
//! | [`GraphStore`] | outline, query enrichment, CLI lookups |
//! | [`TextStore`] | [`search_fts`](crate::search::search_fts) |
//! | [`EmbeddingStore`] | [`search_semantic`](crate::semantic::search_semantic) |
//! | [`Store`] | everything that writes |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! Every write is all-or-nothing per document, and readers only ever see
//! the state before or after a write, never a mix.

pub mod memory;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::error::Result;
use crate::fts::FtsQuery;
use crate::models::{
    Document, Edge, Embedding, Filters, IngestReport, Node, ScoredNode, TagKind, TagTarget,
};
use crate::shred::ShreddedNode;

/// Lazy, finite sequence of embedding batches read from one snapshot.
///
/// Batches come in ascending node id order and never exceed the batch
/// size the stream was opened with. Dropping the stream releases the
/// snapshot. A stream cannot be resumed; open a new one instead.
#[async_trait]
pub trait EmbeddingStream: Send {
    /// Next batch, or `None` once the stream is exhausted.
    async fn next_batch(&mut self) -> Result<Option<Vec<Embedding>>>;
}

#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Dimensionality shared by the model's embeddings, `None` if the
    /// model has none.
    async fn embedding_dimensions(&self, model_id: &str) -> Result<Option<usize>>;

    /// Counter bumped by every write that changes the model's searchable
    /// embeddings. Vector indexes record the revision they were built at.
    async fn embedding_revision(&self, model_id: &str) -> Result<u64>;

    /// Stream the model's non-stale embeddings that pass `filters`.
    async fn stream_embeddings_for_model<'a>(
        &'a self,
        model_id: &str,
        batch_size: usize,
        filters: &Filters,
    ) -> Result<Box<dyn EmbeddingStream + 'a>>;

    /// Whether an accelerated index is attached for the model.
    async fn index_available(&self, model_id: &str) -> bool;

    /// Accelerated nearest-neighbour search.
    ///
    /// Returns [`GraphError::Unsupported`](crate::error::GraphError::Unsupported)
    /// whenever the index cannot give an exact answer for this request,
    /// so callers can fall back instead of trusting a wrong one.
    async fn vec_search(
        &self,
        model_id: &str,
        query: &[f32],
        k: usize,
        filters: &Filters,
    ) -> Result<Vec<ScoredNode>>;
}

#[async_trait]
pub trait TextStore: Send + Sync {
    /// Nodes matching `query`, best first, ties by node id ascending.
    async fn fts_search(
        &self,
        query: &FtsQuery,
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<ScoredNode>>;
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn get_node(&self, node_id: &str) -> Result<Node>;

    /// Fails with `InvalidArgument` when the short id is ambiguous.
    async fn get_node_by_short_id(&self, short_id: &str) -> Result<Node>;

    async fn get_document(&self, doc_id: &str) -> Result<Document>;

    async fn document_by_path(&self, source_path: &str) -> Result<Option<Document>>;

    async fn list_documents(&self) -> Result<Vec<Document>>;

    /// Nodes of a document in `order_index` order.
    async fn document_nodes(&self, doc_id: &str) -> Result<Vec<Node>>;

    /// Parent-child edges of the document plus resolved references
    /// leaving it, in insertion order.
    async fn document_edges(&self, doc_id: &str) -> Result<Vec<Edge>>;

    /// Resolved edges leaving a node.
    async fn edges_from(&self, node_id: &str) -> Result<Vec<Edge>>;

    /// Ids of the document's nodes admitted by `filters`.
    async fn filtered_node_ids(&self, doc_id: &str, filters: &Filters) -> Result<HashSet<String>>;
}

/// Full read-write store.
#[async_trait]
pub trait Store: GraphStore + TextStore + EmbeddingStore {
    /// Shred and store one document in a single transaction.
    async fn ingest(&self, source_path: &str, bytes: &[u8]) -> Result<IngestReport>;

    /// Delete a document with its nodes, edges, embeddings and tags.
    /// Returns `false` when no document is stored at the path.
    async fn remove_document(&self, source_path: &str) -> Result<bool>;

    /// Insert or replace the embedding for `(node_id, model_id)`.
    async fn upsert_embedding(&self, embedding: &Embedding) -> Result<()>;

    /// Nodes with no fresh embedding for the model, by node id.
    async fn pending_embeddings(&self, model_id: &str, limit: usize) -> Result<Vec<Node>>;

    async fn tag(&self, kind: TagKind, name: &str, target: &TagTarget) -> Result<()>;

    async fn untag(&self, kind: TagKind, name: &str, target: &TagTarget) -> Result<bool>;

    /// Retry every unresolved reference. Returns how many resolved.
    async fn resolve_references(&self) -> Result<usize>;
}

/// How a re-ingest affects the nodes already stored for a path.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NodeDiff {
    /// Stored ids absent from the new forest.
    pub vanished: Vec<String>,
    /// Ids present in both whose content hash changed.
    pub changed: Vec<String>,
}

/// Compare stored `node_id → content_hash` against a fresh forest.
pub fn diff_nodes(old: &HashMap<String, String>, new: &[ShreddedNode]) -> NodeDiff {
    let fresh: HashMap<&str, &str> = new
        .iter()
        .map(|n| (n.node.node_id.as_str(), n.node.content_hash.as_str()))
        .collect();

    let mut diff = NodeDiff::default();
    for (id, hash) in old {
        match fresh.get(id.as_str()) {
            None => diff.vanished.push(id.clone()),
            Some(h) if *h != hash.as_str() => diff.changed.push(id.clone()),
            Some(_) => {}
        }
    }
    diff.vanished.sort();
    diff.changed.sort();
    diff
}
