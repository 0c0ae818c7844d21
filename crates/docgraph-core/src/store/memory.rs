//! In-memory [`Store`] implementation for tests and embedding in other
//! tools.
//!
//! All state lives in one immutable [`State`] snapshot behind
//! `RwLock<Arc<_>>`. A write clones the current snapshot, applies the
//! whole change to the clone and swaps it in, so a failed write leaves
//! nothing behind and readers (including open embedding streams, which
//! hold their own `Arc`) only ever see complete states.
//!
//! Full-text search scores by term frequency over [`tokenize`]d content.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::embedding::validate_vector;
use crate::error::{GraphError, Result};
use crate::fts::{tokenize, FtsQuery};
use crate::models::{
    Document, Edge, EdgeType, Embedding, Filters, IngestOutcome, IngestReport, Node, NodeKind,
    ScoredNode, TagKind, TagTarget,
};
use crate::refs::{self, Lookup};
use crate::shred::{shred, ShreddedDocument};
use crate::vector_index::VectorIndex;

use super::{diff_nodes, EmbeddingStore, EmbeddingStream, GraphStore, Store, TextStore};

#[derive(Clone)]
struct NodeRow {
    node: Node,
    source_path: String,
    tokens: Vec<String>,
}

#[derive(Clone)]
struct EdgeRow {
    edge_type: EdgeType,
    src: String,
    dst: Option<String>,
    /// Raw link text for references.
    target: Option<String>,
}

#[derive(Clone)]
struct EmbeddingRow {
    vector: Vec<f32>,
    content_hash: String,
    stale: bool,
}

/// `(kind, name, target kind, target id)`; document targets are paths.
type TagRow = (&'static str, String, &'static str, String);

#[derive(Clone, Default)]
struct State {
    /// Keyed by source path.
    documents: BTreeMap<String, Document>,
    nodes: BTreeMap<String, NodeRow>,
    edges: Vec<EdgeRow>,
    /// Keyed by `(model_id, node_id)`, which gives node id order per model.
    embeddings: BTreeMap<(String, String), EmbeddingRow>,
    revisions: HashMap<String, u64>,
    tags: BTreeSet<TagRow>,
}

/// In-memory store for tests and embedders.
pub struct InMemoryStore {
    state: RwLock<Arc<State>>,
    indexes: RwLock<HashMap<String, Arc<dyn VectorIndex>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(State::default())),
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a vector index for its model, replacing any previous one.
    pub fn attach_index(&self, index: Arc<dyn VectorIndex>) {
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        indexes.insert(index.model_id().to_string(), index);
    }

    pub fn detach_index(&self, model_id: &str) -> bool {
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        indexes.remove(model_id).is_some()
    }

    fn snapshot(&self) -> Arc<State> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn index_for(&self, model_id: &str) -> Option<Arc<dyn VectorIndex>> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        indexes.get(model_id).cloned()
    }

    /// Apply `f` to a private copy of the state and publish it on success.
    fn write<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = State::clone(&guard);
        let out = f(&mut next)?;
        *guard = Arc::new(next);
        Ok(out)
    }

    fn ingest_shredded(&self, shredded: ShreddedDocument) -> Result<IngestReport> {
        let path = shredded.document.source_path.clone();
        {
            let current = self.snapshot();
            if let Some(existing) = current.documents.get(&path) {
                if existing.content_hash == shredded.document.content_hash {
                    debug!(path = %path, "unchanged, skipping");
                    return Ok(IngestReport::unchanged(&existing.doc_id, &path));
                }
            }
        }
        self.write(|state| Ok(state.apply_ingest(shredded)))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn doc_by_id(&self, doc_id: &str) -> Option<&Document> {
        self.documents.values().find(|d| d.doc_id == doc_id)
    }

    fn nodes_of(&self, doc_id: &str) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .values()
            .filter(|r| r.node.doc_id == doc_id)
            .map(|r| r.node.clone())
            .collect();
        nodes.sort_by_key(|n| n.order_index);
        nodes
    }

    fn root_of(&self, doc_id: &str) -> Option<String> {
        self.nodes
            .values()
            .find(|r| r.node.doc_id == doc_id && r.node.kind == NodeKind::Root)
            .map(|r| r.node.node_id.clone())
    }

    fn tagged(&self, kind: TagKind, name: &str, row: &NodeRow) -> bool {
        let doc_tag = (kind.as_str(), name.to_string(), "document", row.source_path.clone());
        let node_tag = (kind.as_str(), name.to_string(), "node", row.node.node_id.clone());
        self.tags.contains(&doc_tag) || self.tags.contains(&node_tag)
    }

    fn admits(&self, row: &NodeRow, filters: &Filters) -> bool {
        filters.admits_path(&row.source_path)
            && filters
                .collection
                .as_deref()
                .map_or(true, |c| self.tagged(TagKind::Collection, c, row))
            && filters
                .topic
                .as_deref()
                .map_or(true, |t| self.tagged(TagKind::Topic, t, row))
    }

    fn bump(&mut self, model_id: &str) {
        *self.revisions.entry(model_id.to_string()).or_insert(0) += 1;
    }

    fn lookup(&self, lookup: &Lookup, src_path: &str) -> Option<String> {
        match lookup {
            Lookup::NodeId(id) => self.nodes.contains_key(id).then(|| id.clone()),
            Lookup::DocId(id) => self.doc_by_id(id).and_then(|d| self.root_of(&d.doc_id)),
            Lookup::ShortId(short) => {
                let mut hits = self.nodes.values().filter(|r| &r.node.short_id == short);
                match (hits.next(), hits.next()) {
                    (Some(only), None) => Some(only.node.node_id.clone()),
                    _ => None,
                }
            }
            Lookup::Path { path, fragment } => {
                let doc = self.documents.get(path)?;
                match fragment {
                    Some(f) => refs::heading_for_fragment(&self.nodes_of(&doc.doc_id), f)
                        .map(|n| n.node_id.clone()),
                    None => self.root_of(&doc.doc_id),
                }
            }
            Lookup::Fragment(f) => {
                let doc = self.documents.get(src_path)?;
                refs::heading_for_fragment(&self.nodes_of(&doc.doc_id), f).map(|n| n.node_id.clone())
            }
        }
    }

    fn resolve_target(&self, src_path: &str, target: &str) -> Option<String> {
        refs::lookups(src_path, target)
            .iter()
            .find_map(|l| self.lookup(l, src_path))
    }

    /// Retry unresolved references. Returns how many resolved.
    fn resolve_pending(&mut self) -> usize {
        let updates: Vec<(usize, String)> = self
            .edges
            .iter()
            .enumerate()
            .filter(|(_, e)| e.edge_type == EdgeType::Reference && e.dst.is_none())
            .filter_map(|(i, e)| {
                let src_path = &self.nodes.get(&e.src)?.source_path;
                let target = e.target.as_deref()?;
                self.resolve_target(src_path, target).map(|dst| (i, dst))
            })
            .collect();
        let count = updates.len();
        for (i, dst) in updates {
            self.edges[i].dst = Some(dst);
        }
        count
    }

    /// Remove nodes with everything hanging off them. Returns the number
    /// of embeddings deleted and the models they belonged to.
    fn drop_nodes(&mut self, ids: &HashSet<String>) -> (usize, BTreeSet<String>) {
        self.edges.retain(|e| !ids.contains(&e.src));
        for e in self.edges.iter_mut() {
            if e.edge_type == EdgeType::Reference && e.dst.as_ref().is_some_and(|d| ids.contains(d)) {
                e.dst = None;
            }
        }
        for id in ids {
            self.nodes.remove(id);
        }
        self.tags.retain(|t| !(t.2 == "node" && ids.contains(&t.3)));

        let mut removed = 0;
        let mut touched = BTreeSet::new();
        self.embeddings.retain(|(model, node), _| {
            if ids.contains(node) {
                removed += 1;
                touched.insert(model.clone());
                false
            } else {
                true
            }
        });
        (removed, touched)
    }

    fn apply_ingest(&mut self, shredded: ShreddedDocument) -> IngestReport {
        let doc = shredded.document.clone();
        let path = doc.source_path.clone();
        let previous = self.documents.get(&path).cloned();
        let outcome = if previous.is_some() {
            IngestOutcome::Replaced
        } else {
            IngestOutcome::Created
        };

        let old: HashMap<String, String> = previous
            .as_ref()
            .map(|d| {
                self.nodes_of(&d.doc_id)
                    .into_iter()
                    .map(|n| (n.node_id, n.content_hash))
                    .collect()
            })
            .unwrap_or_default();
        let diff = diff_nodes(&old, &shredded.nodes);

        // Outgoing edges of every old node go; rows for surviving ids are
        // rewritten below. Only vanished ids lose tags and embeddings.
        let vanished: HashSet<String> = diff.vanished.iter().cloned().collect();
        let (embeddings_removed, mut touched) = self.drop_nodes(&vanished);
        let survivors: HashSet<&String> = old.keys().filter(|id| !vanished.contains(*id)).collect();
        self.edges.retain(|e| !survivors.contains(&e.src));

        self.documents.insert(path.clone(), doc.clone());
        for n in &shredded.nodes {
            self.nodes.insert(
                n.node.node_id.clone(),
                NodeRow {
                    node: n.node.clone(),
                    source_path: path.clone(),
                    tokens: tokenize(&n.node.raw_content),
                },
            );
        }

        let hashes: HashMap<&str, &str> = shredded
            .nodes
            .iter()
            .map(|n| (n.node.node_id.as_str(), n.node.content_hash.as_str()))
            .collect();
        let mut embeddings_stale = 0;
        for ((model, node_id), row) in self.embeddings.iter_mut() {
            if let Some(hash) = hashes.get(node_id.as_str()) {
                let stale = row.content_hash != *hash;
                if stale != row.stale {
                    row.stale = stale;
                    touched.insert(model.clone());
                    if stale {
                        embeddings_stale += 1;
                    }
                }
            }
        }

        let parent_edges = shredded.parent_child_edges();
        let edges = parent_edges.len();
        for e in parent_edges {
            self.edges.push(EdgeRow {
                edge_type: EdgeType::ParentChild,
                src: e.src_node_id,
                dst: Some(e.dst_node_id),
                target: None,
            });
        }

        let mut seen = HashSet::new();
        let (mut resolved, mut unresolved) = (0, 0);
        for r in &shredded.references {
            let src = shredded.nodes[r.src].node.node_id.clone();
            if !seen.insert((src.clone(), r.target.clone())) {
                continue;
            }
            let dst = self.resolve_target(&path, &r.target);
            if dst.is_some() {
                resolved += 1;
            } else {
                unresolved += 1;
            }
            self.edges.push(EdgeRow {
                edge_type: EdgeType::Reference,
                src,
                dst,
                target: Some(r.target.clone()),
            });
        }
        self.resolve_pending();

        for model in &touched {
            self.bump(model);
        }

        info!(
            path = %path,
            doc_id = %doc.doc_id,
            nodes = shredded.nodes.len(),
            stale = embeddings_stale,
            removed = embeddings_removed,
            "ingested document"
        );

        IngestReport {
            doc_id: doc.doc_id,
            source_path: path,
            outcome,
            nodes: shredded.nodes.len(),
            edges: edges + resolved,
            references_resolved: resolved,
            references_unresolved: unresolved,
            embeddings_stale,
            embeddings_removed,
        }
    }

    fn tag_row(&self, kind: TagKind, name: &str, target: &TagTarget) -> Result<TagRow> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GraphError::InvalidArgument("tag name is empty".into()));
        }
        match target {
            TagTarget::Document(doc_id) => {
                let doc = self
                    .doc_by_id(doc_id)
                    .ok_or_else(|| GraphError::not_found("document", doc_id.as_str()))?;
                Ok((kind.as_str(), name.to_string(), "document", doc.source_path.clone()))
            }
            TagTarget::Node(node_id) => {
                if !self.nodes.contains_key(node_id) {
                    return Err(GraphError::not_found("node", node_id.as_str()));
                }
                Ok((kind.as_str(), name.to_string(), "node", node_id.clone()))
            }
        }
    }
}

struct MemoryEmbeddingStream {
    state: Arc<State>,
    model_id: String,
    filters: Filters,
    batch_size: usize,
    cursor: Option<String>,
}

#[async_trait]
impl EmbeddingStream for MemoryEmbeddingStream {
    async fn next_batch(&mut self) -> Result<Option<Vec<Embedding>>> {
        let state = Arc::clone(&self.state);
        let start = match &self.cursor {
            Some(last) => Bound::Excluded((self.model_id.clone(), last.clone())),
            None => Bound::Included((self.model_id.clone(), String::new())),
        };

        let mut batch = Vec::new();
        let mut last = None;
        for ((model, node_id), row) in state.embeddings.range((start, Bound::Unbounded)) {
            if model != &self.model_id || batch.len() >= self.batch_size {
                break;
            }
            last = Some(node_id.clone());
            if row.stale {
                continue;
            }
            let admitted = state
                .nodes
                .get(node_id)
                .is_some_and(|n| state.admits(n, &self.filters));
            if admitted {
                batch.push(Embedding {
                    node_id: node_id.clone(),
                    model_id: model.clone(),
                    vector: row.vector.clone(),
                });
            }
        }

        if last.is_some() {
            self.cursor = last;
        }
        Ok(if batch.is_empty() { None } else { Some(batch) })
    }
}

#[async_trait]
impl EmbeddingStore for InMemoryStore {
    async fn embedding_dimensions(&self, model_id: &str) -> Result<Option<usize>> {
        let state = self.snapshot();
        let dims = state
            .embeddings
            .range((model_id.to_string(), String::new())..)
            .next()
            .filter(|((model, _), _)| model == model_id)
            .map(|(_, row)| row.vector.len());
        Ok(dims)
    }

    async fn embedding_revision(&self, model_id: &str) -> Result<u64> {
        Ok(self.snapshot().revisions.get(model_id).copied().unwrap_or(0))
    }

    async fn stream_embeddings_for_model<'a>(
        &'a self,
        model_id: &str,
        batch_size: usize,
        filters: &Filters,
    ) -> Result<Box<dyn EmbeddingStream + 'a>> {
        if batch_size == 0 {
            return Err(GraphError::InvalidArgument(
                "batch_size must be positive".into(),
            ));
        }
        Ok(Box::new(MemoryEmbeddingStream {
            state: self.snapshot(),
            model_id: model_id.to_string(),
            filters: filters.clone(),
            batch_size,
            cursor: None,
        }))
    }

    async fn index_available(&self, model_id: &str) -> bool {
        self.index_for(model_id).is_some()
    }

    async fn vec_search(
        &self,
        model_id: &str,
        query: &[f32],
        k: usize,
        filters: &Filters,
    ) -> Result<Vec<ScoredNode>> {
        let index = self.index_for(model_id).ok_or_else(|| {
            GraphError::Unsupported(format!("no vector index attached for model '{}'", model_id))
        })?;
        if !filters.is_empty() {
            return Err(GraphError::Unsupported(
                "vector index cannot apply filters".into(),
            ));
        }
        let current = self.embedding_revision(model_id).await?;
        if index.revision() != current {
            return Err(GraphError::Unsupported(format!(
                "vector index for '{}' built at revision {}, store is at {}",
                model_id,
                index.revision(),
                current
            )));
        }
        index.search(query, k)
    }
}

#[async_trait]
impl TextStore for InMemoryStore {
    async fn fts_search(
        &self,
        query: &FtsQuery,
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<ScoredNode>> {
        let state = self.snapshot();
        let mut hits: Vec<ScoredNode> = state
            .nodes
            .values()
            .filter(|row| state.admits(row, filters))
            .filter_map(|row| {
                query.score(&row.tokens).map(|score| ScoredNode {
                    node_id: row.node.node_id.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

#[async_trait]
impl GraphStore for InMemoryStore {
    async fn get_node(&self, node_id: &str) -> Result<Node> {
        self.snapshot()
            .nodes
            .get(node_id)
            .map(|r| r.node.clone())
            .ok_or_else(|| GraphError::not_found("node", node_id))
    }

    async fn get_node_by_short_id(&self, short_id: &str) -> Result<Node> {
        let state = self.snapshot();
        let hits: Vec<&NodeRow> = state
            .nodes
            .values()
            .filter(|r| r.node.short_id == short_id)
            .collect();
        match hits.as_slice() {
            [] => Err(GraphError::not_found("node", short_id)),
            [only] => Ok(only.node.clone()),
            many => Err(GraphError::InvalidArgument(format!(
                "short id '{}' is ambiguous ({} nodes)",
                short_id,
                many.len()
            ))),
        }
    }

    async fn get_document(&self, doc_id: &str) -> Result<Document> {
        self.snapshot()
            .doc_by_id(doc_id)
            .cloned()
            .ok_or_else(|| GraphError::not_found("document", doc_id))
    }

    async fn document_by_path(&self, source_path: &str) -> Result<Option<Document>> {
        let path = crate::ids::normalize_path(source_path)?;
        Ok(self.snapshot().documents.get(&path).cloned())
    }

    async fn list_documents(&self) -> Result<Vec<Document>> {
        Ok(self.snapshot().documents.values().cloned().collect())
    }

    async fn document_nodes(&self, doc_id: &str) -> Result<Vec<Node>> {
        Ok(self.snapshot().nodes_of(doc_id))
    }

    async fn document_edges(&self, doc_id: &str) -> Result<Vec<Edge>> {
        let state = self.snapshot();
        Ok(state
            .edges
            .iter()
            .filter(|e| {
                state
                    .nodes
                    .get(&e.src)
                    .is_some_and(|r| r.node.doc_id == doc_id)
            })
            .filter_map(to_edge)
            .collect())
    }

    async fn edges_from(&self, node_id: &str) -> Result<Vec<Edge>> {
        let state = self.snapshot();
        Ok(state
            .edges
            .iter()
            .filter(|e| e.src == node_id)
            .filter_map(to_edge)
            .collect())
    }

    async fn filtered_node_ids(&self, doc_id: &str, filters: &Filters) -> Result<HashSet<String>> {
        let state = self.snapshot();
        Ok(state
            .nodes
            .values()
            .filter(|r| r.node.doc_id == doc_id && state.admits(r, filters))
            .map(|r| r.node.node_id.clone())
            .collect())
    }
}

fn to_edge(row: &EdgeRow) -> Option<Edge> {
    row.dst.as_ref().map(|dst| Edge {
        edge_type: row.edge_type,
        src_node_id: row.src.clone(),
        dst_node_id: dst.clone(),
    })
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ingest(&self, source_path: &str, bytes: &[u8]) -> Result<IngestReport> {
        let shredded = shred(source_path, bytes)?;
        self.ingest_shredded(shredded)
    }

    async fn remove_document(&self, source_path: &str) -> Result<bool> {
        let path = crate::ids::normalize_path(source_path)?;
        self.write(|state| {
            let Some(doc) = state.documents.remove(&path) else {
                return Ok(false);
            };
            let ids: HashSet<String> = state
                .nodes
                .values()
                .filter(|r| r.node.doc_id == doc.doc_id)
                .map(|r| r.node.node_id.clone())
                .collect();
            let (_, touched) = state.drop_nodes(&ids);
            state.tags.retain(|t| !(t.2 == "document" && t.3 == path));
            for model in &touched {
                state.bump(model);
            }
            info!(path = %path, nodes = ids.len(), "removed document");
            Ok(true)
        })
    }

    async fn upsert_embedding(&self, embedding: &Embedding) -> Result<()> {
        validate_vector(&embedding.model_id, &embedding.vector)?;
        self.write(|state| {
            let node = state
                .nodes
                .get(&embedding.node_id)
                .ok_or_else(|| GraphError::not_found("node", embedding.node_id.as_str()))?;
            let content_hash = node.node.content_hash.clone();

            let existing = state
                .embeddings
                .range((embedding.model_id.clone(), String::new())..)
                .next()
                .filter(|((model, _), _)| model == &embedding.model_id)
                .map(|(_, row)| row.vector.len());
            if let Some(expected) = existing {
                if expected != embedding.vector.len() {
                    return Err(GraphError::DimensionMismatch {
                        model_id: embedding.model_id.clone(),
                        expected,
                        actual: embedding.vector.len(),
                    });
                }
            }

            state.embeddings.insert(
                (embedding.model_id.clone(), embedding.node_id.clone()),
                EmbeddingRow {
                    vector: embedding.vector.clone(),
                    content_hash,
                    stale: false,
                },
            );
            state.bump(&embedding.model_id);
            Ok(())
        })
    }

    async fn pending_embeddings(&self, model_id: &str, limit: usize) -> Result<Vec<Node>> {
        let state = self.snapshot();
        Ok(state
            .nodes
            .values()
            .filter(|r| {
                state
                    .embeddings
                    .get(&(model_id.to_string(), r.node.node_id.clone()))
                    .map_or(true, |e| e.stale)
            })
            .take(limit)
            .map(|r| r.node.clone())
            .collect())
    }

    async fn tag(&self, kind: TagKind, name: &str, target: &TagTarget) -> Result<()> {
        self.write(|state| {
            let row = state.tag_row(kind, name, target)?;
            state.tags.insert(row);
            Ok(())
        })
    }

    async fn untag(&self, kind: TagKind, name: &str, target: &TagTarget) -> Result<bool> {
        self.write(|state| {
            let row = state.tag_row(kind, name, target)?;
            Ok(state.tags.remove(&row))
        })
    }

    async fn resolve_references(&self) -> Result<usize> {
        self.write(|state| Ok(state.resolve_pending()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ingest(store: &InMemoryStore, path: &str, text: &str) -> IngestReport {
        store.ingest(path, text.as_bytes()).await.unwrap()
    }

    async fn node_with(store: &InMemoryStore, path: &str, needle: &str) -> Node {
        let doc = store.document_by_path(path).await.unwrap().unwrap();
        store
            .document_nodes(&doc.doc_id)
            .await
            .unwrap()
            .into_iter()
            .find(|n| n.kind != NodeKind::Root && n.raw_content.contains(needle))
            .unwrap()
    }

    fn emb(node_id: &str, vector: Vec<f32>) -> Embedding {
        Embedding {
            node_id: node_id.into(),
            model_id: "m".into(),
            vector,
        }
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent() {
        let store = InMemoryStore::new();
        let first = ingest(&store, "a.md", "# A\n\nalpha\n").await;
        assert_eq!(first.outcome, IngestOutcome::Created);
        let second = ingest(&store, "a.md", "# A\n\nalpha\n").await;
        assert_eq!(second.outcome, IngestOutcome::Unchanged);
        assert_eq!(second.doc_id, first.doc_id);
        assert_eq!(store.document_nodes(&first.doc_id).await.unwrap().len(), 3);

        let q = FtsQuery::parse("alpha").unwrap();
        let hits = store.fts_search(&q, 10, &Filters::default()).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_reingest_marks_changed_stale_and_drops_vanished() {
        let store = InMemoryStore::new();
        ingest(&store, "a.md", "# A\n\nkeep\n\nchange\n\ngone\n").await;
        let keep = node_with(&store, "a.md", "keep").await;
        let change = node_with(&store, "a.md", "change").await;
        let gone = node_with(&store, "a.md", "gone").await;
        for n in [&keep, &change, &gone] {
            store.upsert_embedding(&emb(&n.node_id, vec![1.0, 0.0])).await.unwrap();
        }
        let rev_before = store.embedding_revision("m").await.unwrap();

        let report = ingest(&store, "a.md", "# A\n\nkeep\n\nchanged!\n").await;
        assert_eq!(report.outcome, IngestOutcome::Replaced);
        assert_eq!(report.embeddings_stale, 1);
        assert_eq!(report.embeddings_removed, 1);
        assert!(store.embedding_revision("m").await.unwrap() > rev_before);

        let pending = store.pending_embeddings("m", 100).await.unwrap();
        assert!(pending.iter().any(|n| n.node_id == change.node_id));
        assert!(!pending.iter().any(|n| n.node_id == keep.node_id));

        let mut stream = store
            .stream_embeddings_for_model("m", 10, &Filters::default())
            .await
            .unwrap();
        let batch = stream.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].node_id, keep.node_id);
        assert!(stream.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_is_a_snapshot() {
        let store = InMemoryStore::new();
        ingest(&store, "a.md", "one\n\ntwo\n\nthree\n").await;
        for needle in ["one", "two", "three"] {
            let n = node_with(&store, "a.md", needle).await;
            store.upsert_embedding(&emb(&n.node_id, vec![1.0])).await.unwrap();
        }
        let mut stream = store
            .stream_embeddings_for_model("m", 1, &Filters::default())
            .await
            .unwrap();
        let first = stream.next_batch().await.unwrap().unwrap();
        store.remove_document("a.md").await.unwrap();

        let mut seen = first.len();
        let mut last = first[0].node_id.clone();
        while let Some(batch) = stream.next_batch().await.unwrap() {
            assert!(batch.len() <= 1);
            assert!(batch[0].node_id > last);
            last = batch[0].node_id.clone();
            seen += batch.len();
        }
        assert_eq!(seen, 3);
        assert_eq!(store.embedding_dimensions("m").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_upsert_validation() {
        let store = InMemoryStore::new();
        ingest(&store, "a.md", "text\n").await;
        let n = node_with(&store, "a.md", "text").await;

        assert!(matches!(
            store.upsert_embedding(&emb("nope", vec![1.0])).await,
            Err(GraphError::NotFound { .. })
        ));
        store.upsert_embedding(&emb(&n.node_id, vec![1.0, 2.0])).await.unwrap();
        assert!(matches!(
            store.upsert_embedding(&emb(&n.node_id, vec![1.0])).await,
            Err(GraphError::DimensionMismatch { expected: 2, actual: 1, .. })
        ));
        assert_eq!(store.embedding_dimensions("m").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_references_resolve_late_and_unresolve_on_removal() {
        let store = InMemoryStore::new();
        let a = ingest(&store, "notes/a.md", "# A\n\nsee [b](b.md#setup)\n").await;
        assert_eq!(a.references_unresolved, 1);
        let src = node_with(&store, "notes/a.md", "see [b]").await;
        assert!(store.edges_from(&src.node_id).await.unwrap().is_empty());

        ingest(&store, "notes/b.md", "# B\n\n## Setup\n\nsteps\n").await;
        let setup = node_with(&store, "notes/b.md", "## Setup").await;
        let edges = store.edges_from(&src.node_id).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].edge_type, EdgeType::Reference);
        assert_eq!(edges[0].dst_node_id, setup.node_id);

        store.remove_document("notes/b.md").await.unwrap();
        assert!(store.edges_from(&src.node_id).await.unwrap().is_empty());
        assert_eq!(store.resolve_references().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tag_filters() {
        let store = InMemoryStore::new();
        let a = ingest(&store, "docs/a.md", "shared word\n").await;
        ingest(&store, "notes/b.md", "shared word\n").await;
        store
            .tag(TagKind::Collection, "guide", &TagTarget::Document(a.doc_id.clone()))
            .await
            .unwrap();

        let q = FtsQuery::parse("shared").unwrap();
        let all = store.fts_search(&q, 10, &Filters::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let by_collection = Filters {
            collection: Some("guide".into()),
            ..Default::default()
        };
        assert_eq!(store.fts_search(&q, 10, &by_collection).await.unwrap().len(), 1);

        let by_scope = Filters {
            scope_path_prefix: Some("notes/".into()),
            ..Default::default()
        };
        assert_eq!(store.fts_search(&q, 10, &by_scope).await.unwrap().len(), 1);

        assert!(store
            .untag(TagKind::Collection, "guide", &TagTarget::Document(a.doc_id.clone()))
            .await
            .unwrap());
        assert!(store.fts_search(&q, 10, &by_collection).await.unwrap().is_empty());
        assert!(matches!(
            store.tag(TagKind::Topic, "x", &TagTarget::Node("missing".into())).await,
            Err(GraphError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_ingest_leaves_store_untouched() {
        let store = InMemoryStore::new();
        ingest(&store, "a.md", "# A\n\nalpha\n").await;
        let before = store.list_documents().await.unwrap();
        assert!(store.ingest("a.md", &[0xff, 0xfe]).await.is_err());
        assert_eq!(store.list_documents().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_short_id_lookup() {
        let store = InMemoryStore::new();
        ingest(&store, "a.md", "# A\n\nalpha\n").await;
        let n = node_with(&store, "a.md", "alpha").await;
        assert_eq!(store.get_node_by_short_id(&n.short_id).await.unwrap(), n);
        assert!(matches!(
            store.get_node_by_short_id("zzzzzzzz").await,
            Err(GraphError::NotFound { .. })
        ));
    }
}
