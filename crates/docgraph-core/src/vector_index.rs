//! Accelerated vector indexes.
//!
//! An index is built explicitly from a store snapshot and records the
//! embedding revision it was built at. Stores consult it only while that
//! revision is current, so a stale index is reported as `Unsupported`
//! instead of returning results that miss recent writes.

use tracing::info;

use crate::embedding::cosine_similarity;
use crate::error::{GraphError, Result};
use crate::models::{Embedding, ScoredNode};
use crate::store::EmbeddingStore;
use crate::topk::{Candidate, TopK};

/// Read-only nearest-neighbour index over one model's embeddings.
pub trait VectorIndex: Send + Sync {
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;
    /// Embedding revision of the snapshot the index was built from.
    fn revision(&self) -> u64;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Up to `k` nodes, best first, ties by node id ascending. Scores
    /// are cosine similarities.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredNode>>;
}

/// Exact in-memory index. Same answers as the streaming scan, computed
/// from a resident copy of the vectors.
pub struct FlatIndex {
    model_id: String,
    dimensions: usize,
    revision: u64,
    entries: Vec<(String, Vec<f32>)>,
}

impl FlatIndex {
    pub fn new(model_id: &str, dimensions: usize, revision: u64) -> Self {
        Self {
            model_id: model_id.to_string(),
            dimensions,
            revision,
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, embedding: Embedding) -> Result<()> {
        if embedding.vector.len() != self.dimensions {
            return Err(GraphError::DimensionMismatch {
                model_id: self.model_id.clone(),
                expected: self.dimensions,
                actual: embedding.vector.len(),
            });
        }
        self.entries.push((embedding.node_id, embedding.vector));
        Ok(())
    }
}

impl VectorIndex for FlatIndex {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredNode>> {
        if query.len() != self.dimensions {
            return Err(GraphError::DimensionMismatch {
                model_id: self.model_id.clone(),
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        let mut top = TopK::new(k);
        for (node_id, vector) in &self.entries {
            // seq 0 everywhere: ties fall through to node id.
            top.offer(Candidate {
                score: cosine_similarity(query, vector) as f64,
                seq: 0,
                node_id: node_id.clone(),
            });
        }
        Ok(top
            .into_sorted()
            .into_iter()
            .map(|c| ScoredNode {
                node_id: c.node_id,
                score: c.score,
            })
            .collect())
    }
}

/// Build a [`FlatIndex`] from the store's current embeddings for a model.
///
/// Returns `None` when the model has no embeddings.
pub async fn build_flat_index<S: EmbeddingStore + ?Sized>(
    store: &S,
    model_id: &str,
    batch_size: usize,
) -> Result<Option<FlatIndex>> {
    let Some(dimensions) = store.embedding_dimensions(model_id).await? else {
        return Ok(None);
    };
    let revision = store.embedding_revision(model_id).await?;
    let mut index = FlatIndex::new(model_id, dimensions, revision);

    let mut stream = store
        .stream_embeddings_for_model(model_id, batch_size.max(1), &Default::default())
        .await?;
    while let Some(batch) = stream.next_batch().await? {
        for embedding in batch {
            index.insert(embedding)?;
        }
    }

    info!(
        model = model_id,
        entries = index.len(),
        revision,
        "built flat vector index"
    );
    Ok(Some(index))
}
