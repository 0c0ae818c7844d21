//! Approximate HNSW vector index backed by usearch.
//!
//! Built explicitly from a store snapshot with [`HnswIndex::build`] and
//! attached with [`SqliteStore::attach_index`](crate::sqlite_store::SqliteStore::attach_index).
//! Like every [`VectorIndex`], it records the embedding revision it was
//! built at and the store stops consulting it as soon as that revision
//! moves on.
//!
//! Results are approximate: recall depends on `expansion_search`.

use std::collections::HashMap;

use tracing::info;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use docgraph_core::models::ScoredNode;
use docgraph_core::store::EmbeddingStore;
use docgraph_core::vector_index::VectorIndex;
use docgraph_core::{GraphError, Result, Stage};

/// Graph construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct HnswParams {
    /// Links per node (HNSW `M`).
    pub connectivity: usize,
    pub expansion_add: usize,
    pub expansion_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            connectivity: 16,
            expansion_add: 200,
            expansion_search: 100,
        }
    }
}

pub struct HnswIndex {
    index: Index,
    model_id: String,
    dimensions: usize,
    revision: u64,
    key_to_id: HashMap<u64, String>,
}

fn index_err(model_id: &str, err: impl std::fmt::Display) -> GraphError {
    GraphError::storage(Stage::Embed, model_id, err)
}

impl HnswIndex {
    pub fn new(model_id: &str, dimensions: usize, revision: u64, params: HnswParams) -> Result<Self> {
        let options = IndexOptions {
            dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: params.connectivity,
            expansion_add: params.expansion_add,
            expansion_search: params.expansion_search,
            multi: false,
        };
        let index = Index::new(&options).map_err(|e| index_err(model_id, e))?;
        Ok(Self {
            index,
            model_id: model_id.to_string(),
            dimensions,
            revision,
            key_to_id: HashMap::new(),
        })
    }

    /// Build from the store's current embeddings for a model.
    ///
    /// Returns `None` when the model has no embeddings.
    pub async fn build<S: EmbeddingStore + ?Sized>(
        store: &S,
        model_id: &str,
        batch_size: usize,
        params: HnswParams,
    ) -> Result<Option<Self>> {
        let Some(dimensions) = store.embedding_dimensions(model_id).await? else {
            return Ok(None);
        };
        let revision = store.embedding_revision(model_id).await?;
        let mut hnsw = Self::new(model_id, dimensions, revision, params)?;

        let mut stream = store
            .stream_embeddings_for_model(model_id, batch_size.max(1), &Default::default())
            .await?;
        while let Some(batch) = stream.next_batch().await? {
            let needed = hnsw.index.size() + batch.len();
            if needed > hnsw.index.capacity() {
                hnsw.index
                    .reserve(needed.max(hnsw.index.capacity() * 2))
                    .map_err(|e| index_err(model_id, e))?;
            }
            for embedding in batch {
                hnsw.insert(&embedding.node_id, &embedding.vector)?;
            }
        }

        info!(
            model = model_id,
            entries = hnsw.key_to_id.len(),
            revision,
            "built hnsw vector index"
        );
        Ok(Some(hnsw))
    }

    fn insert(&mut self, node_id: &str, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(GraphError::DimensionMismatch {
                model_id: self.model_id.clone(),
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        let key = self.key_to_id.len() as u64;
        self.index
            .add(key, vector)
            .map_err(|e| index_err(&self.model_id, e))?;
        self.key_to_id.insert(key, node_id.to_string());
        Ok(())
    }
}

impl VectorIndex for HnswIndex {
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
        self.key_to_id.len()
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredNode>> {
        if query.len() != self.dimensions {
            return Err(GraphError::DimensionMismatch {
                model_id: self.model_id.clone(),
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        if self.key_to_id.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let matches = self
            .index
            .search(query, k)
            .map_err(|e| index_err(&self.model_id, e))?;

        let mut hits: Vec<ScoredNode> = matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .filter_map(|(key, distance)| {
                self.key_to_id.get(key).map(|node_id| ScoredNode {
                    node_id: node_id.clone(),
                    // Cosine distance to similarity.
                    score: 1.0 - f64::from(*distance),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        Ok(hits)
    }
}
