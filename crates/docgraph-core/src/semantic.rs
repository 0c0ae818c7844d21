//! Semantic search over stored embeddings.
//!
//! # Algorithm
//!
//! 1. Validate `k`, `batch_size` and the query vector. No I/O happens
//!    before this succeeds.
//! 2. Look up the model's dimensionality. Unknown model → empty result;
//!    a different query length → `DimensionMismatch`.
//! 3. Pick a route once for the whole query:
//!    - [`SearchPath::Auto`]: the accelerated index if one is attached,
//!      falling back to the scan when it answers `Unsupported`.
//!    - [`SearchPath::BruteForce`] / [`SearchPath::Accelerated`]: forced.
//! 4. The scan streams batches of at most `batch_size` embeddings and
//!    keeps a min-heap of at most `k` candidates, so memory is
//!    `O(batch_size + k)` whatever the corpus size.
//!
//! Ranking is by cosine similarity, then stream position (node id
//! order), then node id. The result is independent of `batch_size`.

use serde::Serialize;
use tracing::{debug, warn};

use crate::embedding::{cosine_similarity, validate_vector};
use crate::error::{GraphError, Result};
use crate::models::{Filters, ScoredNode};
use crate::store::EmbeddingStore;
use crate::topk::{Candidate, TopK};

pub const DEFAULT_BATCH_SIZE: i64 = 1000;

/// Which strategy a query may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchPath {
    #[default]
    Auto,
    BruteForce,
    Accelerated,
}

/// Strategy that actually produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// The model has no embeddings; nothing was searched.
    NoEmbeddings,
    Accelerated,
    BruteForce,
    /// The index was attached but declined the request.
    Fallback,
}

#[derive(Debug, Clone)]
pub struct SemanticRequest {
    pub model_id: String,
    pub query_vector: Vec<f32>,
    pub k: i64,
    pub batch_size: i64,
    pub filters: Filters,
    pub path: SearchPath,
}

impl SemanticRequest {
    pub fn new(model_id: &str, query_vector: Vec<f32>, k: i64) -> Self {
        Self {
            model_id: model_id.to_string(),
            query_vector,
            k,
            batch_size: DEFAULT_BATCH_SIZE,
            filters: Filters::default(),
            path: SearchPath::Auto,
        }
    }

    /// Reject requests that can never run, before any store access.
    pub fn validate(&self) -> Result<()> {
        if self.k <= 0 {
            return Err(GraphError::InvalidArgument(format!(
                "k must be positive, got {}",
                self.k
            )));
        }
        if self.batch_size <= 0 {
            return Err(GraphError::InvalidArgument(format!(
                "batch_size must be positive, got {}",
                self.batch_size
            )));
        }
        validate_vector(&self.model_id, &self.query_vector)
    }
}

/// Counters from the streaming scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub batches: usize,
    pub scanned: usize,
    pub peak_batch_len: usize,
    pub peak_heap_len: usize,
}

#[derive(Debug, Clone)]
pub struct SemanticOutcome {
    pub hits: Vec<ScoredNode>,
    pub route: Route,
    pub stats: ScanStats,
}

/// Run a semantic query against `store`.
pub async fn search_semantic<S: EmbeddingStore + ?Sized>(
    store: &S,
    req: &SemanticRequest,
) -> Result<SemanticOutcome> {
    req.validate()?;

    let dimensions = match store.embedding_dimensions(&req.model_id).await? {
        Some(d) => d,
        None => {
            debug!(model = %req.model_id, "no embeddings for model");
            return Ok(SemanticOutcome {
                hits: Vec::new(),
                route: Route::NoEmbeddings,
                stats: ScanStats::default(),
            });
        }
    };
    if dimensions != req.query_vector.len() {
        return Err(GraphError::DimensionMismatch {
            model_id: req.model_id.clone(),
            expected: dimensions,
            actual: req.query_vector.len(),
        });
    }

    let (hits, route, stats) = match req.path {
        SearchPath::BruteForce => {
            let (hits, stats) = brute_force_search(store, req, dimensions).await?;
            (hits, Route::BruteForce, stats)
        }
        SearchPath::Accelerated => (
            accelerated_search(store, req).await?,
            Route::Accelerated,
            ScanStats::default(),
        ),
        SearchPath::Auto => {
            if store.index_available(&req.model_id).await {
                match accelerated_search(store, req).await {
                    Ok(hits) => (hits, Route::Accelerated, ScanStats::default()),
                    Err(e) if e.is_unsupported() => {
                        debug!(model = %req.model_id, reason = %e, "falling back to scan");
                        let (hits, stats) = brute_force_search(store, req, dimensions).await?;
                        (hits, Route::Fallback, stats)
                    }
                    Err(e) => return Err(e),
                }
            } else {
                let (hits, stats) = brute_force_search(store, req, dimensions).await?;
                (hits, Route::BruteForce, stats)
            }
        }
    };

    debug!(
        model = %req.model_id,
        k = req.k,
        route = ?route,
        hits = hits.len(),
        scanned = stats.scanned,
        "semantic search"
    );
    Ok(SemanticOutcome { hits, route, stats })
}

/// Ask the store's accelerated index. `Unsupported` when none is attached
/// or it cannot answer this request exactly.
pub async fn accelerated_search<S: EmbeddingStore + ?Sized>(
    store: &S,
    req: &SemanticRequest,
) -> Result<Vec<ScoredNode>> {
    if !store.index_available(&req.model_id).await {
        return Err(GraphError::Unsupported(format!(
            "no vector index attached for model '{}'",
            req.model_id
        )));
    }
    store
        .vec_search(&req.model_id, &req.query_vector, req.k as usize, &req.filters)
        .await
}

/// Streaming top-k scan with memory bounded by `batch_size + k`.
pub async fn brute_force_search<S: EmbeddingStore + ?Sized>(
    store: &S,
    req: &SemanticRequest,
    dimensions: usize,
) -> Result<(Vec<ScoredNode>, ScanStats)> {
    let mut stats = ScanStats::default();
    let mut top = TopK::new(req.k as usize);
    let mut seq = 0u64;

    let mut stream = store
        .stream_embeddings_for_model(&req.model_id, req.batch_size as usize, &req.filters)
        .await?;

    while let Some(batch) = stream.next_batch().await? {
        stats.batches += 1;
        stats.peak_batch_len = stats.peak_batch_len.max(batch.len());
        for embedding in batch {
            if embedding.vector.len() != dimensions {
                warn!(node = %embedding.node_id, model = %req.model_id, "embedding with wrong dimensionality");
                return Err(GraphError::DimensionMismatch {
                    model_id: req.model_id.clone(),
                    expected: dimensions,
                    actual: embedding.vector.len(),
                });
            }
            let score = cosine_similarity(&req.query_vector, &embedding.vector) as f64;
            top.offer(Candidate {
                score,
                seq,
                node_id: embedding.node_id,
            });
            seq += 1;
            stats.scanned += 1;
        }
    }
    stats.peak_heap_len = top.peak_len();

    let hits = top
        .into_sorted()
        .into_iter()
        .map(|c| ScoredNode {
            node_id: c.node_id,
            score: c.score,
        })
        .collect();
    Ok((hits, stats))
}
