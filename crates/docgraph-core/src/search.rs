//! Query entry points: full-text search and the unified query facade.
//!
//! The engines operate entirely through the store traits, with no
//! database or configuration dependencies. The calling application
//! supplies the query vector (embeddings are produced out of band) and
//! the store implementation.
//!
//! # Query pipeline
//!
//! 1. Validate the request (`k`, mode/input pairing, model id).
//! 2. Run the FTS engine or the semantic engine.
//! 3. Enrich each ranked node with its `doc_id` and a whitespace-collapsed
//!    preview of its content.

use serde::Serialize;

use crate::error::{GraphError, Result};
use crate::fts::FtsQuery;
use crate::models::{Filters, ScoredNode};
use crate::semantic::{search_semantic, Route, SearchPath, SemanticRequest, DEFAULT_BATCH_SIZE};
use crate::store::{GraphStore, Store, TextStore};

/// Default characters of node content shown in a [`QueryHit`].
pub const PREVIEW_CHARS: usize = 240;

/// Run a full-text query.
///
/// A blank query returns no results. Any other query must parse, or
/// the call fails with `QuerySyntax` before the store is touched.
pub async fn search_fts<S: TextStore + ?Sized>(
    store: &S,
    query: &str,
    limit: i64,
    filters: &Filters,
) -> Result<Vec<ScoredNode>> {
    if limit <= 0 {
        return Err(GraphError::InvalidArgument(format!(
            "limit must be positive, got {}",
            limit
        )));
    }
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed = FtsQuery::parse(query)?;
    store.fts_search(&parsed, limit as usize, filters).await
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryInput {
    Text(String),
    Vector(Vec<f32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    #[default]
    Fts,
    Semantic,
}

/// Bundles all inputs for a single query.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: QueryInput,
    pub mode: QueryMode,
    /// Maximum results.
    pub k: i64,
    /// Semantic mode only.
    pub batch_size: i64,
    /// Semantic mode only.
    pub model_id: Option<String>,
    pub filters: Filters,
    /// Semantic mode only.
    pub path: SearchPath,
    /// Length cap for [`QueryHit::preview_text`].
    pub preview_chars: usize,
}

impl QueryRequest {
    pub fn fts(query: &str, k: i64) -> Self {
        Self {
            query: QueryInput::Text(query.to_string()),
            mode: QueryMode::Fts,
            k,
            batch_size: DEFAULT_BATCH_SIZE,
            model_id: None,
            filters: Filters::default(),
            path: SearchPath::Auto,
            preview_chars: PREVIEW_CHARS,
        }
    }

    pub fn semantic(model_id: &str, vector: Vec<f32>, k: i64) -> Self {
        Self {
            query: QueryInput::Vector(vector),
            mode: QueryMode::Semantic,
            k,
            batch_size: DEFAULT_BATCH_SIZE,
            model_id: Some(model_id.to_string()),
            filters: Filters::default(),
            path: SearchPath::Auto,
            preview_chars: PREVIEW_CHARS,
        }
    }

    /// Check everything that can be checked without touching a store.
    ///
    /// Callers that prepare expensive state for a query (such as building
    /// a vector index) should call this first.
    pub fn validate(&self) -> Result<()> {
        if self.preview_chars == 0 {
            return Err(GraphError::InvalidArgument(
                "preview_chars must be positive".into(),
            ));
        }
        match (&self.mode, &self.query) {
            (QueryMode::Fts, QueryInput::Text(_)) => {
                if self.k <= 0 {
                    return Err(GraphError::InvalidArgument(format!(
                        "limit must be positive, got {}",
                        self.k
                    )));
                }
                Ok(())
            }
            (QueryMode::Semantic, QueryInput::Vector(_)) => self.semantic_request()?.validate(),
            (QueryMode::Fts, QueryInput::Vector(_)) => Err(GraphError::InvalidArgument(
                "full-text queries take text, not a vector".into(),
            )),
            (QueryMode::Semantic, QueryInput::Text(_)) => Err(GraphError::InvalidArgument(
                "semantic queries take a vector, not text".into(),
            )),
        }
    }

    fn semantic_request(&self) -> Result<SemanticRequest> {
        let QueryInput::Vector(vector) = &self.query else {
            return Err(GraphError::InvalidArgument(
                "semantic queries take a vector, not text".into(),
            ));
        };
        let model_id = self.model_id.as_deref().ok_or_else(|| {
            GraphError::InvalidArgument("semantic queries need a model id".into())
        })?;
        Ok(SemanticRequest {
            model_id: model_id.to_string(),
            query_vector: vector.clone(),
            k: self.k,
            batch_size: self.batch_size,
            filters: self.filters.clone(),
            path: self.path,
        })
    }
}

/// One ranked, enriched result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryHit {
    pub node_id: String,
    pub score: f64,
    pub doc_id: String,
    pub preview_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub hits: Vec<QueryHit>,
    /// Semantic mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
}

/// Run a query against a [`Store`] backend.
///
/// This is the function every frontend delegates to.
pub async fn run_query<S: Store + ?Sized>(store: &S, req: &QueryRequest) -> Result<QueryResponse> {
    req.validate()?;
    let (ranked, route) = match &req.query {
        QueryInput::Text(text) => (search_fts(store, text, req.k, &req.filters).await?, None),
        QueryInput::Vector(_) => {
            let outcome = search_semantic(store, &req.semantic_request()?).await?;
            (outcome.hits, Some(outcome.route))
        }
    };

    let hits = enrich(store, ranked, req.preview_chars).await?;
    Ok(QueryResponse { hits, route })
}

async fn enrich<S: GraphStore + ?Sized>(
    store: &S,
    ranked: Vec<ScoredNode>,
    preview_chars: usize,
) -> Result<Vec<QueryHit>> {
    let mut hits = Vec::with_capacity(ranked.len());
    for scored in ranked {
        let node = store.get_node(&scored.node_id).await?;
        hits.push(QueryHit {
            node_id: scored.node_id,
            score: scored.score,
            doc_id: node.doc_id,
            preview_text: preview(&node.raw_content, preview_chars),
        });
    }
    Ok(hits)
}

/// Collapse whitespace runs and cut to `max_chars` characters.
pub fn preview(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(max_chars) {
        Some((idx, _)) => collapsed[..idx].to_string(),
        None => collapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Embedding, NodeKind};
    use crate::store::memory::InMemoryStore;

    async fn corpus() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .ingest(
                "guide.md",
                b"# Alpha\n\nThe needle hides here.\n\n# Beta\n\nNothing to see.\n\n# Gamma\n\nA needle and another needle.\n",
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_fts_finds_unique_word_paragraph() {
        let store = corpus().await;
        let hits = search_fts(&store, "hides", 5, &Filters::default()).await.unwrap();
        assert_eq!(hits.len(), 1);
        let node = store.get_node(&hits[0].node_id).await.unwrap();
        assert_eq!(node.kind, NodeKind::Paragraph);
        assert_eq!(node.raw_content, "The needle hides here.");
    }

    #[tokio::test]
    async fn test_fts_is_deterministic_and_ranked() {
        let store = corpus().await;
        let first = search_fts(&store, "needle", 5, &Filters::default()).await.unwrap();
        for _ in 0..5 {
            let again = search_fts(&store, "needle", 5, &Filters::default()).await.unwrap();
            assert_eq!(first, again);
        }
        assert_eq!(first.len(), 2);
        assert!(first[0].score > first[1].score);
    }

    #[tokio::test]
    async fn test_fts_rejects_bad_syntax_and_limits() {
        let store = corpus().await;
        assert!(matches!(
            search_fts(&store, "title:needle", 5, &Filters::default()).await,
            Err(GraphError::QuerySyntax { .. })
        ));
        assert!(matches!(
            search_fts(&store, "needle", 0, &Filters::default()).await,
            Err(GraphError::InvalidArgument(_))
        ));
        assert!(search_fts(&store, "  ", 5, &Filters::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_run_query_enriches_hits() {
        let store = corpus().await;
        let resp = run_query(&store, &QueryRequest::fts("hides", 3)).await.unwrap();
        assert_eq!(resp.hits.len(), 1);
        assert!(resp.route.is_none());
        let doc = store.document_by_path("guide.md").await.unwrap().unwrap();
        assert_eq!(resp.hits[0].doc_id, doc.doc_id);
        assert_eq!(resp.hits[0].preview_text, "The needle hides here.");

        let node = store.get_node(&resp.hits[0].node_id).await.unwrap();
        store
            .upsert_embedding(&Embedding {
                node_id: node.node_id.clone(),
                model_id: "m".into(),
                vector: vec![0.5, 0.5],
            })
            .await
            .unwrap();
        let resp = run_query(&store, &QueryRequest::semantic("m", vec![1.0, 1.0], 3))
            .await
            .unwrap();
        assert_eq!(resp.hits[0].node_id, node.node_id);
        assert_eq!(resp.route, Some(Route::BruteForce));
    }

    #[tokio::test]
    async fn test_run_query_rejects_mismatched_input() {
        let store = corpus().await;
        let mut req = QueryRequest::fts("needle", 3);
        req.mode = QueryMode::Semantic;
        assert!(matches!(
            run_query(&store, &req).await,
            Err(GraphError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_semantic_requests_up_front() {
        let mut req = QueryRequest::semantic("m", vec![1.0, 0.0], 0);
        assert!(matches!(req.validate(), Err(GraphError::InvalidArgument(_))));
        req.k = 3;
        req.batch_size = 0;
        assert!(matches!(req.validate(), Err(GraphError::InvalidArgument(_))));
        req.batch_size = 10;
        req.model_id = None;
        assert!(matches!(req.validate(), Err(GraphError::InvalidArgument(_))));
        req.model_id = Some("m".into());
        assert!(req.validate().is_ok());

        let mut fts = QueryRequest::fts("needle", 0);
        assert!(fts.validate().is_err());
        fts.k = 1;
        assert!(fts.validate().is_ok());
    }

    #[tokio::test]
    async fn test_preview_length_follows_request() {
        let store = corpus().await;
        let mut req = QueryRequest::fts("hides", 3);
        req.preview_chars = 10;
        let resp = run_query(&store, &req).await.unwrap();
        assert_eq!(resp.hits[0].preview_text, "The needle");

        let long = "word ".repeat(100);
        store.ingest("long.md", long.as_bytes()).await.unwrap();
        let mut req = QueryRequest::fts("word", 1);
        req.preview_chars = 400;
        let resp = run_query(&store, &req).await.unwrap();
        assert_eq!(resp.hits[0].preview_text.chars().count(), 400);
    }

    #[test]
    fn test_preview_collapses_and_truncates() {
        assert_eq!(preview("a\n\n  b\tc", 240), "a b c");
        assert_eq!(preview("abcdef", 3), "abc");
        assert_eq!(preview("äöü", 3), "äöü");
    }
}
