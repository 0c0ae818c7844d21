//! `dg search`: full-text and semantic queries from the command line.
//!
//! Query evaluation lives in [`docgraph_core::search`]; this module turns
//! CLI options into a [`QueryRequest`], prepares the vector index chosen
//! in `[index]`, and prints the enriched hits.
//!
//! Semantic queries take the query vector on the command line
//! (`--vector 0.1,0.2,...`); embeddings are produced outside docgraph.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use docgraph_core::models::Filters;
use docgraph_core::search::{run_query, QueryInput, QueryMode, QueryRequest, QueryResponse};
use docgraph_core::semantic::SearchPath;
use docgraph_core::vector_index::build_flat_index;

use crate::config::{Config, IndexKind};
use crate::sqlite_store::SqliteStore;

/// Options collected from the command line.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Query text (FTS mode).
    pub query: Option<String>,
    pub mode: QueryMode,
    /// Comma-separated vector (semantic mode).
    pub vector: Option<String>,
    pub model: Option<String>,
    pub k: Option<i64>,
    pub batch_size: Option<i64>,
    pub path: SearchPath,
    pub filters: Filters,
    pub json: bool,
}

/// Parse `0.1, 0.2,-3e-2` into a vector.
pub fn parse_vector(raw: &str) -> Result<Vec<f32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f32>()
                .with_context(|| format!("invalid vector component '{}'", s))
        })
        .collect()
}

/// Parse a `--mode` value.
pub fn parse_mode(raw: &str) -> Result<QueryMode> {
    match raw {
        "fts" | "keyword" => Ok(QueryMode::Fts),
        "semantic" => Ok(QueryMode::Semantic),
        other => bail!("unknown search mode '{}': expected fts or semantic", other),
    }
}

/// Parse a `--path` value.
pub fn parse_path(raw: &str) -> Result<SearchPath> {
    match raw {
        "auto" => Ok(SearchPath::Auto),
        "brute-force" | "brute_force" => Ok(SearchPath::BruteForce),
        "accelerated" => Ok(SearchPath::Accelerated),
        other => bail!(
            "unknown search path '{}': expected auto, brute-force or accelerated",
            other
        ),
    }
}

fn build_request(config: &Config, opts: &SearchOptions) -> Result<QueryRequest> {
    let k = opts.k.unwrap_or(config.search.k);
    let mut req = match opts.mode {
        QueryMode::Fts => {
            let Some(query) = &opts.query else {
                bail!("full-text search needs a query string");
            };
            QueryRequest::fts(query, k)
        }
        QueryMode::Semantic => {
            let Some(model) = &opts.model else {
                bail!("semantic search needs --model");
            };
            let Some(raw) = &opts.vector else {
                bail!("semantic search needs --vector");
            };
            QueryRequest::semantic(model, parse_vector(raw)?, k)
        }
    };
    req.batch_size = opts.batch_size.unwrap_or(config.search.batch_size);
    req.filters = opts.filters.clone();
    req.path = opts.path;
    req.preview_chars = config.search.preview_chars;
    req.validate()?;
    Ok(req)
}

/// Build and attach the configured index for `model_id`, if any.
pub async fn prepare_index(config: &Config, store: &SqliteStore, model_id: &str) -> Result<()> {
    let batch_size = config.search.batch_size as usize;
    match config.index.kind {
        IndexKind::None => {}
        IndexKind::Flat => {
            if let Some(index) = build_flat_index(store, model_id, batch_size).await? {
                store.attach_index(Arc::new(index));
            }
        }
        #[cfg(feature = "hnsw")]
        IndexKind::Hnsw => {
            use crate::hnsw::{HnswIndex, HnswParams};
            if let Some(index) =
                HnswIndex::build(store, model_id, batch_size, HnswParams::default()).await?
            {
                store.attach_index(Arc::new(index));
            }
        }
        #[cfg(not(feature = "hnsw"))]
        IndexKind::Hnsw => bail!("index.kind = \"hnsw\" requires the `hnsw` feature"),
    }
    debug!(model = model_id, kind = ?config.index.kind, "vector index prepared");
    Ok(())
}

/// Run a search against the configured store and return the response.
///
/// The request is validated before the store is opened, so a bad `k`
/// or batch size never pays for an index build.
pub async fn search(config: &Config, opts: &SearchOptions) -> Result<QueryResponse> {
    let req = build_request(config, opts)?;
    let store = SqliteStore::open(config).await?;
    if let (QueryMode::Semantic, Some(model)) = (req.mode, req.model_id.as_deref()) {
        if req.path != SearchPath::BruteForce {
            prepare_index(config, &store, model).await?;
        }
    }
    let resp = run_query(&store, &req).await;
    store.close().await;
    let resp = resp?;

    if let QueryInput::Text(text) = &req.query {
        info!(query = %text, hits = resp.hits.len(), "fts query");
    } else {
        info!(route = ?resp.route, hits = resp.hits.len(), "semantic query");
    }
    Ok(resp)
}

pub async fn run_search(config: &Config, opts: &SearchOptions) -> Result<()> {
    let resp = search(config, opts).await?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&resp)?);
        return Ok(());
    }

    if resp.hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    if let Some(route) = resp.route {
        println!("route: {:?}", route);
        println!();
    }
    for (i, hit) in resp.hits.iter().enumerate() {
        println!("{}. [{:.4}] {}", i + 1, hit.score, hit.node_id);
        println!("    doc: {}", hit.doc_id);
        println!("    excerpt: \"{}\"", hit.preview_text);
        println!();
    }
    Ok(())
}
