//! Embedding management: `dg embed import` and `dg embed pending`.
//!
//! docgraph does not run embedding models. `embed pending --json` writes
//! one JSON object per node that lacks a fresh vector; an external tool
//! embeds the `text` field and feeds the results back through
//! `embed import` as JSONL:
//!
//! ```text
//! {"node_id": "3f2a9c1e", "model_id": "mini", "vector": [0.12, -0.03, ...]}
//! ```
//!
//! `node_id` may be a full id or a short id. `model_id` falls back to
//! `--model` when omitted.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use docgraph_core::models::Embedding;
use docgraph_core::store::Store;

use crate::config::Config;
use crate::get::lookup_node;
use crate::sqlite_store::SqliteStore;

/// One line of an import file.
#[derive(Debug, Deserialize)]
pub struct EmbeddingRecord {
    pub node_id: String,
    #[serde(default)]
    pub model_id: Option<String>,
    pub vector: Vec<f32>,
}

/// One line of `embed pending --json` output.
#[derive(Debug, Serialize)]
pub struct PendingRecord<'a> {
    pub node_id: &'a str,
    pub model_id: &'a str,
    pub kind: &'a str,
    pub text: &'a str,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub failed: usize,
}

/// Import JSONL embedding records into `store`. Bad lines are counted
/// and skipped; each good line is its own write.
pub async fn import_embeddings<S: Store + ?Sized>(
    store: &S,
    content: &str,
    default_model: Option<&str>,
) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match import_line(store, line, default_model).await {
            Ok(()) => summary.imported += 1,
            Err(e) => {
                warn!(line = lineno + 1, error = %e, "skipping embedding record");
                eprintln!("Warning: line {}: {:#}", lineno + 1, e);
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

async fn import_line<S: Store + ?Sized>(store: &S, line: &str, default_model: Option<&str>) -> Result<()> {
    let record: EmbeddingRecord = serde_json::from_str(line).context("invalid JSON record")?;
    let Some(model_id) = record.model_id.as_deref().or(default_model) else {
        bail!("record has no model_id and no --model was given");
    };
    let node = lookup_node(store, &record.node_id).await?;
    store
        .upsert_embedding(&Embedding {
            node_id: node.node_id,
            model_id: model_id.to_string(),
            vector: record.vector,
        })
        .await?;
    Ok(())
}

pub async fn run_embed_import(config: &Config, file: &Path, model: Option<&str>) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let store = SqliteStore::open(config).await?;
    let summary = import_embeddings(&store, &content, model).await;
    store.close().await;
    let summary = summary?;

    println!("embed import");
    println!("  imported: {}", summary.imported);
    println!("  failed: {}", summary.failed);
    if summary.failed > 0 {
        bail!("{} embedding records failed to import", summary.failed);
    }
    println!("ok");
    Ok(())
}

pub async fn run_embed_pending(
    config: &Config,
    model: &str,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let limit = limit.unwrap_or(config.search.pending_limit);
    let pending = store.pending_embeddings(model, limit).await;
    store.close().await;
    let pending = pending?;

    if json {
        for node in &pending {
            let record = PendingRecord {
                node_id: &node.node_id,
                model_id: model,
                kind: node.kind.as_str(),
                text: &node.raw_content,
            };
            println!("{}", serde_json::to_string(&record)?);
        }
        return Ok(());
    }

    println!("embed pending ({})", model);
    println!("  nodes needing embeddings: {}", pending.len());
    for node in &pending {
        println!(
            "  [{}] {}: {}",
            node.short_id,
            node.kind,
            docgraph_core::search::preview(&node.raw_content, 60)
        );
    }
    Ok(())
}
