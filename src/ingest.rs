//! Document ingestion and removal.
//!
//! The caller names the files; there is no directory walking. Each file
//! is read, shredded and stored in its own transaction, so one bad file
//! does not block the others. The stored source path is the file path
//! relative to `--root` when given, otherwise the path as typed.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::warn;

use docgraph_core::models::{IngestOutcome, IngestReport};
use docgraph_core::store::Store;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

/// Source path recorded for `file`.
pub fn source_path_for(file: &Path, root: Option<&Path>) -> Result<String> {
    let relative = match root {
        Some(root) => file.strip_prefix(root).with_context(|| {
            format!("{} is not under root {}", file.display(), root.display())
        })?,
        None => file,
    };
    relative
        .to_str()
        .map(str::to_string)
        .with_context(|| format!("path is not valid UTF-8: {}", relative.display()))
}

/// Ingest one file into `store`.
pub async fn ingest_file<S: Store + ?Sized>(
    store: &S,
    file: &Path,
    root: Option<&Path>,
) -> Result<IngestReport> {
    let source_path = source_path_for(file, root)?;
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let report = store
        .ingest(&source_path, &bytes)
        .await
        .with_context(|| format!("Failed to ingest {}", source_path))?;
    Ok(report)
}

pub async fn run_ingest(config: &Config, files: &[PathBuf], root: Option<PathBuf>) -> Result<()> {
    let store = SqliteStore::open(config).await?;

    let (mut created, mut replaced, mut unchanged) = (0, 0, 0);
    let mut failures = Vec::new();
    for file in files {
        match ingest_file(&store, file, root.as_deref()).await {
            Ok(report) => {
                match report.outcome {
                    IngestOutcome::Created => created += 1,
                    IngestOutcome::Replaced => replaced += 1,
                    IngestOutcome::Unchanged => unchanged += 1,
                }
                print_report(&report);
            }
            Err(e) => {
                warn!(file = %file.display(), error = %e, "ingest failed");
                println!("  {}: error: {:#}", file.display(), e);
                failures.push(file.clone());
            }
        }
    }
    store.close().await;

    println!("ingest");
    println!("  files: {}", files.len());
    println!("  created: {}", created);
    println!("  replaced: {}", replaced);
    println!("  unchanged: {}", unchanged);
    if !failures.is_empty() {
        bail!("{} of {} files failed to ingest", failures.len(), files.len());
    }
    println!("ok");
    Ok(())
}

fn print_report(report: &IngestReport) {
    match report.outcome {
        IngestOutcome::Unchanged => {
            println!("  {}: unchanged ({})", report.source_path, report.doc_id);
        }
        _ => {
            println!(
                "  {}: {} nodes, {} edges, {} unresolved refs, {} stale / {} removed embeddings ({})",
                report.source_path,
                report.nodes,
                report.edges,
                report.references_unresolved,
                report.embeddings_stale,
                report.embeddings_removed,
                report.doc_id
            );
        }
    }
}

pub async fn run_remove(config: &Config, source_path: &str) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let removed = store.remove_document(source_path).await?;
    store.close().await;
    if !removed {
        bail!("no document stored at '{}'", source_path);
    }
    println!("removed {}", source_path);
    Ok(())
}

pub async fn run_resolve(config: &Config) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let resolved = store.resolve_references().await?;
    store.close().await;
    println!("resolved references: {}", resolved);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_path_relative_to_root() {
        let path = source_path_for(Path::new("/notes/docs/a.md"), Some(Path::new("/notes"))).unwrap();
        assert_eq!(path, "docs/a.md");
        assert_eq!(source_path_for(Path::new("docs/a.md"), None).unwrap(), "docs/a.md");
        assert!(source_path_for(Path::new("/elsewhere/a.md"), Some(Path::new("/notes"))).is_err());
    }
}
