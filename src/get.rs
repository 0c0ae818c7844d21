//! Node and document retrieval: `dg get` and `dg outline`.

use anyhow::{Context, Result};
use serde::Serialize;

use docgraph_core::ids::SHORT_ID_LEN;
use docgraph_core::models::{Document, Edge, Filters, Node};
use docgraph_core::outline::{outline, render_outline, OutlineEntry};
use docgraph_core::store::GraphStore;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

/// Look a node up by full id or short id.
pub async fn lookup_node<S: GraphStore + ?Sized>(store: &S, id: &str) -> Result<Node> {
    let node = if id.len() == SHORT_ID_LEN {
        store.get_node_by_short_id(id).await?
    } else {
        store.get_node(id).await?
    };
    Ok(node)
}

/// Look a document up by doc id, falling back to source path.
pub async fn lookup_document<S: GraphStore + ?Sized>(store: &S, key: &str) -> Result<Document> {
    match store.get_document(key).await {
        Ok(doc) => Ok(doc),
        Err(e) => store
            .document_by_path(key)
            .await?
            .ok_or(e)
            .with_context(|| format!("no document with id or path '{}'", key)),
    }
}

#[derive(Debug, Serialize)]
pub struct NodeResponse {
    pub node: Node,
    pub source_path: String,
    pub edges: Vec<Edge>,
}

pub async fn get_node<S: GraphStore + ?Sized>(store: &S, id: &str) -> Result<NodeResponse> {
    let node = lookup_node(store, id).await?;
    let doc = store.get_document(&node.doc_id).await?;
    let edges = store.edges_from(&node.node_id).await?;
    Ok(NodeResponse {
        node,
        source_path: doc.source_path,
        edges,
    })
}

pub async fn run_get(config: &Config, id: &str, json: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let resp = get_node(&store, id).await;
    store.close().await;
    let resp = resp?;

    if json {
        println!("{}", serde_json::to_string_pretty(&resp)?);
        return Ok(());
    }

    let node = &resp.node;
    println!("--- node ---");
    println!("id:       {}", node.node_id);
    println!("short:    {}", node.short_id);
    println!("kind:     {}", node.kind);
    if let Some(level) = node.level {
        println!("level:    {}", level);
    }
    println!("order:    {}", node.order_index);
    println!("doc:      {}", node.doc_id);
    println!("path:     {}", resp.source_path);
    println!();
    println!("--- content ---");
    println!("{}", node.raw_content);
    if !resp.edges.is_empty() {
        println!();
        println!("--- edges ({}) ---", resp.edges.len());
        for edge in &resp.edges {
            println!("  {} -> {}", edge.edge_type.as_str(), edge.dst_node_id);
        }
    }
    Ok(())
}

pub async fn run_outline(config: &Config, doc: &str, filters: &Filters, json: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let result = outline_for(&store, doc, filters).await;
    store.close().await;
    let (document, entries) = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    println!(
        "{} ({})",
        document.title.as_deref().unwrap_or(&document.source_path),
        document.doc_id
    );
    print!("{}", render_outline(&entries));
    Ok(())
}

async fn outline_for<S: GraphStore + ?Sized>(
    store: &S,
    doc: &str,
    filters: &Filters,
) -> Result<(Document, Vec<OutlineEntry>)> {
    let document = lookup_document(store, doc).await?;
    let entries = outline(store, &document.doc_id, filters).await?;
    Ok((document, entries))
}
