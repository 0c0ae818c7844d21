//! SQLite-backed [`Store`] implementation.
//!
//! Maps each store operation onto the schema created by
//! [`migrate`](crate::migrate). Every write runs in one transaction under
//! an async write lock, so a failed ingest leaves the database exactly as
//! it was. Reads use the pool directly; WAL mode gives each of them a
//! consistent snapshot.
//!
//! Embedding streams hold their own read transaction for their whole
//! lifetime and page through `embeddings` by node id, so a stream sees
//! one snapshot no matter what is written while it is open.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info};

use docgraph_core::embedding::{blob_to_vec, validate_vector, vec_to_blob};
use docgraph_core::fts::FtsQuery;
use docgraph_core::ids::normalize_path;
use docgraph_core::models::{
    Document, Edge, EdgeType, Embedding, Filters, IngestOutcome, IngestReport, Node, NodeKind,
    ScoredNode, TagKind, TagTarget,
};
use docgraph_core::refs::{self, Lookup};
use docgraph_core::shred::{shred, ShreddedDocument};
use docgraph_core::store::{
    diff_nodes, EmbeddingStore, EmbeddingStream, GraphStore, Store, TextStore,
};
use docgraph_core::vector_index::VectorIndex;
use docgraph_core::{GraphError, Result, Stage};

use crate::config::Config;
use crate::{db, migrate};

const NODE_COLUMNS: &str =
    "n.node_id, n.doc_id, n.kind, n.level, n.order_index, n.raw_content, n.short_id, n.content_hash";

/// Filter clauses over aliases `n` (nodes) and `d` (documents).
/// Bind with [`bind_filters`].
const FILTER_SQL: &str = r#"
    AND (? IS NULL OR substr(d.source_path, 1, length(?)) = ?)
    AND (? IS NULL OR EXISTS (
        SELECT 1 FROM tags t
        WHERE t.kind = 'collection' AND t.name = ?
          AND ((t.target_kind = 'document' AND t.target_id = d.source_path)
            OR (t.target_kind = 'node' AND t.target_id = n.node_id))))
    AND (? IS NULL OR EXISTS (
        SELECT 1 FROM tags t
        WHERE t.kind = 'topic' AND t.name = ?
          AND ((t.target_kind = 'document' AND t.target_id = d.source_path)
            OR (t.target_kind = 'node' AND t.target_id = n.node_id))))
"#;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_filters<'q>(query: SqliteQuery<'q>, filters: &'q Filters) -> SqliteQuery<'q> {
    let prefix = filters.scope_path_prefix.as_deref();
    let collection = filters.collection.as_deref();
    let topic = filters.topic.as_deref();
    query
        .bind(prefix)
        .bind(prefix)
        .bind(prefix)
        .bind(collection)
        .bind(collection)
        .bind(topic)
        .bind(topic)
}

trait StageExt<T> {
    fn stage(self, stage: Stage, entity: &str) -> Result<T>;
}

impl<T> StageExt<T> for std::result::Result<T, sqlx::Error> {
    fn stage(self, stage: Stage, entity: &str) -> Result<T> {
        self.map_err(|e| GraphError::storage(stage, entity, e))
    }
}

/// SQLite implementation of the [`Store`] traits.
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    indexes: RwLock<HashMap<String, Arc<dyn VectorIndex>>>,
}

impl SqliteStore {
    /// Wrap a pool whose schema is already migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// Connect to the configured database and bring its schema up to date.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        Self::open_path(&config.db.path).await
    }

    pub async fn open_path(db_path: &Path) -> anyhow::Result<Self> {
        let pool = db::connect_path(db_path).await?;
        migrate::migrate_pool(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
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

    fn index_for(&self, model_id: &str) -> Option<Arc<dyn VectorIndex>> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        indexes.get(model_id).cloned()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn ingest_shredded(&self, shredded: ShreddedDocument) -> Result<IngestReport> {
        let path = shredded.document.source_path.clone();
        let _guard = self.write_lock.lock().await;

        let existing = sqlx::query("SELECT doc_id, content_hash FROM documents WHERE source_path = ?")
            .bind(&path)
            .fetch_optional(&self.pool)
            .await
            .stage(Stage::Ingest, &path)?;
        let previous_doc_id: Option<String> = match existing {
            Some(row) => {
                let doc_id: String = row.get("doc_id");
                let content_hash: String = row.get("content_hash");
                if content_hash == shredded.document.content_hash {
                    debug!(path = %path, "unchanged, skipping");
                    return Ok(IngestReport::unchanged(&doc_id, &path));
                }
                Some(doc_id)
            }
            None => None,
        };

        let mut tx = self.pool.begin().await.stage(Stage::Ingest, &path)?;
        let report = apply_ingest(&mut tx, &shredded, previous_doc_id.as_deref()).await?;
        tx.commit().await.stage(Stage::Ingest, &path)?;

        info!(
            path = %path,
            doc_id = %report.doc_id,
            nodes = report.nodes,
            stale = report.embeddings_stale,
            removed = report.embeddings_removed,
            "ingested document"
        );
        Ok(report)
    }
}

fn node_from_row(row: &SqliteRow) -> Result<Node> {
    let node_id: String = row.get("node_id");
    let kind: String = row.get("kind");
    let kind: NodeKind = kind
        .parse()
        .map_err(|e: String| GraphError::storage(Stage::Query, node_id.as_str(), e))?;
    let level: Option<i64> = row.get("level");
    Ok(Node {
        doc_id: row.get("doc_id"),
        kind,
        level: level.map(|l| l as u8),
        order_index: row.get("order_index"),
        raw_content: row.get("raw_content"),
        short_id: row.get("short_id"),
        content_hash: row.get("content_hash"),
        node_id,
    })
}

fn document_from_row(row: &SqliteRow) -> Document {
    Document {
        doc_id: row.get("doc_id"),
        source_path: row.get("source_path"),
        content_hash: row.get("content_hash"),
        title: row.get("title"),
        raw_text: row.get("raw_text"),
    }
}

fn edge_from_row(row: &SqliteRow) -> Result<Edge> {
    let edge_type: String = row.get("edge_type");
    let src_node_id: String = row.get("src_node_id");
    let edge_type: EdgeType = edge_type
        .parse()
        .map_err(|e: String| GraphError::storage(Stage::Query, src_node_id.as_str(), e))?;
    Ok(Edge {
        edge_type,
        src_node_id,
        dst_node_id: row.get("dst_node_id"),
    })
}

async fn fetch_document_nodes(conn: &mut SqliteConnection, doc_id: &str) -> Result<Vec<Node>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM nodes n WHERE n.doc_id = ? ORDER BY n.order_index",
        NODE_COLUMNS
    ))
    .bind(doc_id)
    .fetch_all(&mut *conn)
    .await
    .stage(Stage::Query, doc_id)?;
    rows.iter().map(node_from_row).collect()
}

async fn root_of(conn: &mut SqliteConnection, doc_id: &str) -> Result<Option<String>> {
    sqlx::query_scalar("SELECT node_id FROM nodes WHERE doc_id = ? AND kind = 'root'")
        .bind(doc_id)
        .fetch_optional(&mut *conn)
        .await
        .stage(Stage::Query, doc_id)
}

async fn doc_id_for_path(conn: &mut SqliteConnection, path: &str) -> Result<Option<String>> {
    sqlx::query_scalar("SELECT doc_id FROM documents WHERE source_path = ?")
        .bind(path)
        .fetch_optional(&mut *conn)
        .await
        .stage(Stage::Query, path)
}

async fn heading_in(conn: &mut SqliteConnection, doc_id: &str, fragment: &str) -> Result<Option<String>> {
    let nodes = fetch_document_nodes(conn, doc_id).await?;
    Ok(refs::heading_for_fragment(&nodes, fragment).map(|n| n.node_id.clone()))
}

async fn lookup(conn: &mut SqliteConnection, lookup: &Lookup, src_path: &str) -> Result<Option<String>> {
    match lookup {
        Lookup::NodeId(id) => sqlx::query_scalar("SELECT node_id FROM nodes WHERE node_id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .stage(Stage::Query, id),
        Lookup::DocId(id) => root_of(conn, id).await,
        Lookup::ShortId(short) => {
            let hits: Vec<String> =
                sqlx::query_scalar("SELECT node_id FROM nodes WHERE short_id = ? LIMIT 2")
                    .bind(short)
                    .fetch_all(&mut *conn)
                    .await
                    .stage(Stage::Query, short)?;
            Ok(match hits.as_slice() {
                [only] => Some(only.clone()),
                _ => None,
            })
        }
        Lookup::Path { path, fragment } => {
            let Some(doc_id) = doc_id_for_path(conn, path).await? else {
                return Ok(None);
            };
            match fragment {
                Some(f) => heading_in(conn, &doc_id, f).await,
                None => root_of(conn, &doc_id).await,
            }
        }
        Lookup::Fragment(f) => match doc_id_for_path(conn, src_path).await? {
            Some(doc_id) => heading_in(conn, &doc_id, f).await,
            None => Ok(None),
        },
    }
}

async fn resolve_target(conn: &mut SqliteConnection, src_path: &str, target: &str) -> Result<Option<String>> {
    for candidate in refs::lookups(src_path, target) {
        if let Some(node_id) = lookup(conn, &candidate, src_path).await? {
            return Ok(Some(node_id));
        }
    }
    Ok(None)
}

/// Retry unresolved references. Returns how many resolved.
async fn resolve_pending(conn: &mut SqliteConnection) -> Result<usize> {
    let rows = sqlx::query(
        r#"
        SELECT e.edge_id, e.target, d.source_path
        FROM edges e
        JOIN nodes n ON n.node_id = e.src_node_id
        JOIN documents d ON d.doc_id = n.doc_id
        WHERE e.edge_type = 'reference' AND e.dst_node_id IS NULL AND e.target IS NOT NULL
        ORDER BY e.edge_id
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .stage(Stage::Ingest, "edges")?;

    let mut resolved = 0;
    for row in rows {
        let edge_id: i64 = row.get("edge_id");
        let target: String = row.get("target");
        let src_path: String = row.get("source_path");
        if let Some(dst) = resolve_target(conn, &src_path, &target).await? {
            sqlx::query("UPDATE edges SET dst_node_id = ? WHERE edge_id = ?")
                .bind(&dst)
                .bind(edge_id)
                .execute(&mut *conn)
                .await
                .stage(Stage::Ingest, &target)?;
            resolved += 1;
        }
    }
    if resolved > 0 {
        debug!(resolved, "resolved pending references");
    }
    Ok(resolved)
}

async fn bump_revision(conn: &mut SqliteConnection, model_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO embedding_revisions (model_id, revision) VALUES (?, 1)
        ON CONFLICT(model_id) DO UPDATE SET revision = revision + 1
        "#,
    )
    .bind(model_id)
    .execute(&mut *conn)
    .await
    .stage(Stage::Embed, model_id)?;
    Ok(())
}

/// Remove nodes with everything hanging off them. Returns the number of
/// embeddings deleted and the models they belonged to.
async fn drop_nodes(conn: &mut SqliteConnection, ids: &[String]) -> Result<(usize, BTreeSet<String>)> {
    let mut removed = 0;
    let mut touched = BTreeSet::new();
    for id in ids {
        sqlx::query("DELETE FROM edges WHERE src_node_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .stage(Stage::Ingest, id)?;
        sqlx::query("UPDATE edges SET dst_node_id = NULL WHERE edge_type = 'reference' AND dst_node_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .stage(Stage::Ingest, id)?;
        sqlx::query("DELETE FROM tags WHERE target_kind = 'node' AND target_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .stage(Stage::Ingest, id)?;

        let models: Vec<String> = sqlx::query_scalar("SELECT model_id FROM embeddings WHERE node_id = ?")
            .bind(id)
            .fetch_all(&mut *conn)
            .await
            .stage(Stage::Ingest, id)?;
        if !models.is_empty() {
            sqlx::query("DELETE FROM embeddings WHERE node_id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await
                .stage(Stage::Ingest, id)?;
            removed += models.len();
            touched.extend(models);
        }

        sqlx::query("DELETE FROM nodes_fts WHERE node_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .stage(Stage::Ingest, id)?;
        sqlx::query("DELETE FROM nodes WHERE node_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .stage(Stage::Ingest, id)?;
    }
    Ok((removed, touched))
}

async fn apply_ingest(
    conn: &mut SqliteConnection,
    shredded: &ShreddedDocument,
    previous_doc_id: Option<&str>,
) -> Result<IngestReport> {
    let doc = &shredded.document;
    let path = doc.source_path.as_str();

    let old: HashMap<String, String> = match previous_doc_id {
        Some(doc_id) => sqlx::query("SELECT node_id, content_hash FROM nodes WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_all(&mut *conn)
            .await
            .stage(Stage::Ingest, path)?
            .iter()
            .map(|row| (row.get("node_id"), row.get("content_hash")))
            .collect(),
        None => HashMap::new(),
    };
    let diff = diff_nodes(&old, &shredded.nodes);

    // Outgoing edges of every old node go; rows for surviving ids are
    // rewritten below. Only vanished ids lose tags and embeddings.
    let (embeddings_removed, mut touched) = drop_nodes(conn, &diff.vanished).await?;
    if let Some(doc_id) = previous_doc_id {
        sqlx::query(
            "DELETE FROM edges WHERE src_node_id IN (SELECT node_id FROM nodes WHERE doc_id = ?)",
        )
        .bind(doc_id)
        .execute(&mut *conn)
        .await
        .stage(Stage::Ingest, path)?;
        sqlx::query(
            "DELETE FROM nodes_fts WHERE node_id IN (SELECT node_id FROM nodes WHERE doc_id = ?)",
        )
        .bind(doc_id)
        .execute(&mut *conn)
        .await
        .stage(Stage::Ingest, path)?;
        sqlx::query("DELETE FROM nodes WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *conn)
            .await
            .stage(Stage::Ingest, path)?;
        sqlx::query("DELETE FROM documents WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *conn)
            .await
            .stage(Stage::Ingest, path)?;
    }

    sqlx::query(
        "INSERT INTO documents (doc_id, source_path, content_hash, title, raw_text) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&doc.doc_id)
    .bind(&doc.source_path)
    .bind(&doc.content_hash)
    .bind(&doc.title)
    .bind(&doc.raw_text)
    .execute(&mut *conn)
    .await
    .stage(Stage::Ingest, path)?;

    for shredded_node in &shredded.nodes {
        let n = &shredded_node.node;
        sqlx::query(
            r#"
            INSERT INTO nodes (node_id, doc_id, kind, level, order_index, raw_content, short_id, content_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&n.node_id)
        .bind(&n.doc_id)
        .bind(n.kind.as_str())
        .bind(n.level.map(i64::from))
        .bind(n.order_index)
        .bind(&n.raw_content)
        .bind(&n.short_id)
        .bind(&n.content_hash)
        .execute(&mut *conn)
        .await
        .stage(Stage::Ingest, path)?;

        sqlx::query("INSERT INTO nodes_fts (node_id, raw_content) VALUES (?, ?)")
            .bind(&n.node_id)
            .bind(&n.raw_content)
            .execute(&mut *conn)
            .await
            .stage(Stage::Ingest, path)?;
    }

    let embedding_rows = sqlx::query(
        r#"
        SELECT e.model_id, e.node_id, e.stale,
               e.content_hash != n.content_hash AS changed
        FROM embeddings e
        JOIN nodes n ON n.node_id = e.node_id
        WHERE n.doc_id = ?
        "#,
    )
    .bind(&doc.doc_id)
    .fetch_all(&mut *conn)
    .await
    .stage(Stage::Ingest, path)?;

    let mut embeddings_stale = 0;
    for row in embedding_rows {
        let model_id: String = row.get("model_id");
        let node_id: String = row.get("node_id");
        let was_stale = row.get::<i64, _>("stale") != 0;
        let stale = row.get::<i64, _>("changed") != 0;
        if stale != was_stale {
            sqlx::query("UPDATE embeddings SET stale = ? WHERE model_id = ? AND node_id = ?")
                .bind(stale)
                .bind(&model_id)
                .bind(&node_id)
                .execute(&mut *conn)
                .await
                .stage(Stage::Ingest, path)?;
            if stale {
                embeddings_stale += 1;
            }
            touched.insert(model_id);
        }
    }

    let parent_edges = shredded.parent_child_edges();
    let edges = parent_edges.len();
    for e in &parent_edges {
        sqlx::query(
            "INSERT INTO edges (edge_type, src_node_id, dst_node_id, target) VALUES (?, ?, ?, NULL)",
        )
        .bind(EdgeType::ParentChild.as_str())
        .bind(&e.src_node_id)
        .bind(&e.dst_node_id)
        .execute(&mut *conn)
        .await
        .stage(Stage::Ingest, path)?;
    }

    let mut seen = HashSet::new();
    let (mut resolved, mut unresolved) = (0, 0);
    for r in &shredded.references {
        let src = &shredded.nodes[r.src].node.node_id;
        if !seen.insert((src.as_str(), r.target.as_str())) {
            continue;
        }
        let dst = resolve_target(conn, path, &r.target).await?;
        if dst.is_some() {
            resolved += 1;
        } else {
            unresolved += 1;
        }
        sqlx::query(
            "INSERT INTO edges (edge_type, src_node_id, dst_node_id, target) VALUES (?, ?, ?, ?)",
        )
        .bind(EdgeType::Reference.as_str())
        .bind(src)
        .bind(dst)
        .bind(&r.target)
        .execute(&mut *conn)
        .await
        .stage(Stage::Ingest, path)?;
    }
    resolve_pending(conn).await?;

    for model_id in &touched {
        bump_revision(conn, model_id).await?;
    }

    Ok(IngestReport {
        doc_id: doc.doc_id.clone(),
        source_path: doc.source_path.clone(),
        outcome: if previous_doc_id.is_some() {
            IngestOutcome::Replaced
        } else {
            IngestOutcome::Created
        },
        nodes: shredded.nodes.len(),
        edges: edges + resolved,
        references_resolved: resolved,
        references_unresolved: unresolved,
        embeddings_stale,
        embeddings_removed,
    })
}

/// Stream over one read transaction, paged by node id.
struct SqliteEmbeddingStream {
    tx: Option<Transaction<'static, Sqlite>>,
    model_id: String,
    filters: Filters,
    batch_size: usize,
    cursor: String,
}

impl SqliteEmbeddingStream {
    async fn finish(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await.stage(Stage::Query, &self.model_id)?;
        }
        Ok(())
    }
}

#[async_trait]
impl EmbeddingStream for SqliteEmbeddingStream {
    async fn next_batch(&mut self) -> Result<Option<Vec<Embedding>>> {
        let Some(tx) = self.tx.as_mut() else {
            return Ok(None);
        };

        let sql = format!(
            r#"
            SELECT e.node_id, e.vector
            FROM embeddings e
            JOIN nodes n ON n.node_id = e.node_id
            JOIN documents d ON d.doc_id = n.doc_id
            WHERE e.model_id = ? AND e.stale = 0 AND e.node_id > ?
            {}
            ORDER BY e.node_id
            LIMIT ?
            "#,
            FILTER_SQL
        );
        let query = sqlx::query(&sql).bind(&self.model_id).bind(&self.cursor);
        let rows = bind_filters(query, &self.filters)
            .bind(self.batch_size as i64)
            .fetch_all(&mut **tx)
            .await
            .stage(Stage::Query, &self.model_id)?;

        let batch: Vec<Embedding> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                Embedding {
                    node_id: row.get("node_id"),
                    model_id: self.model_id.clone(),
                    vector: blob_to_vec(&blob),
                }
            })
            .collect();

        if batch.len() < self.batch_size {
            self.finish().await?;
        }
        match batch.last() {
            Some(last) => {
                self.cursor = last.node_id.clone();
                Ok(Some(batch))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl EmbeddingStore for SqliteStore {
    async fn embedding_dimensions(&self, model_id: &str) -> Result<Option<usize>> {
        let dims: Option<i64> =
            sqlx::query_scalar("SELECT dimensions FROM embeddings WHERE model_id = ? LIMIT 1")
                .bind(model_id)
                .fetch_optional(&self.pool)
                .await
                .stage(Stage::Query, model_id)?;
        Ok(dims.map(|d| d as usize))
    }

    async fn embedding_revision(&self, model_id: &str) -> Result<u64> {
        let revision: Option<i64> =
            sqlx::query_scalar("SELECT revision FROM embedding_revisions WHERE model_id = ?")
                .bind(model_id)
                .fetch_optional(&self.pool)
                .await
                .stage(Stage::Query, model_id)?;
        Ok(revision.unwrap_or(0) as u64)
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
        let tx = self.pool.begin().await.stage(Stage::Query, model_id)?;
        Ok(Box::new(SqliteEmbeddingStream {
            tx: Some(tx),
            model_id: model_id.to_string(),
            filters: filters.clone(),
            batch_size,
            cursor: String::new(),
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
impl TextStore for SqliteStore {
    async fn fts_search(
        &self,
        query: &FtsQuery,
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<ScoredNode>> {
        let match_expr = query.to_fts5();
        let sql = format!(
            r#"
            SELECT n.node_id, -bm25(nodes_fts) AS score
            FROM nodes_fts
            JOIN nodes n ON n.node_id = nodes_fts.node_id
            JOIN documents d ON d.doc_id = n.doc_id
            WHERE nodes_fts MATCH ?
            {}
            ORDER BY score DESC, n.node_id ASC
            LIMIT ?
            "#,
            FILTER_SQL
        );
        let rows = bind_filters(sqlx::query(&sql).bind(&match_expr), filters)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .stage(Stage::Query, &match_expr)?;

        debug!(query = %match_expr, hits = rows.len(), "fts search");
        Ok(rows
            .iter()
            .map(|row| ScoredNode {
                node_id: row.get("node_id"),
                score: row.get("score"),
            })
            .collect())
    }
}

#[async_trait]
impl GraphStore for SqliteStore {
    async fn get_node(&self, node_id: &str) -> Result<Node> {
        let row = sqlx::query(&format!("SELECT {} FROM nodes n WHERE n.node_id = ?", NODE_COLUMNS))
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await
            .stage(Stage::Query, node_id)?;
        match row {
            Some(row) => node_from_row(&row),
            None => Err(GraphError::not_found("node", node_id)),
        }
    }

    async fn get_node_by_short_id(&self, short_id: &str) -> Result<Node> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM nodes n WHERE n.short_id = ? ORDER BY n.node_id",
            NODE_COLUMNS
        ))
        .bind(short_id)
        .fetch_all(&self.pool)
        .await
        .stage(Stage::Query, short_id)?;
        match rows.as_slice() {
            [] => Err(GraphError::not_found("node", short_id)),
            [only] => node_from_row(only),
            many => Err(GraphError::InvalidArgument(format!(
                "short id '{}' is ambiguous ({} nodes)",
                short_id,
                many.len()
            ))),
        }
    }

    async fn get_document(&self, doc_id: &str) -> Result<Document> {
        let row = sqlx::query(
            "SELECT doc_id, source_path, content_hash, title, raw_text FROM documents WHERE doc_id = ?",
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await
        .stage(Stage::Query, doc_id)?;
        row.map(|r| document_from_row(&r))
            .ok_or_else(|| GraphError::not_found("document", doc_id))
    }

    async fn document_by_path(&self, source_path: &str) -> Result<Option<Document>> {
        let path = normalize_path(source_path)?;
        let row = sqlx::query(
            "SELECT doc_id, source_path, content_hash, title, raw_text FROM documents WHERE source_path = ?",
        )
        .bind(&path)
        .fetch_optional(&self.pool)
        .await
        .stage(Stage::Query, &path)?;
        Ok(row.map(|r| document_from_row(&r)))
    }

    async fn list_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT doc_id, source_path, content_hash, title, raw_text FROM documents ORDER BY source_path",
        )
        .fetch_all(&self.pool)
        .await
        .stage(Stage::Query, "documents")?;
        Ok(rows.iter().map(document_from_row).collect())
    }

    async fn document_nodes(&self, doc_id: &str) -> Result<Vec<Node>> {
        let mut conn = self.pool.acquire().await.stage(Stage::Query, doc_id)?;
        fetch_document_nodes(&mut conn, doc_id).await
    }

    async fn document_edges(&self, doc_id: &str) -> Result<Vec<Edge>> {
        let rows = sqlx::query(
            r#"
            SELECT e.edge_type, e.src_node_id, e.dst_node_id
            FROM edges e
            JOIN nodes n ON n.node_id = e.src_node_id
            WHERE n.doc_id = ? AND e.dst_node_id IS NOT NULL
            ORDER BY e.edge_id
            "#,
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await
        .stage(Stage::Query, doc_id)?;
        rows.iter().map(edge_from_row).collect()
    }

    async fn edges_from(&self, node_id: &str) -> Result<Vec<Edge>> {
        let rows = sqlx::query(
            r#"
            SELECT edge_type, src_node_id, dst_node_id
            FROM edges
            WHERE src_node_id = ? AND dst_node_id IS NOT NULL
            ORDER BY edge_id
            "#,
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await
        .stage(Stage::Query, node_id)?;
        rows.iter().map(edge_from_row).collect()
    }

    async fn filtered_node_ids(&self, doc_id: &str, filters: &Filters) -> Result<HashSet<String>> {
        let sql = format!(
            r#"
            SELECT n.node_id
            FROM nodes n
            JOIN documents d ON d.doc_id = n.doc_id
            WHERE n.doc_id = ?
            {}
            "#,
            FILTER_SQL
        );
        let rows = bind_filters(sqlx::query(&sql).bind(doc_id), filters)
            .fetch_all(&self.pool)
            .await
            .stage(Stage::Query, doc_id)?;
        Ok(rows.iter().map(|row| row.get("node_id")).collect())
    }
}

/// Storage key for a tag target: document tags are kept by source path.
async fn tag_row(
    conn: &mut SqliteConnection,
    name: &str,
    target: &TagTarget,
) -> Result<(&'static str, String)> {
    if name.trim().is_empty() {
        return Err(GraphError::InvalidArgument("tag name is empty".into()));
    }
    match target {
        TagTarget::Document(doc_id) => {
            let path: Option<String> =
                sqlx::query_scalar("SELECT source_path FROM documents WHERE doc_id = ?")
                    .bind(doc_id)
                    .fetch_optional(&mut *conn)
                    .await
                    .stage(Stage::Query, doc_id)?;
            let path = path.ok_or_else(|| GraphError::not_found("document", doc_id.as_str()))?;
            Ok(("document", path))
        }
        TagTarget::Node(node_id) => {
            let exists: Option<String> =
                sqlx::query_scalar("SELECT node_id FROM nodes WHERE node_id = ?")
                    .bind(node_id)
                    .fetch_optional(&mut *conn)
                    .await
                    .stage(Stage::Query, node_id)?;
            if exists.is_none() {
                return Err(GraphError::not_found("node", node_id.as_str()));
            }
            Ok(("node", node_id.clone()))
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn ingest(&self, source_path: &str, bytes: &[u8]) -> Result<IngestReport> {
        let shredded = shred(source_path, bytes)?;
        self.ingest_shredded(shredded).await
    }

    async fn remove_document(&self, source_path: &str) -> Result<bool> {
        let path = normalize_path(source_path)?;
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.stage(Stage::Ingest, &path)?;

        let Some(doc_id) = doc_id_for_path(&mut tx, &path).await? else {
            return Ok(false);
        };
        let ids: Vec<String> = sqlx::query_scalar("SELECT node_id FROM nodes WHERE doc_id = ?")
            .bind(&doc_id)
            .fetch_all(&mut *tx)
            .await
            .stage(Stage::Ingest, &path)?;

        let (_, touched) = drop_nodes(&mut tx, &ids).await?;
        sqlx::query("DELETE FROM documents WHERE doc_id = ?")
            .bind(&doc_id)
            .execute(&mut *tx)
            .await
            .stage(Stage::Ingest, &path)?;
        sqlx::query("DELETE FROM tags WHERE target_kind = 'document' AND target_id = ?")
            .bind(&path)
            .execute(&mut *tx)
            .await
            .stage(Stage::Ingest, &path)?;
        for model_id in &touched {
            bump_revision(&mut tx, model_id).await?;
        }
        tx.commit().await.stage(Stage::Ingest, &path)?;

        info!(path = %path, nodes = ids.len(), "removed document");
        Ok(true)
    }

    async fn upsert_embedding(&self, embedding: &Embedding) -> Result<()> {
        validate_vector(&embedding.model_id, &embedding.vector)?;
        let _guard = self.write_lock.lock().await;
        let node_id = embedding.node_id.as_str();
        let mut tx = self.pool.begin().await.stage(Stage::Embed, node_id)?;

        let content_hash: Option<String> =
            sqlx::query_scalar("SELECT content_hash FROM nodes WHERE node_id = ?")
                .bind(node_id)
                .fetch_optional(&mut *tx)
                .await
                .stage(Stage::Embed, node_id)?;
        let content_hash = content_hash.ok_or_else(|| GraphError::not_found("node", node_id))?;

        let expected: Option<i64> =
            sqlx::query_scalar("SELECT dimensions FROM embeddings WHERE model_id = ? LIMIT 1")
                .bind(&embedding.model_id)
                .fetch_optional(&mut *tx)
                .await
                .stage(Stage::Embed, node_id)?;
        if let Some(expected) = expected {
            if expected as usize != embedding.vector.len() {
                return Err(GraphError::DimensionMismatch {
                    model_id: embedding.model_id.clone(),
                    expected: expected as usize,
                    actual: embedding.vector.len(),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO embeddings (model_id, node_id, dimensions, vector, content_hash, stale, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            ON CONFLICT(model_id, node_id) DO UPDATE SET
                dimensions = excluded.dimensions,
                vector = excluded.vector,
                content_hash = excluded.content_hash,
                stale = 0,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&embedding.model_id)
        .bind(node_id)
        .bind(embedding.dimensions() as i64)
        .bind(vec_to_blob(&embedding.vector))
        .bind(&content_hash)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .stage(Stage::Embed, node_id)?;

        bump_revision(&mut tx, &embedding.model_id).await?;
        tx.commit().await.stage(Stage::Embed, node_id)?;
        debug!(node_id, model = %embedding.model_id, "stored embedding");
        Ok(())
    }

    async fn pending_embeddings(&self, model_id: &str, limit: usize) -> Result<Vec<Node>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM nodes n
            LEFT JOIN embeddings e ON e.node_id = n.node_id AND e.model_id = ?
            WHERE e.node_id IS NULL OR e.stale = 1
            ORDER BY n.node_id
            LIMIT ?
            "#,
            NODE_COLUMNS
        ))
        .bind(model_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .stage(Stage::Embed, model_id)?;
        rows.iter().map(node_from_row).collect()
    }

    async fn tag(&self, kind: TagKind, name: &str, target: &TagTarget) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.pool.acquire().await.stage(Stage::Ingest, name)?;
        let (target_kind, target_id) = tag_row(&mut conn, name, target).await?;
        sqlx::query(
            "INSERT OR IGNORE INTO tags (kind, name, target_kind, target_id) VALUES (?, ?, ?, ?)",
        )
        .bind(kind.as_str())
        .bind(name.trim())
        .bind(target_kind)
        .bind(&target_id)
        .execute(&mut *conn)
        .await
        .stage(Stage::Ingest, name)?;
        Ok(())
    }

    async fn untag(&self, kind: TagKind, name: &str, target: &TagTarget) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.pool.acquire().await.stage(Stage::Ingest, name)?;
        let (target_kind, target_id) = tag_row(&mut conn, name, target).await?;
        let result = sqlx::query(
            "DELETE FROM tags WHERE kind = ? AND name = ? AND target_kind = ? AND target_id = ?",
        )
        .bind(kind.as_str())
        .bind(name.trim())
        .bind(target_kind)
        .bind(&target_id)
        .execute(&mut *conn)
        .await
        .stage(Stage::Ingest, name)?;
        Ok(result.rows_affected() > 0)
    }

    async fn resolve_references(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.stage(Stage::Ingest, "edges")?;
        let resolved = resolve_pending(&mut tx).await?;
        tx.commit().await.stage(Stage::Ingest, "edges")?;
        Ok(resolved)
    }
}

/// Counters for `dg stats`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreCounts {
    pub documents: i64,
    pub nodes: i64,
    pub edges: i64,
    pub unresolved_references: i64,
    pub tags: i64,
    pub models: Vec<ModelCounts>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelCounts {
    pub model_id: String,
    pub dimensions: i64,
    pub fresh: i64,
    pub stale: i64,
    pub revision: i64,
    pub last_write: Option<i64>,
}

async fn count_rows(pool: &SqlitePool, sql: &str) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(sql)
        .fetch_one(pool)
        .await
        .stage(Stage::Query, "stats")
}

impl SqliteStore {
    pub async fn counts(&self) -> Result<StoreCounts> {
        let pool = &self.pool;
        let rows = sqlx::query(
            r#"
            SELECT e.model_id,
                   MAX(e.dimensions) AS dimensions,
                   SUM(CASE WHEN e.stale = 0 THEN 1 ELSE 0 END) AS fresh,
                   SUM(CASE WHEN e.stale = 1 THEN 1 ELSE 0 END) AS stale,
                   COALESCE(MAX(r.revision), 0) AS revision,
                   MAX(e.updated_at) AS last_write
            FROM embeddings e
            LEFT JOIN embedding_revisions r ON r.model_id = e.model_id
            GROUP BY e.model_id
            ORDER BY e.model_id
            "#,
        )
        .fetch_all(pool)
        .await
        .stage(Stage::Query, "stats")?;

        Ok(StoreCounts {
            documents: count_rows(pool, "SELECT COUNT(*) FROM documents").await?,
            nodes: count_rows(pool, "SELECT COUNT(*) FROM nodes").await?,
            edges: count_rows(pool, "SELECT COUNT(*) FROM edges WHERE dst_node_id IS NOT NULL").await?,
            unresolved_references: count_rows(
                pool,
                "SELECT COUNT(*) FROM edges WHERE edge_type = 'reference' AND dst_node_id IS NULL",
            )
            .await?,
            tags: count_rows(pool, "SELECT COUNT(*) FROM tags").await?,
            models: rows
                .iter()
                .map(|row| ModelCounts {
                    model_id: row.get("model_id"),
                    dimensions: row.get("dimensions"),
                    fresh: row.get("fresh"),
                    stale: row.get("stale"),
                    revision: row.get("revision"),
                    last_write: row.get("last_write"),
                })
                .collect(),
        })
    }
}
