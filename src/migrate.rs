//! Database schema migrations.
//!
//! Creates all tables and indexes. Idempotent: running it against an
//! existing database of the same schema version is a no-op. A database
//! written by a newer docgraph (higher `schema_version` in `schema_meta`)
//! is rejected rather than modified.
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `schema_meta` | Key/value pairs, holds `schema_version` |
//! | `documents` | One row per source path, keyed by `doc_id` |
//! | `nodes` | Content nodes, keyed by `node_id` |
//! | `edges` | Parent-child and reference edges; unresolved references have a NULL `dst_node_id` |
//! | `nodes_fts` | FTS5 index over node content |
//! | `embeddings` | One vector per `(model_id, node_id)` with staleness flag |
//! | `embedding_revisions` | Per-model write counter used to invalidate vector indexes |
//! | `tags` | Collection/topic tags on documents (by path) or nodes |

use anyhow::Result;
use sqlx::SqlitePool;

use docgraph_core::{GraphError, Stage};

use crate::config::Config;
use crate::db;

/// Schema version written by this build.
pub const SCHEMA_VERSION: i64 = 1;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS schema_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        doc_id TEXT PRIMARY KEY,
        source_path TEXT NOT NULL UNIQUE,
        content_hash TEXT NOT NULL,
        title TEXT,
        raw_text TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        node_id TEXT PRIMARY KEY,
        doc_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        level INTEGER,
        order_index INTEGER NOT NULL,
        raw_content TEXT NOT NULL,
        short_id TEXT NOT NULL,
        content_hash TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS edges (
        edge_id INTEGER PRIMARY KEY AUTOINCREMENT,
        edge_type TEXT NOT NULL,
        src_node_id TEXT NOT NULL,
        dst_node_id TEXT,
        target TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embeddings (
        model_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        dimensions INTEGER NOT NULL,
        vector BLOB NOT NULL,
        content_hash TEXT NOT NULL,
        stale INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (model_id, node_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embedding_revisions (
        model_id TEXT PRIMARY KEY,
        revision INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        target_kind TEXT NOT NULL,
        target_id TEXT NOT NULL,
        PRIMARY KEY (kind, name, target_kind, target_id)
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_nodes_doc_id ON nodes(doc_id, order_index)",
    "CREATE INDEX IF NOT EXISTS idx_nodes_short_id ON nodes(short_id)",
    "CREATE INDEX IF NOT EXISTS idx_edges_src ON edges(src_node_id)",
    "CREATE INDEX IF NOT EXISTS idx_edges_dst ON edges(dst_node_id)",
    "CREATE INDEX IF NOT EXISTS idx_embeddings_node ON embeddings(node_id)",
    "CREATE INDEX IF NOT EXISTS idx_tags_target ON tags(target_kind, target_id)",
];

/// Run migrations against the configured database.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = migrate_pool(&pool).await;
    pool.close().await;
    result?;
    Ok(())
}

/// Run migrations on an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> docgraph_core::Result<()> {
    let schema_err = |e: sqlx::Error| GraphError::storage(Stage::Schema, "schema", e);

    for ddl in TABLES {
        sqlx::query(ddl).execute(pool).await.map_err(schema_err)?;
    }

    let stored: Option<String> =
        sqlx::query_scalar("SELECT value FROM schema_meta WHERE key = 'schema_version'")
            .fetch_optional(pool)
            .await
            .map_err(schema_err)?;

    if let Some(raw) = stored {
        let version: i64 = raw.parse().map_err(|_| {
            GraphError::storage(
                Stage::Schema,
                "schema_meta",
                format!("unreadable schema_version '{}'", raw),
            )
        })?;
        if version > SCHEMA_VERSION {
            return Err(GraphError::storage(
                Stage::Schema,
                "schema_meta",
                format!(
                    "database schema version {} is newer than supported version {}",
                    version, SCHEMA_VERSION
                ),
            ));
        }
    }

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='nodes_fts'",
    )
    .fetch_one(pool)
    .await
    .map_err(schema_err)?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE nodes_fts USING fts5(
                node_id UNINDEXED,
                raw_content,
                tokenize = 'unicode61 remove_diacritics 0'
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(schema_err)?;
    }

    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await.map_err(schema_err)?;
    }

    sqlx::query(
        r#"
        INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(SCHEMA_VERSION.to_string())
    .execute(pool)
    .await
    .map_err(schema_err)?;

    Ok(())
}
