//! # docgraph CLI (`dg`)
//!
//! The `dg` binary is the command-line front end for docgraph. It
//! provides commands for database initialization, ingesting markdown
//! files, full-text and semantic search, node and outline retrieval,
//! tagging, and embedding import.
//!
//! ## Usage
//!
//! ```bash
//! dg --config ./config/dg.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dg init` | Create the SQLite database and run schema migrations |
//! | `dg ingest <files..>` | Shred and store markdown files |
//! | `dg remove <path>` | Delete a document and everything derived from it |
//! | `dg resolve` | Retry unresolved references |
//! | `dg search "<query>"` | Full-text or semantic search |
//! | `dg get <node>` | Show one node by id or short id |
//! | `dg outline <doc>` | Print a document's node tree |
//! | `dg tag <kind> <name>` | Tag a document or node |
//! | `dg embed import <file>` | Store embeddings from JSONL |
//! | `dg embed pending` | List nodes lacking a fresh embedding |
//! | `dg stats` | Database overview |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! dg init
//!
//! # Ingest files, storing paths relative to ./notes
//! dg ingest --root ./notes ./notes/*.md
//!
//! # Full-text search restricted to a collection
//! dg search "deploy AND (linux OR mac*)" --collection ops
//!
//! # Semantic search with an externally computed query vector
//! dg search --mode semantic --model mini --vector 0.12,-0.4,0.33
//! ```

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use docgraph::config;
use docgraph::embed_cmd;
use docgraph::get;
use docgraph::ingest;
use docgraph::migrate;
use docgraph::search::{self, SearchOptions};
use docgraph::stats;
use docgraph::tag::{self, TagSubject};
use docgraph_core::models::{Filters, TagKind};

/// docgraph CLI: markdown documents as a searchable graph of nodes.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/dg.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dg",
    about = "docgraph: markdown documents as a searchable graph of nodes",
    version,
    long_about = "docgraph shreds markdown files into addressable nodes linked by structural \
    and reference edges, stores them in SQLite, and answers full-text and semantic queries \
    under a fixed memory bound."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/dg.toml`.
    #[arg(long, global = true, default_value = "./config/dg.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Result filters shared by `search` and `outline`.
#[derive(Args, Debug, Clone, Default)]
struct FilterArgs {
    /// Only nodes in this collection (document or node tag).
    #[arg(long)]
    collection: Option<String>,

    /// Only nodes with this topic (document or node tag).
    #[arg(long)]
    topic: Option<String>,

    /// Only documents whose source path starts with this prefix.
    #[arg(long)]
    scope: Option<String>,
}

impl FilterArgs {
    fn into_filters(self) -> Filters {
        Filters {
            collection: self.collection,
            topic: self.topic,
            scope_path_prefix: self.scope,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all tables. Safe to run
    /// multiple times. Fails if the database was written by a newer
    /// docgraph.
    Init,

    /// Ingest markdown files.
    ///
    /// Each file is shredded into nodes and stored in its own
    /// transaction. Files whose content has not changed are skipped.
    Ingest {
        /// Files to ingest.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Store source paths relative to this directory.
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Remove a document by source path.
    Remove {
        /// Source path as stored at ingest.
        path: String,
    },

    /// Retry resolving references whose targets were missing.
    Resolve,

    /// Search stored nodes.
    ///
    /// `fts` mode takes a query in the full-text syntax: bare terms,
    /// `term*`, `"phrases"`, AND / OR / NOT and parentheses. `semantic`
    /// mode takes a query vector and a model id.
    Search {
        /// Full-text query.
        query: Option<String>,

        /// Search mode: `fts` or `semantic`.
        #[arg(long, default_value = "fts")]
        mode: String,

        /// Query vector for semantic mode, comma separated.
        #[arg(long, allow_hyphen_values = true)]
        vector: Option<String>,

        /// Embedding model id for semantic mode.
        #[arg(long)]
        model: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        k: Option<i64>,

        /// Embeddings per streamed batch.
        #[arg(long)]
        batch_size: Option<i64>,

        /// Semantic strategy: `auto`, `brute-force` or `accelerated`.
        #[arg(long, default_value = "auto")]
        path: String,

        #[command(flatten)]
        filters: FilterArgs,

        /// Print the response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show a node by id or 8-character short id.
    Get {
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// Print a document's node tree.
    Outline {
        /// Doc id or source path.
        doc: String,

        #[command(flatten)]
        filters: FilterArgs,

        #[arg(long)]
        json: bool,
    },

    /// Attach or remove a collection or topic tag.
    Tag {
        /// Tag kind: `collection` or `topic`.
        kind: String,

        /// Tag name.
        name: String,

        /// Tag a document (doc id or source path).
        #[arg(long, conflicts_with = "node", required_unless_present = "node")]
        doc: Option<String>,

        /// Tag a node (id or short id).
        #[arg(long)]
        node: Option<String>,

        /// Remove the tag instead of adding it.
        #[arg(long)]
        remove: bool,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Show database statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },
}

/// Embedding management subcommands.
#[derive(Subcommand)]
enum EmbedAction {
    /// Store embeddings from a JSONL file.
    ///
    /// Each line: `{"node_id": "...", "model_id": "...", "vector": [...]}`.
    Import {
        file: PathBuf,

        /// Model id for records that do not carry one.
        #[arg(long)]
        model: Option<String>,
    },

    /// List nodes that have no fresh embedding for a model.
    Pending {
        #[arg(long)]
        model: String,

        /// Maximum number of nodes to list.
        #[arg(long)]
        limit: Option<usize>,

        /// One JSON object per line, ready for an external embedder.
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(filter))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("docgraph=info"));
    // stdout carries command output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging.filter);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { files, root } => {
            ingest::run_ingest(&cfg, &files, root).await?;
        }
        Commands::Remove { path } => {
            ingest::run_remove(&cfg, &path).await?;
        }
        Commands::Resolve => {
            ingest::run_resolve(&cfg).await?;
        }
        Commands::Search {
            query,
            mode,
            vector,
            model,
            k,
            batch_size,
            path,
            filters,
            json,
        } => {
            let opts = SearchOptions {
                query,
                mode: search::parse_mode(&mode)?,
                vector,
                model,
                k,
                batch_size,
                path: search::parse_path(&path)?,
                filters: filters.into_filters(),
                json,
            };
            search::run_search(&cfg, &opts).await?;
        }
        Commands::Get { id, json } => {
            get::run_get(&cfg, &id, json).await?;
        }
        Commands::Outline { doc, filters, json } => {
            get::run_outline(&cfg, &doc, &filters.into_filters(), json).await?;
        }
        Commands::Tag {
            kind,
            name,
            doc,
            node,
            remove,
        } => {
            let kind: TagKind = kind.parse().map_err(anyhow::Error::msg)?;
            let subject = match (doc, node) {
                (Some(doc), _) => TagSubject::Document(doc),
                (None, Some(node)) => TagSubject::Node(node),
                (None, None) => anyhow::bail!("either --doc or --node is required"),
            };
            tag::run_tag(&cfg, kind, &name, &subject, remove).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Import { file, model } => {
                embed_cmd::run_embed_import(&cfg, &file, model.as_deref()).await?;
            }
            EmbedAction::Pending { model, limit, json } => {
                embed_cmd::run_embed_pending(&cfg, &model, limit, json).await?;
            }
        },
        Commands::Stats { json } => {
            stats::run_stats(&cfg, json).await?;
        }
    }

    Ok(())
}
