//! Configuration parsing and validation.
//!
//! docgraph is configured via a TOML file (default: `config/dg.toml`).
//! Every section except `[db]` is optional and falls back to defaults.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/docgraph.sqlite"
//!
//! [search]
//! k = 10
//! batch_size = 1000
//! preview_chars = 240
//!
//! [index]
//! kind = "flat"        # "none", "flat" or "hnsw"
//!
//! [logging]
//! filter = "docgraph=debug"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// SQLite file. Parent directories are created on connect.
    pub path: PathBuf,
}

/// Query defaults, overridable per command.
#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Results returned by `dg search`.
    #[serde(default = "default_k")]
    pub k: i64,
    /// Embeddings per batch when streaming.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    /// Node count listed by `dg embed pending`.
    #[serde(default = "default_pending_limit")]
    pub pending_limit: usize,
    /// Characters of node text returned with each hit.
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            batch_size: default_batch_size(),
            pending_limit: default_pending_limit(),
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_k() -> i64 {
    10
}
fn default_batch_size() -> i64 {
    docgraph_core::semantic::DEFAULT_BATCH_SIZE
}
fn default_pending_limit() -> usize {
    100
}
fn default_preview_chars() -> usize {
    docgraph_core::search::PREVIEW_CHARS
}

/// Which vector index, if any, is built before semantic queries.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    #[default]
    None,
    Flat,
    Hnsw,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IndexConfig {
    #[serde(default)]
    pub kind: IndexKind,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives. `RUST_LOG` wins when set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "docgraph=info,docgraph_core=info".to_string()
}

impl Config {
    /// Configuration with only a database path, used by tests and tools
    /// that open a store directly.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            search: SearchConfig::default(),
            index: IndexConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.db.path.as_os_str().is_empty() {
        anyhow::bail!("db.path must not be empty");
    }

    if config.search.k < 1 {
        anyhow::bail!("search.k must be >= 1");
    }

    if config.search.batch_size < 1 {
        anyhow::bail!("search.batch_size must be >= 1");
    }

    if config.search.preview_chars == 0 {
        anyhow::bail!("search.preview_chars must be > 0");
    }

    if config.index.kind == IndexKind::Hnsw && !cfg!(feature = "hnsw") {
        anyhow::bail!("index.kind = \"hnsw\" requires building with the `hnsw` feature");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let file = write_config("[db]\npath = \"data/dg.sqlite\"\n");
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.search.k, 10);
        assert_eq!(cfg.search.batch_size, 1000);
        assert_eq!(cfg.search.preview_chars, 240);
        assert_eq!(cfg.index.kind, IndexKind::None);
        assert!(cfg.logging.filter.contains("docgraph=info"));
    }

    #[test]
    fn test_rejects_zero_k_and_batch() {
        let file = write_config("[db]\npath = \"x.sqlite\"\n\n[search]\nk = 0\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("search.k"));

        let file = write_config("[db]\npath = \"x.sqlite\"\n\n[search]\nbatch_size = 0\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("search.batch_size"));
    }

    #[test]
    fn test_rejects_unknown_index_kind() {
        let file = write_config("[db]\npath = \"x.sqlite\"\n\n[index]\nkind = \"ivf\"\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_flat_index_kind() {
        let file = write_config("[db]\npath = \"x.sqlite\"\n\n[index]\nkind = \"flat\"\n");
        assert_eq!(load_config(file.path()).unwrap().index.kind, IndexKind::Flat);
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = load_config(Path::new("/nonexistent/dg.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/dg.toml"));
    }
}
