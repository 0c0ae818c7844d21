//! # docgraph core
//!
//! Pure logic for docgraph: identifiers, the markdown shredder, data
//! models, store traits with an in-memory implementation, and the
//! full-text and semantic search engines.
//!
//! This crate contains no database driver, async runtime or filesystem
//! I/O. The `docgraph` application crate provides the SQLite store and
//! the command-line front end.

pub mod embedding;
pub mod error;
pub mod fts;
pub mod ids;
pub mod models;
pub mod outline;
pub mod refs;
pub mod search;
pub mod semantic;
pub mod shred;
pub mod store;
pub mod topk;
pub mod vector_index;

pub use error::{GraphError, Result, Stage};
