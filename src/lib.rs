//! # docgraph
//!
//! Markdown documents as a graph of addressable nodes, stored in SQLite
//! and searchable by exact text or by meaning.
//!
//! The pure logic (identifiers, shredder, search engines, store traits)
//! lives in [`docgraph_core`]. This crate adds the SQLite store, schema
//! migrations, configuration, the optional HNSW index and the `dg`
//! command-line front end.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────────────┐
//! │  files   │──▶│ Shredder │──▶│      SQLite       │
//! │ (paths)  │   │  nodes   │   │ nodes/edges/FTS5  │
//! └──────────┘   └──────────┘   │ embeddings/tags   │
//!                               └────────┬─────────┘
//!        embeddings (JSONL) ─────────────┤
//!                          ┌─────────────┼──────────────┐
//!                          ▼             ▼              ▼
//!                    ┌──────────┐  ┌───────────┐  ┌──────────┐
//!                    │   FTS    │  │ Semantic  │  │ Outline  │
//!                    │  engine  │  │ (stream / │  │          │
//!                    │          │  │  index)   │  │          │
//!                    └──────────┘  └───────────┘  └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dg init                                   # create database
//! dg ingest notes/*.md                      # shred and store files
//! dg search "install AND linux"             # full-text query
//! dg embed pending --model mini --json      # nodes needing vectors
//! dg embed import vectors.jsonl             # store vectors
//! dg search --mode semantic --model mini --vector 0.1,0.2,...
//! dg outline notes/guide.md
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the store traits |
//! | [`ingest`] | `dg ingest` / `dg remove` |
//! | [`search`] | `dg search` |
//! | [`get`] | `dg get` / `dg outline` |
//! | [`tag`] | `dg tag` |
//! | [`embed_cmd`] | `dg embed import` / `dg embed pending` |
//! | [`stats`] | `dg stats` |

pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod get;
#[cfg(feature = "hnsw")]
pub mod hnsw;
pub mod ingest;
pub mod migrate;
pub mod search;
pub mod sqlite_store;
pub mod stats;
pub mod tag;
