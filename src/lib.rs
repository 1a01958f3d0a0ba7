//! # MerlinDB - Learned Log-Structured Key-Value Storage
//!
//! MerlinDB is an embedded, ordered, persistent key-value store that
//! uses a learned model of the key distribution to map keys directly to
//! disk pages. Instead of a multi-level compaction hierarchy it keeps a
//! single on-disk page layer fed by an in-memory write buffer, with
//! per-page overflow chains and asynchronous reorganization.
//!
//! ## Quick Start
//!
//! ```ignore
//! use merlindb::{Database, Options};
//!
//! let db = Database::open(Options::default(), "./mydb")?;
//! db.put(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//! db.flush_memtable(true)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │       Public API (Database)          │
//! ├─────────────────────────────────────┤
//! │ Write buffer │ Flush │ Reorganization│
//! ├──────────────┴───────┴──────────────┤
//! │      Learned model (key → page)      │
//! ├─────────────────────────────────────┤
//! │  Buffer pool (fix/unfix, eviction)   │
//! ├─────────────────────────────────────┤
//! │  Page codec + segment files          │
//! └─────────────────────────────────────┘
//! ```
//!
//! Writes land in an ordered in-memory buffer; when it fills, a flush
//! groups its entries by the learned model's page predictions and
//! applies each batch to the owning overflow chain, deferring batches
//! too small to be worth a page rewrite. Chains that grow past the
//! per-page record target are rewritten in the background into a fresh
//! run of pages, and the model learns the new boundaries.
//!
//! Reads check the buffers first, then follow the model to a chain,
//! revalidating under the chain head's lock because the model is only
//! advisory while reorganizations run concurrently.
//!
//! ## File Layout
//!
//! ```text
//! database_dir/
//! ├── MANIFEST      # geometry + allocation watermark
//! ├── segment-0     # fixed-size page files
//! └── segment-1
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: options, key hints, engine constants
//! - [`storage`]: page codec, segment files, manifest, buffer pool
//! - [`model`]: learned key→page mapping with correction table
//! - [`memtable`]: multi-version ordered write buffer
//! - `db`: façade wiring the read/write/flush/reorganization paths
//! - [`encoding`]: order-preserving integer key codec

pub mod config;
pub mod db;
pub mod encoding;
pub mod memtable;
pub mod model;
pub mod storage;

pub use config::{KeyHints, Options};
pub use db::Database;
pub use storage::PageId;
