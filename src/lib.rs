//! Docshard - an embedded, file-persisted JSON document store
//!
//! Docshard keeps arbitrary JSON documents in memory, persists them as
//! diffable JSON files, and answers a small query language (`Eq`, `$in`,
//! `$regex`, `$text`, `$and`) through secondary indices when they exist and
//! paged exhaustive scans when they do not. Documents can be partitioned
//! into shards by a shard key, with an explicit working set controlling
//! which shards are memory-resident. A per-store access guard detects
//! illegal interleavings of the cooperative async operations.

pub mod config;
pub mod document;
pub mod error;
pub mod guard;
pub mod index;
pub mod index_builder;
pub mod query;
pub mod sharded;
pub mod store;

pub use config::StoreConfig;
pub use document::{Document, ID_FIELD, SHARD_KEY_FIELD};
pub use error::DocshardError;
pub use guard::{AccessGuard, AccessKind, ConcurrencyViolation, GuardMode};
pub use index_builder::{BuildStats, IndexBuilder};
pub use query::{Query, ValueSpec};
pub use sharded::ShardedStore;
pub use store::{DocumentOps, DocumentStore};

/// Type alias for Results using DocshardError
pub type Result<T> = std::result::Result<T, DocshardError>;
