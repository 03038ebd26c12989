//! Persistence for entryflow pipelines.
//!
//! Provides the [`PipelineStore`] trait defining the storage contract the
//! engine relies on, and [`SqliteStore`], the SQLite backend.
//!
//! # Modules
//!
//! - [`error`]: StorageError enum with all failure modes
//! - [`hash`]: canonical content hashing for entries and node configs
//! - [`schema`]: migration setup and connection pragmas
//! - [`types`]: inputs and reports exchanged with the store
//! - [`traits`]: PipelineStore trait definition
//! - [`sqlite`]: SqliteStore implementation

pub mod error;
pub mod hash;
pub mod schema;
pub mod sqlite;
mod sql;
pub mod traits;
pub mod types;

// Re-export key types for ergonomic use.
pub use error::StorageError;
pub use hash::{hash_input, hash_output, hash_value, node_hash};
pub use sqlite::SqliteStore;
pub use traits::PipelineStore;
pub use types::{ChildEntry, ConfigChange, FilterRunStats, InvalidationReport, StatusCounts};
