//! # Catalog CSV - bulk import and export for library catalog records
//!
//! Reads spreadsheet-edited CSV files into a relational catalog (items plus
//! creators, languages, classifications, files, links) and writes the same
//! catalog back out in a form that imports again unchanged.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   CSV File  │────▶│   Parser    │────▶│  Transform  │────▶│   Catalog   │
//! │  (any enc.) │     │  (chunked)  │     │ (row + txn) │     │    Store    │
//! └─────────────┘     └─────────────┘     └─────────────┘     └──────┬──────┘
//!                                                                    │
//! ┌─────────────┐     ┌─────────────┐                                │
//! │   CSV File  │◀────│   Export    │◀───────────────────────────────┘
//! └─────────────┘     └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use catalog_csv::{BatchOrchestrator, ConflictMode, ImportConfig, ImportSource, InMemoryStore};
//!
//! let mut store = InMemoryStore::new();
//! let session = BatchOrchestrator::new(ImportConfig::default())
//!     .import(&mut store, &ImportSource::file("catalog.csv"), ConflictMode::Upsert);
//! println!("{}: {} created, {} failed", session.status, session.created_count, session.failed);
//! ```
//!
//! ## Modules
//!
//! - [`error`] - Hierarchical error types
//! - [`config`] - Engine configuration
//! - [`mapping`] - Column <-> field map and value codes
//! - [`models`] - Catalog items, entities and relations
//! - [`parser`] - Streaming CSV reading with auto-detection
//! - [`storage`] - Store interface and the in-memory store
//! - [`session`] - Import sessions, progress and cancellation
//! - [`validation`] - Header and row checks
//! - [`transform`] - Row codec, entity resolution, building, orchestration
//! - [`export`] - Filtered CSV export
//! - [`cache`] - Session archive
//! - [`jobs`] - Background import queue
//! - [`api`] - HTTP API server

// Core modules
pub mod config;
pub mod error;
pub mod mapping;
pub mod models;

// Reading
pub mod parser;

// Persistence
pub mod storage;

// Import
pub mod session;
pub mod transform;
pub mod validation;

// Export
pub mod export;

// Session archive
pub mod cache;

// Background jobs
pub mod jobs;

// HTTP API
pub mod api;

// =============================================================================
// Re-exports - Error types
// =============================================================================

pub use error::{
    ConfigError, CsvError, ExportError, ImportError, RowError, ServerError, SessionError, StorageError,
};

// =============================================================================
// Re-exports - Configuration and mapping
// =============================================================================

pub use config::{CreateMissing, ImportConfig, ValidationLimits};
pub use mapping::{FieldMap, FieldMapEntry};

// =============================================================================
// Re-exports - Models
// =============================================================================

pub use models::{
    AccessLevel, CatalogAggregate, CatalogItem, CreatorRole, Entity, EntityKind, FileType, ItemFields,
    LinkKey, NaturalKey, Relation, RelationCategory,
};

// =============================================================================
// Re-exports - Parsing
// =============================================================================

pub use parser::{detect_delimiter, detect_encoding, CsvInfo, ImportSource, RowReader};

// =============================================================================
// Re-exports - Storage
// =============================================================================

pub use storage::{CatalogStore, InMemoryStore};

// =============================================================================
// Re-exports - Import
// =============================================================================

pub use session::{ConflictMode, ImportSession, Progress, RowIssue, SessionHandle, SessionStatus};
pub use transform::{AggregateBuilder, BatchOrchestrator, RelationshipResolver};
pub use validation::{FileValidation, ValidationReport, Validator};

// =============================================================================
// Re-exports - Export, archive, jobs
// =============================================================================

pub use cache::SessionArchive;
pub use export::{ExportFilter, ExportOptions, ExportSummary, Exporter};
pub use jobs::ImportQueue;

// Server
pub mod server {
    pub use crate::api::server::{router, start_server, AppState};
}
