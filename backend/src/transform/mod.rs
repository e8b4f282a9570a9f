//! Row transformation.
//!
//! - Codec: CSV cells <-> internal field values
//! - Resolver: named entities by lookup or creation
//! - Builder: one row -> item plus relationships
//! - Pipeline: chunked import runs

pub mod builder;
pub mod codec;
pub mod pipeline;
pub mod resolver;

pub use builder::{AggregateBuilder, BuildOptions, BuildOutcome, PendingLink, RowAction};
pub use codec::{decode, encode, DecodedRow};
pub use pipeline::{BatchOrchestrator, ProgressCallback};
pub use resolver::{RelationshipResolver, Resolution};
