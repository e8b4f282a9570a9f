//! Storage boundary.
//!
//! The engine never owns persistence. It talks to a [`CatalogStore`], which
//! exposes lookups by natural key, creation and update of items and shared
//! entities, and delete-all/create-one relationship operations. Every call made
//! between [`CatalogStore::begin`] and [`CatalogStore::commit`] /
//! [`CatalogStore::rollback`] belongs to the caller's transaction.
//!
//! Name-keyed lookup-or-create is only race-free if the store rejects a second
//! entity with the same natural key; implementations must enforce that.
//!
//! [`InMemoryStore`] is the reference implementation used by the CLI, the HTTP
//! server and the tests.

pub mod memory;

pub use memory::InMemoryStore;

use crate::error::StorageResult;
use crate::export::ExportFilter;
use crate::models::{
    CatalogAggregate, CatalogItem, Entity, EntityKind, ItemFields, ItemId, NaturalKey,
    Relation, RelationCategory,
};

/// Persistence operations consumed by the import/export engine.
pub trait CatalogStore {
    /// Start a transaction. Nested transactions are not supported.
    fn begin(&mut self) -> StorageResult<()>;

    /// Make every change since [`CatalogStore::begin`] durable.
    fn commit(&mut self) -> StorageResult<()>;

    /// Discard every change since [`CatalogStore::begin`].
    fn rollback(&mut self) -> StorageResult<()>;

    /// Find an item: internal identifier first, catalog code second.
    fn find_item(&self, key: &NaturalKey) -> StorageResult<Option<CatalogItem>>;

    fn create_item(&mut self, fields: &ItemFields) -> StorageResult<CatalogItem>;

    fn update_item(&mut self, id: ItemId, fields: &ItemFields) -> StorageResult<CatalogItem>;

    /// Find a shared entity by kind and name (case-insensitive).
    fn find_entity(&self, kind: &EntityKind, name: &str) -> StorageResult<Option<Entity>>;

    /// Create an active shared entity. Fails if the name is taken.
    fn create_entity(&mut self, kind: &EntityKind, name: &str) -> StorageResult<Entity>;

    /// Remove every relationship row of one category; returns how many went.
    fn delete_relationships(&mut self, item: ItemId, category: RelationCategory) -> StorageResult<usize>;

    fn create_relationship(&mut self, item: ItemId, relation: Relation) -> StorageResult<()>;

    /// Load an item with every relationship collection resolved.
    fn load_aggregate(&self, id: ItemId) -> StorageResult<Option<CatalogAggregate>>;

    /// One page of matching aggregates ordered by item id, starting after
    /// `after` (exclusive).
    fn query_aggregates(
        &self,
        filter: &ExportFilter,
        after: Option<ItemId>,
        limit: usize,
    ) -> StorageResult<Vec<CatalogAggregate>>;
}
