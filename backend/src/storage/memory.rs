//! In-memory catalog store with journaled transactions.
//!
//! Every write inside a transaction pushes an undo entry; `rollback` replays
//! them backwards. Natural keys and entity names are indexed so lookups do
//! not depend on catalog size. The committed state serialises to JSON so a
//! catalog can be kept between CLI runs; indexes are rebuilt on load.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use super::CatalogStore;
use crate::error::{StorageError, StorageResult};
use crate::export::ExportFilter;
use crate::models::{
    CatalogAggregate, CatalogItem, Entity, EntityId, EntityKind, ItemCreator, ItemFields, ItemId,
    ItemLanguage, ItemLink, NaturalKey, Relation, RelationCategory,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct State {
    next_item_id: ItemId,
    next_entity_id: EntityId,
    items: BTreeMap<ItemId, CatalogItem>,
    entities: BTreeMap<EntityId, Entity>,
    /// Relationship rows per item, in insertion order.
    relations: BTreeMap<ItemId, Vec<Relation>>,
}

/// Lookup tables derived from [`State`].
#[derive(Debug, Default)]
struct Indexes {
    internal_ids: HashMap<String, ItemId>,
    catalog_codes: HashMap<String, ItemId>,
    /// `(kind, lowercase name)` -> entity.
    entity_names: HashMap<(EntityKind, String), EntityId>,
}

impl Indexes {
    fn build(state: &State) -> Self {
        let mut indexes = Self::default();
        for item in state.items.values() {
            indexes.insert_item(item);
        }
        for entity in state.entities.values() {
            indexes.insert_entity(entity);
        }
        indexes
    }

    fn insert_item(&mut self, item: &CatalogItem) {
        if let Some(id) = &item.fields.internal_id {
            self.internal_ids.insert(id.clone(), item.id);
        }
        if let Some(code) = &item.fields.catalog_code {
            self.catalog_codes.insert(code.clone(), item.id);
        }
    }

    fn remove_item(&mut self, item: &CatalogItem) {
        if let Some(id) = &item.fields.internal_id {
            self.internal_ids.remove(id);
        }
        if let Some(code) = &item.fields.catalog_code {
            self.catalog_codes.remove(code);
        }
    }

    fn insert_entity(&mut self, entity: &Entity) {
        self.entity_names.insert(entity_key(&entity.kind, &entity.name), entity.id);
    }

    fn remove_entity(&mut self, entity: &Entity) {
        self.entity_names.remove(&entity_key(&entity.kind, &entity.name));
    }
}

fn entity_key(kind: &EntityKind, name: &str) -> (EntityKind, String) {
    (kind.clone(), name.trim().to_lowercase())
}

/// Inverse of one write.
#[derive(Debug)]
enum Undo {
    ItemCreated(ItemId),
    ItemUpdated(CatalogItem),
    EntityCreated(EntityId),
    RelationAdded(ItemId),
    RelationsDeleted { item: ItemId, previous: Vec<Relation> },
}

/// Open transaction.
#[derive(Debug)]
struct Journal {
    next_item_id: ItemId,
    next_entity_id: EntityId,
    undo: Vec<Undo>,
}

/// Reference [`CatalogStore`] implementation.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: State,
    indexes: Indexes,
    journal: Option<Journal>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store saved with [`InMemoryStore::save`]; a missing file
    /// yields an empty store.
    pub fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = fs::read_to_string(path)?;
        let state: State = serde_json::from_str(&content)?;
        let indexes = Indexes::build(&state);
        Ok(Self { state, indexes, journal: None })
    }

    /// Write the committed state as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        if self.journal.is_some() {
            return Err(StorageError::Transaction(
                "cannot save while a transaction is open".to_string(),
            ));
        }
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(&self.state)?)?;
        Ok(())
    }

    pub fn item_count(&self) -> usize {
        self.state.items.len()
    }

    pub fn entity_count(&self, kind: &EntityKind) -> usize {
        self.state.entities.values().filter(|e| &e.kind == kind).count()
    }

    /// Relationship rows of one category across all items.
    pub fn relation_count(&self, category: RelationCategory) -> usize {
        self.state
            .relations
            .values()
            .flatten()
            .filter(|r| r.category() == category)
            .count()
    }

    pub fn items(&self) -> impl Iterator<Item = &CatalogItem> {
        self.state.items.values()
    }

    fn record(&mut self, undo: Undo) {
        if let Some(journal) = &mut self.journal {
            journal.undo.push(undo);
        }
    }

    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::ItemCreated(id) => {
                if let Some(item) = self.state.items.remove(&id) {
                    self.indexes.remove_item(&item);
                }
                self.state.relations.remove(&id);
            }
            Undo::ItemUpdated(previous) => {
                if let Some(current) = self.state.items.get(&previous.id) {
                    self.indexes.remove_item(current);
                }
                self.indexes.insert_item(&previous);
                self.state.items.insert(previous.id, previous);
            }
            Undo::EntityCreated(id) => {
                if let Some(entity) = self.state.entities.remove(&id) {
                    self.indexes.remove_entity(&entity);
                }
            }
            Undo::RelationAdded(item) => {
                if let Some(rows) = self.state.relations.get_mut(&item) {
                    rows.pop();
                    if rows.is_empty() {
                        self.state.relations.remove(&item);
                    }
                }
            }
            Undo::RelationsDeleted { item, previous } => {
                self.state.relations.insert(item, previous);
            }
        }
    }

    fn key_taken(&self, fields: &ItemFields, except: Option<ItemId>) -> Option<String> {
        let other = |found: Option<&ItemId>| found.is_some_and(|id| Some(*id) != except);
        if let Some(id) = &fields.internal_id {
            if other(self.indexes.internal_ids.get(id)) {
                return Some(format!("item ID '{}' already exists", id));
            }
        }
        if let Some(code) = &fields.catalog_code {
            if other(self.indexes.catalog_codes.get(code)) {
                return Some(format!("catalog code '{}' already exists", code));
            }
        }
        None
    }

    fn entity(&self, id: EntityId) -> StorageResult<Entity> {
        self.state
            .entities
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound { kind: "entity", id })
    }

    fn build_aggregate(&self, item: &CatalogItem) -> StorageResult<CatalogAggregate> {
        let collection = item.fields.collection_id.map(|id| self.entity(id)).transpose()?;
        let publisher = item.fields.publisher_id.map(|id| self.entity(id)).transpose()?;

        let mut aggregate = CatalogAggregate {
            item: item.clone(),
            collection,
            publisher,
            languages: Vec::new(),
            creators: Vec::new(),
            classifications: Vec::new(),
            locations: Vec::new(),
            keywords: Vec::new(),
            files: Vec::new(),
            library_references: Vec::new(),
            links: Vec::new(),
        };

        for relation in self.state.relations.get(&item.id).into_iter().flatten() {
            match relation {
                Relation::Language { language_id, is_primary } => {
                    aggregate.languages.push(ItemLanguage {
                        language: self.entity(*language_id)?,
                        is_primary: *is_primary,
                    });
                }
                Relation::Creator { creator_id, role, sort_order, role_description } => {
                    aggregate.creators.push(ItemCreator {
                        creator: self.entity(*creator_id)?,
                        role: *role,
                        sort_order: *sort_order,
                        role_description: role_description.clone(),
                    });
                }
                Relation::Classification { value_id } => {
                    aggregate.classifications.push(self.entity(*value_id)?);
                }
                Relation::Location { location_id } => {
                    aggregate.locations.push(self.entity(*location_id)?);
                }
                Relation::Keyword { keyword } => aggregate.keywords.push(keyword.clone()),
                Relation::File(file) => aggregate.files.push(file.clone()),
                Relation::LibraryReference(reference) => {
                    aggregate.library_references.push(reference.clone())
                }
                Relation::Link { target_id, kind, group_code } => {
                    let target = self
                        .state
                        .items
                        .get(target_id)
                        .ok_or(StorageError::NotFound { kind: "item", id: *target_id })?;
                    aggregate.links.push(ItemLink {
                        target_id: *target_id,
                        target_key: target.link_key().map(|k| k.to_string()).unwrap_or_default(),
                        kind: *kind,
                        group_code: group_code.clone(),
                    });
                }
            }
        }

        Ok(aggregate)
    }
}

impl CatalogStore for InMemoryStore {
    fn begin(&mut self) -> StorageResult<()> {
        if self.journal.is_some() {
            return Err(StorageError::Transaction("transaction already open".to_string()));
        }
        self.journal = Some(Journal {
            next_item_id: self.state.next_item_id,
            next_entity_id: self.state.next_entity_id,
            undo: Vec::new(),
        });
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        self.journal
            .take()
            .map(|_| ())
            .ok_or_else(|| StorageError::Transaction("commit without begin".to_string()))
    }

    fn rollback(&mut self) -> StorageResult<()> {
        let journal = self
            .journal
            .take()
            .ok_or_else(|| StorageError::Transaction("rollback without begin".to_string()))?;
        for undo in journal.undo.into_iter().rev() {
            self.revert(undo);
        }
        self.state.next_item_id = journal.next_item_id;
        self.state.next_entity_id = journal.next_entity_id;
        Ok(())
    }

    fn find_item(&self, key: &NaturalKey) -> StorageResult<Option<CatalogItem>> {
        let by_id = key
            .internal_id
            .as_ref()
            .and_then(|id| self.indexes.internal_ids.get(id));
        let by_code = || {
            key.catalog_code
                .as_ref()
                .and_then(|code| self.indexes.catalog_codes.get(code))
        };
        Ok(by_id
            .or_else(by_code)
            .and_then(|id| self.state.items.get(id))
            .cloned())
    }

    fn create_item(&mut self, fields: &ItemFields) -> StorageResult<CatalogItem> {
        if let Some(conflict) = self.key_taken(fields, None) {
            return Err(StorageError::Conflict(conflict));
        }
        self.state.next_item_id += 1;
        let now = Utc::now();
        let item = CatalogItem {
            id: self.state.next_item_id,
            fields: fields.clone(),
            created_at: now,
            updated_at: now,
        };
        self.indexes.insert_item(&item);
        self.state.items.insert(item.id, item.clone());
        self.record(Undo::ItemCreated(item.id));
        Ok(item)
    }

    fn update_item(&mut self, id: ItemId, fields: &ItemFields) -> StorageResult<CatalogItem> {
        if let Some(conflict) = self.key_taken(fields, Some(id)) {
            return Err(StorageError::Conflict(conflict));
        }
        let item = self
            .state
            .items
            .get_mut(&id)
            .ok_or(StorageError::NotFound { kind: "item", id })?;
        let previous = item.clone();
        item.fields = fields.clone();
        item.updated_at = Utc::now();
        let updated = item.clone();

        self.indexes.remove_item(&previous);
        self.indexes.insert_item(&updated);
        self.record(Undo::ItemUpdated(previous));
        Ok(updated)
    }

    fn find_entity(&self, kind: &EntityKind, name: &str) -> StorageResult<Option<Entity>> {
        Ok(self
            .indexes
            .entity_names
            .get(&entity_key(kind, name))
            .and_then(|id| self.state.entities.get(id))
            .cloned())
    }

    fn create_entity(&mut self, kind: &EntityKind, name: &str) -> StorageResult<Entity> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StorageError::Backend(format!("{} name must not be empty", kind)));
        }
        if self.find_entity(kind, name)?.is_some() {
            return Err(StorageError::Conflict(format!("{} '{}' already exists", kind, name)));
        }
        self.state.next_entity_id += 1;
        let entity = Entity {
            id: self.state.next_entity_id,
            kind: kind.clone(),
            name: name.to_string(),
            is_active: true,
        };
        self.indexes.insert_entity(&entity);
        self.state.entities.insert(entity.id, entity.clone());
        self.record(Undo::EntityCreated(entity.id));
        Ok(entity)
    }

    fn delete_relationships(&mut self, item: ItemId, category: RelationCategory) -> StorageResult<usize> {
        let Some(rows) = self.state.relations.get_mut(&item) else {
            return Ok(0);
        };
        let previous = rows.clone();
        rows.retain(|r| r.category() != category);
        let removed = previous.len() - rows.len();
        if removed > 0 {
            self.record(Undo::RelationsDeleted { item, previous });
        }
        Ok(removed)
    }

    fn create_relationship(&mut self, item: ItemId, relation: Relation) -> StorageResult<()> {
        if !self.state.items.contains_key(&item) {
            return Err(StorageError::NotFound { kind: "item", id: item });
        }
        match &relation {
            Relation::Language { language_id: id, .. }
            | Relation::Creator { creator_id: id, .. }
            | Relation::Classification { value_id: id }
            | Relation::Location { location_id: id } => {
                self.entity(*id)?;
            }
            Relation::Link { target_id, .. } => {
                if !self.state.items.contains_key(target_id) {
                    return Err(StorageError::NotFound { kind: "item", id: *target_id });
                }
            }
            Relation::File(file) if file.is_primary => {
                let clash = self.state.relations.get(&item).into_iter().flatten().any(|r| {
                    matches!(r, Relation::File(f) if f.is_primary && f.file_type == file.file_type)
                });
                if clash {
                    return Err(StorageError::Conflict(format!(
                        "item {} already has a primary {} file",
                        item,
                        file.file_type.as_str()
                    )));
                }
            }
            _ => {}
        }
        self.state.relations.entry(item).or_default().push(relation);
        self.record(Undo::RelationAdded(item));
        Ok(())
    }

    fn load_aggregate(&self, id: ItemId) -> StorageResult<Option<CatalogAggregate>> {
        match self.state.items.get(&id) {
            Some(item) => Ok(Some(self.build_aggregate(item)?)),
            None => Ok(None),
        }
    }

    fn query_aggregates(
        &self,
        filter: &ExportFilter,
        after: Option<ItemId>,
        limit: usize,
    ) -> StorageResult<Vec<CatalogAggregate>> {
        let start = after.map(|id| id + 1).unwrap_or(0);
        let mut page = Vec::with_capacity(limit);
        for item in self.state.items.range(start..).map(|(_, item)| item) {
            if page.len() >= limit {
                break;
            }
            let aggregate = self.build_aggregate(item)?;
            if filter.matches(&aggregate) {
                page.push(aggregate);
            }
        }
        Ok(page)
    }
}
