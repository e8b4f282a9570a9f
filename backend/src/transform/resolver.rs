//! Lookup-or-create resolution of shared entities.

use std::collections::HashSet;
use tracing::debug;

use crate::config::{CreateMissing, ImportConfig};
use crate::error::StorageResult;
use crate::mapping::split_values;
use crate::models::{Entity, EntityKind};
use crate::storage::CatalogStore;

/// Outcome of resolving one name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(Entity),
    Created(Entity),
    /// Not found and creation is disabled for this kind.
    Missing,
}

impl Resolution {
    pub fn entity(self) -> Option<Entity> {
        match self {
            Resolution::Found(e) | Resolution::Created(e) => Some(e),
            Resolution::Missing => None,
        }
    }
}

/// Entities resolved from a multi-value cell, plus the names that were not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    pub entities: Vec<Entity>,
    pub missing: Vec<String>,
}

/// Resolves names to shared entities under a create-missing policy.
#[derive(Debug, Clone)]
pub struct RelationshipResolver {
    create_missing: CreateMissing,
}

impl RelationshipResolver {
    pub fn new(config: &ImportConfig) -> Self {
        Self { create_missing: config.create_missing.clone() }
    }

    pub fn with_policy(create_missing: CreateMissing) -> Self {
        Self { create_missing }
    }

    /// Find an entity by name, creating it when `create_if_missing` is set.
    ///
    /// Returns `None` for a miss; the caller decides what a miss means.
    pub fn resolve_or_create(
        &self,
        store: &mut dyn CatalogStore,
        kind: &EntityKind,
        name: &str,
        create_if_missing: bool,
    ) -> StorageResult<Option<Entity>> {
        Ok(self.lookup(store, kind, name, create_if_missing)?.entity())
    }

    /// Resolve one name under the configured policy for its kind.
    pub fn resolve(
        &self,
        store: &mut dyn CatalogStore,
        kind: &EntityKind,
        name: &str,
    ) -> StorageResult<Resolution> {
        self.lookup(store, kind, name, self.create_missing.allows(kind))
    }

    /// Resolve every name in order, collecting misses.
    pub fn resolve_all(
        &self,
        store: &mut dyn CatalogStore,
        kind: &EntityKind,
        names: &[String],
    ) -> StorageResult<Resolved> {
        let mut resolved = Resolved::default();
        for name in names {
            match self.resolve(store, kind, name)? {
                Resolution::Found(e) | Resolution::Created(e) => resolved.entities.push(e),
                Resolution::Missing => resolved.missing.push(name.clone()),
            }
        }
        Ok(resolved)
    }

    fn lookup(
        &self,
        store: &mut dyn CatalogStore,
        kind: &EntityKind,
        name: &str,
        create: bool,
    ) -> StorageResult<Resolution> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(Resolution::Missing);
        }
        if let Some(entity) = store.find_entity(kind, name)? {
            return Ok(Resolution::Found(entity));
        }
        if !create {
            return Ok(Resolution::Missing);
        }
        let entity = store.create_entity(kind, name)?;
        debug!(kind = %kind, name = %entity.name, id = entity.id, "Created missing entity");
        Ok(Resolution::Created(entity))
    }
}

/// Split a cell whose values form a set: order kept, repeats dropped
/// (case-insensitive).
pub fn split_set(value: &str, separator: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    split_values(value, separator)
        .into_iter()
        .filter(|v| seen.insert(v.to_lowercase()))
        .collect()
}

/// Split a cell whose position matters; repeats are kept.
pub fn split_list(value: &str, separator: &str) -> Vec<String> {
    split_values(value, separator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    #[test]
    fn test_split_set_dedupes() {
        assert_eq!(split_set("Kenya|Uganda|kenya", "|"), vec!["Kenya", "Uganda"]);
        assert_eq!(split_list("Ann|Bob|Ann", "|"), vec!["Ann", "Bob", "Ann"]);
    }

    #[test]
    fn test_resolve_or_create() {
        let resolver = RelationshipResolver::new(&ImportConfig::default());
        let mut store = InMemoryStore::new();

        let miss = resolver
            .resolve_or_create(&mut store, &EntityKind::Publisher, "Acme", false)
            .unwrap();
        assert!(miss.is_none());

        let created = resolver
            .resolve_or_create(&mut store, &EntityKind::Publisher, "Acme", true)
            .unwrap()
            .unwrap();
        assert!(created.is_active);

        let found = resolver
            .resolve_or_create(&mut store, &EntityKind::Publisher, " acme ", false)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(store.entity_count(&EntityKind::Publisher), 1);
    }

    #[test]
    fn test_policy_per_kind() {
        let resolver = RelationshipResolver::new(&ImportConfig::default());
        let mut store = InMemoryStore::new();
        let names = vec!["English".to_string(), "Swahili".to_string()];

        let resolved = resolver.resolve_all(&mut store, &EntityKind::Language, &names).unwrap();
        assert!(resolved.entities.is_empty());
        assert_eq!(resolved.missing, names);

        store.create_entity(&EntityKind::Language, "English").unwrap();
        let resolved = resolver.resolve_all(&mut store, &EntityKind::Language, &names).unwrap();
        assert_eq!(resolved.entities.len(), 1);
        assert_eq!(resolved.missing, vec!["Swahili"]);

        let creators = resolver
            .resolve_all(&mut store, &EntityKind::Creator, &names)
            .unwrap();
        assert_eq!(creators.entities.len(), 2);
    }

    #[test]
    fn test_empty_name_is_a_miss() {
        let resolver = RelationshipResolver::with_policy(CreateMissing::all());
        let mut store = InMemoryStore::new();
        let res = resolver.resolve(&mut store, &EntityKind::Location, "  ").unwrap();
        assert_eq!(res, Resolution::Missing);
    }
}
