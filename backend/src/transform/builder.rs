//! Aggregate builder: applies one decoded row to storage.
//!
//! Scalars are written first (only for columns present in the file), then
//! every relationship category touched by the row is rebuilt: all existing
//! rows of the category are deleted and recreated. Sub-columns of a touched
//! category that are absent from the file keep their current entries, so a
//! file with only an `Author` column does not drop illustrators.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tracing::debug;

use super::codec::DecodedRow;
use super::resolver::{split_list, split_set, RelationshipResolver};
use crate::config::{ImportConfig, ValidationLimits};
use crate::error::{RowError, RowResult, StorageResult};
use crate::mapping::{fields, FieldMap};
use crate::models::{
    CatalogAggregate, CatalogItem, CreatorRole, EntityKind, FileType, ItemFields, ItemFile, ItemId,
    LibraryReference, LibrarySystem, LinkKey, LinkKind, NaturalKey, Relation, RelationCategory,
};
use crate::session::RowIssue;
use crate::storage::CatalogStore;

/// Role description stored when an "other creator" has no role text.
pub const DEFAULT_ROLE_TEXT: &str = "Contributor";

static YEAR_MARKERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:circa|ca\.|c\.)|[?\[\]]").expect("valid year marker pattern"));
static INTEGER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid integer pattern"));

/// Per-row options decided by the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Drop the row's natural key before creating (duplicate of an existing item).
    pub clear_identifiers: bool,
}

/// What happened to the row's item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Created,
    Updated,
    Skipped,
}

/// Result of applying one row.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub item: CatalogItem,
    pub action: RowAction,
    pub warnings: Vec<RowIssue>,
    /// Link keys with no matching item yet.
    pub pending_links: Vec<PendingLink>,
}

/// A link whose target was not in the store when its row was applied.
///
/// The target may be a later row of the same file; the orchestrator retries
/// these with [`AggregateBuilder::attach_pending_links`] after the last chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLink {
    pub line: u64,
    pub field: &'static str,
    pub kind: LinkKind,
    pub key: LinkKey,
    pub group_code: Option<String>,
}

impl PendingLink {
    /// Warning recorded when the target never turns up.
    pub fn not_found(&self) -> RowIssue {
        RowIssue::row(
            self.line,
            Some(self.field.to_string()),
            format!("Linked item '{}' not found; link skipped", self.key),
        )
    }
}

const FILE_FIELDS: [(&str, FileType); 4] = [
    (fields::DOCUMENT_FILES, FileType::Document),
    (fields::THUMBNAIL_FILES, FileType::Thumbnail),
    (fields::AUDIO_FILES, FileType::Audio),
    (fields::VIDEO_URLS, FileType::ExternalVideo),
];

const LIBRARY_FIELDS: [(&str, LibrarySystem); 2] = [
    (fields::WORLDCAT_REF, LibrarySystem::WorldCat),
    (fields::OPENLIBRARY_REF, LibrarySystem::OpenLibrary),
];

const LINK_FIELDS: [(&str, LinkKind); 2] = [
    (fields::RELATED_ITEMS, LinkKind::Related),
    (fields::TRANSLATION_OF, LinkKind::TranslationOf),
];

/// Builds or updates catalog aggregates from decoded rows.
#[derive(Debug, Clone)]
pub struct AggregateBuilder {
    map: FieldMap,
    limits: ValidationLimits,
    resolver: RelationshipResolver,
}

/// Per-row working state.
struct RowContext<'r> {
    row: &'r DecodedRow,
    warnings: Vec<RowIssue>,
    pending_links: Vec<PendingLink>,
}

impl RowContext<'_> {
    fn warn(&mut self, field: &str, message: String) {
        self.warnings
            .push(RowIssue::row(self.row.line, Some(field.to_string()), message));
    }
}

impl AggregateBuilder {
    pub fn new(config: &ImportConfig, resolver: RelationshipResolver) -> Self {
        Self {
            map: config.field_map.clone(),
            limits: config.limits.clone(),
            resolver,
        }
    }

    /// Create a new aggregate (`existing == None`) or update one in place.
    ///
    /// Must run inside the caller's transaction; on error nothing is
    /// committed by this function.
    pub fn build_or_update(
        &self,
        store: &mut dyn CatalogStore,
        existing: Option<&CatalogItem>,
        row: &DecodedRow,
        options: BuildOptions,
    ) -> RowResult<BuildOutcome> {
        let mut ctx = RowContext {
            row,
            warnings: Vec::new(),
            pending_links: Vec::new(),
        };

        let base = match existing {
            Some(item) => item.fields.clone(),
            None => ItemFields { is_active: true, ..Default::default() },
        };
        let mut item_fields = self.apply_scalars(store, base, &mut ctx)?;

        if options.clear_identifiers {
            ctx.warn(
                fields::INTERNAL_ID,
                format!(
                    "Item '{}' already exists; duplicate created without identifiers",
                    NaturalKey {
                        internal_id: item_fields.internal_id.take(),
                        catalog_code: item_fields.catalog_code.take(),
                    }
                ),
            );
        }

        if item_fields.title.trim().is_empty() {
            return Err(RowError::Invalid {
                field: Some(fields::TITLE.to_string()),
                message: "Title is required".to_string(),
            });
        }

        let (item, previous, action) = match existing {
            Some(current) => {
                let previous = store.load_aggregate(current.id)?;
                let item = store.update_item(current.id, &item_fields)?;
                (item, previous, RowAction::Updated)
            }
            None => (store.create_item(&item_fields)?, None, RowAction::Created),
        };

        for category in RelationCategory::ALL {
            let columns = self.category_fields(category);
            if !columns.iter().any(|f| row.has(f)) {
                continue;
            }
            let relations = self.collect_relations(store, category, &item, previous.as_ref(), &mut ctx)?;
            if previous.is_some() {
                store.delete_relationships(item.id, category)?;
            }
            let count = relations.len();
            for relation in relations {
                store.create_relationship(item.id, relation)?;
            }
            debug!(row = row.line, item = item.id, category = category.as_str(), count, "Rebuilt relationships");
        }

        Ok(BuildOutcome {
            item,
            action,
            warnings: ctx.warnings,
            pending_links: ctx.pending_links,
        })
    }

    /// Attach links from an earlier row of the run to targets that now exist.
    ///
    /// Must run inside the caller's transaction. Returns a warning for every
    /// key that still has no item.
    pub fn attach_pending_links(
        &self,
        store: &mut dyn CatalogStore,
        item: ItemId,
        pending: &[PendingLink],
    ) -> RowResult<Vec<RowIssue>> {
        let mut warnings = Vec::new();
        for link in pending {
            match store.find_item(&link.key.natural_key())? {
                Some(target) if target.id != item => {
                    store.create_relationship(
                        item,
                        Relation::Link {
                            target_id: target.id,
                            kind: link.kind,
                            group_code: link.group_code.clone(),
                        },
                    )?;
                }
                _ => warnings.push(link.not_found()),
            }
        }
        debug!(item, pending = pending.len(), unresolved = warnings.len(), "Attached pending links");
        Ok(warnings)
    }

    // =========================================================================
    // Scalars
    // =========================================================================

    fn apply_scalars(
        &self,
        store: &mut dyn CatalogStore,
        mut f: ItemFields,
        ctx: &mut RowContext<'_>,
    ) -> RowResult<ItemFields> {
        let row = ctx.row;
        let opt = |field: &str| row.value(field).map(str::to_string);

        if row.has(fields::INTERNAL_ID) {
            f.internal_id = opt(fields::INTERNAL_ID);
        }
        if row.has(fields::CATALOG_CODE) {
            f.catalog_code = opt(fields::CATALOG_CODE);
        }
        if row.has(fields::TITLE) {
            f.title = row.get(fields::TITLE).unwrap_or_default().to_string();
        }
        if row.has(fields::SUBTITLE) {
            f.subtitle = opt(fields::SUBTITLE);
        }
        if row.has(fields::ISBN) {
            f.isbn = opt(fields::ISBN);
        }
        if row.has(fields::EDITION) {
            f.edition = opt(fields::EDITION);
        }
        if row.has(fields::DESCRIPTION) {
            f.description = opt(fields::DESCRIPTION);
        }
        if row.has(fields::PUBLICATION_YEAR) {
            f.publication_year = row
                .value(fields::PUBLICATION_YEAR)
                .and_then(parse_year)
                .filter(|y| self.in_range(fields::PUBLICATION_YEAR, *y))
                .map(|y| y as i32);
        }
        if row.has(fields::PAGE_COUNT) {
            f.page_count = row
                .value(fields::PAGE_COUNT)
                .and_then(parse_page_count)
                .filter(|p| self.in_range(fields::PAGE_COUNT, *p))
                .and_then(|p| u32::try_from(p).ok());
        }
        if let Some(code) = row.value(fields::ACCESS_LEVEL) {
            f.access_level = self.map.access_level_for_code(code).unwrap_or_default();
        }
        if let Some(raw) = row.value(fields::IS_ACTIVE) {
            f.is_active = self.map.parse_flag(raw).unwrap_or(false);
        }
        if let Some(raw) = row.value(fields::IS_FEATURED) {
            f.is_featured = self.map.parse_flag(raw).unwrap_or(false);
        }
        if row.has(fields::COLLECTION) {
            f.collection_id = self.resolve_single(store, EntityKind::Collection, fields::COLLECTION, ctx)?;
        }
        if row.has(fields::PUBLISHER) {
            f.publisher_id = self.resolve_single(store, EntityKind::Publisher, fields::PUBLISHER, ctx)?;
        }
        Ok(f)
    }

    fn in_range(&self, field: &str, value: i64) -> bool {
        self.limits
            .numeric_ranges
            .get(field)
            .map_or(true, |r| r.contains(value))
    }

    fn resolve_single(
        &self,
        store: &mut dyn CatalogStore,
        kind: EntityKind,
        field: &str,
        ctx: &mut RowContext<'_>,
    ) -> StorageResult<Option<u64>> {
        let row = ctx.row;
        let Some(name) = row.value(field) else {
            return Ok(None);
        };
        let resolved = self.resolver.resolve(store, &kind, name)?.entity();
        if resolved.is_none() {
            ctx.warn(field, format!("{} '{}' not found; reference skipped", kind, name));
        }
        Ok(resolved.map(|e| e.id))
    }

    // =========================================================================
    // Relationships
    // =========================================================================

    /// Internal fields that feed a relationship category.
    fn category_fields(&self, category: RelationCategory) -> Vec<&str> {
        match category {
            RelationCategory::Languages => vec![fields::LANGUAGES, fields::SECONDARY_LANGUAGES],
            RelationCategory::Creators => vec![
                fields::AUTHORS,
                fields::ILLUSTRATORS,
                fields::OTHER_CREATORS,
                fields::OTHER_CREATOR_ROLES,
            ],
            RelationCategory::Classifications => self
                .map
                .classification_types
                .iter()
                .map(|c| c.field.as_str())
                .collect(),
            RelationCategory::Locations => vec![fields::LOCATIONS],
            RelationCategory::Keywords => vec![fields::KEYWORDS],
            RelationCategory::Files => FILE_FIELDS.iter().map(|(f, _)| *f).collect(),
            RelationCategory::LibraryReferences => LIBRARY_FIELDS.iter().map(|(f, _)| *f).collect(),
            RelationCategory::Links => vec![fields::RELATED_ITEMS, fields::TRANSLATION_OF, fields::RELATION_GROUP],
        }
    }

    fn collect_relations(
        &self,
        store: &mut dyn CatalogStore,
        category: RelationCategory,
        item: &CatalogItem,
        previous: Option<&CatalogAggregate>,
        ctx: &mut RowContext<'_>,
    ) -> RowResult<Vec<Relation>> {
        match category {
            RelationCategory::Languages => self.languages(store, previous, ctx),
            RelationCategory::Creators => self.creators(store, previous, ctx),
            RelationCategory::Classifications => self.classifications(store, previous, ctx),
            RelationCategory::Locations => {
                let names = self.set(ctx.row, fields::LOCATIONS);
                self.entities(store, EntityKind::Location, fields::LOCATIONS, &names, ctx)
                    .map(|ids| ids.into_iter().map(|location_id| Relation::Location { location_id }).collect())
            }
            RelationCategory::Keywords => Ok(self
                .set(ctx.row, fields::KEYWORDS)
                .into_iter()
                .map(|keyword| Relation::Keyword { keyword })
                .collect()),
            RelationCategory::Files => Ok(self.files(previous, ctx)),
            RelationCategory::LibraryReferences => Ok(self.library_references(previous, ctx)),
            RelationCategory::Links => self.links(store, item, previous, ctx),
        }
    }

    fn set(&self, row: &DecodedRow, field: &str) -> Vec<String> {
        row.value(field)
            .map(|v| split_set(v, self.map.separator_for(field)))
            .unwrap_or_default()
    }

    fn list(&self, row: &DecodedRow, field: &str) -> Vec<String> {
        row.value(field)
            .map(|v| split_list(v, self.map.separator_for(field)))
            .unwrap_or_default()
    }

    /// Resolve names to entity ids, warning about each miss.
    fn entities(
        &self,
        store: &mut dyn CatalogStore,
        kind: EntityKind,
        field: &str,
        names: &[String],
        ctx: &mut RowContext<'_>,
    ) -> RowResult<Vec<u64>> {
        let resolved = self.resolver.resolve_all(store, &kind, names)?;
        for name in resolved.missing {
            ctx.warn(field, format!("{} '{}' not found; reference skipped", kind, name));
        }
        Ok(resolved.entities.into_iter().map(|e| e.id).collect())
    }

    fn languages(
        &self,
        store: &mut dyn CatalogStore,
        previous: Option<&CatalogAggregate>,
        ctx: &mut RowContext<'_>,
    ) -> RowResult<Vec<Relation>> {
        let mut relations = Vec::new();
        for (field, primary) in [(fields::LANGUAGES, true), (fields::SECONDARY_LANGUAGES, false)] {
            let ids: Vec<u64> = if ctx.row.has(field) {
                let names = self.set(ctx.row, field);
                self.entities(store, EntityKind::Language, field, &names, ctx)?
            } else {
                previous
                    .map(|p| p.languages_where(primary).map(|e| e.id).collect())
                    .unwrap_or_default()
            };
            for language_id in ids {
                let taken = relations
                    .iter()
                    .any(|r| matches!(r, Relation::Language { language_id: id, .. } if *id == language_id));
                if !taken {
                    relations.push(Relation::Language { language_id, is_primary: primary });
                }
            }
        }
        Ok(relations)
    }

    fn creators(
        &self,
        store: &mut dyn CatalogStore,
        previous: Option<&CatalogAggregate>,
        ctx: &mut RowContext<'_>,
    ) -> RowResult<Vec<Relation>> {
        let mut relations = Vec::new();

        for (field, role) in [(fields::AUTHORS, CreatorRole::Author), (fields::ILLUSTRATORS, CreatorRole::Illustrator)] {
            if ctx.row.has(field) {
                let names = self.list(ctx.row, field);
                let ids = self.entities(store, EntityKind::Creator, field, &names, ctx)?;
                relations.extend(ids.into_iter().enumerate().map(|(i, creator_id)| Relation::Creator {
                    creator_id,
                    role,
                    sort_order: i as u32,
                    role_description: None,
                }));
            } else if let Some(previous) = previous {
                relations.extend(
                    previous
                        .creators_where(|c| c.role == role && c.role_description.is_none())
                        .into_iter()
                        .map(|c| Relation::Creator {
                            creator_id: c.creator.id,
                            role: c.role,
                            sort_order: c.sort_order,
                            role_description: None,
                        }),
                );
            }
        }

        if ctx.row.has(fields::OTHER_CREATORS) {
            relations.extend(self.other_creators(store, ctx)?);
        } else if let Some(previous) = previous {
            relations.extend(
                previous
                    .creators_where(|c| c.role_description.is_some())
                    .into_iter()
                    .map(|c| Relation::Creator {
                        creator_id: c.creator.id,
                        role: c.role,
                        sort_order: c.sort_order,
                        role_description: c.role_description.clone(),
                    }),
            );
        }

        Ok(relations)
    }

    /// Free-role creators, aligned by position with the role column.
    fn other_creators(&self, store: &mut dyn CatalogStore, ctx: &mut RowContext<'_>) -> RowResult<Vec<Relation>> {
        let names = positional(ctx.row.get(fields::OTHER_CREATORS), self.map.separator_for(fields::OTHER_CREATORS));
        let roles = positional(
            ctx.row.get(fields::OTHER_CREATOR_ROLES),
            self.map.separator_for(fields::OTHER_CREATOR_ROLES),
        );

        let mut relations = Vec::new();
        let mut order = 0u32;
        for (index, name) in names.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            let role_text = roles
                .get(index)
                .filter(|r| !r.is_empty())
                .cloned()
                .unwrap_or_else(|| DEFAULT_ROLE_TEXT.to_string());
            let ids = self.entities(store, EntityKind::Creator, fields::OTHER_CREATORS, std::slice::from_ref(name), ctx)?;
            if let Some(creator_id) = ids.into_iter().next() {
                relations.push(Relation::Creator {
                    creator_id,
                    role: CreatorRole::classify(&role_text),
                    sort_order: order,
                    role_description: Some(role_text),
                });
                order += 1;
            }
        }
        Ok(relations)
    }

    fn classifications(
        &self,
        store: &mut dyn CatalogStore,
        previous: Option<&CatalogAggregate>,
        ctx: &mut RowContext<'_>,
    ) -> RowResult<Vec<Relation>> {
        let mut relations = Vec::new();
        for class_type in &self.map.classification_types {
            let field = class_type.field.as_str();
            let ids: Vec<u64> = if ctx.row.has(field) {
                let names = self.set(ctx.row, field);
                let kind = EntityKind::Classification(class_type.slug.clone());
                self.entities(store, kind, field, &names, ctx)?
            } else {
                previous
                    .map(|p| p.classifications_of(&class_type.slug).map(|e| e.id).collect())
                    .unwrap_or_default()
            };
            relations.extend(ids.into_iter().map(|value_id| Relation::Classification { value_id }));
        }
        Ok(relations)
    }

    fn files(&self, previous: Option<&CatalogAggregate>, ctx: &RowContext<'_>) -> Vec<Relation> {
        let mut relations = Vec::new();
        for (field, file_type) in FILE_FIELDS {
            if ctx.row.has(field) {
                let names = self.set(ctx.row, field);
                relations.extend(names.into_iter().enumerate().map(|(i, name)| {
                    Relation::File(ItemFile {
                        file_type,
                        filename: with_extension(&name, file_type),
                        is_primary: i == 0,
                        sort_order: i as u32,
                    })
                }));
            } else if let Some(previous) = previous {
                relations.extend(previous.files_of(file_type).into_iter().cloned().map(Relation::File));
            }
        }
        relations
    }

    fn library_references(&self, previous: Option<&CatalogAggregate>, ctx: &RowContext<'_>) -> Vec<Relation> {
        LIBRARY_FIELDS
            .iter()
            .filter_map(|(field, system)| {
                let reference = if ctx.row.has(field) {
                    ctx.row.value(field).map(str::to_string)
                } else {
                    previous
                        .and_then(|p| p.library_reference(*system))
                        .map(str::to_string)
                };
                reference.map(|reference| Relation::LibraryReference(LibraryReference { system: *system, reference }))
            })
            .collect()
    }

    fn links(
        &self,
        store: &mut dyn CatalogStore,
        item: &CatalogItem,
        previous: Option<&CatalogAggregate>,
        ctx: &mut RowContext<'_>,
    ) -> RowResult<Vec<Relation>> {
        let group_code = if ctx.row.has(fields::RELATION_GROUP) {
            ctx.row.value(fields::RELATION_GROUP).map(str::to_string)
        } else {
            previous.and_then(|p| p.links.iter().find_map(|l| l.group_code.clone()))
        };

        let mut relations = Vec::new();
        for (field, kind) in LINK_FIELDS {
            let targets: Vec<u64> = if ctx.row.has(field) {
                let mut ids = Vec::new();
                for raw in self.set(ctx.row, field) {
                    let key = LinkKey::parse(&raw);
                    match store.find_item(&key.natural_key())? {
                        Some(target) if target.id == item.id => {
                            ctx.warn(field, format!("Item '{}' cannot link to itself; link skipped", key));
                        }
                        Some(target) => ids.push(target.id),
                        None => ctx.pending_links.push(PendingLink {
                            line: ctx.row.line,
                            field,
                            kind,
                            key,
                            group_code: group_code.clone(),
                        }),
                    }
                }
                ids
            } else {
                previous
                    .map(|p| p.links_of(kind).map(|l| l.target_id).collect())
                    .unwrap_or_default()
            };
            relations.extend(targets.into_iter().map(|target_id| Relation::Link {
                target_id,
                kind,
                group_code: group_code.clone(),
            }));
        }
        Ok(relations)
    }
}

/// Split keeping empty positions, for columns aligned by index.
fn positional(value: Option<&str>, separator: &str) -> Vec<String> {
    match value {
        Some(v) if !v.is_empty() && !separator.is_empty() => {
            v.split(separator).map(|s| s.trim().to_string()).collect()
        }
        Some(v) if !v.is_empty() => vec![v.trim().to_string()],
        _ => Vec::new(),
    }
}

/// Append the type's default extension to a bare filename.
pub fn with_extension(filename: &str, file_type: FileType) -> String {
    match file_type.default_extension() {
        Some(ext) if Path::new(filename).extension().is_none() => format!("{}.{}", filename, ext),
        _ => filename.to_string(),
    }
}

/// Parse a year cell, tolerating uncertainty markers (`1998?`, `c. 1850`, `[1923]`).
pub fn parse_year(raw: &str) -> Option<i64> {
    first_integer(YEAR_MARKERS.replace_all(raw, "").trim())
}

/// Parse a page-count cell: the first integer wins (`120 p.`, `x, 96`).
pub fn parse_page_count(raw: &str) -> Option<i64> {
    first_integer(raw)
}

fn first_integer(text: &str) -> Option<i64> {
    INTEGER.find(text).and_then(|m| m.as_str().parse::<i64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CreateMissing;
    use crate::models::AccessLevel;
    use crate::storage::InMemoryStore;

    fn builder(config: &ImportConfig) -> AggregateBuilder {
        AggregateBuilder::new(config, RelationshipResolver::new(config))
    }

    fn build(store: &mut InMemoryStore, b: &AggregateBuilder, existing: Option<&CatalogItem>, row: DecodedRow) -> BuildOutcome {
        store.begin().unwrap();
        let outcome = b.build_or_update(store, existing, &row, BuildOptions::default()).unwrap();
        store.commit().unwrap();
        outcome
    }

    #[test]
    fn test_parse_year_markers() {
        assert_eq!(parse_year("1998?"), Some(1998));
        assert_eq!(parse_year("c. 1850"), Some(1850));
        assert_eq!(parse_year("[1923]"), Some(1923));
        assert_eq!(parse_year("unknown"), None);
        assert_eq!(parse_page_count("120 p."), Some(120));
    }

    #[test]
    fn test_with_extension() {
        assert_eq!(with_extension("manual", FileType::Document), "manual.pdf");
        assert_eq!(with_extension("cover.png", FileType::Thumbnail), "cover.png");
        assert_eq!(with_extension("https://v.example/x", FileType::ExternalVideo), "https://v.example/x");
    }

    #[test]
    fn test_create_with_relationships() {
        let config = ImportConfig::default().with_create_missing(CreateMissing::all());
        let b = builder(&config);
        let mut store = InMemoryStore::new();

        let row = DecodedRow::new(2)
            .with(fields::INTERNAL_ID, "A1")
            .with(fields::TITLE, "Clean Water")
            .with(fields::PUBLICATION_YEAR, "1998?")
            .with(fields::ACCESS_LEVEL, "L")
            .with(fields::PUBLISHER, "Acme")
            .with(fields::LANGUAGES, "English")
            .with(fields::SECONDARY_LANGUAGES, "French|English")
            .with(fields::AUTHORS, "Ann|Bob")
            .with(fields::OTHER_CREATORS, "Tess|Ed")
            .with(fields::OTHER_CREATOR_ROLES, "Translated by|")
            .with(fields::DOCUMENT_FILES, "manual|annex.pdf")
            .with(fields::GENRES, "Manual");

        let outcome = build(&mut store, &b, None, row);
        assert_eq!(outcome.action, RowAction::Created);
        assert!(outcome.warnings.is_empty());

        let agg = store.load_aggregate(outcome.item.id).unwrap().unwrap();
        assert_eq!(agg.item.fields.publication_year, Some(1998));
        assert_eq!(agg.item.fields.access_level, AccessLevel::Limited);
        assert!(agg.item.fields.is_active);
        assert_eq!(agg.publisher.as_ref().unwrap().name, "Acme");
        // English is primary only; not repeated as secondary.
        assert_eq!(agg.languages.len(), 2);
        assert_eq!(agg.nth_creator(CreatorRole::Author, 1).unwrap().creator.name, "Bob");

        let others = agg.creators_where(|c| c.role_description.is_some());
        assert_eq!(others[0].role, CreatorRole::Translator);
        assert_eq!(others[1].role_description.as_deref(), Some(DEFAULT_ROLE_TEXT));

        let docs = agg.files_of(FileType::Document);
        assert_eq!(docs[0].filename, "manual.pdf");
        assert!(docs[0].is_primary);
        assert!(!docs[1].is_primary);
    }

    #[test]
    fn test_missing_language_is_a_warning() {
        let config = ImportConfig::default();
        let b = builder(&config);
        let mut store = InMemoryStore::new();

        let row = DecodedRow::new(5)
            .with(fields::INTERNAL_ID, "A1")
            .with(fields::TITLE, "T")
            .with(fields::LANGUAGES, "Klingon");
        let outcome = build(&mut store, &b, None, row);

        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].row, Some(5));
        assert!(outcome.warnings[0].message.contains("Klingon"));
        assert_eq!(store.relation_count(RelationCategory::Languages), 0);
    }

    #[test]
    fn test_update_replaces_touched_categories_only() {
        let config = ImportConfig::default();
        let b = builder(&config);
        let mut store = InMemoryStore::new();

        let first = DecodedRow::new(2)
            .with(fields::INTERNAL_ID, "A1")
            .with(fields::TITLE, "T")
            .with(fields::KEYWORDS, "water|soil")
            .with(fields::AUTHORS, "Ann")
            .with(fields::ILLUSTRATORS, "Ivy");
        let created = build(&mut store, &b, None, first).item;

        let second = DecodedRow::new(2)
            .with(fields::INTERNAL_ID, "A1")
            .with(fields::TITLE, "T2")
            .with(fields::AUTHORS, "Bob");
        let outcome = build(&mut store, &b, Some(&created), second);
        assert_eq!(outcome.action, RowAction::Updated);

        let agg = store.load_aggregate(created.id).unwrap().unwrap();
        assert_eq!(agg.item.fields.title, "T2");
        assert_eq!(agg.keywords, vec!["water", "soil"]);
        assert_eq!(agg.creators.len(), 2);
        assert_eq!(agg.nth_creator(CreatorRole::Author, 0).unwrap().creator.name, "Bob");
        assert_eq!(agg.nth_creator(CreatorRole::Illustrator, 0).unwrap().creator.name, "Ivy");
    }

    #[test]
    fn test_links_resolved_by_natural_key() {
        let config = ImportConfig::default();
        let b = builder(&config);
        let mut store = InMemoryStore::new();

        build(&mut store, &b, None, DecodedRow::new(2).with(fields::INTERNAL_ID, "EN-1").with(fields::TITLE, "Original"));
        let row = DecodedRow::new(3)
            .with(fields::INTERNAL_ID, "FR-1")
            .with(fields::TITLE, "Traduction")
            .with(fields::TRANSLATION_OF, "EN-1|NOPE")
            .with(fields::RELATION_GROUP, "G7");
        let outcome = build(&mut store, &b, None, row);

        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.pending_links.len(), 1);
        assert_eq!(outcome.pending_links[0].key, LinkKey::InternalId("NOPE".into()));
        assert_eq!(outcome.pending_links[0].group_code.as_deref(), Some("G7"));
        let agg = store.load_aggregate(outcome.item.id).unwrap().unwrap();
        assert_eq!(agg.links.len(), 1);
        assert_eq!(agg.links[0].target_key, "EN-1");
        assert_eq!(agg.links[0].group_code.as_deref(), Some("G7"));
    }

    #[test]
    fn test_pending_links_attach_once_target_exists() {
        let config = ImportConfig::default();
        let b = builder(&config);
        let mut store = InMemoryStore::new();

        let row = DecodedRow::new(2)
            .with(fields::INTERNAL_ID, "A1")
            .with(fields::TITLE, "One")
            .with(fields::RELATED_ITEMS, "B1|A1|Z9");
        let outcome = build(&mut store, &b, None, row);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].message.contains("itself"));
        assert_eq!(outcome.pending_links.len(), 2);

        build(&mut store, &b, None, DecodedRow::new(3).with(fields::INTERNAL_ID, "B1").with(fields::TITLE, "Two"));

        store.begin().unwrap();
        let warnings = b
            .attach_pending_links(&mut store, outcome.item.id, &outcome.pending_links)
            .unwrap();
        store.commit().unwrap();

        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].row, Some(2));
        assert_eq!(warnings[0].message, "Linked item 'Z9' not found; link skipped");
        let agg = store.load_aggregate(outcome.item.id).unwrap().unwrap();
        assert_eq!(agg.links.len(), 1);
        assert_eq!(agg.links[0].target_key, "B1");
        assert_eq!(agg.links[0].kind, LinkKind::Related);
    }

    #[test]
    fn test_code_link_does_not_match_internal_id() {
        let config = ImportConfig::default();
        let b = builder(&config);
        let mut store = InMemoryStore::new();

        let by_id = build(&mut store, &b, None, DecodedRow::new(2).with(fields::INTERNAL_ID, "C1").with(fields::TITLE, "Id"));
        let by_code = build(&mut store, &b, None, DecodedRow::new(3).with(fields::CATALOG_CODE, "C1").with(fields::TITLE, "Code"));
        let row = DecodedRow::new(4)
            .with(fields::INTERNAL_ID, "L1")
            .with(fields::TITLE, "Linker")
            .with(fields::RELATED_ITEMS, "code:C1")
            .with(fields::TRANSLATION_OF, "C1");
        let outcome = build(&mut store, &b, None, row);
        assert!(outcome.pending_links.is_empty());

        let agg = store.load_aggregate(outcome.item.id).unwrap().unwrap();
        let related: Vec<_> = agg.links_of(LinkKind::Related).collect();
        assert_eq!(related[0].target_id, by_code.item.id);
        assert_eq!(related[0].target_key, "code:C1");
        let original: Vec<_> = agg.links_of(LinkKind::TranslationOf).collect();
        assert_eq!(original[0].target_id, by_id.item.id);
        assert_eq!(original[0].target_key, "C1");
    }

    #[test]
    fn test_empty_access_keeps_stored_level_on_update() {
        let config = ImportConfig::default();
        let b = builder(&config);
        let mut store = InMemoryStore::new();

        let row = |access: &str| {
            DecodedRow::new(2)
                .with(fields::INTERNAL_ID, "A1")
                .with(fields::TITLE, "One")
                .with(fields::ACCESS_LEVEL, access)
        };
        let created = build(&mut store, &b, None, row("Y")).item;
        assert_eq!(created.fields.access_level, AccessLevel::Full);

        let updated = build(&mut store, &b, Some(&created), row("")).item;
        assert_eq!(updated.fields.access_level, AccessLevel::Full);

        let fresh = build(&mut store, &b, None, row("").with(fields::INTERNAL_ID, "A2")).item;
        assert_eq!(fresh.fields.access_level, AccessLevel::default());
    }

    #[test]
    fn test_unknown_access_code_stored_as_unavailable() {
        let config = ImportConfig::default();
        let b = builder(&config);
        let mut store = InMemoryStore::new();

        let row = DecodedRow::new(2)
            .with(fields::INTERNAL_ID, "A1")
            .with(fields::TITLE, "One")
            .with(fields::ACCESS_LEVEL, "Y");
        let created = build(&mut store, &b, None, row).item;

        let row = DecodedRow::new(2)
            .with(fields::INTERNAL_ID, "A1")
            .with(fields::TITLE, "One")
            .with(fields::ACCESS_LEVEL, "Q");
        let updated = build(&mut store, &b, Some(&created), row).item;
        assert_eq!(updated.fields.access_level, AccessLevel::Unavailable);
    }

    #[test]
    fn test_empty_title_rejected() {
        let config = ImportConfig::default();
        let b = builder(&config);
        let mut store = InMemoryStore::new();
        let row = DecodedRow::new(2).with(fields::INTERNAL_ID, "A1").with(fields::TITLE, "");
        let err = b
            .build_or_update(&mut store, None, &row, BuildOptions::default())
            .unwrap_err();
        assert_eq!(err.field(), Some(fields::TITLE));
    }

    #[test]
    fn test_clear_identifiers_for_duplicates() {
        let config = ImportConfig::default();
        let b = builder(&config);
        let mut store = InMemoryStore::new();
        let row = DecodedRow::new(2).with(fields::INTERNAL_ID, "A1").with(fields::TITLE, "T");
        build(&mut store, &b, None, row.clone());

        let options = BuildOptions { clear_identifiers: true };
        let outcome = b.build_or_update(&mut store, None, &row, options).unwrap();
        assert_eq!(outcome.item.fields.internal_id, None);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(store.item_count(), 2);
    }
}
