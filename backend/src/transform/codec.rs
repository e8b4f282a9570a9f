//! Row codec: raw CSV cells <-> internal fields.
//!
//! Both directions are driven by the same [`FieldMap`], which is what keeps
//! import and export symmetric. `decode` is total: it never fails and never
//! splits multi-value cells (the builder does that). `encode` produces exactly
//! one cell per requested header.

use std::collections::BTreeMap;

use crate::mapping::{fields, join_values, FieldMap};
use crate::models::{CatalogAggregate, CreatorRole, FileType, LibrarySystem, LinkKind};

/// One data row keyed by internal field.
///
/// A key is present when its column was present in the file, even if the
/// cell was empty. Absent keys leave the stored value untouched on update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedRow {
    /// 1-based file line.
    pub line: u64,
    pub values: BTreeMap<String, String>,
}

impl DecodedRow {
    pub fn new(line: u64) -> Self {
        Self { line, values: BTreeMap::new() }
    }

    /// Builder-style insert, mostly for tests.
    pub fn with(mut self, field: &str, value: &str) -> Self {
        self.values.insert(field.to_string(), value.trim().to_string());
        self
    }

    /// Whether the column feeding `field` was in the file.
    pub fn has(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    /// Raw trimmed value, empty string included.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.values.get(field).map(String::as_str)
    }

    /// Trimmed value, `None` when absent or empty.
    pub fn value(&self, field: &str) -> Option<&str> {
        self.get(field).filter(|v| !v.is_empty())
    }
}

/// Decode one raw row against its header.
///
/// Unmapped and ignored columns are dropped. Cells missing at the end of a
/// short row decode as empty. When two headers feed the same field the first
/// one wins; the validator reports that case.
pub fn decode(line: u64, cells: &[String], headers: &[String], map: &FieldMap) -> DecodedRow {
    let mut row = DecodedRow::new(line);
    for (index, header) in headers.iter().enumerate() {
        let Some(field) = map.field_for_column(header) else {
            continue;
        };
        let value = cells.get(index).map(|c| c.trim()).unwrap_or("");
        row.values
            .entry(field.to_string())
            .or_insert_with(|| value.to_string());
    }
    row
}

/// Encode one aggregate as a row matching `headers`.
pub fn encode(aggregate: &CatalogAggregate, headers: &[String], map: &FieldMap) -> Vec<String> {
    headers
        .iter()
        .map(|header| match map.field_for_column(header) {
            Some(field) => encode_field(aggregate, field, map),
            None => String::new(),
        })
        .collect()
}

/// Project one internal field of an aggregate to its external cell value.
pub fn encode_field(aggregate: &CatalogAggregate, field: &str, map: &FieldMap) -> String {
    let item = &aggregate.item.fields;
    let sep = map.separator_for(field);
    let text = |v: &Option<String>| v.clone().unwrap_or_default();

    match field {
        fields::INTERNAL_ID => text(&item.internal_id),
        fields::CATALOG_CODE => text(&item.catalog_code),
        fields::TITLE => item.title.clone(),
        fields::SUBTITLE => text(&item.subtitle),
        fields::ISBN => text(&item.isbn),
        fields::EDITION => text(&item.edition),
        fields::DESCRIPTION => text(&item.description),
        fields::PUBLICATION_YEAR => item.publication_year.map(|y| y.to_string()).unwrap_or_default(),
        fields::PAGE_COUNT => item.page_count.map(|p| p.to_string()).unwrap_or_default(),
        fields::ACCESS_LEVEL => map.code_for_access_level(item.access_level).to_string(),
        fields::IS_ACTIVE => map.flag_code(item.is_active).to_string(),
        fields::IS_FEATURED => map.flag_code(item.is_featured).to_string(),
        fields::COLLECTION => aggregate
            .collection
            .as_ref()
            .map(|e| e.name.clone())
            .unwrap_or_default(),
        fields::PUBLISHER => aggregate
            .publisher
            .as_ref()
            .map(|e| e.name.clone())
            .unwrap_or_default(),
        fields::LANGUAGES => join_values(aggregate.languages_where(true).map(|e| &e.name), sep),
        fields::SECONDARY_LANGUAGES => {
            join_values(aggregate.languages_where(false).map(|e| &e.name), sep)
        }
        fields::AUTHORS => creators_with_role(aggregate, CreatorRole::Author, sep),
        fields::ILLUSTRATORS => creators_with_role(aggregate, CreatorRole::Illustrator, sep),
        fields::OTHER_CREATORS => join_values(
            aggregate
                .creators_where(|c| c.role_description.is_some())
                .iter()
                .map(|c| &c.creator.name),
            sep,
        ),
        fields::OTHER_CREATOR_ROLES => join_values(
            aggregate
                .creators_where(|c| c.role_description.is_some())
                .iter()
                .map(|c| c.role_description.as_deref().unwrap_or_default()),
            sep,
        ),
        fields::LOCATIONS => join_values(aggregate.locations.iter().map(|e| &e.name), sep),
        fields::KEYWORDS => join_values(&aggregate.keywords, sep),
        fields::DOCUMENT_FILES => files(aggregate, FileType::Document, sep),
        fields::THUMBNAIL_FILES => files(aggregate, FileType::Thumbnail, sep),
        fields::AUDIO_FILES => files(aggregate, FileType::Audio, sep),
        fields::VIDEO_URLS => files(aggregate, FileType::ExternalVideo, sep),
        fields::WORLDCAT_REF => aggregate
            .library_reference(LibrarySystem::WorldCat)
            .unwrap_or_default()
            .to_string(),
        fields::OPENLIBRARY_REF => aggregate
            .library_reference(LibrarySystem::OpenLibrary)
            .unwrap_or_default()
            .to_string(),
        fields::RELATED_ITEMS => links(aggregate, LinkKind::Related, sep),
        fields::TRANSLATION_OF => links(aggregate, LinkKind::TranslationOf, sep),
        fields::RELATION_GROUP => aggregate
            .links
            .iter()
            .find_map(|l| l.group_code.clone())
            .unwrap_or_default(),
        other => match map.classification_slug(other) {
            Some(slug) => join_values(aggregate.classifications_of(slug).map(|e| &e.name), sep),
            None => String::new(),
        },
    }
}

fn creators_with_role(aggregate: &CatalogAggregate, role: CreatorRole, sep: &str) -> String {
    join_values(
        aggregate
            .creators_where(|c| c.role == role && c.role_description.is_none())
            .iter()
            .map(|c| &c.creator.name),
        sep,
    )
}

fn files(aggregate: &CatalogAggregate, file_type: FileType, sep: &str) -> String {
    join_values(aggregate.files_of(file_type).iter().map(|f| &f.filename), sep)
}

fn links(aggregate: &CatalogAggregate, kind: LinkKind, sep: &str) -> String {
    join_values(aggregate.links_of(kind).map(|l| &l.target_key), sep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AccessLevel, CatalogItem, Entity, EntityKind, ItemCreator, ItemFields, ItemFile,
        ItemLanguage,
    };
    use chrono::Utc;

    fn headers(cols: &[&str]) -> Vec<String> {
        cols.iter().map(|c| c.to_string()).collect()
    }

    fn entity(id: u64, kind: EntityKind, name: &str) -> Entity {
        Entity { id, kind, name: name.to_string(), is_active: true }
    }

    fn creator(id: u64, name: &str, role: CreatorRole, order: u32, desc: Option<&str>) -> ItemCreator {
        ItemCreator {
            creator: entity(id, EntityKind::Creator, name),
            role,
            sort_order: order,
            role_description: desc.map(str::to_string),
        }
    }

    fn sample() -> CatalogAggregate {
        CatalogAggregate {
            item: CatalogItem {
                id: 1,
                fields: ItemFields {
                    internal_id: Some("A1".into()),
                    title: "Clean Water".into(),
                    publication_year: Some(1998),
                    access_level: AccessLevel::Limited,
                    is_active: true,
                    ..Default::default()
                },
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            collection: None,
            publisher: Some(entity(9, EntityKind::Publisher, "Acme Press")),
            languages: vec![
                ItemLanguage { language: entity(2, EntityKind::Language, "French"), is_primary: false },
                ItemLanguage { language: entity(3, EntityKind::Language, "English"), is_primary: true },
            ],
            creators: vec![
                creator(4, "Second", CreatorRole::Author, 1, None),
                creator(5, "First", CreatorRole::Author, 0, None),
                creator(6, "Tran", CreatorRole::Translator, 0, Some("Translated by")),
            ],
            classifications: vec![
                entity(7, EntityKind::Classification("genre".into()), "Manual"),
                entity(8, EntityKind::Classification("subject".into()), "Health"),
            ],
            locations: vec![],
            keywords: vec!["water".into(), "wells".into()],
            files: vec![
                ItemFile { file_type: FileType::Document, filename: "b.pdf".into(), is_primary: false, sort_order: 1 },
                ItemFile { file_type: FileType::Document, filename: "a.pdf".into(), is_primary: true, sort_order: 0 },
            ],
            library_references: vec![],
            links: vec![],
        }
    }

    #[test]
    fn test_decode_trims_and_drops_unmapped() {
        let map = FieldMap::catalog_default();
        let hdr = headers(&["ID", "Title", "Shelf", "Views"]);
        let cells = headers(&[" A1 ", "  My Book", "x", "42"]);
        let row = decode(2, &cells, &hdr, &map);
        assert_eq!(row.get(fields::INTERNAL_ID), Some("A1"));
        assert_eq!(row.get(fields::TITLE), Some("My Book"));
        assert_eq!(row.values.len(), 2);
        assert_eq!(row.line, 2);
    }

    #[test]
    fn test_decode_short_row_is_empty_not_absent() {
        let map = FieldMap::catalog_default();
        let hdr = headers(&["ID", "Title", "Access"]);
        let row = decode(3, &headers(&["A1"]), &hdr, &map);
        assert!(row.has(fields::ACCESS_LEVEL));
        assert_eq!(row.value(fields::ACCESS_LEVEL), None);
    }

    #[test]
    fn test_decode_keeps_multi_values_joined() {
        let map = FieldMap::catalog_default();
        let hdr = headers(&["Keywords"]);
        let row = decode(2, &headers(&["a | b"]), &hdr, &map);
        assert_eq!(row.get(fields::KEYWORDS), Some("a | b"));
    }

    #[test]
    fn test_encode_projects_relationships() {
        let map = FieldMap::catalog_default();
        let hdr = headers(&[
            "ID", "Title", "Year", "Access", "Active", "Publisher", "Language",
            "Other Languages", "Author", "Other Creator", "Other Creator Role",
            "Genre", "Subject", "Keywords", "Document File", "Views", "Unknown",
        ]);
        let row = encode(&sample(), &hdr, &map);
        assert_eq!(
            row,
            vec![
                "A1", "Clean Water", "1998", "L", "Y", "Acme Press", "English", "French",
                "First|Second", "Tran", "Translated by", "Manual", "Health", "water|wells",
                "a.pdf|b.pdf", "", "",
            ]
        );
    }

    #[test]
    fn test_encode_follows_header_order() {
        let map = FieldMap::catalog_default();
        let row = encode(&sample(), &headers(&["Title", "ID"]), &map);
        assert_eq!(row, vec!["Clean Water", "A1"]);
    }
}
