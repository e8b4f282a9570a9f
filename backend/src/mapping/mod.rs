//! Field map: the declarative link between spreadsheet columns and catalog fields.
//!
//! A [`FieldMap`] is pure data. It names every external column, the internal
//! field it feeds (or `None` for columns that are recognised but ignored),
//! whether the cell holds several separator-joined values, and the auxiliary
//! tables the codec needs in both directions:
//!
//! - the multi-value separator (global, overridable per column)
//! - access-level codes (`Y`/`N`/`L`) and boolean flag codes
//! - classification-type slugs for classification columns
//! - table prefixes recognised in a mapping-annotation row
//!
//! Like transformation matrices, field maps are serialisable and can be
//! loaded from JSON to run the engine against an alternate layout.
//!
//! ```rust,ignore
//! use catalog_csv::FieldMap;
//!
//! let map = FieldMap::catalog_default();
//! assert_eq!(map.field_for_column("Title"), Some("title"));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{ConfigError, ConfigResult};
use crate::models::AccessLevel;

/// Default multi-value separator.
pub const DEFAULT_SEPARATOR: &str = "|";

/// Internal field names produced by decode and consumed by the builder.
pub mod fields {
    pub const INTERNAL_ID: &str = "internal_id";
    pub const CATALOG_CODE: &str = "catalog_code";
    pub const TITLE: &str = "title";
    pub const SUBTITLE: &str = "subtitle";
    pub const ISBN: &str = "isbn";
    pub const EDITION: &str = "edition";
    pub const DESCRIPTION: &str = "description";
    pub const PUBLICATION_YEAR: &str = "publication_year";
    pub const PAGE_COUNT: &str = "page_count";
    pub const ACCESS_LEVEL: &str = "access_level";
    pub const IS_ACTIVE: &str = "is_active";
    pub const IS_FEATURED: &str = "is_featured";
    pub const COLLECTION: &str = "collection";
    pub const PUBLISHER: &str = "publisher";
    pub const LANGUAGES: &str = "languages";
    pub const SECONDARY_LANGUAGES: &str = "secondary_languages";
    pub const AUTHORS: &str = "authors";
    pub const ILLUSTRATORS: &str = "illustrators";
    pub const OTHER_CREATORS: &str = "other_creators";
    pub const OTHER_CREATOR_ROLES: &str = "other_creator_roles";
    pub const LOCATIONS: &str = "locations";
    pub const KEYWORDS: &str = "keywords";
    pub const DOCUMENT_FILES: &str = "document_files";
    pub const THUMBNAIL_FILES: &str = "thumbnail_files";
    pub const AUDIO_FILES: &str = "audio_files";
    pub const VIDEO_URLS: &str = "video_urls";
    pub const WORLDCAT_REF: &str = "worldcat_ref";
    pub const OPENLIBRARY_REF: &str = "openlibrary_ref";
    pub const RELATED_ITEMS: &str = "related_items";
    pub const TRANSLATION_OF: &str = "translation_of";
    pub const RELATION_GROUP: &str = "relation_group";
    pub const GENRES: &str = "genres";
    pub const SUBJECTS: &str = "subjects";
    pub const READING_LEVELS: &str = "reading_levels";
    pub const RESOURCE_TYPES: &str = "resource_types";
}

// =============================================================================
// Entries
// =============================================================================

/// One external column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapEntry {
    /// Column name as it appears in the header row.
    pub column: String,

    /// Internal field fed by this column; `None` means "ignored column".
    #[serde(default)]
    pub field: Option<String>,

    /// Whether the cell holds several separator-joined values.
    #[serde(default)]
    pub multi_valued: bool,

    /// Separator override for this column.
    #[serde(default)]
    pub separator: Option<String>,

    /// Whether the column must be present in the header.
    #[serde(default)]
    pub required: bool,

    /// `table.column` reference emitted in a mapping-annotation row.
    #[serde(default)]
    pub annotation: Option<String>,
}

impl FieldMapEntry {
    fn new(column: &str, field: Option<&str>, annotation: &str) -> Self {
        Self {
            column: column.to_string(),
            field: field.map(str::to_string),
            multi_valued: false,
            separator: None,
            required: false,
            annotation: Some(annotation.to_string()),
        }
    }

    fn multi(mut self) -> Self {
        self.multi_valued = true;
        self
    }

    fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// External code for an access level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCode {
    pub code: String,
    pub level: AccessLevel,
}

/// Accepted spellings of boolean flag columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BooleanCodes {
    pub true_values: Vec<String>,
    pub false_values: Vec<String>,
    /// Code written on export for `true`.
    pub export_true: String,
    /// Code written on export for `false`.
    pub export_false: String,
}

impl Default for BooleanCodes {
    fn default() -> Self {
        Self {
            true_values: ["y", "yes", "true", "1"].iter().map(|s| s.to_string()).collect(),
            false_values: ["n", "no", "false", "0"].iter().map(|s| s.to_string()).collect(),
            export_true: "Y".to_string(),
            export_false: "N".to_string(),
        }
    }
}

/// A classification column and the classification type it feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationType {
    pub field: String,
    pub slug: String,
}

// =============================================================================
// Field Map
// =============================================================================

/// The complete column table plus its auxiliary translation tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMap {
    /// Column entries, in export order.
    pub entries: Vec<FieldMapEntry>,

    /// Global multi-value separator.
    #[serde(default = "default_separator")]
    pub separator: String,

    /// Access-level code table.
    #[serde(default = "default_access_codes")]
    pub access_codes: Vec<AccessCode>,

    /// Boolean flag code table.
    #[serde(default)]
    pub boolean_codes: BooleanCodes,

    /// Classification columns and their type slugs.
    #[serde(default)]
    pub classification_types: Vec<ClassificationType>,

    /// Table prefixes that identify a mapping-annotation row.
    #[serde(default)]
    pub annotation_prefixes: Vec<String>,
}

fn default_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}

fn default_access_codes() -> Vec<AccessCode> {
    vec![
        AccessCode { code: "Y".into(), level: AccessLevel::Full },
        AccessCode { code: "N".into(), level: AccessLevel::Unavailable },
        AccessCode { code: "L".into(), level: AccessLevel::Limited },
    ]
}

impl FieldMap {
    /// The standard catalog spreadsheet layout.
    pub fn catalog_default() -> Self {
        use fields::*;

        let entries = vec![
            FieldMapEntry::new("ID", Some(INTERNAL_ID), "catalog_items.internal_id").required(),
            FieldMapEntry::new("Catalog Code", Some(CATALOG_CODE), "catalog_items.catalog_code"),
            FieldMapEntry::new("Title", Some(TITLE), "catalog_items.title").required(),
            FieldMapEntry::new("Subtitle", Some(SUBTITLE), "catalog_items.subtitle"),
            FieldMapEntry::new("ISBN", Some(ISBN), "catalog_items.isbn"),
            FieldMapEntry::new("Edition", Some(EDITION), "catalog_items.edition"),
            FieldMapEntry::new("Description", Some(DESCRIPTION), "catalog_items.description"),
            FieldMapEntry::new("Year", Some(PUBLICATION_YEAR), "catalog_items.publication_year"),
            FieldMapEntry::new("Pages", Some(PAGE_COUNT), "catalog_items.page_count"),
            FieldMapEntry::new("Access", Some(ACCESS_LEVEL), "catalog_items.access_level"),
            FieldMapEntry::new("Active", Some(IS_ACTIVE), "catalog_items.is_active"),
            FieldMapEntry::new("Featured", Some(IS_FEATURED), "catalog_items.is_featured"),
            FieldMapEntry::new("Collection", Some(COLLECTION), "collections.name"),
            FieldMapEntry::new("Publisher", Some(PUBLISHER), "publishers.name"),
            FieldMapEntry::new("Language", Some(LANGUAGES), "languages.name").multi(),
            FieldMapEntry::new("Other Languages", Some(SECONDARY_LANGUAGES), "languages.name").multi(),
            FieldMapEntry::new("Author", Some(AUTHORS), "creators.name").multi(),
            FieldMapEntry::new("Illustrator", Some(ILLUSTRATORS), "creators.name").multi(),
            FieldMapEntry::new("Other Creator", Some(OTHER_CREATORS), "creators.name").multi(),
            FieldMapEntry::new("Other Creator Role", Some(OTHER_CREATOR_ROLES), "item_creators.role_description").multi(),
            FieldMapEntry::new("Genre", Some(GENRES), "classification_values.genre").multi(),
            FieldMapEntry::new("Subject", Some(SUBJECTS), "classification_values.subject").multi(),
            FieldMapEntry::new("Reading Level", Some(READING_LEVELS), "classification_values.reading_level").multi(),
            FieldMapEntry::new("Resource Type", Some(RESOURCE_TYPES), "classification_values.resource_type").multi(),
            FieldMapEntry::new("Region", Some(LOCATIONS), "locations.name").multi(),
            FieldMapEntry::new("Keywords", Some(KEYWORDS), "item_keywords.keyword").multi(),
            FieldMapEntry::new("Document File", Some(DOCUMENT_FILES), "item_files.document").multi(),
            FieldMapEntry::new("Thumbnail", Some(THUMBNAIL_FILES), "item_files.thumbnail").multi(),
            FieldMapEntry::new("Audio File", Some(AUDIO_FILES), "item_files.audio").multi(),
            FieldMapEntry::new("Video URL", Some(VIDEO_URLS), "item_files.external_video").multi(),
            FieldMapEntry::new("WorldCat", Some(WORLDCAT_REF), "library_references.worldcat"),
            FieldMapEntry::new("Open Library", Some(OPENLIBRARY_REF), "library_references.open_library"),
            FieldMapEntry::new("Related Items", Some(RELATED_ITEMS), "item_links.related").multi(),
            FieldMapEntry::new("Translation Of", Some(TRANSLATION_OF), "item_links.translation_of").multi(),
            FieldMapEntry::new("Relation Group", Some(RELATION_GROUP), "item_links.group_code"),
            // Statistics are owned by the catalog, never imported.
            FieldMapEntry::new("Views", None, "catalog_items.view_count"),
            FieldMapEntry::new("Downloads", None, "catalog_items.download_count"),
        ];

        let classification_types = [
            (GENRES, "genre"),
            (SUBJECTS, "subject"),
            (READING_LEVELS, "reading-level"),
            (RESOURCE_TYPES, "resource-type"),
        ]
        .iter()
        .map(|(field, slug)| ClassificationType {
            field: field.to_string(),
            slug: slug.to_string(),
        })
        .collect();

        let annotation_prefixes = [
            "catalog_items",
            "collections",
            "publishers",
            "languages",
            "creators",
            "item_creators",
            "classification_values",
            "locations",
            "item_keywords",
            "item_files",
            "library_references",
            "item_links",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        Self {
            entries,
            separator: default_separator(),
            access_codes: default_access_codes(),
            boolean_codes: BooleanCodes::default(),
            classification_types,
            annotation_prefixes,
        }
    }

    /// Parse a field map from a JSON string and check its invariants.
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let map: FieldMap = serde_json::from_str(json)?;
        map.validate()?;
        Ok(map)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> ConfigResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check structural invariants: unique columns, unique internal fields,
    /// non-empty separators.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut columns: HashSet<String> = HashSet::new();
        let mut fields: HashMap<&str, &str> = HashMap::new();

        if self.separator.is_empty() {
            return Err(ConfigError::EmptySeparator("(global)".to_string()));
        }

        for entry in &self.entries {
            if !columns.insert(normalize(&entry.column)) {
                return Err(ConfigError::DuplicateColumn(entry.column.clone()));
            }
            if entry.separator.as_deref() == Some("") {
                return Err(ConfigError::EmptySeparator(entry.column.clone()));
            }
            if let Some(field) = entry.field.as_deref() {
                if let Some(first) = fields.insert(field, &entry.column) {
                    return Err(ConfigError::DuplicateField {
                        field: field.to_string(),
                        first: first.to_string(),
                        second: entry.column.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Look up a header cell. Matching ignores case and surrounding spaces.
    pub fn entry_for_column(&self, column: &str) -> Option<&FieldMapEntry> {
        let wanted = normalize(column);
        self.entries.iter().find(|e| normalize(&e.column) == wanted)
    }

    /// Internal field fed by a header cell, if mapped.
    pub fn field_for_column(&self, column: &str) -> Option<&str> {
        self.entry_for_column(column).and_then(|e| e.field.as_deref())
    }

    /// Entry feeding an internal field.
    pub fn entry_for_field(&self, field: &str) -> Option<&FieldMapEntry> {
        self.entries.iter().find(|e| e.field.as_deref() == Some(field))
    }

    /// All external columns, in declaration order.
    pub fn columns(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.column.clone()).collect()
    }

    /// Columns that must be present in every file.
    pub fn required_columns(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.required)
            .map(|e| e.column.as_str())
            .collect()
    }

    /// Separator used for an internal field.
    pub fn separator_for(&self, field: &str) -> &str {
        self.entry_for_field(field)
            .and_then(|e| e.separator.as_deref())
            .unwrap_or(&self.separator)
    }

    /// Whether an internal field is multi-valued.
    pub fn is_multi_valued(&self, field: &str) -> bool {
        self.entry_for_field(field).is_some_and(|e| e.multi_valued)
    }

    /// Annotation cell for each header, empty where none is declared.
    pub fn annotation_row(&self, headers: &[String]) -> Vec<String> {
        headers
            .iter()
            .map(|h| {
                self.entry_for_column(h)
                    .and_then(|e| e.annotation.clone())
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Translate an external access code. Case-insensitive.
    pub fn access_level_for_code(&self, code: &str) -> Option<AccessLevel> {
        let code = code.trim();
        self.access_codes
            .iter()
            .find(|c| c.code.eq_ignore_ascii_case(code))
            .map(|c| c.level)
    }

    /// External code for an access level (first declared wins).
    pub fn code_for_access_level(&self, level: AccessLevel) -> &str {
        self.access_codes
            .iter()
            .find(|c| c.level == level)
            .map(|c| c.code.as_str())
            .unwrap_or("")
    }

    /// Parse a boolean flag cell. `None` when the spelling is unknown.
    pub fn parse_flag(&self, value: &str) -> Option<bool> {
        let value = value.trim().to_lowercase();
        let codes = &self.boolean_codes;
        if codes.true_values.iter().any(|v| v.to_lowercase() == value) {
            Some(true)
        } else if codes.false_values.iter().any(|v| v.to_lowercase() == value) {
            Some(false)
        } else {
            None
        }
    }

    /// Export code for a boolean flag.
    pub fn flag_code(&self, value: bool) -> &str {
        if value {
            &self.boolean_codes.export_true
        } else {
            &self.boolean_codes.export_false
        }
    }

    /// Classification-type slug fed by an internal field.
    pub fn classification_slug(&self, field: &str) -> Option<&str> {
        self.classification_types
            .iter()
            .find(|c| c.field == field)
            .map(|c| c.slug.as_str())
    }
}

impl Default for FieldMap {
    fn default() -> Self {
        Self::catalog_default()
    }
}

fn normalize(column: &str) -> String {
    column.trim().to_lowercase()
}

// =============================================================================
// Multi-value cells
// =============================================================================

/// Split a multi-value cell: trims each part and drops empty parts.
pub fn split_values(value: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        let value = value.trim();
        return if value.is_empty() { vec![] } else { vec![value.to_string()] };
    }
    value
        .split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join values into a multi-value cell.
pub fn join_values<I, S>(values: I, separator: &str) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| v.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_map_is_valid() {
        let map = FieldMap::catalog_default();
        assert!(map.validate().is_ok());
        assert_eq!(map.required_columns(), vec!["ID", "Title"]);
    }

    #[test]
    fn test_column_lookup_ignores_case() {
        let map = FieldMap::catalog_default();
        assert_eq!(map.field_for_column(" title "), Some(fields::TITLE));
        assert_eq!(map.field_for_column("Views"), None);
        assert!(map.entry_for_column("Views").is_some());
        assert!(map.entry_for_column("Shelf").is_none());
    }

    #[test]
    fn test_duplicate_internal_field_rejected() {
        let mut map = FieldMap::catalog_default();
        map.entries.push(FieldMapEntry::new("Name", Some(fields::TITLE), "catalog_items.name"));
        let err = map.validate().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateField { .. }));
        assert!(err.to_string().contains("Title"));
    }

    #[test]
    fn test_ignored_columns_may_repeat_null_field() {
        let mut map = FieldMap::catalog_default();
        map.entries.push(FieldMapEntry::new("Shelf Mark", None, "catalog_items.shelf"));
        assert!(map.validate().is_ok());
    }

    #[test]
    fn test_json_roundtrip_keeps_tables() {
        let map = FieldMap::catalog_default();
        let json = map.to_json().unwrap();
        let parsed = FieldMap::from_json(&json).unwrap();
        assert_eq!(parsed, map);
    }

    #[test]
    fn test_minimal_json_gets_defaults() {
        let json = r#"{"entries": [{"column": "Name", "field": "title", "required": true}]}"#;
        let map = FieldMap::from_json(json).unwrap();
        assert_eq!(map.separator, "|");
        assert_eq!(map.access_level_for_code("l"), Some(AccessLevel::Limited));
        assert!(!map.is_multi_valued("title"));
    }

    #[test]
    fn test_access_codes_both_directions() {
        let map = FieldMap::catalog_default();
        assert_eq!(map.access_level_for_code("Y"), Some(AccessLevel::Full));
        assert_eq!(map.access_level_for_code("X"), None);
        assert_eq!(map.code_for_access_level(AccessLevel::Limited), "L");
        assert_eq!(map.code_for_access_level(AccessLevel::Unavailable), "N");
    }

    #[test]
    fn test_parse_flag() {
        let map = FieldMap::catalog_default();
        assert_eq!(map.parse_flag("Yes"), Some(true));
        assert_eq!(map.parse_flag("0"), Some(false));
        assert_eq!(map.parse_flag("maybe"), None);
        assert_eq!(map.flag_code(true), "Y");
    }

    #[test]
    fn test_split_trims_and_drops_empty() {
        assert_eq!(split_values(" a | b ||c ", "|"), vec!["a", "b", "c"]);
        assert!(split_values("   ", "|").is_empty());
    }

    #[test]
    fn test_split_join_inverse() {
        let samples: Vec<Vec<&str>> = vec![
            vec!["one"],
            vec!["Water", "Health", "Sanitation"],
            vec!["a b", "c-d", "e,f"],
        ];
        for values in samples {
            let joined = join_values(&values, "|");
            assert_eq!(split_values(&joined, "|"), values);
        }
    }

    #[test]
    fn test_annotation_row_follows_headers() {
        let map = FieldMap::catalog_default();
        let headers = vec!["Title".to_string(), "Unknown".to_string(), "ID".to_string()];
        assert_eq!(
            map.annotation_row(&headers),
            vec!["catalog_items.title", "", "catalog_items.internal_id"]
        );
    }

    #[test]
    fn test_classification_slugs() {
        let map = FieldMap::catalog_default();
        assert_eq!(map.classification_slug(fields::READING_LEVELS), Some("reading-level"));
        assert_eq!(map.classification_slug(fields::KEYWORDS), None);
    }
}
