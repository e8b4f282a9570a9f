//! Domain models for the catalog import/export engine.
//!
//! - [`CatalogItem`] - scalar attributes of one catalog record
//! - [`CatalogAggregate`] - an item with all of its relationship collections
//! - [`Entity`] - a shared, name-keyed referenced record (publisher, language...)
//! - [`Relation`] - one relationship row owned by an item
//! - [`AccessLevel`], [`CreatorRole`], [`FileType`], [`LibrarySystem`], [`LinkKind`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Surrogate id assigned by storage.
pub type ItemId = u64;

/// Surrogate id of a shared entity.
pub type EntityId = u64;

// =============================================================================
// Access Level
// =============================================================================

/// Tri-state availability of an item's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Full,
    Limited,
    /// Most restrictive; used when a code is not recognised.
    #[default]
    Unavailable,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Limited => "limited",
            Self::Unavailable => "unavailable",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "full" => Some(Self::Full),
            "limited" => Some(Self::Limited),
            "unavailable" => Some(Self::Unavailable),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Creator Role
// =============================================================================

/// Role of a creator on an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatorRole {
    Author,
    Illustrator,
    Translator,
    Editor,
    Compiler,
    Adapter,
    /// Fallback for free-text roles that match no keyword.
    Contributor,
}

impl CreatorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Author => "author",
            Self::Illustrator => "illustrator",
            Self::Translator => "translator",
            Self::Editor => "editor",
            Self::Compiler => "compiler",
            Self::Adapter => "adapter",
            Self::Contributor => "contributor",
        }
    }

    /// Classify a free-text role description ("translated by", "Illustrations").
    ///
    /// Matching is by substring on the lowercased text, checked in a fixed
    /// order; anything unmatched is a [`CreatorRole::Contributor`].
    pub fn classify(role_text: &str) -> Self {
        let text = role_text.to_lowercase();
        const KEYWORDS: &[(&str, CreatorRole)] = &[
            ("translat", CreatorRole::Translator),
            ("edit", CreatorRole::Editor),
            ("illustrat", CreatorRole::Illustrator),
            ("compil", CreatorRole::Compiler),
            ("adapt", CreatorRole::Adapter),
        ];
        KEYWORDS
            .iter()
            .find(|(needle, _)| text.contains(needle))
            .map(|(_, role)| *role)
            .unwrap_or(CreatorRole::Contributor)
    }
}

impl std::fmt::Display for CreatorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Files
// =============================================================================

/// Kind of file attached to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Document,
    Thumbnail,
    Audio,
    ExternalVideo,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Thumbnail => "thumbnail",
            Self::Audio => "audio",
            Self::ExternalVideo => "external_video",
        }
    }

    /// Extension appended to a bare filename of this type.
    ///
    /// External videos are URLs and never get one.
    pub fn default_extension(&self) -> Option<&'static str> {
        match self {
            Self::Document => Some("pdf"),
            Self::Thumbnail => Some("jpg"),
            Self::Audio => Some("mp3"),
            Self::ExternalVideo => None,
        }
    }
}

/// A file attached to an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFile {
    pub file_type: FileType,
    pub filename: String,
    pub is_primary: bool,
    pub sort_order: u32,
}

// =============================================================================
// Library References
// =============================================================================

/// External library catalog an item may be registered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibrarySystem {
    WorldCat,
    OpenLibrary,
}

impl LibrarySystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorldCat => "worldcat",
            Self::OpenLibrary => "open_library",
        }
    }
}

/// Record identifier of the item in an external library catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryReference {
    pub system: LibrarySystem,
    pub reference: String,
}

// =============================================================================
// Links
// =============================================================================

/// Kind of directed link between two items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Related,
    TranslationOf,
}

impl LinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Related => "related",
            Self::TranslationOf => "translation_of",
        }
    }
}

// =============================================================================
// Shared Entities
// =============================================================================

/// Kinds of shared records resolved by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "slug", rename_all = "snake_case")]
pub enum EntityKind {
    Collection,
    Publisher,
    Language,
    Creator,
    Location,
    /// Classification value; the payload is the classification-type slug.
    Classification(String),
}

impl EntityKind {
    pub fn label(&self) -> String {
        match self {
            Self::Collection => "collection".to_string(),
            Self::Publisher => "publisher".to_string(),
            Self::Language => "language".to_string(),
            Self::Creator => "creator".to_string(),
            Self::Location => "location".to_string(),
            Self::Classification(slug) => format!("{} classification", slug),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// A shared record referenced by items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub name: String,
    pub is_active: bool,
}

// =============================================================================
// Catalog Item
// =============================================================================

/// Natural key used to match a row to an existing item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NaturalKey {
    pub internal_id: Option<String>,
    pub catalog_code: Option<String>,
}

impl NaturalKey {
    pub fn is_empty(&self) -> bool {
        self.internal_id.is_none() && self.catalog_code.is_none()
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.internal_id, &self.catalog_code) {
            (Some(id), _) => write!(f, "{}", id),
            (None, Some(code)) => write!(f, "code {}", code),
            (None, None) => f.write_str("(no key)"),
        }
    }
}

/// Scalar attributes written by the importer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFields {
    pub internal_id: Option<String>,
    pub catalog_code: Option<String>,
    pub title: String,
    pub subtitle: Option<String>,
    pub isbn: Option<String>,
    pub edition: Option<String>,
    pub description: Option<String>,
    pub publication_year: Option<i32>,
    pub page_count: Option<u32>,
    pub access_level: AccessLevel,
    pub is_active: bool,
    pub is_featured: bool,
    pub collection_id: Option<EntityId>,
    pub publisher_id: Option<EntityId>,
}

/// A stored catalog item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: ItemId,
    #[serde(flatten)]
    pub fields: ItemFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogItem {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            internal_id: self.fields.internal_id.clone(),
            catalog_code: self.fields.catalog_code.clone(),
        }
    }

    /// Key used when other items link to this one.
    pub fn link_key(&self) -> Option<LinkKey> {
        match (&self.fields.internal_id, &self.fields.catalog_code) {
            (Some(id), _) => Some(LinkKey::InternalId(id.clone())),
            (None, Some(code)) => Some(LinkKey::CatalogCode(code.clone())),
            (None, None) => None,
        }
    }
}

/// Marks a link cell that names its target by catalog code.
pub const CATALOG_CODE_LINK_PREFIX: &str = "code:";

/// Target of a link cell.
///
/// Items with an internal id are linked by it; items that only carry a
/// catalog code are written as `code:<catalog code>` so the two key spaces
/// never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkKey {
    InternalId(String),
    CatalogCode(String),
}

impl LinkKey {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(CATALOG_CODE_LINK_PREFIX) {
            Some(code) => LinkKey::CatalogCode(code.trim().to_string()),
            None => LinkKey::InternalId(raw.to_string()),
        }
    }

    /// Lookup key. A bare key falls back to the catalog code when no item
    /// has it as internal id, so hand-written files can use either.
    pub fn natural_key(&self) -> NaturalKey {
        match self {
            LinkKey::InternalId(key) => NaturalKey {
                internal_id: Some(key.clone()),
                catalog_code: Some(key.clone()),
            },
            LinkKey::CatalogCode(code) => NaturalKey {
                internal_id: None,
                catalog_code: Some(code.clone()),
            },
        }
    }
}

impl std::fmt::Display for LinkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkKey::InternalId(id) => f.write_str(id),
            LinkKey::CatalogCode(code) => write!(f, "{}{}", CATALOG_CODE_LINK_PREFIX, code),
        }
    }
}

// =============================================================================
// Relationships
// =============================================================================

/// Relationship collections an item owns; each is rebuilt as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationCategory {
    Languages,
    Creators,
    Classifications,
    Locations,
    Keywords,
    Files,
    LibraryReferences,
    Links,
}

impl RelationCategory {
    pub const ALL: [RelationCategory; 8] = [
        Self::Languages,
        Self::Creators,
        Self::Classifications,
        Self::Locations,
        Self::Keywords,
        Self::Files,
        Self::LibraryReferences,
        Self::Links,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Languages => "languages",
            Self::Creators => "creators",
            Self::Classifications => "classifications",
            Self::Locations => "locations",
            Self::Keywords => "keywords",
            Self::Files => "files",
            Self::LibraryReferences => "library_references",
            Self::Links => "links",
        }
    }
}

/// One relationship row, as handed to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum Relation {
    Language {
        language_id: EntityId,
        is_primary: bool,
    },
    Creator {
        creator_id: EntityId,
        role: CreatorRole,
        sort_order: u32,
        /// Original free-text role; only set for "other creator" entries.
        role_description: Option<String>,
    },
    Classification {
        value_id: EntityId,
    },
    Location {
        location_id: EntityId,
    },
    Keyword {
        keyword: String,
    },
    File(ItemFile),
    LibraryReference(LibraryReference),
    Link {
        target_id: ItemId,
        kind: LinkKind,
        group_code: Option<String>,
    },
}

impl Relation {
    pub fn category(&self) -> RelationCategory {
        match self {
            Relation::Language { .. } => RelationCategory::Languages,
            Relation::Creator { .. } => RelationCategory::Creators,
            Relation::Classification { .. } => RelationCategory::Classifications,
            Relation::Location { .. } => RelationCategory::Locations,
            Relation::Keyword { .. } => RelationCategory::Keywords,
            Relation::File(_) => RelationCategory::Files,
            Relation::LibraryReference(_) => RelationCategory::LibraryReferences,
            Relation::Link { .. } => RelationCategory::Links,
        }
    }
}

// =============================================================================
// Aggregate
// =============================================================================

/// A language attached to an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemLanguage {
    pub language: Entity,
    pub is_primary: bool,
}

/// A creator attached to an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCreator {
    pub creator: Entity,
    pub role: CreatorRole,
    pub sort_order: u32,
    pub role_description: Option<String>,
}

/// A directed link, with the target expressed by its natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemLink {
    pub target_id: ItemId,
    pub target_key: String,
    pub kind: LinkKind,
    pub group_code: Option<String>,
}

/// One catalog item and all of its relationship collections.
///
/// Collections keep storage insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogAggregate {
    pub item: CatalogItem,
    pub collection: Option<Entity>,
    pub publisher: Option<Entity>,
    pub languages: Vec<ItemLanguage>,
    pub creators: Vec<ItemCreator>,
    /// Classification values; the type slug lives in each entity's kind.
    pub classifications: Vec<Entity>,
    pub locations: Vec<Entity>,
    pub keywords: Vec<String>,
    pub files: Vec<ItemFile>,
    pub library_references: Vec<LibraryReference>,
    pub links: Vec<ItemLink>,
}

impl CatalogAggregate {
    /// Number of relationship rows in one category.
    pub fn relation_count(&self, category: RelationCategory) -> usize {
        match category {
            RelationCategory::Languages => self.languages.len(),
            RelationCategory::Creators => self.creators.len(),
            RelationCategory::Classifications => self.classifications.len(),
            RelationCategory::Locations => self.locations.len(),
            RelationCategory::Keywords => self.keywords.len(),
            RelationCategory::Files => self.files.len(),
            RelationCategory::LibraryReferences => self.library_references.len(),
            RelationCategory::Links => self.links.len(),
        }
    }

    /// Languages with the given primary flag, in storage order.
    pub fn languages_where(&self, primary: bool) -> impl Iterator<Item = &Entity> {
        self.languages
            .iter()
            .filter(move |l| l.is_primary == primary)
            .map(|l| &l.language)
    }

    /// Creators matching a predicate, ordered by sort order.
    pub fn creators_where<F>(&self, predicate: F) -> Vec<&ItemCreator>
    where
        F: Fn(&ItemCreator) -> bool,
    {
        let mut creators: Vec<&ItemCreator> =
            self.creators.iter().filter(|c| predicate(c)).collect();
        creators.sort_by_key(|c| c.sort_order);
        creators
    }

    /// The Nth creator (0-based) with a role from a role column.
    pub fn nth_creator(&self, role: CreatorRole, n: usize) -> Option<&ItemCreator> {
        self.creators_where(|c| c.role == role && c.role_description.is_none())
            .into_iter()
            .nth(n)
    }

    /// Classification values of one type slug, in storage order.
    pub fn classifications_of<'a>(&'a self, slug: &'a str) -> impl Iterator<Item = &'a Entity> {
        self.classifications
            .iter()
            .filter(move |e| matches!(&e.kind, EntityKind::Classification(s) if s == slug))
    }

    /// Files of one type, ordered by sort order.
    pub fn files_of(&self, file_type: FileType) -> Vec<&ItemFile> {
        let mut files: Vec<&ItemFile> =
            self.files.iter().filter(|f| f.file_type == file_type).collect();
        files.sort_by_key(|f| f.sort_order);
        files
    }

    pub fn library_reference(&self, system: LibrarySystem) -> Option<&str> {
        self.library_references
            .iter()
            .find(|r| r.system == system)
            .map(|r| r.reference.as_str())
    }

    pub fn links_of(&self, kind: LinkKind) -> impl Iterator<Item = &ItemLink> {
        self.links.iter().filter(move |l| l.kind == kind)
    }
}
