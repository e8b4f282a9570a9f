//! Engine configuration.
//!
//! [`ImportConfig`] is built once and handed by reference to every component
//! (codec, validator, resolver, builder, orchestrator, exporter). Nothing in
//! the pipeline reads global state at call time.
//!
//! Sources, later ones overriding earlier ones:
//! 1. [`ImportConfig::default`]
//! 2. a JSON file ([`ImportConfig::from_json_file`])
//! 3. environment variables ([`ImportConfig::apply_env`]), after `.env` is loaded

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use crate::error::{ConfigError, ConfigResult};
use crate::mapping::{fields, FieldMap};
use crate::models::EntityKind;
use crate::parser::ReadOptions;

/// Default number of rows per processing chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Default number of rows inspected by a file pre-check.
pub const DEFAULT_SAMPLE_LIMIT: usize = 500;

/// Default number of aggregates fetched per export page.
pub const DEFAULT_EXPORT_CHUNK_SIZE: usize = 200;

/// Inclusive numeric bounds for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumericRange {
    pub min: i64,
    pub max: i64,
}

impl NumericRange {
    pub fn contains(&self, value: i64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Soft limits checked by the validator. Violations are warnings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationLimits {
    /// Maximum length in characters, per internal field.
    pub max_lengths: BTreeMap<String, usize>,
    /// Allowed numeric ranges, per internal field.
    pub numeric_ranges: BTreeMap<String, NumericRange>,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        let max_lengths = [
            (fields::INTERNAL_ID, 64),
            (fields::CATALOG_CODE, 64),
            (fields::TITLE, 255),
            (fields::SUBTITLE, 255),
            (fields::ISBN, 17),
            (fields::EDITION, 100),
            (fields::DESCRIPTION, 10_000),
            (fields::COLLECTION, 255),
            (fields::PUBLISHER, 255),
            (fields::RELATION_GROUP, 64),
        ]
        .into_iter()
        .map(|(f, n)| (f.to_string(), n))
        .collect();

        let numeric_ranges = [
            (fields::PUBLICATION_YEAR, NumericRange { min: 1000, max: 2100 }),
            (fields::PAGE_COUNT, NumericRange { min: 1, max: 20_000 }),
        ]
        .into_iter()
        .map(|(f, r)| (f.to_string(), r))
        .collect();

        Self { max_lengths, numeric_ranges }
    }
}

/// Whether a lookup miss creates the referenced entity, per kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateMissing {
    pub collections: bool,
    pub publishers: bool,
    /// Languages come from a controlled list and are not created by default.
    pub languages: bool,
    pub creators: bool,
    pub classifications: bool,
    pub locations: bool,
}

impl Default for CreateMissing {
    fn default() -> Self {
        Self {
            collections: true,
            publishers: true,
            languages: false,
            creators: true,
            classifications: true,
            locations: true,
        }
    }
}

impl CreateMissing {
    pub fn allows(&self, kind: &EntityKind) -> bool {
        match kind {
            EntityKind::Collection => self.collections,
            EntityKind::Publisher => self.publishers,
            EntityKind::Language => self.languages,
            EntityKind::Creator => self.creators,
            EntityKind::Location => self.locations,
            EntityKind::Classification(_) => self.classifications,
        }
    }

    /// Policy that creates every missing entity.
    pub fn all() -> Self {
        Self {
            collections: true,
            publishers: true,
            languages: true,
            creators: true,
            classifications: true,
            locations: true,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub field_map: FieldMap,
    /// Rows per processing chunk; cancellation is checked between chunks.
    pub chunk_size: usize,
    /// Rows inspected by an interactive pre-check.
    pub validation_sample_limit: usize,
    /// Aggregates fetched per export page.
    pub export_chunk_size: usize,
    pub limits: ValidationLimits,
    pub create_missing: CreateMissing,
    /// Field delimiter override; sniffed from the file when unset.
    pub delimiter: Option<char>,
    /// Encoding label override; detected from the file when unset.
    pub encoding: Option<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            field_map: FieldMap::catalog_default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            validation_sample_limit: DEFAULT_SAMPLE_LIMIT,
            export_chunk_size: DEFAULT_EXPORT_CHUNK_SIZE,
            limits: ValidationLimits::default(),
            create_missing: CreateMissing::default(),
            delimiter: None,
            encoding: None,
        }
    }
}

impl ImportConfig {
    /// Load a configuration file. Missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: ImportConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the field map with one loaded from a JSON file.
    pub fn with_field_map_file(mut self, path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        self.field_map = FieldMap::from_json(&content)?;
        Ok(self)
    }

    /// Create a configuration from defaults and environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        let _ = dotenvy::dotenv();
        Self::default().apply_env()
    }

    /// Override values from `CATALOG_CSV_*` environment variables.
    ///
    /// - `CATALOG_CSV_CHUNK_SIZE`
    /// - `CATALOG_CSV_SAMPLE_LIMIT`
    /// - `CATALOG_CSV_EXPORT_CHUNK_SIZE`
    /// - `CATALOG_CSV_SEPARATOR`
    pub fn apply_env(mut self) -> ConfigResult<Self> {
        if let Some(n) = env_usize("CATALOG_CSV_CHUNK_SIZE")? {
            self.chunk_size = n;
        }
        if let Some(n) = env_usize("CATALOG_CSV_SAMPLE_LIMIT")? {
            self.validation_sample_limit = n;
        }
        if let Some(n) = env_usize("CATALOG_CSV_EXPORT_CHUNK_SIZE")? {
            self.export_chunk_size = n;
        }
        if let Ok(sep) = env::var("CATALOG_CSV_SEPARATOR") {
            self.field_map.separator = sep;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_create_missing(mut self, create_missing: CreateMissing) -> Self {
        self.create_missing = create_missing;
        self
    }

    /// Options for opening an import file under this configuration.
    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            delimiter: self.delimiter.map(|c| c as u8),
            encoding: self.encoding.clone(),
            annotation_prefixes: self.field_map.annotation_prefixes.clone(),
        }
    }

    /// Check numeric options and the field map invariants.
    pub fn validate(&self) -> ConfigResult<()> {
        for (name, value) in [
            ("chunk_size", self.chunk_size),
            ("validation_sample_limit", self.validation_sample_limit),
            ("export_chunk_size", self.export_chunk_size),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if let Some(d) = self.delimiter {
            if !d.is_ascii() || d == '"' || d == '\n' {
                return Err(ConfigError::InvalidValue {
                    name: "delimiter".to_string(),
                    message: format!("'{}' cannot delimit CSV fields", d.escape_default()),
                });
            }
        }
        self.field_map.validate()
    }
}

fn env_usize(name: &str) -> ConfigResult<Option<usize>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                name: name.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ImportConfig::default();
        assert_eq!(config.chunk_size, 100);
        assert_eq!(config.validation_sample_limit, 500);
        assert!(config.validate().is_ok());
        assert!(!config.create_missing.allows(&EntityKind::Language));
        assert!(config.create_missing.allows(&EntityKind::Publisher));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let config = ImportConfig::default().with_chunk_size(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn test_partial_json_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"chunk_size": 25, "create_missing": {{"languages": true}}}}"#).unwrap();

        let config = ImportConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.chunk_size, 25);
        assert!(config.create_missing.languages);
        assert!(config.create_missing.publishers);
        assert_eq!(config.field_map, FieldMap::catalog_default());
    }

    #[test]
    fn test_read_options_follow_config() {
        let mut config = ImportConfig::default();
        config.delimiter = Some(';');
        let options = config.read_options();
        assert_eq!(options.delimiter, Some(b';'));
        assert!(options.annotation_prefixes.contains(&"catalog_items".to_string()));

        config.delimiter = Some('"');
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_numeric_range() {
        let range = NumericRange { min: 1, max: 10 };
        assert!(range.contains(1));
        assert!(range.contains(10));
        assert!(!range.contains(11));
    }
}
