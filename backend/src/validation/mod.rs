//! Header and row validation.
//!
//! Two severities:
//! - **errors** stop the file (header problems) or the row (missing title)
//! - **warnings** let the row through with a degraded or defaulted value
//!
//! [`Validator::validate_file`] is the bounded interactive pre-check. The
//! orchestrator calls [`Validator::validate_headers`] and
//! [`Validator::validate_row`] itself, on every row, with no cap.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::{ImportConfig, ValidationLimits};
use crate::error::CsvResult;
use crate::mapping::{fields, FieldMap};
use crate::models::AccessLevel;
use crate::parser::{CsvInfo, ImportSource, RowReader};
use crate::session::RowIssue;
use crate::transform::builder::{parse_page_count, parse_year};
use crate::transform::codec::{decode, DecodedRow};

/// Errors and warnings found by a check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<RowIssue>,
    pub warnings: Vec<RowIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Error messages, for session failure records.
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.message.clone()).collect()
    }
}

/// Result of the bounded file pre-check.
#[derive(Debug, Clone, Serialize)]
pub struct FileValidation {
    pub encoding: String,
    pub delimiter: char,
    pub headers: Vec<String>,
    pub has_annotation_row: bool,
    /// Data rows inspected.
    pub rows_checked: usize,
    /// Whether the sample limit stopped the check before the end of the file.
    pub truncated: bool,
    pub report: ValidationReport,
}

/// Structural and semantic checks driven by the field map and limits.
#[derive(Debug, Clone)]
pub struct Validator {
    map: FieldMap,
    limits: ValidationLimits,
}

impl Validator {
    pub fn new(config: &ImportConfig) -> Self {
        Self {
            map: config.field_map.clone(),
            limits: config.limits.clone(),
        }
    }

    /// Required columns must be present; duplicates are errors; unknown
    /// columns are warnings.
    pub fn validate_headers(&self, headers: &[String]) -> ValidationReport {
        let mut report = ValidationReport::default();
        let normalized: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();

        for required in self.map.required_columns() {
            if !normalized.contains(&required.trim().to_lowercase()) {
                report
                    .errors
                    .push(RowIssue::file(format!("Missing required column '{}'", required)));
            }
        }

        let mut seen = HashSet::new();
        for (header, key) in headers.iter().zip(&normalized) {
            if key.is_empty() {
                report.warnings.push(RowIssue::file("Empty column header will be ignored"));
                continue;
            }
            if !seen.insert(key.clone()) {
                report
                    .errors
                    .push(RowIssue::file(format!("Duplicate column '{}'", header)));
                continue;
            }
            if self.map.entry_for_column(header).is_none() {
                report
                    .warnings
                    .push(RowIssue::file(format!("Unknown column '{}' will be ignored", header)));
            }
        }

        report
    }

    /// Warn when a row's cell count differs from the header's.
    pub fn validate_shape(&self, line: u64, cells: usize, columns: usize) -> Option<RowIssue> {
        (cells != columns).then(|| {
            RowIssue::row(line, None, format!("Row has {} cells but the header has {}", cells, columns))
        })
    }

    /// Semantic checks on one decoded row.
    pub fn validate_row(&self, row: &DecodedRow) -> ValidationReport {
        let mut report = ValidationReport::default();
        let issue = |field: &str, message: String| RowIssue::row(row.line, Some(field.to_string()), message);

        if row.value(fields::TITLE).is_none() {
            report.errors.push(issue(fields::TITLE, "Title is required".to_string()));
        }

        for (field, max) in &self.limits.max_lengths {
            if let Some(value) = row.value(field) {
                let len = value.chars().count();
                if len > *max {
                    report.warnings.push(issue(
                        field,
                        format!("{} is {} characters long (max {})", field, len, max),
                    ));
                }
            }
        }

        let numeric: [(&str, fn(&str) -> Option<i64>); 2] = [
            (fields::PUBLICATION_YEAR, parse_year),
            (fields::PAGE_COUNT, parse_page_count),
        ];
        for (field, parse) in numeric {
            let Some(raw) = row.value(field) else { continue };
            match parse(raw) {
                None => report
                    .warnings
                    .push(issue(field, format!("'{}' is not a number; value ignored", raw))),
                Some(n) => {
                    if let Some(range) = self.limits.numeric_ranges.get(field) {
                        if !range.contains(n) {
                            report.warnings.push(issue(
                                field,
                                format!("{} is outside {}..={}; value ignored", n, range.min, range.max),
                            ));
                        }
                    }
                }
            }
        }

        if let Some(code) = row.value(fields::ACCESS_LEVEL) {
            if self.map.access_level_for_code(code).is_none() {
                report.warnings.push(issue(
                    fields::ACCESS_LEVEL,
                    format!("Unknown access code '{}'; using '{}'", code, AccessLevel::default()),
                ));
            }
        }

        for field in [fields::IS_ACTIVE, fields::IS_FEATURED] {
            if let Some(raw) = row.value(field) {
                if self.map.parse_flag(raw).is_none() {
                    report.warnings.push(issue(
                        field,
                        format!("Unknown flag value '{}'; using '{}'", raw, self.map.flag_code(false)),
                    ));
                }
            }
        }

        report
    }

    /// Bounded pre-check: headers, then up to `sample_limit` data rows.
    pub fn validate_file(
        &self,
        source: &ImportSource,
        config: &ImportConfig,
        sample_limit: usize,
    ) -> CsvResult<FileValidation> {
        let mut reader = RowReader::open(source, &config.read_options())?;
        let info: CsvInfo = reader.info().clone();
        let mut report = self.validate_headers(&info.headers);

        let mut rows_checked = 0;
        let mut truncated = false;
        while let Some(raw) = reader.next_row()? {
            if rows_checked >= sample_limit {
                truncated = true;
                break;
            }
            rows_checked += 1;
            if let Some(shape) = self.validate_shape(raw.line, raw.cells.len(), info.headers.len()) {
                report.warnings.push(shape);
            }
            let decoded = decode(raw.line, &raw.cells, &info.headers, &self.map);
            report.merge(self.validate_row(&decoded));
        }

        Ok(FileValidation {
            encoding: info.encoding,
            delimiter: info.delimiter,
            headers: info.headers,
            has_annotation_row: info.has_annotation_row,
            rows_checked,
            truncated,
            report,
        })
    }
}
