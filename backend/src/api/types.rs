//! REST API request and response types.
//!
//! Responses are camelCase JSON; session and progress payloads reuse the
//! engine's own serde shapes.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::export::{ExportFilter, ExportOptions};
use crate::models::AccessLevel;
use crate::session::{ConflictMode, ImportSession, Progress, RowIssue, SessionStatus};
use crate::validation::FileValidation;

/// Query string of `POST /api/imports`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImportQuery {
    pub mode: Option<ConflictMode>,
    /// Return as soon as the session is queued.
    pub background: bool,
}

/// Sent back after an import is queued or finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResponse {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub mode: ConflictMode,
    pub progress: Progress,
    /// Empty while the session is still running.
    pub errors: Vec<RowIssue>,
    pub warnings: Vec<RowIssue>,
}

impl From<&ImportSession> for ImportResponse {
    fn from(session: &ImportSession) -> Self {
        Self {
            session_id: session.id,
            status: session.status,
            mode: session.mode,
            progress: session.progress(),
            errors: session.errors.clone(),
            warnings: session.warnings.clone(),
        }
    }
}

/// Answer of `POST /api/imports/{id}/cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub session_id: Uuid,
    /// `false` when the session was not processing.
    pub cancelled: bool,
    pub status: SessionStatus,
}

/// Query string of `GET /api/export`.
///
/// Spelled out field by field: query strings cannot carry a flattened
/// struct with typed values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExportQuery {
    pub created_from: Option<chrono::NaiveDate>,
    pub created_to: Option<chrono::NaiveDate>,
    pub updated_from: Option<chrono::NaiveDate>,
    pub updated_to: Option<chrono::NaiveDate>,
    pub access_level: Option<AccessLevel>,
    pub collection: Option<String>,
    pub language: Option<String>,
    pub is_active: Option<bool>,
    pub is_featured: Option<bool>,
    pub year_from: Option<i32>,
    pub year_to: Option<i32>,
    /// Comma-separated column names.
    pub columns: Option<String>,
    pub annotation: bool,
    pub bom: bool,
}

impl ExportQuery {
    pub fn into_parts(self) -> (ExportFilter, ExportOptions) {
        let filter = ExportFilter {
            created_from: self.created_from,
            created_to: self.created_to,
            updated_from: self.updated_from,
            updated_to: self.updated_to,
            access_level: self.access_level,
            collection: self.collection,
            language: self.language,
            is_active: self.is_active,
            is_featured: self.is_featured,
            year_from: self.year_from,
            year_to: self.year_to,
        };
        let columns = self.columns.map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        });
        let options = ExportOptions {
            columns,
            include_annotation: self.annotation,
            bom: self.bom,
        };
        (filter, options)
    }
}

/// Result of the bounded pre-check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub valid: bool,
    pub encoding: String,
    pub delimiter: String,
    pub columns: Vec<String>,
    pub has_annotation_row: bool,
    pub rows_checked: usize,
    pub truncated: bool,
    pub errors: Vec<RowIssue>,
    pub warnings: Vec<RowIssue>,
}

impl From<FileValidation> for ValidateResponse {
    fn from(result: FileValidation) -> Self {
        Self {
            valid: result.report.is_valid(),
            encoding: result.encoding,
            delimiter: result.delimiter.to_string(),
            columns: result.headers,
            has_annotation_row: result.has_annotation_row,
            rows_checked: result.rows_checked,
            truncated: result.truncated,
            errors: result.report.errors,
            warnings: result.report.warnings,
        }
    }
}

/// Create an error response
pub fn error_response(error: &str) -> Value {
    json!({
        "status": "error",
        "error": error,
    })
}
