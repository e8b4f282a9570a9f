//! Import sessions.
//!
//! An [`ImportSession`] tracks one import run. It starts `pending`, moves to
//! `processing` once the header row has been accepted, and ends in exactly
//! one of `completed`, `failed` or `cancelled`. Terminal sessions reject every
//! further mutation.
//!
//! A [`SessionHandle`] shares a session between the worker that writes it and
//! any number of progress readers, and carries the cooperative cancel flag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};

// =============================================================================
// Status and mode
// =============================================================================

/// Lifecycle state of an import session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict policy applied when a row's natural key matches an existing item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ConflictMode {
    /// Skip rows whose item already exists.
    CreateOnly,
    /// Skip rows whose item does not exist.
    UpdateOnly,
    /// Update if found, create otherwise.
    #[default]
    Upsert,
    /// Always create a new item.
    CreateDuplicates,
}

impl ConflictMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateOnly => "create_only",
            Self::UpdateOnly => "update_only",
            Self::Upsert => "upsert",
            Self::CreateDuplicates => "create_duplicates",
        }
    }
}

impl std::fmt::Display for ConflictMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictMode {
    type Err = String;

    /// Accepts `create_only`, `create-only` and `createOnly` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        match key.as_str() {
            "createonly" => Ok(Self::CreateOnly),
            "updateonly" => Ok(Self::UpdateOnly),
            "upsert" => Ok(Self::Upsert),
            "createduplicates" => Ok(Self::CreateDuplicates),
            _ => Err(format!("unknown conflict mode '{}'", s)),
        }
    }
}

// =============================================================================
// Session record
// =============================================================================

/// An error or warning attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowIssue {
    /// 1-based file line; `None` for file-level issues.
    pub row: Option<u64>,
    pub field: Option<String>,
    pub message: String,
}

impl RowIssue {
    pub fn file(message: impl Into<String>) -> Self {
        Self { row: None, field: None, message: message.into() }
    }

    pub fn row(row: u64, field: Option<String>, message: impl Into<String>) -> Self {
        Self { row: Some(row), field, message: message.into() }
    }
}

/// One import run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSession {
    pub id: Uuid,
    pub source_filename: String,
    pub mode: ConflictMode,
    pub status: SessionStatus,
    pub total_rows: usize,
    pub processed_rows: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub created_count: usize,
    pub updated_count: usize,
    pub errors: Vec<RowIssue>,
    pub warnings: Vec<RowIssue>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportSession {
    pub fn new(source_filename: impl Into<String>, mode: ConflictMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_filename: source_filename.into(),
            mode,
            status: SessionStatus::Pending,
            total_rows: 0,
            processed_rows: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            created_count: 0,
            updated_count: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn transition(&mut self, to: SessionStatus) -> SessionResult<()> {
        use SessionStatus::*;
        if self.status.is_terminal() {
            return Err(SessionError::Terminal(self.status));
        }
        let allowed = matches!(
            (self.status, to),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed | Failed | Cancelled)
        );
        if !allowed {
            return Err(SessionError::InvalidTransition { from: self.status, to });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    fn ensure_processing(&self) -> SessionResult<()> {
        match self.status {
            SessionStatus::Processing => Ok(()),
            status if status.is_terminal() => Err(SessionError::Terminal(status)),
            status => Err(SessionError::InvalidTransition {
                from: status,
                to: SessionStatus::Processing,
            }),
        }
    }

    /// `pending -> processing`, once the file has been accepted.
    pub fn start(&mut self, total_rows: usize) -> SessionResult<()> {
        self.transition(SessionStatus::Processing)?;
        self.total_rows = total_rows;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// End the run as `failed` with file-level errors attached.
    pub fn fail<I, S>(&mut self, errors: I) -> SessionResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transition(SessionStatus::Failed)?;
        self.errors.extend(errors.into_iter().map(RowIssue::file));
        Ok(())
    }

    pub fn complete(&mut self) -> SessionResult<()> {
        self.transition(SessionStatus::Completed)
    }

    pub fn cancel(&mut self) -> SessionResult<()> {
        self.transition(SessionStatus::Cancelled)
    }

    pub fn record_created(&mut self) -> SessionResult<()> {
        self.ensure_processing()?;
        self.processed_rows += 1;
        self.succeeded += 1;
        self.created_count += 1;
        Ok(())
    }

    pub fn record_updated(&mut self) -> SessionResult<()> {
        self.ensure_processing()?;
        self.processed_rows += 1;
        self.succeeded += 1;
        self.updated_count += 1;
        Ok(())
    }

    pub fn record_skipped(&mut self) -> SessionResult<()> {
        self.ensure_processing()?;
        self.processed_rows += 1;
        self.skipped += 1;
        Ok(())
    }

    pub fn record_failed(&mut self, issue: RowIssue) -> SessionResult<()> {
        self.ensure_processing()?;
        self.processed_rows += 1;
        self.failed += 1;
        self.errors.push(issue);
        Ok(())
    }

    pub fn record_warnings(&mut self, warnings: impl IntoIterator<Item = RowIssue>) -> SessionResult<()> {
        self.ensure_processing()?;
        self.warnings.extend(warnings);
        Ok(())
    }

    /// Processed share of the total, 0-100.
    pub fn percentage(&self) -> f64 {
        if self.total_rows == 0 {
            return if self.status == SessionStatus::Completed { 100.0 } else { 0.0 };
        }
        (self.processed_rows as f64 / self.total_rows as f64 * 100.0).min(100.0)
    }

    pub fn progress(&self) -> Progress {
        let elapsed_ms = self.started_at.map(|start| {
            let end = self.completed_at.unwrap_or_else(Utc::now);
            (end - start).num_milliseconds().max(0) as u64
        });
        Progress {
            session_id: self.id,
            status: self.status,
            totals: Totals {
                total_rows: self.total_rows,
                processed_rows: self.processed_rows,
                succeeded: self.succeeded,
                failed: self.failed,
                skipped: self.skipped,
                created: self.created_count,
                updated: self.updated_count,
                errors: self.errors.len(),
                warnings: self.warnings.len(),
            },
            percentage: self.percentage(),
            timing: Timing {
                started_at: self.started_at,
                completed_at: self.completed_at,
                elapsed_ms,
            },
        }
    }
}

// =============================================================================
// Progress
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub total_rows: usize,
    pub processed_rows: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub created: usize,
    pub updated: usize,
    pub errors: usize,
    pub warnings: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<u64>,
}

/// Read-only progress snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub totals: Totals,
    pub percentage: f64,
    pub timing: Timing,
}

// =============================================================================
// Shared handle
// =============================================================================

/// A session shared between its single writer and progress readers.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    session: Arc<RwLock<ImportSession>>,
    cancel_requested: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(session: ImportSession) -> Self {
        Self {
            id: session.id,
            session: Arc::new(RwLock::new(session)),
            cancel_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Copy of the current session record.
    pub fn snapshot(&self) -> ImportSession {
        self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.session.read().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn mode(&self) -> ConflictMode {
        self.session.read().unwrap_or_else(|e| e.into_inner()).mode
    }

    pub fn progress(&self) -> Progress {
        self.session.read().unwrap_or_else(|e| e.into_inner()).progress()
    }

    /// Mutate the session. Only the orchestrator calls this.
    pub fn update<R>(&self, f: impl FnOnce(&mut ImportSession) -> R) -> R {
        let mut guard = self.session.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Request cancellation. Returns `true` only while the session is
    /// processing; the orchestrator honours it at the next chunk boundary.
    pub fn cancel(&self) -> bool {
        if self.status() != SessionStatus::Processing {
            return false;
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut session = ImportSession::new("books.csv", ConflictMode::Upsert);
        assert_eq!(session.status, SessionStatus::Pending);

        session.start(2).unwrap();
        session.record_created().unwrap();
        session.record_updated().unwrap();
        session.complete().unwrap();

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.succeeded, 2);
        assert_eq!(session.percentage(), 100.0);
        assert!(session.completed_at.is_some());
    }

    #[test]
    fn test_terminal_sessions_are_immutable() {
        let mut session = ImportSession::new("books.csv", ConflictMode::CreateOnly);
        session.start(1).unwrap();
        session.complete().unwrap();

        assert!(matches!(session.record_created(), Err(SessionError::Terminal(_))));
        assert!(matches!(session.cancel(), Err(SessionError::Terminal(_))));
        assert!(matches!(
            session.fail(["late"]),
            Err(SessionError::Terminal(SessionStatus::Completed))
        ));
        assert_eq!(session.processed_rows, 0);
    }

    #[test]
    fn test_pending_can_fail_but_not_complete() {
        let mut session = ImportSession::new("books.csv", ConflictMode::Upsert);
        assert!(matches!(
            session.complete(),
            Err(SessionError::InvalidTransition { .. })
        ));
        session.fail(["Missing required column 'ID'"]).unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.errors[0].row, None);
    }

    #[test]
    fn test_rows_not_counted_before_start() {
        let mut session = ImportSession::new("books.csv", ConflictMode::Upsert);
        assert!(session.record_skipped().is_err());
    }

    #[test]
    fn test_conflict_mode_parsing() {
        assert_eq!("createOnly".parse::<ConflictMode>().unwrap(), ConflictMode::CreateOnly);
        assert_eq!("update-only".parse::<ConflictMode>().unwrap(), ConflictMode::UpdateOnly);
        assert_eq!("create_duplicates".parse::<ConflictMode>().unwrap(), ConflictMode::CreateDuplicates);
        assert!("merge".parse::<ConflictMode>().is_err());
    }

    #[test]
    fn test_handle_cancel_only_while_processing() {
        let handle = SessionHandle::new(ImportSession::new("books.csv", ConflictMode::Upsert));
        assert!(!handle.cancel());
        assert!(!handle.is_cancel_requested());

        handle.update(|s| s.start(10)).unwrap();
        assert!(handle.cancel());
        assert!(handle.is_cancel_requested());

        handle.update(|s| s.cancel()).unwrap();
        assert!(!handle.cancel());
    }

    #[test]
    fn test_progress_snapshot() {
        let handle = SessionHandle::new(ImportSession::new("books.csv", ConflictMode::Upsert));
        handle
            .update(|s| {
                s.start(4)?;
                s.record_created()?;
                s.record_failed(RowIssue::row(3, Some("title".into()), "Title is required"))
            })
            .unwrap();

        let progress = handle.progress();
        assert_eq!(progress.status, SessionStatus::Processing);
        assert_eq!(progress.totals.processed_rows, 2);
        assert_eq!(progress.totals.errors, 1);
        assert_eq!(progress.percentage, 50.0);
        assert!(progress.timing.elapsed_ms.is_some());
    }
}
