//! Batch orchestration: file -> chunks -> rows -> storage.
//!
//! The orchestrator owns one import run end to end:
//! 1. Opens the file and validates the header (failure ends the session as `failed`)
//! 2. Counts data rows, then moves the session to `processing`
//! 3. Reads fixed-size chunks; each row runs decode -> validate -> build inside
//!    its own transaction
//! 4. Checks the cancel flag between chunks
//! 5. Attaches links whose targets appeared later in the file, one
//!    transaction per linking item
//! 6. Completes the session once the input is exhausted
//!
//! Row failures are rolled back and recorded; they never stop the run.
//!
//! # Example
//!
//! ```rust,ignore
//! use catalog_csv::{BatchOrchestrator, ConflictMode, ImportConfig, ImportSource, InMemoryStore};
//!
//! let mut store = InMemoryStore::new();
//! let orchestrator = BatchOrchestrator::new(ImportConfig::default());
//! let session = orchestrator.import(&mut store, &ImportSource::file("catalog.csv"), ConflictMode::Upsert);
//! println!("{} created, {} updated", session.created_count, session.updated_count);
//! ```

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::builder::{AggregateBuilder, BuildOptions, BuildOutcome, PendingLink, RowAction};
use super::codec::{decode, DecodedRow};
use super::resolver::RelationshipResolver;
use crate::config::ImportConfig;
use crate::error::{ImportError, ImportResult, RowError};
use crate::mapping::fields;
use crate::models::{ItemId, NaturalKey};
use crate::parser::{count_data_rows, ImportSource, RawRow, RowReader};
use crate::session::{ConflictMode, ImportSession, Progress, RowIssue, SessionHandle, SessionStatus};
use crate::storage::CatalogStore;
use crate::validation::Validator;

/// Called with a progress snapshot after each chunk and at the end of a run.
pub type ProgressCallback = Box<dyn Fn(&Progress) + Send + Sync>;

/// Unresolved link keys of the run, by linking item.
type PendingLinks = BTreeMap<ItemId, Vec<PendingLink>>;

/// Runs import sessions with injected validation and building services.
pub struct BatchOrchestrator {
    config: ImportConfig,
    validator: Validator,
    builder: AggregateBuilder,
    on_progress: Option<ProgressCallback>,
}

impl BatchOrchestrator {
    /// Orchestrator with the standard services for `config`.
    pub fn new(config: ImportConfig) -> Self {
        let validator = Validator::new(&config);
        let builder = AggregateBuilder::new(&config, RelationshipResolver::new(&config));
        Self::with_services(config, validator, builder)
    }

    pub fn with_services(config: ImportConfig, validator: Validator, builder: AggregateBuilder) -> Self {
        Self {
            config,
            validator,
            builder,
            on_progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Run a whole import synchronously and return the final session.
    pub fn import(
        &self,
        store: &mut dyn CatalogStore,
        source: &ImportSource,
        mode: ConflictMode,
    ) -> ImportSession {
        let handle = SessionHandle::new(ImportSession::new(source.name(), mode));
        self.run(store, source, &handle);
        handle.snapshot()
    }

    /// Drive the session behind `handle` to a terminal state.
    ///
    /// Never returns an error: anything that stops the run is recorded on the
    /// session, which ends `failed`.
    pub fn run(&self, store: &mut dyn CatalogStore, source: &ImportSource, handle: &SessionHandle) -> SessionStatus {
        let session_id = handle.id();
        info!(%session_id, file = %source.name(), mode = %handle.mode(), "Import started");

        if let Err(err) = self.execute(store, source, handle) {
            let messages = match &err {
                ImportError::InvalidHeaders(errors) => errors.clone(),
                other => vec![other.to_string()],
            };
            warn!(%session_id, error = %err, "Import failed");
            if let Err(e) = handle.update(|s| s.fail(messages)) {
                warn!(%session_id, error = %e, "Could not mark session as failed");
            }
        }

        let progress = handle.progress();
        self.emit(&progress);
        info!(
            %session_id,
            status = %progress.status,
            created = progress.totals.created,
            updated = progress.totals.updated,
            skipped = progress.totals.skipped,
            failed = progress.totals.failed,
            elapsed_ms = progress.timing.elapsed_ms.unwrap_or(0),
            "Import finished"
        );
        progress.status
    }

    fn execute(&self, store: &mut dyn CatalogStore, source: &ImportSource, handle: &SessionHandle) -> ImportResult<()> {
        let options = self.config.read_options();
        let mut reader = RowReader::open(source, &options)?;
        let headers = reader.headers().to_vec();
        debug!(
            encoding = %reader.info().encoding,
            delimiter = %reader.info().delimiter.escape_default(),
            annotation = reader.info().has_annotation_row,
            columns = headers.len(),
            "Opened import file"
        );

        let header_report = self.validator.validate_headers(&headers);
        if !header_report.is_valid() {
            return Err(ImportError::InvalidHeaders(header_report.error_messages()));
        }

        let total = count_data_rows(source, &options)?;
        handle.update(|s| -> ImportResult<()> {
            s.start(total)?;
            s.record_warnings(header_report.warnings)?;
            Ok(())
        })?;
        self.emit(&handle.progress());

        let mode = handle.mode();
        let mut pending = PendingLinks::new();
        let mut chunk_index = 0usize;
        loop {
            if handle.is_cancel_requested() {
                let unresolved: Vec<RowIssue> = pending.values().flatten().map(PendingLink::not_found).collect();
                handle.update(|s| -> ImportResult<()> {
                    s.record_warnings(unresolved)?;
                    s.cancel()?;
                    Ok(())
                })?;
                info!(session_id = %handle.id(), chunk = chunk_index, "Import cancelled");
                return Ok(());
            }

            let Some(chunk) = reader.next_chunk(self.config.chunk_size)? else {
                break;
            };
            for raw in chunk {
                self.process_row(store, &raw, &headers, mode, handle, &mut pending)?;
            }
            chunk_index += 1;
            debug!(session_id = %handle.id(), chunk = chunk_index, "Chunk processed");
            self.emit(&handle.progress());
        }

        self.attach_pending_links(store, pending, handle)?;
        handle.update(|s| s.complete())?;
        Ok(())
    }

    /// Second pass over links whose targets were created after their row.
    ///
    /// A failure here is a warning on the linking row: the row itself was
    /// already committed and counted.
    fn attach_pending_links(
        &self,
        store: &mut dyn CatalogStore,
        pending: PendingLinks,
        handle: &SessionHandle,
    ) -> ImportResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        debug!(session_id = %handle.id(), items = pending.len(), "Attaching forward links");

        for (item, links) in pending {
            let warnings = match store.begin() {
                Ok(()) => match self.builder.attach_pending_links(store, item, &links) {
                    Ok(warnings) => match store.commit() {
                        Ok(()) => warnings,
                        Err(err) => {
                            store.rollback()?;
                            link_failure(&links, &err.into())
                        }
                    },
                    Err(err) => {
                        store.rollback()?;
                        link_failure(&links, &err)
                    }
                },
                Err(err) => link_failure(&links, &err.into()),
            };
            handle.update(|s| s.record_warnings(warnings))?;
        }
        Ok(())
    }

    /// Apply one row in its own transaction and record the outcome.
    ///
    /// Only a failed rollback escapes as an error: the store state is then
    /// unknown and the run must stop.
    fn process_row(
        &self,
        store: &mut dyn CatalogStore,
        raw: &RawRow,
        headers: &[String],
        mode: ConflictMode,
        handle: &SessionHandle,
        pending: &mut PendingLinks,
    ) -> ImportResult<()> {
        let mut warnings = Vec::new();
        if let Some(issue) = self.validator.validate_shape(raw.line, raw.cells.len(), headers.len()) {
            warnings.push(issue);
        }

        let row = decode(raw.line, &raw.cells, headers, &self.config.field_map);
        let report = self.validator.validate_row(&row);
        warnings.extend(report.warnings);

        if let Some(error) = report.errors.into_iter().next() {
            debug!(row = raw.line, message = %error.message, "Row rejected");
            return handle.update(|s| -> ImportResult<()> {
                s.record_warnings(warnings)?;
                s.record_failed(error)?;
                Ok(())
            });
        }

        if let Err(err) = store.begin() {
            return self.record_failure(handle, &row, warnings, err.into());
        }

        match self.apply(store, &row, mode) {
            Ok(outcome) => {
                if let Err(err) = store.commit() {
                    store.rollback()?;
                    return self.record_failure(handle, &row, warnings, err.into());
                }
                let action = match outcome {
                    Some(outcome) => {
                        let BuildOutcome { item, action, warnings: row_warnings, pending_links } = outcome;
                        warnings.extend(row_warnings);
                        // A later row for the same item replaces its links.
                        if pending_links.is_empty() {
                            pending.remove(&item.id);
                        } else {
                            pending.insert(item.id, pending_links);
                        }
                        action
                    }
                    None => RowAction::Skipped,
                };
                handle.update(|s| -> ImportResult<()> {
                    s.record_warnings(warnings)?;
                    match action {
                        RowAction::Created => s.record_created()?,
                        RowAction::Updated => s.record_updated()?,
                        RowAction::Skipped => s.record_skipped()?,
                    }
                    Ok(())
                })
            }
            Err(err) => {
                store.rollback()?;
                self.record_failure(handle, &row, warnings, err)
            }
        }
    }

    /// Conflict-mode decision plus build, inside an open transaction.
    /// `None` means the mode skipped the row.
    fn apply(
        &self,
        store: &mut dyn CatalogStore,
        row: &DecodedRow,
        mode: ConflictMode,
    ) -> Result<Option<BuildOutcome>, RowError> {
        let key = NaturalKey {
            internal_id: row.value(fields::INTERNAL_ID).map(str::to_string),
            catalog_code: row.value(fields::CATALOG_CODE).map(str::to_string),
        };
        let existing = if key.is_empty() { None } else { store.find_item(&key)? };

        let (target, options) = match (mode, existing) {
            (ConflictMode::CreateOnly, Some(_)) | (ConflictMode::UpdateOnly, None) => {
                debug!(row = row.line, key = %key, mode = %mode, "Row skipped");
                return Ok(None);
            }
            (ConflictMode::CreateDuplicates, found) => (
                None,
                BuildOptions { clear_identifiers: found.is_some() },
            ),
            (ConflictMode::CreateOnly, None) => (None, BuildOptions::default()),
            (ConflictMode::UpdateOnly | ConflictMode::Upsert, found) => (found, BuildOptions::default()),
        };

        let outcome = self.builder.build_or_update(store, target.as_ref(), row, options)?;
        debug!(row = row.line, item = outcome.item.id, action = ?outcome.action, "Row applied");
        Ok(Some(outcome))
    }

    fn record_failure(
        &self,
        handle: &SessionHandle,
        row: &DecodedRow,
        warnings: Vec<RowIssue>,
        err: RowError,
    ) -> ImportResult<()> {
        warn!(session_id = %handle.id(), row = row.line, error = %err, "Row failed");
        let issue = RowIssue::row(row.line, err.field().map(str::to_string), err.to_string());
        handle.update(|s| -> ImportResult<()> {
            s.record_warnings(warnings)?;
            s.record_failed(issue)?;
            Ok(())
        })
    }

    fn emit(&self, progress: &Progress) {
        if let Some(callback) = &self.on_progress {
            callback(progress);
        }
    }
}

/// One warning per link of an item whose second-pass transaction failed.
fn link_failure(links: &[PendingLink], err: &RowError) -> Vec<RowIssue> {
    warn!(error = %err, links = links.len(), "Could not attach links");
    links
        .iter()
        .map(|link| {
            RowIssue::row(
                link.line,
                Some(link.field.to_string()),
                format!("Link to '{}' not attached: {}", link.key, err),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CreateMissing;
    use crate::error::{StorageError, StorageResult};
    use crate::export::ExportFilter;
    use crate::models::{
        CatalogAggregate, CatalogItem, Entity, EntityKind, ItemFields, ItemId, Relation,
        RelationCategory,
    };
    use crate::storage::InMemoryStore;
    use std::sync::{Arc, Mutex};

    fn source(csv: &str) -> ImportSource {
        ImportSource::bytes("test.csv", csv.as_bytes().to_vec())
    }

    fn orchestrator() -> BatchOrchestrator {
        let config = ImportConfig::default().with_create_missing(CreateMissing::all());
        BatchOrchestrator::new(config)
    }

    #[test]
    fn test_missing_title_counts_as_failure() {
        let mut store = InMemoryStore::new();
        let csv = "ID,Title,Access\nA1,\"My Book\",Y\n,,N\n";
        let session = orchestrator().import(&mut store, &source(csv), ConflictMode::CreateOnly);

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.total_rows, 2);
        assert_eq!(session.succeeded, 1);
        assert_eq!(session.created_count, 1);
        assert_eq!(session.skipped, 0);
        assert_eq!(session.failed, 1);
        assert_eq!(session.errors[0].row, Some(3));
        assert_eq!(store.item_count(), 1);
    }

    #[test]
    fn test_header_failure_processes_no_rows() {
        let mut store = InMemoryStore::new();
        let session = orchestrator().import(&mut store, &source("Title\nBook\n"), ConflictMode::Upsert);

        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.processed_rows, 0);
        assert!(session.errors[0].message.contains("'ID'"));
        assert_eq!(store.item_count(), 0);
    }

    #[test]
    fn test_empty_file_fails() {
        let mut store = InMemoryStore::new();
        let session = orchestrator().import(&mut store, &source(""), ConflictMode::Upsert);
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.errors[0].message.contains("empty"));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut store = InMemoryStore::new();
        let csv = "ID,Title,Author,Keywords,Region\n\
                   A1,One,Ann|Bob,water|soil,Kenya\n\
                   A2,Two,Cy,air,Kenya|Uganda\n";
        let o = orchestrator();

        let first = o.import(&mut store, &source(csv), ConflictMode::Upsert);
        assert_eq!((first.created_count, first.updated_count), (2, 0));
        let counts: Vec<usize> = RelationCategory::ALL.iter().map(|c| store.relation_count(*c)).collect();

        let second = o.import(&mut store, &source(csv), ConflictMode::Upsert);
        assert_eq!((second.created_count, second.updated_count), (0, 2));
        let after: Vec<usize> = RelationCategory::ALL.iter().map(|c| store.relation_count(*c)).collect();
        assert_eq!(counts, after);
        assert_eq!(store.item_count(), 2);
        assert_eq!(store.entity_count(&EntityKind::Location), 2);
    }

    #[test]
    fn test_mode_exclusivity() {
        let mut store = InMemoryStore::new();
        let o = orchestrator();
        o.import(&mut store, &source("ID,Title\nA1,Original\n"), ConflictMode::Upsert);
        let before = store.find_item(&NaturalKey { internal_id: Some("A1".into()), catalog_code: None }).unwrap();

        let s = o.import(&mut store, &source("ID,Title\nA1,Changed\n"), ConflictMode::CreateOnly);
        assert_eq!((s.skipped, s.created_count), (1, 0));
        let now = store.find_item(&NaturalKey { internal_id: Some("A1".into()), catalog_code: None }).unwrap();
        assert_eq!(before, now);

        let s = o.import(&mut store, &source("ID,Title\nB9,New\n"), ConflictMode::UpdateOnly);
        assert_eq!((s.skipped, s.created_count), (1, 0));
        assert_eq!(store.item_count(), 1);

        let s = o.import(&mut store, &source("ID,Title\nA1,Copy\n"), ConflictMode::CreateDuplicates);
        assert_eq!(s.created_count, 1);
        assert_eq!(s.warnings.len(), 1);
        assert_eq!(store.item_count(), 2);
    }

    #[test]
    fn test_blank_rows_are_not_failures() {
        let mut store = InMemoryStore::new();
        let csv = "ID,Title\nA1,One\n,\n  ,  \nA2,Two\n";
        let session = orchestrator().import(&mut store, &source(csv), ConflictMode::Upsert);
        assert_eq!(session.total_rows, 2);
        assert_eq!(session.created_count, 2);
        assert_eq!(session.failed, 0);
    }

    #[test]
    fn test_annotation_row_is_skipped() {
        let mut store = InMemoryStore::new();
        let csv = "ID,Title\ncatalog_items.internal_id,catalog_items.title\nA1,One\n";
        let session = orchestrator().import(&mut store, &source(csv), ConflictMode::Upsert);
        assert_eq!(session.total_rows, 1);
        assert_eq!(session.created_count, 1);
    }

    #[test]
    fn test_cancel_between_chunks() {
        let mut store = InMemoryStore::new();
        let mut csv = String::from("ID,Title\n");
        for i in 0..6 {
            csv.push_str(&format!("A{},Book\n", i));
        }

        let handle = SessionHandle::new(ImportSession::new("test.csv", ConflictMode::Upsert));
        let canceller = handle.clone();
        let config = ImportConfig::default().with_chunk_size(2);
        let o = BatchOrchestrator::new(config).with_progress(Box::new(move |p| {
            if p.totals.processed_rows >= 2 {
                canceller.cancel();
            }
        }));

        let status = o.run(&mut store, &source(&csv), &handle);
        assert_eq!(status, SessionStatus::Cancelled);
        let session = handle.snapshot();
        assert_eq!(session.processed_rows, 2);
        assert_eq!(store.item_count(), 2);
    }

    #[test]
    fn test_progress_reported_per_chunk() {
        let mut store = InMemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let config = ImportConfig::default().with_chunk_size(1);
        let o = BatchOrchestrator::new(config).with_progress(Box::new(move |p| {
            sink.lock().unwrap().push(p.totals.processed_rows);
        }));
        o.import(&mut store, &source("ID,Title\nA1,One\nA2,Two\n"), ConflictMode::Upsert);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 2]);
    }

    #[test]
    fn test_forward_links_attached_after_last_row() {
        let mut store = InMemoryStore::new();
        let csv = "ID,Title,Related Items,Translation Of\n\
                   A1,One,B1|Z9,\n\
                   B1,Two,,A1\n";
        let session = orchestrator().import(&mut store, &source(csv), ConflictMode::Upsert);

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.created_count, 2);
        assert_eq!(session.warnings.len(), 1);
        assert_eq!(session.warnings[0].row, Some(2));
        assert!(session.warnings[0].message.contains("'Z9' not found"));

        let key = NaturalKey { internal_id: Some("A1".into()), catalog_code: None };
        let a1 = store.find_item(&key).unwrap().unwrap();
        let agg = store.load_aggregate(a1.id).unwrap().unwrap();
        assert_eq!(agg.links.len(), 1);
        assert_eq!(agg.links[0].target_key, "B1");
        assert_eq!(store.relation_count(RelationCategory::Links), 2);
    }

    #[test]
    fn test_later_row_replaces_pending_links() {
        let mut store = InMemoryStore::new();
        let csv = "ID,Title,Related Items\n\
                   A1,One,B1\n\
                   A1,One again,\n\
                   B1,Two,\n";
        let session = orchestrator().import(&mut store, &source(csv), ConflictMode::Upsert);

        assert_eq!((session.created_count, session.updated_count), (2, 1));
        assert!(session.warnings.is_empty());
        assert_eq!(store.relation_count(RelationCategory::Links), 0);
    }

    /// Store that fails when asked to attach a specific keyword.
    struct FailingStore {
        inner: InMemoryStore,
        poison: String,
    }

    impl CatalogStore for FailingStore {
        fn begin(&mut self) -> StorageResult<()> {
            self.inner.begin()
        }
        fn commit(&mut self) -> StorageResult<()> {
            self.inner.commit()
        }
        fn rollback(&mut self) -> StorageResult<()> {
            self.inner.rollback()
        }
        fn find_item(&self, key: &NaturalKey) -> StorageResult<Option<CatalogItem>> {
            self.inner.find_item(key)
        }
        fn create_item(&mut self, fields: &ItemFields) -> StorageResult<CatalogItem> {
            self.inner.create_item(fields)
        }
        fn update_item(&mut self, id: ItemId, fields: &ItemFields) -> StorageResult<CatalogItem> {
            self.inner.update_item(id, fields)
        }
        fn find_entity(&self, kind: &EntityKind, name: &str) -> StorageResult<Option<Entity>> {
            self.inner.find_entity(kind, name)
        }
        fn create_entity(&mut self, kind: &EntityKind, name: &str) -> StorageResult<Entity> {
            self.inner.create_entity(kind, name)
        }
        fn delete_relationships(&mut self, item: ItemId, category: RelationCategory) -> StorageResult<usize> {
            self.inner.delete_relationships(item, category)
        }
        fn create_relationship(&mut self, item: ItemId, relation: Relation) -> StorageResult<()> {
            if matches!(&relation, Relation::Keyword { keyword } if *keyword == self.poison) {
                return Err(StorageError::Backend("disk full".into()));
            }
            self.inner.create_relationship(item, relation)
        }
        fn load_aggregate(&self, id: ItemId) -> StorageResult<Option<CatalogAggregate>> {
            self.inner.load_aggregate(id)
        }
        fn query_aggregates(&self, filter: &ExportFilter, after: Option<ItemId>, limit: usize) -> StorageResult<Vec<CatalogAggregate>> {
            self.inner.query_aggregates(filter, after, limit)
        }
    }

    #[test]
    fn test_failed_row_is_rolled_back_in_isolation() {
        let mut store = FailingStore { inner: InMemoryStore::new(), poison: "boom".into() };
        let o = orchestrator();
        o.import(&mut store, &source("ID,Title,Keywords,Author\nA2,Two,water,Ann\n"), ConflictMode::Upsert);
        let key = NaturalKey { internal_id: Some("A2".into()), catalog_code: None };
        let id = store.find_item(&key).unwrap().unwrap().id;
        let before = store.load_aggregate(id).unwrap();

        let csv = "ID,Title,Keywords,Author\n\
                   A1,One,fine,Ann\n\
                   A2,Renamed,boom,Zed\n\
                   A3,Three,fine,Ann\n";
        let session = o.import(&mut store, &source(csv), ConflictMode::Upsert);

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.created_count, 2);
        assert_eq!(session.failed, 1);
        assert_eq!(session.errors[0].row, Some(3));
        assert!(session.errors[0].message.contains("disk full"));

        assert_eq!(store.load_aggregate(id).unwrap(), before);
        assert!(store.inner.find_entity(&EntityKind::Creator, "Zed").unwrap().is_none());
    }
}
