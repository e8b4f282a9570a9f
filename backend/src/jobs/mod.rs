//! Background import dispatch.
//!
//! [`ImportQueue`] runs imports on the blocking thread pool. The worker is
//! the only writer of its session; everyone else goes through
//! [`ImportQueue::progress`], [`ImportQueue::session`] and
//! [`ImportQueue::cancel`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::logs::publish_progress;
use crate::cache::SessionArchive;
use crate::config::ImportConfig;
use crate::parser::ImportSource;
use crate::session::{ConflictMode, ImportSession, Progress, SessionHandle, SessionStatus};
use crate::storage::CatalogStore;
use crate::transform::pipeline::BatchOrchestrator;

/// Store shared between workers; rows are applied under the lock.
pub type SharedStore<S> = Arc<Mutex<S>>;

/// Called on the worker thread after each run, with the store still locked.
pub type FinishHook<S> = Arc<dyn Fn(&mut S, &ImportSession) + Send + Sync>;

/// Registry of import sessions and their workers.
pub struct ImportQueue<S> {
    store: SharedStore<S>,
    config: Arc<ImportConfig>,
    sessions: Arc<RwLock<HashMap<Uuid, SessionHandle>>>,
    archive: Option<Arc<Mutex<SessionArchive>>>,
    on_finish: Option<FinishHook<S>>,
}

impl<S> Clone for ImportQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            sessions: self.sessions.clone(),
            archive: self.archive.clone(),
            on_finish: self.on_finish.clone(),
        }
    }
}

impl<S> ImportQueue<S>
where
    S: CatalogStore + Send + 'static,
{
    pub fn new(store: SharedStore<S>, config: ImportConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            archive: None,
            on_finish: None,
        }
    }

    /// Archive every finished session.
    pub fn with_archive(mut self, archive: SessionArchive) -> Self {
        self.archive = Some(Arc::new(Mutex::new(archive)));
        self
    }

    pub fn with_finish_hook(mut self, hook: FinishHook<S>) -> Self {
        self.on_finish = Some(hook);
        self
    }

    pub fn store(&self) -> &SharedStore<S> {
        &self.store
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Queue an import and return immediately.
    pub fn dispatch(&self, source: ImportSource, mode: ConflictMode) -> (SessionHandle, JoinHandle<SessionStatus>) {
        let handle = SessionHandle::new(ImportSession::new(source.name(), mode));
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.id(), handle.clone());
        info!(session_id = %handle.id(), file = %source.name(), %mode, "Import queued");

        let worker = handle.clone();
        let store = self.store.clone();
        let config = (*self.config).clone();
        let archive = self.archive.clone();
        let on_finish = self.on_finish.clone();

        let task = tokio::task::spawn_blocking(move || {
            let orchestrator = BatchOrchestrator::new(config).with_progress(Box::new(publish_progress));
            let mut guard = store.lock().unwrap_or_else(|e| e.into_inner());
            let status = orchestrator.run(&mut *guard, &source, &worker);

            let session = worker.snapshot();
            if let Some(hook) = &on_finish {
                hook(&mut *guard, &session);
            }
            drop(guard);

            if let Some(archive) = archive {
                let mut archive = archive.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(e) = archive.save(&session) {
                    warn!(session_id = %session.id, error = %e, "Could not archive session");
                }
            }
            status
        });

        (handle, task)
    }

    /// Run an import on a worker and wait for it.
    pub async fn run(&self, source: ImportSource, mode: ConflictMode) -> ImportSession {
        let (handle, task) = self.dispatch(source, mode);
        if let Err(e) = task.await {
            warn!(session_id = %handle.id(), error = %e, "Import worker panicked");
        }
        handle.snapshot()
    }

    fn handle(&self, id: Uuid) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Live session record, falling back to the archive.
    pub fn session(&self, id: Uuid) -> Option<ImportSession> {
        if let Some(handle) = self.handle(id) {
            return Some(handle.snapshot());
        }
        let archive = self.archive.as_ref()?;
        let archive = archive.lock().unwrap_or_else(|e| e.into_inner());
        archive.get(id).cloned()
    }

    pub fn progress(&self, id: Uuid) -> Option<Progress> {
        self.session(id).map(|s| s.progress())
    }

    /// Request cancellation; `true` only while the session is processing.
    pub fn cancel(&self, id: Uuid) -> bool {
        self.handle(id).is_some_and(|h| h.cancel())
    }

    /// Sessions known to this queue, newest first.
    pub fn sessions(&self) -> Vec<ImportSession> {
        let mut sessions: Vec<ImportSession> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|h| h.snapshot())
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    fn queue() -> ImportQueue<InMemoryStore> {
        ImportQueue::new(Arc::new(Mutex::new(InMemoryStore::new())), ImportConfig::default())
    }

    fn source(csv: &str) -> ImportSource {
        ImportSource::bytes("queued.csv", csv.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_dispatch_runs_to_completion() {
        let queue = queue();
        let (handle, task) = queue.dispatch(source("ID,Title\nA1,One\n"), ConflictMode::Upsert);
        assert_eq!(task.await.unwrap(), SessionStatus::Completed);

        let progress = queue.progress(handle.id()).unwrap();
        assert_eq!(progress.status, SessionStatus::Completed);
        assert_eq!(progress.totals.created, 1);
        assert_eq!(progress.percentage, 100.0);
        assert_eq!(queue.store().lock().unwrap().item_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_refused() {
        let queue = queue();
        let session = queue.run(source("ID,Title\nA1,One\n"), ConflictMode::Upsert).await;
        assert!(!queue.cancel(session.id));
        assert!(!queue.cancel(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_finished_sessions_are_archived() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue().with_archive(SessionArchive::with_dir(dir.path()));
        let session = queue.run(source("Title\nOne\n"), ConflictMode::Upsert).await;
        assert_eq!(session.status, SessionStatus::Failed);

        let archive = SessionArchive::with_dir(dir.path());
        assert_eq!(archive.get(session.id).map(|s| s.status), Some(SessionStatus::Failed));
    }

    #[tokio::test]
    async fn test_finish_hook_sees_store() {
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        let queue = queue().with_finish_hook(Arc::new(move |store: &mut InMemoryStore, _session: &ImportSession| {
            *sink.lock().unwrap() = store.item_count();
        }));
        queue.run(source("ID,Title\nA1,One\nA2,Two\n"), ConflictMode::Upsert).await;
        assert_eq!(*seen.lock().unwrap(), 2);
    }
}
