//! Session archive - audit records of finished imports.
//!
//! Each terminal session is written as one JSON file named after its id.
//! Records are never deleted by the engine.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::session::ImportSession;

/// Directory where session records are stored (relative to current dir)
pub const DEFAULT_ARCHIVE_DIR: &str = ".catalog-csv/sessions";

/// On-disk store of import session records.
pub struct SessionArchive {
    archive_dir: PathBuf,
    /// Loaded sessions (id -> record)
    sessions: HashMap<Uuid, ImportSession>,
}

impl SessionArchive {
    /// Open the default archive, loading existing records from disk
    pub fn new() -> Self {
        Self::with_dir(DEFAULT_ARCHIVE_DIR)
    }

    /// Open an archive in a custom directory
    pub fn with_dir(dir: impl AsRef<Path>) -> Self {
        let mut archive = Self {
            archive_dir: dir.as_ref().to_path_buf(),
            sessions: HashMap::new(),
        };
        archive.load_all();
        archive
    }

    pub fn dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Load every readable record; unreadable files are skipped.
    fn load_all(&mut self) {
        let entries = match fs::read_dir(&self.archive_dir) {
            Ok(e) => e,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                match fs::read_to_string(&path).map(|c| serde_json::from_str::<ImportSession>(&c)) {
                    Ok(Ok(session)) => {
                        self.sessions.insert(session.id, session);
                    }
                    _ => tracing::warn!(path = %path.display(), "Skipping unreadable session record"),
                }
            }
        }
    }

    /// Sessions, newest first.
    pub fn list(&self) -> Vec<&ImportSession> {
        let mut sessions: Vec<_> = self.sessions.values().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    pub fn get(&self, id: Uuid) -> Option<&ImportSession> {
        self.sessions.get(&id)
    }

    /// Find a session by full id or unique id prefix.
    pub fn find(&self, id_or_prefix: &str) -> Option<&ImportSession> {
        if let Ok(id) = Uuid::parse_str(id_or_prefix) {
            return self.get(id);
        }
        let prefix = id_or_prefix.to_lowercase();
        let mut matches = self
            .sessions
            .values()
            .filter(|s| s.id.to_string().starts_with(&prefix));
        match (matches.next(), matches.next()) {
            (Some(session), None) => Some(session),
            _ => None,
        }
    }

    /// Write a session record, replacing any earlier copy.
    pub fn save(&mut self, session: &ImportSession) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.archive_dir)?;
        let path = self.archive_dir.join(format!("{}.json", session.id));
        let json = serde_json::to_string_pretty(session).map_err(io::Error::other)?;
        fs::write(&path, json)?;
        self.sessions.insert(session.id, session.clone());
        Ok(path)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionArchive {
    fn default() -> Self {
        Self::new()
    }
}
