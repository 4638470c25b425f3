use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};

/// Geocoding requests consumed in one calendar month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub month: String,
    pub count: u32,
}

impl QuotaState {
    pub fn fresh(month: impl Into<String>) -> Self {
        Self {
            month: month.into(),
            count: 0,
        }
    }

    pub fn is_exhausted(&self, limit: u32) -> bool {
        self.count >= limit
    }

    pub fn remaining(&self, limit: u32) -> u32 {
        limit.saturating_sub(self.count)
    }

    pub fn increment(&mut self) {
        self.count = self.count.saturating_add(1);
    }
}

pub fn current_month() -> String {
    Local::now().format("%Y-%m").to_string()
}

/// Durable home of the monthly counter.
///
/// `load` never fails: missing, unreadable, corrupt, or stale state all come
/// back as a zero count for the requested month.
pub trait QuotaStore: Send + Sync {
    fn load_for(&self, month: &str) -> QuotaState;

    fn save(&self, state: &QuotaState) -> AppResult<()>;

    fn load(&self) -> QuotaState {
        self.load_for(&current_month())
    }
}

pub struct FileQuotaStore {
    path: PathBuf,
}

impl FileQuotaStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn write_atomically(&self, contents: &[u8]) -> io::Result<()> {
        let parent = self.parent_dir();
        fs::create_dir_all(&parent)?;
        let mut staged = NamedTempFile::new_in(&parent)?;
        staged.write_all(contents)?;
        staged.as_file().sync_all()?;
        staged.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}

impl QuotaStore for FileQuotaStore {
    fn load_for(&self, month: &str) -> QuotaState {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return QuotaState::fresh(month);
            }
            Err(err) => {
                warn!(
                    target: "quota",
                    path = %self.path.display(),
                    error = %err,
                    "unable to read quota file; starting from zero"
                );
                return QuotaState::fresh(month);
            }
        };

        match serde_json::from_str::<QuotaState>(&contents) {
            Ok(state) if state.month == month => state,
            Ok(state) => {
                debug!(
                    target: "quota",
                    stored_month = %state.month,
                    month,
                    "quota month rolled over; resetting count"
                );
                QuotaState::fresh(month)
            }
            Err(err) => {
                warn!(
                    target: "quota",
                    path = %self.path.display(),
                    error = %err,
                    "quota file is corrupt; starting from zero"
                );
                QuotaState::fresh(month)
            }
        }
    }

    fn save(&self, state: &QuotaState) -> AppResult<()> {
        let persistence_error =
            |err: &dyn std::fmt::Display| AppError::Persistence(format!("{}: {err}", self.path.display()));
        let serialized = serde_json::to_vec(state).map_err(|err| persistence_error(&err))?;
        self.write_atomically(&serialized)
            .map_err(|err| persistence_error(&err))
    }
}

/// Process-local store, used where durability is not wanted.
#[derive(Default)]
pub struct MemoryQuotaStore {
    state: Mutex<Option<QuotaState>>,
    saves: Mutex<usize>,
    fail_saves: Mutex<bool>,
}

impl MemoryQuotaStore {
    pub fn with_state(state: QuotaState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> Option<QuotaState> {
        self.state.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }

    pub fn fail_saves(&self, fail: bool) {
        *self.fail_saves.lock() = fail;
    }
}

impl QuotaStore for MemoryQuotaStore {
    fn load_for(&self, month: &str) -> QuotaState {
        match self.state.lock().as_ref() {
            Some(state) if state.month == month => state.clone(),
            _ => QuotaState::fresh(month),
        }
    }

    fn save(&self, state: &QuotaState) -> AppResult<()> {
        if *self.fail_saves.lock() {
            return Err(AppError::Persistence("memory store rejected write".into()));
        }
        *self.state.lock() = Some(state.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_zero() {
        let dir = tempdir().unwrap();
        let store = FileQuotaStore::new(dir.path().join("request_count.json"));
        assert_eq!(store.load_for("2025-03"), QuotaState::fresh("2025-03"));
    }

    #[test]
    fn persists_count_within_month() {
        let dir = tempdir().unwrap();
        let store = FileQuotaStore::new(dir.path().join("request_count.json"));
        let mut state = store.load_for("2025-03");
        state.increment();
        state.increment();
        store.save(&state).unwrap();

        let reloaded = FileQuotaStore::new(store.path()).load_for("2025-03");
        assert_eq!(reloaded.count, 2);
        assert_eq!(reloaded.month, "2025-03");
    }

    #[test]
    fn new_month_resets_count() {
        let dir = tempdir().unwrap();
        let store = FileQuotaStore::new(dir.path().join("request_count.json"));
        store
            .save(&QuotaState {
                month: "2025-02".into(),
                count: 9800,
            })
            .unwrap();

        let state = store.load_for("2025-03");
        assert_eq!(state, QuotaState::fresh("2025-03"));
    }

    #[test]
    fn corrupt_file_loads_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("request_count.json");
        fs::write(&path, b"{\"month\": \"2025-03\", \"count\": ").unwrap();

        let state = FileQuotaStore::new(&path).load_for("2025-03");
        assert_eq!(state.count, 0);
    }

    #[test]
    fn save_leaves_no_staging_files() {
        let dir = tempdir().unwrap();
        let store = FileQuotaStore::new(dir.path().join("request_count.json"));
        store.save(&QuotaState::fresh("2025-03")).unwrap();
        store
            .save(&QuotaState {
                month: "2025-03".into(),
                count: 1,
            })
            .unwrap();

        let entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn unwritable_directory_is_a_persistence_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        let store = FileQuotaStore::new(blocker.join("request_count.json"));
        let err = store.save(&QuotaState::fresh("2025-03")).unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)), "{err:?}");
    }

    #[test]
    fn exhaustion_checks_limit() {
        let mut state = QuotaState {
            month: "2025-03".into(),
            count: 9799,
        };
        assert!(!state.is_exhausted(9800));
        assert_eq!(state.remaining(9800), 1);
        state.increment();
        assert!(state.is_exhausted(9800));
        assert_eq!(state.remaining(9800), 0);
    }

    #[test]
    fn memory_store_tracks_saves() {
        let store = MemoryQuotaStore::default();
        let mut state = store.load_for("2025-03");
        state.increment();
        store.save(&state).unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load_for("2025-03").count, 1);
        assert_eq!(store.load_for("2025-04").count, 0);

        store.fail_saves(true);
        assert!(store.save(&state).is_err());
    }
}
