// src/store/file.rs

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::errors::{JobgraphError, Result};
use crate::fs::{FileSystem, RealFileSystem};
use crate::store::{JobRecord, StoreState, TaskFailureRecord, TaskRecord, TaskStore};
use crate::types::JobId;

/// Store persisted as a single JSON document.
///
/// The whole document is rewritten on every save. A write that fails is
/// rolled back in memory as well, so reads never observe a record that is
/// not on disk.
#[derive(Debug)]
pub struct FileStore<F: FileSystem = RealFileSystem> {
    fs: F,
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore<RealFileSystem> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(RealFileSystem, path)
    }
}

impl<F: FileSystem> FileStore<F> {
    /// Open (or lazily create) the store document at `path`.
    pub fn open_with(fs: F, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = if fs.exists(&path) {
            let contents = fs.read_to_string(&path)?;
            let state: StoreState = serde_json::from_str(&contents)?;
            info!(path = %path.display(), "opened file store");
            state
        } else {
            debug!(path = %path.display(), "file store does not exist yet; starting empty");
            StoreState::default()
        };

        Ok(Self {
            fs,
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| JobgraphError::Persistence("file store lock poisoned".to_string()))
    }

    fn flush(&self, state: &StoreState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        self.fs.write_atomic(&self.path, &bytes).map_err(|e| {
            error!(path = %self.path.display(), error = %e, "failed to write file store");
            JobgraphError::Persistence(format!("writing {}: {e:#}", self.path.display()))
        })
    }
}

impl<F: FileSystem> TaskStore for FileStore<F> {
    fn save_task(&self, record: &TaskRecord) -> Result<()> {
        let mut state = self.lock()?;
        let previous = state.put_task(record);
        if let Err(e) = self.flush(&state) {
            state.restore_task(record.id, previous);
            return Err(e);
        }
        Ok(())
    }

    fn save_job(&self, record: &JobRecord) -> Result<()> {
        let mut state = self.lock()?;
        let previous = state.put_job(record);
        if let Err(e) = self.flush(&state) {
            state.restore_job(record.id, previous);
            return Err(e);
        }
        Ok(())
    }

    fn find_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.lock()?.job(id))
    }

    fn find_jobs(&self) -> Result<Vec<JobRecord>> {
        Ok(self.lock()?.jobs())
    }

    fn find_tasks_by_job_id(&self, id: JobId) -> Result<Vec<TaskRecord>> {
        Ok(self.lock()?.tasks_by_job(id))
    }

    fn find_uncompleted_tasks(&self) -> Result<Vec<TaskRecord>> {
        Ok(self.lock()?.uncompleted_tasks())
    }

    fn find_failures_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<TaskFailureRecord>> {
        Ok(self.lock()?.failures_since(since))
    }
}
