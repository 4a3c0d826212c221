// src/store/memory.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::errors::{JobgraphError, Result};
use crate::store::{JobRecord, StoreState, TaskFailureRecord, TaskRecord, TaskStore};
use crate::types::JobId;

/// Store that keeps records in memory only (lost on restart).
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| JobgraphError::Persistence("memory store lock poisoned".to_string()))
    }

    fn check_writable(&self, what: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(JobgraphError::Persistence(format!(
                "memory store rejected write of {what}"
            )));
        }
        Ok(())
    }
}

impl TaskStore for MemoryStore {
    fn save_task(&self, record: &TaskRecord) -> Result<()> {
        self.check_writable(&format!("task '{}'", record.name))?;
        self.lock()?.put_task(record);
        Ok(())
    }

    fn save_job(&self, record: &JobRecord) -> Result<()> {
        self.check_writable(&format!("job '{}'", record.name))?;
        self.lock()?.put_job(record);
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
