// src/lock.rs

//! Cross-job object lock registry.
//!
//! Jobs that would mutate the same domain object are serialized here.
//! Acquisition is all-or-nothing over the requested object set, so two jobs
//! can never each hold one half of a contested pair.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::types::{JobId, LockObject, ObjectType};

/// Result of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    /// Another job holds at least one of the requested objects. Nothing was
    /// acquired.
    Conflict(JobId),
}

type ObjectKey = (String, ObjectType);

#[derive(Debug, Default)]
pub struct ObjectLockRegistry {
    holders: HashMap<ObjectKey, JobId>,
}

impl ObjectLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to acquire every object for `job`.
    ///
    /// Objects already held by `job` count as granted.
    pub fn try_acquire<'a, I>(&mut self, job: JobId, objects: I) -> LockOutcome
    where
        I: IntoIterator<Item = &'a LockObject>,
    {
        let keys: Vec<ObjectKey> = objects.into_iter().map(LockObject::key).collect();

        for key in &keys {
            if let Some(holder) = self.holders.get(key) {
                if *holder != job {
                    debug!(
                        job = %job,
                        holder = %holder,
                        object = %key.0,
                        object_type = %key.1,
                        "object lock conflict"
                    );
                    return LockOutcome::Conflict(*holder);
                }
            }
        }

        for key in keys {
            trace!(job = %job, object = %key.0, "object lock granted");
            self.holders.insert(key, job);
        }
        LockOutcome::Granted
    }

    /// Release the given objects if `job` holds them. Returns how many locks
    /// were actually released.
    pub fn release<'a, I>(&mut self, job: JobId, objects: I) -> usize
    where
        I: IntoIterator<Item = &'a LockObject>,
    {
        let mut released = 0;
        for object in objects {
            let key = object.key();
            if self.holders.get(&key) == Some(&job) {
                self.holders.remove(&key);
                released += 1;
            }
        }
        if released > 0 {
            debug!(job = %job, released, "released object locks");
        }
        released
    }

    /// Release everything `job` holds.
    pub fn release_all(&mut self, job: JobId) -> usize {
        let before = self.holders.len();
        self.holders.retain(|_, holder| *holder != job);
        let released = before - self.holders.len();
        if released > 0 {
            debug!(job = %job, released, "released all object locks of job");
        }
        released
    }

    pub fn holder_of(&self, object: &LockObject) -> Option<JobId> {
        self.holders.get(&object.key()).copied()
    }

    pub fn held_by(&self, job: JobId) -> usize {
        self.holders.values().filter(|h| **h == job).count()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}
