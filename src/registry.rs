//! The job registry: the authoritative home of every live job, shared by
//! all tubes.
use std::collections::HashMap;

use crate::types::job::{Job, JobId};
use crate::types::states::JobState;

/// Lookup and mutation of jobs by ID, as needed by a `Tube`.
pub trait JobRegistry {
    fn get_job(&self, id: JobId) -> Option<&Job>;

    fn get_job_mut(&mut self, id: JobId) -> Option<&mut Job>;

    /// Sets the state of a job, ignoring unknown IDs.
    fn update_state(&mut self, id: JobId, state: JobState) {
        if let Some(job) = self.get_job_mut(id) {
            job.state = state;
        }
    }
}

/// Owns all jobs and allocates their IDs.
#[derive(Debug)]
pub struct Jobs {
    jobs: HashMap<JobId, Job>,
    next_id: JobId,
    total: u64,
}

impl Jobs {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            next_id: 1,
            total: 0,
        }
    }

    /// Returns a fresh, never-used job ID.
    pub fn allocate_id(&mut self) -> JobId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, job: Job) {
        self.total += 1;
        self.jobs.insert(job.id, job);
    }

    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        self.jobs.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Count of jobs ever inserted.
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl Default for Jobs {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry for Jobs {
    fn get_job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    fn get_job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn test_allocate_and_update() {
        let mut jobs = Jobs::new();
        let a = jobs.allocate_id();
        let b = jobs.allocate_id();
        assert_eq!((a, b), (1, 2));

        jobs.insert(Job::new(a, "default".into(), 1, 0, 1, Bytes::new()));
        jobs.update_state(a, JobState::Buried);
        jobs.update_state(b, JobState::Buried);

        assert_eq!(jobs.get_job(a).unwrap().state, JobState::Buried);
        assert!(jobs.get_job(b).is_none());
        assert_eq!(jobs.len(), 1);

        assert!(jobs.remove(a).is_some());
        assert!(jobs.is_empty());
        assert_eq!(jobs.total(), 1);
    }
}
