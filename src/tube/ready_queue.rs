use std::collections::{BTreeMap, HashMap};

use crate::types::job::JobId;

/// Orders the ready jobs of a tube: lowest priority value first, and among
/// equal priorities, earliest inserted first.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    /// Keyed by (priority, insertion sequence).
    entries: BTreeMap<(u32, u64), JobId>,
    /// Where each queued job currently sits in `entries`.
    index: HashMap<JobId, (u32, u64)>,
    next_seq: u64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `id` behind every job of equal or more urgent priority. If `id`
    /// is already queued, its old entry is replaced.
    pub fn insert(&mut self, id: JobId, pri: u32) {
        self.remove(id);

        let key = (pri, self.next_seq);
        self.next_seq += 1;

        self.entries.insert(key, id);
        self.index.insert(id, key);
    }

    /// Returns the job that should be handed out next.
    pub fn peek(&self) -> Option<JobId> {
        self.entries.first_key_value().map(|(_, id)| *id)
    }

    /// Returns the priority of the job at the head of the queue.
    pub fn peek_pri(&self) -> Option<u32> {
        self.entries.first_key_value().map(|((pri, _), _)| *pri)
    }

    /// Removes and returns the head of the queue.
    pub fn advance(&mut self) -> Option<JobId> {
        let (_, id) = self.entries.pop_first()?;
        self.index.remove(&id);
        Some(id)
    }

    /// Removes `id` wherever it is in the queue, returning whether it was
    /// present.
    pub fn remove(&mut self, id: JobId) -> bool {
        match self.index.remove(&id) {
            Some(key) => {
                self.entries.remove(&key);
                true
            },
            None => false,
        }
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counts queued jobs with a priority strictly below `pri`.
    pub fn count_below(&self, pri: u32) -> usize {
        self.entries.range(..(pri, 0)).count()
    }
}
