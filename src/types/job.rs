use std::time::{Duration, Instant};

use bytes::Bytes;

use super::protocol::JobStats;
use super::states::JobState;

pub type JobId = u64;
pub type ClientId = u64;
pub type TubeName = String;

#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub tube: TubeName,
    pub pri: u32,
    pub data: Bytes,
    pub state: JobState, // also contains state-specific data
    pub created: Instant,
    pub delay: u32,
    pub ttr: u32,
    pub reserves: u64,
    pub timeouts: u64,
    pub releases: u64,
    pub buries: u64,
    pub kicks: u64,
}

impl Job {
    /// Creates a job as put by a client: delayed if `delay` is non-zero,
    /// otherwise ready. A zero TTR is raised to one second.
    pub fn new(
        id: JobId,
        tube: TubeName,
        pri: u32,
        delay: u32,
        ttr: u32,
        data: Bytes,
    ) -> Self {
        let created = Instant::now();
        let state = if delay > 0 {
            JobState::Delayed {
                until: created + Duration::from_secs(delay.into()),
            }
        } else {
            JobState::Ready
        };

        Self {
            id,
            tube,
            pri,
            data,
            state,
            created,
            delay,
            ttr: ttr.max(1),
            reserves: 0,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
        }
    }

    pub fn ttr(&self) -> Duration {
        Duration::from_secs(self.ttr.into())
    }

    /// Time remaining before a reserved job is auto-released, or a delayed
    /// job becomes ready. Zero in the other states.
    pub fn time_left(&self, now: Instant) -> Duration {
        match self.state {
            JobState::Reserved { at, by: _ } => {
                (at + self.ttr()).saturating_duration_since(now)
            },
            JobState::Delayed { until } => until.saturating_duration_since(now),
            JobState::Ready | JobState::Buried => Duration::ZERO,
        }
    }

    pub fn stats(&self, now: Instant) -> JobStats {
        JobStats {
            id: self.id,
            tube: self.tube.clone(),
            state: self.state,
            pri: self.pri,
            age: now.saturating_duration_since(self.created).as_secs(),
            delay: self.delay,
            ttr: self.ttr,
            time_left: self.time_left(now).as_secs(),
            file: 0,
            reserves: self.reserves,
            timeouts: self.timeouts,
            releases: self.releases,
            buries: self.buries,
            kicks: self.kicks,
        }
    }
}
