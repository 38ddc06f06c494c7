//! The per-tube dispatch engine.
//!
//! A `Tube` indexes the jobs of one named queue by state and tracks the
//! clients attached to it. Jobs themselves live in a `JobRegistry`, which is
//! the authority on each job's state: the tube only moves IDs between its
//! structures and updates the registry as it goes.
//!
//! Every operation runs to completion before the next one starts; callers
//! hold the broker lock for the duration.
mod ready_queue;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

pub use self::ready_queue::ReadyQueue;
use crate::registry::JobRegistry;
use crate::timer::{Timer, TimerEvent};
use crate::types::job::{ClientId, JobId, TubeName};
use crate::types::protocol::TubeStats;
use crate::types::states::JobState;

/// Ready jobs with a priority below this are counted as urgent.
pub const URGENT_PRI: u32 = 1024;

/// Something jobs can be handed to, typically a client connection.
pub trait Consumer: Clone {
    fn client_id(&self) -> ClientId;

    /// True while the consumer is blocked in a reserve and hasn't been served.
    fn is_reserving(&self) -> bool;

    fn set_reserving(&self, reserving: bool);

    /// Hands a job over, clearing the reserving flag. Returns false if the
    /// consumer wasn't reserving or has gone away, in which case nothing was
    /// delivered.
    fn deliver(&self, id: JobId, data: &Bytes) -> bool;
}

#[derive(Debug)]
struct Reservation<H> {
    client: ClientId,
    serial: u64,
    timer: H,
}

#[derive(Debug)]
struct Scheduled<H> {
    serial: u64,
    timer: H,
}

#[derive(Debug)]
struct Pause<H> {
    delay: Duration,
    until: Instant,
    serial: u64,
    timer: H,
}

/// A named job queue. `C` is the consumer handle type and `H` the handle
/// type of the `Timer` driving TTRs, delays, and pauses.
#[derive(Debug)]
pub struct Tube<C, H> {
    name: TubeName,
    ready: ReadyQueue,
    /// The reservation ledger, holding each reservation's TTR timer.
    reserved: HashMap<JobId, Reservation<H>>,
    /// Buried jobs, oldest first.
    buried: VecDeque<JobId>,
    /// Delayed jobs with their promotion timers.
    delayed: HashMap<JobId, Scheduled<H>>,
    watchers: VecDeque<C>,
    users: VecDeque<C>,
    waiters: VecDeque<C>,
    total_jobs: u64,
    cmd_delete: u64,
    cmd_pause_tube: u64,
    pause: Option<Pause<H>>,
    next_serial: u64,
}

fn add_client<C: Consumer>(clients: &mut VecDeque<C>, consumer: C) {
    let id = consumer.client_id();
    if !clients.iter().any(|c| c.client_id() == id) {
        clients.push_back(consumer);
    }
}

fn remove_client<C: Consumer>(clients: &mut VecDeque<C>, id: ClientId) {
    clients.retain(|c| c.client_id() != id);
}

impl<C: Consumer, H> Tube<C, H> {
    pub fn new(name: TubeName) -> Self {
        Self {
            name,
            ready: ReadyQueue::new(),
            reserved: HashMap::new(),
            buried: VecDeque::new(),
            delayed: HashMap::new(),
            watchers: VecDeque::new(),
            users: VecDeque::new(),
            waiters: VecDeque::new(),
            total_jobs: 0,
            cmd_delete: 0,
            cmd_pause_tube: 0,
            pause: None,
            next_serial: 0,
        }
    }

    /// Starts this tube's timer serials at `serial` rather than zero.
    pub fn with_first_serial(mut self, serial: u64) -> Self {
        self.next_serial = serial;
        self
    }

    pub fn add_watch(&mut self, consumer: C) {
        add_client(&mut self.watchers, consumer);
    }

    pub fn remove_watch(&mut self, client: ClientId) {
        remove_client(&mut self.watchers, client);
    }

    pub fn add_use(&mut self, consumer: C) {
        add_client(&mut self.users, consumer);
    }

    pub fn remove_use(&mut self, client: ClientId) {
        remove_client(&mut self.users, client);
    }

    /// Registers a waiting consumer, which may be served straight away from
    /// jobs already ready.
    pub fn add_reserve<T>(
        &mut self,
        consumer: C,
        jobs: &mut impl JobRegistry,
        timer: &mut T,
    ) where
        T: Timer<Handle = H>,
    {
        add_client(&mut self.waiters, consumer);
        self.dispatch(jobs, timer);
    }

    pub fn remove_reserve(&mut self, client: ClientId) {
        remove_client(&mut self.waiters, client);
    }

    /// Indexes a newly put job according to its state in the registry: ready
    /// jobs are queued and dispatched, delayed ones wait for their timer.
    pub fn put<T>(
        &mut self,
        id: JobId,
        jobs: &mut impl JobRegistry,
        timer: &mut T,
    ) where
        T: Timer<Handle = H>,
    {
        self.total_jobs += 1;

        let Some(job) = jobs.get_job(id) else {
            return;
        };
        let (pri, state) = (job.pri, job.state);

        match state {
            JobState::Ready => {
                self.ready.insert(id, pri);
                self.dispatch(jobs, timer);
            },
            JobState::Delayed { until } => self.schedule_delay(id, until, timer),
            JobState::Reserved { .. } | JobState::Buried => {
                trace!(tube = %self.name, id, "put of a held job ignored");
            },
        }
    }

    /// Hands ready jobs to waiting consumers: most urgent job to the longest
    /// waiting consumer, until either side runs out.
    ///
    /// Ready entries whose job is gone or no longer ready are dropped, as are
    /// waiters that have stopped reserving (e.g. served by another tube).
    pub fn dispatch<T>(&mut self, jobs: &mut impl JobRegistry, timer: &mut T)
    where
        T: Timer<Handle = H>,
    {
        if self.ready.is_empty() || self.waiters.is_empty() || self.is_paused()
        {
            return;
        }

        while !self.waiters.is_empty() {
            let Some(id) = self.ready.peek() else {
                break;
            };

            let job = match jobs.get_job(id) {
                Some(job) if job.state.is_ready() => job,
                _ => {
                    trace!(tube = %self.name, id, "dropping stale ready entry");
                    self.ready.advance();
                    continue;
                },
            };

            let mut served = None;
            while let Some(waiter) = self.waiters.pop_front() {
                if waiter.is_reserving() && waiter.deliver(id, &job.data) {
                    served = Some(waiter.client_id());
                    break;
                }
                trace!(
                    tube = %self.name,
                    client = waiter.client_id(),
                    "dropping stale waiter"
                );
            }

            let Some(client) = served else {
                break;
            };

            self.ready.advance();
            self.reserve(id, client, jobs, timer);
            debug!(tube = %self.name, id, client, "job reserved");
        }
    }

    /// Returns a reserved job to the ready queue at its current priority, or
    /// to the delayed set if `delay` is non-zero. Jobs that aren't reserved
    /// are left alone and false is returned.
    pub fn release<T>(
        &mut self,
        id: JobId,
        delay: Duration,
        jobs: &mut impl JobRegistry,
        timer: &mut T,
    ) -> bool
    where
        T: Timer<Handle = H>,
    {
        let pri = match jobs.get_job(id) {
            Some(job) if job.state.reserved_by().is_some() => job.pri,
            _ => return false,
        };

        if let Some(reservation) = self.reserved.remove(&id) {
            timer.cancel(reservation.timer);
        }

        if delay.is_zero() {
            jobs.update_state(id, JobState::Ready);
            self.ready.insert(id, pri);
            self.dispatch(jobs, timer);
        } else {
            let until = Instant::now() + delay;
            jobs.update_state(id, JobState::Delayed { until });
            self.schedule_delay(id, until, timer);
        }

        true
    }

    /// Handles a fired TTR timer: releases the job if `serial` still names
    /// its current reservation.
    pub fn ttr_expired<T>(
        &mut self,
        id: JobId,
        serial: u64,
        jobs: &mut impl JobRegistry,
        timer: &mut T,
    ) -> bool
    where
        T: Timer<Handle = H>,
    {
        if !self.reserved.get(&id).is_some_and(|r| r.serial == serial) {
            trace!(tube = %self.name, id, serial, "superseded TTR timer");
            return false;
        }

        debug!(tube = %self.name, id, "TTR expired");
        let released = self.release(id, Duration::ZERO, jobs, timer);
        if released {
            if let Some(job) = jobs.get_job_mut(id) {
                job.timeouts += 1;
            }
        }

        released
    }

    /// Buries a reserved job. Returns false if the job isn't reserved here.
    pub fn bury<T>(
        &mut self,
        id: JobId,
        jobs: &mut impl JobRegistry,
        timer: &mut T,
    ) -> bool
    where
        T: Timer<Handle = H>,
    {
        let Some(reservation) = self.reserved.remove(&id) else {
            return false;
        };
        timer.cancel(reservation.timer);

        if let Some(job) = jobs.get_job_mut(id) {
            job.state = JobState::Buried;
            job.buries += 1;
        }
        self.buried.push_back(id);

        true
    }

    /// Forgets a job in any state, cancelling its timer. The caller removes
    /// it from the registry.
    pub fn delete<T>(&mut self, id: JobId, timer: &mut T) -> bool
    where
        T: Timer<Handle = H>,
    {
        let found = if self.ready.remove(id) || self.take_buried(id) {
            true
        } else if let Some(reservation) = self.reserved.remove(&id) {
            timer.cancel(reservation.timer);
            true
        } else if let Some(scheduled) = self.delayed.remove(&id) {
            timer.cancel(scheduled.timer);
            true
        } else {
            false
        };

        if found {
            self.cmd_delete += 1;
        }

        found
    }

    /// Restarts the TTR of a reserved job.
    pub fn touch<T>(
        &mut self,
        id: JobId,
        jobs: &mut impl JobRegistry,
        timer: &mut T,
    ) -> bool
    where
        T: Timer<Handle = H>,
    {
        let Some(reservation) = self.reserved.remove(&id) else {
            return false;
        };
        timer.cancel(reservation.timer);

        let client = reservation.client;
        let Some(job) = jobs.get_job_mut(id) else {
            return false;
        };
        job.state = JobState::Reserved {
            at: Instant::now(),
            by: client,
        };

        let ttr = job.ttr();
        self.start_ttr(id, client, ttr, timer);
        true
    }

    /// Handles a fired delay timer, making the job ready.
    pub fn delay_elapsed<T>(
        &mut self,
        id: JobId,
        serial: u64,
        jobs: &mut impl JobRegistry,
        timer: &mut T,
    ) -> bool
    where
        T: Timer<Handle = H>,
    {
        if !self.delayed.get(&id).is_some_and(|s| s.serial == serial) {
            trace!(tube = %self.name, id, serial, "superseded delay timer");
            return false;
        }
        self.delayed.remove(&id);

        if let Some(job) = jobs.get_job_mut(id) {
            job.state = JobState::Ready;
            self.ready.insert(id, job.pri);
        }
        self.dispatch(jobs, timer);

        true
    }

    /// Kicks up to `bound` buried jobs, oldest first, or if none are buried,
    /// up to `bound` delayed jobs, soonest first. Returns the number kicked.
    pub fn kick<T>(
        &mut self,
        bound: u64,
        jobs: &mut impl JobRegistry,
        timer: &mut T,
    ) -> u64
    where
        T: Timer<Handle = H>,
    {
        let bound = usize::try_from(bound).unwrap_or(usize::MAX);

        let ids: Vec<JobId> = if !self.buried.is_empty() {
            let n = bound.min(self.buried.len());
            self.buried.drain(..n).collect()
        } else {
            let mut due: Vec<(Instant, JobId)> = self
                .delayed
                .keys()
                .filter_map(|&id| match jobs.get_job(id)?.state {
                    JobState::Delayed { until } => Some((until, id)),
                    _ => None,
                })
                .collect();
            due.sort_unstable();
            due.truncate(bound);

            due.into_iter()
                .map(|(_, id)| {
                    if let Some(scheduled) = self.delayed.remove(&id) {
                        timer.cancel(scheduled.timer);
                    }
                    id
                })
                .collect()
        };

        for &id in &ids {
            self.kick_ready(id, jobs);
        }
        self.dispatch(jobs, timer);

        ids.len() as u64
    }

    /// Kicks a single buried or delayed job.
    pub fn kick_job<T>(
        &mut self,
        id: JobId,
        jobs: &mut impl JobRegistry,
        timer: &mut T,
    ) -> bool
    where
        T: Timer<Handle = H>,
    {
        if !self.take_buried(id) {
            match self.delayed.remove(&id) {
                Some(scheduled) => timer.cancel(scheduled.timer),
                None => return false,
            }
        }

        self.kick_ready(id, jobs);
        self.dispatch(jobs, timer);
        true
    }

    /// Reserves a specific ready, buried, or delayed job for `client`,
    /// bypassing the waiters queue.
    pub fn reserve_job<T>(
        &mut self,
        id: JobId,
        client: ClientId,
        jobs: &mut impl JobRegistry,
        timer: &mut T,
    ) -> bool
    where
        T: Timer<Handle = H>,
    {
        let taken = if self.ready.remove(id) || self.take_buried(id) {
            true
        } else if let Some(scheduled) = self.delayed.remove(&id) {
            timer.cancel(scheduled.timer);
            true
        } else {
            false
        };

        if taken {
            self.reserve(id, client, jobs, timer);
        }

        taken
    }

    /// Stops dispatch for `delay`. A zero delay lifts any pause immediately.
    pub fn pause<T>(
        &mut self,
        delay: Duration,
        jobs: &mut impl JobRegistry,
        timer: &mut T,
    ) where
        T: Timer<Handle = H>,
    {
        self.cmd_pause_tube += 1;

        if let Some(pause) = self.pause.take() {
            timer.cancel(pause.timer);
        }

        if delay.is_zero() {
            self.dispatch(jobs, timer);
            return;
        }

        let serial = self.next_serial();
        let handle = timer.schedule(
            delay,
            TimerEvent::Unpause {
                tube: self.name.clone(),
                serial,
            },
        );
        self.pause = Some(Pause {
            delay,
            until: Instant::now() + delay,
            serial,
            timer: handle,
        });
    }

    /// Handles a fired unpause timer.
    pub fn unpause<T>(
        &mut self,
        serial: u64,
        jobs: &mut impl JobRegistry,
        timer: &mut T,
    ) -> bool
    where
        T: Timer<Handle = H>,
    {
        if !self.pause.as_ref().is_some_and(|p| p.serial == serial) {
            return false;
        }

        self.pause = None;
        debug!(tube = %self.name, "tube unpaused");
        self.dispatch(jobs, timer);
        true
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_some()
    }

    pub fn peek_ready(&self) -> Option<JobId> {
        self.ready.peek()
    }

    /// Priority of the next job dispatch would hand out.
    pub fn peek_ready_pri(&self) -> Option<u32> {
        self.ready.peek_pri()
    }

    pub fn peek_buried(&self) -> Option<JobId> {
        self.buried.front().copied()
    }

    /// The delayed job due soonest.
    pub fn peek_delayed(&self, jobs: &impl JobRegistry) -> Option<JobId> {
        self.delayed
            .keys()
            .filter_map(|&id| match jobs.get_job(id)?.state {
                JobState::Delayed { until } => Some((until, id)),
                _ => None,
            })
            .min()
            .map(|(_, id)| id)
    }

    /// IDs of jobs in this tube reserved by `client`.
    pub fn reserved_by(&self, client: ClientId) -> Vec<JobId> {
        self.reserved
            .iter()
            .filter(|(_, r)| r.client == client)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn stats(&self, now: Instant) -> TubeStats {
        let (pause, pause_time_left) = match &self.pause {
            Some(p) => (
                p.delay.as_secs(),
                p.until.saturating_duration_since(now).as_secs(),
            ),
            None => (0, 0),
        };

        TubeStats {
            name: self.name.clone(),
            current_jobs_urgent: self.ready.count_below(URGENT_PRI) as u64,
            current_jobs_ready: self.ready.len() as u64,
            current_jobs_reserved: self.reserved.len() as u64,
            current_jobs_delayed: self.delayed.len() as u64,
            current_jobs_buried: self.buried.len() as u64,
            total_jobs: self.total_jobs,
            current_using: self.users.len() as u64,
            current_watching: self.watchers.len() as u64,
            current_waiting: self.waiters.len() as u64,
            cmd_delete: self.cmd_delete,
            cmd_pause_tube: self.cmd_pause_tube,
            pause,
            pause_time_left,
        }
    }

    /// True if nothing is ready and no client watches, uses, or waits on this
    /// tube. Reserved, buried, and delayed jobs don't count.
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
            && self.watchers.is_empty()
            && self.users.is_empty()
            && self.waiters.is_empty()
    }

    /// True if any job is reserved, buried, or delayed here.
    pub fn holds_jobs(&self) -> bool {
        !self.reserved.is_empty()
            || !self.buried.is_empty()
            || !self.delayed.is_empty()
    }

    /// Cancels all outstanding timers ahead of the tube being dropped.
    /// Returns the next serial the tube would have used.
    pub fn teardown<T>(self, timer: &mut T) -> u64
    where
        T: Timer<Handle = H>,
    {
        debug!(tube = %self.name, "tearing down tube");

        for (_, reservation) in self.reserved {
            timer.cancel(reservation.timer);
        }
        for (_, scheduled) in self.delayed {
            timer.cancel(scheduled.timer);
        }
        if let Some(pause) = self.pause {
            timer.cancel(pause.timer);
        }

        self.next_serial
    }

    fn next_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    /// Marks a job reserved by `client` and starts its TTR timer.
    fn reserve<T>(
        &mut self,
        id: JobId,
        client: ClientId,
        jobs: &mut impl JobRegistry,
        timer: &mut T,
    ) where
        T: Timer<Handle = H>,
    {
        let Some(job) = jobs.get_job_mut(id) else {
            return;
        };
        job.state = JobState::Reserved {
            at: Instant::now(),
            by: client,
        };
        job.reserves += 1;

        let ttr = job.ttr();
        self.start_ttr(id, client, ttr, timer);
    }

    fn start_ttr<T>(
        &mut self,
        id: JobId,
        client: ClientId,
        ttr: Duration,
        timer: &mut T,
    ) where
        T: Timer<Handle = H>,
    {
        let serial = self.next_serial();
        let handle = timer.schedule(
            ttr,
            TimerEvent::TimeToRun {
                tube: self.name.clone(),
                id,
                serial,
            },
        );

        let reservation = Reservation {
            client,
            serial,
            timer: handle,
        };
        if let Some(old) = self.reserved.insert(id, reservation) {
            timer.cancel(old.timer);
        }
    }

    fn schedule_delay<T>(&mut self, id: JobId, until: Instant, timer: &mut T)
    where
        T: Timer<Handle = H>,
    {
        let serial = self.next_serial();
        let handle = timer.schedule(
            until.saturating_duration_since(Instant::now()),
            TimerEvent::Delay {
                tube: self.name.clone(),
                id,
                serial,
            },
        );

        let scheduled = Scheduled {
            serial,
            timer: handle,
        };
        if let Some(old) = self.delayed.insert(id, scheduled) {
            timer.cancel(old.timer);
        }
    }

    fn take_buried(&mut self, id: JobId) -> bool {
        match self.buried.iter().position(|b| *b == id) {
            Some(pos) => {
                self.buried.remove(pos);
                true
            },
            None => false,
        }
    }

    fn kick_ready(&mut self, id: JobId, jobs: &mut impl JobRegistry) {
        if let Some(job) = jobs.get_job_mut(id) {
            job.state = JobState::Ready;
            job.kicks += 1;
            self.ready.insert(id, job.pri);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Jobs;
    use crate::testing::{TestConsumer, TestTimer};
    use crate::types::job::Job;

    struct Harness {
        tube: Tube<TestConsumer, usize>,
        jobs: Jobs,
        timer: TestTimer,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                tube: Tube::new("default".into()),
                jobs: Jobs::new(),
                timer: TestTimer::default(),
            }
        }

        fn put_with(&mut self, pri: u32, delay: u32, ttr: u32) -> JobId {
            let id = self.jobs.allocate_id();
            let data = Bytes::from(format!("job {id}"));
            self.jobs
                .insert(Job::new(id, "default".into(), pri, delay, ttr, data));
            self.tube.put(id, &mut self.jobs, &mut self.timer);
            id
        }

        fn put(&mut self, pri: u32) -> JobId {
            self.put_with(pri, 0, 60)
        }

        fn reserve(&mut self, consumer: &TestConsumer) {
            consumer.set_reserving(true);
            self.tube.add_reserve(
                consumer.clone(),
                &mut self.jobs,
                &mut self.timer,
            );
        }

        fn release(&mut self, id: JobId) -> bool {
            self.tube
                .release(id, Duration::ZERO, &mut self.jobs, &mut self.timer)
        }

        fn bury(&mut self, id: JobId) -> bool {
            self.tube.bury(id, &mut self.jobs, &mut self.timer)
        }

        fn fire(&mut self, event: TimerEvent) -> bool {
            let (jobs, timer) = (&mut self.jobs, &mut self.timer);
            match event {
                TimerEvent::TimeToRun { id, serial, .. } => {
                    self.tube.ttr_expired(id, serial, jobs, timer)
                },
                TimerEvent::Delay { id, serial, .. } => {
                    self.tube.delay_elapsed(id, serial, jobs, timer)
                },
                TimerEvent::Unpause { serial, .. } => {
                    self.tube.unpause(serial, jobs, timer)
                },
            }
        }

        fn state(&self, id: JobId) -> JobState {
            self.jobs.get_job(id).unwrap().state
        }

        fn stats(&self) -> TubeStats {
            self.tube.stats(Instant::now())
        }

        /// The tube structures currently referencing `id`.
        fn homes(&self, id: JobId) -> Vec<&'static str> {
            let mut homes = Vec::new();
            if self.tube.ready.contains(id) {
                homes.push("ready");
            }
            if self.tube.reserved.contains_key(&id) {
                homes.push("reserved");
            }
            if self.tube.buried.contains(&id) {
                homes.push("buried");
            }
            if self.tube.delayed.contains_key(&id) {
                homes.push("delayed");
            }
            homes
        }
    }

    #[test]
    fn test_delivery_in_priority_then_put_order() {
        let mut h = Harness::new();
        let pris = [5, 1, 5, 3, 1, 0, 3, u32::MAX, 0];
        let ids: Vec<JobId> = pris.iter().map(|&pri| h.put(pri)).collect();

        let worker = TestConsumer::new(1);
        for _ in &pris {
            h.reserve(&worker);
        }

        // A stable sort by priority gives the expected delivery order.
        let mut expected: Vec<(u32, JobId)> =
            pris.iter().copied().zip(ids).collect();
        expected.sort_by_key(|(pri, _)| *pri);
        let expected: Vec<JobId> =
            expected.into_iter().map(|(_, id)| id).collect();

        assert_eq!(worker.received(), expected);
        assert_eq!(h.stats().current_jobs_ready, 0);
        assert_eq!(h.stats().current_jobs_reserved, pris.len() as u64);
    }

    #[test]
    fn test_most_urgent_job_served_first() {
        let mut h = Harness::new();
        let first = h.put(10);
        let second = h.put(5);

        let a = TestConsumer::new(1);
        let b = TestConsumer::new(2);
        h.reserve(&a);
        h.reserve(&b);

        assert_eq!(a.received(), vec![second]);
        assert_eq!(b.received(), vec![first]);
        assert_eq!(h.state(second).reserved_by(), Some(1));
        assert_eq!(h.state(first).reserved_by(), Some(2));
    }

    #[test]
    fn test_ttr_expiry_requeues_and_redelivers() {
        let mut h = Harness::new();
        let id = h.put_with(1, 0, 2);

        let a = TestConsumer::new(1);
        h.reserve(&a);
        assert_eq!(a.received(), vec![id]);

        let (after, event) = h.timer.last();
        assert_eq!(after, Duration::from_secs(2));

        // Nothing is ready, so the second worker waits.
        let b = TestConsumer::new(2);
        h.reserve(&b);
        assert!(b.received().is_empty());
        assert_eq!(h.stats().current_waiting, 1);

        assert!(h.fire(event));

        assert_eq!(b.received(), vec![id]);
        assert_eq!(h.state(id).reserved_by(), Some(2));
        let job = h.jobs.get_job(id).unwrap();
        assert_eq!((job.reserves, job.timeouts), (2, 1));
        assert_eq!(h.stats().current_waiting, 0);
    }

    #[test]
    fn test_ttr_expiry_without_waiters_makes_job_ready() {
        let mut h = Harness::new();
        let id = h.put(0);
        let a = TestConsumer::new(1);
        h.reserve(&a);

        let (_, event) = h.timer.last();
        assert!(h.fire(event));

        assert_eq!(h.state(id), JobState::Ready);
        assert_eq!(h.homes(id), vec!["ready"]);
        assert_eq!(h.stats().current_jobs_ready, 1);
    }

    #[test]
    fn test_early_waiters_served_in_registration_order() {
        let mut h = Harness::new();
        let a = TestConsumer::new(1);
        let b = TestConsumer::new(2);
        h.reserve(&a);
        h.reserve(&b);
        assert_eq!(h.stats().current_waiting, 2);

        let id = h.put(0);

        assert_eq!(a.received(), vec![id]);
        assert!(b.received().is_empty());
        assert!(b.is_reserving());
        assert_eq!(h.stats().current_waiting, 1);
    }

    #[test]
    fn test_release_of_unreserved_job_is_noop() {
        let mut h = Harness::new();
        let id = h.put(3);
        let before = h.stats();

        assert!(!h.release(id));
        assert!(!h.release(id + 100));

        assert_eq!(h.stats(), before);
        assert_eq!(h.state(id), JobState::Ready);
        assert_eq!(h.homes(id), vec!["ready"]);
    }

    #[test]
    fn test_stale_ttr_timer_is_ignored() {
        let mut h = Harness::new();
        let id = h.put(0);
        let a = TestConsumer::new(1);
        h.reserve(&a);
        let (_, event) = h.timer.last();

        assert!(h.bury(id));
        let before = h.stats();

        assert!(!h.fire(event));
        assert_eq!(h.state(id), JobState::Buried);
        assert_eq!(h.stats(), before);
        assert_eq!(h.jobs.get_job(id).unwrap().timeouts, 0);
    }

    #[test]
    fn test_ttr_timer_from_earlier_reservation_is_ignored() {
        let mut h = Harness::new();
        let id = h.put(0);
        let a = TestConsumer::new(1);
        h.reserve(&a);
        let (_, first) = h.timer.last();

        // Released and reserved again: the job is reserved, but under a new
        // timer.
        assert!(h.release(id));
        let b = TestConsumer::new(2);
        h.reserve(&b);
        assert_eq!(b.received(), vec![id]);

        assert!(!h.fire(first));
        assert_eq!(h.state(id).reserved_by(), Some(2));

        let (_, second) = h.timer.last();
        assert!(h.fire(second));
        assert_eq!(h.state(id), JobState::Ready);
    }

    #[test]
    fn test_release_cancels_ttr_timer() {
        let mut h = Harness::new();
        let id = h.put(0);
        let a = TestConsumer::new(1);
        h.reserve(&a);

        assert!(h.release(id));
        assert!(h.timer.live().is_empty());
        assert_eq!(h.state(id), JobState::Ready);
    }

    #[test]
    fn test_is_empty_ignores_held_jobs() {
        let mut h = Harness::new();
        assert!(h.tube.is_empty());

        let user = TestConsumer::new(9);
        h.tube.add_use(user.clone());
        assert!(!h.tube.is_empty());

        let buried = h.put(0);
        let reserved = h.put(0);
        assert!(!h.tube.is_empty());

        let a = TestConsumer::new(1);
        h.reserve(&a);
        h.bury(buried);
        h.reserve(&a);
        assert_eq!(h.state(reserved).reserved_by(), Some(1));
        h.tube.remove_use(user.client_id());

        // One buried and one reserved job, but nothing ready and no clients.
        assert!(h.tube.is_empty());
        assert!(h.tube.holds_jobs());
    }

    #[test]
    fn test_dispatch_drops_stale_ready_entries() {
        let mut h = Harness::new();
        let stale = h.put(0);
        let fresh = h.put(1);

        // Changed behind the tube's back.
        h.jobs.update_state(stale, JobState::Buried);

        let a = TestConsumer::new(1);
        h.reserve(&a);

        assert_eq!(a.received(), vec![fresh]);
        assert_eq!(h.stats().current_jobs_ready, 0);
        assert!(h.homes(stale).is_empty());
    }

    #[test]
    fn test_dispatch_drops_stale_waiters() {
        let mut h = Harness::new();
        let a = TestConsumer::new(1);
        let b = TestConsumer::new(2);
        h.reserve(&a);
        h.reserve(&b);

        // a was served elsewhere meanwhile.
        a.set_reserving(false);

        let id = h.put(0);

        assert!(a.received().is_empty());
        assert_eq!(b.received(), vec![id]);
        assert_eq!(h.stats().current_waiting, 0);
    }

    #[test]
    fn test_job_lives_in_one_structure() {
        let mut h = Harness::new();
        let a = TestConsumer::new(1);
        let ids: Vec<JobId> = (0..4).map(|pri| h.put(pri)).collect();
        let delayed = h.put_with(0, 30, 60);

        let check = |h: &Harness| {
            for &id in ids.iter().chain([&delayed]) {
                assert_eq!(h.homes(id).len(), 1, "job {id}: {:?}", h.homes(id));
            }
        };
        check(&h);

        h.reserve(&a);
        h.reserve(&a);
        check(&h);

        h.bury(ids[0]);
        h.release(ids[1]);
        check(&h);

        h.reserve(&a);
        h.tube.touch(ids[1], &mut h.jobs, &mut h.timer);
        check(&h);

        assert_eq!(h.tube.kick(10, &mut h.jobs, &mut h.timer), 1);
        check(&h);

        h.reserve(&a);
        h.tube.release(
            ids[0],
            Duration::from_secs(5),
            &mut h.jobs,
            &mut h.timer,
        );
        check(&h);

        assert_eq!(h.stats().current_jobs_delayed, 2);
    }

    #[test]
    fn test_ready_count_tracks_interleaving() {
        let mut h = Harness::new();
        let a = TestConsumer::new(1);

        let x = h.put(1);
        let y = h.put(2);
        assert_eq!(h.stats().current_jobs_ready, 2);

        h.reserve(&a);
        assert_eq!(h.stats().current_jobs_ready, 1);

        h.put(3);
        assert_eq!(h.stats().current_jobs_ready, 2);

        h.release(x);
        assert_eq!(h.stats().current_jobs_ready, 3);

        h.reserve(&a);
        h.reserve(&a);
        assert_eq!(a.received(), vec![x, x, y]);
        assert_eq!(h.stats().current_jobs_ready, 1);
        assert_eq!(h.stats().total_jobs, 3);
    }

    #[test]
    fn test_delayed_job_promoted_on_timer() {
        let mut h = Harness::new();
        let a = TestConsumer::new(1);
        h.reserve(&a);

        let id = h.put_with(0, 10, 60);
        assert!(a.received().is_empty());
        assert_eq!(h.tube.peek_delayed(&h.jobs), Some(id));

        let (after, event) = h.timer.last();
        assert!(after <= Duration::from_secs(10));
        assert!(after > Duration::from_secs(9));

        assert!(h.fire(event.clone()));
        assert_eq!(a.received(), vec![id]);
        assert_eq!(h.stats().current_jobs_delayed, 0);

        // The same event again is stale.
        assert!(!h.fire(event));
    }

    #[test]
    fn test_release_with_delay() {
        let mut h = Harness::new();
        let id = h.put(0);
        let a = TestConsumer::new(1);
        h.reserve(&a);

        assert!(h.tube.release(
            id,
            Duration::from_secs(3),
            &mut h.jobs,
            &mut h.timer
        ));
        assert!(matches!(h.state(id), JobState::Delayed { .. }));
        assert_eq!(h.homes(id), vec!["delayed"]);

        let (_, event) = h.timer.last();
        assert!(h.fire(event));
        assert_eq!(h.state(id), JobState::Ready);
    }

    #[test]
    fn test_kick_prefers_buried_over_delayed() {
        let mut h = Harness::new();
        let a = TestConsumer::new(1);
        let b1 = h.put(0);
        let b2 = h.put(0);
        let d1 = h.put_with(0, 50, 60);
        let d2 = h.put_with(0, 20, 60);

        h.reserve(&a);
        h.bury(b1);
        h.reserve(&a);
        h.bury(b2);
        assert_eq!(h.tube.peek_buried(), Some(b1));

        assert_eq!(h.tube.kick(1, &mut h.jobs, &mut h.timer), 1);
        assert_eq!(h.homes(b1), vec!["ready"]);
        assert_eq!(h.tube.kick(5, &mut h.jobs, &mut h.timer), 1);
        assert_eq!(h.homes(b2), vec!["ready"]);

        // No buried jobs left, so delayed ones go, soonest first.
        assert_eq!(h.tube.kick(1, &mut h.jobs, &mut h.timer), 1);
        assert_eq!(h.homes(d2), vec!["ready"]);
        assert_eq!(h.homes(d1), vec!["delayed"]);
        assert_eq!(h.jobs.get_job(d2).unwrap().kicks, 1);

        assert_eq!(h.tube.kick(1, &mut h.jobs, &mut h.timer), 1);
        assert_eq!(h.tube.kick(1, &mut h.jobs, &mut h.timer), 0);
        assert_eq!(h.stats().current_jobs_ready, 4);
    }

    #[test]
    fn test_kick_job() {
        let mut h = Harness::new();
        let ready = h.put(0);
        let delayed = h.put_with(0, 50, 60);

        assert!(!h.tube.kick_job(ready, &mut h.jobs, &mut h.timer));
        assert!(h.tube.kick_job(delayed, &mut h.jobs, &mut h.timer));
        assert_eq!(h.state(delayed), JobState::Ready);
        assert!(h.timer.live().is_empty());
    }

    #[test]
    fn test_touch_restarts_ttr() {
        let mut h = Harness::new();
        let id = h.put_with(0, 0, 5);
        let a = TestConsumer::new(1);
        h.reserve(&a);
        let (_, old) = h.timer.last();

        assert!(h.tube.touch(id, &mut h.jobs, &mut h.timer));
        let (after, new) = h.timer.last();
        assert_eq!(after, Duration::from_secs(5));
        assert_ne!(old, new);

        assert!(!h.fire(old));
        assert!(h.fire(new));
        assert!(!h.tube.touch(id, &mut h.jobs, &mut h.timer));
    }

    #[test]
    fn test_pause_holds_dispatch() {
        let mut h = Harness::new();
        h.tube.pause(Duration::from_secs(60), &mut h.jobs, &mut h.timer);
        assert!(h.tube.is_paused());

        let a = TestConsumer::new(1);
        h.reserve(&a);
        let id = h.put(0);
        assert!(a.received().is_empty());

        let stats = h.stats();
        assert_eq!((stats.pause, stats.cmd_pause_tube), (60, 1));
        assert!(stats.pause_time_left > 0);

        let (_, event) = h.timer.last();
        assert!(h.fire(event));
        assert!(!h.tube.is_paused());
        assert_eq!(a.received(), vec![id]);
    }

    #[test]
    fn test_zero_pause_unpauses() {
        let mut h = Harness::new();
        h.tube.pause(Duration::from_secs(60), &mut h.jobs, &mut h.timer);
        let (_, event) = h.timer.last();

        let a = TestConsumer::new(1);
        h.reserve(&a);
        let id = h.put(0);

        h.tube.pause(Duration::ZERO, &mut h.jobs, &mut h.timer);
        assert_eq!(a.received(), vec![id]);
        assert!(!h.fire(event));
    }

    #[test]
    fn test_delete_from_each_state() {
        let mut h = Harness::new();
        let a = TestConsumer::new(1);
        let reserved = h.put(0);
        let buried = h.put(0);
        let ready = h.put(0);
        let delayed = h.put_with(0, 10, 60);

        h.reserve(&a);
        h.reserve(&a);
        h.bury(buried);

        for id in [reserved, buried, ready, delayed] {
            assert!(h.tube.delete(id, &mut h.timer), "job {id}");
            assert!(h.homes(id).is_empty());
            assert!(!h.tube.delete(id, &mut h.timer));
        }

        assert!(h.timer.live().is_empty());
        assert!(!h.tube.holds_jobs());
        assert_eq!(h.stats().cmd_delete, 4);
    }

    #[test]
    fn test_reserve_job() {
        let mut h = Harness::new();
        let first = h.put(0);
        let second = h.put(0);

        assert!(h.tube.reserve_job(second, 4, &mut h.jobs, &mut h.timer));
        assert_eq!(h.state(second).reserved_by(), Some(4));
        assert_eq!(h.tube.reserved_by(4), vec![second]);
        assert!(!h.tube.reserve_job(second, 5, &mut h.jobs, &mut h.timer));
        assert_eq!(h.tube.peek_ready(), Some(first));
    }

    #[test]
    fn test_membership_is_idempotent() {
        let mut h = Harness::new();
        let a = TestConsumer::new(1);

        h.tube.add_watch(a.clone());
        h.tube.add_watch(a.clone());
        h.tube.add_use(a.clone());
        h.reserve(&a);
        h.reserve(&a);

        let stats = h.stats();
        assert_eq!(stats.current_watching, 1);
        assert_eq!(stats.current_using, 1);
        assert_eq!(stats.current_waiting, 1);

        // Leaving the waiters queue doesn't touch ready jobs.
        let id = h.put(0);
        assert_eq!(a.received(), vec![id]);
        h.put(0);
        h.tube.remove_reserve(a.client_id());
        h.tube.remove_reserve(a.client_id());
        h.tube.remove_watch(a.client_id());
        h.tube.remove_use(a.client_id());

        let stats = h.stats();
        assert_eq!(stats.current_jobs_ready, 1);
        assert_eq!(
            (stats.current_watching, stats.current_using, stats.current_waiting),
            (0, 0, 0)
        );
    }

    #[test]
    fn test_urgent_count() {
        let mut h = Harness::new();
        h.put(0);
        h.put(URGENT_PRI - 1);
        h.put(URGENT_PRI);

        assert_eq!(h.stats().current_jobs_urgent, 2);
        assert_eq!(h.tube.peek_ready_pri(), Some(0));
    }

    #[test]
    fn test_teardown_cancels_timers() {
        let mut h = Harness::new();
        let a = TestConsumer::new(1);
        h.put(0);
        h.put_with(0, 10, 60);
        h.reserve(&a);
        h.tube.pause(Duration::from_secs(5), &mut h.jobs, &mut h.timer);
        assert_eq!(h.timer.live().len(), 3);

        let Harness { tube, mut timer, .. } = h;
        assert_eq!(tube.teardown(&mut timer), 3);
        assert!(timer.live().is_empty());
    }
}
