//! The broker owns the job registry, every tube, and the state of each
//! connected client, and executes commands against them.
//!
//! Tubes are created the first time they're named and collected once nothing
//! refers to them. The `default` tube always exists.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::connection::ClientHandle;
use crate::registry::{JobRegistry, Jobs};
use crate::timer::{Timer, TimerEvent, TokioTimer};
use crate::tube::{Consumer, Tube};
use crate::types::job::{ClientId, Job, JobId, TubeName};
use crate::types::protocol::{
    BeanstalkCommand, BeanstalkResponse, CommandCounters, ServerStats,
    TubeStats,
};
use crate::types::states::JobState;

pub const DEFAULT_TUBE: &str = "default";

/// A client whose reservation is this close to its TTR gets `DEADLINE_SOON`
/// instead of another job.
const DEADLINE_SOON: Duration = Duration::from_secs(1);

/// The broker as shared between connections and the timer driver.
pub type SharedBroker = Arc<Mutex<Broker<ClientHandle, TokioTimer>>>;

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Largest job body accepted, in bytes.
    pub max_job_size: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_job_size: 65535,
        }
    }
}

/// What a connection should do after a command.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    Reply(BeanstalkResponse),
    /// The client is now waiting for a job, forever or up to `timeout`. If
    /// it holds a reservation, `deadline_soon` is when to stop waiting and
    /// reply `DEADLINE_SOON` instead.
    Wait {
        timeout: Option<Duration>,
        deadline_soon: Option<Duration>,
    },
    Quit,
}

#[derive(Debug)]
struct Client<C> {
    handle: C,
    using: TubeName,
    watching: Vec<TubeName>,
    /// Has issued a put.
    producer: bool,
    /// Has issued a reserve.
    worker: bool,
}

pub struct Broker<C, T: Timer> {
    config: BrokerConfig,
    jobs: Jobs,
    tubes: HashMap<TubeName, Tube<C, T::Handle>>,
    clients: HashMap<ClientId, Client<C>>,
    timer: T,
    counters: CommandCounters,
    job_timeouts: u64,
    total_connections: u64,
    next_client_id: ClientId,
    /// First timer serial for newly created tubes: past every serial a
    /// collected tube handed out, so its queued events can't match.
    serial_floor: u64,
    started: Instant,
}

impl<C: Consumer, T: Timer> Broker<C, T> {
    pub fn new(config: BrokerConfig, timer: T) -> Self {
        let mut tubes = HashMap::new();
        tubes.insert(DEFAULT_TUBE.to_owned(), Tube::new(DEFAULT_TUBE.into()));

        Self {
            config,
            jobs: Jobs::new(),
            tubes,
            clients: HashMap::new(),
            timer,
            counters: CommandCounters::default(),
            job_timeouts: 0,
            total_connections: 0,
            next_client_id: 1,
            serial_floor: 0,
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Allocates an ID for a new client's handle.
    pub fn next_client_id(&mut self) -> ClientId {
        let id = self.next_client_id;
        self.next_client_id += 1;
        id
    }

    /// Registers a client, which starts out using and watching `default`.
    pub fn connect(&mut self, handle: C) {
        let id = handle.client_id();
        let tube =
            Self::tube_entry(&mut self.tubes, DEFAULT_TUBE, self.serial_floor);
        tube.add_use(handle.clone());
        tube.add_watch(handle.clone());

        self.clients.insert(
            id,
            Client {
                handle,
                using: DEFAULT_TUBE.into(),
                watching: vec![DEFAULT_TUBE.into()],
                producer: false,
                worker: false,
            },
        );
        self.total_connections += 1;
        debug!(client = id, "client connected");
    }

    /// Removes a client from every tube and returns the jobs it still holds
    /// to their ready queues.
    pub fn disconnect(&mut self, client: ClientId) {
        let Some(state) = self.clients.remove(&client) else {
            return;
        };
        state.handle.set_reserving(false);

        let names: Vec<TubeName> = self.tubes.keys().cloned().collect();
        for name in &names {
            let Some(tube) = self.tubes.get_mut(name) else {
                continue;
            };
            tube.remove_watch(client);
            tube.remove_use(client);
            tube.remove_reserve(client);

            for id in tube.reserved_by(client) {
                trace!(client, id, "releasing job of departed client");
                let (jobs, timer) = (&mut self.jobs, &mut self.timer);
                tube.release(id, Duration::ZERO, jobs, timer);
            }
        }

        for name in &names {
            self.collect(name);
        }
        debug!(client, "client disconnected");
    }

    /// Puts a job onto the client's used tube.
    pub fn put(
        &mut self,
        client: ClientId,
        pri: u32,
        delay: u32,
        ttr: u32,
        data: Bytes,
    ) -> BeanstalkResponse {
        self.counters.cmd_put += 1;

        let Some(state) = self.clients.get_mut(&client) else {
            return BeanstalkResponse::InternalError;
        };
        state.producer = true;
        let name = state.using.clone();

        let id = self.jobs.allocate_id();
        self.jobs.insert(Job::new(id, name.clone(), pri, delay, ttr, data));
        debug!(id, tube = %name, pri, delay, ttr, "job put");

        Self::tube_entry(&mut self.tubes, &name, self.serial_floor).put(
            id,
            &mut self.jobs,
            &mut self.timer,
        );

        BeanstalkResponse::Inserted { id }
    }

    /// Executes any command other than `put`, whose body has to be read
    /// first.
    pub fn execute(
        &mut self,
        client: ClientId,
        cmd: BeanstalkCommand,
    ) -> Outcome {
        use BeanstalkCommand::*;
        use BeanstalkResponse as R;

        self.counters.record(&cmd);

        if !self.clients.contains_key(&client) {
            return Outcome::Reply(R::InternalError);
        }

        let reply = match cmd {
            // Bodies are read by the connection, which then calls `put`.
            Put { .. } => R::InternalError,
            Reserve => return self.reserve(client, None),
            ReserveWithTimeout { timeout } => {
                let timeout = Duration::from_secs(timeout.into());
                return self.reserve(client, Some(timeout));
            },
            ReserveJob { id } => self.reserve_job(client, id),
            Release { id, pri, delay } => self.release(client, id, pri, delay),
            Delete { id } => self.delete(client, id),
            Bury { id, pri } => self.bury(client, id, pri),
            Touch { id } => self.touch(client, id),
            Watch { tube } => self.watch(client, tube),
            Ignore { tube } => self.ignore(client, tube),
            Use { tube } => self.use_tube(client, tube),
            Peek { id } => self.found(Some(id)),
            PeekReady => {
                let id = self.used_tube(client).and_then(|t| t.peek_ready());
                self.found(id)
            },
            PeekDelayed => {
                let id = self
                    .used_tube(client)
                    .and_then(|t| t.peek_delayed(&self.jobs));
                self.found(id)
            },
            PeekBuried => {
                let id = self.used_tube(client).and_then(|t| t.peek_buried());
                self.found(id)
            },
            Kick { bound } => self.kick(client, bound),
            KickJob { id } => self.kick_job(id),
            StatsJob { id } => match self.jobs.get_job(id) {
                Some(job) => R::OkStatsJob {
                    data: job.stats(Instant::now()),
                },
                None => R::NotFound,
            },
            StatsTube { tube } => match self.tube_stats(&tube) {
                Some(data) => R::OkStatsTube { data },
                None => R::NotFound,
            },
            StatsServer => R::OkStats {
                data: self.server_stats(),
            },
            ListTubes => R::OkListTubes {
                tubes: self.tube_names(),
            },
            ListTubeUsed => match self.clients.get(&client) {
                Some(state) => R::Using {
                    tube: state.using.clone(),
                },
                None => R::InternalError,
            },
            ListTubesWatched => match self.clients.get(&client) {
                Some(state) => R::OkListTubes {
                    tubes: state.watching.clone(),
                },
                None => R::InternalError,
            },
            PauseTube { tube, delay } => match self.tubes.get_mut(&tube) {
                Some(t) => {
                    let delay = Duration::from_secs(delay.into());
                    t.pause(delay, &mut self.jobs, &mut self.timer);
                    R::Paused
                },
                None => R::NotFound,
            },
            Quit => return Outcome::Quit,
        };

        Outcome::Reply(reply)
    }

    /// Takes a client out of every waiters queue it joined.
    pub fn cancel_reserve(&mut self, client: ClientId) {
        let Some(state) = self.clients.get(&client) else {
            return;
        };
        state.handle.set_reserving(false);

        for name in &state.watching {
            if let Some(tube) = self.tubes.get_mut(name) {
                tube.remove_reserve(client);
            }
        }
    }

    /// Applies a fired timer.
    pub fn on_timer(&mut self, event: TimerEvent) {
        let name = match &event {
            TimerEvent::TimeToRun { tube, .. }
            | TimerEvent::Delay { tube, .. }
            | TimerEvent::Unpause { tube, .. } => tube,
        };
        let Some(tube) = self.tubes.get_mut(name) else {
            trace!(?event, "timer for a collected tube");
            return;
        };

        let (jobs, timer) = (&mut self.jobs, &mut self.timer);
        match event {
            TimerEvent::TimeToRun { id, serial, .. } => {
                if tube.ttr_expired(id, serial, jobs, timer) {
                    self.job_timeouts += 1;
                }
            },
            TimerEvent::Delay { id, serial, .. } => {
                tube.delay_elapsed(id, serial, jobs, timer);
            },
            TimerEvent::Unpause { serial, .. } => {
                tube.unpause(serial, jobs, timer);
            },
        }
    }

    pub fn tube_names(&self) -> Vec<TubeName> {
        let mut names: Vec<TubeName> = self.tubes.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn tube_stats(&self, name: &str) -> Option<TubeStats> {
        Some(self.tubes.get(name)?.stats(Instant::now()))
    }

    pub fn server_stats(&self) -> ServerStats {
        let now = Instant::now();
        let tubes: Vec<TubeStats> =
            self.tubes.values().map(|t| t.stats(now)).collect();
        let sum = |f: fn(&TubeStats) -> u64| tubes.iter().map(f).sum::<u64>();

        ServerStats {
            current_jobs_urgent: sum(|t| t.current_jobs_urgent),
            current_jobs_ready: sum(|t| t.current_jobs_ready),
            current_jobs_reserved: sum(|t| t.current_jobs_reserved),
            current_jobs_delayed: sum(|t| t.current_jobs_delayed),
            current_jobs_buried: sum(|t| t.current_jobs_buried),
            commands: self.counters.clone(),
            job_timeouts: self.job_timeouts,
            total_jobs: self.jobs.total(),
            max_job_size: self.config.max_job_size.into(),
            current_tubes: self.tubes.len() as u64,
            current_connections: self.clients.len() as u64,
            current_producers: self
                .clients
                .values()
                .filter(|c| c.producer)
                .count() as u64,
            current_workers: self.clients.values().filter(|c| c.worker).count()
                as u64,
            current_waiting: self
                .clients
                .values()
                .filter(|c| c.handle.is_reserving())
                .count() as u64,
            total_connections: self.total_connections,
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION"),
            uptime: self.started.elapsed().as_secs(),
            draining: false,
            hostname: std::env::var("HOSTNAME")
                .unwrap_or_else(|_| "localhost".into()),
            os: std::env::consts::OS,
            platform: std::env::consts::ARCH,
        }
    }

    /// Starts a reserve: the client joins the waiters queue of each watched
    /// tube, most urgent ready job first, until one of them serves it.
    fn reserve(
        &mut self,
        client: ClientId,
        timeout: Option<Duration>,
    ) -> Outcome {
        let Some(state) = self.clients.get_mut(&client) else {
            return Outcome::Reply(BeanstalkResponse::InternalError);
        };
        state.worker = true;
        let handle = state.handle.clone();
        let mut watching = state.watching.clone();

        // Only a reserve that would otherwise block is cut short.
        let deadline_soon = self.deadline_soon(client, Instant::now());
        if deadline_soon == Some(Duration::ZERO) && !self.any_ready(&watching)
        {
            return Outcome::Reply(BeanstalkResponse::DeadlineSoon);
        }

        // Tubes with ready jobs go first, by the priority of their next job.
        watching.sort_by_key(|name| {
            match self.tubes.get(name).and_then(|t| t.peek_ready_pri()) {
                Some(pri) => (0, pri),
                None => (1, 0),
            }
        });

        handle.set_reserving(true);
        for name in &watching {
            if !handle.is_reserving() {
                break;
            }
            Self::tube_entry(&mut self.tubes, name, self.serial_floor)
                .add_reserve(handle.clone(), &mut self.jobs, &mut self.timer);
        }

        Outcome::Wait {
            timeout,
            deadline_soon,
        }
    }

    /// Time until the reservation of `client` nearest its TTR comes within
    /// the `DEADLINE_SOON` margin, zero if one already has. None if the
    /// client holds no reservations.
    fn deadline_soon(
        &self,
        client: ClientId,
        now: Instant,
    ) -> Option<Duration> {
        self.tubes
            .values()
            .flat_map(|t| t.reserved_by(client))
            .filter_map(|id| self.jobs.get_job(id))
            .map(|job| job.time_left(now).saturating_sub(DEADLINE_SOON))
            .min()
    }

    /// True if any of the named tubes would hand out a job right now.
    fn any_ready(&self, names: &[TubeName]) -> bool {
        names.iter().any(|name| {
            self.tubes
                .get(name)
                .is_some_and(|t| !t.is_paused() && t.peek_ready().is_some())
        })
    }

    /// Returns the tube of a job reserved by `client`.
    fn held_by(&self, client: ClientId, id: JobId) -> Option<TubeName> {
        let job = self.jobs.get_job(id)?;
        (job.state.reserved_by() == Some(client)).then(|| job.tube.clone())
    }

    fn reserve_job(
        &mut self,
        client: ClientId,
        id: JobId,
    ) -> BeanstalkResponse {
        let Some(name) = self.jobs.get_job(id).map(|j| j.tube.clone()) else {
            return BeanstalkResponse::NotFound;
        };
        if let Some(state) = self.clients.get_mut(&client) {
            state.worker = true;
        }

        let reserved = self.tubes.get_mut(&name).is_some_and(|tube| {
            tube.reserve_job(id, client, &mut self.jobs, &mut self.timer)
        });

        match self.jobs.get_job(id) {
            Some(job) if reserved => BeanstalkResponse::Reserved {
                id,
                data: job.data.clone(),
            },
            _ => BeanstalkResponse::NotFound,
        }
    }

    fn release(
        &mut self,
        client: ClientId,
        id: JobId,
        pri: u32,
        delay: u32,
    ) -> BeanstalkResponse {
        let Some(name) = self.held_by(client, id) else {
            return BeanstalkResponse::NotFound;
        };
        if let Some(job) = self.jobs.get_job_mut(id) {
            job.pri = pri;
            job.delay = delay;
            job.releases += 1;
        }

        let delay = Duration::from_secs(delay.into());
        let released = self.tubes.get_mut(&name).is_some_and(|tube| {
            tube.release(id, delay, &mut self.jobs, &mut self.timer)
        });

        if released {
            BeanstalkResponse::Released
        } else {
            BeanstalkResponse::NotFound
        }
    }

    fn delete(&mut self, client: ClientId, id: JobId) -> BeanstalkResponse {
        let Some(job) = self.jobs.get_job(id) else {
            return BeanstalkResponse::NotFound;
        };
        if job.state.reserved_by().is_some_and(|by| by != client) {
            return BeanstalkResponse::NotFound;
        }

        let name = job.tube.clone();
        if let Some(tube) = self.tubes.get_mut(&name) {
            tube.delete(id, &mut self.timer);
        }
        self.jobs.remove(id);
        debug!(id, tube = %name, "job deleted");

        BeanstalkResponse::Deleted
    }

    fn bury(
        &mut self,
        client: ClientId,
        id: JobId,
        pri: u32,
    ) -> BeanstalkResponse {
        let Some(name) = self.held_by(client, id) else {
            return BeanstalkResponse::NotFound;
        };
        if let Some(job) = self.jobs.get_job_mut(id) {
            job.pri = pri;
        }

        let buried = self.tubes.get_mut(&name).is_some_and(|tube| {
            tube.bury(id, &mut self.jobs, &mut self.timer)
        });

        if buried {
            BeanstalkResponse::Buried
        } else {
            BeanstalkResponse::NotFound
        }
    }

    fn touch(&mut self, client: ClientId, id: JobId) -> BeanstalkResponse {
        let Some(name) = self.held_by(client, id) else {
            return BeanstalkResponse::NotFound;
        };

        let touched = self.tubes.get_mut(&name).is_some_and(|tube| {
            tube.touch(id, &mut self.jobs, &mut self.timer)
        });

        if touched {
            BeanstalkResponse::Touched
        } else {
            BeanstalkResponse::NotFound
        }
    }

    fn watch(
        &mut self,
        client: ClientId,
        tube: TubeName,
    ) -> BeanstalkResponse {
        let Some(state) = self.clients.get_mut(&client) else {
            return BeanstalkResponse::InternalError;
        };
        if !state.watching.contains(&tube) {
            state.watching.push(tube.clone());
        }
        let count = state.watching.len() as u32;

        Self::tube_entry(&mut self.tubes, &tube, self.serial_floor)
            .add_watch(state.handle.clone());

        BeanstalkResponse::Watching { count }
    }

    fn ignore(
        &mut self,
        client: ClientId,
        tube: TubeName,
    ) -> BeanstalkResponse {
        let Some(state) = self.clients.get_mut(&client) else {
            return BeanstalkResponse::InternalError;
        };

        if let Some(pos) = state.watching.iter().position(|t| *t == tube) {
            if state.watching.len() == 1 {
                return BeanstalkResponse::NotIgnored;
            }
            state.watching.remove(pos);

            if let Some(t) = self.tubes.get_mut(&tube) {
                t.remove_watch(client);
            }
        }
        let count = state.watching.len() as u32;

        self.collect(&tube);

        BeanstalkResponse::Watching { count }
    }

    fn use_tube(
        &mut self,
        client: ClientId,
        tube: TubeName,
    ) -> BeanstalkResponse {
        let Some(state) = self.clients.get_mut(&client) else {
            return BeanstalkResponse::InternalError;
        };
        let old = std::mem::replace(&mut state.using, tube.clone());
        let handle = state.handle.clone();

        if let Some(t) = self.tubes.get_mut(&old) {
            t.remove_use(client);
        }
        Self::tube_entry(&mut self.tubes, &tube, self.serial_floor)
            .add_use(handle);
        self.collect(&old);

        BeanstalkResponse::Using { tube }
    }

    fn kick(&mut self, client: ClientId, bound: u64) -> BeanstalkResponse {
        let Some(name) = self.clients.get(&client).map(|c| c.using.clone())
        else {
            return BeanstalkResponse::InternalError;
        };

        let count = self.tubes.get_mut(&name).map_or(0, |tube| {
            tube.kick(bound, &mut self.jobs, &mut self.timer)
        });

        BeanstalkResponse::KickedCount { count }
    }

    fn kick_job(&mut self, id: JobId) -> BeanstalkResponse {
        let Some(job) = self.jobs.get_job(id) else {
            return BeanstalkResponse::NotFound;
        };
        if !matches!(job.state, JobState::Buried | JobState::Delayed { .. }) {
            return BeanstalkResponse::NotFound;
        }

        let name = job.tube.clone();
        let kicked = self.tubes.get_mut(&name).is_some_and(|tube| {
            tube.kick_job(id, &mut self.jobs, &mut self.timer)
        });

        if kicked {
            BeanstalkResponse::Kicked
        } else {
            BeanstalkResponse::NotFound
        }
    }

    fn found(&self, id: Option<JobId>) -> BeanstalkResponse {
        match id.and_then(|id| self.jobs.get_job(id)) {
            Some(job) => BeanstalkResponse::Found {
                id: job.id,
                data: job.data.clone(),
            },
            None => BeanstalkResponse::NotFound,
        }
    }

    fn used_tube(&self, client: ClientId) -> Option<&Tube<C, T::Handle>> {
        let state = self.clients.get(&client)?;
        self.tubes.get(&state.using)
    }

    /// Returns the named tube, creating it if needed.
    fn tube_entry<'a>(
        tubes: &'a mut HashMap<TubeName, Tube<C, T::Handle>>,
        name: &str,
        first_serial: u64,
    ) -> &'a mut Tube<C, T::Handle> {
        tubes.entry(name.to_owned()).or_insert_with(|| {
            debug!(tube = name, first_serial, "creating tube");
            Tube::new(name.to_owned()).with_first_serial(first_serial)
        })
    }

    /// Drops a tube once no client refers to it and it holds no jobs.
    fn collect(&mut self, name: &str) {
        if name == DEFAULT_TUBE {
            return;
        }

        let idle = self
            .tubes
            .get(name)
            .is_some_and(|t| t.is_empty() && !t.holds_jobs());
        if idle {
            if let Some(tube) = self.tubes.remove(name) {
                let next = tube.teardown(&mut self.timer);
                self.serial_floor = self.serial_floor.max(next);
            }
        }
    }
}
