use bytes::Bytes;
use serde::Serialize;

use super::job::{JobId, TubeName};
use super::serialisable::BeanstalkSerialisable;
use super::states::JobState;

/// A command sent by the client to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkCommand {
    /// Places a job onto the currently `use`d tube. The job body follows the
    /// command line as `n_bytes` bytes plus a CRLF.
    ///
    /// On the wire: `put <pri> <delay> <ttr> <n_bytes>`
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
    },
    /// Awaits a job from any `watch`ed tube, blocking until one appears.
    ///
    /// On the wire: `reserve`
    Reserve,
    /// As `reserve`, but replies `TIMED_OUT` once `timeout` seconds pass
    /// without a job. A zero timeout only checks for an immediately ready job.
    ///
    /// On the wire: `reserve-with-timeout <seconds>`
    ReserveWithTimeout { timeout: u32 },
    /// Reserves the job with a given ID unless it's already reserved.
    ///
    /// On the wire: `reserve-job <id>`
    ReserveJob { id: JobId },
    /// Releases a job reserved by the same client back to the ready queue
    /// with a new priority, or to the delayed set if `delay` is non-zero.
    ///
    /// On the wire: `release <id> <pri> <delay>`
    Release { id: JobId, pri: u32, delay: u32 },
    /// Deletes a job reserved by the same client, or in the ready, buried, or
    /// delayed states.
    ///
    /// On the wire: `delete <id>`
    Delete { id: JobId },
    /// Buries a job reserved by the same client.
    ///
    /// On the wire: `bury <id> <pri>`
    Bury { id: JobId, pri: u32 },
    /// Restarts the TTR of a job reserved by the same client.
    ///
    /// On the wire: `touch <id>`
    Touch { id: JobId },
    /// Adds a tube to this client's watchlist.
    ///
    /// On the wire: `watch <tube>`
    Watch { tube: TubeName },
    /// Removes a tube from this client's watchlist, unless it's the last one.
    ///
    /// On the wire: `ignore <tube>`
    Ignore { tube: TubeName },
    /// Returns the job with this ID, regardless of its state.
    ///
    /// On the wire: `peek <id>`
    Peek { id: JobId },
    /// Returns the next ready job on the currently-used tube.
    ///
    /// On the wire: `peek-ready`
    PeekReady,
    /// Returns the delayed job on the currently-used tube that will become
    /// ready soonest.
    ///
    /// On the wire: `peek-delayed`
    PeekDelayed,
    /// Returns the oldest buried job on the currently-used tube.
    ///
    /// On the wire: `peek-buried`
    PeekBuried,
    /// Kicks up to `bound` buried jobs on the currently-used tube back to
    /// ready, or delayed jobs if no jobs are buried.
    ///
    /// On the wire: `kick <bound>`
    Kick { bound: u64 },
    /// Kicks a single buried or delayed job by its ID.
    ///
    /// On the wire: `kick-job <id>`
    KickJob { id: JobId },
    /// Returns YAML statistics for one job.
    ///
    /// On the wire: `stats-job <id>`
    StatsJob { id: JobId },
    /// Returns YAML statistics for one tube.
    ///
    /// On the wire: `stats-tube <tube>`
    StatsTube { tube: TubeName },
    /// Returns YAML statistics for the whole server.
    ///
    /// On the wire: `stats`
    StatsServer,
    /// Lists the tubes that currently exist.
    ///
    /// On the wire: `list-tubes`
    ListTubes,
    /// Returns the tube this client is using.
    ///
    /// On the wire: `list-tube-used`
    ListTubeUsed,
    /// Lists the tubes this client is watching.
    ///
    /// On the wire: `list-tubes-watched`
    ListTubesWatched,
    /// Closes the connection.
    ///
    /// On the wire: `quit`
    Quit,
    /// Stops jobs on a tube being reserved for `delay` seconds.
    ///
    /// On the wire: `pause-tube <tube> <delay>`
    PauseTube { tube: TubeName, delay: u32 },
    /// Sets the tube subsequent `put`s land in.
    ///
    /// On the wire: `use <tube>`
    Use { tube: TubeName },
}

/// All response types the server sends for a `BeanstalkCommand`. Parsing
/// failures are serialised by `ParsingError` itself.
#[derive(Clone, Debug, PartialEq)]
pub enum BeanstalkResponse {
    /// Indicates a server bug. Can be sent in response to any command.
    ///
    /// On the wire: `INTERNAL_ERROR`.
    InternalError,
    /// In response to a `put`, indicates a job was created with the given ID.
    ///
    /// On the wire: `INSERTED <id>`.
    Inserted { id: JobId },
    /// In response to a `put`, indicates the job data was not terminated by a
    /// CRLF sequence.
    ///
    /// On the wire: `EXPECTED_CRLF`.
    ExpectedCRLF,
    /// In response to a `put`, indicates the job body was larger than the
    /// server accepts.
    ///
    /// On the wire: `JOB_TOO_BIG`.
    JobTooBig,
    /// In response to a `use` or `list-tube-used`.
    ///
    /// On the wire: `USING <tube>`.
    Using { tube: TubeName },
    /// In response to a `reserve` or `reserve-with-timeout`, indicates one of
    /// the client's reserved jobs will reach its TTR within the next second.
    ///
    /// On the wire: `DEADLINE_SOON`.
    DeadlineSoon,
    /// In response to a `reserve-with-timeout`, indicates no job became
    /// available in time.
    ///
    /// On the wire: `TIMED_OUT`.
    TimedOut,
    /// In response to a `reserve`, `reserve-with-timeout`, or `reserve-job`.
    ///
    /// On the wire: `RESERVED <id> <n_bytes>` plus data.
    Reserved { id: JobId, data: Bytes },
    /// The job or tube in question doesn't exist, or isn't in a state the
    /// command can act on (e.g. releasing a job reserved by someone else).
    ///
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// On the wire: `DELETED`.
    Deleted,
    /// On the wire: `RELEASED`.
    Released,
    /// On the wire: `BURIED`.
    Buried,
    /// On the wire: `TOUCHED`.
    Touched,
    /// In response to a `watch` or `ignore`, with the number of tubes
    /// currently watched by the client.
    ///
    /// On the wire: `WATCHING <count>`.
    Watching { count: u32 },
    /// In response to an `ignore` that would leave the watchlist empty.
    ///
    /// On the wire: `NOT_IGNORED`.
    NotIgnored,
    /// In response to a `peek`-family command.
    ///
    /// On the wire: `FOUND <id> <n_bytes>` plus data.
    Found { id: JobId, data: Bytes },
    /// In response to a `kick`, with the number of jobs actually kicked.
    ///
    /// On the wire: `KICKED <count>`.
    KickedCount { count: u64 },
    /// In response to a `kick-job`.
    ///
    /// On the wire: `KICKED`.
    Kicked,
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStatsJob { data: JobStats },
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStats { data: ServerStats },
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStatsTube { data: TubeStats },
    /// In response to a `list-tubes` or `list-tubes-watched`.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML *list* format.
    OkListTubes { tubes: Vec<TubeName> },
    /// On the wire: `PAUSED`.
    Paused,
}

/// Frames `value` as an `OK <n_bytes>` YAML response.
fn yaml_ok<T: Serialize>(value: &T) -> Vec<u8> {
    match serde_yaml::to_string(value) {
        Ok(data) => format!("OK {}\r\n{data}\r\n", data.len()).into(),
        Err(_) => BeanstalkResponse::InternalError.serialise_beanstalk(),
    }
}

/// Frames a job body as `<HEADER> <id> <n_bytes>` plus data.
fn with_body(header: &str, id: JobId, data: &Bytes) -> Vec<u8> {
    let mut out = format!("{header} {id} {}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

impl BeanstalkSerialisable for BeanstalkResponse {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        use BeanstalkResponse::*;

        match self {
            InternalError => b"INTERNAL_ERROR\r\n".to_vec(),
            Inserted { id } => format!("INSERTED {id}\r\n").into(),
            ExpectedCRLF => b"EXPECTED_CRLF\r\n".to_vec(),
            JobTooBig => b"JOB_TOO_BIG\r\n".to_vec(),
            Using { tube } => format!("USING {tube}\r\n").into(),
            DeadlineSoon => b"DEADLINE_SOON\r\n".to_vec(),
            TimedOut => b"TIMED_OUT\r\n".to_vec(),
            Reserved { id, data } => with_body("RESERVED", *id, data),
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            Deleted => b"DELETED\r\n".to_vec(),
            Released => b"RELEASED\r\n".to_vec(),
            Buried => b"BURIED\r\n".to_vec(),
            Touched => b"TOUCHED\r\n".to_vec(),
            Watching { count } => format!("WATCHING {count}\r\n").into(),
            NotIgnored => b"NOT_IGNORED\r\n".to_vec(),
            Found { id, data } => with_body("FOUND", *id, data),
            KickedCount { count } => format!("KICKED {count}\r\n").into(),
            Kicked => b"KICKED\r\n".to_vec(),
            OkStatsJob { data } => yaml_ok(data),
            OkStats { data } => yaml_ok(data),
            OkStatsTube { data } => yaml_ok(data),
            OkListTubes { tubes } => yaml_ok(tubes),
            Paused => b"PAUSED\r\n".to_vec(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobStats {
    /// job ID
    pub id: JobId,
    /// tube containing job
    pub tube: TubeName,
    /// job state
    pub state: JobState,
    /// priority set by last put/release/bury
    pub pri: u32,
    /// time in seconds since creation
    pub age: u64,
    /// delay in seconds requested by the last put or release
    pub delay: u32,
    /// allowed processing time in seconds
    pub ttr: u32,
    /// seconds until a reserved job is released or a delayed job is ready
    #[serde(rename = "time-left")]
    pub time_left: u64,
    /// earliest binlog file containing job; always 0 as there's no binlog
    pub file: u32,
    pub reserves: u64,
    pub timeouts: u64,
    pub releases: u64,
    pub buries: u64,
    pub kicks: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TubeStats {
    pub name: TubeName,
    /// number of ready jobs with priority < 1024
    pub current_jobs_urgent: u64,
    pub current_jobs_ready: u64,
    pub current_jobs_reserved: u64,
    pub current_jobs_delayed: u64,
    pub current_jobs_buried: u64,
    /// jobs ever put into this tube
    pub total_jobs: u64,
    /// clients that have `use`d this tube
    pub current_using: u64,
    /// clients watching this tube
    pub current_watching: u64,
    /// clients blocked in a `reserve` on this tube
    pub current_waiting: u64,
    pub cmd_delete: u64,
    pub cmd_pause_tube: u64,
    /// seconds the tube was last paused for
    pub pause: u64,
    pub pause_time_left: u64,
}

/// Per-command counters reported by `stats`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CommandCounters {
    pub cmd_put: u64,
    pub cmd_peek: u64,
    pub cmd_peek_ready: u64,
    pub cmd_peek_delayed: u64,
    pub cmd_peek_buried: u64,
    pub cmd_reserve: u64,
    pub cmd_reserve_with_timeout: u64,
    pub cmd_touch: u64,
    pub cmd_use: u64,
    pub cmd_watch: u64,
    pub cmd_ignore: u64,
    pub cmd_delete: u64,
    pub cmd_release: u64,
    pub cmd_bury: u64,
    pub cmd_kick: u64,
    pub cmd_stats: u64,
    pub cmd_stats_job: u64,
    pub cmd_stats_tube: u64,
    pub cmd_list_tubes: u64,
    pub cmd_list_tube_used: u64,
    pub cmd_list_tubes_watched: u64,
    pub cmd_pause_tube: u64,
}

impl CommandCounters {
    pub fn record(&mut self, cmd: &BeanstalkCommand) {
        use BeanstalkCommand::*;

        let counter = match cmd {
            Put { .. } => &mut self.cmd_put,
            Peek { .. } => &mut self.cmd_peek,
            PeekReady => &mut self.cmd_peek_ready,
            PeekDelayed => &mut self.cmd_peek_delayed,
            PeekBuried => &mut self.cmd_peek_buried,
            Reserve | ReserveJob { .. } => &mut self.cmd_reserve,
            ReserveWithTimeout { .. } => &mut self.cmd_reserve_with_timeout,
            Touch { .. } => &mut self.cmd_touch,
            Use { .. } => &mut self.cmd_use,
            Watch { .. } => &mut self.cmd_watch,
            Ignore { .. } => &mut self.cmd_ignore,
            Delete { .. } => &mut self.cmd_delete,
            Release { .. } => &mut self.cmd_release,
            Bury { .. } => &mut self.cmd_bury,
            Kick { .. } | KickJob { .. } => &mut self.cmd_kick,
            StatsServer => &mut self.cmd_stats,
            StatsJob { .. } => &mut self.cmd_stats_job,
            StatsTube { .. } => &mut self.cmd_stats_tube,
            ListTubes => &mut self.cmd_list_tubes,
            ListTubeUsed => &mut self.cmd_list_tube_used,
            ListTubesWatched => &mut self.cmd_list_tubes_watched,
            PauseTube { .. } => &mut self.cmd_pause_tube,
            Quit => return,
        };

        *counter += 1;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerStats {
    pub current_jobs_urgent: u64,
    pub current_jobs_ready: u64,
    pub current_jobs_reserved: u64,
    pub current_jobs_delayed: u64,
    pub current_jobs_buried: u64,
    #[serde(flatten)]
    pub commands: CommandCounters,
    /// cumulative count of times a job has timed out
    pub job_timeouts: u64,
    /// cumulative count of jobs created
    pub total_jobs: u64,
    pub max_job_size: u64,
    pub current_tubes: u64,
    pub current_connections: u64,
    /// open connections that have issued at least one put
    pub current_producers: u64,
    /// open connections that have issued at least one reserve
    pub current_workers: u64,
    /// open connections blocked in a reserve
    pub current_waiting: u64,
    pub total_connections: u64,
    pub pid: u32,
    pub version: &'static str,
    pub uptime: u64,
    pub draining: bool,
    pub hostname: String,
    pub os: &'static str,
    pub platform: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialise_responses() {
        use BeanstalkResponse::*;

        #[track_caller]
        fn ser(resp: BeanstalkResponse, expected: &[u8]) {
            assert_eq!(resp.serialise_beanstalk(), expected);
        }

        ser(Inserted { id: 42 }, b"INSERTED 42\r\n");
        ser(
            Reserved {
                id: 7,
                data: Bytes::from_static(b"hello"),
            },
            b"RESERVED 7 5\r\nhello\r\n",
        );
        ser(
            Found {
                id: 8,
                data: Bytes::new(),
            },
            b"FOUND 8 0\r\n\r\n",
        );
        ser(
            Using {
                tube: "emails".into(),
            },
            b"USING emails\r\n",
        );
        ser(Watching { count: 3 }, b"WATCHING 3\r\n");
        ser(KickedCount { count: 0 }, b"KICKED 0\r\n");
        ser(DeadlineSoon, b"DEADLINE_SOON\r\n");
    }

    #[test]
    fn test_serialise_tube_stats() {
        let stats = TubeStats {
            name: "default".into(),
            current_jobs_ready: 2,
            total_jobs: 5,
            ..Default::default()
        };
        let out = BeanstalkResponse::OkStatsTube { data: stats }
            .serialise_beanstalk();
        let out = String::from_utf8(out).unwrap();

        let (header, body) = out.split_once("\r\n").unwrap();
        let body = body.strip_suffix("\r\n").unwrap();
        assert_eq!(header, format!("OK {}", body.len()));
        assert!(body.contains("name: default\n"));
        assert!(body.contains("current-jobs-ready: 2\n"));
        assert!(body.contains("total-jobs: 5\n"));
        assert!(body.contains("pause-time-left: 0\n"));
    }

    #[test]
    fn test_command_counters() {
        let mut counters = CommandCounters::default();
        counters.record(&BeanstalkCommand::Reserve);
        counters.record(&BeanstalkCommand::ReserveJob { id: 1 });
        counters.record(&BeanstalkCommand::Quit);
        counters.record(&BeanstalkCommand::Kick { bound: 3 });

        assert_eq!(counters.cmd_reserve, 2);
        assert_eq!(counters.cmd_kick, 1);
        assert_eq!(counters.cmd_put, 0);
    }
}
