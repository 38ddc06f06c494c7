//! Serves one client connection against the shared broker.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, Span};

use crate::broker::{Outcome, SharedBroker};
use crate::line_reader::{LineReader, LineTooLong};
use crate::parser::{ParsingError, MAX_LINE_LEN};
use crate::tube::Consumer;
use crate::types::job::{ClientId, JobId};
use crate::types::protocol::{BeanstalkCommand, BeanstalkResponse};
use crate::types::serialisable::BeanstalkSerialisable;
use crate::util::bytes_to_human_str;

/// Oversized job bodies are skipped over in pieces of at most this size.
const DISCARD_CHUNK: usize = 64 * 1024;

/// A waiting client's input is read ahead, for hang-up detection, only while
/// less than this much is buffered.
const WAIT_BUFFER_LIMIT: usize = 64 * 1024;

/// A job handed to a waiting client.
#[derive(Debug)]
pub struct Reservation {
    pub id: JobId,
    pub data: Bytes,
}

/// The broker's view of a connected client.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    id: ClientId,
    reserving: Arc<AtomicBool>,
    deliveries: mpsc::UnboundedSender<Reservation>,
}

impl ClientHandle {
    /// Creates a handle along with the receiving end of its deliveries.
    pub fn new(id: ClientId) -> (Self, mpsc::UnboundedReceiver<Reservation>) {
        let (deliveries, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id,
            reserving: Arc::new(AtomicBool::new(false)),
            deliveries,
        };
        (handle, rx)
    }
}

impl Consumer for ClientHandle {
    fn client_id(&self) -> ClientId {
        self.id
    }

    fn is_reserving(&self) -> bool {
        self.reserving.load(Ordering::SeqCst)
    }

    fn set_reserving(&self, reserving: bool) {
        self.reserving.store(reserving, Ordering::SeqCst);
    }

    fn deliver(&self, id: JobId, data: &Bytes) -> bool {
        // Whoever clears the flag owns the delivery.
        if !self.reserving.swap(false, Ordering::SeqCst) {
            return false;
        }

        let data = data.clone();
        self.deliveries.send(Reservation { id, data }).is_ok()
    }
}

/// Per-connection state shared by the command loop's helpers.
struct Session<R: AsyncRead + Unpin> {
    broker: SharedBroker,
    cancel: CancellationToken,
    reader: LineReader<R>,
    client: ClientId,
    deliveries: mpsc::UnboundedReceiver<Reservation>,
}

/// Runs the command loop for one connection until the client quits or
/// disconnects, or `cancel` fires. The client is always removed from the
/// broker on the way out, releasing any jobs it still holds.
#[instrument(name = "session", skip_all, fields(client))]
pub async fn serve<S>(
    broker: SharedBroker,
    cancel: CancellationToken,
    stream: S,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (r, mut w) = io::split(stream);

    let (client, deliveries) = {
        let mut broker = broker.lock().await;
        let (handle, deliveries) = ClientHandle::new(broker.next_client_id());
        let client = handle.client_id();
        broker.connect(handle);
        (client, deliveries)
    };
    Span::current().record("client", client);

    let mut session = Session {
        broker,
        cancel,
        reader: LineReader::with_max_line_len(r, MAX_LINE_LEN),
        client,
        deliveries,
    };

    let ret = session.run(&mut w).await;

    session.broker.lock().await.disconnect(client);
    debug!("session ended");

    ret
}

impl<R: AsyncRead + Unpin> Session<R> {
    async fn run<W: AsyncWrite + Unpin>(&mut self, w: &mut W) -> Result<()> {
        let cancel = self.cancel.clone();

        loop {
            let line = select! {
                x = self.reader.read_line() => x,
                _ = cancel.cancelled() => return Ok(()),
            };

            let resp = match line {
                Ok(Some(line)) => {
                    trace!(
                        line = bytes_to_human_str(&line),
                        "processing command"
                    );
                    match self.process(&line).await? {
                        Some(resp) => resp,
                        None => return Ok(()),
                    }
                },
                Ok(None) => return Ok(()),
                Err(e) if LineTooLong::is(&e) => {
                    debug!("skipped over-long command line");
                    ParsingError::BadFormat.serialise_beanstalk()
                },
                Err(e) => return Err(e).context("reading command"),
            };

            // Written with cancel safety: a shutdown mid-write drops the
            // connection rather than leaving a half-written reply pending.
            select! {
                x = w.write_all(&resp) => x.context("writing response")?,
                _ = cancel.cancelled() => return Ok(()),
            };

            // Flushed per reply, so pipelined requests get pipelined replies.
            select! {
                x = w.flush() => x.context("flushing response")?,
                _ = cancel.cancelled() => return Ok(()),
            };
        }
    }

    /// Handles one command line, returning the serialised reply, or None if
    /// the connection should close.
    async fn process(&mut self, line: &[u8]) -> Result<Option<Vec<u8>>> {
        let cmd: Result<BeanstalkCommand, ParsingError> = line.try_into();

        let resp = match cmd {
            Err(error) => return Ok(Some(error.serialise_beanstalk())),
            Ok(BeanstalkCommand::Put {
                pri,
                delay,
                ttr,
                n_bytes,
            }) => self.put(pri, delay, ttr, n_bytes).await?,
            Ok(cmd) => {
                // The guard must be gone before waiting, which locks again.
                let outcome =
                    self.broker.lock().await.execute(self.client, cmd);
                match outcome {
                    Outcome::Reply(resp) => Some(resp),
                    Outcome::Wait {
                        timeout,
                        deadline_soon,
                    } => self.wait(timeout, deadline_soon).await?,
                    Outcome::Quit => None,
                }
            },
        };

        Ok(resp.map(|resp| resp.serialise_beanstalk()))
    }

    /// Reads a job body and puts it, unless it's oversized or malformed.
    async fn put(
        &mut self,
        pri: u32,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
    ) -> Result<Option<BeanstalkResponse>> {
        let max_job_size = self.broker.lock().await.config().max_job_size;
        let len = n_bytes as usize + 2;

        if n_bytes > max_job_size {
            debug!(n_bytes, max_job_size, "discarding oversized job");
            let mut left = len;
            while left > 0 {
                let n = left.min(DISCARD_CHUNK);
                if self.read_chunk(n).await?.is_none() {
                    return Ok(None);
                }
                left -= n;
            }
            return Ok(Some(BeanstalkResponse::JobTooBig));
        }

        let Some(mut body) = self.read_chunk(len).await? else {
            return Ok(None);
        };
        if !body.ends_with(b"\r\n") {
            return Ok(Some(BeanstalkResponse::ExpectedCRLF));
        }
        body.truncate(n_bytes as usize);

        let mut broker = self.broker.lock().await;
        Ok(Some(broker.put(self.client, pri, delay, ttr, body)))
    }

    async fn read_chunk(&mut self, len: usize) -> Result<Option<Bytes>> {
        select! {
            x = self.reader.read_chunk(len) => x.context("reading job body"),
            _ = self.cancel.cancelled() => Ok(None),
        }
    }

    /// Waits for the broker to deliver a job, up to `timeout` if one is
    /// given. If `deadline_soon` passes first, the wait ends with
    /// `DEADLINE_SOON`. Returns None on shutdown, or if the client hangs up.
    ///
    /// Input arriving meanwhile is buffered, and handled once the reply is
    /// out.
    async fn wait(
        &mut self,
        timeout: Option<Duration>,
        deadline_soon: Option<Duration>,
    ) -> Result<Option<BeanstalkResponse>> {
        let now = time::Instant::now();
        let timeout = timeout.and_then(|t| now.checked_add(t));
        let deadline_soon = deadline_soon.and_then(|t| now.checked_add(t));
        let until = timeout.into_iter().chain(deadline_soon).min();

        let received = loop {
            select! {
                x = Self::recv(&mut self.deliveries, until) => break x,
                x = self.reader.fill(),
                    if self.reader.buffered() < WAIT_BUFFER_LIMIT =>
                {
                    if x.context("reading while waiting")? == 0 {
                        debug!("client hung up while waiting");
                        return Ok(None);
                    }
                },
                _ = self.cancel.cancelled() => return Ok(None),
            }
        };

        // Leave every waiters queue. A delivery that raced a timeout has
        // already landed in the channel by the time the lock is ours.
        self.broker.lock().await.cancel_reserve(self.client);
        let received = received.or_else(|| self.deliveries.try_recv().ok());

        let soon_first = match (deadline_soon, timeout) {
            (Some(soon), Some(timeout)) => soon < timeout,
            (soon, _) => soon.is_some(),
        };

        Ok(Some(match received {
            Some(Reservation { id, data }) => {
                trace!(id, "delivering reserved job");
                BeanstalkResponse::Reserved { id, data }
            },
            None if soon_first => BeanstalkResponse::DeadlineSoon,
            None => BeanstalkResponse::TimedOut,
        }))
    }

    async fn recv(
        deliveries: &mut mpsc::UnboundedReceiver<Reservation>,
        until: Option<time::Instant>,
    ) -> Option<Reservation> {
        match until {
            Some(until) => time::timeout_at(until, deliveries.recv())
                .await
                .ok()
                .flatten(),
            None => deliveries.recv().await,
        }
    }
}
