//! The timer facility behind TTR expiry, delayed jobs, and paused tubes.
//!
//! Timers never touch broker state themselves. A fired timer posts its
//! `TimerEvent` to a channel, and `drive` applies events one at a time under
//! the broker lock, exactly like a client command.
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::broker::SharedBroker;
use crate::types::job::{JobId, TubeName};

/// What to do when a timer fires. `serial` identifies the timer within its
/// tube so that events from superseded timers can be told apart.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TimerEvent {
    /// A reservation's time-to-run has elapsed.
    TimeToRun {
        tube: TubeName,
        id: JobId,
        serial: u64,
    },
    /// A delayed job is due to become ready.
    Delay {
        tube: TubeName,
        id: JobId,
        serial: u64,
    },
    /// A paused tube is due to resume.
    Unpause { tube: TubeName, serial: u64 },
}

/// Schedules `TimerEvent`s to be delivered after a delay.
pub trait Timer {
    type Handle;

    fn schedule(&mut self, after: Duration, event: TimerEvent) -> Self::Handle;

    /// Cancels a timer. Cancelling one that already fired is harmless; its
    /// event may still be delivered.
    fn cancel(&mut self, handle: Self::Handle);
}

/// A `Timer` backed by one sleeping tokio task per timer.
#[derive(Clone, Debug)]
pub struct TokioTimer {
    events: mpsc::UnboundedSender<TimerEvent>,
}

impl TokioTimer {
    /// Creates a timer along with the receiving end of its events, which
    /// should be handed to `drive`.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }
}

impl Timer for TokioTimer {
    type Handle = CancellationToken;

    fn schedule(&mut self, after: Duration, event: TimerEvent) -> Self::Handle {
        let deadline = time::Instant::now() + after;
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            select! {
                _ = time::sleep_until(deadline) => {
                    // The receiver is only gone during shutdown.
                    let _ = events.send(event);
                },
                _ = cancelled.cancelled() => {},
            }
        });

        token
    }

    fn cancel(&mut self, handle: Self::Handle) {
        handle.cancel();
    }
}

/// Applies fired timer events to the broker until cancelled.
pub async fn drive(
    broker: SharedBroker,
    mut events: mpsc::UnboundedReceiver<TimerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        trace!(?event, "timer fired");
        broker.lock().await.on_timer(event);
    }

    debug!("timer driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ttr(id: JobId) -> TimerEvent {
        TimerEvent::TimeToRun {
            tube: "default".into(),
            id,
            serial: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let (mut timer, mut rx) = TokioTimer::new();
        let start = time::Instant::now();

        timer.schedule(Duration::from_secs(5), ttr(1));
        timer.schedule(Duration::from_secs(2), ttr(2));

        assert_eq!(rx.recv().await, Some(ttr(2)));
        assert_eq!(rx.recv().await, Some(ttr(1)));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_stays_silent() {
        let (mut timer, mut rx) = TokioTimer::new();

        let handle = timer.schedule(Duration::from_secs(1), ttr(1));
        timer.schedule(Duration::from_secs(3), ttr(2));
        timer.cancel(handle);

        assert_eq!(rx.recv().await, Some(ttr(2)));
    }
}
