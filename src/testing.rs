//! Stand-ins for consumers and timers, shared by unit tests.
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use crate::timer::{Timer, TimerEvent};
use crate::tube::Consumer;
use crate::types::job::{ClientId, JobId};

/// A consumer that records the jobs delivered to it.
#[derive(Clone, Debug)]
pub(crate) struct TestConsumer {
    id: ClientId,
    reserving: Rc<Cell<bool>>,
    inbox: Rc<RefCell<Vec<JobId>>>,
}

impl TestConsumer {
    pub(crate) fn new(id: ClientId) -> Self {
        Self {
            id,
            reserving: Rc::new(Cell::new(false)),
            inbox: Rc::default(),
        }
    }

    pub(crate) fn received(&self) -> Vec<JobId> {
        self.inbox.borrow().clone()
    }
}

impl Consumer for TestConsumer {
    fn client_id(&self) -> ClientId {
        self.id
    }

    fn is_reserving(&self) -> bool {
        self.reserving.get()
    }

    fn set_reserving(&self, reserving: bool) {
        self.reserving.set(reserving);
    }

    fn deliver(&self, id: JobId, _data: &Bytes) -> bool {
        if !self.reserving.replace(false) {
            return false;
        }
        self.inbox.borrow_mut().push(id);
        true
    }
}

/// Records scheduled events without ever firing them; tests fire events by
/// hand. Handles are indices into `scheduled`.
#[derive(Debug, Default)]
pub(crate) struct TestTimer {
    pub(crate) scheduled: Vec<(Duration, TimerEvent)>,
    pub(crate) cancelled: Vec<usize>,
}

impl Timer for TestTimer {
    type Handle = usize;

    fn schedule(&mut self, after: Duration, event: TimerEvent) -> usize {
        self.scheduled.push((after, event));
        self.scheduled.len() - 1
    }

    fn cancel(&mut self, handle: usize) {
        self.cancelled.push(handle);
    }
}

impl TestTimer {
    /// Events scheduled and not cancelled.
    pub(crate) fn live(&self) -> Vec<TimerEvent> {
        self.scheduled
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.cancelled.contains(i))
            .map(|(_, (_, event))| event.clone())
            .collect()
    }

    /// The most recently scheduled event.
    pub(crate) fn last(&self) -> (Duration, TimerEvent) {
        self.scheduled.last().cloned().expect("nothing scheduled")
    }
}
