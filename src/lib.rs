//! A beanstalkd-compatible work queue.
//!
//! Each named tube owns its own ready queue, reservation ledger, and the
//! consumers attached to it; the [`broker::Broker`] ties tubes to the job
//! registry, the timer facility, and connected clients.
pub mod broker;
pub mod connection;
pub mod line_reader;
pub mod parser;
pub mod registry;
#[cfg(test)]
mod testing;
pub mod timer;
pub mod tube;
pub mod types;
pub mod util;
