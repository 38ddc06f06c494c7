use std::time::Instant;

use serde::Serialize;

use super::job::ClientId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    Ready,
    Delayed { until: Instant },
    Reserved { at: Instant, by: ClientId },
    Buried,
}

impl JobState {
    pub fn is_ready(&self) -> bool {
        matches!(self, JobState::Ready)
    }

    /// Returns the client holding the job if it's reserved.
    pub fn reserved_by(&self) -> Option<ClientId> {
        match self {
            JobState::Reserved { at: _, by } => Some(*by),
            _ => None,
        }
    }
}

// This impl is used to allow JobStats to be serialised to YAML.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use JobState::*;

        serializer.serialize_str(match self {
            Ready => "ready",
            Delayed { until: _ } => "delayed",
            Reserved { at: _, by: _ } => "reserved",
            Buried => "buried",
        })
    }
}
