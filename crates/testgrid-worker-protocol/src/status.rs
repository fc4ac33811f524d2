use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a single job on this worker instance.
///
/// A job is single-use: it is created `New` and ends `Stopped`, and only
/// the edges accepted by [`JobStatus::can_transition`] are ever taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    New,
    Accepting,
    Accepted,
    Setup,
    Running,
    Stopping,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// `Accepting -> Stopped` is the abandoned path taken when the control
    /// socket closes before the acceptance ack lands; every other state
    /// reaches `Stopped` through `Stopping`.
    pub fn can_transition(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (New, Accepting)
                | (Accepting, Accepted)
                | (Accepting, Stopped)
                | (Accepted, Setup)
                | (Setup, Running)
                | (New | Accepting | Accepted | Setup | Running, Stopping)
                | (Stopping, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Accepting => "accepting",
            Self::Accepted => "accepted",
            Self::Setup => "setup",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
