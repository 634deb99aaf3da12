use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a status transition is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid process status transition: {from} -> {to}")]
pub struct StatusTransitionError {
    pub from: ProcessStatus,
    pub to: ProcessStatus,
}

/// Error returned when a persisted or user-supplied status label is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown process status '{0}'")]
pub struct UnknownStatusError(pub String);

/// Lifecycle state for a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    #[default]
    Preparing,
    Enqueued,
    Resuming,
    Suspended,
    Running,
    Cancelled,
    Failed,
    Finished,
}

impl ProcessStatus {
    pub const ALL: [Self; 8] = [
        Self::Preparing,
        Self::Enqueued,
        Self::Resuming,
        Self::Suspended,
        Self::Running,
        Self::Cancelled,
        Self::Failed,
        Self::Finished,
    ];

    /// Returns true when this status can transition to `next`.
    ///
    /// Self-transitions are not legal: enqueueing an enqueued process or
    /// claiming a running one must be observed as a conflict.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Preparing, Self::Enqueued)
                | (Self::Resuming, Self::Enqueued)
                | (Self::Suspended, Self::Enqueued)
                | (Self::Enqueued, Self::Running)
                | (Self::Running, Self::Suspended)
                | (Self::Suspended, Self::Resuming)
                | (Self::Running, Self::Cancelled)
                | (Self::Enqueued, Self::Cancelled)
                | (Self::Suspended, Self::Cancelled)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Finished)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(StatusTransitionError {
            from: self,
            to: next,
        })
    }

    /// Returns true when no further execution is expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Finished)
    }

    /// Returns true for the only statuses `enqueue` accepts as a source.
    pub fn can_enqueue(self) -> bool {
        self.can_transition_to(Self::Enqueued)
    }

    /// Returns true when an explicit kill or a cascade may cancel the process.
    pub fn is_cancellable(self) -> bool {
        self.can_transition_to(Self::Cancelled)
    }

    /// Returns true when entering this status drops the claiming agent.
    pub fn releases_agent(self) -> bool {
        self.is_terminal() || self == Self::Enqueued
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preparing => "PREPARING",
            Self::Enqueued => "ENQUEUED",
            Self::Resuming => "RESUMING",
            Self::Suspended => "SUSPENDED",
            Self::Running => "RUNNING",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
            Self::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = UnknownStatusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| UnknownStatusError(value.to_string()))
    }
}
