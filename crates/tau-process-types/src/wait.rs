use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a `ProcessCompletion` wait resolves when it waits on several processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionMode {
    #[default]
    All,
    One,
}

/// Declared reason a process is suspended.
///
/// The set of kinds is closed. Every variant serializes as a record tagged by
/// `type` so audit consumers can discriminate without schema knowledge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitCondition {
    /// The process is runnable.
    #[default]
    None,
    /// Wait until the listed processes reach a terminal status.
    ProcessCompletion {
        processes: Vec<Uuid>,
        #[serde(default)]
        completion: CompletionMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Wait for a named external event such as a form submission.
    ExternalEvent { event_name: String },
    /// Wait until a point in time.
    Sleep { until: DateTime<Utc> },
    /// Held behind the current holder of an exclusive group.
    Exclusive { group: String },
}

impl WaitCondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::ProcessCompletion { .. } => "PROCESS_COMPLETION",
            Self::ExternalEvent { .. } => "EXTERNAL_EVENT",
            Self::Sleep { .. } => "SLEEP",
            Self::Exclusive { .. } => "EXCLUSIVE",
        }
    }

    /// Returns the exclusive group this condition holds the process behind.
    pub fn exclusive_group(&self) -> Option<&str> {
        match self {
            Self::Exclusive { group } => Some(group),
            _ => None,
        }
    }
}
