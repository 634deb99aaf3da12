//! Shared data types for the Tau process engine.
//!
//! Holds the process lifecycle state machine, process identity and records,
//! wait conditions, exclusive-group descriptors, the submission [`Payload`]
//! and the reserved configuration key registry. Nothing here performs I/O.

mod duration;
mod key;
mod payload;
mod record;
pub mod request_keys;
mod status;
mod wait;

pub use duration::{parse_iso8601_duration, DurationParseError};
pub use key::ProcessKey;
pub use payload::Payload;
pub use record::{
    merge_values, AuditEvent, AuditEventKind, ExclusiveGroup, ExclusiveMode, ImportEntry,
    ProcessKind, ProcessQuery, ProcessRecord, ProcessSchedule, StatusHistoryEntry, ValueMap,
    REQUEST_ID_META_KEY, SYSTEM_META_GROUP,
};
pub use status::{ProcessStatus, StatusTransitionError, UnknownStatusError};
pub use wait::{CompletionMode, WaitCondition};
