use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Snapshot store settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessStateConfig {
    /// Regex patterns, matched against the relative blob path, that mark a
    /// blob as secure.
    pub secure_files: Vec<String>,
    /// `hmac-sha256` or `aes-256-gcm`.
    pub signing_algorithm: Option<String>,
    pub signing_key_path: Option<PathBuf>,
    /// Snapshots untouched for longer than this are eligible for cleanup.
    pub max_state_age_secs: Option<u64>,
}

impl ProcessStateConfig {
    pub fn max_state_age(&self) -> Option<TimeDelta> {
        self.max_state_age_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(TimeDelta::try_seconds)
    }

    /// Cutoff before which snapshots are stale, relative to `now`.
    pub fn stale_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.max_state_age()
            .and_then(|age| now.checked_sub_signed(age))
    }
}
