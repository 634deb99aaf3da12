use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identity of one orchestrated process.
///
/// `created_at` is fixed at creation and kept at microsecond precision so the
/// key survives a round trip through any backend unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessKey {
    pub instance_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl ProcessKey {
    pub fn new(instance_id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            instance_id,
            created_at: created_at.trunc_subsecs(6),
        }
    }

    /// Creates a fresh key for a new process.
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4(), Utc::now())
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.instance_id)
    }
}
