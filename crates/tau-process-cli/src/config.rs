use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tau_process_state::ProcessStateConfig;

pub(crate) const CONFIG_SCHEMA_VERSION: u32 = 1;
const DEFAULT_DATABASE_PATH: &str = ".tau/processes/processes.sqlite";
const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// On-disk configuration for `tau-procctl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ProcCtlConfig {
    pub schema_version: u32,
    /// Queue and snapshot tables share this database.
    pub database_path: PathBuf,
    pub state: ProcessStateConfig,
    pub retention: RetentionConfig,
}

impl Default for ProcCtlConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            state: ProcessStateConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct RetentionConfig {
    /// Terminal processes untouched for longer than this are pruned.
    pub max_age_secs: u64,
    pub prune_snapshots: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: DEFAULT_RETENTION_SECS,
            prune_snapshots: true,
        }
    }
}

/// Reads the config at `path`, or the defaults when no path is given.
pub(crate) fn load_config(path: Option<&Path>) -> Result<ProcCtlConfig> {
    let Some(path) = path else {
        return Ok(ProcCtlConfig::default());
    };
    let payload = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read process config '{}'", path.display()))?;
    let config = serde_json::from_str::<ProcCtlConfig>(&payload).with_context(|| {
        format!(
            "failed to parse process config '{}': expected JSON object",
            path.display()
        )
    })?;
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        bail!(
            "unsupported process config schema_version {} in '{}' (expected {})",
            config.schema_version,
            path.display(),
            CONFIG_SCHEMA_VERSION
        );
    }
    Ok(config)
}
