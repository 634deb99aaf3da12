//! Registry of the reserved request/configuration keys.
//!
//! The configuration bag is schema-less, except for a small set of keys the
//! engine itself interprets. Those are registered once per process in a
//! mutex-guarded index which is sealed after initialization; registering the
//! same name twice, or registering after sealing, fails immediately.

use crate::ValueMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use thiserror::Error;

pub const META: &str = "meta";
pub const PROCESS_TIMEOUT: &str = "processTimeout";
pub const START_AT: &str = "startAt";
pub const REQUIREMENTS: &str = "requirements";
pub const EXCLUSIVE: &str = "exclusive";
pub const ENTRY_POINT: &str = "entryPoint";
pub const ARGUMENTS: &str = "arguments";
pub const ACTIVE_PROFILES: &str = "activeProfiles";
pub const REQUEST_ID: &str = "requestId";

/// Errors raised by [`KeyIndex`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyRegistryError {
    #[error("key '{0}' is already registered")]
    Duplicate(String),
    #[error("key index is sealed; cannot register '{0}'")]
    Sealed(String),
}

/// Error returned when a reserved key holds a value of the wrong kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid '{key}' value: expected {expected}, got {actual}")]
pub struct RequestKeyError {
    pub key: &'static str,
    pub expected: String,
    pub actual: &'static str,
}

/// JSON value kinds a reserved key may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Number,
    Bool,
    Object,
    Array,
}

impl ValueKind {
    /// Returns the kind of `value`, or `None` for JSON null.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(_) => Some(Self::String),
            Value::Number(_) => Some(Self::Number),
            Value::Bool(_) => Some(Self::Bool),
            Value::Object(_) => Some(Self::Object),
            Value::Array(_) => Some(Self::Array),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// A reserved configuration key and the value kinds it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestKey {
    name: &'static str,
    accepts: &'static [ValueKind],
}

impl RequestKey {
    pub const fn new(name: &'static str, accepts: &'static [ValueKind]) -> Self {
        Self { name, accepts }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Reads the key from `cfg`, treating JSON null as absent.
    pub fn get<'a>(&self, cfg: &'a ValueMap) -> Option<&'a Value> {
        cfg.get(self.name).filter(|value| !value.is_null())
    }

    /// Reads the key and checks that its value has an accepted kind.
    pub fn validate<'a>(&self, cfg: &'a ValueMap) -> Result<Option<&'a Value>, RequestKeyError> {
        let Some(value) = self.get(cfg) else {
            return Ok(None);
        };
        match ValueKind::of(value) {
            Some(kind) if self.accepts.contains(&kind) => Ok(Some(value)),
            kind => Err(RequestKeyError {
                key: self.name,
                expected: self
                    .accepts
                    .iter()
                    .map(|kind| kind.label())
                    .collect::<Vec<_>>()
                    .join(" or "),
                actual: kind.map_or("null", ValueKind::label),
            }),
        }
    }
}

/// Mutex-guarded name index with an explicit seal.
#[derive(Debug)]
pub struct KeyIndex<K> {
    keys: Mutex<BTreeMap<&'static str, K>>,
    sealed: AtomicBool,
}

impl<K: Clone> KeyIndex<K> {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(BTreeMap::new()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Registers `key` under `name`.
    pub fn register(&self, name: &'static str, key: K) -> Result<K, KeyRegistryError> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if self.sealed.load(Ordering::Acquire) {
            return Err(KeyRegistryError::Sealed(name.to_string()));
        }
        if keys.contains_key(name) {
            return Err(KeyRegistryError::Duplicate(name.to_string()));
        }
        keys.insert(name, key.clone());
        Ok(key)
    }

    /// Freezes the index. Later registrations fail.
    pub fn seal(&self) {
        let _guard = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn get(&self, name: &str) -> Option<K> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }
}

const RESERVED_KEYS: &[RequestKey] = &[
    RequestKey::new(META, &[ValueKind::Object]),
    RequestKey::new(PROCESS_TIMEOUT, &[ValueKind::String, ValueKind::Number]),
    RequestKey::new(START_AT, &[ValueKind::String]),
    RequestKey::new(REQUIREMENTS, &[ValueKind::Object]),
    RequestKey::new(EXCLUSIVE, &[ValueKind::Object]),
    RequestKey::new(ENTRY_POINT, &[ValueKind::String]),
    RequestKey::new(ARGUMENTS, &[ValueKind::Object]),
    RequestKey::new(ACTIVE_PROFILES, &[ValueKind::Array]),
    RequestKey::new(REQUEST_ID, &[ValueKind::String]),
];

fn build_request_keys() -> Result<KeyIndex<RequestKey>, KeyRegistryError> {
    let index = KeyIndex::new();
    for key in RESERVED_KEYS {
        index.register(key.name(), *key)?;
    }
    index.seal();
    Ok(index)
}

/// Returns the process-wide reserved key index, building it on first use.
pub fn request_keys() -> Result<&'static KeyIndex<RequestKey>, KeyRegistryError> {
    static INDEX: OnceLock<Result<KeyIndex<RequestKey>, KeyRegistryError>> = OnceLock::new();
    INDEX.get_or_init(build_request_keys).as_ref().map_err(Clone::clone)
}

/// Checks every reserved key present in `cfg` against its accepted kinds.
pub fn validate_reserved(cfg: &ValueMap) -> Result<(), ValidationError> {
    let index = request_keys()?;
    for name in cfg.keys() {
        if let Some(key) = index.get(name) {
            key.validate(cfg)?;
        }
    }
    Ok(())
}

/// Error returned by [`validate_reserved`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Registry(#[from] KeyRegistryError),
    #[error(transparent)]
    Kind(#[from] RequestKeyError),
}
