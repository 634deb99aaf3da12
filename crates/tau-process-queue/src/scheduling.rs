//! Derivation of scheduling metadata from a submitted payload.
//!
//! Everything here runs before the queue is touched, so a malformed value is
//! reported as `InvalidArgument` without any mutation.

use crate::{ProcessQueueError, QueueResult};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tau_process_types::request_keys::{
    self, EXCLUSIVE, META, PROCESS_TIMEOUT, REQUIREMENTS, START_AT,
};
use tau_process_types::{
    parse_iso8601_duration, ExclusiveGroup, Payload, ProcessRecord, ProcessSchedule, ValueMap,
    REQUEST_ID_META_KEY, SYSTEM_META_GROUP,
};
use uuid::Uuid;

/// Builds the schedule attached at enqueue time from the payload headers and
/// its effective configuration.
pub fn build_schedule(payload: &Payload) -> QueueResult<ProcessSchedule> {
    let cfg = payload.effective_configuration();
    request_keys::validate_reserved(&cfg)
        .map_err(|error| ProcessQueueError::InvalidArgument(error.to_string()))?;

    Ok(ProcessSchedule {
        tags: payload.tags.clone(),
        start_at: parse_start_at(cfg.get(START_AT))?,
        requirements: parse_requirements(cfg.get(REQUIREMENTS))?,
        process_timeout: parse_process_timeout(cfg.get(PROCESS_TIMEOUT))?,
        handlers: payload.handlers.clone(),
        meta: build_meta(payload, &cfg)?,
        imports: payload.imports.clone(),
        exclusive: parse_exclusive(cfg.get(EXCLUSIVE))?,
    })
}

/// Reads `processTimeout`: an ISO-8601 duration string or a number of
/// seconds. Fractional seconds are truncated.
pub fn parse_process_timeout(value: Option<&Value>) -> QueueResult<Option<u64>> {
    let invalid = |detail: String| {
        ProcessQueueError::InvalidArgument(format!("invalid '{PROCESS_TIMEOUT}' value: {detail}"))
    };
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => {
            let duration =
                parse_iso8601_duration(text).map_err(|error| invalid(error.to_string()))?;
            u64::try_from(duration.num_seconds())
                .map(Some)
                .map_err(|_| invalid(format!("'{text}' is negative")))
        }
        Some(Value::Number(number)) => {
            if let Some(seconds) = number.as_u64() {
                return Ok(Some(seconds));
            }
            match number.as_f64() {
                Some(seconds) if seconds >= 0.0 && seconds.is_finite() => Ok(Some(seconds as u64)),
                _ => Err(invalid(format!("{number} is not a non-negative number of seconds"))),
            }
        }
        Some(other) => Err(invalid(format!(
            "expected an ISO-8601 duration or a number of seconds, got {}",
            value_kind(other)
        ))),
    }
}

fn parse_start_at(value: Option<&Value>) -> QueueResult<Option<DateTime<Utc>>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => DateTime::parse_from_rfc3339(text)
            .map(|parsed| Some(parsed.with_timezone(&Utc)))
            .map_err(|error| {
                ProcessQueueError::InvalidArgument(format!(
                    "invalid '{START_AT}' value '{text}': {error}"
                ))
            }),
        Some(other) => Err(ProcessQueueError::InvalidArgument(format!(
            "invalid '{START_AT}' value: expected an RFC 3339 timestamp, got {}",
            value_kind(other)
        ))),
    }
}

fn parse_requirements(value: Option<&Value>) -> QueueResult<Option<ValueMap>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(
            map.iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        )),
        Some(other) => Err(ProcessQueueError::InvalidArgument(format!(
            "invalid '{REQUIREMENTS}' value: expected an object, got {}",
            value_kind(other)
        ))),
    }
}

fn parse_exclusive(value: Option<&Value>) -> QueueResult<Option<ExclusiveGroup>> {
    let Some(value) = value.filter(|value| !value.is_null()) else {
        return Ok(None);
    };
    let exclusive: ExclusiveGroup = serde_json::from_value(value.clone()).map_err(|error| {
        ProcessQueueError::InvalidArgument(format!("invalid '{EXCLUSIVE}' value: {error}"))
    })?;
    if exclusive.group.trim().is_empty() {
        return Err(ProcessQueueError::InvalidArgument(format!(
            "invalid '{EXCLUSIVE}' value: group must not be empty"
        )));
    }
    Ok(Some(exclusive))
}

/// The engine-owned meta group: `{"_system": {"requestId": ...}}`. The id
/// comes from the request when present, otherwise a fresh one is minted.
pub fn system_meta(payload: &Payload) -> ValueMap {
    let request_id = payload
        .request_id()
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut system = serde_json::Map::new();
    system.insert(REQUEST_ID_META_KEY.to_string(), Value::String(request_id));
    ValueMap::from([(SYSTEM_META_GROUP.to_string(), Value::Object(system))])
}

/// Caller meta with the system group written over any caller-provided one.
pub(crate) fn build_meta(payload: &Payload, cfg: &ValueMap) -> QueueResult<ValueMap> {
    let mut meta = match cfg.get(META) {
        None | Some(Value::Null) => ValueMap::new(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        Some(other) => {
            return Err(ProcessQueueError::InvalidArgument(format!(
                "invalid '{META}' value: expected an object, got {}",
                value_kind(other)
            )))
        }
    };
    meta.extend(system_meta(payload));
    Ok(meta)
}

/// Carries the correlation id recorded at insert over to a schedule built
/// from a payload that has none of its own.
pub(crate) fn keep_request_id(schedule: &mut ProcessSchedule, record: &ProcessRecord) {
    if record.request_id().is_none() {
        return;
    }
    if let Some(system) = record.meta.get(SYSTEM_META_GROUP) {
        schedule
            .meta
            .insert(SYSTEM_META_GROUP.to_string(), system.clone());
    }
}

fn value_kind(value: &Value) -> &'static str {
    request_keys::ValueKind::of(value).map_or("null", request_keys::ValueKind::label)
}

#[cfg(test)]
mod tests {
    use super::{build_schedule, parse_process_timeout, system_meta};
    use crate::ProcessQueueError;
    use serde_json::json;
    use tau_process_types::{ExclusiveMode, Payload, ProcessKey, ValueMap};

    fn map(value: serde_json::Value) -> ValueMap {
        serde_json::from_value(value).expect("object literal")
    }

    #[test]
    fn process_timeout_accepts_durations_and_numbers() {
        assert_eq!(parse_process_timeout(Some(&json!("PT30S"))).expect("duration"), Some(30));
        assert_eq!(parse_process_timeout(Some(&json!(45))).expect("number"), Some(45));
        assert_eq!(parse_process_timeout(Some(&json!(12.9))).expect("float"), Some(12));
        assert_eq!(parse_process_timeout(None).expect("absent"), None);
    }

    #[test]
    fn process_timeout_rejects_other_types() {
        for value in [
            json!({}),
            json!([1]),
            json!(true),
            json!("thirty"),
            json!(-5),
            json!("-PT5S"),
        ] {
            assert!(
                matches!(
                    parse_process_timeout(Some(&value)),
                    Err(ProcessQueueError::InvalidArgument(_))
                ),
                "{value} must be rejected"
            );
        }
    }

    #[test]
    fn builds_schedule_from_configuration_and_request() {
        let payload = Payload::new(ProcessKey::generate())
            .with_tags(["nightly"])
            .with_configuration(map(json!({
                "processTimeout": "PT1H",
                "startAt": "2030-01-01T00:00:00Z",
                "requirements": { "agent": { "flavor": "gpu" } },
                "exclusive": { "group": "deploy", "mode": "wait" },
                "meta": { "owner": "ops", "_system": { "forged": true } },
            })))
            .with_request_data(map(json!({ "requestId": "req-7", "processTimeout": 90 })));

        let schedule = build_schedule(&payload).expect("schedule");
        assert_eq!(schedule.process_timeout, Some(90));
        assert_eq!(
            schedule.start_at.map(|at| at.to_rfc3339()),
            Some("2030-01-01T00:00:00+00:00".to_string())
        );
        assert_eq!(
            schedule.requirements.expect("requirements")["agent"],
            json!({ "flavor": "gpu" })
        );
        let exclusive = schedule.exclusive.expect("exclusive");
        assert_eq!(exclusive.group, "deploy");
        assert_eq!(exclusive.mode, ExclusiveMode::Wait);
        assert!(schedule.tags.contains("nightly"));
        assert_eq!(schedule.meta["owner"], json!("ops"));
        assert_eq!(schedule.meta["_system"], json!({ "requestId": "req-7" }));
    }

    #[test]
    fn malformed_reserved_values_are_invalid_arguments() {
        let cases = [
            json!({ "startAt": "tomorrow" }),
            json!({ "startAt": 5 }),
            json!({ "requirements": "gpu" }),
            json!({ "exclusive": { "mode": "wait" } }),
            json!({ "exclusive": { "group": " " } }),
            json!({ "exclusive": { "group": "g", "mode": "later" } }),
            json!({ "meta": [] }),
        ];
        for cfg in cases {
            let payload = Payload::new(ProcessKey::generate()).with_configuration(map(cfg.clone()));
            assert!(
                matches!(
                    build_schedule(&payload),
                    Err(ProcessQueueError::InvalidArgument(_))
                ),
                "{cfg} must be rejected"
            );
        }
    }

    #[test]
    fn system_meta_mints_request_id_when_absent() {
        let payload = Payload::new(ProcessKey::generate());
        let meta = system_meta(&payload);
        let request_id = meta["_system"]["requestId"].as_str().expect("request id");
        assert!(uuid::Uuid::parse_str(request_id).is_ok());
    }
}
