#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use tau_process_queue::parse_process_timeout;
use tau_process_types::parse_iso8601_duration;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);

    if let Ok(duration) = parse_iso8601_duration(&raw) {
        let value = Value::String(raw.to_string());
        match parse_process_timeout(Some(&value)) {
            Ok(Some(seconds)) => {
                assert!(duration.num_seconds() >= 0);
                assert_eq!(i64::try_from(seconds).ok(), Some(duration.num_seconds()));
            }
            Ok(None) => panic!("a parsed duration must yield a timeout"),
            Err(error) => {
                assert!(duration.num_seconds() < 0, "unexpected rejection: {error}");
            }
        }
    }

    if let Ok(value) = serde_json::from_str::<Value>(&raw) {
        let _ = parse_process_timeout(Some(&value));
    }
});
