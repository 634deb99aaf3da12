#![no_main]

use libfuzzer_sys::fuzz_target;
use tau_process_queue::requirements_satisfied;
use tau_process_types::ValueMap;

fuzz_target!(|data: &[u8]| {
    let Ok(requirements) = serde_json::from_slice::<ValueMap>(data) else {
        return;
    };
    assert!(requirements_satisfied(None, &requirements));
    let _ = requirements_satisfied(Some(&requirements), &ValueMap::new());
    if requirements.is_empty() {
        assert!(requirements_satisfied(Some(&requirements), &ValueMap::new()));
    }
});
