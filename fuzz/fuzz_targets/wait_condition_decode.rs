#![no_main]

use libfuzzer_sys::fuzz_target;
use tau_process_types::WaitCondition;

fuzz_target!(|data: &[u8]| {
    let Ok(condition) = serde_json::from_slice::<WaitCondition>(data) else {
        return;
    };
    assert!(!condition.kind().is_empty());
    let encoded = serde_json::to_string(&condition).expect("wait condition encodes");
    let decoded: WaitCondition = serde_json::from_str(&encoded).expect("encoded condition decodes");
    assert_eq!(decoded, condition);
});
