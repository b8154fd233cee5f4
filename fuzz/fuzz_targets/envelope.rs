#![no_main]

use libfuzzer_sys::fuzz_target;
use proctor_core::WorkerMessage;

fuzz_target!(|data: &[u8]| {
    // Convert bytes to UTF-8 string (ignore invalid UTF-8)
    if let Ok(line) = std::str::from_utf8(data) {
        // Anything that decodes must re-encode to a line that decodes to the same message
        if let Ok(message) = WorkerMessage::parse_line(line) {
            let encoded = message.to_line().expect("decoded message must encode");
            let again = WorkerMessage::parse_line(&encoded).expect("encoded message must decode");
            assert_eq!(message, again);
        }
    }
});
