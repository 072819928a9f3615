#![no_main]

use libfuzzer_sys::fuzz_target;
use machonet::core::marshal;

fuzz_target!(|data: &[u8]| {
    // Anything that decodes must re-encode to a stream that decodes to the same value
    if let Ok(value) = marshal::decode(data) {
        let encoded = marshal::encode(&value);
        let again = marshal::decode(&encoded).expect("re-encoded value decodes");
        assert_eq!(format!("{again:?}"), format!("{value:?}"));
    }
});
