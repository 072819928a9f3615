#![no_main]

use libfuzzer_sys::fuzz_target;
use machonet::utils::compression::{compress, decompress, maybe_decompress};

fuzz_target!(|data: &[u8]| {
    // Round-trip through zlib at the default level
    if let Ok(compressed) = compress(data, 6) {
        let out = decompress(&compressed, data.len()).expect("own output inflates");
        assert_eq!(out, data);
    }

    // Raw input must never inflate past the cap
    if let Ok(out) = maybe_decompress(data, 64 * 1024) {
        assert!(out.len() <= 64 * 1024);
    }
});
