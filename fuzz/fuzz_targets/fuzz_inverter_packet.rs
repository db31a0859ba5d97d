#![no_main]
use libfuzzer_sys::fuzz_target;
use zerogrid::inverter::{build_packet, decode_packet};

fuzz_target!(|data: &[u8]| {
    if let Ok(watts) = decode_packet(data) {
        // Anything that decodes must re-encode to the same bytes
        assert_eq!(&build_packet(i64::from(watts), u16::MAX)[..], data);
    }
});
