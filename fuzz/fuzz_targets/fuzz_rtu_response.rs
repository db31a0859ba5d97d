#![no_main]
use libfuzzer_sys::fuzz_target;
use zerogrid::charger::rtu;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let count = u16::from(data[0] % 32);
    let frame = &data[1..];
    if let Ok(values) = rtu::parse_read_response(1, count, frame) {
        assert_eq!(values.len(), usize::from(count));
    }
    let _ = rtu::parse_write_response(1, 8, 5700, frame);
});
