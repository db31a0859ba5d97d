#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let line = String::from_utf8_lossy(data);
    if let Some(reading) = zerogrid::meter::parse_line(&line) {
        // Accepted readings always carry a non-empty code and value
        assert!(!reading.code.is_empty());
        assert!(!reading.value.is_empty());
        let _ = reading.value_f64();
    }
});
