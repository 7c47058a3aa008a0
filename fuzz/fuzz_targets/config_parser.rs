#![no_main]
use libfuzzer_sys::fuzz_target;
use looper_core::LooperConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(cfg) = LooperConfig::parse(text) {
            assert!(cfg.max_events > 0);
            assert!(!cfg.name.is_empty());
        }
    }
});
