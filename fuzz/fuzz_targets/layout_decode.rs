//! A persisted layout is read from disk at boot: any bytes must either
//! parse or fall back to defaults, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mmos_core::PersistedLayout;

fuzz_target!(|data: &[u8]| {
    let layout = PersistedLayout::decode(Some(data));
    assert!(!layout.needs_migration());

    if let Ok(strict) = PersistedLayout::try_decode(data) {
        assert_eq!(strict, layout);
        strict.encode().expect("decoded layout re-encodes");
    }
});
