//! Arbitrary bytes must never panic the frame decoder, and any frame it
//! accepts must survive re-encoding unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mmos_proto::Frame;

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = Frame::decode(data) else {
        return;
    };

    let mut encoded = Vec::new();
    frame.encode(&mut encoded).expect("decoded frame re-encodes");
    assert_eq!(encoded.len(), frame.encoded_len());
    assert_eq!(Frame::decode(&encoded).expect("re-encoded frame decodes"), frame);
});
