//! Arbitrary bytes behind a valid header for every opcode: the payload
//! decoder must reject garbage without panicking, and whatever it accepts
//! must encode back to a frame that decodes to the same payload.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mmos_proto::{Frame, FrameHeader, Opcode, Payload};

const OPCODES: [Opcode; 7] = [
    Opcode::Hello,
    Opcode::HelloReply,
    Opcode::Goodbye,
    Opcode::Ping,
    Opcode::Pong,
    Opcode::Packet,
    Opcode::Error,
];

fuzz_target!(|data: &[u8]| {
    let Some((&selector, body)) = data.split_first() else {
        return;
    };
    let opcode = OPCODES[usize::from(selector) % OPCODES.len()];
    let frame = Frame::new(FrameHeader::new(opcode), body.to_vec());

    let Ok(payload) = Payload::from_frame(&frame) else {
        return;
    };
    assert_eq!(payload.opcode(), opcode);

    let Ok(again) = payload.clone().into_frame() else {
        // Oversized packet bodies are refused on the way out.
        return;
    };
    assert_eq!(Payload::from_frame(&again).expect("encoded payload decodes"), payload);
});
