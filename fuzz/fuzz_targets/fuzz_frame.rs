#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

use cothority::core::FrameCodec;

fuzz_target!(|data: &[u8]| {
    // Fuzz frame decoding - no panics, no unbounded allocation.
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
