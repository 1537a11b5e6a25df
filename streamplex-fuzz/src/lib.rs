//! Fuzzing entry points for streamplex-core decoders
//!
//! To use with cargo-fuzz:
//! 1. Install cargo-fuzz: cargo install cargo-fuzz
//! 2. Run fuzzer: cargo fuzz run fuzz_receive

use bytes::BytesMut;
use std::sync::Arc;
use streamplex_core::framelog::decode_record;
use streamplex_core::segment::decode_segment;
use streamplex_core::{Core, Frame, FrameSink, IntegrityCheck, PacketizerConfig};

pub fn fuzz_segment_decode(data: &[u8]) {
    // Try both integrity modes - should never panic
    let _ = decode_segment(data, IntegrityCheck::None);
    let _ = decode_segment(data, IntegrityCheck::Crc32c);
}

/// Feed length-prefixed chunks of `data` to a receiver as segments
///
/// No integrity check, so most headers reach the reassembly state machine.
pub fn fuzz_receive(data: &[u8]) {
    let config = PacketizerConfig::default()
        .with_mtu(64)
        .with_integrity(IntegrityCheck::None)
        .with_channels(4)
        .with_max_frame_size(1024);
    let core = match Core::new(config) {
        Ok(core) => core,
        Err(_) => return,
    };
    let transport = core.transport();

    let mut rest = data;
    while let Some((&len, tail)) = rest.split_first() {
        let len = (len as usize).min(tail.len());
        let (segment, next) = tail.split_at(len);
        let _ = transport.accept_frame(Arc::new(Frame::from_slice(segment)), None);
        rest = next;
    }
    let _ = core.controller().expire_stale();
}

pub fn fuzz_log_decode(data: &[u8]) {
    let mut buf = BytesMut::from(data);
    // Should never panic, and must stop once no full record is left
    while let Ok(Some(_)) = decode_record(&mut buf, data.len()) {}
}
