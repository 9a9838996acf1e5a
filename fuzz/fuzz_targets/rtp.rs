// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let data = bytes::Bytes::copy_from_slice(data);
    if let Ok((raw, payload)) = rtspcap::rtp::RawPacket::new(data.clone()) {
        assert!(payload.start <= payload.end);
        assert!(usize::from(payload.end) <= data.len());
        let _ = (raw.sequence_number(), raw.timestamp(), raw.ssrc(), raw.mark());
    }
});
