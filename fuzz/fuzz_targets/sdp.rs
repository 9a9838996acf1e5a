// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let (sdp, _errors) = rtspcap::sdp::parse("fuzz", data);
    for m in &sdp.medias {
        let _ = rtspcap::codec::Depacketizer::for_media(m);
    }
});
