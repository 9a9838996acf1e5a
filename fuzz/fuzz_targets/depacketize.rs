// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use libfuzzer_sys::fuzz_target;
use std::num::{NonZeroU16, NonZeroU32};

/// Codecs to exercise, chosen by the first input byte.
const CODECS: [(&str, &str, u32, Option<&str>); 5] = [
    ("video", "h264", 90_000, Some("packetization-mode=1;profile-level-id=64001E;sprop-parameter-sets=Z2QAHqwsaoLA9puCgIKgAAADACAAAAMD0IAA,aO4xshsA")),
    ("video", "h265", 90_000, Some("sprop-max-don-diff=1")),
    ("audio", "mpeg4-generic", 48_000, Some("streamtype=5;profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config=1188")),
    ("video", "mp4v-es", 90_000, Some("profile-level-id=1;config=000001B001000001B58913000001000000012000C48D88")),
    ("audio", "g726-24", 8_000, None),
];

fuzz_target!(|data: &[u8]| {
    let Some((&which, mut data)) = data.split_first() else {
        return;
    };
    let (media, encoding_name, clock_rate, fmtp) = CODECS[usize::from(which) % CODECS.len()];
    let mut depacketizer = rtspcap::codec::Depacketizer::new(
        media,
        encoding_name,
        clock_rate,
        NonZeroU16::new(1),
        fmtp,
    )
    .unwrap();
    let mut timestamp =
        rtspcap::Timestamp::new(0, NonZeroU32::new(clock_rate).unwrap(), 0).unwrap();
    let mut sequence_number: u16 = 0;
    let pkt_ctx = rtspcap::PacketContext::dummy();
    loop {
        let (hdr, rest) = match data.split_first() {
            Some(r) => r,
            None => break,
        };
        let ts_change = (hdr & 0b001) != 0;
        let mark = (hdr & 0b010) != 0;
        let loss = (hdr & 0b100) != 0;
        let len = usize::from(hdr >> 3);
        if rest.len() < len {
            break;
        }
        let (payload, rest) = rest.split_at(len);
        data = rest;
        if loss {
            sequence_number = sequence_number.wrapping_add(1);
        }
        if ts_change {
            timestamp = timestamp.try_add(1).unwrap();
        }
        let pkt = rtspcap::rtp::ReceivedPacketBuilder {
            ctx: pkt_ctx,
            stream_id: 0,
            timestamp,
            ssrc: 0,
            sequence_number,
            loss: u16::from(loss),
            payload_type: 96,
            mark,
        }
        .build(payload.iter().copied())
        .unwrap();
        sequence_number = sequence_number.wrapping_add(1);

        // Errors are per-packet; the depacketizer must stay usable.
        let _ = depacketizer.push(pkt);
        while let Some(au) = depacketizer.pull() {
            assert!(!au.data().is_empty());
        }
    }
    depacketizer.flush();
    while let Some(au) = depacketizer.pull() {
        assert!(!au.is_complete());
    }
});
