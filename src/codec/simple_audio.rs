// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed-size audio sample codecs as defined in
//! [RFC 3551 section 4.5](https://datatracker.ietf.org/doc/html/rfc3551#section-4.5).

use std::collections::VecDeque;
use std::num::NonZeroU16;

use bytes::Bytes;

use super::{AccessUnit, Framing, Parameters};
use crate::rtp::ReceivedPacket;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) struct Kind {
    encoding_name: &'static str,
    bits_per_sample: u32,
    extension: &'static str,
}

const KINDS: [Kind; 10] = [
    Kind::new("pcmu", 8, "ulaw"),
    Kind::new("pcma", 8, "alaw"),
    Kind::new("u8", 8, "u8"),
    Kind::new("g722", 8, "g722"),
    Kind::new("l16", 16, "pcm"),
    Kind::new("g726-16", 2, "g726"),
    Kind::new("g726-24", 3, "g726"),
    Kind::new("g726-32", 4, "g726"),
    Kind::new("g726-40", 5, "g726"),
    Kind::new("dvi4", 4, "dvi4"),
];

impl Kind {
    const fn new(encoding_name: &'static str, bits_per_sample: u32, extension: &'static str) -> Self {
        Kind {
            encoding_name,
            bits_per_sample,
            extension,
        }
    }

    /// Looks up a lower-cased encoding name.
    pub(super) fn from_encoding_name(encoding_name: &str) -> Option<Self> {
        KINDS.iter().find(|k| k.encoding_name == encoding_name).copied()
    }
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    parameters: Parameters,

    /// Bits per sample, times channels.
    bits_per_frame: u32,
}

impl Depacketizer {
    pub(super) fn new(kind: Kind, clock_rate: u32, channels: Option<NonZeroU16>) -> Result<Self, String> {
        if clock_rate == 0 {
            return Err("zero clock rate".into());
        }
        let channels = channels.map(NonZeroU16::get).unwrap_or(1);
        Ok(Self {
            parameters: Parameters {
                encoding_name: kind.encoding_name,
                clock_rate,
                extension: kind.extension,
                extra_data: Bytes::new(),
                framing: Framing::UnitsOnly,
                pixel_dimensions: None,
            },
            bits_per_frame: kind.bits_per_sample * u32::from(channels),
        })
    }

    pub(super) fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub(super) fn push(
        &mut self,
        pkt: ReceivedPacket,
        out: &mut VecDeque<AccessUnit>,
    ) -> Result<(), String> {
        let len = pkt.payload().len();
        let bits = len as u64 * 8;
        if len == 0 || bits % u64::from(self.bits_per_frame) != 0 {
            return Err(format!(
                "invalid length {len} for payload of {}-bit audio samples",
                self.bits_per_frame
            ));
        }
        out.push_back(AccessUnit {
            stream_id: pkt.stream_id(),
            timestamp: pkt.timestamp(),
            start_ctx: *pkt.ctx(),
            end_ctx: *pkt.ctx(),
            loss: pkt.loss(),
            complete: true,
            is_random_access_point: true,
            data: pkt.into_payload_bytes(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::rtp::ReceivedPacketBuilder;
    use crate::testutil::timestamp;
    use crate::PacketContext;

    use super::*;

    fn pkt(payload: &[u8]) -> ReceivedPacket {
        ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            stream_id: 0,
            timestamp: timestamp(160, 8_000),
            ssrc: 0,
            sequence_number: 0,
            loss: 3,
            mark: false,
            payload_type: 0,
        }
        .build(payload.iter().copied())
        .unwrap()
    }

    #[test]
    fn sample_sizes() {
        let mut out = VecDeque::new();
        let mut l16 = Depacketizer::new(
            Kind::from_encoding_name("l16").unwrap(),
            8_000,
            NonZeroU16::new(2),
        )
        .unwrap();
        assert_eq!(l16.parameters().extension, "pcm");
        l16.push(pkt(&[0; 8]), &mut out).unwrap();
        l16.push(pkt(&[0; 6]), &mut out).unwrap_err(); // 1.5 stereo samples

        let mut g726 =
            Depacketizer::new(Kind::from_encoding_name("g726-24").unwrap(), 8_000, None).unwrap();
        g726.push(pkt(&[0; 3]), &mut out).unwrap();
        g726.push(pkt(&[0; 4]), &mut out).unwrap_err();

        let mut pcmu =
            Depacketizer::new(Kind::from_encoding_name("pcmu").unwrap(), 8_000, None).unwrap();
        pcmu.push(pkt(b"\xff\x7f"), &mut out).unwrap();
        pcmu.push(pkt(b""), &mut out).unwrap_err();

        assert_eq!(out.len(), 3);
        let au = out.pop_back().unwrap();
        assert_eq!(&au.data()[..], b"\xff\x7f");
        assert_eq!(au.loss(), 3);
        assert_eq!(au.timestamp().elapsed(), 160);
        assert!(au.is_complete());

        assert!(Kind::from_encoding_name("opus").is_none());
    }
}
