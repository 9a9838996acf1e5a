// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MPEG-4 Visual elementary streams, as in
//! [RFC 6416 section 5](https://datatracker.ietf.org/doc/html/rfc6416#section-5).

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use log::{debug, warn};

use super::{AccessUnit, Framing, Parameters};
use crate::rtp::ReceivedPacket;
use crate::{PacketContext, Timestamp};

const VOP_START_CODE: &[u8] = b"\x00\x00\x01\xb6";

/// Returns true if `data` contains an intra-coded VOP.
fn has_i_vop(data: &[u8]) -> bool {
    data.windows(5)
        .find(|w| &w[..4] == VOP_START_CODE)
        .map(|w| (w[4] >> 6) == 0)
        .unwrap_or(false)
}

#[derive(Debug)]
struct Unit {
    stream_id: usize,
    timestamp: Timestamp,
    start_ctx: PacketContext,
    end_ctx: PacketContext,
    loss: u16,
    complete: bool,
    data: BytesMut,
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    parameters: Parameters,
    current: Option<Unit>,
}

impl Depacketizer {
    pub(super) fn new(clock_rate: u32, format_specific_params: Option<&str>) -> Result<Self, String> {
        let mut config = Bytes::new();
        for p in format_specific_params.unwrap_or("").split(';') {
            if let Some((key, value)) = p.trim().split_once('=') {
                if key.trim().eq_ignore_ascii_case("config") {
                    config = hex::decode(value.trim())
                        .map_err(|_| "config has invalid hex encoding".to_owned())?
                        .into();
                }
            }
        }
        if config.is_empty() {
            warn!("MPEG-4 Visual stream has no config; decoders need in-band headers");
        }
        Ok(Depacketizer {
            parameters: Parameters {
                encoding_name: "mp4v-es",
                clock_rate,
                extension: "m4v",
                extra_data: config,
                framing: Framing::ConfigThenUnits,
                pixel_dimensions: None,
            },
            current: None,
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
        if let Some(u) = self.current.as_mut() {
            if u.timestamp.timestamp() != pkt.timestamp().timestamp() {
                if pkt.loss() > 0 {
                    u.complete = false;
                }
                self.close(out);
            } else if pkt.loss() > 0 {
                u.complete = false;
                u.loss = u.loss.saturating_add(pkt.loss());
            }
        }
        let payload = pkt.payload();
        if payload.is_empty() {
            return Err("empty payload".into());
        }
        let u = self.current.get_or_insert_with(|| Unit {
            stream_id: pkt.stream_id(),
            timestamp: pkt.timestamp(),
            start_ctx: *pkt.ctx(),
            end_ctx: *pkt.ctx(),
            loss: pkt.loss(),

            // Every unit starts with a start code; without one, the beginning was lost.
            complete: pkt.loss() == 0 || payload.starts_with(b"\x00\x00\x01"),
            data: BytesMut::new(),
        });
        u.data.extend_from_slice(payload);
        u.end_ctx = *pkt.ctx();
        if pkt.mark() {
            self.close(out);
        }
        Ok(())
    }

    fn close(&mut self, out: &mut VecDeque<AccessUnit>) {
        let Some(u) = self.current.take() else {
            return;
        };
        let is_random_access_point = has_i_vop(&u.data);
        if !u.complete {
            debug!("incomplete MPEG-4 Visual unit at {}", u.timestamp);
        }
        out.push_back(AccessUnit {
            stream_id: u.stream_id,
            timestamp: u.timestamp,
            start_ctx: u.start_ctx,
            end_ctx: u.end_ctx,
            loss: u.loss,
            complete: u.complete,
            is_random_access_point,
            data: u.data.freeze(),
        });
    }

    pub(super) fn flush(&mut self, out: &mut VecDeque<AccessUnit>) {
        if let Some(u) = self.current.as_mut() {
            u.complete = false;
        }
        self.close(out);
    }
}

#[cfg(test)]
mod tests {
    use crate::rtp::ReceivedPacketBuilder;
    use crate::testutil::{init_logging, timestamp};

    use super::*;

    fn pkt(seq: u16, ts: i64, loss: u16, mark: bool, payload: &[u8]) -> ReceivedPacket {
        ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            stream_id: 0,
            timestamp: timestamp(ts, 90_000),
            ssrc: 0,
            sequence_number: seq,
            loss,
            mark,
            payload_type: 96,
        }
        .build(payload.iter().copied())
        .unwrap()
    }

    #[test]
    fn depacketize() {
        init_logging();
        let mut d = Depacketizer::new(
            90_000,
            Some("profile-level-id=1;config=000001B001000001B58913000001000000012000C48D88"),
        )
        .unwrap();
        assert!(d.parameters().extra_data().starts_with(b"\x00\x00\x01\xb0\x01"));
        let mut out = VecDeque::new();
        d.push(pkt(0, 0, 0, false, b"\x00\x00\x01\xb6\x10i-vop "), &mut out)
            .unwrap();
        d.push(pkt(1, 0, 0, true, b"continued"), &mut out).unwrap();
        let au = out.pop_front().unwrap();
        assert_eq!(&au.data()[..], b"\x00\x00\x01\xb6\x10i-vop continued");
        assert!(au.is_complete());
        assert!(au.is_random_access_point());

        // P-VOP ended by a timestamp change rather than a mark.
        d.push(pkt(2, 3_000, 0, false, b"\x00\x00\x01\xb6\x50p"), &mut out)
            .unwrap();
        d.push(pkt(3, 6_000, 0, true, b"\x00\x00\x01\xb6\x50p"), &mut out)
            .unwrap();
        let au = out.pop_front().unwrap();
        assert!(au.is_complete());
        assert!(!au.is_random_access_point());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn loss() {
        init_logging();
        let mut d = Depacketizer::new(90_000, None).unwrap();
        let mut out = VecDeque::new();
        d.push(pkt(0, 0, 0, false, b"\x00\x00\x01\xb6\x10a"), &mut out)
            .unwrap();
        d.push(pkt(2, 0, 1, true, b"c"), &mut out).unwrap();
        assert!(!out.pop_front().unwrap().is_complete());

        // The start of the next unit was lost.
        d.push(pkt(5, 3_000, 2, true, b"tail"), &mut out).unwrap();
        assert!(!out.pop_front().unwrap().is_complete());

        d.push(pkt(6, 6_000, 0, false, b"\x00\x00\x01\xb6\x50p"), &mut out)
            .unwrap();
        d.flush(&mut out);
        assert!(!out.pop_front().unwrap().is_complete());
        d.push(pkt(7, 9_000, 0, false, b""), &mut out).unwrap_err();
    }
}
