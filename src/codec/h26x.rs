// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common logic between H.264 and H.265: access unit assembly from NAL
//! units and fragments, and parameter set decoding.

use std::collections::VecDeque;

use base64::Engine as _;
use bytes::{BufMut, BytesMut};
use log::{debug, trace};

use super::AccessUnit;
use crate::rtp::ReceivedPacket;
use crate::{PacketContext, Timestamp};

pub(super) const START_CODE: &[u8] = b"\x00\x00\x00\x01";

/// Standard alphabet, tolerant of missing padding, which some cameras omit
/// from `sprop-*` parameters.
const SPROP_BASE64: base64::engine::GeneralPurpose = base64::engine::GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    base64::engine::GeneralPurposeConfig::new()
        .with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent),
);

/// Decodes a base64 parameter set NAL from a `sprop-*` parameter.
///
/// Some cameras (GW Security GW4089IP) leave an Annex B start code at the end;
/// it's stripped.
pub(super) fn decode_sprop_nal(key: &str, value: &str) -> Result<Vec<u8>, String> {
    let mut nal = SPROP_BASE64
        .decode(value.trim())
        .map_err(|e| format!("bad parameter {key}: NAL has invalid base64 encoding: {e}"))?;
    if nal.ends_with(START_CODE) {
        nal.truncate(nal.len() - START_CODE.len());
    }
    if nal.is_empty() {
        return Err(format!("bad parameter {key}: empty NAL"));
    }
    Ok(nal)
}

/// An access unit in progress.
#[derive(Debug)]
struct Unit {
    stream_id: usize,
    timestamp: Timestamp,
    start_ctx: PacketContext,
    end_ctx: PacketContext,
    loss: u16,
    complete: bool,
    is_random_access_point: bool,

    /// Annex B NAL units received so far.
    data: BytesMut,

    /// True while a fragmented NAL is partially received.
    in_fu: bool,
}

/// Builds Annex B access units from single NAL units and fragments.
///
/// A unit ends on a marked packet or a timestamp change. Packet loss within
/// a unit marks it incomplete but keeps what was received; a fragment whose
/// start was lost is discarded.
#[derive(Debug, Default)]
pub(super) struct Assembler {
    current: Option<Unit>,
}

impl Assembler {
    /// Prepares to receive the contents of `pkt`, closing the unit in
    /// progress if the timestamp changed.
    ///
    /// Loss reported on the first packet of a unit is charged to the previous
    /// unit's suffix if that unit was still open, and otherwise to the new
    /// unit's prefix.
    pub(super) fn begin(&mut self, pkt: &ReceivedPacket, out: &mut VecDeque<AccessUnit>) {
        let mut prefix_lost = pkt.loss() > 0;
        if let Some(u) = self.current.as_mut() {
            if u.timestamp.timestamp() != pkt.timestamp().timestamp() {
                if u.in_fu || pkt.loss() > 0 {
                    // The unit's suffix is missing.
                    u.complete = false;
                    u.loss = u.loss.saturating_add(pkt.loss());
                }
                prefix_lost = false;
                self.close("timestamp change", out);
            } else if pkt.loss() > 0 {
                debug!(
                    "loss of {} packets within access unit at {}",
                    pkt.loss(),
                    u.timestamp
                );
                u.loss = u.loss.saturating_add(pkt.loss());
                u.complete = false;
                u.in_fu = false;
            }
        }
        let u = self.current.get_or_insert_with(|| Unit {
            stream_id: pkt.stream_id(),
            timestamp: pkt.timestamp(),
            start_ctx: *pkt.ctx(),
            end_ctx: *pkt.ctx(),
            loss: if prefix_lost { pkt.loss() } else { 0 },
            complete: !prefix_lost,
            is_random_access_point: false,
            data: BytesMut::new(),
            in_fu: false,
        });
        u.end_ctx = *pkt.ctx();
    }

    fn unit(&mut self) -> Result<&mut Unit, String> {
        self.current
            .as_mut()
            .ok_or_else(|| "NAL received outside an access unit".to_owned())
    }

    /// Adds a complete NAL unit, made of its header and body.
    pub(super) fn nal(&mut self, hdr: &[u8], body: &[u8], is_rap: bool) -> Result<(), String> {
        let u = self.unit()?;
        if u.in_fu {
            u.in_fu = false;
            u.complete = false;
            return Err("non-fragmented NAL while fragment in progress".into());
        }
        u.data.reserve(START_CODE.len() + hdr.len() + body.len());
        u.data.put_slice(START_CODE);
        u.data.put_slice(hdr);
        u.data.put_slice(body);
        u.is_random_access_point |= is_rap;
        Ok(())
    }

    /// Adds a fragment of a NAL unit. `hdr` is the reconstructed NAL header;
    /// it's written only for the start fragment.
    pub(super) fn fragment(
        &mut self,
        start: bool,
        end: bool,
        hdr: &[u8],
        body: &[u8],
        is_rap: bool,
    ) -> Result<(), String> {
        let u = self.unit()?;
        if start && end {
            return Err("fragment has both start and end bits set".into());
        }
        match (start, u.in_fu) {
            (true, true) => {
                u.in_fu = false;
                u.complete = false;
                return Err("fragment start while fragment in progress".into());
            }
            (true, false) => {
                u.data.put_slice(START_CODE);
                u.data.put_slice(hdr);
                u.data.put_slice(body);
                u.is_random_access_point |= is_rap;
                u.in_fu = true;
            }
            (false, true) => {
                u.data.put_slice(body);
                if end {
                    u.in_fu = false;
                }
            }
            (false, false) => {
                trace!("discarding fragment whose start is missing");
                u.complete = false;
            }
        }
        Ok(())
    }

    /// Finishes a packet's contents; a marked packet ends the unit.
    pub(super) fn end(&mut self, mark: bool, out: &mut VecDeque<AccessUnit>) {
        if !mark {
            return;
        }
        if let Some(u) = self.current.as_mut() {
            if u.in_fu {
                u.complete = false;
            }
        }
        self.close("mark", out);
    }

    /// Marks the unit in progress incomplete after a malformed packet.
    pub(super) fn abandon(&mut self) {
        if let Some(u) = self.current.as_mut() {
            u.complete = false;
            u.in_fu = false;
        }
    }

    /// Emits the unit in progress, if any, as incomplete.
    pub(super) fn flush(&mut self, out: &mut VecDeque<AccessUnit>) {
        if let Some(u) = self.current.as_mut() {
            u.complete = false;
        }
        self.close("flush", out);
    }

    fn close(&mut self, reason: &str, out: &mut VecDeque<AccessUnit>) {
        let Some(u) = self.current.take() else {
            return;
        };
        if u.data.is_empty() {
            debug!("dropping empty access unit at {} on {reason}", u.timestamp);
            return;
        }
        trace!(
            "access unit at {} ({} bytes, complete={}) ends on {reason}",
            u.timestamp,
            u.data.len(),
            u.complete
        );
        out.push_back(AccessUnit {
            stream_id: u.stream_id,
            timestamp: u.timestamp,
            start_ctx: u.start_ctx,
            end_ctx: u.end_ctx,
            loss: u.loss,
            complete: u.complete,
            is_random_access_point: u.is_random_access_point,
            data: u.data.freeze(),
        });
    }
}
