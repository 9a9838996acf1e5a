// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.265](https://www.itu.int/rec/T-REC-H.265)-encoded video, depacketized
//! as in [RFC 7798](https://datatracker.ietf.org/doc/html/rfc7798).

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use log::warn;

use super::h26x::{self, Assembler, START_CODE};
use super::{AccessUnit, Framing, Parameters};
use crate::rtp::ReceivedPacket;

/// Aggregation packet.
const AP: u8 = 48;

/// Fragmentation unit.
const FU: u8 = 49;

/// Payload content information.
const PACI: u8 = 50;

#[inline]
fn unit_type(hdr: [u8; 2]) -> u8 {
    (hdr[0] >> 1) & 0b11_1111
}

/// Intra random access point pictures: BLA, IDR, CRA and reserved IRAP types.
#[inline]
fn is_random_access_point(unit_type: u8) -> bool {
    (16..=23).contains(&unit_type)
}

/// Checks the forbidden zero bit and `nuh_temporal_id_plus1`.
fn check_hdr(hdr: [u8; 2]) -> Result<(), String> {
    if (hdr[0] & 0x80) != 0 {
        return Err(format!(
            "NAL header {:02x}{:02x} has forbidden bit set",
            hdr[0], hdr[1]
        ));
    }
    if (hdr[1] & 0b111) == 0 {
        return Err(format!(
            "NAL header {:02x}{:02x} has zero temporal id",
            hdr[0], hdr[1]
        ));
    }
    Ok(())
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    assembler: Assembler,
    parameters: Parameters,

    /// True if the stream carries decoding order numbers (DONL/DOND fields).
    has_donl: bool,
}

impl Depacketizer {
    pub(super) fn new(clock_rate: u32, format_specific_params: Option<&str>) -> Result<Self, String> {
        if clock_rate != 90_000 {
            return Err(format!(
                "invalid H.265 clock rate {clock_rate}; must always be 90000"
            ));
        }
        let mut has_donl = false;
        let mut extra_data = Bytes::new();
        if let Some(p) = format_specific_params {
            match parse_format_specific_params(p) {
                Ok(p) => {
                    has_donl = p.has_donl;
                    extra_data = p.extra_data;
                }
                Err(e) => warn!("ignoring H.265 out-of-band parameters {p:?}: {e}"),
            }
        }
        Ok(Depacketizer {
            assembler: Assembler::default(),
            parameters: Parameters {
                encoding_name: "h265",
                clock_rate,
                extension: "h265",
                extra_data,
                framing: Framing::ConfigThenUnits,
                pixel_dimensions: None,
            },
            has_donl,
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
        self.assembler.begin(&pkt, out);
        let r = self.push_payload(pkt.payload());
        if r.is_err() {
            self.assembler.abandon();
        }
        self.assembler.end(pkt.mark(), out);
        r
    }

    /// Skips a decoding order number field of `len` bytes.
    fn skip_don<'a>(&self, data: &'a [u8], len: usize, what: &str) -> Result<&'a [u8], String> {
        if !self.has_donl {
            return Ok(data);
        }
        data.get(len..)
            .ok_or_else(|| format!("{what} too short for decoding order number"))
    }

    fn push_payload(&mut self, data: &[u8]) -> Result<(), String> {
        // https://datatracker.ietf.org/doc/html/rfc7798#section-1.1.4
        if data.len() < 2 {
            return Err(format!("payload of {} bytes is too short", data.len()));
        }
        let hdr = [data[0], data[1]];
        check_hdr(hdr)?;
        let body = &data[2..];
        match unit_type(hdr) {
            0..=47 => {
                // Single NAL unit. https://datatracker.ietf.org/doc/html/rfc7798#section-4.4.1
                let t = unit_type(hdr);
                let body = self.skip_don(body, 2, "single NAL unit packet")?;
                self.assembler.nal(&hdr, body, is_random_access_point(t))
            }
            AP => {
                // https://datatracker.ietf.org/doc/html/rfc7798#section-4.4.2
                let mut rest = body;
                let mut first = true;
                while !rest.is_empty() {
                    // DONL before the first unit, DOND before the rest.
                    rest = self.skip_don(rest, if first { 2 } else { 1 }, "AP")?;
                    first = false;
                    if rest.len() < 2 {
                        return Err(format!(
                            "AP has {} remaining bytes while expecting 2-byte length",
                            rest.len()
                        ));
                    }
                    let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
                    rest = &rest[2..];
                    if len < 2 {
                        return Err(format!("AP has {len}-byte NAL"));
                    }
                    if rest.len() < len {
                        return Err(format!(
                            "AP too short: {} bytes remaining, expecting {len}-byte NAL",
                            rest.len()
                        ));
                    }
                    let (nal, next) = rest.split_at(len);
                    let nal_hdr = [nal[0], nal[1]];
                    check_hdr(nal_hdr)?;
                    self.assembler.nal(
                        &nal_hdr,
                        &nal[2..],
                        is_random_access_point(unit_type(nal_hdr)),
                    )?;
                    rest = next;
                }
                Ok(())
            }
            FU => {
                // https://datatracker.ietf.org/doc/html/rfc7798#section-4.4.3
                let Some((&fu_header, rest)) = body.split_first() else {
                    return Err("FU is too short".into());
                };
                let start = (fu_header & 0b10000000) != 0;
                let end = (fu_header & 0b01000000) != 0;
                let fu_type = fu_header & 0b00111111;

                // DONL is present only in the first fragment.
                let rest = if start {
                    self.skip_don(rest, 2, "FU")?
                } else {
                    rest
                };
                let reconstructed = [(hdr[0] & 0b1000_0001) | (fu_type << 1), hdr[1]];
                self.assembler.fragment(
                    start,
                    end,
                    &reconstructed,
                    rest,
                    is_random_access_point(fu_type),
                )
            }
            PACI => Err("PACI packets are unsupported".into()),
            t => Err(format!("reserved NAL unit type {t}")),
        }
    }

    pub(super) fn flush(&mut self, out: &mut VecDeque<AccessUnit>) {
        self.assembler.flush(out);
    }
}

#[derive(Debug)]
struct FormatSpecificParams {
    extra_data: Bytes,
    has_donl: bool,
}

/// Parses the `fmtp` parameters of RFC 7798 section 7.1.
fn parse_format_specific_params(format_specific_params: &str) -> Result<FormatSpecificParams, String> {
    let mut nals: [Vec<Vec<u8>>; 4] = Default::default();
    let mut has_donl = false;
    for p in format_specific_params.split(';') {
        let Some((key, value)) = p.trim().split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let i = match key.as_str() {
            "sprop-vps" => 0,
            "sprop-sps" => 1,
            "sprop-pps" => 2,
            "sprop-sei" => 3,
            "sprop-max-don-diff" | "sprop-depack-buf-nalus" => {
                let v = u32::from_str_radix(value.trim(), 10)
                    .map_err(|_| format!("bad {key} {value:?}"))?;
                has_donl |= v > 0;
                continue;
            }
            "tx-mode" if !value.trim().eq_ignore_ascii_case("SRST") => {
                return Err(format!("unsupported tx-mode {value}; expected SRST"));
            }
            _ => continue,
        };
        for nal in value.split(',').filter(|n| !n.trim().is_empty()) {
            let nal = h26x::decode_sprop_nal(&key, nal)?;
            if nal.len() < 2 {
                return Err(format!("bad parameter {key}: truncated NAL header"));
            }
            nals[i].push(nal);
        }
    }
    let mut extra_data = BytesMut::new();
    for nal in nals.iter().flatten() {
        extra_data.put_slice(START_CODE);
        extra_data.put_slice(nal);
    }
    Ok(FormatSpecificParams {
        extra_data: extra_data.freeze(),
        has_donl,
    })
}
