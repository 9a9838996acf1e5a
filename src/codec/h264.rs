// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en)-encoded video,
//! depacketized as in [RFC 6184](https://tools.ietf.org/html/rfc6184).

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use h264_reader::nal::{NalHeader, UnitType};
use log::{debug, warn};

use super::h26x::{self, Assembler, START_CODE};
use super::{AccessUnit, Framing, Parameters};
use crate::rtp::ReceivedPacket;

/// Finds access unit boundaries and produces Annex B access units.
///
/// This doesn't inspect the contents of the NAL units beyond their headers,
/// so it doesn't verify compliance with H.264 section 7.4.1.2.3 "Order of NAL
/// units and coded pictures and association to access units".
#[derive(Debug)]
pub(crate) struct Depacketizer {
    assembler: Assembler,
    parameters: Parameters,
}

impl Depacketizer {
    pub(super) fn new(clock_rate: u32, format_specific_params: Option<&str>) -> Result<Self, String> {
        if clock_rate != 90_000 {
            return Err(format!(
                "invalid H.264 clock rate {clock_rate}; must always be 90000"
            ));
        }

        // Out-of-band parameters are optional; many cameras repeat them in-band.
        let (extra_data, pixel_dimensions) = match format_specific_params {
            None => (Bytes::new(), None),
            Some(p) => match parse_format_specific_params(p) {
                Ok(v) => v,
                Err(e) => {
                    warn!("ignoring H.264 out-of-band parameters {p:?}: {e}");
                    (Bytes::new(), None)
                }
            },
        };
        Ok(Depacketizer {
            assembler: Assembler::default(),
            parameters: Parameters {
                encoding_name: "h264",
                clock_rate,
                extension: "h264",
                extra_data,
                framing: Framing::ConfigThenUnits,
                pixel_dimensions,
            },
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

    fn push_payload(&mut self, data: &[u8]) -> Result<(), String> {
        // https://tools.ietf.org/html/rfc6184#section-5.2
        let Some(&nal_header) = data.first() else {
            return Err("empty payload".into());
        };
        if (nal_header >> 7) != 0 {
            return Err(format!("NAL header {nal_header:02x} has F bit set"));
        }
        match nal_header & 0b11111 {
            1..=23 => self
                .assembler
                .nal(&data[..1], &data[1..], is_random_access_point(nal_header)),
            24 => {
                // STAP-A. https://tools.ietf.org/html/rfc6184#section-5.7.1
                let mut rest = &data[1..];
                while !rest.is_empty() {
                    if rest.len() < 2 {
                        return Err(format!(
                            "STAP-A has {} remaining bytes while expecting 2-byte length",
                            rest.len()
                        ));
                    }
                    let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
                    rest = &rest[2..];
                    if len == 0 {
                        return Err("zero length in STAP-A".into());
                    }
                    if rest.len() < len {
                        return Err(format!(
                            "STAP-A too short: {} bytes remaining, expecting {len}-byte NAL",
                            rest.len()
                        ));
                    }
                    let (nal, next) = rest.split_at(len);
                    if NalHeader::new(nal[0]).is_err() {
                        return Err(format!("bad NAL header {:02x} in STAP-A", nal[0]));
                    }
                    self.assembler
                        .nal(&nal[..1], &nal[1..], is_random_access_point(nal[0]))?;
                    rest = next;
                }
                Ok(())
            }
            25..=27 | 29 => Err(format!(
                "unimplemented NAL (header {nal_header:02x}); only STAP-A and FU-A aggregation are supported"
            )),
            28 => {
                // FU-A. https://tools.ietf.org/html/rfc6184#section-5.8
                if data.len() < 2 {
                    return Err("FU-A is too short".into());
                }
                let fu_header = data[1];
                let start = (fu_header & 0b10000000) != 0;
                let end = (fu_header & 0b01000000) != 0;
                if (fu_header & 0b00100000) != 0 {
                    return Err(format!("FU-A header {fu_header:08b} has reserved bit set"));
                }
                let reconstructed = (nal_header & 0b11100000) | (fu_header & 0b00011111);
                self.assembler.fragment(
                    start,
                    end,
                    &[reconstructed],
                    &data[2..],
                    is_random_access_point(reconstructed),
                )
            }
            _ => Err(format!("bad NAL header {nal_header:02x}")),
        }
    }

    pub(super) fn flush(&mut self, out: &mut VecDeque<AccessUnit>) {
        self.assembler.flush(out);
    }
}

fn is_random_access_point(nal_header: u8) -> bool {
    NalHeader::new(nal_header)
        .map(|h| h.nal_unit_type() == UnitType::SliceLayerWithoutPartitioningIdr)
        .unwrap_or(false)
}

/// Parses the `sprop-parameter-sets` of a SDP `fmtp` attribute into Annex B
/// form, also returning the pixel dimensions from the SPS if it's parseable.
fn parse_format_specific_params(
    format_specific_params: &str,
) -> Result<(Bytes, Option<(u32, u32)>), String> {
    let mut sprop_parameter_sets = None;
    for p in format_specific_params.split(';') {
        if let Some((key, value)) = p.trim().split_once('=') {
            if key.eq_ignore_ascii_case("sprop-parameter-sets") {
                sprop_parameter_sets = Some(value);
            }
        }
    }
    let Some(sprop_parameter_sets) = sprop_parameter_sets else {
        return Ok((Bytes::new(), None));
    };

    let mut extra_data = BytesMut::new();
    let mut pixel_dimensions = None;
    for nal in sprop_parameter_sets.split(',').filter(|n| !n.is_empty()) {
        let nal = h26x::decode_sprop_nal("sprop-parameter-sets", nal)?;
        let header =
            NalHeader::new(nal[0]).map_err(|_| format!("bad NAL header {:02x}", nal[0]))?;
        match header.nal_unit_type() {
            UnitType::SeqParameterSet => {
                if pixel_dimensions.is_none() {
                    pixel_dimensions = sps_pixel_dimensions(&nal);
                }
            }
            UnitType::PicParameterSet => {}
            t => debug!("unexpected {t:?} in sprop-parameter-sets"),
        }
        extra_data.put_slice(START_CODE);
        extra_data.put_slice(&nal);
    }
    Ok((extra_data.freeze(), pixel_dimensions))
}

fn sps_pixel_dimensions(sps_nal: &[u8]) -> Option<(u32, u32)> {
    let rbsp = match h264_reader::rbsp::decode_nal(sps_nal) {
        Ok(r) => r,
        Err(e) => {
            debug!("unable to decode SPS: {e}");
            return None;
        }
    };
    let sps = match h264_reader::nal::sps::SeqParameterSet::from_bits(
        h264_reader::rbsp::BitReader::new(&*rbsp),
    ) {
        Ok(s) => s,
        Err(e) => {
            debug!("unable to parse SPS: {e:?}");
            return None;
        }
    };
    match sps.pixel_dimensions() {
        Ok(d) => {
            debug!(
                "H.264 SPS: profile_idc={} level_idc={} dimensions={}x{}",
                u8::from(sps.profile_idc),
                sps.level_idc,
                d.0,
                d.1
            );
            Some(d)
        }
        Err(e) => {
            debug!("SPS has invalid pixel dimensions: {e:?}");
            None
        }
    }
}
