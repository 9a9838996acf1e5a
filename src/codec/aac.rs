// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! AAC (Advanced Audio Codec) depacketization, as in
//! [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640).
//!
//! Frames may be written to a file with [ADTS](https://wiki.multimedia.cx/index.php/ADTS)
//! headers derived from the stream's `AudioSpecificConfig`.

use std::collections::VecDeque;
use std::num::{NonZeroU16, NonZeroU32};

use bitstream_io::{BigEndian, BitRead, BitReader};
use bytes::{Bytes, BytesMut};
use log::{debug, warn};

use super::{AccessUnit, Framing, Parameters};
use crate::rtp::ReceivedPacket;
use crate::{PacketContext, Timestamp};

/// An AudioSpecificConfig as in ISO/IEC 14496-3 section 1.6.2.1.
///
/// Only the fields needed for framing are kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub audio_object_type: u8,
    pub sampling_frequency_index: u8,
    pub sampling_frequency: u32,
    pub channel_config: u8,
    pub frame_length: NonZeroU16,
}

const SAMPLING_FREQUENCIES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

impl AudioSpecificConfig {
    pub fn parse(raw: &[u8]) -> Result<Self, String> {
        let mut r = BitReader::endian(raw, BigEndian);
        let audio_object_type = match r
            .read::<u8>(5)
            .map_err(|e| format!("unable to read audio_object_type: {e}"))?
        {
            31 => {
                32 + r
                    .read::<u8>(6)
                    .map_err(|e| format!("unable to read audio_object_type ext: {e}"))?
            }
            o => o,
        };

        // ISO/IEC 14496-3 section 1.6.3.3.
        let sampling_frequency_index = r
            .read::<u8>(4)
            .map_err(|e| format!("unable to read sampling_frequency_index: {e}"))?;
        let sampling_frequency = match sampling_frequency_index {
            i @ 0x0..=0xc => SAMPLING_FREQUENCIES[usize::from(i)],
            v @ 0xd | v @ 0xe => {
                return Err(format!("reserved sampling_frequency_index value 0x{v:x}"))
            }
            _ => r
                .read::<u32>(24)
                .map_err(|e| format!("unable to read sampling_frequency ext: {e}"))?,
        };
        let channel_config = r
            .read::<u8>(4)
            .map_err(|e| format!("unable to read channelConfiguration: {e}"))?;
        if audio_object_type == 5 || audio_object_type == 29 {
            // extensionSamplingFrequencyIndex + extensionSamplingFrequency.
            if r.read::<u8>(4)
                .map_err(|e| format!("unable to read extensionSamplingFrequencyIndex: {e}"))?
                == 0xf
            {
                r.skip(24)
                    .map_err(|e| format!("unable to read extensionSamplingFrequency: {e}"))?;
            }
            // audioObjectType (a different one) + extensionChannelConfiguration.
            if r.read::<u8>(5)
                .map_err(|e| format!("unable to read second audioObjectType: {e}"))?
                == 22
            {
                r.skip(4)
                    .map_err(|e| format!("unable to read extensionChannelConfiguration: {e}"))?;
            }
        }

        // The types which use GASpecificConfig, ISO/IEC 14496-3 section 4.4.1.
        let frame_length_flag = match audio_object_type {
            1 | 2 | 3 | 4 | 6 | 7 | 17 | 19 | 20 | 21 | 22 | 23 => r
                .read_bit()
                .map_err(|e| format!("unable to read frame_length_flag: {e}"))?,
            o => return Err(format!("unsupported audio_object_type {o}")),
        };
        let frame_length = match (audio_object_type, frame_length_flag) {
            (3 /* AAC SSR */, false) => 256,
            (3 /* AAC SSR */, true) => {
                return Err("frame_length_flag must be false for AAC SSR".into())
            }
            (23 /* ER AAC LD */, false) => 512,
            (23 /* ER AAC LD */, true) => 480,
            (_, false) => 1024,
            (_, true) => 960,
        };
        Ok(AudioSpecificConfig {
            audio_object_type,
            sampling_frequency_index,
            sampling_frequency,
            channel_config,
            frame_length: NonZeroU16::new(frame_length).ok_or("zero frame length")?,
        })
    }
}

/// The fixed fields of an ADTS header, as in ISO/IEC 14496-3 section 1.A.2.2.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdtsHeader {
    profile: u8,
    sampling_frequency_index: u8,
    channel_config: u8,
}

impl AdtsHeader {
    /// Returns the header for `config` or an explanation of why ADTS can't
    /// express it.
    pub fn from_config(config: &AudioSpecificConfig) -> Result<Self, String> {
        if !(1..=4).contains(&config.audio_object_type) {
            return Err(format!(
                "audio_object_type {} has no ADTS profile",
                config.audio_object_type
            ));
        }
        if config.sampling_frequency_index > 0xc {
            return Err(format!(
                "explicit sampling frequency {} has no ADTS index",
                config.sampling_frequency
            ));
        }
        if !(1..=7).contains(&config.channel_config) {
            return Err(format!(
                "channelConfiguration {} is not expressible in ADTS",
                config.channel_config
            ));
        }
        Ok(AdtsHeader {
            profile: config.audio_object_type - 1,
            sampling_frequency_index: config.sampling_frequency_index,
            channel_config: config.channel_config,
        })
    }

    /// Returns the header for a raw frame of `len` bytes, or `None` if it's
    /// too long for ADTS's 13-bit frame length.
    pub fn for_frame(&self, len: usize) -> Option<[u8; 7]> {
        let total = len.checked_add(7).filter(|&t| t < (1 << 13))?;
        let total = total as u16;
        Some([
            0xff,
            0xf1, // syncword cont'd, MPEG-4, layer 0, no CRC.
            (self.profile << 6) | (self.sampling_frequency_index << 2) | (self.channel_config >> 2),
            ((self.channel_config & 0b11) << 6) | (total >> 11) as u8,
            (total >> 3) as u8,
            (((total & 0b111) as u8) << 5) | 0x1f,
            0xfc, // buffer fullness (VBR) cont'd, one raw data block.
        ])
    }
}

/// The AU header layout from the `fmtp` parameters of
/// [RFC 3640 section 4.1](https://datatracker.ietf.org/doc/html/rfc3640#section-4.1).
#[derive(Copy, Clone, Debug)]
struct AuHeaderLayout {
    size_length: u32,
    index_length: u32,
    index_delta_length: u32,
}

#[derive(Debug)]
struct FormatSpecificParams {
    layout: AuHeaderLayout,
    config: Option<Vec<u8>>,
}

fn parse_format_specific_params(format_specific_params: &str) -> Result<FormatSpecificParams, String> {
    let mut config = None;
    let mut size_length = None;
    let mut index_length = 0;
    let mut index_delta_length = 0;
    let parse_len = |key: &str, value: &str| -> Result<u32, String> {
        match u32::from_str_radix(value.trim(), 10) {
            Ok(v) if v <= 32 => Ok(v),
            _ => Err(format!("bad {key} {value:?}")),
        }
    };
    for p in format_specific_params.split(';') {
        let p = p.trim();
        if p.is_empty() {
            // Reolink cameras leave a trailing ';'.
            continue;
        }
        let Some((key, value)) = p.split_once('=') else {
            debug!("ignoring AAC format-specific-param {p:?} without value");
            continue;
        };
        match &key.trim().to_ascii_lowercase()[..] {
            "config" => {
                config = Some(
                    hex::decode(value.trim())
                        .map_err(|_| "config has invalid hex encoding".to_owned())?,
                )
            }
            "mode" if !value.trim().to_ascii_lowercase().starts_with("aac-") => {
                return Err(format!("unsupported mode {value:?}"));
            }
            "sizelength" => size_length = Some(parse_len("sizeLength", value)?),
            "indexlength" => index_length = parse_len("indexLength", value)?,
            "indexdeltalength" => index_delta_length = parse_len("indexDeltaLength", value)?,
            _ => {}
        }
    }
    let size_length = match size_length {
        Some(0) | None => return Err("sizeLength must be specified".into()),
        Some(l) => l,
    };
    Ok(FormatSpecificParams {
        layout: AuHeaderLayout {
            size_length,
            index_length,
            index_delta_length,
        },
        config,
    })
}

/// A fragmented AU in progress.
#[derive(Debug)]
struct Fragment {
    stream_id: usize,
    timestamp: Timestamp,
    start_ctx: PacketContext,
    end_ctx: PacketContext,
    loss: u16,
    complete: bool,
    size: usize,
    buf: BytesMut,
}

impl Fragment {
    fn into_access_unit(self) -> AccessUnit {
        let complete = self.complete && self.buf.len() == self.size;
        AccessUnit {
            stream_id: self.stream_id,
            timestamp: self.timestamp,
            start_ctx: self.start_ctx,
            end_ctx: self.end_ctx,
            loss: self.loss,
            complete,
            is_random_access_point: true,
            data: self.buf.freeze(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    parameters: Parameters,
    layout: AuHeaderLayout,
    frame_length: NonZeroU32,
    fragment: Option<Fragment>,
}

impl Depacketizer {
    pub(super) fn new(
        clock_rate: u32,
        channels: Option<NonZeroU16>,
        format_specific_params: Option<&str>,
    ) -> Result<Self, String> {
        let format_specific_params = format_specific_params
            .ok_or_else(|| "AAC requires format-specific-params".to_owned())?;
        let params = parse_format_specific_params(format_specific_params)?;
        let config = match params.config.as_deref().map(AudioSpecificConfig::parse) {
            Some(Ok(c)) => Some(c),
            Some(Err(e)) => {
                warn!("unparseable AudioSpecificConfig: {e}");
                None
            }
            None => {
                warn!("AAC stream has no AudioSpecificConfig");
                None
            }
        };
        if let Some(c) = config.as_ref() {
            if c.sampling_frequency != clock_rate {
                warn!(
                    "AAC sampling frequency {} differs from RTP clock rate {clock_rate}",
                    c.sampling_frequency
                );
            }
            if let Some(ch) = channels {
                if c.channel_config != 0 && u16::from(c.channel_config) != ch.get() {
                    debug!(
                        "AAC channelConfiguration {} vs {ch} SDP channels",
                        c.channel_config
                    );
                }
            }
        }
        let framing = match config.as_ref().map(AdtsHeader::from_config) {
            Some(Ok(h)) => Framing::Adts(h),
            Some(Err(e)) => {
                warn!("writing AAC without ADTS headers: {e}");
                Framing::UnitsOnly
            }
            None => Framing::UnitsOnly,
        };
        let extension = match framing {
            Framing::Adts(_) => "aac",
            _ => "raw",
        };
        let frame_length = config
            .as_ref()
            .map(|c| NonZeroU32::from(c.frame_length))
            .unwrap_or(NonZeroU32::new(1024).ok_or("zero frame length")?);
        Ok(Depacketizer {
            parameters: Parameters {
                encoding_name: "mpeg4-generic",
                clock_rate,
                extension,
                extra_data: params.config.map(Bytes::from).unwrap_or_default(),
                framing,
                pixel_dimensions: None,
            },
            layout: params.layout,
            frame_length,
            fragment: None,
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
        if let Some(mut frag) = self.fragment.take() {
            if frag.timestamp.timestamp() != pkt.timestamp().timestamp() {
                debug!(
                    "AAC fragment at {} ended by timestamp change with {}/{} bytes",
                    frag.timestamp,
                    frag.buf.len(),
                    frag.size
                );
                frag.complete = false;
                out.push_back(frag.into_access_unit());
            } else {
                if pkt.loss() > 0 {
                    frag.complete = false;
                    frag.loss = frag.loss.saturating_add(pkt.loss());
                }
                self.fragment = Some(frag);
            }
        }
        let r = self.push_inner(&pkt, out);
        if r.is_err() {
            if let Some(frag) = self.fragment.as_mut() {
                frag.complete = false;
            }
        }
        r
    }

    /// Reads the AU sizes from the AU header section of
    /// [RFC 3640 section 3.2.1](https://datatracker.ietf.org/doc/html/rfc3640#section-3.2.1),
    /// returning them along with the offset of the data section.
    fn read_au_headers(&self, payload: &[u8]) -> Result<(Vec<usize>, usize), String> {
        if payload.len() < 2 {
            return Err("payload too short for AU-headers-length".into());
        }
        let headers_bits = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
        let data_off = 2 + (headers_bits + 7) / 8;
        if payload.len() < data_off {
            return Err(format!(
                "AU-headers-length {headers_bits} bits exceeds payload of {} bytes",
                payload.len()
            ));
        }
        let l = self.layout;
        let mut r = BitReader::endian(&payload[2..data_off], BigEndian);
        let mut sizes = Vec::new();
        let mut remaining = headers_bits;
        loop {
            let index_bits = if sizes.is_empty() {
                l.index_length
            } else {
                l.index_delta_length
            };
            let header_bits = (l.size_length + index_bits) as usize;
            if remaining < header_bits || header_bits == 0 {
                break;
            }
            let size = read_bits(&mut r, l.size_length)?;
            let index = read_bits(&mut r, index_bits)?;
            if index != 0 {
                return Err(format!(
                    "AU index (delta) {index} indicates interleaving, which is unsupported"
                ));
            }
            sizes.push(size as usize);
            remaining -= header_bits;
        }
        if sizes.is_empty() {
            return Err(format!("no AU headers in {headers_bits} bits"));
        }
        Ok((sizes, data_off))
    }

    fn push_inner(&mut self, pkt: &ReceivedPacket, out: &mut VecDeque<AccessUnit>) -> Result<(), String> {
        let payload = pkt.payload();
        let (sizes, data_off) = self.read_au_headers(payload)?;
        let data = &payload[data_off..];

        if let Some(frag) = self.fragment.as_mut() {
            if sizes.len() != 1 {
                return Err(format!(
                    "{} AUs in packet continuing a fragmented AU",
                    sizes.len()
                ));
            }
            if sizes[0] != frag.size {
                return Err(format!(
                    "AU size changed from {} to {} mid-fragment",
                    frag.size, sizes[0]
                ));
            }
            if frag.buf.len() + data.len() > frag.size {
                return Err(format!(
                    "fragments total more than AU size {}",
                    frag.size
                ));
            }
            frag.buf.extend_from_slice(data);
            frag.end_ctx = *pkt.ctx();
            if pkt.mark() {
                if let Some(frag) = self.fragment.take() {
                    out.push_back(frag.into_access_unit());
                }
            }
            return Ok(());
        }

        if sizes.len() == 1 && sizes[0] > data.len() {
            // Start of a fragmented AU. If packets were lost, it may really
            // be a later fragment; the size check at the end catches that.
            let frag = Fragment {
                stream_id: pkt.stream_id(),
                timestamp: pkt.timestamp(),
                start_ctx: *pkt.ctx(),
                end_ctx: *pkt.ctx(),
                loss: pkt.loss(),
                complete: pkt.loss() == 0,
                size: sizes[0],
                buf: BytesMut::from(data),
            };
            if pkt.mark() {
                out.push_back(frag.into_access_unit());
            } else {
                self.fragment = Some(frag);
            }
            return Ok(());
        }

        let mut off = 0;
        let mut loss = pkt.loss();
        for (i, &size) in sizes.iter().enumerate() {
            if data.len() - off < size {
                return Err(format!(
                    "AU {i} of {size} bytes exceeds remaining {} bytes",
                    data.len() - off
                ));
            }
            let delta = u32::try_from(i)
                .ok()
                .and_then(|i| i.checked_mul(self.frame_length.get()))
                .ok_or("too many AUs")?;
            let timestamp = pkt
                .timestamp()
                .try_add(delta)
                .ok_or_else(|| format!("timestamp {} + {delta} overflows", pkt.timestamp()))?;
            out.push_back(AccessUnit {
                stream_id: pkt.stream_id(),
                timestamp,
                start_ctx: *pkt.ctx(),
                end_ctx: *pkt.ctx(),
                loss,
                complete: true,
                is_random_access_point: true,
                data: pkt.payload_bytes().slice(data_off + off..data_off + off + size),
            });
            loss = 0;
            off += size;
        }
        if off < data.len() {
            debug!("{} trailing bytes after AUs", data.len() - off);
        }
        Ok(())
    }

    pub(super) fn flush(&mut self, out: &mut VecDeque<AccessUnit>) {
        if let Some(mut frag) = self.fragment.take() {
            frag.complete = false;
            out.push_back(frag.into_access_unit());
        }
    }
}

fn read_bits<R: BitRead>(r: &mut R, bits: u32) -> Result<u32, String> {
    if bits == 0 {
        return Ok(0);
    }
    r.read::<u32>(bits)
        .map_err(|e| format!("unable to read AU header: {e}"))
}

#[cfg(test)]
mod tests {
    use crate::rtp::ReceivedPacketBuilder;
    use crate::testutil::{init_logging, timestamp};

    use super::*;

    const DAHUA_FMTP: &str = "streamtype=5;profile-level-id=1;mode=AAC-hbr;sizelength=13;\
        indexlength=3;indexdeltalength=3;config=1188";

    fn pkt(seq: u16, ts: i64, loss: u16, mark: bool, payload: &[u8]) -> ReceivedPacket {
        ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            stream_id: 1,
            timestamp: timestamp(ts, 48_000),
            ssrc: 0,
            sequence_number: seq,
            loss,
            mark,
            payload_type: 97,
        }
        .build(payload.iter().copied())
        .unwrap()
    }

    /// Returns an AAC-hbr AU header (13-bit size, 3-bit index) for `size`.
    fn hbr(size: u16) -> [u8; 2] {
        (size << 3).to_be_bytes()
    }

    #[test]
    fn parse_audio_specific_config() {
        let dahua = AudioSpecificConfig::parse(&[0x11, 0x88]).unwrap();
        assert_eq!(dahua.sampling_frequency, 48_000);
        assert_eq!(dahua.channel_config, 1);
        assert_eq!(dahua.audio_object_type, 2);
        assert_eq!(dahua.frame_length.get(), 1024);

        let bunny = AudioSpecificConfig::parse(&[0x14, 0x90]).unwrap();
        assert_eq!(bunny.sampling_frequency, 12_000);
        assert_eq!(bunny.channel_config, 2);

        AudioSpecificConfig::parse(&[0x11]).unwrap_err();
        AudioSpecificConfig::parse(&[0x16, 0x88]).unwrap_err(); // reserved frequency index
    }

    #[test]
    fn adts_header() {
        let h = AdtsHeader::from_config(&AudioSpecificConfig::parse(&[0x11, 0x88]).unwrap())
            .unwrap();
        assert_eq!(
            h.for_frame(100).unwrap(),
            [0xff, 0xf1, 0x4c, 0x40, 0x0d, 0x7f, 0xfc]
        );
        assert!(h.for_frame(8_185).is_none());

        // HE-AAC signaled explicitly has no ADTS profile.
        let he = AudioSpecificConfig {
            audio_object_type: 5,
            ..AudioSpecificConfig::parse(&[0x11, 0x88]).unwrap()
        };
        AdtsHeader::from_config(&he).unwrap_err();
    }

    #[test]
    fn aggregate() {
        init_logging();
        let mut d = Depacketizer::new(48_000, None, Some(DAHUA_FMTP)).unwrap();
        assert_eq!(d.parameters().extension, "aac");
        assert_eq!(&d.parameters().extra_data[..], b"\x11\x88");
        let mut payload = vec![0x00, 0x30]; // 48 bits of AU headers.
        for size in [3, 2, 4] {
            payload.extend_from_slice(&hbr(size));
        }
        payload.extend_from_slice(b"abcdeFGHI");
        let mut out = VecDeque::new();
        d.push(pkt(0, 0, 2, true, &payload), &mut out).unwrap();
        let aus: Vec<_> = out.drain(..).collect();
        assert_eq!(aus.len(), 3);
        assert_eq!(&aus[0].data()[..], b"abc");
        assert_eq!(&aus[1].data()[..], b"de");
        assert_eq!(&aus[2].data()[..], b"FGHI");
        assert_eq!(aus[0].loss(), 2);
        assert_eq!(aus[1].loss(), 0);
        assert_eq!(aus[2].timestamp().elapsed(), 2048);
        assert!(aus.iter().all(|a| a.is_complete()));
    }

    #[test]
    fn fragmented() {
        init_logging();
        let mut d = Depacketizer::new(48_000, None, Some(DAHUA_FMTP)).unwrap();
        let mut out = VecDeque::new();
        let frame = b"0123456789abcdef";
        for (i, (chunk, mark)) in [(&frame[..6], false), (&frame[6..12], false), (&frame[12..], true)]
            .into_iter()
            .enumerate()
        {
            let mut payload = vec![0x00, 0x10];
            payload.extend_from_slice(&hbr(16));
            payload.extend_from_slice(chunk);
            d.push(pkt(i as u16, 1024, 0, mark, &payload), &mut out).unwrap();
        }
        assert_eq!(out.len(), 1);
        let au = out.pop_front().unwrap();
        assert_eq!(&au.data()[..], &frame[..]);
        assert!(au.is_complete());
    }

    #[test]
    fn fragment_interior_loss() {
        init_logging();
        let mut d = Depacketizer::new(48_000, None, Some(DAHUA_FMTP)).unwrap();
        let mut out = VecDeque::new();
        let frag = |chunk: &[u8]| {
            let mut payload = vec![0x00, 0x10];
            payload.extend_from_slice(&hbr(16));
            payload.extend_from_slice(chunk);
            payload
        };
        d.push(pkt(0, 0, 0, false, &frag(b"012345")), &mut out).unwrap();
        // The middle fragment is lost.
        d.push(pkt(2, 0, 1, true, &frag(b"cdef")), &mut out).unwrap();
        let au = out.pop_front().unwrap();
        assert!(!au.is_complete());
        assert_eq!(au.loss(), 1);
        assert_eq!(&au.data()[..], b"012345cdef");

        // Processing continues with the next packet.
        let mut payload = vec![0x00, 0x10];
        payload.extend_from_slice(&hbr(2));
        payload.extend_from_slice(b"ok");
        d.push(pkt(3, 1024, 0, true, &payload), &mut out).unwrap();
        let au = out.pop_front().unwrap();
        assert!(au.is_complete());
        assert_eq!(&au.data()[..], b"ok");
    }

    #[test]
    fn fragment_ended_by_timestamp_change() {
        init_logging();
        let mut d = Depacketizer::new(48_000, None, Some(DAHUA_FMTP)).unwrap();
        let mut out = VecDeque::new();
        let mut payload = vec![0x00, 0x10];
        payload.extend_from_slice(&hbr(16));
        payload.extend_from_slice(b"0123");
        d.push(pkt(0, 0, 0, false, &payload), &mut out).unwrap();
        let mut payload = vec![0x00, 0x10];
        payload.extend_from_slice(&hbr(1));
        payload.extend_from_slice(b"x");
        d.push(pkt(5, 1024, 4, true, &payload), &mut out).unwrap();
        let partial = out.pop_front().unwrap();
        assert!(!partial.is_complete());
        assert_eq!(&partial.data()[..], b"0123");
        assert!(out.pop_front().unwrap().is_complete());
    }

    #[test]
    fn bad_packets() {
        init_logging();
        let mut d = Depacketizer::new(48_000, None, Some(DAHUA_FMTP)).unwrap();
        let mut out = VecDeque::new();
        d.push(pkt(0, 0, 0, true, b"\x00"), &mut out).unwrap_err();
        d.push(pkt(1, 0, 0, true, b"\x00\x40\x00"), &mut out).unwrap_err();
        // Two AU headers, the second AU truncated.
        d.push(pkt(2, 0, 0, true, b"\x00\x20\x00\x08\x00\x40ab"), &mut out)
            .unwrap_err();
        assert_eq!(out.len(), 1); // the first AU was fine.
        d.push(pkt(3, 0, 0, true, b"\x00\x10\x00\x09x"), &mut out)
            .unwrap_err(); // index 1: interleaved
    }

    #[test]
    fn params() {
        Depacketizer::new(48_000, None, None).unwrap_err();
        Depacketizer::new(48_000, None, Some("mode=AAC-hbr;config=1188")).unwrap_err();
        Depacketizer::new(48_000, None, Some("mode=CELP-cbr;sizelength=6")).unwrap_err();

        // Without a usable config, frames are written raw.
        let d = Depacketizer::new(48_000, None, Some("mode=AAC-hbr;sizelength=13")).unwrap();
        assert_eq!(d.parameters().extension, "raw");
        assert_eq!(d.parameters().framing, Framing::UnitsOnly);
        assert_eq!(d.frame_length.get(), 1024);
    }
}
