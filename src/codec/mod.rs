// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec-specific logic: turning a track's ordered RTP payloads into access
//! units.
//!
//! [`Depacketizer`] dispatches to one implementation per codec family. Each
//! receives packets in sequence order (see [`crate::extract`]'s reorder
//! window) with loss already counted, and emits [`AccessUnit`]s whenever it
//! determines a unit boundary.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::num::NonZeroU16;

use bytes::Bytes;

use crate::rtp::ReceivedPacket;
use crate::sdp::MediaDescription;
use crate::PacketContext;

pub(crate) mod aac;
mod h264;
mod h265;
mod h26x;
mod mp4v_es;
mod simple_audio;

/// One decodable output unit: a video picture or audio frame.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessUnit {
    stream_id: usize,
    timestamp: crate::Timestamp,
    start_ctx: PacketContext,
    end_ctx: PacketContext,
    loss: u16,
    complete: bool,
    is_random_access_point: bool,
    data: Bytes,
}

impl AccessUnit {
    #[inline]
    pub fn stream_id(&self) -> usize {
        self.stream_id
    }

    /// Returns the decode timestamp.
    #[inline]
    pub fn timestamp(&self) -> crate::Timestamp {
        self.timestamp
    }

    /// Returns the context of the first packet which contributed to this unit.
    #[inline]
    pub fn start_ctx(&self) -> PacketContext {
        self.start_ctx
    }

    /// Returns the context of the last packet which contributed to this unit.
    #[inline]
    pub fn end_ctx(&self) -> PacketContext {
        self.end_ctx
    }

    /// Returns the number of lost RTP packets before or within this unit.
    ///
    /// Loss before a unit doesn't necessarily make it incomplete; see
    /// [`AccessUnit::is_complete`].
    #[inline]
    pub fn loss(&self) -> u16 {
        self.loss
    }

    /// Returns false if some of this unit's data is known or suspected to be
    /// missing.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Returns true if decoding can start at this unit.
    ///
    /// Audio units are always random access points.
    #[inline]
    pub fn is_random_access_point(&self) -> bool {
        self.is_random_access_point
    }

    /// Returns the unit's data: Annex B NAL units for H.264/H.265, a raw
    /// frame for audio, a concatenation of payloads for MPEG-4 Visual.
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Sets the timestamp; used when a sink must keep timestamps non-decreasing.
    pub(crate) fn set_timestamp(&mut self, timestamp: crate::Timestamp) {
        self.timestamp = timestamp;
    }
}

impl Debug for AccessUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessUnit")
            .field("stream_id", &self.stream_id)
            .field("timestamp", &self.timestamp)
            .field("start_ctx", &self.start_ctx)
            .field("end_ctx", &self.end_ctx)
            .field("loss", &self.loss)
            .field("complete", &self.complete)
            .field("is_random_access_point", &self.is_random_access_point)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// How access units are laid out in an elementary-stream file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Framing {
    /// The codec configuration, then each unit's data as-is.
    ConfigThenUnits,

    /// Each unit preceded by an ADTS header; the configuration is implied by the headers.
    Adts(aac::AdtsHeader),

    /// Each unit's data as-is, with no configuration.
    UnitsOnly,
}

/// Codec parameters known when the track starts.
#[derive(Clone, Debug)]
pub struct Parameters {
    encoding_name: &'static str,
    clock_rate: u32,
    extension: &'static str,
    extra_data: Bytes,
    framing: Framing,
    pixel_dimensions: Option<(u32, u32)>,
}

impl Parameters {
    /// Returns the lower-cased RTP encoding name, eg `h264`.
    pub fn encoding_name(&self) -> &'static str {
        self.encoding_name
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Returns the conventional file extension for the raw elementary stream.
    pub fn extension(&self) -> &'static str {
        self.extension
    }

    /// Returns the out-of-band codec configuration: Annex B parameter sets
    /// for H.264/H.265, the `AudioSpecificConfig` for AAC, the visual object
    /// sequence header for MPEG-4 Visual. May be empty.
    pub fn extra_data(&self) -> &Bytes {
        &self.extra_data
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    /// Returns the bytes to write before the first unit.
    pub fn file_prefix(&self) -> &[u8] {
        match self.framing {
            Framing::ConfigThenUnits => &self.extra_data[..],
            Framing::Adts(_) | Framing::UnitsOnly => &[],
        }
    }

    /// Returns the header to write before a unit of `len` bytes, if any.
    pub fn unit_header(&self, len: usize) -> Option<[u8; 7]> {
        match self.framing {
            Framing::Adts(ref h) => h.for_frame(len),
            Framing::ConfigThenUnits | Framing::UnitsOnly => None,
        }
    }

    /// Returns the width and height from the sequence parameter set, when known.
    pub fn pixel_dimensions(&self) -> Option<(u32, u32)> {
        self.pixel_dimensions
    }
}

#[derive(Debug)]
enum DepacketizerInner {
    H264(Box<h264::Depacketizer>),
    H265(Box<h265::Depacketizer>),
    Aac(Box<aac::Depacketizer>),
    Mp4vEs(Box<mp4v_es::Depacketizer>),
    SimpleAudio(Box<simple_audio::Depacketizer>),
}

/// Turns RTP packets of one track into access units.
///
/// Each `push` may complete zero or more units, which are retrieved with
/// `pull` before the next `push`.
#[derive(Debug)]
pub struct Depacketizer {
    inner: DepacketizerInner,
    pending: VecDeque<AccessUnit>,
}

impl Depacketizer {
    /// Creates a depacketizer for the given lower-cased `media` type and
    /// `encoding_name`, or returns a description of why that isn't possible.
    pub fn new(
        media: &str,
        encoding_name: &str,
        clock_rate: u32,
        channels: Option<NonZeroU16>,
        format_specific_params: Option<&str>,
    ) -> Result<Self, String> {
        use DepacketizerInner::*;
        let inner = match (media, encoding_name) {
            ("video", "h264") => H264(Box::new(h264::Depacketizer::new(
                clock_rate,
                format_specific_params,
            )?)),
            ("video", "h265") => H265(Box::new(h265::Depacketizer::new(
                clock_rate,
                format_specific_params,
            )?)),
            ("video", "mp4v-es") => Mp4vEs(Box::new(mp4v_es::Depacketizer::new(
                clock_rate,
                format_specific_params,
            )?)),
            ("audio", "mpeg4-generic") => Aac(Box::new(aac::Depacketizer::new(
                clock_rate,
                channels,
                format_specific_params,
            )?)),
            ("audio", e) => match simple_audio::Kind::from_encoding_name(e) {
                Some(kind) => SimpleAudio(Box::new(simple_audio::Depacketizer::new(
                    kind, clock_rate, channels,
                )?)),
                None => return Err(format!("no depacketizer for audio encoding {e:?}")),
            },
            (m, e) => return Err(format!("no depacketizer for {m}/{e}")),
        };
        Ok(Depacketizer {
            inner,
            pending: VecDeque::new(),
        })
    }

    /// Creates a depacketizer for the given media description.
    pub fn for_media(media: &MediaDescription) -> Result<Self, String> {
        let encoding_name = media
            .encoding_name
            .as_deref()
            .ok_or_else(|| "no encoding name (no rtpmap and not a static payload type)".to_owned())?;
        let clock_rate = media
            .clock_rate
            .ok_or_else(|| format!("no clock rate for {encoding_name}"))?;
        Self::new(
            &media.media,
            encoding_name,
            clock_rate,
            media.channels,
            media.fmtp.as_ref().map(|f| &f.raw[..]),
        )
    }

    pub fn parameters(&self) -> &Parameters {
        match &self.inner {
            DepacketizerInner::H264(d) => d.parameters(),
            DepacketizerInner::H265(d) => d.parameters(),
            DepacketizerInner::Aac(d) => d.parameters(),
            DepacketizerInner::Mp4vEs(d) => d.parameters(),
            DepacketizerInner::SimpleAudio(d) => d.parameters(),
        }
    }

    /// Supplies a packet.
    ///
    /// On error, the packet is skipped and any unit in progress is marked
    /// incomplete; the depacketizer remains usable.
    pub fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        let out = &mut self.pending;
        match &mut self.inner {
            DepacketizerInner::H264(d) => d.push(pkt, out),
            DepacketizerInner::H265(d) => d.push(pkt, out),
            DepacketizerInner::Aac(d) => d.push(pkt, out),
            DepacketizerInner::Mp4vEs(d) => d.push(pkt, out),
            DepacketizerInner::SimpleAudio(d) => d.push(pkt, out),
        }
    }

    /// Retrieves the next completed unit, if any.
    pub fn pull(&mut self) -> Option<AccessUnit> {
        self.pending.pop_front()
    }

    /// Ends the stream: any unit in progress becomes available to `pull`,
    /// marked incomplete.
    pub fn flush(&mut self) {
        let out = &mut self.pending;
        match &mut self.inner {
            DepacketizerInner::H264(d) => d.flush(out),
            DepacketizerInner::H265(d) => d.flush(out),
            DepacketizerInner::Aac(d) => d.flush(out),
            DepacketizerInner::Mp4vEs(d) => d.flush(out),
            DepacketizerInner::SimpleAudio(_) => {}
        }
    }

    /// Pushes `pkt` and moves every unit it completed into `out`.
    pub fn consume(&mut self, pkt: ReceivedPacket, out: &mut Vec<AccessUnit>) -> Result<(), String> {
        let r = self.push(pkt);
        out.extend(self.pending.drain(..));
        r
    }
}
