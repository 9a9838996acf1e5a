// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Recovers RTSP/RTP audio and video streams from recorded packet captures.
//!
//! The pipeline, leaves first:
//!
//! *   [`capture`] reads timestamped transport packets from a capture file.
//! *   [`rtsp`] follows the RTSP conversation on each TCP connection,
//!     extracting the session description on `DESCRIBE` and transport
//!     parameters on `SETUP`.
//! *   [`sdp`] parses session descriptions into per-track media descriptions.
//! *   [`correlate`] binds negotiated tracks to UDP ports and routes RTP
//!     packets to them.
//! *   [`codec`] turns each track's ordered RTP payloads into access units.
//! *   [`sink`] receives access units in timestamp order.
//!
//! [`extract::Session`] drives all of the above for one capture.

#![forbid(clippy::print_stderr, clippy::print_stdout)]
// I prefer to use from_str_radix(..., 10) to explicitly note the base.
#![allow(clippy::from_str_radix_10)]

use std::fmt::{Debug, Display};
use std::net::SocketAddr;
use std::num::NonZeroU32;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

mod error;

pub mod capture;
pub mod codec;
pub mod correlate;
pub mod extract;
pub mod rtp;
pub mod rtsp;
pub mod sdp;
pub mod sink;

#[cfg(test)]
mod testutil;

pub use error::{Diagnostics, Error, ErrorKind};

/// An annotated RTP timestamp.
///
/// This couples together three pieces of information:
///
/// *   The stream's starting time: the RTP timestamp of the first packet seen
///     for the track. According to [RFC 3550 section
///     5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1), "the
///     initial value of the timestamp SHOULD be random".
///
/// *   The codec-specific clock rate.
///
/// *   The timestamp as an `i64`. Its top bits are inferred from wraparounds
///     of 32-bit RTP timestamps. Timestamps that differ by more than
///     `i32::MAX` from the previous timestamp are treated as backwards jumps.
///     A timestamp may indicate a time *before* the stream's starting point.
///
/// In combination, these allow conversion to "normal play time" (NPT): seconds since start of
/// the stream.
///
/// The [`Display`] and [`Debug`] implementations currently display:
/// *   the full timestamp.
/// *   the bottom 32 bits, as seen in RTP packet headers.
/// *   NPT
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Timestamp {
    /// A timestamp which must be compared to `start`.
    timestamp: i64,

    /// The codec-specified clock rate, in Hz. Must be non-zero.
    clock_rate: NonZeroU32,

    /// The RTP timestamp of the track's first packet.
    start: u32,
}

impl Timestamp {
    /// Creates a new timestamp unless `timestamp - start` underflows.
    #[inline]
    pub fn new(timestamp: i64, clock_rate: NonZeroU32, start: u32) -> Option<Self> {
        timestamp.checked_sub(i64::from(start)).map(|_| Timestamp {
            timestamp,
            clock_rate,
            start,
        })
    }

    /// Returns time since some arbitrary point before the stream started.
    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Returns timestamp of the start of the stream.
    #[inline]
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Returns codec-specified clock rate, in Hz.
    #[inline]
    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }

    /// Returns elapsed time since the stream start in clock rate units.
    #[inline]
    pub fn elapsed(&self) -> i64 {
        self.timestamp - i64::from(self.start)
    }

    /// Returns elapsed time since the stream start in seconds, aka "normal play
    /// time" (NPT).
    #[inline]
    pub fn elapsed_secs(&self) -> f64 {
        (self.elapsed() as f64) / (self.clock_rate.get() as f64)
    }

    /// Returns `self + delta` unless it would overflow.
    pub fn try_add(&self, delta: u32) -> Option<Self> {
        // Check for `timestamp` overflow only. We don't need to check for
        // `timestamp - start` underflow because delta is non-negative.
        self.timestamp
            .checked_add(i64::from(delta))
            .map(|timestamp| Timestamp {
                timestamp,
                clock_rate: self.clock_rate,
                start: self.start,
            })
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (mod-2^32: {}), npt {:.03}",
            self.timestamp,
            self.timestamp as u32,
            self.elapsed_secs()
        )
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// The time at which a packet was recorded, as stored in the capture file.
///
/// Currently this just allows formatting via `Debug` and `Display`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CaptureTime(chrono::DateTime<chrono::Utc>);

impl CaptureTime {
    /// Converts a capture record's time since the Unix epoch.
    pub fn from_unix(since_epoch: std::time::Duration) -> Self {
        let t = chrono::Duration::from_std(since_epoch)
            .ok()
            .and_then(|d| chrono::DateTime::UNIX_EPOCH.checked_add_signed(d))
            .unwrap_or(chrono::DateTime::UNIX_EPOCH);
        CaptureTime(t)
    }
}

impl Display for CaptureTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T%.6f"))
    }
}

/// Context for a single captured packet.
///
/// This gives enough information to pick out the packet in Wireshark: the
/// 1-based frame number and the capture timestamp.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PacketContext {
    frame: u64,
    time: CaptureTime,
}

impl PacketContext {
    pub fn new(frame: u64, time: CaptureTime) -> Self {
        Self { frame, time }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self {
            frame: 0,
            time: CaptureTime::from_unix(std::time::Duration::ZERO),
        }
    }

    /// Returns the 1-based frame number within the capture.
    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    #[inline]
    pub fn time(&self) -> CaptureTime {
        self.time
    }
}

impl Display for PacketContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame {}@{}", self.frame, self.time)
    }
}

/// Transport-layer protocol of a captured packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// The addressing of a captured packet: protocol plus source and destination.
///
/// For RTSP connections this is oriented client to server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowContext {
    pub protocol: Protocol,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowContext {
    /// Returns the same flow in the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            protocol: self.protocol,
            src: self.dst,
            dst: self.src,
        }
    }
}

impl Display for FlowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{} {}->{}", proto, self.src, self.dst)
    }
}

/// Formats at most `max_bytes` of `data` as a hex dump for error messages.
pub(crate) fn hex_dump(data: &[u8], max_bytes: usize) -> String {
    pretty_hex::config_hex(
        &data,
        pretty_hex::HexConfig {
            title: true,
            max_bytes,
            ..Default::default()
        },
    )
}
