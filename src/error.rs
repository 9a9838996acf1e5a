// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, path::PathBuf, sync::Arc};

use crate::{FlowContext, PacketContext};
use bytes::Bytes;
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// Currently the focus is on providing detailed human-readable error messages.
/// In most cases they have enough information to find the offending packet
/// in Wireshark. [`Error::kind`] gives a coarse classification.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.0.kind()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

/// Coarse classification of an [`Error`], determining how it propagates.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed RTSP, SDP, or RTP structure. The offending unit is skipped.
    Parse,

    /// A packet which can't be attributed to any negotiated track.
    Correlation,

    /// A track whose codec has no depacketizer. That track is skipped.
    UnsupportedCodec,

    /// The capture, backup session description, or output is unusable.
    /// Aborts the run.
    FatalIo,

    Internal,
}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unparseable or unexpected RTSP message.
    #[error("[{conn}, {pkt_ctx}] RTSP parse error: {description}")]
    RtspParseError {
        conn: FlowContext,
        pkt_ctx: PacketContext,
        description: String,
    },

    #[error("[{conn}, {pkt_ctx}] {} response CSeq={cseq:?}: {description}",
            Into::<&str>::into(.method))]
    RtspResponseError {
        conn: FlowContext,
        pkt_ctx: PacketContext,
        method: rtsp_types::Method,
        cseq: Option<u32>,
        description: String,
    },

    #[error("[{origin}] SDP line {line}: {description}")]
    SdpParseError {
        origin: String,
        line: usize,
        description: String,
    },

    #[error("[{pkt_ctx}, {flow}] bad RTP packet: {description}\n{}",
            crate::hex_dump(.data, 64))]
    RtpPacketError {
        pkt_ctx: PacketContext,
        flow: FlowContext,
        description: String,
        data: Bytes,
    },

    #[error(
        "[{pkt_ctx}, track={track}, ssrc={ssrc:08x}, seq={sequence_number:04x}] {description}"
    )]
    DepacketizeError {
        pkt_ctx: PacketContext,
        track: usize,
        ssrc: u32,
        sequence_number: u16,
        description: String,
    },

    #[error("[{pkt_ctx}, {flow}] no negotiated track for RTP packet with ssrc={ssrc:08x}")]
    UnroutablePacket {
        pkt_ctx: PacketContext,
        flow: FlowContext,
        ssrc: u32,
    },

    /// RTP carried on the RTSP connection itself, which isn't extracted.
    #[error("[{conn}, {pkt_ctx}] {description}")]
    InterleavedTransport {
        conn: FlowContext,
        pkt_ctx: PacketContext,
        description: String,
    },

    #[error("track {track}: no depacketizer for {media}/{encoding_name}: {description}")]
    UnsupportedCodec {
        track: usize,
        media: String,
        encoding_name: String,
        description: String,
    },

    #[error("Unable to read capture {}: {source}", .path.display())]
    CaptureReadError {
        path: PathBuf,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Unable to read backup SDP {}: {source}", .path.display())]
    BackupSdpReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("track {track}: unable to write {}: {source}", .path.display())]
    OutputError {
        track: usize,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ErrorInt {
    fn kind(&self) -> ErrorKind {
        match self {
            ErrorInt::RtspParseError { .. }
            | ErrorInt::RtspResponseError { .. }
            | ErrorInt::SdpParseError { .. }
            | ErrorInt::RtpPacketError { .. }
            | ErrorInt::DepacketizeError { .. } => ErrorKind::Parse,
            ErrorInt::UnroutablePacket { .. } | ErrorInt::InterleavedTransport { .. } => {
                ErrorKind::Correlation
            }
            ErrorInt::UnsupportedCodec { .. } => ErrorKind::UnsupportedCodec,
            ErrorInt::CaptureReadError { .. }
            | ErrorInt::BackupSdpReadError { .. }
            | ErrorInt::OutputError { .. } => ErrorKind::FatalIo,
            ErrorInt::InvalidArgument(_) | ErrorInt::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Per-run list of non-fatal errors.
///
/// Every recorded error is logged; only the first [`Diagnostics::MAX_RETAINED`]
/// are kept for the run summary.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Error>,
    omitted: usize,
}

impl Diagnostics {
    pub const MAX_RETAINED: usize = 10_000;

    pub(crate) fn record(&mut self, e: Error) {
        log::warn!("{}", e);
        if self.entries.len() < Self::MAX_RETAINED {
            self.entries.push(e);
        } else {
            self.omitted += 1;
        }
    }

    /// Moves all entries of `other` into `self`.
    pub(crate) fn absorb(&mut self, other: Diagnostics) {
        for e in other.entries {
            if self.entries.len() < Self::MAX_RETAINED {
                self.entries.push(e);
            } else {
                self.omitted += 1;
            }
        }
        self.omitted += other.omitted;
    }

    pub fn entries(&self) -> &[Error] {
        &self.entries
    }

    /// Returns the number of recorded errors which weren't retained.
    pub fn omitted(&self) -> usize {
        self.omitted
    }

    pub fn count(&self, kind: ErrorKind) -> usize {
        self.entries.iter().filter(|e| e.kind() == kind).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.omitted == 0
    }
}
