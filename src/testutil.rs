// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::time::Duration;

use bytes::Bytes;

use crate::capture::{CapturedPacket, TcpSegment};
use crate::rtp::RawPacketBuilder;
use crate::rtsp::{Event, Tracker};
use crate::{CaptureTime, Diagnostics, PacketContext, Timestamp};

pub(crate) fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

pub(crate) fn timestamp(timestamp: i64, clock_rate: u32) -> Timestamp {
    Timestamp::new(timestamp, NonZeroU32::new(clock_rate).unwrap(), 0).unwrap()
}

/// Builds a synthetic capture: an RTSP conversation over TCP plus RTP over UDP,
/// with frame numbers and capture times assigned in order.
pub(crate) struct RtspConversation {
    pub(crate) client: SocketAddr,
    pub(crate) server: SocketAddr,
    client_seq: u32,
    server_seq: u32,
    packets: Vec<CapturedPacket>,
}

impl RtspConversation {
    pub(crate) fn new() -> Self {
        Self::with_server_port(554)
    }

    pub(crate) fn with_server_port(port: u16) -> Self {
        RtspConversation {
            client: "10.0.0.1:50000".parse().unwrap(),
            server: SocketAddr::new("10.0.0.2".parse().unwrap(), port),
            client_seq: 1_000,
            server_seq: 0xffff_ff00, // wraps during longer conversations.
            packets: Vec::new(),
        }
    }

    fn next_ctx(&self) -> PacketContext {
        let frame = self.packets.len() as u64 + 1;
        PacketContext::new(
            frame,
            CaptureTime::from_unix(Duration::from_millis(1_700_000_000_000 + frame * 10)),
        )
    }

    fn tcp(&mut self, to_server: bool, payload: &[u8]) {
        let ctx = self.next_ctx();
        let (src, dst, seq) = if to_server {
            (self.client, self.server, &mut self.client_seq)
        } else {
            (self.server, self.client, &mut self.server_seq)
        };
        let segment = TcpSegment {
            sequence_number: *seq,
            syn: false,
            fin: false,
            rst: false,
        };
        *seq = seq.wrapping_add(payload.len() as u32);
        self.packets.push(CapturedPacket::tcp(
            ctx,
            src,
            dst,
            segment,
            Bytes::copy_from_slice(payload),
        ));
    }

    pub(crate) fn request(&mut self, text: &str) {
        self.tcp(true, text.as_bytes());
    }

    pub(crate) fn response(&mut self, text: &str) {
        self.tcp(false, text.as_bytes());
    }

    /// Adds a UDP datagram from the server's address to `client_port`.
    pub(crate) fn udp(&mut self, server_port: u16, client_port: u16, payload: Bytes) {
        let ctx = self.next_ctx();
        self.packets.push(CapturedPacket::udp(
            ctx,
            SocketAddr::new(self.server.ip(), server_port),
            SocketAddr::new(self.client.ip(), client_port),
            payload,
        ));
    }

    /// Adds an RTP packet from the server's address to `client_port`.
    pub(crate) fn rtp(
        &mut self,
        server_port: u16,
        client_port: u16,
        rtp: RawPacketBuilder,
        payload: &[u8],
    ) {
        let (raw, _) = rtp.build(payload.iter().copied()).unwrap();
        self.udp(server_port, client_port, raw.0);
    }

    pub(crate) fn into_packets(self) -> Vec<CapturedPacket> {
        self.packets
    }
}

/// Runs all packets of `conversation` through `tracker`.
pub(crate) fn rtsp_exchange(
    tracker: &mut Tracker,
    conversation: RtspConversation,
) -> (Vec<Event>, Diagnostics) {
    init_logging();
    let mut events = Vec::new();
    let mut diag = Diagnostics::default();
    for pkt in conversation.into_packets() {
        tracker.process(&pkt, &mut diag, &mut events);
    }
    (events, diag)
}
