// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Binds negotiated tracks to UDP ports and routes captured datagrams to them.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use log::{debug, info, warn};
use url::Url;

use crate::error::ErrorInt;
use crate::rtsp::NegotiatedTrack;
use crate::sdp::MediaDescription;
use crate::{Diagnostics, FlowContext, PacketContext};

/// Where a track's RTP is expected to arrive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportBinding {
    /// The receiving RTP port: the client's, or the multicast group's.
    pub client_rtp_port: u16,

    /// The server's sending RTP port, when negotiated.
    pub server_rtp_port: Option<u16>,

    /// The SSRC announced in the `Transport` header, if any.
    pub ssrc: Option<u32>,
    pub multicast: bool,
    pub client_ip: IpAddr,
    pub server_ip: IpAddr,
}

impl TransportBinding {
    /// RTCP conventionally uses the next port up.
    pub fn client_rtcp_port(&self) -> Option<u16> {
        self.client_rtp_port.checked_add(1)
    }
}

/// A negotiated, routable track. Immutable once created.
#[derive(Clone, Debug)]
pub struct TrackDescriptor {
    /// 0-based, in order of negotiation. Stable for the run.
    pub index: usize,
    pub media: MediaDescription,
    pub binding: TransportBinding,
    pub control: Option<Url>,

    /// The RTSP connection which negotiated this track, oriented client to
    /// server. Absent for tracks not learned from RTSP.
    pub connection: Option<FlowContext>,
    pub setup_ctx: PacketContext,
}

impl TrackDescriptor {
    /// Creates a descriptor from a successful `SETUP`, or `None` if it has no
    /// receive port.
    pub fn from_negotiated(index: usize, t: &NegotiatedTrack) -> Option<Self> {
        let client_rtp_port = t.transport.receive_rtp_port()?;
        let client_ip = match (t.transport.multicast, t.transport.destination) {
            (true, Some(d)) => d,
            _ => t.client_ip(),
        };
        Some(TrackDescriptor {
            index,
            media: t.media.clone(),
            binding: TransportBinding {
                client_rtp_port,
                server_rtp_port: t.transport.server_port.map(|(rtp, _)| rtp),
                ssrc: t.transport.ssrc,
                multicast: t.transport.multicast,
                client_ip,
                server_ip: t.server_ip(),
            },
            control: t.control.clone(),
            connection: Some(t.connection),
            setup_ctx: t.ctx,
        })
    }
}

/// The result of [`Correlator::route`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// RTP for the track with this index.
    Track(usize),

    /// RTCP associated with this track; skipped.
    Rtcp(usize),
    Unroutable,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub routed: u64,
    pub rtcp: u64,
    pub unroutable: u64,
}

/// How firmly a track is associated with an SSRC.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Pin {
    /// Announced in `SETUP` but not yet seen. Some servers announce one SSRC
    /// and send another, so the first packet may override this.
    Negotiated(u32),
    Observed(u32),
}

/// The run's track table plus routing state.
#[derive(Default)]
pub struct Correlator {
    tracks: Vec<TrackDescriptor>,
    pins: Vec<Option<Pin>>,

    /// Receive RTP port to track indices, oldest first.
    by_rtp_port: HashMap<u16, Vec<usize>>,
    by_rtcp_port: HashMap<u16, Vec<usize>>,
    warned_ports: HashSet<u16>,
    counters: Counters,
}

impl Correlator {
    pub fn tracks(&self) -> &[TrackDescriptor] {
        &self.tracks
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Adds a track, returning its descriptor.
    ///
    /// Returns `None` if the negotiation is unusable (no receive port).
    pub fn add(&mut self, t: &NegotiatedTrack) -> Option<&TrackDescriptor> {
        let index = self.tracks.len();
        let d = TrackDescriptor::from_negotiated(index, t)?;
        let port = d.binding.client_rtp_port;
        info!(
            "track {}: media {} {}/{} on port {}{}",
            index,
            d.media.index,
            &d.media.media,
            d.media.encoding_name.as_deref().unwrap_or("?"),
            port,
            d.binding
                .ssrc
                .map(|s| format!(", ssrc {s:08x}"))
                .unwrap_or_default()
        );
        self.by_rtp_port.entry(port).or_default().push(index);
        if let Some(rtcp) = d.binding.client_rtcp_port() {
            self.by_rtcp_port.entry(rtcp).or_default().push(index);
        }
        self.pins.push(d.binding.ssrc.map(Pin::Negotiated));
        self.tracks.push(d);
        self.tracks.last()
    }

    /// Routes a UDP datagram by its addressing and (if it looks like RTP)
    /// its payload type and SSRC.
    ///
    /// The first RTP-like datagram to each unroutable port is recorded in `diag`.
    pub fn route(
        &mut self,
        ctx: &PacketContext,
        flow: &FlowContext,
        payload: &[u8],
        diag: &mut Diagnostics,
    ) -> Route {
        let route = self.route_inner(ctx, flow, payload);
        match route {
            Route::Track(_) => self.counters.routed += 1,
            Route::Rtcp(_) => self.counters.rtcp += 1,
            Route::Unroutable => {
                self.counters.unroutable += 1;
                if let Some((_, ssrc)) = peek_rtp(payload) {
                    if self.warned_ports.insert(flow.dst.port()) {
                        diag.record(wrap!(ErrorInt::UnroutablePacket {
                            pkt_ctx: *ctx,
                            flow: *flow,
                            ssrc,
                        }));
                    }
                }
            }
        }
        route
    }

    fn route_inner(&mut self, ctx: &PacketContext, flow: &FlowContext, payload: &[u8]) -> Route {
        let port = flow.dst.port();
        let Some(on_port) = self.by_rtp_port.get(&port) else {
            return match self.by_rtcp_port.get(&port).and_then(|v| v.last()) {
                Some(&i) => Route::Rtcp(i),
                None => Route::Unroutable,
            };
        };
        let candidates: Vec<usize> = on_port
            .iter()
            .copied()
            .filter(|&i| {
                let b = &self.tracks[i].binding;
                b.server_rtp_port.map_or(true, |p| p == flow.src.port())
            })
            .collect();
        let Some(&newest) = candidates.last() else {
            return Route::Unroutable;
        };
        let Some((payload_type, ssrc)) = peek_rtp(payload) else {
            // Not plausibly RTP; let the track's RTP validation report it.
            return Route::Track(newest);
        };
        if crate::rtp::is_rtcp_payload_type(payload_type) {
            return Route::Rtcp(newest); // RTCP multiplexed on the RTP port.
        }

        // An existing firm association wins.
        if let Some(&i) = candidates
            .iter()
            .rev()
            .find(|&&i| self.pins[i] == Some(Pin::Observed(ssrc)))
        {
            return Route::Track(i);
        }
        if let Some(&i) = candidates
            .iter()
            .rev()
            .find(|&&i| self.pins[i] == Some(Pin::Negotiated(ssrc)))
        {
            self.pins[i] = Some(Pin::Observed(ssrc));
            return Route::Track(i);
        }

        // Otherwise, the newest track not yet receiving another stream.
        for &i in candidates.iter().rev() {
            match self.pins[i] {
                None => {
                    debug!("{ctx}: track {i} is ssrc {ssrc:08x}");
                    self.pins[i] = Some(Pin::Observed(ssrc));
                    return Route::Track(i);
                }
                Some(Pin::Negotiated(n)) => {
                    warn!(
                        "{ctx}: track {i} negotiated ssrc {n:08x} but receives {ssrc:08x}; \
                         using the latter"
                    );
                    self.pins[i] = Some(Pin::Observed(ssrc));
                    return Route::Track(i);
                }
                Some(Pin::Observed(_)) => {}
            }
        }
        Route::Unroutable
    }
}

/// Returns the payload type and SSRC of a plausible RTP version 2 packet.
fn peek_rtp(payload: &[u8]) -> Option<(u8, u32)> {
    if payload.len() < 12 || payload[0] >> 6 != 2 {
        return None;
    }
    let ssrc = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
    Some((payload[1] & 0x7f, ssrc))
}
