// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One track's path from routed datagrams to its sink.

use std::ops::Range;

use bytes::Bytes;
use log::{debug, info};

use super::reorder::{Insert, Reorder};
use super::timeline::Timeline;
use crate::codec::{AccessUnit, Depacketizer};
use crate::correlate::TrackDescriptor;
use crate::error::ErrorInt;
use crate::rtp::{RawPacket, ReceivedPacket};
use crate::sink::{OrderedSink, TrackOutcome};
use crate::{Diagnostics, FlowContext, PacketContext};

/// A validated RTP packet waiting in the reorder window.
struct Pending {
    ctx: PacketContext,
    raw: RawPacket,
    payload_range: Range<u16>,
}

/// Statistics about one track, available after [`TrackPipeline::finish`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackReport {
    pub index: usize,
    pub encoding_name: &'static str,
    pub outcome: TrackOutcome,

    /// Datagrams routed to this track.
    pub packets: u64,

    /// Datagrams which weren't valid RTP.
    pub invalid_packets: u64,

    /// RTP packets with a payload type other than the negotiated one.
    pub foreign_payload_type: u64,
    pub duplicates: u64,
    pub late: u64,
    pub lost: u64,
    pub depacketize_errors: u64,
    pub units: u64,
    pub incomplete_units: u64,

    /// Units attributed the previous unit's timestamp to keep order.
    pub clamped_timestamps: u64,
}

/// Validates, reorders, and depacketizes one track's datagrams, writing the
/// resulting units to its sink.
///
/// Owned by exactly one thread at a time; all mutable per-track state lives here.
pub(crate) struct TrackPipeline {
    descriptor: TrackDescriptor,
    timeline: Timeline,
    reorder: Reorder<Pending>,
    depacketizer: Depacketizer,

    /// The negotiated payload type; packets of other types are skipped.
    payload_type: u8,

    /// Absent once writing has failed.
    sink: Option<OrderedSink>,
    failed: bool,
    ssrc: Option<u32>,

    /// Loss to credit to the next packet given to the depacketizer, from
    /// packets released by the reorder window but then skipped.
    carried_loss: u16,
    released: Vec<(u16, Pending)>,
    units: Vec<AccessUnit>,
    report: TrackReport,
    diag: Diagnostics,
}

impl TrackPipeline {
    pub(crate) fn new(
        descriptor: TrackDescriptor,
        payload_type: u8,
        timeline: Timeline,
        depacketizer: Depacketizer,
        sink: OrderedSink,
    ) -> Self {
        let report = TrackReport {
            index: descriptor.index,
            encoding_name: depacketizer.parameters().encoding_name(),
            outcome: TrackOutcome::Completed,
            packets: 0,
            invalid_packets: 0,
            foreign_payload_type: 0,
            duplicates: 0,
            late: 0,
            lost: 0,
            depacketize_errors: 0,
            units: 0,
            incomplete_units: 0,
            clamped_timestamps: 0,
        };
        TrackPipeline {
            descriptor,
            timeline,
            reorder: Reorder::default(),
            depacketizer,
            payload_type,
            sink: Some(sink),
            failed: false,
            ssrc: None,
            carried_loss: 0,
            released: Vec::new(),
            units: Vec::new(),
            report,
            diag: Diagnostics::default(),
        }
    }

    /// Handles a datagram routed to this track.
    pub(crate) fn push(&mut self, ctx: PacketContext, flow: FlowContext, data: Bytes) {
        self.report.packets += 1;
        if self.failed {
            return;
        }
        let (raw, payload_range) = match RawPacket::new(data) {
            Ok(r) => r,
            Err(e) => {
                self.report.invalid_packets += 1;
                self.diag.record(wrap!(ErrorInt::RtpPacketError {
                    pkt_ctx: ctx,
                    flow,
                    description: e.reason.to_owned(),
                    data: e.data,
                }));
                return;
            }
        };
        let ssrc = raw.ssrc();
        match self.ssrc {
            None => self.ssrc = Some(ssrc),
            Some(s) if s != ssrc => {
                info!(
                    "{}: track {} ssrc changed from {:08x} to {:08x}",
                    ctx, self.descriptor.index, s, ssrc
                );
                self.ssrc = Some(ssrc);

                // Finish the old source's buffered packets on its own timeline.
                self.reorder.reset(&mut self.released);
                self.depacketize_released();
                self.timeline.resync();
                if self.failed {
                    return;
                }
            }
            Some(_) => {}
        }
        let seq = raw.sequence_number();
        let pending = Pending {
            ctx,
            raw,
            payload_range,
        };
        match self.reorder.insert(seq, pending, &mut self.released) {
            Insert::Accepted => {}
            Insert::Duplicate => debug!(
                "{}: track {} dropping duplicate seq={:04x}",
                ctx, self.descriptor.index, seq
            ),
            Insert::Late => debug!(
                "{}: track {} dropping late seq={:04x}",
                ctx, self.descriptor.index, seq
            ),
        }
        self.depacketize_released();
    }

    fn depacketize_released(&mut self) {
        let mut released = std::mem::take(&mut self.released);
        for (loss, p) in released.drain(..) {
            let loss = loss.saturating_add(std::mem::take(&mut self.carried_loss));
            if p.raw.payload_type() != self.payload_type {
                self.report.foreign_payload_type += 1;
                debug!(
                    "{}: track {} skipping payload type {} (expecting {})",
                    p.ctx,
                    self.descriptor.index,
                    p.raw.payload_type(),
                    self.payload_type
                );
                self.carried_loss = loss;
                continue;
            }
            let ssrc = p.raw.ssrc();
            let sequence_number = p.raw.sequence_number();
            let result = self
                .timeline
                .advance_to(p.raw.timestamp())
                .and_then(|timestamp| {
                    let pkt = ReceivedPacket {
                        ctx: p.ctx,
                        stream_id: self.descriptor.index,
                        timestamp,
                        raw: p.raw,
                        payload_range: p.payload_range,
                        loss,
                    };
                    self.depacketizer.consume(pkt, &mut self.units)
                });
            if let Err(description) = result {
                self.report.depacketize_errors += 1;
                self.diag.record(wrap!(ErrorInt::DepacketizeError {
                    pkt_ctx: p.ctx,
                    track: self.descriptor.index,
                    ssrc,
                    sequence_number,
                    description,
                }));
            }
        }
        self.released = released;
        self.write_units();
    }

    fn write_units(&mut self) {
        for au in self.units.drain(..) {
            let Some(sink) = self.sink.as_mut() else {
                break;
            };
            self.report.units += 1;
            if !au.is_complete() {
                self.report.incomplete_units += 1;
            }
            if let Err(e) = sink.write(au) {
                self.diag.record(e);
                self.failed = true;
                if let Some(sink) = self.sink.take() {
                    self.report.clamped_timestamps = sink.clamped();
                    if let Err(e) = sink.finish(TrackOutcome::Failed) {
                        self.diag.record(e);
                    }
                }
            }
        }
    }

    /// Flushes buffered packets and the unit in progress, then finishes the sink.
    pub(crate) fn finish(mut self, cancelled: bool) -> (TrackReport, Diagnostics) {
        if !self.failed {
            self.reorder.flush(&mut self.released);
            self.depacketize_released();
        }
        if !self.failed {
            self.depacketizer.flush();
            while let Some(au) = self.depacketizer.pull() {
                self.units.push(au);
            }
            self.write_units();
        }
        let stats = self.reorder.stats();
        self.report.duplicates = stats.duplicates;
        self.report.late = stats.late;
        self.report.lost = stats.lost;
        self.report.outcome = if self.failed {
            TrackOutcome::Failed
        } else if cancelled {
            TrackOutcome::Cancelled
        } else {
            TrackOutcome::Completed
        };
        if let Some(sink) = self.sink.take() {
            self.report.clamped_timestamps = sink.clamped();
            if let Err(e) = sink.finish(self.report.outcome) {
                self.diag.record(e);
                self.report.outcome = TrackOutcome::Failed;
            }
        }
        (self.report, self.diag)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::correlate::TransportBinding;
    use crate::error::Error;
    use crate::rtp::RawPacketBuilder;
    use crate::sink::TrackSink;
    use crate::testutil::init_logging;
    use crate::Protocol;

    /// Records each unit's elapsed time.
    struct Elapsed(Arc<Mutex<Vec<i64>>>);

    impl TrackSink for Elapsed {
        fn write(&mut self, au: &AccessUnit) -> Result<(), Error> {
            self.0.lock().unwrap().push(au.timestamp().elapsed());
            Ok(())
        }

        fn finish(self: Box<Self>, _outcome: TrackOutcome) -> Result<(), Error> {
            Ok(())
        }
    }

    fn h264_pipeline(elapsed: &Arc<Mutex<Vec<i64>>>) -> TrackPipeline {
        let (sdp, _) =
            crate::sdp::parse("test", b"m=video 0 RTP/AVP 96\na=rtpmap:96 H264/90000\n");
        let descriptor = TrackDescriptor {
            index: 0,
            media: sdp.medias[0].clone(),
            binding: TransportBinding {
                client_rtp_port: 6970,
                server_rtp_port: None,
                ssrc: None,
                multicast: false,
                client_ip: "10.0.0.1".parse().unwrap(),
                server_ip: "10.0.0.2".parse().unwrap(),
            },
            control: None,
            connection: None,
            setup_ctx: PacketContext::dummy(),
        };
        let depacketizer = Depacketizer::for_media(&descriptor.media).unwrap();
        TrackPipeline::new(
            descriptor,
            96,
            Timeline::new(90_000).unwrap(),
            depacketizer,
            OrderedSink::new(Box::new(Elapsed(elapsed.clone()))),
        )
    }

    fn push(p: &mut TrackPipeline, ssrc: u32, seq: u16, ts: u32) {
        let (raw, _) = RawPacketBuilder {
            sequence_number: seq,
            timestamp: ts,
            payload_type: 96,
            ssrc,
            mark: true,
        }
        .build(*b"\x41p")
        .unwrap();
        let flow = FlowContext {
            protocol: Protocol::Udp,
            src: "10.0.0.2:9000".parse().unwrap(),
            dst: "10.0.0.1:6970".parse().unwrap(),
        };
        p.push(PacketContext::dummy(), flow, raw.data().clone());
    }

    /// A new source's timestamps, unrelated to the old one's, continue the
    /// timeline forward rather than being clamped to the old maximum.
    #[test]
    fn ssrc_change_keeps_timestamps_increasing() {
        init_logging();
        let elapsed = Arc::new(Mutex::new(Vec::new()));
        let mut p = h264_pipeline(&elapsed);
        for i in 0..3u16 {
            push(&mut p, 0x1111, i, u32::from(i) * 3_000);
        }

        // Far behind 6_000 by signed 32-bit delta.
        for i in 0..3u16 {
            push(&mut p, 0x2222, 1_000 + i, 4_000_000_000 + u32::from(i) * 3_000);
        }
        let (report, diag) = p.finish(false);
        assert!(diag.is_empty(), "{diag:?}");
        assert_eq!(report.units, 6);
        assert_eq!(report.clamped_timestamps, 0);
        assert_eq!(report.lost, 0);
        let elapsed = elapsed.lock().unwrap().clone();
        assert_eq!(elapsed.len(), 6);
        assert_eq!(&elapsed[..3], [0, 3_000, 6_000]);
        assert!(elapsed.windows(2).all(|w| w[0] < w[1]), "{elapsed:?}");
        assert_eq!(elapsed[4] - elapsed[3], 3_000);
    }

    #[test]
    fn foreign_payload_type_skipped() {
        init_logging();
        let elapsed = Arc::new(Mutex::new(Vec::new()));
        let mut p = h264_pipeline(&elapsed);
        push(&mut p, 0x1111, 0, 0);
        let (raw, _) = RawPacketBuilder {
            sequence_number: 1,
            timestamp: 3_000,
            payload_type: 97,
            ssrc: 0x1111,
            mark: true,
        }
        .build(*b"\x41p")
        .unwrap();
        let flow = FlowContext {
            protocol: Protocol::Udp,
            src: "10.0.0.2:9000".parse().unwrap(),
            dst: "10.0.0.1:6970".parse().unwrap(),
        };
        p.push(PacketContext::dummy(), flow, raw.data().clone());
        push(&mut p, 0x1111, 2, 6_000);
        let (report, _) = p.finish(false);
        assert_eq!(report.foreign_payload_type, 1);
        assert_eq!(report.units, 2);
        assert_eq!(*elapsed.lock().unwrap(), [0, 6_000]);
    }
}
