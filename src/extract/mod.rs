// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Drives extraction of one capture: RTSP tracking, correlation, and
//! per-track depacketization into sinks.
//!
//! RTSP and correlation always run on the calling thread. Each track's
//! reordering, depacketization, and output happen inline by default, or on a
//! dedicated scoped thread per track with [`ExtractOptions::fast`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{Scope, ScopedJoinHandle};

use bytes::Bytes;
use crossbeam::channel::{self, Sender};
use log::{debug, info, warn};

use crate::capture::CapturedPacket;
use crate::codec::Depacketizer;
use crate::correlate::{Correlator, Counters, Route, TrackDescriptor};
use crate::error::{Error, ErrorInt};
use crate::rtsp::{Event, NegotiatedTrack, Tracker};
use crate::sink::{OrderedSink, SinkFactory};
use crate::{Diagnostics, FlowContext, PacketContext, Protocol};

pub mod reorder;
pub mod timeline;
mod track;

pub use track::TrackReport;

use timeline::Timeline;
use track::TrackPipeline;

/// Options which must be decided before extraction starts.
#[derive(Clone, Debug)]
pub struct ExtractOptions {
    backup_sdp: Option<(String, Bytes)>,
    fast: bool,
    rtsp_ports: Vec<u16>,
    channel_capacity: usize,
    stop: Arc<AtomicBool>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions {
            backup_sdp: None,
            fast: false,
            rtsp_ports: Vec::new(),
            channel_capacity: 1024,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ExtractOptions {
    /// Uses the given session description for `SETUP`s whose `DESCRIBE`
    /// wasn't captured. `origin` names it in diagnostics.
    pub fn backup_sdp(self, origin: String, body: Bytes) -> Self {
        Self {
            backup_sdp: Some((origin, body)),
            ..self
        }
    }

    /// Reads a backup session description from `path`.
    pub fn backup_sdp_file(self, path: &Path) -> Result<Self, Error> {
        let body = std::fs::read(path).map_err(|source| {
            wrap!(ErrorInt::BackupSdpReadError {
                path: path.to_owned(),
                source,
            })
        })?;
        Ok(self.backup_sdp(path.display().to_string(), body.into()))
    }

    /// Depacketizes each track on its own thread.
    pub fn fast(self, fast: bool) -> Self {
        Self { fast, ..self }
    }

    /// Treats these TCP ports as RTSP in addition to the defaults.
    pub fn rtsp_ports(self, rtsp_ports: Vec<u16>) -> Self {
        Self { rtsp_ports, ..self }
    }

    /// Sets how many packets may be queued for each track's thread in fast mode.
    pub fn channel_capacity(self, channel_capacity: usize) -> Self {
        Self {
            channel_capacity: channel_capacity.max(1),
            ..self
        }
    }

    /// Uses a caller-supplied flag to stop early. Setting it finishes every
    /// open track as [`crate::sink::TrackOutcome::Cancelled`].
    pub fn stop_flag(self, stop: Arc<AtomicBool>) -> Self {
        Self { stop, ..self }
    }
}

/// The results of [`Session::run`].
#[derive(Debug)]
pub struct Summary {
    /// Captured packets read.
    pub packets: u64,

    /// Extracted tracks, in track index order.
    pub tracks: Vec<TrackReport>,

    /// Indices of negotiated tracks which weren't extracted.
    pub skipped_tracks: Vec<usize>,
    pub counters: Counters,
    pub diagnostics: Diagnostics,
    pub cancelled: bool,

    /// An error which ended reading of the capture early. Everything before
    /// it was still extracted.
    pub capture_error: Option<Error>,
}

/// A packet routed to a track's thread.
struct Routed {
    ctx: PacketContext,
    flow: FlowContext,
    data: Bytes,
}

type Finished = (TrackReport, Diagnostics);

enum Lane<'scope> {
    Inline(Box<TrackPipeline>),
    Thread {
        tx: Sender<Routed>,
        handle: ScopedJoinHandle<'scope, Finished>,
    },
    Skipped,
}

/// State of one extraction run.
pub struct Session {
    options: ExtractOptions,
    tracker: Tracker,
    correlator: Correlator,
    diag: Diagnostics,
}

impl Session {
    pub fn new(options: ExtractOptions) -> Self {
        let mut tracker = Tracker::new(&options.rtsp_ports);
        let mut diag = Diagnostics::default();
        if let Some((origin, body)) = options.backup_sdp.as_ref() {
            let (sdp, errors) = crate::sdp::parse(origin, body);
            for e in errors {
                diag.record(e);
            }
            tracker.set_backup(sdp, origin.clone());
        }
        Session {
            options,
            tracker,
            correlator: Correlator::default(),
            diag,
        }
    }

    /// Returns the tracks negotiated so far.
    pub fn tracks(&self) -> &[TrackDescriptor] {
        self.correlator.tracks()
    }

    /// Reads `source` to its end (or until stopped), writing each track to a
    /// sink from `sinks`.
    ///
    /// Fails only if the very first read from `source` fails; later read
    /// errors are reported in [`Summary::capture_error`].
    pub fn run<I>(mut self, source: I, sinks: &mut dyn SinkFactory) -> Result<Summary, Error>
    where
        I: IntoIterator<Item = Result<CapturedPacket, Error>>,
    {
        if self.options.fast {
            std::thread::scope(|s| self.drive(source.into_iter(), sinks, Some(s)))
        } else {
            self.drive(source.into_iter(), sinks, None)
        }
    }

    fn drive<'scope, 'env, I>(
        &mut self,
        source: I,
        sinks: &mut dyn SinkFactory,
        scope: Option<&'scope Scope<'scope, 'env>>,
    ) -> Result<Summary, Error>
    where
        I: Iterator<Item = Result<CapturedPacket, Error>>,
    {
        let stop = self.options.stop.clone();
        let mut lanes: Vec<Lane<'scope>> = Vec::new();
        let mut events = Vec::new();
        let mut packets = 0u64;
        let mut cancelled = false;
        let mut capture_error = None;
        for item in source {
            if stop.load(Ordering::Relaxed) {
                info!("stopping after {packets} packets");
                cancelled = true;
                break;
            }
            let pkt = match item {
                Ok(p) => p,
                Err(e) if packets == 0 => return Err(e),
                Err(e) => {
                    capture_error = Some(e);
                    break;
                }
            };
            packets += 1;
            match pkt.flow.protocol {
                Protocol::Tcp => {
                    self.tracker.process(&pkt, &mut self.diag, &mut events);
                    for event in events.drain(..) {
                        match event {
                            Event::Presentation(p) => {
                                debug!("{}: presentation {}", pkt.ctx, &p.origin)
                            }
                            Event::Track(t) => self.open_track(&t, sinks, scope, &mut lanes),
                        }
                    }
                }
                Protocol::Udp => {
                    let route =
                        self.correlator
                            .route(&pkt.ctx, &pkt.flow, &pkt.payload, &mut self.diag);
                    if let Route::Track(i) = route {
                        if let Some(lane) = lanes.get_mut(i) {
                            push(lane, pkt);
                        }
                    }
                }
            }
        }
        self.tracker.finish();

        let mut tracks = Vec::new();
        let mut skipped_tracks = Vec::new();
        for (i, lane) in lanes.into_iter().enumerate() {
            let finished = match lane {
                Lane::Inline(p) => p.finish(cancelled),
                Lane::Thread { tx, handle } => {
                    drop(tx);
                    match handle.join() {
                        Ok(f) => f,
                        Err(panic) => std::panic::resume_unwind(panic),
                    }
                }
                Lane::Skipped => {
                    skipped_tracks.push(i);
                    continue;
                }
            };
            let (report, diag) = finished;
            self.diag.absorb(diag);
            tracks.push(report);
        }
        let cancelled = cancelled || stop.load(Ordering::Relaxed);
        let counters = self.correlator.counters();
        info!(
            "{} packets; {} tracks extracted, {} skipped; {} datagrams routed, {} rtcp, {} unroutable",
            packets,
            tracks.len(),
            skipped_tracks.len(),
            counters.routed,
            counters.rtcp,
            counters.unroutable
        );
        Ok(Summary {
            packets,
            tracks,
            skipped_tracks,
            counters,
            diagnostics: std::mem::take(&mut self.diag),
            cancelled,
            capture_error,
        })
    }

    /// Adds a negotiated track, starting its pipeline if it has a usable codec
    /// and sink. Every added track gets a lane so lane indices match track
    /// indices.
    fn open_track<'scope>(
        &mut self,
        t: &NegotiatedTrack,
        sinks: &mut dyn SinkFactory,
        scope: Option<&'scope Scope<'scope, '_>>,
        lanes: &mut Vec<Lane<'scope>>,
    ) {
        let Some(descriptor) = self.correlator.add(t).cloned() else {
            warn!(
                "{}: ignoring SETUP of media {} with no receive port",
                t.ctx, t.media.index
            );
            return;
        };
        let pipeline = match self.start_pipeline(descriptor, sinks) {
            Some(p) => p,
            None => {
                lanes.push(Lane::Skipped);
                return;
            }
        };
        let lane = match scope {
            None => Lane::Inline(Box::new(pipeline)),
            Some(s) => {
                let (tx, rx) = channel::bounded::<Routed>(self.options.channel_capacity);
                let stop = self.options.stop.clone();
                let mut pipeline = pipeline;
                let handle = s.spawn(move || {
                    for r in rx.iter() {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        pipeline.push(r.ctx, r.flow, r.data);
                    }
                    pipeline.finish(stop.load(Ordering::Relaxed))
                });
                Lane::Thread { tx, handle }
            }
        };
        lanes.push(lane);
    }

    fn start_pipeline(
        &mut self,
        descriptor: TrackDescriptor,
        sinks: &mut dyn SinkFactory,
    ) -> Option<TrackPipeline> {
        let unsupported = |description: String| {
            wrap!(ErrorInt::UnsupportedCodec {
                track: descriptor.index,
                media: descriptor.media.media.clone(),
                encoding_name: descriptor
                    .media
                    .encoding_name
                    .clone()
                    .or_else(|| descriptor.media.payload_type.map(|pt| format!("pt{pt}")))
                    .unwrap_or_else(|| "unknown".to_owned()),
                description,
            })
        };
        let Some(payload_type) = descriptor.media.payload_type else {
            self.diag
                .record(unsupported("no RTP payload type".to_owned()));
            return None;
        };
        let depacketizer = match Depacketizer::for_media(&descriptor.media) {
            Ok(d) => d,
            Err(description) => {
                self.diag.record(unsupported(description));
                return None;
            }
        };
        let timeline = match Timeline::new(depacketizer.parameters().clock_rate()) {
            Ok(t) => t,
            Err(description) => {
                self.diag.record(unsupported(description));
                return None;
            }
        };
        let sink = match sinks.open(&descriptor, depacketizer.parameters()) {
            Ok(s) => s,
            Err(e) => {
                self.diag.record(e);
                return None;
            }
        };
        Some(TrackPipeline::new(
            descriptor,
            payload_type,
            timeline,
            depacketizer,
            OrderedSink::new(sink),
        ))
    }
}

fn push(lane: &mut Lane<'_>, pkt: CapturedPacket) {
    match lane {
        Lane::Inline(p) => p.push(pkt.ctx, pkt.flow, pkt.payload),
        Lane::Thread { tx, .. } => {
            // Fails only if the thread is gone, which join reports.
            let _ = tx.send(Routed {
                ctx: pkt.ctx,
                flow: pkt.flow,
                data: pkt.payload,
            });
        }
        Lane::Skipped => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::codec::{AccessUnit, Parameters};
    use crate::rtp::RawPacketBuilder;
    use crate::sink::{TrackOutcome, TrackSink};
    use crate::testutil::{init_logging, RtspConversation};
    use crate::ErrorKind;

    const SDP: &str = "v=0\r\n\
                       o=- 0 0 IN IP4 10.0.0.2\r\n\
                       s=cam\r\n\
                       t=0 0\r\n\
                       m=video 0 RTP/AVP 96\r\n\
                       a=rtpmap:96 H264/90000\r\n\
                       a=control:trackID=0\r\n\
                       m=audio 0 RTP/AVP 0\r\n\
                       a=control:trackID=1\r\n\
                       m=application 0 RTP/AVP 107\r\n\
                       a=rtpmap:107 vnd.onvif.metadata/90000\r\n\
                       a=control:trackID=2\r\n";

    #[derive(Debug, PartialEq, Eq)]
    struct Unit {
        track: usize,
        elapsed: i64,
        complete: bool,
        data: Bytes,
    }

    #[derive(Default)]
    struct Collected {
        units: Vec<Unit>,
        outcomes: Vec<(usize, TrackOutcome)>,
    }

    /// Keeps every unit in memory; optionally sets a stop flag after some
    /// number of units.
    #[derive(Clone, Default)]
    struct MemorySinks {
        collected: Arc<Mutex<Collected>>,
        stop_after: Option<(usize, Arc<AtomicBool>)>,
    }

    impl MemorySinks {
        fn units(&self, track: usize) -> Vec<Unit> {
            let mut c = self.collected.lock().unwrap();
            let (mine, rest) = std::mem::take(&mut c.units)
                .into_iter()
                .partition(|u| u.track == track);
            c.units = rest;
            mine
        }

        fn outcomes(&self) -> Vec<(usize, TrackOutcome)> {
            let mut o = self.collected.lock().unwrap().outcomes.clone();
            o.sort_by_key(|&(i, _)| i);
            o
        }
    }

    struct MemorySink {
        track: usize,
        sinks: MemorySinks,
    }

    impl SinkFactory for MemorySinks {
        fn open(
            &mut self,
            track: &TrackDescriptor,
            _params: &Parameters,
        ) -> Result<Box<dyn TrackSink>, Error> {
            Ok(Box::new(MemorySink {
                track: track.index,
                sinks: self.clone(),
            }))
        }
    }

    impl TrackSink for MemorySink {
        fn write(&mut self, au: &AccessUnit) -> Result<(), Error> {
            let mut c = self.sinks.collected.lock().unwrap();
            c.units.push(Unit {
                track: self.track,
                elapsed: au.timestamp().elapsed(),
                complete: au.is_complete(),
                data: au.data().clone(),
            });
            if let Some((n, stop)) = &self.sinks.stop_after {
                if c.units.len() >= *n {
                    stop.store(true, Ordering::Relaxed);
                }
            }
            Ok(())
        }

        fn finish(self: Box<Self>, outcome: TrackOutcome) -> Result<(), Error> {
            self.sinks
                .collected
                .lock()
                .unwrap()
                .outcomes
                .push((self.track, outcome));
            Ok(())
        }
    }

    fn describe(c: &mut RtspConversation) {
        describe_sdp(c, SDP);
    }

    fn describe_sdp(c: &mut RtspConversation, sdp: &str) {
        c.request("DESCRIBE rtsp://10.0.0.2/live RTSP/1.0\r\nCSeq: 2\r\n\r\n");
        c.response(&format!(
            "RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Base: rtsp://10.0.0.2/live/\r\n\
             Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
            sdp.len(),
            sdp
        ));
    }

    fn setup(c: &mut RtspConversation, cseq: u32, track: usize, client_port: u16, server_port: u16) {
        c.request(&format!(
            "SETUP rtsp://10.0.0.2/live/trackID={track} RTSP/1.0\r\nCSeq: {cseq}\r\n\
             Transport: RTP/AVP;unicast;client_port={}-{}\r\n\r\n",
            client_port,
            client_port + 1
        ));
        c.response(&format!(
            "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nSession: 1\r\n\
             Transport: RTP/AVP;unicast;client_port={}-{};server_port={}-{}\r\n\r\n",
            client_port,
            client_port + 1,
            server_port,
            server_port + 1
        ));
    }

    fn video(c: &mut RtspConversation, seq: u16, ts: u32, payload: &[u8]) {
        c.rtp(
            9000,
            6970,
            RawPacketBuilder {
                sequence_number: seq,
                timestamp: ts,
                payload_type: 96,
                ssrc: 0x1234,
                mark: true,
            },
            payload,
        );
    }

    fn audio(c: &mut RtspConversation, seq: u16, ts: u32) {
        c.rtp(
            9002,
            6972,
            RawPacketBuilder {
                sequence_number: seq,
                timestamp: ts,
                payload_type: 0,
                ssrc: 0x5678,
                mark: false,
            },
            &[0xff; 160],
        );
    }

    fn run(
        packets: Vec<CapturedPacket>,
        options: ExtractOptions,
        sinks: &mut MemorySinks,
    ) -> Summary {
        init_logging();
        Session::new(options)
            .run(packets.into_iter().map(Ok), sinks)
            .unwrap()
    }

    /// Ten in-order single-NAL pictures.
    #[test]
    fn in_order_video() {
        let mut c = RtspConversation::new();
        describe(&mut c);
        setup(&mut c, 3, 0, 6970, 9000);
        for i in 0..10u16 {
            video(&mut c, 65530u16.wrapping_add(i), 4_294_960_000u32.wrapping_add(3_000 * u32::from(i)), b"\x41p");
        }
        let mut sinks = MemorySinks::default();
        let summary = run(c.into_packets(), ExtractOptions::default(), &mut sinks);
        assert!(summary.diagnostics.is_empty(), "{:?}", summary.diagnostics);
        assert_eq!(summary.tracks.len(), 1);
        assert_eq!(summary.tracks[0].units, 10);
        assert_eq!(summary.tracks[0].outcome, TrackOutcome::Completed);
        let units = sinks.units(0);
        assert_eq!(units.len(), 10);
        for (i, u) in units.iter().enumerate() {
            assert_eq!(u.elapsed, 3_000 * i as i64);
            assert!(u.complete);
            assert_eq!(&u.data[..], b"\x00\x00\x00\x01\x41p");
        }
        assert_eq!(sinks.outcomes(), [(0, TrackOutcome::Completed)]);
    }

    #[test]
    fn duplicates_and_reordering() {
        let mut c = RtspConversation::new();
        describe(&mut c);
        setup(&mut c, 3, 0, 6970, 9000);
        for seq in [0u16, 2, 2, 1, 3, 1, 4] {
            video(&mut c, seq, u32::from(seq) * 3_000, &[0x41, seq as u8]);
        }
        let mut sinks = MemorySinks::default();
        let summary = run(c.into_packets(), ExtractOptions::default(), &mut sinks);
        let r = &summary.tracks[0];
        assert_eq!(r.units, 5);
        assert_eq!(r.duplicates, 1);
        assert_eq!(r.late, 1);
        assert_eq!(r.lost, 0);
        let data: Vec<u8> = sinks.units(0).iter().map(|u| u.data[5]).collect();
        assert_eq!(data, [0, 1, 2, 3, 4]);
    }

    /// Packets whose slots were already released, whether delivered or
    /// given up on, produce nothing.
    #[test]
    fn late_retransmission_dropped() {
        let mut c = RtspConversation::new();
        describe(&mut c);
        setup(&mut c, 3, 0, 6970, 9000);
        for seq in [0u16, 1, 2, 3, 1] {
            video(&mut c, seq, u32::from(seq) * 3_000, &[0x41, seq as u8]);
        }

        // 4 is missing until enough later packets force the window past it.
        for seq in 5u16..=55 {
            video(&mut c, seq, u32::from(seq) * 3_000, &[0x41, seq as u8]);
        }
        video(&mut c, 4, 4 * 3_000, &[0x41, 4]);
        let mut sinks = MemorySinks::default();
        let summary = run(c.into_packets(), ExtractOptions::default(), &mut sinks);
        let r = &summary.tracks[0];
        assert_eq!(r.packets, 57);
        assert_eq!(r.late, 2);
        assert_eq!(r.duplicates, 0);
        assert_eq!(r.lost, 1);
        assert_eq!(r.units, 55);
        let units = sinks.units(0);
        let seqs: Vec<u8> = units.iter().map(|u| u.data[5]).collect();
        let expected: Vec<u8> = (0u8..=3).chain(5..=55).collect();
        assert_eq!(seqs, expected);

        // Only the unit right after the hole is suspect.
        let incomplete: Vec<u8> = units
            .iter()
            .filter(|u| !u.complete)
            .map(|u| u.data[5])
            .collect();
        assert_eq!(incomplete, [5]);
    }

    /// H.265 aggregation and fragmentation through the whole pipeline,
    /// with the fragments swapped in transit.
    #[test]
    fn h265_session() {
        const H265_SDP: &str = "v=0\r\n\
                                o=- 0 0 IN IP4 10.0.0.2\r\n\
                                s=cam\r\n\
                                t=0 0\r\n\
                                m=video 0 RTP/AVP 96\r\n\
                                a=rtpmap:96 H265/90000\r\n\
                                a=control:trackID=0\r\n";
        let mut c = RtspConversation::new();
        describe_sdp(&mut c, H265_SDP);
        setup(&mut c, 3, 0, 6970, 9000);
        let pkt = |c: &mut RtspConversation, seq: u16, ts: u32, mark: bool, payload: &[u8]| {
            c.rtp(
                9000,
                6970,
                RawPacketBuilder {
                    sequence_number: seq,
                    timestamp: ts,
                    payload_type: 96,
                    ssrc: 0x4321,
                    mark,
                },
                payload,
            )
        };
        pkt(
            &mut c,
            0,
            0,
            false,
            b"\x60\x01\x00\x0a\x4e\x01stap-a 1\x00\x0a\x4e\x01stap-a 2",
        );
        pkt(&mut c, 2, 0, true, b"\x62\x01\x54fu end");
        pkt(&mut c, 1, 0, false, b"\x62\x01\x94fu start, ");
        pkt(&mut c, 3, 3_000, true, b"\x02\x01slice");
        let mut sinks = MemorySinks::default();
        let summary = run(c.into_packets(), ExtractOptions::default(), &mut sinks);
        assert!(summary.diagnostics.is_empty(), "{:?}", summary.diagnostics);
        assert_eq!(summary.tracks[0].encoding_name, "h265");
        assert_eq!(summary.tracks[0].lost, 0);
        let units = sinks.units(0);
        assert_eq!(units.len(), 2);
        assert_eq!(
            &units[0].data[..],
            b"\x00\x00\x00\x01\x4e\x01stap-a 1\
              \x00\x00\x00\x01\x4e\x01stap-a 2\
              \x00\x00\x00\x01\x28\x01fu start, fu end"
        );
        assert!(units[0].complete);
        assert_eq!(units[1].elapsed, 3_000);
        assert_eq!(&units[1].data[..], b"\x00\x00\x00\x01\x02\x01slice");
        assert!(units[1].complete);
    }

    #[test]
    fn unmatched_packets_tolerated() {
        let mut c = RtspConversation::new();
        video(&mut c, 0, 0, b"\x41early"); // before any SETUP
        describe(&mut c);
        setup(&mut c, 3, 0, 6970, 9000);
        c.udp(9000, 40_000, Bytes::from_static(b"not rtp at all"));
        c.rtp(
            9000,
            41_000,
            RawPacketBuilder {
                sequence_number: 0,
                timestamp: 0,
                payload_type: 96,
                ssrc: 1,
                mark: true,
            },
            b"stray",
        );
        video(&mut c, 1, 3_000, b"\x41p");
        let mut sinks = MemorySinks::default();
        let summary = run(c.into_packets(), ExtractOptions::default(), &mut sinks);
        assert_eq!(summary.counters.unroutable, 3);
        assert_eq!(summary.counters.routed, 1);

        // One warning per RTP-like destination port.
        assert_eq!(summary.diagnostics.count(ErrorKind::Correlation), 2);
        assert_eq!(sinks.units(0).len(), 1);
    }

    #[test]
    fn backup_sdp() {
        let options = || {
            ExtractOptions::default()
                .backup_sdp("backup.sdp".to_owned(), Bytes::from_static(SDP.as_bytes()))
        };

        let mut c = RtspConversation::new();
        setup(&mut c, 3, 0, 6970, 9000);
        video(&mut c, 0, 0, b"\x65idr");
        let mut sinks = MemorySinks::default();
        let summary = run(c.into_packets(), options(), &mut sinks);
        assert_eq!(summary.tracks.len(), 1);
        assert_eq!(sinks.units(0).len(), 1);

        // Without any SETUP, nothing is extracted, but it's still a success.
        let mut c = RtspConversation::new();
        video(&mut c, 0, 0, b"\x65idr");
        let mut sinks = MemorySinks::default();
        let summary = run(c.into_packets(), options(), &mut sinks);
        assert!(summary.tracks.is_empty());
        assert_eq!(summary.counters.unroutable, 1);
        assert!(sinks.outcomes().is_empty());
    }

    #[test]
    fn unsupported_codec_skipped() {
        let mut c = RtspConversation::new();
        describe(&mut c);
        setup(&mut c, 3, 2, 6974, 9004);
        setup(&mut c, 4, 0, 6970, 9000);
        video(&mut c, 0, 0, b"\x65idr");
        let mut sinks = MemorySinks::default();
        let summary = run(c.into_packets(), ExtractOptions::default(), &mut sinks);
        assert_eq!(summary.skipped_tracks, [0]);
        assert_eq!(summary.tracks.len(), 1);
        assert_eq!(summary.tracks[0].index, 1);
        assert_eq!(summary.diagnostics.count(ErrorKind::UnsupportedCodec), 1);
        assert_eq!(sinks.units(1).len(), 1);
    }

    /// A dynamic payload type with no `a=rtpmap` is named by its number.
    #[test]
    fn unmapped_payload_type_skipped() {
        const UNMAPPED_SDP: &str = "v=0\r\n\
                                    o=- 0 0 IN IP4 10.0.0.2\r\n\
                                    s=cam\r\n\
                                    t=0 0\r\n\
                                    m=video 0 RTP/AVP 98\r\n\
                                    a=control:trackID=0\r\n";
        let mut c = RtspConversation::new();
        describe_sdp(&mut c, UNMAPPED_SDP);
        setup(&mut c, 3, 0, 6970, 9000);
        video(&mut c, 0, 0, b"\x65idr");
        let mut sinks = MemorySinks::default();
        let summary = run(c.into_packets(), ExtractOptions::default(), &mut sinks);
        assert_eq!(summary.skipped_tracks, [0]);
        assert!(summary.tracks.is_empty());
        let e = summary
            .diagnostics
            .entries()
            .iter()
            .find(|e| e.kind() == ErrorKind::UnsupportedCodec)
            .unwrap();
        assert!(e.to_string().contains("video/pt98"), "{e}");
        assert!(sinks.outcomes().is_empty());
    }

    /// A lost middle fragment leaves an incomplete unit; extraction continues.
    #[test]
    fn loss_tolerated() {
        let mut c = RtspConversation::new();
        describe(&mut c);
        setup(&mut c, 3, 0, 6970, 9000);
        let fu = |c: &mut RtspConversation, seq: u16, ts: u32, mark: bool, payload: &[u8]| {
            c.rtp(
                9000,
                6970,
                RawPacketBuilder {
                    sequence_number: seq,
                    timestamp: ts,
                    payload_type: 96,
                    ssrc: 0x1234,
                    mark,
                },
                payload,
            )
        };
        fu(&mut c, 0, 0, false, b"\x7c\x85start ");
        // seq 1, the middle fragment, is missing.
        fu(&mut c, 2, 0, true, b"\x7c\x45end");
        fu(&mut c, 3, 3_000, true, b"\x41next");
        let mut sinks = MemorySinks::default();
        let summary = run(c.into_packets(), ExtractOptions::default(), &mut sinks);
        assert_eq!(summary.tracks[0].lost, 1);
        let units = sinks.units(0);
        assert_eq!(units.len(), 2);
        assert!(!units[0].complete);
        assert!(units[1].complete);
        assert_eq!(&units[1].data[..], b"\x00\x00\x00\x01\x41next");
    }

    fn two_tracks() -> Vec<CapturedPacket> {
        let mut c = RtspConversation::new();
        describe(&mut c);
        setup(&mut c, 3, 0, 6970, 9000);
        setup(&mut c, 4, 1, 6972, 9002);
        for i in 0..40u16 {
            // Swap neighbors now and then.
            let seq = if i % 7 == 3 { i + 1 } else if i % 7 == 4 { i - 1 } else { i };
            video(&mut c, seq, u32::from(seq) * 3_000, &[0x41, seq as u8]);
            audio(&mut c, i, u32::from(i) * 160);
        }
        c.into_packets()
    }

    #[test]
    fn fast_matches_inline() {
        let mut inline = MemorySinks::default();
        let a = run(two_tracks(), ExtractOptions::default(), &mut inline);
        let mut fast = MemorySinks::default();
        let b = run(
            two_tracks(),
            ExtractOptions::default().fast(true).channel_capacity(4),
            &mut fast,
        );
        assert_eq!(a.tracks, b.tracks);
        assert_eq!(a.counters, b.counters);
        for track in 0..2 {
            let units = inline.units(track);
            assert_eq!(units.len(), 40);
            assert_eq!(units, fast.units(track));
        }
        assert_eq!(inline.outcomes(), fast.outcomes());
    }

    #[test]
    fn cancellation() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut sinks = MemorySinks {
            stop_after: Some((10, stop.clone())),
            ..Default::default()
        };
        let summary = run(
            two_tracks(),
            ExtractOptions::default().stop_flag(stop),
            &mut sinks,
        );
        assert!(summary.cancelled);
        assert!(summary.packets < 80);
        assert_eq!(
            sinks.outcomes(),
            [(0, TrackOutcome::Cancelled), (1, TrackOutcome::Cancelled)]
        );
    }

    #[test]
    fn missing_backup_sdp() {
        let e = ExtractOptions::default()
            .backup_sdp_file(Path::new("/nonexistent/backup.sdp"))
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::FatalIo);
    }

    #[test]
    fn capture_errors() {
        init_logging();
        let err = || {
            wrap!(ErrorInt::CaptureReadError {
                path: "x.pcap".into(),
                source: "truncated".into(),
            })
        };
        let mut sinks = MemorySinks::default();
        let e = Session::new(ExtractOptions::default())
            .run(vec![Err(err())], &mut sinks)
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::FatalIo);

        let mut packets: Vec<_> = two_tracks().into_iter().map(Ok).collect();
        packets.truncate(20);
        packets.push(Err(err()));
        let summary = Session::new(ExtractOptions::default())
            .run(packets, &mut sinks)
            .unwrap();
        assert_eq!(summary.packets, 20);
        assert!(summary.capture_error.is_some());
        assert_eq!(
            sinks.outcomes(),
            [(0, TrackOutcome::Completed), (1, TrackOutcome::Completed)]
        );
    }
}
