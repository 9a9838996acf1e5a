// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Destinations for extracted access units.
//!
//! The extractor opens one [`TrackSink`] per track through a [`SinkFactory`]
//! and feeds it through an [`OrderedSink`], which guarantees non-decreasing
//! timestamps. [`FileSinkFactory`] writes raw elementary-stream files.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::codec::{AccessUnit, Framing, Parameters};
use crate::correlate::TrackDescriptor;
use crate::error::{Error, ErrorInt};
use crate::Timestamp;

/// How a track's extraction ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrackOutcome {
    /// The capture was read to its end.
    Completed,

    /// The run was stopped early.
    Cancelled,

    /// Writing failed; later units were dropped.
    Failed,
}

/// Receives one track's access units in non-decreasing timestamp order.
pub trait TrackSink: Send {
    fn write(&mut self, au: &AccessUnit) -> Result<(), Error>;

    /// Ends the track. Called exactly once, including after a failed `write`.
    fn finish(self: Box<Self>, outcome: TrackOutcome) -> Result<(), Error>;
}

/// Opens a [`TrackSink`] for each extracted track.
pub trait SinkFactory {
    fn open(
        &mut self,
        track: &TrackDescriptor,
        params: &Parameters,
    ) -> Result<Box<dyn TrackSink>, Error>;
}

/// Wraps a [`TrackSink`], attributing any unit whose timestamp precedes the
/// previous unit's (as with B-frames) the previous timestamp.
pub struct OrderedSink {
    inner: Box<dyn TrackSink>,
    last: Option<Timestamp>,
    clamped: u64,
}

impl OrderedSink {
    pub fn new(inner: Box<dyn TrackSink>) -> Self {
        OrderedSink {
            inner,
            last: None,
            clamped: 0,
        }
    }

    pub fn write(&mut self, mut au: AccessUnit) -> Result<(), Error> {
        if let Some(last) = self.last {
            if au.timestamp().timestamp() < last.timestamp() {
                debug!(
                    "{}: unit at {} precedes previous {}; using the latter",
                    au.start_ctx(),
                    au.timestamp(),
                    last
                );
                au.set_timestamp(last);
                self.clamped += 1;
            }
        }
        self.last = Some(au.timestamp());
        self.inner.write(&au)
    }

    /// Returns the number of units whose timestamps were adjusted.
    pub fn clamped(&self) -> u64 {
        self.clamped
    }

    pub fn finish(self, outcome: TrackOutcome) -> Result<(), Error> {
        self.inner.finish(outcome)
    }
}

/// Writes each track to `<dir>/<prefix><index>.<extension>`.
///
/// Tracks which don't complete are renamed to
/// `<prefix><index>.incomplete.<extension>`.
pub struct FileSinkFactory {
    dir: PathBuf,
    prefix: String,
}

impl FileSinkFactory {
    /// The directory must already exist.
    pub fn new(dir: PathBuf, prefix: String) -> Self {
        FileSinkFactory { dir, prefix }
    }

    fn path(&self, index: usize, incomplete: bool, extension: &str) -> PathBuf {
        let infix = if incomplete { ".incomplete" } else { "" };
        self.dir
            .join(format!("{}{}{}.{}", &self.prefix, index, infix, extension))
    }
}

impl SinkFactory for FileSinkFactory {
    fn open(
        &mut self,
        track: &TrackDescriptor,
        params: &Parameters,
    ) -> Result<Box<dyn TrackSink>, Error> {
        let path = self.path(track.index, false, params.extension());
        let incomplete_path = self.path(track.index, true, params.extension());
        let output_error = |source| {
            wrap!(ErrorInt::OutputError {
                track: track.index,
                path: path.clone(),
                source,
            })
        };
        let mut file = BufWriter::new(File::create(&path).map_err(output_error)?);
        let prefix = params.file_prefix();
        file.write_all(prefix).map_err(output_error)?;
        match params.pixel_dimensions() {
            Some((w, h)) => info!(
                "track {}: writing {} {}x{} to {}",
                track.index,
                params.encoding_name(),
                w,
                h,
                path.display()
            ),
            None => info!(
                "track {}: writing {} to {}",
                track.index,
                params.encoding_name(),
                path.display()
            ),
        }
        Ok(Box::new(FileSink {
            track: track.index,
            path,
            incomplete_path,
            file,
            params: params.clone(),
            units: 0,
            bytes: prefix.len() as u64,
        }))
    }
}

struct FileSink {
    track: usize,
    path: PathBuf,
    incomplete_path: PathBuf,
    file: BufWriter<File>,
    params: Parameters,
    units: u64,
    bytes: u64,
}

impl FileSink {
    fn error(&self, path: &Path, source: std::io::Error) -> Error {
        wrap!(ErrorInt::OutputError {
            track: self.track,
            path: path.to_owned(),
            source,
        })
    }
}

impl TrackSink for FileSink {
    fn write(&mut self, au: &AccessUnit) -> Result<(), Error> {
        let data = au.data();
        if let Framing::Adts(_) = self.params.framing() {
            match self.params.unit_header(data.len()) {
                Some(h) => {
                    self.file
                        .write_all(&h)
                        .map_err(|e| self.error(&self.path, e))?;
                    self.bytes += h.len() as u64;
                }
                None => {
                    warn!(
                        "track {}: {}-byte frame at {} is too large for ADTS; skipping",
                        self.track,
                        data.len(),
                        au.timestamp()
                    );
                    return Ok(());
                }
            }
        }
        self.file
            .write_all(data)
            .map_err(|e| self.error(&self.path, e))?;
        self.units += 1;
        self.bytes += data.len() as u64;
        Ok(())
    }

    fn finish(self: Box<Self>, outcome: TrackOutcome) -> Result<(), Error> {
        let FileSink {
            track,
            path,
            incomplete_path,
            file,
            units,
            bytes,
            ..
        } = *self;
        let flushed = file.into_inner().map(drop).map_err(|e| e.into_error());
        let final_path = if outcome == TrackOutcome::Completed {
            &path
        } else {
            std::fs::rename(&path, &incomplete_path).map_err(|source| {
                wrap!(ErrorInt::OutputError {
                    track,
                    path: incomplete_path.clone(),
                    source,
                })
            })?;
            &incomplete_path
        };
        if let Err(source) = flushed {
            bail!(ErrorInt::OutputError {
                track,
                path: final_path.clone(),
                source,
            });
        }
        info!(
            "track {}: {:?}; wrote {} units, {} bytes to {}",
            track,
            outcome,
            units,
            bytes,
            final_path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;

    use super::*;
    use crate::codec::Depacketizer;
    use crate::rtp::ReceivedPacketBuilder;
    use crate::testutil::{init_logging, timestamp};
    use crate::PacketContext;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rtspcap-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn descriptor(index: usize, sdp_media: usize) -> TrackDescriptor {
        let (sdp, _) = crate::sdp::parse(
            "test",
            include_bytes!("testdata/dahua_h264_aac.sdp"),
        );
        TrackDescriptor {
            index,
            media: sdp.medias[sdp_media].clone(),
            binding: crate::correlate::TransportBinding {
                client_rtp_port: 5000,
                server_rtp_port: None,
                ssrc: None,
                multicast: false,
                client_ip: "10.0.0.1".parse().unwrap(),
                server_ip: "10.0.0.2".parse().unwrap(),
            },
            control: None,
            connection: None,
            setup_ctx: PacketContext::dummy(),
        }
    }

    /// Returns the single unit a depacketizer produces from one packet.
    fn unit(d: &mut Depacketizer, ts: i64, payload: &[u8]) -> AccessUnit {
        let pkt = ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            stream_id: 0,
            timestamp: timestamp(ts, d.parameters().clock_rate()),
            ssrc: 0,
            sequence_number: 0,
            loss: 0,
            mark: true,
            payload_type: 96,
        }
        .build(payload.iter().copied())
        .unwrap();
        let mut out = Vec::new();
        d.consume(pkt, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        out.pop().unwrap()
    }

    #[derive(Clone, Default)]
    struct Recorded(Arc<Mutex<Vec<i64>>>);

    impl TrackSink for Recorded {
        fn write(&mut self, au: &AccessUnit) -> Result<(), Error> {
            self.0.lock().unwrap().push(au.timestamp().elapsed());
            Ok(())
        }

        fn finish(self: Box<Self>, _outcome: TrackOutcome) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn ordered_sink_clamps() {
        let mut d = Depacketizer::new("audio", "pcmu", 8_000, None, None).unwrap();
        let recorded = Recorded::default();
        let mut s = OrderedSink::new(Box::new(recorded.clone()));
        for ts in [160, 320, 240, 480] {
            s.write(unit(&mut d, ts, b"\xff")).unwrap();
        }
        assert_eq!(s.clamped(), 1);
        s.finish(TrackOutcome::Completed).unwrap();
        assert_eq!(*recorded.0.lock().unwrap(), [160, 320, 320, 480]);
    }

    #[test]
    fn h264_file() {
        init_logging();
        let dir = scratch_dir("h264_file");
        let track = descriptor(0, 0);
        let mut d = Depacketizer::for_media(&track.media).unwrap();
        let mut factory = FileSinkFactory::new(dir.clone(), "cam".to_owned());
        let mut sink = factory.open(&track, d.parameters()).unwrap();
        let idr = unit(&mut d, 0, b"\x65idr");
        sink.write(&idr).unwrap();
        sink.finish(TrackOutcome::Completed).unwrap();

        let written = std::fs::read(dir.join("cam0.h264")).unwrap();
        let prefix = d.parameters().extra_data().clone();
        assert!(written.starts_with(&prefix));
        assert_eq!(&written[prefix.len()..], b"\x00\x00\x00\x01\x65idr");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn aac_file_cancelled() {
        init_logging();
        let dir = scratch_dir("aac_file_cancelled");
        let track = descriptor(1, 1);
        let mut d = Depacketizer::for_media(&track.media).unwrap();
        let mut factory = FileSinkFactory::new(dir.clone(), "stream".to_owned());
        let mut sink = factory.open(&track, d.parameters()).unwrap();

        // One AU-header section with a single 13-bit size of 4, then the AU.
        let au = unit(&mut d, 0, b"\x00\x10\x00\x20abcd");
        assert_eq!(au.data(), &Bytes::from_static(b"abcd"));
        sink.write(&au).unwrap();
        sink.finish(TrackOutcome::Cancelled).unwrap();

        assert!(!dir.join("stream1.aac").exists());
        let written = std::fs::read(dir.join("stream1.incomplete.aac")).unwrap();
        assert_eq!(written.len(), 7 + 4);
        assert_eq!(&written[..2], b"\xff\xf1");
        assert_eq!(&written[7..], b"abcd");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unwritable() {
        let dir = std::env::temp_dir().join("rtspcap-does-not-exist/nested");
        let track = descriptor(0, 0);
        let d = Depacketizer::for_media(&track.media).unwrap();
        let e = FileSinkFactory::new(dir, "s".to_owned())
            .open(&track, d.parameters())
            .err()
            .unwrap();
        assert_eq!(e.kind(), crate::ErrorKind::FatalIo);
    }
}
