// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reads transport-layer packets from a capture file.
//!
//! Supports classic pcap and pcapng files with Ethernet, raw IP, Linux
//! "cooked" (SLL), and BSD loopback link types. Frames which aren't TCP or
//! UDP over IPv4/IPv6 are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use etherparse::{ether_type, InternetSlice, SlicedPacket, TransportSlice};
use log::{debug, trace, warn};
use pcap_file::pcap::PcapReader;
use pcap_file::pcapng::{Block, PcapNgReader};
use pcap_file::DataLink;

use crate::error::ErrorInt;
use crate::{CaptureTime, Error, FlowContext, PacketContext, Protocol};

const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

/// TCP header fields needed to reassemble a byte stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TcpSegment {
    pub sequence_number: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

/// A single transport-layer packet from the capture.
#[derive(Clone, Debug)]
pub struct CapturedPacket {
    pub ctx: PacketContext,
    pub flow: FlowContext,

    /// Present iff `flow.protocol` is [`Protocol::Tcp`].
    pub tcp: Option<TcpSegment>,

    /// The transport payload: UDP datagram body or TCP segment data.
    pub payload: Bytes,
}

impl CapturedPacket {
    /// Builds a UDP packet; used by tests and benchmarks.
    #[doc(hidden)]
    pub fn udp(ctx: PacketContext, src: SocketAddr, dst: SocketAddr, payload: Bytes) -> Self {
        Self {
            ctx,
            flow: FlowContext {
                protocol: Protocol::Udp,
                src,
                dst,
            },
            tcp: None,
            payload,
        }
    }

    /// Builds a TCP segment; used by tests and benchmarks.
    #[doc(hidden)]
    pub fn tcp(
        ctx: PacketContext,
        src: SocketAddr,
        dst: SocketAddr,
        segment: TcpSegment,
        payload: Bytes,
    ) -> Self {
        Self {
            ctx,
            flow: FlowContext {
                protocol: Protocol::Tcp,
                src,
                dst,
            },
            tcp: Some(segment),
            payload,
        }
    }
}

enum Format<R: Read> {
    Pcap {
        reader: PcapReader<R>,
        datalink: DataLink,
    },
    PcapNg {
        reader: PcapNgReader<R>,

        /// Link types of the interfaces described so far, by interface id.
        interfaces: Vec<DataLink>,
    },
}

/// Iterator over the TCP/UDP packets of a capture file.
///
/// Yields an error (then ends) if the file becomes unreadable partway. A
/// truncated final record is logged and ends iteration normally, as is common
/// for captures taken with a killed `tcpdump`.
pub struct PcapSource<R: Read> {
    path: PathBuf,
    format: Format<R>,
    frame: u64,
    done: bool,
}

impl PcapSource<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path).map_err(|e| {
            wrap!(ErrorInt::CaptureReadError {
                path: path.to_owned(),
                source: Box::new(e),
            })
        })?;
        Self::new(path.to_owned(), BufReader::new(file))
    }
}

impl<R: BufRead> PcapSource<R> {
    /// Creates a source from a reader, detecting pcap vs pcapng by magic number.
    /// `path` is used only for error messages.
    pub fn new(path: PathBuf, mut reader: R) -> Result<Self, Error> {
        let read_err = |path: &Path, source: Box<dyn std::error::Error + Send + Sync>| {
            wrap!(ErrorInt::CaptureReadError {
                path: path.to_owned(),
                source,
            })
        };
        let is_pcapng = match reader.fill_buf() {
            Ok(buf) => buf.starts_with(&PCAPNG_MAGIC),
            Err(e) => return Err(read_err(&path, Box::new(e))),
        };
        let format = if is_pcapng {
            let reader = PcapNgReader::new(reader).map_err(|e| read_err(&path, Box::new(e)))?;
            Format::PcapNg {
                reader,
                interfaces: Vec::new(),
            }
        } else {
            let reader = PcapReader::new(reader).map_err(|e| read_err(&path, Box::new(e)))?;
            let datalink = reader.header().datalink;
            debug!("{}: pcap with link type {:?}", path.display(), datalink);
            Format::Pcap { reader, datalink }
        };
        Ok(PcapSource {
            path,
            format,
            frame: 0,
            done: false,
        })
    }
}

/// Outcome of reading one capture record.
enum Record {
    Frame(CapturedPacket),
    Skipped,
    End,
}

impl<R: Read> PcapSource<R> {
    fn next_record(&mut self) -> Result<Record, pcap_file::PcapError> {
        match &mut self.format {
            Format::Pcap { reader, datalink } => {
                let pkt = match reader.next_packet() {
                    None => return Ok(Record::End),
                    Some(p) => p?,
                };
                self.frame += 1;
                let ctx = PacketContext::new(self.frame, CaptureTime::from_unix(pkt.timestamp));
                Ok(slice(ctx, *datalink, &pkt.data).map_or(Record::Skipped, Record::Frame))
            }
            Format::PcapNg { reader, interfaces } => {
                let block = match reader.next_block() {
                    None => return Ok(Record::End),
                    Some(b) => b?,
                };
                match block {
                    Block::InterfaceDescription(idb) => {
                        interfaces.push(idb.linktype);
                        Ok(Record::Skipped)
                    }
                    Block::EnhancedPacket(epb) => {
                        self.frame += 1;
                        let ctx =
                            PacketContext::new(self.frame, CaptureTime::from_unix(epb.timestamp));
                        let datalink = usize::try_from(epb.interface_id)
                            .ok()
                            .and_then(|i| interfaces.get(i).copied())
                            .unwrap_or(DataLink::ETHERNET);
                        Ok(slice(ctx, datalink, &epb.data).map_or(Record::Skipped, Record::Frame))
                    }
                    Block::SimplePacket(spb) => {
                        self.frame += 1;
                        let ctx = PacketContext::new(
                            self.frame,
                            CaptureTime::from_unix(std::time::Duration::ZERO),
                        );
                        let datalink = interfaces.first().copied().unwrap_or(DataLink::ETHERNET);
                        Ok(slice(ctx, datalink, &spb.data).map_or(Record::Skipped, Record::Frame))
                    }
                    _ => Ok(Record::Skipped),
                }
            }
        }
    }
}

impl<R: Read> Iterator for PcapSource<R> {
    type Item = Result<CapturedPacket, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.next_record() {
                Ok(Record::Frame(p)) => return Some(Ok(p)),
                Ok(Record::Skipped) => continue,
                Ok(Record::End) => self.done = true,
                Err(pcap_file::PcapError::IncompleteBuffer) => {
                    warn!(
                        "{}: truncated record after frame {}; ignoring remainder",
                        self.path.display(),
                        self.frame
                    );
                    self.done = true;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(wrap!(ErrorInt::CaptureReadError {
                        path: self.path.clone(),
                        source: Box::new(e),
                    })));
                }
            }
        }
        None
    }
}

/// Slices a link-layer frame down to its transport payload.
fn slice(ctx: PacketContext, datalink: DataLink, data: &[u8]) -> Option<CapturedPacket> {
    let sliced = match datalink {
        DataLink::ETHERNET => SlicedPacket::from_ethernet(data),
        DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => SlicedPacket::from_ip(data),
        DataLink::LINUX_SLL => {
            // The 16-byte header ends with the payload's ethertype.
            let protocol = u16::from_be_bytes([*data.get(14)?, *data.get(15)?]);
            if protocol != ether_type::IPV4 && protocol != ether_type::IPV6 {
                trace!("{ctx}: skipping cooked frame with protocol {protocol:04x}");
                return None;
            }
            SlicedPacket::from_ip(data.get(16..)?)
        }
        DataLink::NULL | DataLink::LOOP => SlicedPacket::from_ip(data.get(4..)?),
        other => {
            trace!("{ctx}: unsupported link type {other:?}");
            return None;
        }
    };
    let sliced = match sliced {
        Ok(s) => s,
        Err(e) => {
            trace!("{ctx}: unable to slice frame: {e:?}");
            return None;
        }
    };
    let (src_ip, dst_ip) = match sliced.ip.as_ref()? {
        InternetSlice::Ipv4(h, _) => (
            IpAddr::V4(h.source_addr()),
            IpAddr::V4(h.destination_addr()),
        ),
        InternetSlice::Ipv6(h, _) => (
            IpAddr::V6(h.source_addr()),
            IpAddr::V6(h.destination_addr()),
        ),
    };
    let payload = Bytes::copy_from_slice(sliced.payload);
    match sliced.transport.as_ref()? {
        TransportSlice::Udp(h) => Some(CapturedPacket::udp(
            ctx,
            SocketAddr::new(src_ip, h.source_port()),
            SocketAddr::new(dst_ip, h.destination_port()),
            payload,
        )),
        TransportSlice::Tcp(h) => Some(CapturedPacket::tcp(
            ctx,
            SocketAddr::new(src_ip, h.source_port()),
            SocketAddr::new(dst_ip, h.destination_port()),
            TcpSegment {
                sequence_number: h.sequence_number(),
                syn: h.syn(),
                fin: h.fin(),
                rst: h.rst(),
            },
            payload,
        )),
        _ => None,
    }
}
