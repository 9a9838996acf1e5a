// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Follows captured RTSP conversations to learn what media was negotiated.
//!
//! The [`Tracker`] reassembles each RTSP connection's TCP byte streams,
//! matches responses to requests by `CSeq`, and reports:
//!
//! *   a [`Presentation`] for each successful `DESCRIBE`, holding the parsed
//!     session description.
//! *   a [`NegotiatedTrack`] for each successful `SETUP` with UDP transport,
//!     binding a media description to the ports the RTP will arrive on.
//!
//! Requests are frequently missing from captures (taken mid-session, or on a
//! span port that dropped some packets). An unmatched successful response is
//! classified by its headers instead.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info};
use rtsp_types::{headers, Message, Method};
use url::Url;

use crate::capture::CapturedPacket;
use crate::error::ErrorInt;
use crate::sdp::{self, MediaDescription, SdpSession};
use crate::{Diagnostics, FlowContext, PacketContext};

mod stream;
mod transport;

use stream::{Chunk, HalfConnection};
pub use transport::{LowerTransport, SessionHeader, Transport};

/// TCP ports assumed to carry RTSP, as Wireshark does.
pub const DEFAULT_PORTS: [u16; 3] = [554, 8554, 7236];

/// A session description and the URL its control attributes are relative to.
#[derive(Debug)]
pub struct Presentation {
    pub sdp: SdpSession,

    /// The base for relative control URLs, absent for a backup description.
    pub base_url: Option<Url>,

    /// Where this came from, for diagnostics: a packet context or file name.
    pub origin: String,
}

impl Presentation {
    /// Returns the absolute control URL of `media`, if one can be formed.
    pub fn control_url(&self, media: &MediaDescription) -> Option<Url> {
        let control = media.control.as_deref()?;
        if let Ok(u) = Url::parse(control) {
            return Some(u);
        }
        self.base_url
            .as_ref()
            .and_then(|base| sdp::join_control(base, control).ok())
    }
}

/// A successful UDP `SETUP`.
#[derive(Clone, Debug)]
pub struct NegotiatedTrack {
    pub presentation: Arc<Presentation>,
    pub media: MediaDescription,
    pub control: Option<Url>,

    /// The response's transport, with fields it omitted filled from the request.
    pub transport: Transport,

    /// The RTSP connection, oriented client to server.
    pub connection: FlowContext,
    pub session: Option<SessionHeader>,

    /// The `SETUP` response.
    pub ctx: PacketContext,
}

impl NegotiatedTrack {
    pub fn client_ip(&self) -> IpAddr {
        self.connection.src.ip()
    }

    pub fn server_ip(&self) -> IpAddr {
        self.transport
            .source
            .unwrap_or_else(|| self.connection.dst.ip())
    }
}

#[derive(Debug)]
pub enum Event {
    Presentation(Arc<Presentation>),
    Track(NegotiatedTrack),
}

/// An outstanding request, awaiting the response with the same `CSeq`.
struct PendingRequest {
    method: Method,
    url: Option<Url>,
    transport: Option<Transport>,
}

struct Connection {
    /// Oriented client to server.
    flow: FlowContext,
    to_server: HalfConnection,
    to_client: HalfConnection,
    pending: HashMap<u32, PendingRequest>,

    /// The most recent presentation described on this connection.
    presentation: Option<Arc<Presentation>>,

    /// Successful `SETUP` responses since `presentation` was set.
    setups: usize,
    interleaved_frames: u64,
}

impl Connection {
    fn new(flow: FlowContext) -> Self {
        Connection {
            flow,
            to_server: HalfConnection::default(),
            to_client: HalfConnection::default(),
            pending: HashMap::new(),
            presentation: None,
            setups: 0,
            interleaved_frames: 0,
        }
    }
}

/// Presentations shared across connections.
#[derive(Default)]
struct Presentations {
    latest: Option<Arc<Presentation>>,
    backup: Option<Arc<Presentation>>,
}

/// Follows all RTSP connections in a capture.
pub struct Tracker {
    ports: Vec<u16>,
    connections: HashMap<(SocketAddr, SocketAddr), Connection>,

    /// TCP connections judged not to be RTSP.
    ignored: HashSet<(SocketAddr, SocketAddr)>,
    presentations: Presentations,
}

impl Tracker {
    /// Creates a tracker treating `extra_ports` as RTSP in addition to [`DEFAULT_PORTS`].
    pub fn new(extra_ports: &[u16]) -> Self {
        let mut ports = DEFAULT_PORTS.to_vec();
        ports.extend_from_slice(extra_ports);
        ports.sort_unstable();
        ports.dedup();
        Tracker {
            ports,
            connections: HashMap::new(),
            ignored: HashSet::new(),
            presentations: Presentations::default(),
        }
    }

    /// Supplies a session description to use for `SETUP`s on connections
    /// where no `DESCRIBE` was captured.
    pub fn set_backup(&mut self, sdp: SdpSession, origin: String) {
        info!(
            "backup session description {} has {} media",
            &origin,
            sdp.medias.len()
        );
        self.presentations.backup = Some(Arc::new(Presentation {
            sdp,
            base_url: None,
            origin,
        }));
    }

    /// Returns the most recently described presentation, or the backup.
    pub fn presentation(&self) -> Option<&Arc<Presentation>> {
        self.presentations
            .latest
            .as_ref()
            .or(self.presentations.backup.as_ref())
    }

    /// Processes a captured packet.
    ///
    /// Returns true if the packet belonged to an RTSP connection (and so
    /// shouldn't be considered as RTP).
    pub fn process(
        &mut self,
        pkt: &CapturedPacket,
        diag: &mut Diagnostics,
        events: &mut Vec<Event>,
    ) -> bool {
        let Some(tcp) = pkt.tcp else { return false };
        let key = if pkt.flow.src <= pkt.flow.dst {
            (pkt.flow.src, pkt.flow.dst)
        } else {
            (pkt.flow.dst, pkt.flow.src)
        };
        if self.ignored.contains(&key) {
            return false;
        }
        let conn = match self.connections.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => match orient(&self.ports, pkt) {
                Some(flow) => {
                    debug!("{}: new RTSP connection {}", pkt.ctx, flow);
                    e.insert(Connection::new(flow))
                }
                None => {
                    if !pkt.payload.is_empty() {
                        self.ignored.insert(key);
                    }
                    return false;
                }
            },
        };
        let to_server = pkt.flow.src == conn.flow.src;
        let half = if to_server {
            &mut conn.to_server
        } else {
            &mut conn.to_client
        };
        if let Err(description) = half.push(&tcp, pkt.payload.clone()) {
            diag.record(wrap!(ErrorInt::RtspParseError {
                conn: conn.flow,
                pkt_ctx: pkt.ctx,
                description,
            }));
        }
        loop {
            let half = if to_server {
                &mut conn.to_server
            } else {
                &mut conn.to_client
            };
            match half.next_chunk() {
                Ok(None) => break,
                Ok(Some(Chunk::Message(Message::Request(req)))) => {
                    handle_request(conn, req, pkt, diag)
                }
                Ok(Some(Chunk::Message(Message::Response(resp)))) => handle_response(
                    conn,
                    &mut self.presentations,
                    resp,
                    pkt,
                    diag,
                    events,
                ),
                Ok(Some(Chunk::Message(Message::Data(_)))) => {}
                Ok(Some(Chunk::Interleaved { channel_id, len })) => {
                    conn.interleaved_frames += 1;
                    if conn.interleaved_frames == 1 {
                        diag.record(wrap!(ErrorInt::InterleavedTransport {
                            conn: conn.flow,
                            pkt_ctx: pkt.ctx,
                            description: format!(
                                "{len}-byte interleaved frame on channel {channel_id}; \
                                 RTP over the RTSP connection isn't extracted"
                            ),
                        }));
                    }
                }
                Err(description) => diag.record(wrap!(ErrorInt::RtspParseError {
                    conn: conn.flow,
                    pkt_ctx: pkt.ctx,
                    description,
                })),
            }
        }
        true
    }

    /// Logs what was left unfinished at the end of the capture.
    pub fn finish(&self) {
        for conn in self.connections.values() {
            if conn.interleaved_frames > 0 {
                info!(
                    "{}: skipped {} interleaved frames",
                    conn.flow, conn.interleaved_frames
                );
            }
            let leftover = conn.to_server.leftover() + conn.to_client.leftover();
            if leftover > 0 || !conn.pending.is_empty() {
                debug!(
                    "{}: {} unparsed bytes, {} unanswered requests at end of capture",
                    conn.flow,
                    leftover,
                    conn.pending.len()
                );
            }
        }
    }
}

/// Decides if a new TCP flow is RTSP, returning it oriented client to server.
fn orient(ports: &[u16], pkt: &CapturedPacket) -> Option<FlowContext> {
    if ports.contains(&pkt.flow.dst.port()) {
        return Some(pkt.flow);
    }
    if ports.contains(&pkt.flow.src.port()) {
        return Some(pkt.flow.reversed());
    }
    if pkt.payload.starts_with(b"RTSP/1.") {
        return Some(pkt.flow.reversed());
    }
    if stream::looks_like_message_start(&pkt.payload) && pkt.payload.first() != Some(&b'$') {
        return Some(pkt.flow);
    }
    None
}

fn cseq<M: HeaderLookup>(msg: &M) -> Option<u32> {
    msg.lookup(&headers::CSEQ)
        .and_then(|v| u32::from_str_radix(v.trim(), 10).ok())
}

/// Header access common to requests and responses.
trait HeaderLookup {
    fn lookup(&self, name: &headers::HeaderName) -> Option<&str>;
}

impl HeaderLookup for rtsp_types::Request<Bytes> {
    fn lookup(&self, name: &headers::HeaderName) -> Option<&str> {
        self.header(name).map(|v| v.as_str())
    }
}

impl HeaderLookup for rtsp_types::Response<Bytes> {
    fn lookup(&self, name: &headers::HeaderName) -> Option<&str> {
        self.header(name).map(|v| v.as_str())
    }
}

fn handle_request(
    conn: &mut Connection,
    req: rtsp_types::Request<Bytes>,
    pkt: &CapturedPacket,
    diag: &mut Diagnostics,
) {
    let method = req.method().clone();
    let Some(cseq) = cseq(&req) else {
        diag.record(wrap!(ErrorInt::RtspParseError {
            conn: conn.flow,
            pkt_ctx: pkt.ctx,
            description: format!("{} request without CSeq", <&str>::from(&method)),
        }));
        return;
    };
    let transport = match (&method, req.lookup(&headers::TRANSPORT)) {
        (Method::Setup, Some(t)) => Transport::parse(t)
            .map_err(|e| debug!("{}: request Transport {:?}: {}", pkt.ctx, t, e))
            .ok(),
        _ => None,
    };
    debug!(
        "{}: {} {} CSeq={}",
        pkt.ctx,
        <&str>::from(&method),
        req.request_uri().map(Url::as_str).unwrap_or("*"),
        cseq
    );
    conn.pending.insert(
        cseq,
        PendingRequest {
            method,
            url: req.request_uri().cloned(),
            transport,
        },
    );
}

/// Guesses the method of a successful response whose request wasn't captured.
fn classify(resp: &rtsp_types::Response<Bytes>) -> Option<Method> {
    if resp.lookup(&headers::RTP_INFO).is_some() {
        Some(Method::Play)
    } else if is_sdp(resp) && !resp.body().is_empty() {
        Some(Method::Describe)
    } else if resp.lookup(&headers::TRANSPORT).is_some() {
        Some(Method::Setup)
    } else {
        None
    }
}

fn is_sdp(resp: &rtsp_types::Response<Bytes>) -> bool {
    resp.lookup(&headers::CONTENT_TYPE)
        .map(|v| {
            v.split(';')
                .next()
                .unwrap_or("")
                .trim()
                .eq_ignore_ascii_case("application/sdp")
        })
        .unwrap_or(false)
}

fn handle_response(
    conn: &mut Connection,
    presentations: &mut Presentations,
    resp: rtsp_types::Response<Bytes>,
    pkt: &CapturedPacket,
    diag: &mut Diagnostics,
    events: &mut Vec<Event>,
) {
    let cseq = cseq(&resp);
    let req = cseq.and_then(|c| conn.pending.remove(&c));
    if !resp.status().is_success() {
        debug!(
            "{}: {} response to {} CSeq={:?}",
            pkt.ctx,
            u16::from(resp.status()),
            req.as_ref().map(|r| <&str>::from(&r.method)).unwrap_or("unknown request"),
            cseq
        );
        return;
    }
    let method = match &req {
        Some(r) => r.method.clone(),
        None => match classify(&resp) {
            Some(m) => {
                debug!(
                    "{}: treating unmatched response CSeq={:?} as {}",
                    pkt.ctx,
                    cseq,
                    <&str>::from(&m)
                );
                m
            }
            None => return,
        },
    };
    let (flow, pkt_ctx, error_method) = (conn.flow, pkt.ctx, method.clone());
    let response_error = move |description: String| {
        wrap!(ErrorInt::RtspResponseError {
            conn: flow,
            pkt_ctx,
            method: error_method.clone(),
            cseq,
            description,
        })
    };
    match method {
        Method::Describe => {
            if !is_sdp(&resp) || resp.body().is_empty() {
                diag.record(response_error(
                    "expected an application/sdp body".to_owned(),
                ));
                return;
            }
            let request_url = req.as_ref().and_then(|r| r.url.as_ref());
            let base_url = base_url(&resp, request_url, diag, &response_error);
            let origin = format!("{} DESCRIBE response", pkt.ctx);
            let (sdp, errors) = sdp::parse(&origin, resp.body());
            for e in errors {
                diag.record(e);
            }
            info!(
                "{}: session description with {} media{}",
                pkt.ctx,
                sdp.medias.len(),
                sdp.tool
                    .as_deref()
                    .map(|t| format!(" from tool {t:?}"))
                    .unwrap_or_default()
            );
            let p = Arc::new(Presentation {
                sdp,
                base_url,
                origin,
            });
            conn.presentation = Some(p.clone());
            conn.setups = 0;
            presentations.latest = Some(p.clone());
            events.push(Event::Presentation(p));
        }
        Method::Setup => {
            let url = req.as_ref().and_then(|r| r.url.as_ref());
            let req_transport = req.as_ref().and_then(|r| r.transport.as_ref());
            let Some(presentation) = conn
                .presentation
                .clone()
                .or_else(|| presentations.latest.clone())
                .or_else(|| presentations.backup.clone())
            else {
                diag.record(response_error(
                    "no session description captured or supplied; can't interpret SETUP"
                        .to_owned(),
                ));
                return;
            };
            let mut transport = match resp.lookup(&headers::TRANSPORT).map(Transport::parse) {
                Some(Ok(t)) => t,
                Some(Err(e)) => {
                    diag.record(response_error(format!("bad Transport header: {e}")));
                    match req_transport {
                        Some(t) => t.clone(),
                        None => return,
                    }
                }
                None => match req_transport {
                    Some(t) => t.clone(),
                    None => {
                        diag.record(response_error("no Transport header".to_owned()));
                        return;
                    }
                },
            };
            if let Some(r) = req_transport {
                transport.merge_request(r);
            }
            let ordinal = conn.setups;
            conn.setups += 1;
            if transport.is_interleaved() {
                diag.record(wrap!(ErrorInt::InterleavedTransport {
                    conn: conn.flow,
                    pkt_ctx: pkt.ctx,
                    description: format!(
                        "SETUP {} negotiated interleaved transport {:?}; not extracted",
                        url.map(Url::as_str).unwrap_or("(unknown url)"),
                        transport.interleaved
                    ),
                }));
                return;
            }
            let Some(media) = match_setup(&presentation, url, ordinal) else {
                diag.record(response_error(format!(
                    "unable to match SETUP {} to a media of {}",
                    url.map(Url::as_str).unwrap_or("(unknown url)"),
                    &presentation.origin
                )));
                return;
            };
            if transport.receive_rtp_port().is_none() {
                diag.record(response_error(format!(
                    "transport for media {} has no receive port",
                    media.index
                )));
                return;
            }
            let session = resp.lookup(&headers::SESSION).and_then(|s| {
                SessionHeader::parse(s)
                    .map_err(|e| debug!("{}: {}", pkt.ctx, e))
                    .ok()
            });
            info!(
                "{}: SETUP media {} ({}/{}) to port {:?}, ssrc {:08x?}, session {:?}",
                pkt.ctx,
                media.index,
                &media.media,
                media.encoding_name.as_deref().unwrap_or("?"),
                transport.receive_rtp_port(),
                transport.ssrc,
                session.as_ref().map(|s| &s.id)
            );
            // The response travels server to client.
            let connection = FlowContext {
                protocol: pkt.flow.protocol,
                src: pkt.flow.dst,
                dst: pkt.flow.src,
            };
            events.push(Event::Track(NegotiatedTrack {
                control: presentation.control_url(media),
                media: media.clone(),
                presentation: presentation.clone(),
                transport,
                connection,
                session,
                ctx: pkt.ctx,
            }));
        }
        Method::Play => {
            if let Some(info) = resp.lookup(&headers::RTP_INFO) {
                debug!("{}: PLAY RTP-Info: {}", pkt.ctx, info);
            }
        }
        _ => {}
    }
}

/// Determines the base URL for control attributes per
/// [RFC 2326 appendix C.1.1](https://tools.ietf.org/html/rfc2326#appendix-C.1.1).
fn base_url(
    resp: &rtsp_types::Response<Bytes>,
    request_url: Option<&Url>,
    diag: &mut Diagnostics,
    response_error: &dyn Fn(String) -> crate::Error,
) -> Option<Url> {
    for h in [&headers::CONTENT_BASE, &headers::CONTENT_LOCATION] {
        if let Some(v) = resp.lookup(h) {
            match Url::parse(v.trim()) {
                Ok(u) => return Some(u),
                Err(e) => diag.record(response_error(format!("bad {h} {v:?}: {e}"))),
            }
        }
    }
    request_url.cloned()
}

/// Finds the media a `SETUP` refers to: by control URL, then control suffix,
/// then the sole RTP media, then ordinal position among RTP media.
fn match_setup<'p>(
    presentation: &'p Presentation,
    url: Option<&Url>,
    ordinal: usize,
) -> Option<&'p MediaDescription> {
    let rtp: Vec<&MediaDescription> = presentation
        .sdp
        .medias
        .iter()
        .filter(|m| m.is_rtp)
        .collect();
    if let Some(url) = url {
        if let Some(m) = rtp
            .iter()
            .copied()
            .find(|m| presentation.control_url(m).as_ref() == Some(url))
        {
            return Some(m);
        }
        let path = url.as_str().trim_end_matches('/');
        if let Some(m) = rtp.iter().copied().find(|m| match m.control.as_deref() {
            Some(c) if !c.is_empty() && c != "*" => {
                let c = c.trim_end_matches('/');
                path == c
                    || path
                        .strip_suffix(c)
                        .map_or(false, |p| p.ends_with('/') || p.ends_with('?'))
            }
            _ => false,
        }) {
            return Some(m);
        }
    }
    if rtp.len() == 1 {
        return Some(rtp[0]);
    }
    rtp.get(ordinal).copied()
}
