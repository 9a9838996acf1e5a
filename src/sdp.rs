// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tolerant parsing of session descriptions
//! ([RFC 8866](https://datatracker.ietf.org/doc/html/rfc8866)).
//!
//! Unlike a strict parser, this never fails as a whole: recorded cameras emit
//! all manner of slightly-broken SDP, and a capture may have the body cut
//! short. Bad lines are reported as [`ErrorKind::Parse`](crate::ErrorKind)
//! errors alongside whatever could be recovered.

use std::collections::BTreeMap;
use std::num::NonZeroU16;

use url::Url;

use crate::error::ErrorInt;
use crate::Error;

/// A static payload type in the [RTP parameters
/// registry](https://www.iana.org/assignments/rtp-parameters/rtp-parameters.xhtml#rtp-parameters-1).
#[derive(Debug)]
struct StaticPayloadType {
    encoding: &'static str,
    media: &'static str,
    clock_rate: u32,
    channels: Option<NonZeroU16>,
}

const fn audio(encoding: &'static str, clock_rate: u32, channels: u16) -> Option<StaticPayloadType> {
    Some(StaticPayloadType {
        encoding,
        media: "audio",
        clock_rate,
        channels: NonZeroU16::new(channels),
    })
}

const fn video(encoding: &'static str) -> Option<StaticPayloadType> {
    Some(StaticPayloadType {
        encoding,
        media: "video",
        clock_rate: 90_000,
        channels: None,
    })
}

/// All registered static payload types.
/// The registry is officially closed, so this list should never change.
#[rustfmt::skip]
static STATIC_PAYLOAD_TYPES: [Option<StaticPayloadType>; 35] = [
    /* 0 */ audio("pcmu", 8_000, 1),
    /* 1 */ None, // reserved
    /* 2 */ None, // reserved
    /* 3 */ audio("gsm", 8_000, 1),
    /* 4 */ audio("g723", 8_000, 1),
    /* 5 */ audio("dvi4", 8_000, 1),
    /* 6 */ audio("dvi4", 16_000, 1),
    /* 7 */ audio("lpc", 8_000, 1),
    /* 8 */ audio("pcma", 8_000, 1),
    /* 9 */ audio("g722", 8_000, 1),
    /* 10 */ audio("l16", 44_100, 2),
    /* 11 */ audio("l16", 44_100, 1),
    /* 12 */ audio("qcelp", 8_000, 1),
    /* 13 */ audio("cn", 8_000, 1),
    /* 14 */ audio("mpa", 90_000, 0),
    /* 15 */ audio("g728", 8_000, 1),
    /* 16 */ audio("dvi4", 11_025, 1),
    /* 17 */ audio("dvi4", 22_050, 1),
    /* 18 */ audio("g729", 8_000, 1),
    /* 19 */ None, // reserved
    /* 20 */ None, // unassigned
    /* 21 */ None, // unassigned
    /* 22 */ None, // unassigned
    /* 23 */ None, // unassigned
    /* 24 */ None, // unassigned
    /* 25 */ video("celb"),
    /* 26 */ video("jpeg"),
    /* 27 */ None, // unassigned
    /* 28 */ video("nv"),
    /* 29 */ None, // unassigned
    /* 30 */ None, // unassigned
    /* 31 */ video("h261"),
    /* 32 */ video("mpv"),
    // The RTP parameters registry says type AV (audio and video).
    // The MIME registration says the media type is "video".
    // https://datatracker.ietf.org/doc/html/rfc3555#section-4.2.9
    /* 33 */ video("mp2t"),
    /* 34 */ video("h263"),
];

/// An `a=` line: `a=<name>` or `a=<name>:<value>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>,
}

/// Format-specific parameters from an `a=fmtp` line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fmtp {
    /// The text after the payload type, verbatim.
    pub raw: String,

    /// `key=value` pairs split on `;`. Keys are lower-cased; values are
    /// trimmed but otherwise verbatim. A bare key maps to an empty value.
    pub params: BTreeMap<String, String>,
}

impl Fmtp {
    pub fn parse(raw: &str) -> Self {
        let mut params = BTreeMap::new();
        for p in raw.split(';') {
            let p = p.trim();
            if p.is_empty() {
                continue;
            }
            let (k, v) = p.split_once('=').unwrap_or((p, ""));
            params.insert(k.trim().to_ascii_lowercase(), v.trim().to_owned());
        }
        Fmtp {
            raw: raw.to_owned(),
            params,
        }
    }

    /// Looks up a parameter by case-insensitive key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// One `m=` block of a session description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaDescription {
    /// 0-based position among all `m=` lines, counting ones dropped as
    /// unparseable. Stable for the run, so it's also the track index.
    pub index: usize,

    /// Lower-cased media type, such as `video` or `audio`.
    pub media: String,
    pub port: u16,
    pub proto: String,

    /// The first (default) format. Always present when `is_rtp`.
    pub payload_type: Option<u8>,

    /// Lower-cased encoding name, from `a=rtpmap` or the static payload table.
    pub encoding_name: Option<String>,
    pub clock_rate: Option<u32>,
    pub channels: Option<NonZeroU16>,
    pub fmtp: Option<Fmtp>,

    /// The raw `a=control` value; see [`join_control`].
    pub control: Option<String>,

    /// All attributes of the block, in order, including those interpreted above.
    pub attributes: Vec<Attribute>,

    /// True iff `proto` is an RTP profile; others are retained only for their index.
    pub is_rtp: bool,
}

impl MediaDescription {
    /// Returns true if this block names an RTP payload format we can identify.
    pub fn is_supported(&self) -> bool {
        self.is_rtp && self.encoding_name.is_some() && self.clock_rate.is_some()
    }
}

/// A parsed session description.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SdpSession {
    /// Session-level attributes.
    pub attributes: Vec<Attribute>,

    /// Successfully parsed media blocks, in order.
    pub medias: Vec<MediaDescription>,

    /// The session-level `a=control` value.
    pub control: Option<String>,

    /// The session-level `a=tool` value; handy when diagnosing camera quirks.
    pub tool: Option<String>,
}

/// The block attribute lines currently belong to.
enum Block {
    Session,
    Media(MediaDescription),

    /// An unparseable `m=` line; its attributes are discarded.
    Dropped,
}

/// Parses a session description, returning whatever could be recovered plus
/// one error per skipped line.
///
/// `origin` names the description's source (eg a packet context or a file
/// name) in errors.
pub fn parse(origin: &str, body: &[u8]) -> (SdpSession, Vec<Error>) {
    let text = String::from_utf8_lossy(body);
    let mut session = SdpSession::default();
    let mut errors = Vec::new();
    let mut block = Block::Session;
    let mut m_lines = 0;
    let mut err = |line: usize, description: String| {
        errors.push(wrap!(ErrorInt::SdpParseError {
            origin: origin.to_owned(),
            line,
            description,
        }));
    };
    for (i, line) in text.split('\n').enumerate() {
        let lineno = i + 1;
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            continue;
        }
        let (type_, value) = match line.split_once('=') {
            Some((t, v)) if t.len() == 1 => (t, v),
            _ => {
                err(lineno, format!("expected <type>=<value>, got {line:?}"));
                continue;
            }
        };
        match type_ {
            "m" => {
                if let Block::Media(m) = std::mem::replace(&mut block, Block::Dropped) {
                    session.medias.push(m);
                }
                let index = m_lines;
                m_lines += 1;
                match parse_media_line(index, value) {
                    Ok(m) => block = Block::Media(m),
                    Err(e) => err(lineno, format!("dropping media {index}: {e}")),
                }
            }
            "a" => {
                let (name, value) = match value.split_once(':') {
                    Some((n, v)) => (n, Some(v)),
                    None => (value, None),
                };
                if name.is_empty() {
                    err(lineno, "attribute with empty name".to_owned());
                    continue;
                }
                let attr = Attribute {
                    name: name.to_owned(),
                    value: value.map(str::to_owned),
                };
                match &mut block {
                    Block::Session => {
                        match (name, value) {
                            ("control", Some(v)) => session.control = Some(v.trim().to_owned()),
                            ("tool", Some(v)) => session.tool = Some(v.to_owned()),
                            _ => {}
                        }
                        session.attributes.push(attr);
                    }
                    Block::Media(m) => {
                        if let Err(e) = apply_media_attribute(m, name, value) {
                            err(lineno, e);
                            continue;
                        }
                        m.attributes.push(attr);
                    }
                    Block::Dropped => {}
                }
            }
            _ => {} // v=, o=, s=, c=, t=, etc. carry nothing needed for depacketization.
        }
    }
    if let Block::Media(m) = block {
        session.medias.push(m);
    }
    for m in &mut session.medias {
        fill_static_payload_type(m);
    }
    (session, errors)
}

/// Parses the value of an `m=` line: `<media> <port>[/<n>] <proto> <fmt> ...`.
fn parse_media_line(index: usize, value: &str) -> Result<MediaDescription, String> {
    let mut fields = value.split_ascii_whitespace();
    let (media, port, proto) = match (fields.next(), fields.next(), fields.next()) {
        (Some(m), Some(p), Some(r)) => (m, p, r),
        _ => return Err(format!("too few fields in {value:?}")),
    };
    let port_str = port.split_once('/').map_or(port, |(p, _)| p);
    let port =
        u16::from_str_radix(port_str, 10).map_err(|_| format!("bad port {port_str:?}"))?;

    // https://tools.ietf.org/html/rfc8866#section-5.14 says "If the <proto>
    // sub-field is "RTP/AVP" or "RTP/SAVP" the <fmt> sub-fields contain RTP
    // payload type numbers."
    // https://www.iana.org/assignments/sdp-parameters/sdp-parameters.xhtml#sdp-parameters-2
    // shows several other variants, such as "TCP/RTP/AVP". Looking for a "RTP" component
    // seems appropriate.
    let is_rtp = proto.starts_with("RTP/") || proto.contains("/RTP/");

    // RFC 8866 continues: "When a list of payload type numbers is given,
    // this implies that all of these payload formats MAY be used in the
    // session, but the first of these formats SHOULD be used as the default
    // format for the session." Just use the first.
    let fmt = fields.next();
    let payload_type = if is_rtp {
        let fmt = fmt.ok_or_else(|| "RTP media with no payload type".to_owned())?;
        match u8::from_str_radix(fmt, 10) {
            Ok(pt) if pt < 0x80 => Some(pt),
            _ => return Err(format!("invalid RTP payload type {fmt:?}")),
        }
    } else {
        None
    };
    Ok(MediaDescription {
        index,
        media: media.to_ascii_lowercase(),
        port,
        proto: proto.to_owned(),
        payload_type,
        encoding_name: None,
        clock_rate: None,
        channels: None,
        fmtp: None,
        control: None,
        attributes: Vec::new(),
        is_rtp,
    })
}

/// Interprets the media-level attributes needed for depacketization.
/// `rtpmap` and `fmtp` lines for non-default payload types are ignored.
fn apply_media_attribute(
    m: &mut MediaDescription,
    name: &str,
    value: Option<&str>,
) -> Result<(), String> {
    match name {
        "rtpmap" => {
            let v = value.ok_or_else(|| "rtpmap attribute with no value".to_owned())?;
            // https://tools.ietf.org/html/rfc8866#section-6.6
            // rtpmap-value = payload-type SP encoding-name
            //   "/" clock-rate [ "/" encoding-params ]
            let (pt, v) = v
                .trim()
                .split_once(' ')
                .ok_or_else(|| format!("invalid rtpmap {v:?}"))?;
            if m.payload_type.map(|p| p.to_string()).as_deref() != Some(pt) {
                return Ok(());
            }
            let mut parts = v.trim().split('/');
            let encoding = parts.next().unwrap_or("");
            let clock_rate = parts
                .next()
                .ok_or_else(|| format!("rtpmap {v:?} has no clock rate"))?;
            let clock_rate = u32::from_str_radix(clock_rate, 10)
                .ok()
                .filter(|&r| r > 0)
                .ok_or_else(|| format!("bad clock rate {clock_rate:?} in rtpmap"))?;
            let channels = parts
                .next()
                .map(|c| {
                    u16::from_str_radix(c, 10)
                        .ok()
                        .and_then(NonZeroU16::new)
                        .ok_or_else(|| format!("invalid channels specification {c:?}"))
                })
                .transpose()?;
            if encoding.is_empty() {
                return Err(format!("rtpmap {v:?} has no encoding name"));
            }
            m.encoding_name = Some(encoding.to_ascii_lowercase());
            m.clock_rate = Some(clock_rate);
            m.channels = channels;
        }
        "fmtp" => {
            let v = value.ok_or_else(|| "fmtp attribute with no value".to_owned())?;
            let v = v.trim_start();
            let (pt, params) = v.split_once(' ').unwrap_or((v, ""));
            if m.payload_type.map(|p| p.to_string()).as_deref() == Some(pt) {
                m.fmtp = Some(Fmtp::parse(params.trim()));
            }
        }
        "control" => {
            let v = value.ok_or_else(|| "control attribute with no value".to_owned())?;
            m.control = Some(v.trim().to_owned());
        }
        _ => {}
    }
    Ok(())
}

/// Falls back to the static payload type table when there was no usable
/// `a=rtpmap`, as RFC 3551 allows.
fn fill_static_payload_type(m: &mut MediaDescription) {
    if m.encoding_name.is_some() {
        return;
    }
    let Some(pt) = m.payload_type else { return };
    let Some(t) = STATIC_PAYLOAD_TYPES
        .get(usize::from(pt))
        .and_then(Option::as_ref)
    else {
        return;
    };
    if t.media != m.media {
        log::debug!(
            "media {}: SDP media type {} doesn't match static payload type {:?}",
            m.index,
            m.media,
            t
        );
        return;
    }
    m.encoding_name = Some(t.encoding.to_owned());
    m.clock_rate = Some(t.clock_rate);
    m.channels = t.channels;
}

/// Joins a control URL to a base URL in a non-RFC-compliant but common way.
/// This matches what live555 and ffmpeg do: the control value is appended to
/// the base with a `/` separator rather than resolved per RFC 3986.
pub fn join_control(base_url: &Url, control: &str) -> Result<Url, String> {
    if control == "*" {
        return Ok(base_url.clone());
    }
    if let Ok(absolute_url) = Url::parse(control) {
        return Ok(absolute_url);
    }

    Url::parse(&format!(
        "{}{}{}",
        base_url.as_str(),
        if base_url.as_str().ends_with('/') {
            ""
        } else {
            "/"
        },
        control
    ))
    .map_err(|e| format!("unable to join base url {base_url} with control url {control:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAHUA: &[u8] = include_bytes!("testdata/dahua_h264_aac.sdp");

    #[test]
    fn dahua_h264_aac() {
        let (s, errors) = parse("test", DAHUA);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(s.control.as_deref(), Some("rtsp://192.168.5.111:554/cam/"));
        assert_eq!(s.medias.len(), 3);

        let v = &s.medias[0];
        assert_eq!(v.index, 0);
        assert_eq!(v.media, "video");
        assert_eq!(v.payload_type, Some(96));
        assert_eq!(v.encoding_name.as_deref(), Some("h264"));
        assert_eq!(v.clock_rate, Some(90_000));
        assert_eq!(v.control.as_deref(), Some("trackID=0"));
        let fmtp = v.fmtp.as_ref().unwrap();
        assert_eq!(fmtp.get("packetization-mode"), Some("1"));
        assert_eq!(fmtp.get("Profile-Level-Id"), Some("64001E"));
        assert!(v.is_supported());

        let a = &s.medias[1];
        assert_eq!(a.media, "audio");
        assert_eq!(a.encoding_name.as_deref(), Some("mpeg4-generic"));
        assert_eq!(a.clock_rate, Some(48_000));
        assert_eq!(a.channels, NonZeroU16::new(1));
        assert_eq!(a.fmtp.as_ref().unwrap().get("config"), Some("1188"));
        assert_eq!(a.control.as_deref(), Some("trackID=1"));

        let o = &s.medias[2];
        assert_eq!(o.media, "application");
        assert_eq!(o.encoding_name.as_deref(), Some("vnd.onvif.metadata"));
        assert!(o.fmtp.is_none());
    }

    /// Each `m=` line yields one description, and attributes stay in their block.
    #[test]
    fn blocks_in_order() {
        let body = b"v=0\r\n\
                     o=- 0 0 IN IP4 0.0.0.0\r\n\
                     s=x\r\n\
                     a=control:*\r\n\
                     m=video 0 RTP/AVP 96\r\n\
                     a=rtpmap:96 H265/90000\r\n\
                     a=fmtp:96 sprop-vps=QAEMAf//\r\n\
                     a=control:v\r\n\
                     m=audio 0 RTP/AVP 0\r\n\
                     a=control:a\r\n\
                     m=audio 0 RTP/AVP 97\r\n\
                     a=rtpmap:97 L16/16000/2\r\n";
        let (s, errors) = parse("test", body);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(s.control.as_deref(), Some("*"));
        assert_eq!(s.medias.len(), 3);
        assert_eq!(
            s.medias.iter().map(|m| m.index).collect::<Vec<_>>(),
            [0, 1, 2]
        );
        assert_eq!(s.medias[0].encoding_name.as_deref(), Some("h265"));
        assert_eq!(s.medias[0].attributes.len(), 3);

        // Static payload type 0; no fmtp leaked from the previous block.
        assert_eq!(s.medias[1].encoding_name.as_deref(), Some("pcmu"));
        assert_eq!(s.medias[1].clock_rate, Some(8_000));
        assert!(s.medias[1].fmtp.is_none());
        assert_eq!(s.medias[1].control.as_deref(), Some("a"));

        assert_eq!(s.medias[2].encoding_name.as_deref(), Some("l16"));
        assert_eq!(s.medias[2].channels, NonZeroU16::new(2));
        assert!(s.medias[2].control.is_none());
    }

    /// A broken `m=` line drops only its own block; a broken attribute only itself.
    #[test]
    fn tolerates_bad_lines() {
        let body = b"v=0\n\
                     garbage\n\
                     m=video 0 RTP/AVP 96\n\
                     a=rtpmap:96 H264\n\
                     a=rtpmap:96 H264/90000\n\
                     m=video notaport RTP/AVP 97\n\
                     a=rtpmap:97 MP4V-ES/90000\n\
                     a=control:dropped\n\
                     m=application 9 TCP/BFCP *\n\
                     m=audio 0 RTP/AVP 8\n";
        let (s, errors) = parse("test", body);
        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(errors.iter().all(|e| e.kind() == crate::ErrorKind::Parse));
        assert_eq!(s.medias.len(), 3);

        assert_eq!(s.medias[0].index, 0);
        assert_eq!(s.medias[0].encoding_name.as_deref(), Some("h264"));
        assert!(s.medias[0].control.is_none());

        assert_eq!(s.medias[1].index, 2);
        assert!(!s.medias[1].is_rtp);
        assert!(!s.medias[1].is_supported());
        assert!(s.medias[1].control.is_none());

        assert_eq!(s.medias[2].index, 3);
        assert_eq!(s.medias[2].encoding_name.as_deref(), Some("pcma"));
    }

    #[test]
    fn static_payload_type_mismatch() {
        let (s, _) = parse("test", b"m=video 0 RTP/AVP 0\n");
        assert!(s.medias[0].encoding_name.is_none());
        assert!(!s.medias[0].is_supported());
    }

    #[test]
    fn fmtp_params() {
        let f = Fmtp::parse(
            "streamtype=5; profile-level-id=15; mode=AAC-hbr; config=1188; SizeLength=13;\
             IndexLength=3; indexdeltalength=3; flag",
        );
        assert_eq!(f.get("sizelength"), Some("13"));
        assert_eq!(f.get("indexlength"), Some("3"));
        assert_eq!(f.get("mode"), Some("AAC-hbr"));
        assert_eq!(f.get("flag"), Some(""));
        assert_eq!(f.get("missing"), None);
    }

    #[test]
    fn join() {
        let base = Url::parse("rtsp://192.168.1.2/cam?channel=1").unwrap();
        assert_eq!(join_control(&base, "*").unwrap(), base);
        assert_eq!(
            join_control(&base, "trackID=1").unwrap().as_str(),
            "rtsp://192.168.1.2/cam?channel=1/trackID=1"
        );
        assert_eq!(
            join_control(&base, "rtsp://10.0.0.1/x").unwrap().as_str(),
            "rtsp://10.0.0.1/x"
        );
    }
}
