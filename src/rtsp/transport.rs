// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `Transport` and `Session` header parsing, as in
//! [RFC 2326 section 12.39](https://datatracker.ietf.org/doc/html/rfc2326#section-12.39).

use std::net::IpAddr;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LowerTransport {
    Udp,
    Tcp,
}

/// A single transport specification from a `Transport` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transport {
    /// Casefolded transport protocol and profile, eg `rtp/avp`.
    pub profile: String,
    pub lower_transport: LowerTransport,
    pub multicast: bool,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,

    /// The multicast port pair.
    pub port: Option<(u16, u16)>,
    pub ssrc: Option<u32>,
    pub source: Option<IpAddr>,
    pub destination: Option<IpAddr>,
    pub interleaved: Option<(u8, u8)>,
}

impl Transport {
    /// Parses the first transport specification of a `Transport` header value.
    ///
    /// Requests may list alternatives separated by commas; responses carry
    /// the chosen one. Parameter names are casefolded; unknown parameters are
    /// ignored.
    pub fn parse(value: &str) -> Result<Self, String> {
        let spec = value.split(',').next().unwrap_or("").trim();
        let mut parts = spec.split(';');
        let profile = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        if !profile.starts_with("rtp/") {
            return Err(format!("unsupported transport protocol {profile:?}"));
        }
        let lower_transport = match profile.rsplit('/').next() {
            Some("tcp") => LowerTransport::Tcp,
            _ => LowerTransport::Udp,
        };
        let mut t = Transport {
            profile,
            lower_transport,
            multicast: false,
            client_port: None,
            server_port: None,
            port: None,
            ssrc: None,
            source: None,
            destination: None,
            interleaved: None,
        };
        for part in parts {
            let part = part.trim();
            let (key, value) = match part.split_once('=') {
                Some((k, v)) => (k.trim().to_ascii_lowercase(), Some(v.trim())),
                None => (part.to_ascii_lowercase(), None),
            };
            match (key.as_str(), value) {
                ("unicast", _) => t.multicast = false,
                ("multicast", _) => t.multicast = true,
                ("client_port", Some(v)) => t.client_port = Some(parse_port_pair(v)?),
                ("server_port", Some(v)) => t.server_port = Some(parse_port_pair(v)?),
                ("port", Some(v)) => t.port = Some(parse_port_pair(v)?),
                ("ssrc", Some(v)) => {
                    // Hex, sometimes zero-padded or `0x`-prefixed; surrounding whitespace
                    // was trimmed above.
                    let v = v.trim_start_matches("0x");
                    t.ssrc = Some(
                        u32::from_str_radix(v, 16).map_err(|_| format!("unparseable ssrc {v:?}"))?,
                    );
                }
                ("source", Some(v)) => {
                    t.source = Some(
                        v.parse()
                            .map_err(|_| format!("unparseable source {v:?}"))?,
                    );
                }
                ("destination", Some(v)) => {
                    // Hostnames are allowed here but useless for matching captured packets.
                    t.destination = v.parse().ok();
                }
                ("interleaved", Some(v)) => {
                    let (a, b) = match v.split_once('-') {
                        Some((a, b)) => (a, Some(b)),
                        None => (v, None),
                    };
                    let a = u8::from_str_radix(a, 10)
                        .map_err(|_| format!("bad channel number {a:?}"))?;
                    let b = match b {
                        Some(b) => u8::from_str_radix(b, 10)
                            .map_err(|_| format!("bad second channel number {b:?}"))?,
                        None => a.saturating_add(1),
                    };
                    t.interleaved = Some((a, b));
                }
                _ => {}
            }
        }
        Ok(t)
    }

    /// True if RTP would travel over the RTSP connection itself.
    pub fn is_interleaved(&self) -> bool {
        self.lower_transport == LowerTransport::Tcp || self.interleaved.is_some()
    }

    /// Fills fields the server's response omitted from the client's request.
    pub fn merge_request(&mut self, request: &Transport) {
        if self.client_port.is_none() {
            self.client_port = request.client_port;
        }
        if self.destination.is_none() {
            self.destination = request.destination;
        }
        if self.port.is_none() && self.multicast {
            self.port = request.port;
        }
    }

    /// Returns the RTP port on the receiving side: the multicast port or the
    /// client's RTP port.
    pub fn receive_rtp_port(&self) -> Option<u16> {
        if self.multicast {
            self.port.or(self.client_port).map(|(rtp, _)| rtp)
        } else {
            self.client_port.map(|(rtp, _)| rtp)
        }
    }
}

/// Parses `a-b`; a single port `p` means `(p, p+1)`.
fn parse_port_pair(v: &str) -> Result<(u16, u16), String> {
    let (a, b) = match v.split_once('-') {
        Some((a, b)) => (a, Some(b)),
        None => (v, None),
    };
    let a = u16::from_str_radix(a.trim(), 10).map_err(|_| format!("bad port {a:?}"))?;
    let b = match b {
        Some(b) => u16::from_str_radix(b.trim(), 10).map_err(|_| format!("bad port {b:?}"))?,
        None => a
            .checked_add(1)
            .ok_or_else(|| format!("port {a} has no successor for RTCP"))?,
    };
    Ok((a, b))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionHeader {
    pub id: Box<str>,
    pub timeout_sec: u32,
}

impl SessionHeader {
    /// Parses a `Session` header per
    /// [RFC 2326 section 12.37](https://datatracker.ietf.org/doc/html/rfc2326#section-12.37).
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.split_once(';') {
            None => Ok(SessionHeader {
                id: value.trim().into(),
                timeout_sec: 60, // default
            }),
            Some((id, timeout_str)) => {
                if let Some(v) = timeout_str.trim().strip_prefix("timeout=") {
                    let timeout_sec =
                        u32::from_str_radix(v, 10).map_err(|_| format!("Unparseable timeout {v}"))?;
                    Ok(SessionHeader {
                        id: id.trim().into(),
                        timeout_sec,
                    })
                } else {
                    Err(format!("Unparseable Session header {value:?}"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unicast_udp() {
        let t = Transport::parse(
            "RTP/AVP;unicast;client_port=6970-6971;server_port=8000-8001;ssrc=30A98EE7;\
             source=192.168.5.111;mode=\"PLAY\"",
        )
        .unwrap();
        assert_eq!(t.profile, "rtp/avp");
        assert_eq!(t.lower_transport, LowerTransport::Udp);
        assert!(!t.multicast);
        assert_eq!(t.client_port, Some((6970, 6971)));
        assert_eq!(t.server_port, Some((8000, 8001)));
        assert_eq!(t.ssrc, Some(0x30a9_8ee7));
        assert_eq!(t.source, Some("192.168.5.111".parse().unwrap()));
        assert!(!t.is_interleaved());
        assert_eq!(t.receive_rtp_port(), Some(6970));
    }

    #[test]
    fn casefolded_keys_and_single_port() {
        let t = Transport::parse("rtp/avp/udp;Unicast;Client_Port=5000;SSRC=0000BEEF").unwrap();
        assert_eq!(t.client_port, Some((5000, 5001)));
        assert_eq!(t.ssrc, Some(0xbeef));

        let t = Transport::parse("RTP/AVP;unicast;client_port=5000-5001;ssrc= 0x1A2B ").unwrap();
        assert_eq!(t.ssrc, Some(0x1a2b));
        Transport::parse("RTP/AVP;unicast;client_port=5000-5001;ssrc=12 34").unwrap_err();
    }

    #[test]
    fn multicast() {
        let t = Transport::parse(
            "RTP/AVP;multicast;destination=232.1.1.1;port=5004-5005;ttl=16",
        )
        .unwrap();
        assert!(t.multicast);
        assert_eq!(t.destination, Some("232.1.1.1".parse().unwrap()));
        assert_eq!(t.receive_rtp_port(), Some(5004));
    }

    #[test]
    fn interleaved() {
        let t = Transport::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        assert_eq!(t.lower_transport, LowerTransport::Tcp);
        assert_eq!(t.interleaved, Some((0, 1)));
        assert!(t.is_interleaved());
    }

    #[test]
    fn alternatives_and_merge() {
        let req = Transport::parse(
            "RTP/AVP;unicast;client_port=6970-6971, RTP/AVP/TCP;interleaved=0-1",
        )
        .unwrap();
        assert_eq!(req.client_port, Some((6970, 6971)));
        let mut resp = Transport::parse("RTP/AVP;unicast;server_port=9000-9001").unwrap();
        assert_eq!(resp.receive_rtp_port(), None);
        resp.merge_request(&req);
        assert_eq!(resp.receive_rtp_port(), Some(6970));
    }

    #[test]
    fn bad() {
        Transport::parse("RTP/AVP;client_port=x-y").unwrap_err();
        Transport::parse("RAW/RAW/UDP;client_port=1-2").unwrap_err();
        Transport::parse("RTP/AVP;client_port=65535").unwrap_err();
    }

    #[test]
    fn session_header() {
        assert_eq!(
            SessionHeader::parse("634214675641;timeout=60").unwrap(),
            SessionHeader {
                id: "634214675641".into(),
                timeout_sec: 60
            }
        );
        assert_eq!(SessionHeader::parse("abc").unwrap().timeout_sec, 60);
        SessionHeader::parse("abc;foo=bar").unwrap_err();
    }
}
