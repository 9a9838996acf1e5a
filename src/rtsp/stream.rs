// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reassembles one direction of a captured TCP connection into RTSP messages.

use bytes::{Buf, Bytes, BytesMut};
use log::debug;
use rtsp_types::Message;

use crate::capture::TcpSegment;

/// Out-of-order segments held while waiting for a gap to fill.
const MAX_OUT_OF_ORDER: usize = 30;

/// A unit parsed from the byte stream.
#[derive(Debug)]
pub(crate) enum Chunk {
    Message(Message<Bytes>),

    /// An RTSP interleaved binary frame (`$`, channel, length); its contents are dropped.
    Interleaved { channel_id: u8, len: usize },
}

/// One direction of an RTSP connection.
#[derive(Default)]
pub(crate) struct HalfConnection {
    /// The sequence number of the next byte expected, once known.
    next_seq: Option<u32>,

    /// Segments which arrived ahead of `next_seq`.
    pending: Vec<(u32, Bytes)>,

    /// In-order bytes not yet parsed into a message.
    buf: BytesMut,

    /// Set after a gap or parse error; data is discarded until a segment
    /// starts with something that looks like a message boundary.
    resyncing: bool,
}

impl HalfConnection {
    /// Adds a captured segment. Returns an error description if bytes were lost.
    pub(crate) fn push(&mut self, seg: &TcpSegment, payload: Bytes) -> Result<(), String> {
        if seg.syn {
            self.next_seq = Some(seg.sequence_number.wrapping_add(1));
            return Ok(());
        }
        if payload.is_empty() {
            return Ok(());
        }
        let next = *self.next_seq.get_or_insert(seg.sequence_number);
        if seq_delta(seg.sequence_number, next) > 0 {
            self.pending.push((seg.sequence_number, payload));
            if self.pending.len() <= MAX_OUT_OF_ORDER {
                return Ok(());
            }

            // Give up on the gap: skip ahead to the earliest held segment.
            let earliest = self
                .pending
                .iter()
                .map(|&(s, _)| s)
                .min_by_key(|&s| seq_delta(s, next))
                .unwrap_or(next);
            let lost = seq_delta(earliest, next);
            self.next_seq = Some(earliest);
            self.buf.clear();
            self.resyncing = true;
            self.drain_pending();
            return Err(format!("{lost} bytes missing from TCP stream; resynchronizing"));
        }
        self.append(seg.sequence_number, payload);
        self.drain_pending();
        Ok(())
    }

    /// Appends `payload`, which starts at or before `next_seq`, trimming any
    /// retransmitted prefix.
    fn append(&mut self, seq: u32, payload: Bytes) {
        let Some(next) = self.next_seq else { return };
        let overlap = usize::try_from(-seq_delta(seq, next)).unwrap_or(0);
        if overlap >= payload.len() {
            return; // pure retransmission.
        }
        let new = &payload[overlap..];
        if self.resyncing {
            if !looks_like_message_start(new) {
                self.next_seq = Some(next.wrapping_add(new.len() as u32));
                return;
            }
            self.resyncing = false;
        }
        self.buf.extend_from_slice(new);
        self.next_seq = Some(next.wrapping_add(new.len() as u32));
    }

    fn drain_pending(&mut self) {
        while let Some(next) = self.next_seq {
            let Some(i) = self
                .pending
                .iter()
                .position(|&(s, _)| seq_delta(s, next) <= 0)
            else {
                return;
            };
            let (seq, payload) = self.pending.swap_remove(i);
            self.append(seq, payload);
        }
    }

    /// Parses the next complete message from the buffer, if any.
    ///
    /// On a parse error, the buffer is discarded and the connection waits for
    /// a plausible message start.
    pub(crate) fn next_chunk(&mut self) -> Result<Option<Chunk>, String> {
        // Skip whitespace as `rtsp-types` does, so an interleaved frame is
        // recognized at the start of the buffer.
        while self.buf.starts_with(b"\r\n") {
            self.buf.advance(2);
        }
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf[0] == b'$' {
            if self.buf.len() < 4 {
                return Ok(None);
            }
            let channel_id = self.buf[1];
            let len = usize::from(u16::from_be_bytes([self.buf[2], self.buf[3]]));
            if self.buf.len() < 4 + len {
                return Ok(None);
            }
            self.buf.advance(4 + len);
            return Ok(Some(Chunk::Interleaved { channel_id, len }));
        }
        let (msg, len) = match Message::parse(&self.buf[..]) {
            Ok((m, l)) => (to_owned_message(m), l),
            Err(rtsp_types::ParseError::Incomplete(_)) => return Ok(None),
            Err(rtsp_types::ParseError::Error) => {
                let description = format!(
                    "invalid RTSP message; buffered:\n{}",
                    crate::hex_dump(&self.buf[..], 128)
                );
                self.buf.clear();
                self.resyncing = true;
                return Err(description);
            }
        };
        self.buf.advance(len);
        Ok(Some(Chunk::Message(msg)))
    }

    /// Returns the number of buffered bytes which never formed a message.
    pub(crate) fn leftover(&self) -> usize {
        self.buf.len() + self.pending.iter().map(|(_, p)| p.len()).sum::<usize>()
    }
}

/// Maps a borrowed message to one which owns its body.
fn to_owned_message(m: Message<&[u8]>) -> Message<Bytes> {
    match m {
        Message::Request(r) => Message::Request(r.map_body(Bytes::copy_from_slice)),
        Message::Response(r) => Message::Response(r.map_body(Bytes::copy_from_slice)),
        Message::Data(d) => {
            let channel_id = d.channel_id();
            debug!("unexpected data message on channel {channel_id}");
            Message::Data(rtsp_types::Data::new(
                channel_id,
                Bytes::copy_from_slice(d.into_body()),
            ))
        }
    }
}

#[inline]
fn seq_delta(a: u32, b: u32) -> i64 {
    i64::from(a.wrapping_sub(b) as i32)
}

const METHODS: [&[u8]; 11] = [
    b"ANNOUNCE ",
    b"DESCRIBE ",
    b"GET_PARAMETER ",
    b"OPTIONS ",
    b"PAUSE ",
    b"PLAY ",
    b"RECORD ",
    b"REDIRECT ",
    b"SETUP ",
    b"SET_PARAMETER ",
    b"TEARDOWN ",
];

/// Returns true if `data` plausibly starts an RTSP message or interleaved frame.
pub(crate) fn looks_like_message_start(data: &[u8]) -> bool {
    data.starts_with(b"RTSP/1.")
        || data.first() == Some(&b'$')
        || METHODS.iter().any(|m| data.starts_with(m))
}
