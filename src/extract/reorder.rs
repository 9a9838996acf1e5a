// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded per-track reordering by RTP sequence number.

use std::collections::VecDeque;

use log::{debug, info};

use crate::rtp::seq_delta;

/// How far ahead of the next expected sequence number a packet may arrive
/// before the window is forced forward, declaring the skipped packets lost.
pub const MAX_OUT_OF_ORDER_PACKETS: usize = 50;

/// What happened to a packet given to [`Reorder::insert`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Insert {
    Accepted,

    /// A packet with this sequence number is already buffered.
    Duplicate,

    /// Arrived after its slot was released or declared lost; dropped.
    Late,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReorderStats {
    pub duplicates: u64,
    pub late: u64,
    pub lost: u64,
}

/// Reorders items keyed by 16-bit wrapping sequence number.
///
/// Items are released in sequence order along with the number of sequence
/// numbers skipped immediately before each.
#[derive(Debug)]
pub struct Reorder<T> {
    /// The sequence number of `window[0]`.
    next_seq: Option<u16>,
    window: VecDeque<Option<T>>,

    /// Sequence numbers skipped since the last released item.
    pending_loss: u32,

    /// Consecutive late packets, used to detect a sequence number reset.
    late_run: usize,
    stats: ReorderStats,
}

impl<T> Default for Reorder<T> {
    fn default() -> Self {
        Reorder {
            next_seq: None,
            window: VecDeque::with_capacity(MAX_OUT_OF_ORDER_PACKETS),
            pending_loss: 0,
            late_run: 0,
            stats: ReorderStats::default(),
        }
    }
}

impl<T> Reorder<T> {
    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    /// Inserts an item, appending any items now releasable to `out` as
    /// `(loss, item)`.
    pub fn insert(&mut self, seq: u16, item: T, out: &mut Vec<(u16, T)>) -> Insert {
        let next_seq = *self.next_seq.get_or_insert(seq);
        let delta = seq_delta(seq, next_seq);
        if delta < 0 {
            self.late_run += 1;
            if self.late_run <= MAX_OUT_OF_ORDER_PACKETS {
                self.stats.late += 1;
                return Insert::Late;
            }

            // Too many in a row to be stragglers; the sender restarted its
            // sequence numbers.
            info!("sequence number reset from {next_seq:04x} to {seq:04x}");
            self.flush(out);
            self.next_seq = Some(seq);
            return self.insert(seq, item, out);
        }
        self.late_run = 0;
        let mut idx = delta as usize;
        if idx >= MAX_OUT_OF_ORDER_PACKETS {
            let shift = idx + 1 - MAX_OUT_OF_ORDER_PACKETS;
            debug!(
                "seq {seq:04x} is {delta} ahead of {next_seq:04x}; giving up on {shift} slots"
            );
            self.advance(shift, out);
            idx = MAX_OUT_OF_ORDER_PACKETS - 1;
        }
        if self.window.len() <= idx {
            self.window.resize_with(idx + 1, || None);
        }
        let slot = &mut self.window[idx];
        if slot.is_some() {
            self.stats.duplicates += 1;
            return Insert::Duplicate;
        }
        *slot = Some(item);
        self.drain_ready(out);
        Insert::Accepted
    }

    /// Releases everything buffered, counting holes as loss.
    pub fn flush(&mut self, out: &mut Vec<(u16, T)>) {
        let len = self.window.len();
        self.advance(len, out);
    }

    /// Forgets all state, as when the stream's SSRC changes.
    pub fn reset(&mut self, out: &mut Vec<(u16, T)>) {
        self.flush(out);
        self.next_seq = None;
        self.pending_loss = 0;
        self.late_run = 0;
    }

    /// Moves the window forward by `n` slots, releasing filled ones.
    fn advance(&mut self, n: usize, out: &mut Vec<(u16, T)>) {
        let Some(next_seq) = self.next_seq else {
            return;
        };
        let buffered = n.min(self.window.len());
        let drained: Vec<Option<T>> = self.window.drain(..buffered).collect();
        for slot in drained {
            match slot {
                Some(item) => {
                    out.push((clamp_loss(self.pending_loss), item));
                    self.pending_loss = 0;
                }
                None => self.lose(1),
            }
        }
        self.lose((n - buffered) as u32);
        self.next_seq = Some(next_seq.wrapping_add(n as u16));
    }

    fn drain_ready(&mut self, out: &mut Vec<(u16, T)>) {
        let mut released = 0u16;
        while let Some(Some(_)) = self.window.front() {
            if let Some(Some(item)) = self.window.pop_front() {
                out.push((clamp_loss(self.pending_loss), item));
                self.pending_loss = 0;
                released += 1;
            }
        }
        if let Some(s) = self.next_seq.as_mut() {
            *s = s.wrapping_add(released);
        }
    }

    fn lose(&mut self, n: u32) {
        self.pending_loss = self.pending_loss.saturating_add(n);
        self.stats.lost += u64::from(n);
    }
}

fn clamp_loss(loss: u32) -> u16 {
    u16::try_from(loss).unwrap_or(u16::MAX)
}
