// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::num::NonZeroU32;

use log::debug;

use crate::Timestamp;

/// Forward jumps longer than this are logged; captures often span camera
/// restarts and such jumps are otherwise accepted.
const NOTABLE_FORWARD_JUMP_SECS: i64 = 10;

/// Creates [Timestamp]s (which don't wrap and can be converted to NPT aka normal play time)
/// from 32-bit (wrapping) RTP timestamps.
///
/// The first timestamp seen becomes the start. Each later timestamp is placed
/// relative to the previous one by signed 32-bit delta, so both wraparound
/// and modest backward steps (B-frames, retransmissions) are handled.
#[derive(Debug)]
pub struct Timeline {
    timestamp: i64,
    clock_rate: NonZeroU32,
    start: Option<u32>,

    /// Set when the previous timestamp belongs to another source.
    resync: bool,
}

impl Timeline {
    /// Creates a new timeline, erroring on a zero clock rate.
    pub fn new(clock_rate: u32) -> Result<Self, String> {
        let clock_rate = NonZeroU32::new(clock_rate)
            .ok_or_else(|| "clock_rate=0 rejected to prevent division by zero".to_string())?;
        Ok(Timeline {
            timestamp: 0,
            clock_rate,
            start: None,
            resync: false,
        })
    }

    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }

    /// Continues the timeline with a new source (SSRC), whose timestamps are
    /// unrelated to the previous source's.
    ///
    /// The next timestamp is placed at or after the latest one, at the nearest
    /// value with the same bottom 32 bits, so the timeline never steps back.
    pub fn resync(&mut self) {
        self.resync = self.start.is_some();
    }

    /// Advances to the given (wrapping) RTP timestamp.
    pub fn advance_to(&mut self, rtp_timestamp: u32) -> Result<Timestamp, String> {
        let start = match self.start {
            None => {
                self.start = Some(rtp_timestamp);
                self.timestamp = i64::from(rtp_timestamp);
                rtp_timestamp
            }
            Some(start) => start,
        };
        let delta = if std::mem::take(&mut self.resync) {
            i64::from(rtp_timestamp.wrapping_sub(self.timestamp as u32))
        } else {
            crate::rtp::timestamp_delta(rtp_timestamp, self.timestamp as u32)
        };
        let timestamp = self.timestamp.checked_add(delta).ok_or_else(|| {
            format!(
                "timestamp {} + delta {} won't fit in i64!",
                self.timestamp, delta
            )
        })?;
        if delta > NOTABLE_FORWARD_JUMP_SECS * i64::from(self.clock_rate.get()) {
            debug!(
                "timestamp jumped {} ({:.03} sec) from {} to {}",
                delta,
                (delta as f64) / f64::from(self.clock_rate.get()),
                self.timestamp,
                timestamp
            );
        }
        let ts = Timestamp::new(timestamp, self.clock_rate, start).ok_or_else(|| {
            format!(
                "timestamp {} + delta {} - start {} underflows i64!",
                self.timestamp, delta, start
            )
        })?;
        self.timestamp = timestamp;
        Ok(ts)
    }
}
