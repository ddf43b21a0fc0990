//! Requests-per-segment estimator.
//!
//! Diagnostic only: allow and deny decisions never read it. Time is cut into
//! fixed segments of `rate_seg` milliseconds. Each record counts the previous
//! full segment and the current partial one.

use std::fmt;

use super::fixed::Milli;
use super::store::Record;

/// Counters observed by one lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentReading {
    pub last_seg: u64,
    pub curr_seg: u64,
    /// Milliseconds already spent in the current segment.
    pub time_diff: u64,
}

impl SegmentReading {
    /// Reading reported for a key seen for the first time.
    pub const FRESH: SegmentReading = SegmentReading {
        last_seg: 0,
        curr_seg: 1,
        time_diff: 0,
    };
}

/// Advance a record's segment counters to `now_ms` and count this request.
pub fn roll(record: &mut Record, rate_seg: u64, now_ms: u64) -> SegmentReading {
    let last = record.last_update_ms / rate_seg;
    let curr = now_ms / rate_seg;

    if curr > last + 1 {
        record.last_seg = 0;
        record.curr_seg = 1;
    } else if curr == last + 1 {
        record.last_seg = record.curr_seg;
        record.curr_seg = 1;
    } else if curr == last {
        record.curr_seg += 1;
    } else {
        // clock stepped backwards
        record.last_seg = 0;
        record.curr_seg = 0;
    }

    SegmentReading {
        last_seg: record.last_seg,
        curr_seg: record.curr_seg,
        time_diff: now_ms % rate_seg,
    }
}

/// The latest reading of a rule with a segment size, as exposed through the
/// rate attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSnapshot {
    pub rate_seg: u64,
    pub reading: SegmentReading,
}

impl SegmentSnapshot {
    /// Requests seen across the previous and current segment.
    pub fn count(&self) -> u64 {
        self.reading.last_seg + self.reading.curr_seg
    }

    /// Length of the span `count` was observed over, in milliseconds.
    pub fn span_ms(&self) -> u64 {
        self.rate_seg + self.reading.time_diff
    }

    /// Estimated requests per second, fixed-point.
    pub fn qps(&self) -> Milli {
        match self.span_ms() {
            0 => Milli(0),
            span => Milli(self.count() * 1000 * 1000 / span),
        }
    }
}

impl fmt::Display for SegmentSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "COUNT={};SEG={};QPS={}",
            self.count(),
            self.span_ms(),
            self.qps()
        )
    }
}
