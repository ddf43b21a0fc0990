//! Leaky-bucket lookup and update.

use super::autoblock::AutoBlock;
use super::clock::Timestamp;
use super::fixed::charge;
use super::key::CompositeKey;
use super::segment::{self, SegmentReading};
use super::store::ZoneTable;

/// Per-rule bucket parameters, all fixed-point except `rate_seg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketParams {
    /// Drain rate, requests per second ×1000.
    pub rate: u64,
    /// Largest excess tolerated, ×1000.
    pub burst: u64,
    /// Segment length in milliseconds for the QPS estimator; 0 disables it.
    pub rate_seg: u64,
    pub auto_block: Option<AutoBlock>,
}

/// Result of one lookup against a zone table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// No record for the key; the caller creates one.
    Miss,
    /// The key is hard-blocked until `until` (seconds).
    Blocked { until: u64 },
    /// Over burst; the request is refused and the record left as it was.
    Rejected { excess: u64 },
    /// Within burst but above zero; the request may be delayed.
    Throttled { excess: u64 },
    /// The bucket is empty.
    Allowed,
}

impl Lookup {
    /// Whether the request must be refused.
    pub fn is_refusal(&self) -> bool {
        matches!(self, Lookup::Blocked { .. } | Lookup::Rejected { .. })
    }

    /// Excess computed by this lookup, 0 when none was.
    pub fn excess(&self) -> u64 {
        match self {
            Lookup::Rejected { excess } | Lookup::Throttled { excess } => *excess,
            _ => 0,
        }
    }
}

/// A lookup result plus the segment estimator reading it produced, if the
/// rule has a segment size and the request was counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub lookup: Lookup,
    pub segment: Option<SegmentReading>,
}

/// Find the record for `key`, decay its excess to `now` and charge one request.
///
/// A hit is promoted to the head of the recency list whatever the outcome.
/// Rejected requests only feed the auto-block statistics; excess and
/// `last_update_ms` stay untouched so the next request recomputes from the
/// last accepted state.
pub fn lookup(
    table: &mut ZoneTable,
    key: &CompositeKey,
    params: &BucketParams,
    now: Timestamp,
) -> Outcome {
    let fresh = (params.rate_seg > 0).then_some(SegmentReading::FRESH);

    let Some(id) = table.find_and_touch(key) else {
        return Outcome {
            lookup: Lookup::Miss,
            segment: fresh,
        };
    };
    let Some(record) = table.get_mut(id) else {
        return Outcome {
            lookup: Lookup::Miss,
            segment: fresh,
        };
    };

    let now_sec = now.as_secs();
    if record.block.is_blocked(now_sec) {
        return Outcome {
            lookup: Lookup::Blocked {
                until: record.block.stop_time,
            },
            segment: None,
        };
    }

    let elapsed = now.millis_since(record.last_update_ms);
    let excess = charge(record.excess, params.rate, elapsed);

    if excess > params.burst {
        let escalated = params
            .auto_block
            .map(|policy| policy.observe_overage(&mut record.block, now_sec))
            .unwrap_or(false);

        let lookup = if escalated {
            Lookup::Blocked {
                until: record.block.stop_time,
            }
        } else {
            Lookup::Rejected { excess }
        };
        return Outcome {
            lookup,
            segment: None,
        };
    }

    let segment = (params.rate_seg > 0)
        .then(|| segment::roll(record, params.rate_seg, now.as_millis()));

    record.excess = excess;
    record.last_update_ms = now.as_millis();

    let lookup = if excess > 0 {
        Lookup::Throttled { excess }
    } else {
        Lookup::Allowed
    };
    Outcome { lookup, segment }
}
