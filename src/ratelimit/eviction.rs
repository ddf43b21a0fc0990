//! Bounded eviction of least-recently-used records.
//!
//! Runs under the zone lock on every request, so each call does a constant
//! amount of work: at most [`MAX_ROTATIONS`] skips plus three deletions.

use tracing::trace;

use super::clock::Timestamp;
use super::fixed::drain;
use super::store::ZoneTable;

/// A record is only idle once it has not been updated for this long.
pub const IDLE_THRESHOLD_MS: u64 = 60_000;

/// Cap on block-active records rotated past in one sweep.
pub const MAX_ROTATIONS: usize = 100;

/// How aggressively a sweep reclaims records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireMode {
    /// Per-request sweep: delete up to two idle records, stop at the first busy one.
    Light,
    /// Allocation-failure sweep: delete the LRU record unconditionally, then
    /// continue as a light sweep.
    Forced,
}

impl ZoneTable {
    /// Reclaim records from the tail of the recency list.
    ///
    /// Records still inside a hard block are rotated to the head instead of
    /// being considered, until either the first rotated record comes back
    /// around or [`MAX_ROTATIONS`] is reached; past that point they are
    /// judged like any other record. Returns the number of records deleted.
    ///
    /// The early stop on a busy record assumes recency order follows
    /// idleness, which rotations can disturb; it prunes work and does not
    /// promise every idle record is found.
    pub fn expire(&mut self, now: Timestamp, rate: u64, mode: ExpireMode) -> usize {
        let mut passes = match mode {
            ExpireMode::Forced => 0,
            ExpireMode::Light => 1,
        };
        let mut rotations = 0;
        let mut first_rotated = None;
        let mut deleted = 0;

        while passes < 3 {
            let Some(id) = self.tail() else {
                break;
            };
            let Some(record) = self.get(id) else {
                break;
            };

            if record.block.is_blocked(now.as_secs())
                && first_rotated != Some(id)
                && rotations < MAX_ROTATIONS
            {
                first_rotated.get_or_insert(id);
                rotations += 1;
                self.move_to_head(id);
                continue;
            }

            let forced = passes == 0;
            passes += 1;

            if !forced {
                let elapsed = now.millis_since(record.last_update_ms);
                if elapsed < IDLE_THRESHOLD_MS {
                    break;
                }
                if drain(record.excess, rate, elapsed) > 0 {
                    break;
                }
            }

            if let Some(record) = self.remove(id) {
                trace!(key_hash = record.hash(), forced, "Evicted record");
                deleted += 1;
            }
        }

        deleted
    }
}
