//! 64-bit window statistics used by auto-block escalation.

/// Maximum number of observation windows a [`BlockStat`] can track.
pub const MAX_WINDOWS: u32 = 64;

/// A fixed-width bitset where bit `i` marks overage seen in window `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockStat(u64);

impl BlockStat {
    /// An empty set.
    pub const fn empty() -> Self {
        BlockStat(0)
    }

    /// A set holding only the first window.
    pub const fn first_window() -> Self {
        BlockStat(1)
    }

    /// Raw bits, oldest window in bit 0.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Whether window `idx` saw overage.
    pub fn get(&self, idx: u32) -> bool {
        idx < MAX_WINDOWS && (self.0 >> idx) & 1 == 1
    }

    /// Mark window `idx` as having seen overage.
    pub fn set(&mut self, idx: u32) {
        if idx < MAX_WINDOWS {
            self.0 |= 1 << idx;
        }
    }

    /// Drop the `n` oldest windows, sliding the rest down.
    pub fn shift_out(&mut self, n: u32) {
        self.0 = self.0.checked_shr(n).unwrap_or(0);
    }

    /// Whether every window below `n` is marked.
    pub fn all_set_below(&self, n: u32) -> bool {
        self.highest_unset_below(n).is_none()
    }

    /// Highest unmarked window index below `n`, if any.
    pub fn highest_unset_below(&self, n: u32) -> Option<u32> {
        (0..n.min(MAX_WINDOWS)).rev().find(|&idx| !self.get(idx))
    }
}
