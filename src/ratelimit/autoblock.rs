//! Auto-block escalation.
//!
//! Every over-burst request marks the observation window it falls in. Once
//! overage has been seen in each of `windows` consecutive windows of
//! `interval` seconds, the key is hard-blocked for `duration` seconds.
//! Sparse overage slides the window sequence forward instead of escalating.

use super::bitstat::{BlockStat, MAX_WINDOWS};

/// Per-record escalation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockState {
    /// Windows of the current sequence that saw overage.
    pub stat: BlockStat,
    /// Start of window 0, in seconds.
    pub base: u64,
    /// Hard block deadline in seconds; 0 or a past time means not blocked.
    pub stop_time: u64,
}

impl BlockState {
    /// Whether the hard block is still in force at `now_sec`.
    pub fn is_blocked(&self, now_sec: u64) -> bool {
        self.stop_time > now_sec
    }

    /// The block deadline if it is still in the future, else 0.
    pub fn active_stop_time(&self, now_sec: u64) -> u64 {
        if self.is_blocked(now_sec) {
            self.stop_time
        } else {
            0
        }
    }
}

/// Escalation parameters, written `windows x interval x duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoBlock {
    windows: u32,
    interval: u64,
    duration: u64,
}

impl AutoBlock {
    /// Returns `None` unless `1 <= windows <= 64` and both durations are positive.
    pub fn new(windows: u32, interval: u64, duration: u64) -> Option<Self> {
        if windows == 0 || windows > MAX_WINDOWS || interval == 0 || duration == 0 {
            return None;
        }
        Some(Self {
            windows,
            interval,
            duration,
        })
    }

    pub fn windows(&self) -> u32 {
        self.windows
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn duration(&self) -> u64 {
        self.duration
    }

    /// Record one overage event at `now_sec`. Returns true when this event
    /// escalated to a hard block.
    pub fn observe_overage(&self, state: &mut BlockState, now_sec: u64) -> bool {
        let last = self.windows - 1;
        let diff = now_sec.saturating_sub(state.base);

        if diff >= self.interval.saturating_mul(self.windows as u64) {
            // whole sequence is stale, restart it here
            state.base = now_sec;
            state.stat = BlockStat::first_window();
            return false;
        }

        if diff < self.interval.saturating_mul(last as u64) {
            state.stat.set((diff / self.interval) as u32);
            return false;
        }

        state.stat.set(last);

        match state.stat.highest_unset_below(last) {
            None => {
                state.stop_time = now_sec.saturating_add(self.duration);
                state.stat.shift_out(1);
                state.base = state.base.saturating_add(self.interval);
                true
            }
            Some(last_zero) => {
                let skip = last_zero + 1;
                state.stat.shift_out(skip);
                state.base = state
                    .base
                    .saturating_add(self.interval.saturating_mul(skip as u64));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000;

    #[test]
    fn test_new_validates_bounds() {
        assert!(AutoBlock::new(0, 60, 1800).is_none());
        assert!(AutoBlock::new(65, 60, 1800).is_none());
        assert!(AutoBlock::new(5, 0, 1800).is_none());
        assert!(AutoBlock::new(5, 60, 0).is_none());
        assert!(AutoBlock::new(64, 60, 1800).is_some());
    }

    #[test]
    fn test_first_overage_starts_sequence() {
        let policy = AutoBlock::new(3, 60, 600).unwrap();
        let mut state = BlockState::default();

        assert!(!policy.observe_overage(&mut state, T0));
        assert_eq!(state.base, T0);
        assert_eq!(state.stat, BlockStat::first_window());
        assert_eq!(state.stop_time, 0);
    }

    #[test]
    fn test_gap_in_middle_window_never_escalates() {
        let policy = AutoBlock::new(3, 60, 600).unwrap();
        let mut state = BlockState::default();

        // window 0
        assert!(!policy.observe_overage(&mut state, T0));
        // window 1 is clean; window 2
        assert!(!policy.observe_overage(&mut state, T0 + 125));
        assert_eq!(state.stop_time, 0);
        // fast-forwarded past the gap: old window 2 is the new window 0
        assert_eq!(state.base, T0 + 120);
        assert_eq!(state.stat, BlockStat::first_window());
    }

    #[test]
    fn test_full_coverage_escalates() {
        let policy = AutoBlock::new(3, 60, 600).unwrap();
        let mut state = BlockState::default();

        assert!(!policy.observe_overage(&mut state, T0));
        assert!(!policy.observe_overage(&mut state, T0 + 70));
        assert!(policy.observe_overage(&mut state, T0 + 130));

        assert_eq!(state.stop_time, T0 + 130 + 600);
        assert!(state.is_blocked(T0 + 131));
        assert!(!state.is_blocked(T0 + 730));
        // oldest window dropped, sequence advanced by one interval
        assert_eq!(state.base, T0 + 60);
        assert!(state.stat.get(0));
        assert!(state.stat.get(1));
        assert!(!state.stat.get(2));
    }

    #[test]
    fn test_stale_sequence_resets() {
        let policy = AutoBlock::new(3, 60, 600).unwrap();
        let mut state = BlockState::default();

        policy.observe_overage(&mut state, T0);
        policy.observe_overage(&mut state, T0 + 61);
        assert!(!policy.observe_overage(&mut state, T0 + 180));
        assert_eq!(state.base, T0 + 180);
        assert_eq!(state.stat, BlockStat::first_window());
    }

    #[test]
    fn test_single_window_escalates_on_second_overage() {
        let policy = AutoBlock::new(1, 60, 300).unwrap();
        let mut state = BlockState::default();

        assert!(!policy.observe_overage(&mut state, T0));
        assert!(policy.observe_overage(&mut state, T0 + 10));
        assert_eq!(state.stop_time, T0 + 310);
    }

    #[test]
    fn test_huge_durations_saturate() {
        let policy = AutoBlock::new(1, u64::MAX, u64::MAX).unwrap();
        let mut state = BlockState::default();

        // the first window never goes stale, so the first overage escalates
        assert!(policy.observe_overage(&mut state, T0));
        assert_eq!(state.stop_time, u64::MAX);
        assert_eq!(state.base, u64::MAX);

        assert!(policy.observe_overage(&mut state, T0 + 10));
        assert_eq!(state.stop_time, u64::MAX);
        assert!(state.is_blocked(T0 + 10));
    }

    #[test]
    fn test_gap_skip_with_huge_interval() {
        let policy = AutoBlock::new(3, u64::MAX / 2, 600).unwrap();
        let mut state = BlockState::default();

        // window 0, then window 2 with a clean window 1 between
        assert!(!policy.observe_overage(&mut state, 0));
        assert!(!policy.observe_overage(&mut state, u64::MAX - 1));
        assert_eq!(state.stop_time, 0);
        assert_eq!(state.base, u64::MAX - 1);
    }

    #[test]
    fn test_active_stop_time() {
        let state = BlockState {
            stop_time: T0 + 5,
            ..Default::default()
        };
        assert_eq!(state.active_stop_time(T0), T0 + 5);
        assert_eq!(state.active_stop_time(T0 + 5), 0);
    }
}
