//! Fixed-point rate arithmetic.
//!
//! Rates and excess values are integers scaled by 1000: one unit is
//! 0.001 requests, so a single request costs [`REQUEST_COST`] units.

use std::fmt;

use crate::error::{Result, ZonelimitError};

/// Fixed-point cost of one request.
pub const REQUEST_COST: i64 = 1000;

/// Smallest zone size accepted by configuration (eight 4 KiB pages).
pub const MIN_ZONE_SIZE: usize = 8 * 4096;

/// A fixed-point value such as a rate or an excess, rendered as `N.NNN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Milli(pub u64);

impl fmt::Display for Milli {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.0 / 1000, self.0 % 1000)
    }
}

/// Parse a rate such as `10r/s` or `30r/m` into requests per second ×1000.
///
/// A bare number is read as requests per second.
pub fn parse_rate(value: &str) -> Result<u64> {
    let (digits, scale) = if let Some(n) = value.strip_suffix("r/s") {
        (n, 1)
    } else if let Some(n) = value.strip_suffix("r/m") {
        (n, 60)
    } else {
        (value, 1)
    };

    let rate: u64 = digits
        .trim()
        .parse()
        .map_err(|_| ZonelimitError::config(format!("invalid rate \"{}\"", value)))?;

    if rate == 0 {
        return Err(ZonelimitError::config(format!("invalid rate \"{}\"", value)));
    }

    rate.checked_mul(1000)
        .map(|r| r / scale)
        .filter(|&milli| milli > 0)
        .ok_or_else(|| ZonelimitError::config(format!("invalid rate \"{}\"", value)))
}

/// Parse a size such as `10m`, `512k` or `65536` into bytes.
pub fn parse_size(value: &str) -> Result<usize> {
    let trimmed = value.trim();
    let (digits, unit) = match trimmed.char_indices().last() {
        Some((idx, 'k' | 'K')) => (&trimmed[..idx], 1024),
        Some((idx, 'm' | 'M')) => (&trimmed[..idx], 1024 * 1024),
        Some((idx, 'g' | 'G')) => (&trimmed[..idx], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };

    digits
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(unit))
        .ok_or_else(|| ZonelimitError::config(format!("invalid zone size \"{}\"", value)))
}

/// Excess remaining after `elapsed_ms` of draining at `rate`, before any new cost.
///
/// The result may be negative; callers clamp as their rule requires.
#[inline]
pub fn drain(excess: u64, rate: u64, elapsed_ms: u64) -> i64 {
    let drained = (rate as i128 * elapsed_ms as i128 / 1000).min(i64::MAX as i128) as i64;
    (excess as i64).saturating_sub(drained)
}

/// Decayed excess after adding one request's cost, clamped at zero.
#[inline]
pub fn charge(excess: u64, rate: u64, elapsed_ms: u64) -> u64 {
    drain(excess, rate, elapsed_ms)
        .saturating_add(REQUEST_COST)
        .max(0) as u64
}

/// Milliseconds a request must wait for `excess` to drain at `rate`.
#[inline]
pub fn delay_ms(excess: u64, rate: u64) -> u64 {
    if rate == 0 {
        return 0;
    }
    excess.saturating_mul(1000) / rate
}
