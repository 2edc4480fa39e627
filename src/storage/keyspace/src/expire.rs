// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Compact expiration deadlines.
//!
//! Deadlines are stored as deltas from a per-slice base time so each entry
//! fits in a few bytes. Deltas below [`MS_PRECISION_BOUND`] milliseconds
//! (about 37 hours) keep millisecond precision; longer horizons are rounded
//! to the nearest second on store. The largest representable delta is about
//! 4.25 years; callers enforce [`MAX_EXPIRE_DEADLINE_SEC`] before storing.

/// Magnitudes are confined to 27 bits.
const VAL_MASK: u64 = (1 << 27) - 1;

/// Deltas at or above this many milliseconds lose sub-second precision.
pub(crate) const MS_PRECISION_BOUND: u64 = 1 << 27;

/// Largest storable deadline, in seconds from the base.
pub const MAX_EXPIRE_DEADLINE_SEC: u64 = (1 << 27) - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Precision {
    Millis,
    Secs,
}

/// Delta from the slice's `expire_base`, in compact form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpirePeriod {
    val: u32,
    precision: Precision,
}

impl ExpirePeriod {
    /// Store a delta, rounding to the nearest second once millisecond
    /// precision no longer fits. The caller checks the range; out-of-range
    /// magnitudes saturate.
    pub fn new(delta_ms: u64) -> Self {
        if delta_ms < MS_PRECISION_BOUND {
            Self {
                val: delta_ms as u32,
                precision: Precision::Millis,
            }
        } else {
            let secs = (delta_ms + 500) / 1000;
            Self {
                val: secs.min(VAL_MASK) as u32,
                precision: Precision::Secs,
            }
        }
    }

    /// The stored delta in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        match self.precision {
            Precision::Millis => self.val as u64,
            Precision::Secs => self.val as u64 * 1000,
        }
    }

    /// Convert an absolute deadline to a period against `base_ms`.
    pub fn from_absolute_time(base_ms: u64, deadline_ms: u64) -> Self {
        Self::new(deadline_ms.saturating_sub(base_ms))
    }

    /// The absolute deadline this period encodes against `base_ms`.
    pub fn expire_time(&self, base_ms: u64) -> u64 {
        base_ms + self.duration_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_deltas_keep_millis() {
        let p = ExpirePeriod::new(1500);
        assert_eq!(p.duration_ms(), 1500);
        assert_eq!(p.expire_time(1000), 2500);
    }

    #[test]
    fn long_deltas_round_to_seconds() {
        let delta = MS_PRECISION_BOUND + 1499;
        let p = ExpirePeriod::new(delta);
        let rounded = (delta + 500) / 1000 * 1000;
        assert_eq!(p.duration_ms(), rounded);
    }

    #[test]
    fn precision_boundary() {
        let p = ExpirePeriod::new(MS_PRECISION_BOUND - 1);
        assert_eq!(p.duration_ms(), MS_PRECISION_BOUND - 1);
        let p = ExpirePeriod::new(MS_PRECISION_BOUND);
        assert_eq!(p.duration_ms() % 1000, 0);
    }

    #[test]
    fn saturates_at_horizon() {
        let p = ExpirePeriod::new(u64::MAX);
        assert_eq!(p.duration_ms(), MAX_EXPIRE_DEADLINE_SEC * 1000);
    }

    #[test]
    fn absolute_round_trip() {
        let base = 1_700_000_000_000;
        let deadline = base + 90_000;
        let p = ExpirePeriod::from_absolute_time(base, deadline);
        assert_eq!(p.expire_time(base), deadline);
    }
}
