use core::fmt;

use serde::Serialize;

/// A reading of the platform tick counter in milliseconds.
///
/// The counter is 32 bits wide, like `millis()` on the boards this firmware
/// targets, and wraps roughly every 49.7 days. Never compare two readings with
/// `<`; use [`Millis::elapsed_since`], which stays correct across one wrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Millis(pub u32);

impl Millis {
    pub const ZERO: Self = Self(0);

    /// Truncates a wide millisecond count onto the 32-bit counter.
    pub fn from_wide(ms: u64) -> Self {
        Self(ms as u32)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn elapsed_since(self, earlier: Millis) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// True once strictly more than `interval_ms` has passed since `earlier`.
    pub fn has_elapsed(self, earlier: Millis, interval_ms: u32) -> bool {
        self.elapsed_since(earlier) > interval_ms
    }

    pub fn wrapping_add(self, ms: u32) -> Self {
        Self(self.0.wrapping_add(ms))
    }
}

impl fmt::Display for Millis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

pub trait MonotonicClock {
    fn now(&self) -> Millis;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_is_plain_difference_without_wrap() {
        assert_eq!(Millis(5_000).elapsed_since(Millis(1_000)), 4_000);
    }

    #[test]
    fn elapsed_survives_counter_wrap() {
        let before = Millis(u32::MAX - 999);
        let after = before.wrapping_add(3_000);

        assert_eq!(after, Millis(2_000));
        assert_eq!(after.elapsed_since(before), 3_000);
    }

    #[test]
    fn has_elapsed_is_strict() {
        let start = Millis(100);
        assert!(!Millis(5_100).has_elapsed(start, 5_000));
        assert!(Millis(5_101).has_elapsed(start, 5_000));
    }

    #[test]
    fn wide_counts_truncate_onto_the_counter() {
        assert_eq!(Millis::from_wide(u64::from(u32::MAX) + 11), Millis(10));
    }
}
