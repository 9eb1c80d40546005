//! Wraparound-safe sequence ids
//!
//! Network ids are 16-bit counters that wrap. Every ordering question
//! ("is this update newer than the last one I applied?") goes through
//! [`SequenceId::is_newer`]; the other helpers are derived from it so they
//! agree on where the wrap boundary lies.

use std::fmt;

use crate::net::codec::{DecodeError, FieldKind, WireType, WireValue};

/// Half of the id space. A forward distance up to this value counts as newer.
pub const HALF_RANGE: u16 = 32768;

/// Errors raised by sequence range helpers
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("Inverted sequence range: min {min} is newer than max {max}")]
    InvertedRange { min: u16, max: u16 },
}

/// A cyclic 16-bit id with circular ordering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SequenceId(pub u16);

impl SequenceId {
    /// The zero id doubles as the "nothing received yet" sentinel
    pub const ZERO: SequenceId = SequenceId(0);

    #[inline]
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(self) -> u16 {
        self.0
    }

    /// Next id, wrapping past 65535 to 0
    #[inline]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    #[inline]
    pub fn prev(self) -> Self {
        Self(self.0.wrapping_sub(1))
    }

    /// Returns whether `a` occurred after `b`.
    ///
    /// is_newer(2, 1) == true
    /// is_newer(2, 65530) == true (wrapped)
    /// is_newer(1, 1) == false
    #[inline]
    pub fn is_newer(a: SequenceId, b: SequenceId) -> bool {
        let (a, b) = (a.0, b.0);
        ((a > b) && (a - b <= HALF_RANGE)) || ((a < b) && (b - a > HALF_RANGE))
    }

    #[inline]
    pub fn is_newer_or_equal(a: SequenceId, b: SequenceId) -> bool {
        !Self::is_newer(b, a)
    }

    /// Circular distance between two ids along the shorter arc.
    ///
    /// An arc that crosses the wrap point is measured over 65535 steps, so
    /// `difference(5, 65434) == 106`.
    pub fn difference(a: SequenceId, b: SequenceId) -> u16 {
        let (newer, older) = if Self::is_newer(a, b) { (a.0, b.0) } else { (b.0, a.0) };
        if newer >= older {
            newer - older
        } else {
            // wrapped: newer sits just past 0, older just below 65535
            u16::MAX - (older - newer)
        }
    }

    /// Clamp `id` into the circular range `[min, max]`.
    ///
    /// The range must be given in forward order.
    pub fn clamp(id: SequenceId, min: SequenceId, max: SequenceId) -> Result<SequenceId, SequenceError> {
        if Self::is_newer(min, max) {
            return Err(SequenceError::InvertedRange { min: min.0, max: max.0 });
        }
        if Self::is_newer(id, max) {
            return Ok(max);
        }
        if Self::is_newer(min, id) {
            return Ok(min);
        }
        Ok(id)
    }

    /// Check an id reported by a peer against the last accepted one and the
    /// latest id that could possibly exist.
    ///
    /// A peer that has not received anything yet reports ids from the top of
    /// the range; those are accepted while `previous` is still the zero
    /// sentinel.
    pub fn is_valid(current: SequenceId, previous: SequenceId, latest_possible: SequenceId) -> bool {
        if previous == Self::ZERO && current.0 > HALF_RANGE {
            return true;
        }
        !Self::is_newer(current, latest_possible)
    }
}

impl From<u16> for SequenceId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<SequenceId> for u16 {
    fn from(id: SequenceId) -> Self {
        id.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl WireType for SequenceId {
    fn kind() -> FieldKind {
        FieldKind::U16
    }

    fn to_value(&self) -> WireValue {
        WireValue::UInt(self.0 as u64)
    }

    fn from_value(value: WireValue) -> Result<Self, DecodeError> {
        u16::from_value(value).map(SequenceId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn id(v: u16) -> SequenceId {
        SequenceId(v)
    }

    #[test]
    fn test_newer_basic() {
        assert!(SequenceId::is_newer(id(2), id(1)));
        assert!(!SequenceId::is_newer(id(1), id(2)));
        assert!(!SequenceId::is_newer(id(2), id(2)));
    }

    #[test]
    fn test_newer_wraparound() {
        assert!(SequenceId::is_newer(id(2), id(65530)));
        assert!(!SequenceId::is_newer(id(65535), id(5)));
        assert!(SequenceId::is_newer(id(0), id(65535)));
    }

    #[test]
    fn test_newer_at_half_range() {
        assert!(SequenceId::is_newer(id(HALF_RANGE), id(0)));
        assert!(!SequenceId::is_newer(id(0), id(HALF_RANGE)));
    }

    #[test]
    fn test_newer_or_equal() {
        assert!(SequenceId::is_newer_or_equal(id(7), id(7)));
        assert!(SequenceId::is_newer_or_equal(id(8), id(7)));
        assert!(!SequenceId::is_newer_or_equal(id(6), id(7)));
    }

    #[test]
    fn test_newer_is_antisymmetric() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let a = id(rng.gen());
            let b = id(rng.gen());
            if a != b {
                assert_ne!(SequenceId::is_newer(a, b), SequenceId::is_newer(b, a), "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_difference_values() {
        assert_eq!(SequenceId::difference(id(0), id(56)), 56);
        assert_eq!(SequenceId::difference(id(5), id(65434)), 106);
        assert_eq!(SequenceId::difference(id(9), id(9)), 0);
    }

    #[test]
    fn test_difference_symmetric_and_bounded() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let a = id(rng.gen());
            let b = id(rng.gen());
            let d = SequenceId::difference(a, b);
            assert_eq!(d, SequenceId::difference(b, a));
            assert!(d <= HALF_RANGE);
        }
    }

    #[test]
    fn test_clamp_inside_and_outside() {
        assert_eq!(SequenceId::clamp(id(5), id(1), id(10)).unwrap(), id(5));
        assert_eq!(SequenceId::clamp(id(12), id(1), id(10)).unwrap(), id(10));
        assert_eq!(SequenceId::clamp(id(65000), id(1), id(10)).unwrap(), id(1));
        // range spanning the wrap point
        assert_eq!(SequenceId::clamp(id(2), id(65530), id(4)).unwrap(), id(2));
        assert_eq!(SequenceId::clamp(id(20), id(65530), id(4)).unwrap(), id(4));
    }

    #[test]
    fn test_clamp_inverted_range() {
        let result = SequenceId::clamp(id(5), id(10), id(1));
        assert_eq!(result, Err(SequenceError::InvertedRange { min: 10, max: 1 }));
    }

    #[test]
    fn test_clamp_idempotent_and_on_arc() {
        let mut rng = rand::thread_rng();
        for _ in 0..5_000 {
            let lo = id(rng.gen());
            let hi = id(lo.0.wrapping_add(rng.gen_range(0..HALF_RANGE)));
            let x = id(rng.gen());
            let once = SequenceId::clamp(x, lo, hi).unwrap();
            assert_eq!(SequenceId::clamp(once, lo, hi).unwrap(), once);
            assert!(SequenceId::is_newer_or_equal(once, lo));
            assert!(SequenceId::is_newer_or_equal(hi, once));
        }
    }

    #[test]
    fn test_is_valid() {
        assert!(SequenceId::is_valid(id(5), id(3), id(10)));
        assert!(SequenceId::is_valid(id(10), id(3), id(10)));
        assert!(!SequenceId::is_valid(id(11), id(3), id(10)));
        // rejoining client reporting a wrapped "nothing received" id
        assert!(SequenceId::is_valid(id(60000), id(0), id(40000)));
        assert!(!SequenceId::is_valid(id(60000), id(1), id(40000)));
    }

    #[test]
    fn test_next_wraps() {
        assert_eq!(id(u16::MAX).next(), id(0));
        assert_eq!(id(0).prev(), id(u16::MAX));
    }
}
