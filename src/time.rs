//! Geological time values and discretised time ranges.

use std::fmt;

use crate::error::{LayerError, Result};

/// Two times closer than this (in Myr) are the same reconstruction time.
///
/// The comparison is inclusive: a difference of exactly `GEO_TIME_EPSILON`
/// still compares equal.
pub const GEO_TIME_EPSILON: f64 = 1e-6;

/// Largest number of slots a [`TimeRange`] may hold.
pub const MAX_TIME_SLOTS: usize = 1_000_000;

/// Returns true if `a` and `b` are indistinguishable reconstruction times.
#[inline]
pub fn geo_times_equal(a: f64, b: f64) -> bool {
    (a - b).abs() <= GEO_TIME_EPSILON
}

/// A reconstruction time in Myr before present, compared with tolerance.
///
/// `GeoTime` deliberately does not implement `Hash`: tolerance-aware equality
/// is not transitive, so it is only used as a key in caches that look entries
/// up by comparison.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GeoTime(f64);

impl GeoTime {
    /// Present day.
    pub const PRESENT_DAY: GeoTime = GeoTime(0.0);

    /// Wrap a time in Myr.
    pub const fn new(time: f64) -> Self {
        GeoTime(time)
    }

    /// The raw time in Myr.
    pub const fn value(self) -> f64 {
        self.0
    }
}

impl PartialEq for GeoTime {
    fn eq(&self, other: &Self) -> bool {
        geo_times_equal(self.0, other.0)
    }
}

impl From<f64> for GeoTime {
    fn from(time: f64) -> Self {
        GeoTime(time)
    }
}

impl fmt::Display for GeoTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Ma", self.0)
    }
}

/// A half-open, evenly spaced range of time slots.
///
/// Slot `i` is at `begin + i * increment` moving towards `end`; `end` itself
/// is not a slot. If `end - begin` is not a whole multiple of the increment
/// the range is truncated to the slots that fit.
///
/// # Examples
///
/// ```
/// # use layer_flow::TimeRange;
/// let range = TimeRange::new(0.0, 10.0, 1.0).unwrap();
/// assert_eq!(range.num_slots(), 10);
/// assert_eq!(range.slot_time(9), 9.0);
///
/// let backwards = TimeRange::new(100.0, 90.0, 2.5).unwrap();
/// assert_eq!(backwards.slot_time(1), 97.5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeRange {
    begin: f64,
    end: f64,
    increment: f64,
    num_slots: usize,
}

impl TimeRange {
    /// Discretise `[begin, end)` into slots of `increment` Myr.
    ///
    /// Fails with [`LayerError::InvalidTimeRange`] if the range holds no slot
    /// or more than [`MAX_TIME_SLOTS`].
    pub fn new(begin: f64, end: f64, increment: f64) -> Result<Self> {
        let invalid = || LayerError::InvalidTimeRange {
            begin,
            end,
            increment,
        };
        if !(begin.is_finite() && end.is_finite() && increment.is_finite()) || increment <= 0.0 {
            return Err(invalid());
        }
        let span = (end - begin).abs();
        let num_slots = ((span + GEO_TIME_EPSILON) / increment).floor();
        if num_slots < 1.0 || num_slots > MAX_TIME_SLOTS as f64 {
            return Err(invalid());
        }
        Ok(Self {
            begin,
            end,
            increment,
            num_slots: num_slots as usize,
        })
    }

    /// Time of the first slot.
    pub fn begin(&self) -> f64 {
        self.begin
    }

    /// Exclusive end of the range.
    pub fn end(&self) -> f64 {
        self.end
    }

    /// Distance between slots (always positive).
    pub fn increment(&self) -> f64 {
        self.increment
    }

    /// Number of slots.
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    fn direction(&self) -> f64 {
        if self.end >= self.begin {
            1.0
        } else {
            -1.0
        }
    }

    /// Absolute time of slot `index`.
    pub fn slot_time(&self, index: usize) -> f64 {
        self.begin + self.direction() * index as f64 * self.increment
    }

    /// Slot at `time`, if one lies within [`GEO_TIME_EPSILON`] of it.
    pub fn slot_at_time(&self, time: f64) -> Option<usize> {
        let offset = (time - self.begin) * self.direction() / self.increment;
        let index = offset.round();
        if index < 0.0 || index >= self.num_slots as f64 {
            return None;
        }
        let index = index as usize;
        geo_times_equal(self.slot_time(index), time).then_some(index)
    }

    /// Last slot whose time has not gone past `time` in the range direction.
    ///
    /// Returns `None` if `time` comes before the first slot.
    pub fn slot_at_or_before(&self, time: f64) -> Option<usize> {
        let offset = (time - self.begin) * self.direction() / self.increment;
        if offset < -GEO_TIME_EPSILON / self.increment {
            return None;
        }
        let index = (offset + GEO_TIME_EPSILON / self.increment).floor().max(0.0) as usize;
        Some(index.min(self.num_slots - 1))
    }

    /// Iterate over `(slot index, slot time)`.
    pub fn slot_times(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        (0..self.num_slots).map(move |i| (i, self.slot_time(i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_time_tolerance_is_inclusive() {
        let t = GeoTime::new(10.0);
        assert_eq!(t, GeoTime::new(10.0 + GEO_TIME_EPSILON * 0.5));
        assert_eq!(t, GeoTime::new(10.0 + GEO_TIME_EPSILON * 0.999));
        assert_ne!(t, GeoTime::new(10.0 + GEO_TIME_EPSILON * 2.0));
        assert!(geo_times_equal(0.0, GEO_TIME_EPSILON));
        assert!(geo_times_equal(-GEO_TIME_EPSILON, 0.0));
    }

    #[test]
    fn test_range_truncates_partial_slot() {
        let range = TimeRange::new(0.0, 10.5, 1.0).unwrap();
        assert_eq!(range.num_slots(), 10);
    }

    #[test]
    fn test_range_rejects_degenerate_input() {
        assert!(TimeRange::new(0.0, 0.0, 1.0).is_err());
        assert!(TimeRange::new(0.0, 10.0, 0.0).is_err());
        assert!(TimeRange::new(0.0, 10.0, -1.0).is_err());
        assert!(TimeRange::new(0.0, 0.5, 1.0).is_err());
        assert!(TimeRange::new(f64::NAN, 10.0, 1.0).is_err());
    }

    #[test]
    fn test_range_slot_count_is_bounded() {
        let widest = TimeRange::new(0.0, MAX_TIME_SLOTS as f64, 1.0).unwrap();
        assert_eq!(widest.num_slots(), MAX_TIME_SLOTS);
        assert!(TimeRange::new(0.0, MAX_TIME_SLOTS as f64 + 1.0, 1.0).is_err());
        assert!(matches!(
            TimeRange::new(0.0, 4000.0, 1e-12),
            Err(LayerError::InvalidTimeRange { .. })
        ));
    }

    #[test]
    fn test_slot_lookup() {
        let range = TimeRange::new(0.0, 10.0, 1.0).unwrap();
        assert_eq!(range.slot_at_time(3.0), Some(3));
        assert_eq!(range.slot_at_time(3.0 + GEO_TIME_EPSILON * 0.5), Some(3));
        assert_eq!(range.slot_at_time(3.5), None);
        assert_eq!(range.slot_at_time(10.0), None);
        assert_eq!(range.slot_at_time(-1.0), None);
    }

    #[test]
    fn test_slot_at_or_before() {
        let range = TimeRange::new(0.0, 10.0, 1.0).unwrap();
        assert_eq!(range.slot_at_or_before(3.5), Some(3));
        assert_eq!(range.slot_at_or_before(3.0), Some(3));
        assert_eq!(range.slot_at_or_before(25.0), Some(9));
        assert_eq!(range.slot_at_or_before(-0.5), None);
    }
}
