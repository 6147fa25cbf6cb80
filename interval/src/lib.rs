//! Disjoint interval sets over the real line.
//!
//! `IntervalSet` keeps a canonical list of non-overlapping closed intervals
//! in ascending order. Temporal constraint edges store one set per edge;
//! an empty set means "no constraint".

#![deny(unused_must_use)]

use smallvec::SmallVec;

/// A closed interval `[lower, upper]` over f64 time offsets.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct Interval {
    /// Lower bound, inclusive.
    pub lower: f64,

    /// Upper bound, inclusive.
    pub upper: f64,
}

impl Interval {
    /// Create new interval from its bounds.
    ///
    /// # Panics
    ///
    /// This function will panic if `lower > upper` or either bound is NaN.
    pub fn new(lower: f64, upper: f64) -> Self {
        assert!(!lower.is_nan() && !upper.is_nan(), "Interval bound is NaN");
        assert!(lower <= upper, "Interval lower bound above upper bound");
        Interval { lower, upper }
    }

    /// Check if the value lies within the interval. Bounds are inclusive.
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }

    /// The mirror interval `[-upper, -lower]`.
    pub fn negated(&self) -> Self {
        Interval {
            lower: -self.upper,
            upper: -self.lower,
        }
    }
}

/// Canonicalised union of closed intervals.
///
/// Intervals are kept sorted by lower bound and never overlap nor touch;
/// `add` merges as needed. Iteration order is ascending and deterministic.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct IntervalSet {
    intervals: SmallVec<[Interval; 4]>,
}

impl IntervalSet {
    /// Create new empty set.
    pub fn new() -> Self {
        IntervalSet {
            intervals: SmallVec::new(),
        }
    }

    /// Create a set holding a single interval.
    pub fn from_bounds(lower: f64, upper: f64) -> Self {
        let mut set = Self::new();
        set.add(lower, upper);
        set
    }

    /// Check if the set holds no interval.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Get the number of disjoint intervals.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Add `[lower, upper]` to the set, merging every interval it overlaps
    /// or touches. Ties at endpoints are treated inclusive. Adding the same
    /// interval twice leaves the set unchanged.
    ///
    /// # Panics
    ///
    /// This function will panic if `lower > upper` or either bound is NaN.
    pub fn add(&mut self, lower: f64, upper: f64) {
        let added = Interval::new(lower, upper);

        // First interval that may absorb: upper >= added.lower.
        let start = self
            .intervals
            .partition_point(|interval| interval.upper < added.lower);
        // First interval past the absorption range: lower > added.upper.
        let end = self
            .intervals
            .partition_point(|interval| interval.lower <= added.upper);

        if start == end {
            self.intervals.insert(start, added);
            return;
        }

        let merged = Interval {
            lower: self.intervals[start].lower.min(added.lower),
            upper: self.intervals[end - 1].upper.max(added.upper),
        };
        self.intervals.drain(start..end);
        self.intervals.insert(start, merged);
    }

    /// Check if the value lies within one of the intervals.
    pub fn include(&self, value: f64) -> bool {
        let index = self
            .intervals
            .partition_point(|interval| interval.upper < value);
        self.intervals
            .get(index)
            .map_or(false, |interval| interval.contains(value))
    }

    /// Add every interval of `other` to this set.
    pub fn union(&mut self, other: &IntervalSet) {
        for interval in other.iter() {
            self.add(interval.lower, interval.upper);
        }
    }

    /// The mirror set `{[-b, -a] | [a, b] in self}`, canonical.
    pub fn negated(&self) -> Self {
        let mut intervals = SmallVec::with_capacity(self.intervals.len());
        for interval in self.intervals.iter().rev() {
            intervals.push(interval.negated());
        }
        IntervalSet { intervals }
    }

    /// Iterate over the intervals in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.intervals.iter()
    }

    /// Get the least lower bound, if any.
    pub fn lower(&self) -> Option<f64> {
        self.intervals.first().map(|interval| interval.lower)
    }

    /// Get the greatest upper bound, if any.
    pub fn upper(&self) -> Option<f64> {
        self.intervals.last().map(|interval| interval.upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(set: &IntervalSet) -> Vec<(f64, f64)> {
        set.iter()
            .map(|interval| (interval.lower, interval.upper))
            .collect()
    }

    #[test]
    fn add_keeps_disjoint_ascending_order() {
        let mut set = IntervalSet::new();
        set.add(5.0, 7.0);
        set.add(1.0, 2.0);
        set.add(10.0, 12.0);
        assert_eq!(bounds(&set), vec![(1.0, 2.0), (5.0, 7.0), (10.0, 12.0)]);
    }

    #[test]
    fn add_merges_overlapping_intervals() {
        let mut set = IntervalSet::new();
        set.add(1.0, 3.0);
        set.add(5.0, 8.0);
        set.add(2.0, 6.0);
        assert_eq!(bounds(&set), vec![(1.0, 8.0)]);
    }

    #[test]
    fn add_merges_on_endpoint_ties() {
        let mut set = IntervalSet::new();
        set.add(1.0, 2.0);
        set.add(2.0, 3.0);
        assert_eq!(bounds(&set), vec![(1.0, 3.0)]);

        set.add(0.0, 1.0);
        assert_eq!(bounds(&set), vec![(0.0, 3.0)]);
    }

    #[test]
    fn add_is_idempotent() {
        let mut once = IntervalSet::new();
        once.add(1.0, 4.0);

        let mut twice = once.clone();
        twice.add(1.0, 4.0);
        assert_eq!(once, twice);
    }

    #[test]
    fn include_respects_inclusive_bounds() {
        let mut set = IntervalSet::new();
        set.add(1.0, 2.0);
        set.add(4.0, 6.0);

        assert!(set.include(1.0));
        assert!(set.include(2.0));
        assert!(set.include(5.0));
        assert!(!set.include(3.0));
        assert!(!set.include(0.5));
        assert!(!set.include(6.5));
    }

    #[test]
    fn union_merges_both_sets() {
        let mut left = IntervalSet::from_bounds(0.0, 1.0);
        let mut right = IntervalSet::from_bounds(0.5, 2.0);
        right.add(5.0, 6.0);

        left.union(&right);
        assert_eq!(bounds(&left), vec![(0.0, 2.0), (5.0, 6.0)]);
    }

    #[test]
    fn negated_mirrors_and_stays_canonical() {
        let mut set = IntervalSet::new();
        set.add(1.0, 2.0);
        set.add(4.0, 6.0);

        let negated = set.negated();
        assert_eq!(bounds(&negated), vec![(-6.0, -4.0), (-2.0, -1.0)]);
        assert_eq!(negated.negated(), set);
    }

    #[test]
    fn empty_set_includes_nothing() {
        let set = IntervalSet::new();
        assert!(set.is_empty());
        assert!(!set.include(0.0));
        assert_eq!(set.lower(), None);
        assert_eq!(set.upper(), None);
    }
}
