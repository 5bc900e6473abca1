/// Sorted, disjoint, half-open `[start, end)` intervals over seconds.
///
/// This is the representation behind every `buffered`/`played`/`seekable`
/// surface. Counts are small (tens at most), so operations are simple sweeps
/// rather than anything clever.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimeRanges {
	ranges: Vec<(f64, f64)>,
}

impl TimeRanges {
	pub fn new() -> Self {
		Self::default()
	}

	/// A single `[start, end)` range; empty when `start >= end`.
	pub fn single(start: f64, end: f64) -> Self {
		if start < end {
			Self {
				ranges: vec![(start, end)],
			}
		} else {
			Self::default()
		}
	}

	/// Build from arbitrary pairs, normalizing order and overlap.
	pub fn from_pairs<I: IntoIterator<Item = (f64, f64)>>(pairs: I) -> Self {
		let mut out = Self::new();
		for (start, end) in pairs {
			out.add(start, end, 0.0);
		}
		out
	}

	pub fn len(&self) -> usize {
		self.ranges.len()
	}

	pub fn is_empty(&self) -> bool {
		self.ranges.is_empty()
	}

	/// The start of range `index`.
	///
	/// Panics when the index is out of range; that's a caller bug, matching
	/// the `TimeRanges.start(i)` contract.
	pub fn start(&self, index: usize) -> f64 {
		self.ranges[index].0
	}

	/// The end of range `index`. Panics when the index is out of range.
	pub fn end(&self, index: usize) -> f64 {
		self.ranges[index].1
	}

	pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
		self.ranges.iter().copied()
	}

	pub fn first_start(&self) -> Option<f64> {
		self.ranges.first().map(|r| r.0)
	}

	pub fn last_end(&self) -> Option<f64> {
		self.ranges.last().map(|r| r.1)
	}

	/// Insert one range, merging with neighbours closer than `tolerance`.
	pub fn add(&mut self, start: f64, end: f64, tolerance: f64) {
		*self = self.union(&Self::single(start, end), tolerance);
	}

	/// Merge two sets of ranges; ranges separated by at most `tolerance`
	/// seconds collapse into one.
	pub fn union(&self, other: &Self, tolerance: f64) -> Self {
		let mut merged: Vec<(f64, f64)> = Vec::with_capacity(self.ranges.len() + other.ranges.len());
		merged.extend_from_slice(&self.ranges);
		merged.extend_from_slice(&other.ranges);
		merged.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));

		let mut out: Vec<(f64, f64)> = Vec::with_capacity(merged.len());
		for (start, end) in merged {
			match out.last_mut() {
				Some(last) if start <= last.1 + tolerance => {
					// Contained ranges are dropped outright.
					last.1 = last.1.max(end);
				}
				_ => out.push((start, end)),
			}
		}

		Self { ranges: out }
	}

	/// Pointwise intersection.
	pub fn intersect(&self, other: &Self) -> Self {
		let mut out = Vec::new();
		let mut a = 0;
		let mut b = 0;

		while a < self.ranges.len() && b < other.ranges.len() {
			let (s1, e1) = self.ranges[a];
			let (s2, e2) = other.ranges[b];

			let start = s1.max(s2);
			let end = e1.min(e2);
			if start < end {
				out.push((start, end));
			}

			// Advance whichever interval ends first, both on a tie.
			if e1 <= e2 {
				a += 1;
			}
			if e2 <= e1 {
				b += 1;
			}
		}

		Self { ranges: out }
	}

	/// The gaps, with infinite sentinels at both ends.
	pub fn invert(&self) -> Self {
		let mut out = Vec::with_capacity(self.ranges.len() + 1);
		let mut cursor = f64::NEG_INFINITY;

		for &(start, end) in &self.ranges {
			if cursor < start {
				out.push((cursor, start));
			}
			cursor = end;
		}
		if cursor < f64::INFINITY {
			out.push((cursor, f64::INFINITY));
		}

		Self { ranges: out }
	}

	/// Pointwise difference.
	pub fn subtract(&self, other: &Self) -> Self {
		self.intersect(&other.invert())
	}

	/// The index of the range containing `time`, if any.
	pub fn find(&self, time: f64) -> Option<usize> {
		self.ranges.iter().position(|&(start, end)| start <= time && time < end)
	}

	pub fn contains(&self, time: f64) -> bool {
		self.find(time).is_some()
	}

	/// True when a single range covers all of `[start, end]`.
	pub fn contains_range(&self, start: f64, end: f64) -> bool {
		self.ranges.iter().any(|&(s, e)| s <= start && end <= e)
	}
}

impl FromIterator<(f64, f64)> for TimeRanges {
	fn from_iter<I: IntoIterator<Item = (f64, f64)>>(iter: I) -> Self {
		Self::from_pairs(iter)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ranges(pairs: &[(f64, f64)]) -> TimeRanges {
		TimeRanges::from_pairs(pairs.iter().copied())
	}

	#[test]
	fn union_is_associative() {
		let a = ranges(&[(0.0, 1.0), (5.0, 6.0)]);
		let b = ranges(&[(0.5, 2.0)]);
		let c = ranges(&[(4.0, 5.5), (8.0, 9.0)]);

		let left = a.union(&b, 0.0).union(&c, 0.0);
		let right = a.union(&b.union(&c, 0.0), 0.0);
		assert_eq!(left, right);
		assert_eq!(left, ranges(&[(0.0, 2.0), (4.0, 6.0), (8.0, 9.0)]));
	}

	#[test]
	fn union_merges_within_tolerance() {
		let a = ranges(&[(0.0, 1.0)]);
		let b = ranges(&[(1.01, 2.0)]);

		// A 10ms gap survives a zero tolerance but not 1/60s.
		assert_eq!(a.union(&b, 0.0).len(), 2);
		assert_eq!(a.union(&b, 1.0 / 60.0), ranges(&[(0.0, 2.0)]));
	}

	#[test]
	fn union_drops_contained_ranges() {
		let a = ranges(&[(0.0, 10.0)]);
		let b = ranges(&[(2.0, 3.0), (4.0, 5.0)]);
		assert_eq!(a.union(&b, 0.0), a);
	}

	#[test]
	fn intersect_walks_both_sides() {
		let a = ranges(&[(0.0, 4.0), (6.0, 10.0)]);
		let b = ranges(&[(2.0, 7.0), (9.0, 12.0)]);
		assert_eq!(a.intersect(&b), ranges(&[(2.0, 4.0), (6.0, 7.0), (9.0, 10.0)]));
		assert_eq!(a.intersect(&a), a);
		assert_eq!(a.intersect(&TimeRanges::new()), TimeRanges::new());
	}

	#[test]
	fn invert_round_trips() {
		let a = ranges(&[(0.0, 4.0), (8.0, 12.0)]);
		assert_eq!(a.invert().invert(), a);
		assert_eq!(TimeRanges::new().invert().len(), 1);
		assert_eq!(TimeRanges::new().invert().invert(), TimeRanges::new());
	}

	#[test]
	fn subtract_removes_overlap() {
		let a = ranges(&[(0.0, 10.0)]);
		let b = ranges(&[(4.0, 6.0)]);
		assert_eq!(a.subtract(&b), ranges(&[(0.0, 4.0), (6.0, 10.0)]));
		assert_eq!(a.subtract(&a), TimeRanges::new());
	}

	#[test]
	fn find_respects_half_open_bounds() {
		let a = ranges(&[(0.0, 4.0), (8.0, 12.0)]);
		assert_eq!(a.find(0.0), Some(0));
		assert_eq!(a.find(3.999), Some(0));
		assert_eq!(a.find(4.0), None);
		assert_eq!(a.find(8.0), Some(1));
		assert!(!a.contains(12.0));
	}

	#[test]
	fn contains_range_needs_a_single_interval() {
		let a = ranges(&[(0.0, 4.0), (4.5, 8.0)]);
		assert!(a.contains_range(1.0, 3.0));
		assert!(a.contains_range(0.0, 4.0));
		assert!(!a.contains_range(3.0, 5.0));
	}
}
