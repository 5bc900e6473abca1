use std::fmt;
use std::time::Duration;

const MICROS_PER_SEC: u64 = 1_000_000;

/// A timestamp does not fit the microsecond clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timestamp overflow")]
pub struct TimeOverflow;

/// A media timestamp or duration in integer microseconds.
///
/// All timestamp arithmetic inside the engine happens on this type; floating
/// point seconds appear only at the `buffered`/`current_time` boundaries.
/// This is NOT a wall clock time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
	pub const ZERO: Self = Self(0);
	pub const MAX: Self = Self(u64::MAX);

	pub const fn from_micros(micros: u64) -> Self {
		Self(micros)
	}

	/// Convert ticks at the given timescale to microseconds, rounding to the
	/// nearest microsecond.
	pub fn from_scale(ticks: u64, timescale: u64) -> Result<Self, TimeOverflow> {
		if timescale == 0 {
			return Err(TimeOverflow);
		}

		let scaled = ticks.checked_mul(MICROS_PER_SEC).ok_or(TimeOverflow)?;
		Ok(Self((scaled + timescale / 2) / timescale))
	}

	/// Floor a seconds value onto the microsecond grid.
	///
	/// Negative and non-finite inputs clamp to zero; the media timeline does
	/// not extend below it.
	pub fn from_secs_f64(seconds: f64) -> Self {
		if !seconds.is_finite() || seconds <= 0.0 {
			return Self::ZERO;
		}

		Self((seconds * MICROS_PER_SEC as f64).floor() as u64)
	}

	pub const fn as_micros(self) -> u64 {
		self.0
	}

	pub fn as_secs_f64(self) -> f64 {
		self.0 as f64 / MICROS_PER_SEC as f64
	}

	pub const fn saturating_add(self, other: Self) -> Self {
		Self(self.0.saturating_add(other.0))
	}

	pub const fn saturating_sub(self, other: Self) -> Self {
		Self(self.0.saturating_sub(other.0))
	}

	pub fn checked_add(self, other: Self) -> Result<Self, TimeOverflow> {
		self.0.checked_add(other.0).map(Self).ok_or(TimeOverflow)
	}

	pub fn checked_sub(self, other: Self) -> Result<Self, TimeOverflow> {
		self.0.checked_sub(other.0).map(Self).ok_or(TimeOverflow)
	}

	/// The absolute distance between two timestamps.
	pub const fn abs_diff(self, other: Self) -> Self {
		Self(self.0.abs_diff(other.0))
	}
}

// Frame arithmetic (pts + duration, watermark offsets) saturates instead of
// wrapping; the timeline is clamped at both ends.
impl std::ops::Add for Timestamp {
	type Output = Self;

	fn add(self, other: Self) -> Self {
		self.saturating_add(other)
	}
}

impl std::ops::Sub for Timestamp {
	type Output = Self;

	fn sub(self, other: Self) -> Self {
		self.saturating_sub(other)
	}
}

impl From<Duration> for Timestamp {
	fn from(duration: Duration) -> Self {
		Self(duration.as_micros().min(u64::MAX as u128) as u64)
	}
}

impl fmt::Display for Timestamp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{:06}s", self.0 / MICROS_PER_SEC, self.0 % MICROS_PER_SEC)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_scale_rounds() {
		// 1 tick at 90kHz is 11.11us, rounded to 11.
		assert_eq!(Timestamp::from_scale(1, 90_000).unwrap().as_micros(), 11);
		// 1/3s rounds up, 2/3s rounds to nearest.
		assert_eq!(Timestamp::from_scale(1, 3).unwrap().as_micros(), 333_333);
		assert_eq!(Timestamp::from_scale(2, 3).unwrap().as_micros(), 666_667);
		assert_eq!(Timestamp::from_scale(3_000, 1_000).unwrap().as_micros(), 3_000_000);
	}

	#[test]
	fn from_scale_rejects_bad_input() {
		assert_eq!(Timestamp::from_scale(1, 0), Err(TimeOverflow));
		assert_eq!(Timestamp::from_scale(u64::MAX, 90_000), Err(TimeOverflow));
	}

	#[test]
	fn seconds_round_trip() {
		let ts = Timestamp::from_secs_f64(1.5);
		assert_eq!(ts.as_micros(), 1_500_000);
		assert_eq!(ts.as_secs_f64(), 1.5);

		// Floors onto the microsecond grid.
		assert_eq!(Timestamp::from_secs_f64(0.000_000_9).as_micros(), 0);
		assert_eq!(Timestamp::from_secs_f64(-4.0), Timestamp::ZERO);
		assert_eq!(Timestamp::from_secs_f64(f64::NAN), Timestamp::ZERO);
	}

	#[test]
	fn saturating_arithmetic() {
		let a = Timestamp::from_micros(10);
		let b = Timestamp::from_micros(30);
		assert_eq!(a - b, Timestamp::ZERO);
		assert_eq!(Timestamp::MAX + a, Timestamp::MAX);
		assert_eq!(a.abs_diff(b), Timestamp::from_micros(20));
		assert_eq!(b.checked_sub(a), Ok(Timestamp::from_micros(20)));
		assert_eq!(a.checked_sub(b), Err(TimeOverflow));
	}
}
