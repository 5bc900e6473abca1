use std::time::Instant;

/// Elapsed-time source for the media clock.
///
/// The audio device's clock is the master when it is running; wall time is
/// the fallback. Both references are re-anchored whenever playback state
/// changes (pause, seek, rate change), so the first tick after a change
/// contributes no elapsed time.
pub(crate) struct MediaClock {
	last_wall: Option<Instant>,
	last_audio: Option<f64>,
}

impl MediaClock {
	pub fn new() -> Self {
		Self {
			last_wall: None,
			last_audio: None,
		}
	}

	/// Drop both anchors; the next tick starts a fresh interval.
	pub fn reset(&mut self) {
		self.last_wall = None;
		self.last_audio = None;
	}

	/// Real seconds elapsed since the previous tick, preferring the audio
	/// clock. Never negative.
	pub fn elapsed(&mut self, now: Instant, audio_now: Option<f64>) -> f64 {
		let elapsed = match (audio_now, self.last_audio) {
			(Some(audio), Some(last)) => (audio - last).max(0.0),
			// The audio clock just appeared or disappeared: re-anchor.
			(Some(_), None) | (None, Some(_)) => 0.0,
			(None, None) => match self.last_wall {
				Some(last) => now.saturating_duration_since(last).as_secs_f64(),
				None => 0.0,
			},
		};

		self.last_wall = Some(now);
		self.last_audio = audio_now;
		elapsed
	}
}
