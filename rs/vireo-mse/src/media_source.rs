use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::{Error, Host, HostSignal, MediaKind, MediaSourceEvent, MimeType, Multicast, Result, SourceBuffer, TimeRanges, TrackBuffer};

/// The lifecycle state of a media source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceReadyState {
	/// Not attached to a media element.
	Closed,
	/// Attached and accepting segments.
	Open,
	/// `end_of_stream` was called; the buffered data is final.
	Ended,
}

/// The error kind passed to `end_of_stream`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndOfStreamError {
	Network,
	Decode,
}

pub(crate) struct MediaSourceState {
	ready_state: SourceReadyState,
	duration: f64,
	source_buffers: Vec<SourceBuffer>,
	host: Option<Host>,
	end_error: Option<EndOfStreamError>,
	events: Multicast<MediaSourceEvent>,
}

/// The multiplex of source buffers behind a media element.
///
/// Owns the presentation duration and the `Closed → Open → Ended` lifecycle.
/// Cloning the handle shares the same underlying source.
#[derive(Clone)]
pub struct MediaSource {
	state: Arc<Mutex<MediaSourceState>>,
}

impl MediaSource {
	pub fn new() -> Self {
		Self {
			state: Arc::new(Mutex::new(MediaSourceState {
				ready_state: SourceReadyState::Closed,
				duration: f64::NAN,
				source_buffers: Vec::new(),
				host: None,
				end_error: None,
				events: Multicast::default(),
			})),
		}
	}

	pub(crate) fn from_state(state: Arc<Mutex<MediaSourceState>>) -> Self {
		Self { state }
	}

	fn lock(&self) -> MutexGuard<'_, MediaSourceState> {
		self.state.lock().unwrap()
	}

	/// Whether this mime type can be handled at all.
	pub fn is_type_supported(mime: &str) -> bool {
		mime.parse::<MimeType>().is_ok()
	}

	pub fn ready_state(&self) -> SourceReadyState {
		self.lock().ready_state
	}

	/// The presentation duration in seconds; NaN while closed or unknown.
	pub fn duration(&self) -> f64 {
		self.lock().duration
	}

	/// The error passed to `end_of_stream`, if any.
	pub fn end_of_stream_error(&self) -> Option<EndOfStreamError> {
		self.lock().end_error
	}

	pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MediaSourceEvent> {
		self.lock().events.subscribe()
	}

	/// The attached source buffers, in creation order.
	pub fn source_buffers(&self) -> Vec<SourceBuffer> {
		self.lock().source_buffers.clone()
	}

	/// Create a source buffer for the given mime type.
	///
	/// One buffer per media type is accepted; a second `audio/mp4` or
	/// `video/mp4` buffer is a quota error.
	pub fn add_source_buffer(&self, mime: &str) -> Result<SourceBuffer> {
		let kind = mime.parse::<MimeType>()?.kind;

		let mut state = self.lock();
		if state.ready_state != SourceReadyState::Open {
			return Err(Error::InvalidState("media source is not open"));
		}
		if state.source_buffers.iter().any(|b| b.kind() == kind) {
			return Err(Error::QuotaExceeded);
		}

		tracing::debug!(?kind, "adding source buffer");
		let buffer = SourceBuffer::new(kind, Arc::downgrade(&self.state));
		state.source_buffers.push(buffer.clone());
		Ok(buffer)
	}

	/// Detach a source buffer, dropping its track buffers and coded frames.
	pub fn remove_source_buffer(&self, buffer: &SourceBuffer) -> Result<()> {
		{
			let mut state = self.lock();
			let index = state
				.source_buffers
				.iter()
				.position(|b| b.is_clone(buffer))
				.ok_or(Error::InvalidState("source buffer is not attached"))?;
			state.source_buffers.remove(index);
		}

		buffer.detach();
		Ok(())
	}

	/// Set the presentation duration, in seconds.
	pub fn set_duration(&self, duration: f64) -> Result<()> {
		if duration.is_nan() || duration < 0.0 {
			return Err(Error::InvalidRange("duration must be non-negative"));
		}

		let buffers = {
			let state = self.lock();
			if state.ready_state != SourceReadyState::Open {
				return Err(Error::InvalidState("media source is not open"));
			}
			state.source_buffers.clone()
		};
		if buffers.iter().any(|b| b.updating()) {
			return Err(Error::InvalidState("source buffer is updating"));
		}

		self.duration_change(duration);
		Ok(())
	}

	/// Signal that the stream is complete (or failed, with an error kind).
	///
	/// On success the duration collapses to the highest buffered end and the
	/// element is told it has all the data. Error kinds are recorded and
	/// surface only through `sourceended`.
	pub fn end_of_stream(&self, error: Option<EndOfStreamError>) -> Result<()> {
		let buffers = {
			let state = self.lock();
			if state.ready_state != SourceReadyState::Open {
				return Err(Error::InvalidState("media source is not open"));
			}
			state.source_buffers.clone()
		};
		if buffers.iter().any(|b| b.updating()) {
			return Err(Error::InvalidState("source buffer is updating"));
		}

		self.end_of_stream_internal(error);
		Ok(())
	}

	pub(crate) fn end_of_stream_internal(&self, error: Option<EndOfStreamError>) {
		let buffers = {
			let mut state = self.lock();
			if state.ready_state == SourceReadyState::Closed {
				return;
			}
			state.ready_state = SourceReadyState::Ended;
			state.end_error = error;
			state.source_buffers.clone()
		};

		match error {
			None => {
				// Raise the duration to the highest buffered end, never lower.
				let highest = buffers
					.iter()
					.filter_map(|b| b.highest_end())
					.fold(None, |acc: Option<f64>, end| Some(acc.map_or(end, |a| a.max(end))));

				if let Some(highest) = highest {
					let duration = self.lock().duration;
					let duration = if duration.is_nan() { highest } else { duration.max(highest) };
					self.duration_change(duration);
				}

				self.signal_host(HostSignal::AllDataBuffered);
			}
			Some(error) => tracing::warn!(?error, "stream ended with an error"),
		}

		self.lock().events.emit(MediaSourceEvent::SourceEnded);
	}

	/// Attach to a media element; the host handle receives signals until
	/// detach.
	pub fn attach(&self, host: Host) -> Result<()> {
		let mut state = self.lock();
		if state.ready_state != SourceReadyState::Closed {
			return Err(Error::InvalidState("media source is already attached"));
		}

		state.host = Some(host);
		state.ready_state = SourceReadyState::Open;
		state.events.emit(MediaSourceEvent::SourceOpen);
		Ok(())
	}

	/// Detach from the media element, dropping all source buffers and their
	/// coded frames.
	pub fn detach(&self) {
		let buffers = {
			let mut state = self.lock();
			state.host = None;
			state.ready_state = SourceReadyState::Closed;
			state.duration = f64::NAN;
			state.end_error = None;
			std::mem::take(&mut state.source_buffers)
		};

		for buffer in buffers {
			buffer.detach();
		}

		self.lock().events.emit(MediaSourceEvent::SourceClose);
	}

	/// Reopen an ended source; appending after `end_of_stream` does this.
	pub fn open_if_ended(&self) {
		let mut state = self.lock();
		if state.ready_state == SourceReadyState::Ended {
			state.ready_state = SourceReadyState::Open;
			state.end_error = None;
			state.events.emit(MediaSourceEvent::SourceOpen);
		}
	}

	/// The element-level buffered ranges.
	///
	/// The intersection across source buffers (each the intersection across
	/// its tracks), clamped to the overall highest buffered end; when ended,
	/// each buffer's final range is stretched to that end first.
	pub fn buffered(&self) -> TimeRanges {
		let (buffers, ended) = {
			let state = self.lock();
			(
				state.source_buffers.clone(),
				state.ready_state == SourceReadyState::Ended,
			)
		};

		if buffers.is_empty() {
			return TimeRanges::new();
		}

		let highest = buffers
			.iter()
			.filter_map(|b| b.highest_end())
			.fold(None, |acc: Option<f64>, end| Some(acc.map_or(end, |a| a.max(end))));
		let Some(highest) = highest else {
			return TimeRanges::new();
		};

		let mut out: Option<TimeRanges> = None;
		for buffer in &buffers {
			let buffered = buffer.buffered_for(ended, highest);
			out = Some(match out {
				Some(acc) => acc.intersect(&buffered),
				None => buffered,
			});
		}

		out.unwrap_or_default()
	}

	/// Whether any attached source buffer carries a track of this kind.
	pub fn has_track(&self, kind: MediaKind) -> bool {
		let buffers = self.lock().source_buffers.clone();
		buffers.iter().any(|b| b.has_track(kind))
	}

	/// Run `f` against the first track buffer of this kind, if any.
	pub fn with_track<R>(&self, kind: MediaKind, f: impl FnOnce(&TrackBuffer) -> R) -> Option<R> {
		let buffers = self.lock().source_buffers.clone();
		let buffer = buffers.iter().find(|b| b.has_track(kind))?;
		buffer.with_track(kind, f)
	}

	pub(crate) fn duration_from_init(&self, duration: f64) {
		let adopt = self.lock().duration.is_nan();
		if adopt {
			self.duration_change(duration);
		}
	}

	pub(crate) fn signal_host(&self, signal: HostSignal) {
		if let Some(host) = self.lock().host.clone() {
			host.signal(signal);
		}
	}

	fn duration_change(&self, duration: f64) {
		let changed = {
			let mut state = self.lock();
			let changed = state.duration != duration;
			if changed {
				tracing::debug!(duration, "duration change");
				state.duration = duration;
			}
			changed
		};

		if changed {
			self.signal_host(HostSignal::DurationChanged(duration));
		}
	}
}

impl Default for MediaSource {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{InitSegment, Sample, Timestamp, TrackConfig, TrackInfo, VideoConfig};
	use bytes::Bytes;

	fn attached() -> (MediaSource, Host, mpsc::UnboundedReceiver<HostSignal>) {
		let source = MediaSource::new();
		let (host, rx) = Host::channel();
		source.attach(host.clone()).unwrap();
		(source, host, rx)
	}

	fn video_config() -> VideoConfig {
		VideoConfig {
			codec: crate::H264 {
				profile: 0x64,
				constraints: 0,
				level: 0x28,
			}
			.into(),
			description: None,
			coded_width: None,
			coded_height: None,
		}
	}

	fn video_init() -> InitSegment {
		InitSegment {
			duration: Some(Timestamp::from_micros(10_000_000)),
			tracks: vec![TrackInfo {
				id: 1,
				timescale: 1_000,
				config: TrackConfig::Video(video_config()),
			}],
		}
	}

	fn sample(ms: u64, duration_ms: u32, keyframe: bool) -> Sample {
		Sample {
			track_id: 1,
			timescale: 1_000,
			dts: ms,
			cts: ms,
			duration: duration_ms,
			keyframe,
			payload: Bytes::from_static(b"x"),
		}
	}

	#[test]
	fn starts_closed_with_unknown_duration() {
		let source = MediaSource::new();
		assert_eq!(source.ready_state(), SourceReadyState::Closed);
		assert!(source.duration().is_nan());
		assert!(source.buffered().is_empty());
	}

	#[test]
	fn attach_opens_and_detach_closes() {
		let (source, _host, _rx) = attached();
		let mut events = source.subscribe();
		assert_eq!(source.ready_state(), SourceReadyState::Open);

		let buffer = source.add_source_buffer("video/mp4").unwrap();
		source.detach();

		assert_eq!(source.ready_state(), SourceReadyState::Closed);
		assert!(source.duration().is_nan());
		assert!(source.source_buffers().is_empty());
		// The orphaned handle rejects further use.
		assert!(buffer.append_buffer(&[0u8; 4]).is_err());
		assert_eq!(events.try_recv(), Ok(MediaSourceEvent::SourceClose));
	}

	#[test]
	fn attach_twice_is_rejected() {
		let (source, _host, _rx) = attached();
		let (other, _) = Host::channel();
		assert!(matches!(source.attach(other), Err(Error::InvalidState(_))));
	}

	#[test]
	fn add_source_buffer_validates() {
		let source = MediaSource::new();
		assert!(matches!(
			source.add_source_buffer("video/mp4"),
			Err(Error::InvalidState(_))
		));

		let (source, _host, _rx) = attached();
		assert!(matches!(
			source.add_source_buffer("text/plain"),
			Err(Error::UnsupportedType(_))
		));

		source.add_source_buffer("video/mp4").unwrap();
		assert!(matches!(source.add_source_buffer("video/mp4"), Err(Error::QuotaExceeded)));
		source.add_source_buffer("audio/mp4").unwrap();
	}

	#[test]
	fn type_support_is_a_prefix_rule() {
		assert!(MediaSource::is_type_supported("video/mp4"));
		assert!(MediaSource::is_type_supported("audio/mp4; codecs=\"mp4a.40.2\""));
		assert!(!MediaSource::is_type_supported(""));
		assert!(!MediaSource::is_type_supported("video/webm"));
	}

	#[test]
	fn set_duration_validates_and_signals() {
		let (source, _host, mut rx) = attached();

		assert!(matches!(source.set_duration(f64::NAN), Err(Error::InvalidRange(_))));
		assert!(matches!(source.set_duration(-1.0), Err(Error::InvalidRange(_))));

		source.set_duration(5.0).unwrap();
		assert_eq!(source.duration(), 5.0);
		assert_eq!(rx.try_recv(), Ok(HostSignal::DurationChanged(5.0)));

		// Setting the same value again is not a change.
		source.set_duration(5.0).unwrap();
		assert!(rx.try_recv().is_err());
	}

	#[test]
	fn end_of_stream_adopts_highest_buffered_end() {
		let (source, _host, mut rx) = attached();
		let buffer = source.add_source_buffer("video/mp4").unwrap();

		buffer
			.push_init(InitSegment {
				duration: None,
				..video_init()
			})
			.unwrap();
		buffer
			.push_samples(vec![sample(0, 200, true), sample(200, 200, false)])
			.unwrap();

		let mut events = source.subscribe();
		source.end_of_stream(None).unwrap();

		assert_eq!(source.ready_state(), SourceReadyState::Ended);
		assert_eq!(source.duration(), 0.4);
		assert_eq!(events.try_recv(), Ok(MediaSourceEvent::SourceEnded));

		// Duration was adopted from the init (infinite), then collapsed.
		let signals: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
		assert!(signals.contains(&HostSignal::AllDataBuffered));
		assert!(signals.contains(&HostSignal::DurationChanged(0.4)));
	}

	#[test]
	fn end_of_stream_never_lowers_the_duration() {
		let (source, _host, _rx) = attached();
		let buffer = source.add_source_buffer("video/mp4").unwrap();

		buffer.push_init(video_init()).unwrap();
		buffer.push_samples(vec![sample(0, 200, true)]).unwrap();

		source.end_of_stream(None).unwrap();
		assert_eq!(source.duration(), 10.0);
	}

	#[test]
	fn append_reopens_an_ended_source() {
		let (source, _host, _rx) = attached();
		let buffer = source.add_source_buffer("video/mp4").unwrap();
		buffer.push_init(video_init()).unwrap();

		source.end_of_stream(None).unwrap();
		assert_eq!(source.ready_state(), SourceReadyState::Ended);

		buffer.push_samples(vec![sample(0, 200, true)]).unwrap();
		assert_eq!(source.ready_state(), SourceReadyState::Open);
	}

	#[test]
	fn ended_buffered_stretches_to_the_highest_end() {
		let (source, _host, _rx) = attached();
		let video = source.add_source_buffer("video/mp4").unwrap();
		let audio = source.add_source_buffer("audio/mp4").unwrap();

		video.push_init(video_init()).unwrap();
		video
			.push_samples(vec![sample(0, 200, true), sample(200, 200, false)])
			.unwrap();

		audio
			.push_init(InitSegment {
				duration: None,
				tracks: vec![TrackInfo {
					id: 1,
					timescale: 1_000,
					config: TrackConfig::Audio(crate::AudioConfig {
						codec: crate::Aac { profile: 2 }.into(),
						sample_rate: 48_000,
						channel_count: 2,
						description: None,
					}),
				}],
			})
			.unwrap();
		audio.push_samples(vec![sample(0, 300, true)]).unwrap();

		// Open: the intersection stops at the shorter track.
		let buffered = source.buffered();
		assert_eq!(buffered.len(), 1);
		assert_eq!(buffered.end(0), 0.3);

		// Ended: both stretch to the overall highest end.
		source.end_of_stream(None).unwrap();
		let buffered = source.buffered();
		assert_eq!(buffered.end(0), 0.4);
	}

	#[test]
	fn remove_source_buffer_detaches() {
		let (source, _host, _rx) = attached();
		let buffer = source.add_source_buffer("video/mp4").unwrap();

		source.remove_source_buffer(&buffer).unwrap();
		assert!(source.source_buffers().is_empty());
		assert!(matches!(source.remove_source_buffer(&buffer), Err(Error::InvalidState(_))));
	}
}
