use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;

use crate::media_source::{EndOfStreamError, MediaSource, MediaSourceState, SourceReadyState};
use crate::{
	CodedFrame, DemuxEvent, Demuxer, Error, HostSignal, InitSegment, MediaKind, Multicast, Result, Sample,
	SourceBufferEvent, TimeRanges, Timestamp, TrackBuffer, TrackConfig, TrackInfo,
};

// Effects on the parent media source, applied after the source buffer's own
// lock is released so no two component locks are ever held at once.
enum ParentOp {
	DurationFromInit(f64),
	HaveMetadata,
	BufferedChanged,
	Removed { start: f64, end: f64 },
	EndOfStreamDecode,
}

struct SourceBufferInner {
	parent: Weak<Mutex<MediaSourceState>>,
	demuxer: Demuxer,
	updating: bool,
	removed: bool,
	first_init_received: bool,
	track_buffers: Vec<TrackBuffer>,
	events: Multicast<SourceBufferEvent>,
}

/// Per-media-type ingress for a media source.
///
/// Bytes appended here are demuxed into initialization and media segments,
/// run through the coded-frame-processing rules, and stored in per-track
/// buffers. Each append or remove runs the `updatestart → update/error →
/// updateend` lifecycle; at most one may be in flight at a time.
#[derive(Clone)]
pub struct SourceBuffer {
	kind: MediaKind,
	state: Arc<Mutex<SourceBufferInner>>,
}

impl SourceBuffer {
	pub(crate) fn new(kind: MediaKind, parent: Weak<Mutex<MediaSourceState>>) -> Self {
		Self {
			kind,
			state: Arc::new(Mutex::new(SourceBufferInner {
				parent,
				demuxer: Demuxer::new(),
				updating: false,
				removed: false,
				first_init_received: false,
				track_buffers: Vec::new(),
				events: Multicast::default(),
			})),
		}
	}

	fn lock(&self) -> MutexGuard<'_, SourceBufferInner> {
		self.state.lock().unwrap()
	}

	/// Whether two handles share the same underlying buffer.
	pub fn is_clone(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.state, &other.state)
	}

	/// The media type this buffer was created for.
	pub fn kind(&self) -> MediaKind {
		self.kind
	}

	/// Whether an append or remove is in flight.
	pub fn updating(&self) -> bool {
		self.lock().updating
	}

	/// Subscribe to the update lifecycle events.
	pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SourceBufferEvent> {
		self.lock().events.subscribe()
	}

	/// Append bytes of fragmented MP4.
	///
	/// Runs synchronously: the demuxer is pumped until it needs more data,
	/// every parsed segment is processed, and the update lifecycle events are
	/// delivered to subscribers in order. Parse and initialization failures
	/// run the append-error path (`error` + `updateend`, then
	/// `end_of_stream(decode)` on the parent) and are also returned.
	pub fn append_buffer(&self, data: &[u8]) -> Result<()> {
		self.begin_update()?;
		self.parent()?.open_if_ended();

		self.update_with(|state, ops| {
			state.demuxer.push(data);
			loop {
				match state.demuxer.poll()? {
					None => return Ok(()),
					Some(DemuxEvent::Init(init)) => Self::init_received(state, init, ops)?,
					Some(DemuxEvent::Media(samples)) => Self::media_received(state, samples, ops)?,
				}
			}
		})
	}

	/// Remove coded frames whose presentation time falls in `[start, end)`.
	///
	/// The removal end is resolved per track: an oversized `end` clamps to
	/// the next random access point, or to the end of that track's buffer.
	pub fn remove(&self, start: f64, end: f64) -> Result<()> {
		self.begin_update()?;
		let duration = self.parent()?.duration();

		if duration.is_nan() {
			return Err(Error::InvalidState("duration is not set"));
		}
		if start.is_nan() || start < 0.0 || start > duration {
			return Err(Error::InvalidRange("remove start out of range"));
		}
		if end.is_nan() || end <= start {
			return Err(Error::InvalidRange("remove end must exceed start"));
		}

		let start_ts = Timestamp::from_secs_f64(start);
		let end_ts = if end.is_finite() { Timestamp::from_secs_f64(end) } else { Timestamp::MAX };

		self.update_with(|state, ops| {
			let mut removed_end = start_ts;

			for track in &mut state.track_buffers {
				// An oversized end clamps to the next random access point, or
				// to the end of this track's buffer (dependency tails inside
				// a group are handled by the track's removal itself).
				let track_end = track
					.ranges()
					.last_end()
					.map(Timestamp::from_secs_f64)
					.unwrap_or(Timestamp::ZERO);
				let remove_end = end_ts.min(track.random_access_point_at_or_after(end_ts).unwrap_or(track_end));

				track.remove(start_ts, remove_end);
				track.require_random_access_point();
				removed_end = removed_end.max(remove_end);
			}

			if removed_end > start_ts {
				ops.push(ParentOp::Removed {
					start: start_ts.as_secs_f64(),
					end: removed_end.as_secs_f64(),
				});
			}
			ops.push(ParentOp::BufferedChanged);
			Ok(())
		})
	}

	/// Reset the demuxer and drop any staged input bytes.
	pub fn abort(&self) -> Result<()> {
		let mut state = self.lock();
		if state.removed {
			return Err(Error::InvalidState("source buffer removed"));
		}

		state.demuxer.reset();
		state.events.emit(SourceBufferEvent::Abort);
		Ok(())
	}

	/// The intersection of this buffer's track ranges.
	///
	/// Empty once the buffer is removed from its media source.
	pub fn buffered(&self) -> TimeRanges {
		let ended = self
			.parent()
			.map(|parent| parent.ready_state() == SourceReadyState::Ended)
			.unwrap_or(false);

		match self.highest_end() {
			Some(highest) => self.buffered_for(ended, highest),
			None => TimeRanges::new(),
		}
	}

	// The intersection of track ranges, stretched to `highest` when `ended`
	// and clamped to `[0, highest]`.
	pub(crate) fn buffered_for(&self, ended: bool, highest: f64) -> TimeRanges {
		let per_track: Vec<TimeRanges> = {
			let state = self.lock();
			state.track_buffers.iter().map(|t| t.ranges().clone()).collect()
		};

		let mut out: Option<TimeRanges> = None;
		for mut ranges in per_track {
			if ended && let Some(last) = ranges.last_end() && last < highest {
				ranges.add(last, highest, 0.0);
			}
			out = Some(match out {
				Some(acc) => acc.intersect(&ranges),
				None => ranges,
			});
		}

		out.unwrap_or_default().intersect(&TimeRanges::single(0.0, highest))
	}

	// The highest buffered end across this buffer's tracks, in seconds.
	pub(crate) fn highest_end(&self) -> Option<f64> {
		let state = self.lock();
		state
			.track_buffers
			.iter()
			.filter_map(|t| t.ranges().last_end())
			.fold(None, |acc: Option<f64>, end| Some(acc.map_or(end, |a| a.max(end))))
	}

	pub(crate) fn has_track(&self, kind: MediaKind) -> bool {
		self.lock().track_buffers.iter().any(|t| t.kind() == kind)
	}

	pub(crate) fn with_track<R>(&self, kind: MediaKind, f: impl FnOnce(&TrackBuffer) -> R) -> Option<R> {
		let state = self.lock();
		state.track_buffers.iter().find(|t| t.kind() == kind).map(f)
	}

	// Severs the buffer from its media source and drops all coded frames.
	pub(crate) fn detach(&self) {
		let mut state = self.lock();
		state.removed = true;
		state.track_buffers.clear();
		state.demuxer.reset();
	}

	fn begin_update(&self) -> Result<()> {
		let state = self.lock();
		if state.removed {
			return Err(Error::InvalidState("source buffer removed"));
		}
		if state.updating {
			return Err(Error::InvalidState("source buffer is updating"));
		}
		Ok(())
	}

	fn parent(&self) -> Result<MediaSource> {
		let parent = self.lock().parent.clone();
		parent
			.upgrade()
			.map(MediaSource::from_state)
			.ok_or(Error::InvalidState("source buffer removed"))
	}

	// Run one update under the lifecycle events, then apply the deferred
	// parent effects with no lock held.
	fn update_with<F>(&self, f: F) -> Result<()>
	where
		F: FnOnce(&mut SourceBufferInner, &mut Vec<ParentOp>) -> Result<()>,
	{
		let mut ops = Vec::new();

		let result = {
			let mut state = self.lock();
			state.updating = true;
			state.events.emit(SourceBufferEvent::UpdateStart);

			let result = f(&mut state, &mut ops);
			match &result {
				Ok(()) => state.events.emit(SourceBufferEvent::Update),
				Err(err) => {
					tracing::warn!(%err, "append error");
					state.demuxer.reset();
					ops.push(ParentOp::EndOfStreamDecode);
					state.events.emit(SourceBufferEvent::Error);
				}
			}

			state.updating = false;
			state.events.emit(SourceBufferEvent::UpdateEnd);
			result
		};

		self.apply(ops);
		result
	}

	fn apply(&self, ops: Vec<ParentOp>) {
		// The parent may be gone mid-detach; effects on it are then moot.
		let Ok(parent) = self.parent() else { return };

		for op in ops {
			match op {
				ParentOp::DurationFromInit(duration) => parent.duration_from_init(duration),
				ParentOp::HaveMetadata => parent.signal_host(HostSignal::HaveMetadata),
				ParentOp::BufferedChanged => parent.signal_host(HostSignal::BufferedChanged),
				ParentOp::Removed { start, end } => parent.signal_host(HostSignal::Removed { start, end }),
				ParentOp::EndOfStreamDecode => parent.end_of_stream_internal(Some(EndOfStreamError::Decode)),
			}
		}
	}

	fn init_received(state: &mut SourceBufferInner, init: InitSegment, ops: &mut Vec<ParentOp>) -> Result<()> {
		if init.tracks.is_empty() {
			return Err(Error::NoTracks);
		}

		for track in &init.tracks {
			if !track.config.is_supported() {
				return Err(Error::UnsupportedCodec(codec_string(&track.config)));
			}
		}

		// Adopt the container duration when none is known yet; an unknown
		// duration becomes unbounded.
		let duration = init.duration.map(|d| d.as_secs_f64()).unwrap_or(f64::INFINITY);
		ops.push(ParentOp::DurationFromInit(duration));

		if !state.first_init_received {
			for track in &init.tracks {
				tracing::debug!(id = track.id, kind = ?track.kind(), "creating track buffer");
				state.track_buffers.push(match &track.config {
					TrackConfig::Audio(config) => TrackBuffer::new_audio(track.id, config.clone()),
					TrackConfig::Video(config) => TrackBuffer::new_video(track.id, config.clone()),
				});
			}

			state.first_init_received = true;
			ops.push(ParentOp::HaveMetadata);
			return Ok(());
		}

		Self::reinit(state, &init.tracks)
	}

	// A later initialization segment must describe the same track structure;
	// it may only change codec configuration.
	fn reinit(state: &mut SourceBufferInner, tracks: &[TrackInfo]) -> Result<()> {
		for kind in [MediaKind::Audio, MediaKind::Video] {
			let new: Vec<&TrackInfo> = tracks.iter().filter(|t| t.kind() == kind).collect();
			let old: Vec<&TrackBuffer> = state.track_buffers.iter().filter(|t| t.kind() == kind).collect();

			if new.len() != old.len() {
				return Err(Error::TrackMismatch);
			}

			if new.len() > 1 {
				let matched = new
					.iter()
					.all(|info| old.iter().any(|track| track.track_id() == info.id));
				if !matched {
					return Err(Error::TrackMismatch);
				}
			}
		}

		// Reconfigure in declaration order, pairing tracks per type.
		for kind in [MediaKind::Audio, MediaKind::Video] {
			let new: Vec<TrackConfig> = tracks
				.iter()
				.filter(|t| t.kind() == kind)
				.map(|t| t.config.clone())
				.collect();

			let old = state.track_buffers.iter_mut().filter(|t| t.kind() == kind);
			for (track, config) in old.zip(new) {
				track.reconfigure(config);
			}
		}

		for track in &mut state.track_buffers {
			track.require_random_access_point();
		}

		Ok(())
	}

	// Coded-frame-processing, per sample.
	fn media_received(state: &mut SourceBufferInner, samples: Vec<Sample>, ops: &mut Vec<ParentOp>) -> Result<()> {
		for sample in samples {
			let index = state
				.track_buffers
				.iter()
				.position(|t| t.track_id() == sample.track_id)
				.ok_or(Error::ByteStream("unknown track"))?;

			let dts = sample.decode_time()?;
			let pts = sample.pts()?;
			let duration = sample.duration_us()?;

			// Discontinuity guard: a decode timestamp that jumps backwards or
			// by more than two frame durations voids decode continuity for
			// every track in this buffer.
			let track = &state.track_buffers[index];
			if let (Some(last_dts), Some(last_duration)) = (track.last_decode_dts(), track.last_frame_duration()) {
				let discontinuous = dts < last_dts || dts - last_dts > last_duration + last_duration;
				if discontinuous {
					tracing::debug!(%dts, %last_dts, "decode discontinuity");
					for track in &mut state.track_buffers {
						track.require_random_access_point();
					}
				}
			}

			let track = &mut state.track_buffers[index];
			if track.needs_random_access_point() {
				if !sample.keyframe {
					tracing::trace!(?sample, "dropping frame before random access point");
					continue;
				}
				track.random_access_point_found();
			}

			track.append(
				CodedFrame {
					timestamp: pts,
					duration,
					keyframe: sample.keyframe,
					payload: sample.payload,
				},
				dts,
			);
		}

		ops.push(ParentOp::BufferedChanged);
		Ok(())
	}
}

#[cfg(any(test, feature = "test-util"))]
impl SourceBuffer {
	/// Process an initialization segment as if it had been appended,
	/// including the update lifecycle events.
	pub fn push_init(&self, init: InitSegment) -> Result<()> {
		self.begin_update()?;
		self.parent()?.open_if_ended();
		self.update_with(|state, ops| Self::init_received(state, init, ops))
	}

	/// Process media samples as if they had been appended, including the
	/// update lifecycle events.
	pub fn push_samples(&self, samples: Vec<Sample>) -> Result<()> {
		self.begin_update()?;
		self.parent()?.open_if_ended();
		self.update_with(|state, ops| Self::media_received(state, samples, ops))
	}
}

fn codec_string(config: &TrackConfig) -> String {
	match config {
		TrackConfig::Audio(config) => config.codec.to_string(),
		TrackConfig::Video(config) => config.codec.to_string(),
	}
}
