use std::time::Duration;

use tokio::sync::mpsc;
use vireo_mse::{
	AudioConfig, CodedFrame, Direction, MediaKind, MediaSource, Result, Timestamp, TrackConfig, VideoConfig,
};

use crate::{
	AudioData, AudioDecoder, AudioMixer, EncodedChunk, NodeId, PcmBuffer, VideoDecoder, VideoFrame, VideoPresenter,
};

/// Scheduler tunables.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
	/// Refill the decode queues when in-flight plus ready drops below this.
	pub low_watermark: usize,

	/// Stop submitting once in-flight plus ready reaches this.
	pub high_watermark: usize,

	/// How far past the playhead buffered data must extend before playback
	/// is considered unblocked, in seconds.
	pub lookahead: f64,

	/// Minimum wall time between `timeupdate` events.
	pub timeupdate_interval: Duration,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			low_watermark: 20,
			high_watermark: 30,
			lookahead: 0.1,
			timeupdate_interval: Duration::from_millis(15),
		}
	}
}

struct VideoQueue {
	// Submitted presentation timestamps, not yet delivered.
	in_flight: Vec<Timestamp>,
	// Decoded frames awaiting render, sorted by timestamp.
	ready: Vec<VideoFrame>,
	// The rendering-order cursor of the last submitted frame.
	last_submitted: Option<Timestamp>,
	config: Option<VideoConfig>,
}

struct SubmittedAudio {
	synthetic: Timestamp,
	original: Timestamp,
}

struct AudioQueue {
	in_flight: Vec<SubmittedAudio>,
	ready: Vec<AudioData>,
	last_submitted: Option<Timestamp>,
	// Strictly increasing input clock for reverse playback; decoders that
	// infer output timing need monotonic input timestamps.
	next_synthetic: Timestamp,
	config: Option<AudioConfig>,
}

struct AudioNode {
	node: NodeId,
	start: Timestamp,
	end: Timestamp,
	// Kept so the node can be rescheduled after a rate change.
	buffer: PcmBuffer,
}

/// The decode scheduler: keeps both decoder queues between the low and high
/// watermarks, renders the frame at the playhead, and feeds the mixer.
pub(crate) struct Scheduler {
	config: SchedulerConfig,

	video_decoder: Box<dyn VideoDecoder>,
	audio_decoder: Box<dyn AudioDecoder>,
	mixer: Box<dyn AudioMixer>,
	presenter: Box<dyn VideoPresenter>,

	video_tx: mpsc::UnboundedSender<VideoFrame>,
	video_rx: mpsc::UnboundedReceiver<VideoFrame>,
	audio_tx: mpsc::UnboundedSender<AudioData>,
	audio_rx: mpsc::UnboundedReceiver<AudioData>,

	video: VideoQueue,
	audio: AudioQueue,

	scheduled: Vec<AudioNode>,
	last_rendered: Option<VideoFrame>,
	surface_dims: Option<(u32, u32)>,
}

impl Scheduler {
	pub fn new(
		config: SchedulerConfig,
		video_decoder: Box<dyn VideoDecoder>,
		audio_decoder: Box<dyn AudioDecoder>,
		mixer: Box<dyn AudioMixer>,
		presenter: Box<dyn VideoPresenter>,
	) -> Self {
		let (video_tx, video_rx) = mpsc::unbounded_channel();
		let (audio_tx, audio_rx) = mpsc::unbounded_channel();

		Self {
			config,
			video_decoder,
			audio_decoder,
			mixer,
			presenter,
			video_tx,
			video_rx,
			audio_tx,
			audio_rx,
			video: VideoQueue {
				in_flight: Vec::new(),
				ready: Vec::new(),
				last_submitted: None,
				config: None,
			},
			audio: AudioQueue {
				in_flight: Vec::new(),
				ready: Vec::new(),
				last_submitted: None,
				next_synthetic: Timestamp::ZERO,
				config: None,
			},
			scheduled: Vec::new(),
			last_rendered: None,
			surface_dims: None,
		}
	}

	pub fn audio_clock(&self) -> Option<f64> {
		self.mixer.now()
	}

	pub fn set_volume(&mut self, volume: f64) {
		self.mixer.set_volume(volume);
	}

	pub fn video_dimensions(&self) -> Option<(u32, u32)> {
		self.surface_dims
	}

	/// Whether a decoded (or just rendered) video frame covers `time`.
	pub fn video_covers(&self, time: Timestamp) -> bool {
		self.video.ready.iter().any(|f| f.contains(time))
			|| self.last_rendered.as_ref().is_some_and(|f| f.contains(time))
	}

	/// Whether decoded or mixer-scheduled audio covers `time`.
	pub fn audio_covers(&self, time: Timestamp) -> bool {
		self.audio.ready.iter().any(|d| d.contains(time))
			|| self.scheduled.iter().any(|n| n.start <= time && time < n.end)
	}

	/// Drop every queued and in-flight frame, reset both decoders, and stop
	/// all scheduled mixer output. Runs on seek, rate-sign flips, and detach.
	pub fn reset(&mut self) {
		tracing::debug!("resetting decode queues");

		self.video_decoder.reset();
		self.audio_decoder.reset();

		self.video.in_flight.clear();
		self.video.ready.clear();
		self.video.last_submitted = None;
		self.video.config = None;

		self.audio.in_flight.clear();
		self.audio.ready.clear();
		self.audio.last_submitted = None;
		self.audio.next_synthetic = Timestamp::ZERO;
		self.audio.config = None;

		for node in self.scheduled.drain(..) {
			self.mixer.stop(node.node);
		}
		self.last_rendered = None;

		// Outputs already in the channels belong to the old queue state.
		while self.video_rx.try_recv().is_ok() {}
		while self.audio_rx.try_recv().is_ok() {}
	}

	/// Move decoder outputs into the ready queues, dropping frames that are
	/// stale (no matching submission) or already behind the playhead.
	pub fn drain(&mut self, now: Timestamp, direction: Direction) {
		while let Ok(frame) = self.video_rx.try_recv() {
			self.on_video_output(frame, now, direction);
		}
		while let Ok(data) = self.audio_rx.try_recv() {
			self.on_audio_output(data, now, direction);
		}
	}

	/// Top both queues up to the high watermark if they fell below the low
	/// one.
	pub fn refill(&mut self, source: &MediaSource, now: Timestamp, direction: Direction) -> Result<()> {
		self.refill_video(source, now, direction)?;
		self.refill_audio(source, now, direction)
	}

	fn refill_video(&mut self, source: &MediaSource, now: Timestamp, direction: Direction) -> Result<()> {
		if !source.has_track(MediaKind::Video) {
			return Ok(());
		}

		loop {
			let queued = self.video.in_flight.len() + self.video.ready.len();
			if queued >= self.config.low_watermark {
				return Ok(());
			}
			let budget = self.config.high_watermark - queued;

			// The continuation anchor may have been evicted by a remove.
			let anchor = self.video.last_submitted.filter(|ts| {
				source
					.with_track(MediaKind::Video, |t| t.contains_frame_at(*ts))
					.unwrap_or(false)
			});

			match anchor {
				None => {
					// Seed: the decoder needs the dependency prefix of the
					// group containing the playhead.
					let deps = source
						.with_track(MediaKind::Video, |t| t.decode_dependencies(now))
						.flatten();
					let Some((frames, TrackConfig::Video(config))) = deps else {
						return Ok(());
					};

					self.video.last_submitted = frames.last().map(|f| f.timestamp);
					self.submit_video(frames, &config)?;
				}
				Some(anchor) => {
					let next = source
						.with_track(MediaKind::Video, |t| t.next_frames(anchor, budget, direction))
						.flatten();
					let Some((frames, TrackConfig::Video(config))) = next else {
						return Ok(());
					};

					self.video.last_submitted = frames.last().map(|f| f.timestamp).or(Some(anchor));

					match direction {
						Direction::Forward => self.submit_video(frames, &config)?,
						// Backward rendering still decodes each group
						// forwards: submit the dependency prefix of the
						// latest not-yet-decoded frame of every group the
						// batch touches.
						Direction::Backward => {
							for segment in backward_segments(&frames) {
								let deps = source
									.with_track(MediaKind::Video, |t| t.decode_dependencies(segment))
									.flatten();
								let Some((frames, TrackConfig::Video(config))) = deps else {
									continue;
								};
								self.submit_video(frames, &config)?;
							}
						}
					}
				}
			}
		}
	}

	fn refill_audio(&mut self, source: &MediaSource, now: Timestamp, direction: Direction) -> Result<()> {
		if !source.has_track(MediaKind::Audio) {
			return Ok(());
		}

		loop {
			let queued = self.audio.in_flight.len() + self.audio.ready.len();
			if queued >= self.config.low_watermark {
				return Ok(());
			}
			let budget = self.config.high_watermark - queued;

			let anchor = self.audio.last_submitted.filter(|ts| {
				source
					.with_track(MediaKind::Audio, |t| t.contains_frame_at(*ts))
					.unwrap_or(false)
			});

			let batch = match anchor {
				None => source
					.with_track(MediaKind::Audio, |t| t.decode_dependencies(now))
					.flatten(),
				Some(anchor) => source
					.with_track(MediaKind::Audio, |t| t.next_frames(anchor, budget, direction))
					.flatten(),
			};
			let Some((frames, TrackConfig::Audio(config))) = batch else {
				return Ok(());
			};

			self.audio.last_submitted = frames.last().map(|f| f.timestamp).or(self.audio.last_submitted);
			for frame in frames {
				self.submit_audio(frame, &config, direction)?;
			}
		}
	}

	fn submit_video(&mut self, frames: Vec<CodedFrame>, config: &VideoConfig) -> Result<()> {
		for frame in frames {
			let queued = self.video.in_flight.contains(&frame.timestamp)
				|| self.video.ready.iter().any(|f| f.timestamp == frame.timestamp);
			if queued {
				continue;
			}

			if self.video.config.as_ref() != Some(config) {
				tracing::debug!("configuring video decoder");
				self.video_decoder.configure(config, self.video_tx.clone())?;
				self.video.config = Some(config.clone());
			}

			tracing::trace!(?frame, "submitting video frame");
			self.video.in_flight.push(frame.timestamp);
			self.video_decoder.decode(EncodedChunk {
				timestamp: frame.timestamp,
				duration: frame.duration,
				keyframe: frame.keyframe,
				payload: frame.payload,
			})?;
		}

		Ok(())
	}

	fn submit_audio(&mut self, frame: CodedFrame, config: &AudioConfig, direction: Direction) -> Result<()> {
		let queued = self.audio.in_flight.iter().any(|s| s.original == frame.timestamp)
			|| self.audio.ready.iter().any(|d| d.timestamp == frame.timestamp);
		if queued {
			return Ok(());
		}

		if self.audio.config.as_ref() != Some(config) {
			tracing::debug!("configuring audio decoder");
			self.audio_decoder.configure(config, self.audio_tx.clone())?;
			self.audio.config = Some(config.clone());
		}

		let synthetic = match direction {
			Direction::Forward => frame.timestamp,
			Direction::Backward => {
				let ts = self.audio.next_synthetic;
				self.audio.next_synthetic = ts + frame.duration;
				ts
			}
		};

		tracing::trace!(?frame, %synthetic, "submitting audio frame");
		self.audio.in_flight.push(SubmittedAudio {
			synthetic,
			original: frame.timestamp,
		});
		self.audio_decoder.decode(EncodedChunk {
			timestamp: synthetic,
			duration: frame.duration,
			keyframe: frame.keyframe,
			payload: frame.payload,
		})
	}

	fn on_video_output(&mut self, mut frame: VideoFrame, now: Timestamp, direction: Direction) {
		// Match the output back to a submission by timestamp; decoder output
		// clocks may drift from the input.
		let tolerance = matching_tolerance(frame.duration);
		let Some(index) = self
			.video
			.in_flight
			.iter()
			.position(|ts| ts.abs_diff(frame.timestamp) <= tolerance)
		else {
			tracing::trace!(?frame, "dropping unmatched video frame");
			return;
		};

		frame.timestamp = self.video.in_flight.swap_remove(index);

		if is_late(frame.timestamp, frame.end(), now, direction) {
			tracing::trace!(?frame, "dropping late video frame");
			return;
		}

		let at = self.video.ready.partition_point(|f| f.timestamp < frame.timestamp);
		self.video.ready.insert(at, frame);
	}

	fn on_audio_output(&mut self, mut data: AudioData, now: Timestamp, direction: Direction) {
		let tolerance = matching_tolerance(data.duration);
		let Some(index) = self
			.audio
			.in_flight
			.iter()
			.position(|s| s.synthetic.abs_diff(data.timestamp) <= tolerance)
		else {
			tracing::trace!(?data, "dropping unmatched audio frame");
			return;
		};

		// Restore the presentation timestamp the synthetic one replaced.
		data.timestamp = self.audio.in_flight.swap_remove(index).original;

		if is_late(data.timestamp, data.end(), now, direction) {
			tracing::trace!(?data, "dropping late audio frame");
			return;
		}

		let at = self.audio.ready.partition_point(|d| d.timestamp < data.timestamp);
		self.audio.ready.insert(at, data);
	}

	/// Draw the frame containing the playhead, dropping everything the
	/// playhead has already passed. Returns whether the surface was resized.
	pub fn render(&mut self, now: Timestamp, direction: Direction) -> bool {
		let before = self.video.ready.len();
		self.video.ready.retain(|f| !is_late(f.timestamp, f.end(), now, direction));
		let dropped = before - self.video.ready.len();
		if dropped > 0 {
			tracing::trace!(dropped, "dropped late video frames");
		}

		let Some(index) = self.video.ready.iter().position(|f| f.contains(now)) else {
			return false;
		};
		let frame = self.video.ready.remove(index);

		let dims = (frame.display_width, frame.display_height);
		let resized = self.surface_dims != Some(dims);
		if resized {
			self.presenter.resize(dims.0, dims.1);
			self.surface_dims = Some(dims);
		}

		self.presenter.draw(&frame);
		self.last_rendered = Some(frame);

		resized
	}

	/// Copy decoded audio into the mixer, batching consecutive same-format
	/// runs. For backward playback the samples of each channel are reversed,
	/// so the mixer plays at a positive rate.
	pub fn schedule_audio(&mut self, now: Timestamp, rate: f64, direction: Direction) {
		self.audio.ready.retain(|d| !is_late(d.timestamp, d.end(), now, direction));

		let Some(mixer_now) = self.mixer.now() else {
			return;
		};

		// Nodes fully behind the playhead have played out.
		self.scheduled.retain(|n| match direction {
			Direction::Forward => n.end > now,
			Direction::Backward => n.start < now,
		});

		let mut frames = std::mem::take(&mut self.audio.ready);
		if direction == Direction::Backward {
			frames.reverse();
		}

		for batch in batch_consecutive(frames, direction) {
			self.schedule_batch(batch, now, mixer_now, rate, direction);
		}
	}

	fn schedule_batch(&mut self, batch: Vec<AudioData>, now: Timestamp, mixer_now: f64, rate: f64, direction: Direction) {
		let Some(first) = batch.first() else { return };
		let sample_rate = first.sample_rate;
		let channels = first.channel_count();

		let start = batch.iter().map(|d| d.timestamp).min().unwrap_or_default();
		let end = batch.iter().map(|d| d.end()).max().unwrap_or_default();

		// Concatenate in forward media order; reverse playback then flips
		// each channel in place.
		let mut planes = vec![Vec::new(); channels];
		let ordered: Box<dyn Iterator<Item = &AudioData>> = match direction {
			Direction::Forward => Box::new(batch.iter()),
			Direction::Backward => Box::new(batch.iter().rev()),
		};
		for data in ordered {
			for (plane, source) in planes.iter_mut().zip(&data.planes) {
				plane.extend_from_slice(source);
			}
		}
		if direction == Direction::Backward {
			for plane in &mut planes {
				plane.reverse();
			}
		}

		// Offset from "now" to the batch's start in rendering order, scaled
		// by the playback speed. Saturates at zero: partially passed batches
		// start immediately.
		let offset = match direction {
			Direction::Forward => start - now,
			Direction::Backward => now - end,
		};
		let when = mixer_now + offset.as_secs_f64() / rate.abs().max(f64::MIN_POSITIVE);

		let buffer = PcmBuffer { sample_rate, planes };
		tracing::trace!(%start, %end, when, "scheduling audio batch");
		let node = self.mixer.schedule(buffer.clone(), when, rate.abs());
		self.scheduled.push(AudioNode {
			node,
			start,
			end,
			buffer,
		});
	}

	/// Stop and re-schedule every pending mixer node at a new rate.
	pub fn reschedule_audio(&mut self, now: Timestamp, rate: f64, direction: Direction) {
		let Some(mixer_now) = self.mixer.now() else {
			return;
		};

		let nodes = std::mem::take(&mut self.scheduled);
		for node in nodes {
			self.mixer.stop(node.node);

			let finished = match direction {
				Direction::Forward => node.end <= now,
				Direction::Backward => node.start >= now,
			};
			if finished {
				continue;
			}

			let offset = match direction {
				Direction::Forward => node.start - now,
				Direction::Backward => now - node.end,
			};
			let when = mixer_now + offset.as_secs_f64() / rate.abs().max(f64::MIN_POSITIVE);

			let id = self.mixer.schedule(node.buffer.clone(), when, rate.abs());
			self.scheduled.push(AudioNode { node: id, ..node });
		}
	}
}

// Split rendering-ordered audio frames into runs that can share one PCM
// buffer: temporally consecutive (gap at most a sixteenth of a frame) and
// the same sample rate and channel count.
fn batch_consecutive(frames: Vec<AudioData>, direction: Direction) -> Vec<Vec<AudioData>> {
	let mut batches: Vec<Vec<AudioData>> = Vec::new();

	for frame in frames {
		let extends = batches.last().and_then(|batch| batch.last()).is_some_and(|last| {
			let tolerance = matching_tolerance(last.duration);
			let contiguous = match direction {
				Direction::Forward => frame.timestamp.abs_diff(last.end()) <= tolerance,
				Direction::Backward => last.timestamp.abs_diff(frame.end()) <= tolerance,
			};
			contiguous && frame.sample_rate == last.sample_rate && frame.channel_count() == last.channel_count()
		});

		if extends && let Some(batch) = batches.last_mut() {
			batch.push(frame);
		} else {
			batches.push(vec![frame]);
		}
	}

	batches
}

// Frames wholly behind the playhead in the playback direction are late. The
// backward bound is exclusive: a frame starting exactly at the playhead still
// contains it and must stay renderable.
fn is_late(start: Timestamp, end: Timestamp, now: Timestamp, direction: Direction) -> bool {
	match direction {
		Direction::Forward => end <= now,
		Direction::Backward => start > now,
	}
}

// Timestamp matching tolerance: a sixteenth of the frame duration, at least
// one microsecond.
fn matching_tolerance(duration: Timestamp) -> Timestamp {
	Timestamp::from_micros(duration.as_micros().div_ceil(16).max(1))
}

// For a rendering-order (descending) video batch, the latest frame of each
// group the batch touches. A keyframe is the first frame of its group, so in
// the descending walk it closes one group and the next frame starts another.
fn backward_segments(frames: &[CodedFrame]) -> Vec<Timestamp> {
	let mut segments = Vec::new();
	let mut starts_segment = true;

	for frame in frames {
		if starts_segment {
			segments.push(frame.timestamp);
		}
		starts_segment = frame.keyframe;
	}

	segments
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;

	#[test]
	fn lateness_is_directional() {
		let at = |ms: u64| Timestamp::from_micros(ms * 1_000);

		// Forward: frames ending at or before now are late.
		assert!(is_late(at(0), at(200), at(200), Direction::Forward));
		assert!(!is_late(at(0), at(200), at(199), Direction::Forward));

		// Backward: frames starting after now are late; one starting exactly
		// at now still contains it.
		assert!(is_late(at(200), at(400), at(199), Direction::Backward));
		assert!(!is_late(at(200), at(400), at(200), Direction::Backward));
		assert!(!is_late(at(0), at(200), at(200), Direction::Backward));
	}

	#[test]
	fn tolerance_is_a_sixteenth_rounded_up() {
		assert_eq!(matching_tolerance(Timestamp::from_micros(16_000)).as_micros(), 1_000);
		assert_eq!(matching_tolerance(Timestamp::from_micros(33_333)).as_micros(), 2_084);
		assert_eq!(matching_tolerance(Timestamp::from_micros(4)).as_micros(), 1);
	}

	fn pcm(ms: u64, duration_ms: u64, sample_rate: u32, channels: usize) -> AudioData {
		AudioData {
			timestamp: Timestamp::from_micros(ms * 1_000),
			duration: Timestamp::from_micros(duration_ms * 1_000),
			sample_rate,
			planes: vec![Vec::new(); channels],
		}
	}

	#[test]
	fn audio_batches_split_on_gaps() {
		let frames = vec![
			pcm(0, 20, 48_000, 2),
			pcm(20, 20, 48_000, 2),
			// A 60ms hole.
			pcm(100, 20, 48_000, 2),
		];

		let batches = batch_consecutive(frames, Direction::Forward);
		assert_eq!(batches.len(), 2);
		assert_eq!(batches[0].len(), 2);
		assert_eq!(batches[1].len(), 1);
	}

	#[test]
	fn audio_batches_split_on_format_changes() {
		let frames = vec![
			pcm(0, 20, 48_000, 2),
			pcm(20, 20, 44_100, 2),
			pcm(40, 20, 44_100, 1),
		];

		let batches = batch_consecutive(frames, Direction::Forward);
		assert_eq!(batches.len(), 3);
	}

	#[test]
	fn audio_batches_follow_the_rendering_direction() {
		// Rendering order for backward playback is descending.
		let frames = vec![pcm(40, 20, 48_000, 2), pcm(20, 20, 48_000, 2), pcm(0, 20, 48_000, 2)];

		let batches = batch_consecutive(frames, Direction::Backward);
		assert_eq!(batches.len(), 1);
		assert_eq!(batches[0].len(), 3);

		// The same frames read as two runs going forward from 40.
		let frames = vec![pcm(40, 20, 48_000, 2), pcm(20, 20, 48_000, 2)];
		let batches = batch_consecutive(frames, Direction::Forward);
		assert_eq!(batches.len(), 2);
	}

	#[test]
	fn backward_segments_split_at_keyframes() {
		let frame = |ms: u64, keyframe: bool| CodedFrame {
			timestamp: Timestamp::from_micros(ms * 1_000),
			duration: Timestamp::from_micros(1_000),
			keyframe,
			payload: Bytes::new(),
		};

		// Descending walk over two groups: [600, 400(key), 200, 0(key)].
		let frames = vec![frame(600, false), frame(400, true), frame(200, false), frame(0, true)];
		let segments = backward_segments(&frames);
		assert_eq!(
			segments,
			vec![Timestamp::from_micros(600_000), Timestamp::from_micros(200_000)]
		);

		// A batch beginning right at a group boundary.
		let frames = vec![frame(400, true), frame(200, false), frame(0, true)];
		assert_eq!(
			backward_segments(&frames),
			vec![Timestamp::from_micros(400_000), Timestamp::from_micros(200_000)]
		);
	}
}
