use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use vireo_mse::{
	Direction, Error, Host, HostSignal, MediaKind, MediaSource, Multicast, Result, SourceReadyState, TimeRanges,
	Timestamp,
};

use crate::{AudioDecoder, AudioMixer, MediaClock, Scheduler, SchedulerConfig, VideoDecoder, VideoPresenter};

/// How much media data the element has, per the HTML media model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
	/// No metadata yet.
	Nothing,
	/// Track structure and duration are known.
	Metadata,
	/// A decoded frame covers the playhead.
	CurrentData,
	/// Data beyond the playhead is buffered and decoding.
	FutureData,
	/// Never entered; buffering heuristics are the ABR loop's job.
	EnoughData,
}

/// Events observable on a media element, named after their DOM counterparts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaElementEvent {
	Emptied,
	LoadedMetadata,
	LoadedData,
	CanPlay,
	CanPlayThrough,
	Play,
	Playing,
	Waiting,
	Pause,
	RateChange,
	VolumeChange,
	Seeking,
	Seeked,
	TimeUpdate,
	DurationChange,
	Progress,
	Resize,
	Ended,
}

/// The pending result of [`MediaElement::play`].
///
/// Resolves once playback actually starts and rejects with
/// [`Error::Aborted`] when the element is paused, ends, or detaches first.
pub struct PlayPromise(oneshot::Receiver<Result<()>>);

impl Future for PlayPromise {
	type Output = Result<()>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.0).poll(cx).map(|result| match result {
			Ok(inner) => inner,
			Err(_) => Err(Error::Aborted),
		})
	}
}

// Whether the element is currently advancing, stalled, or neither; used to
// edge-trigger `playing`/`waiting`.
#[derive(Clone, Copy, PartialEq, Eq)]
enum AdvanceState {
	Idle,
	Playing,
	Waiting,
}

/// The `HTMLMediaElement`-shaped playback surface.
///
/// Owns the decoders, mixer, and presenter; plays whatever media source is
/// attached via [`set_src_object`](Self::set_src_object). The embedder
/// drives it by calling [`tick`](Self::tick) at animation cadence with a
/// monotonic timestamp; everything else (clock advance, decode scheduling,
/// rendering, event emission) happens inside.
pub struct MediaElement {
	source: Option<MediaSource>,
	host_rx: Option<mpsc::UnboundedReceiver<HostSignal>>,

	scheduler: Scheduler,
	config: SchedulerConfig,
	clock: MediaClock,
	events: Multicast<MediaElementEvent>,

	current_time: f64,
	duration: f64,
	playback_rate: f64,
	paused: bool,
	seeking: bool,
	seek_target: Option<Timestamp>,
	ready_state: ReadyState,
	advance_state: AdvanceState,
	loaded_data_fired: bool,
	fired_ended: bool,
	volume: f64,
	muted: bool,
	played: TimeRanges,
	play_waiters: Vec<oneshot::Sender<Result<()>>>,
	last_timeupdate: Option<Instant>,
	advanced_since_timeupdate: bool,
}

impl MediaElement {
	pub fn new(
		video_decoder: Box<dyn VideoDecoder>,
		audio_decoder: Box<dyn AudioDecoder>,
		mixer: Box<dyn AudioMixer>,
		presenter: Box<dyn VideoPresenter>,
	) -> Self {
		Self::with_config(SchedulerConfig::default(), video_decoder, audio_decoder, mixer, presenter)
	}

	pub fn with_config(
		config: SchedulerConfig,
		video_decoder: Box<dyn VideoDecoder>,
		audio_decoder: Box<dyn AudioDecoder>,
		mixer: Box<dyn AudioMixer>,
		presenter: Box<dyn VideoPresenter>,
	) -> Self {
		Self {
			source: None,
			host_rx: None,
			scheduler: Scheduler::new(config.clone(), video_decoder, audio_decoder, mixer, presenter),
			config,
			clock: MediaClock::new(),
			events: Multicast::default(),
			current_time: 0.0,
			duration: f64::NAN,
			playback_rate: 1.0,
			paused: true,
			seeking: false,
			seek_target: None,
			ready_state: ReadyState::Nothing,
			advance_state: AdvanceState::Idle,
			loaded_data_fired: false,
			fired_ended: false,
			volume: 1.0,
			muted: false,
			played: TimeRanges::new(),
			play_waiters: Vec::new(),
			last_timeupdate: None,
			advanced_since_timeupdate: false,
		}
	}

	pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<MediaElementEvent> {
		self.events.subscribe()
	}

	pub fn current_time(&self) -> f64 {
		self.current_time
	}

	pub fn duration(&self) -> f64 {
		self.duration
	}

	pub fn playback_rate(&self) -> f64 {
		self.playback_rate
	}

	pub fn paused(&self) -> bool {
		self.paused
	}

	pub fn seeking(&self) -> bool {
		self.seeking
	}

	pub fn ready_state(&self) -> ReadyState {
		self.ready_state
	}

	pub fn volume(&self) -> f64 {
		self.volume
	}

	pub fn muted(&self) -> bool {
		self.muted
	}

	pub fn played(&self) -> TimeRanges {
		self.played.clone()
	}

	pub fn buffered(&self) -> TimeRanges {
		self.source.as_ref().map(|s| s.buffered()).unwrap_or_default()
	}

	/// The whole presentation is seekable once the duration is known.
	pub fn seekable(&self) -> TimeRanges {
		if self.duration.is_nan() {
			TimeRanges::new()
		} else {
			TimeRanges::single(0.0, self.duration)
		}
	}

	pub fn video_width(&self) -> u32 {
		self.scheduler.video_dimensions().map(|d| d.0).unwrap_or(0)
	}

	pub fn video_height(&self) -> u32 {
		self.scheduler.video_dimensions().map(|d| d.1).unwrap_or(0)
	}

	pub fn src_object(&self) -> Option<MediaSource> {
		self.source.clone()
	}

	/// Whether playback has reached the end in the current direction.
	pub fn ended(&self) -> bool {
		if self.ready_state < ReadyState::Metadata {
			return false;
		}

		match Direction::from_rate(self.playback_rate) {
			// Strict equality on purpose: the clock clamps to the buffered
			// range end, which equals the duration once the stream ended.
			Direction::Forward => self.is_end_of_stream() && self.current_time == self.duration,
			Direction::Backward => self.current_time == 0.0,
		}
	}

	fn is_end_of_stream(&self) -> bool {
		self.source
			.as_ref()
			.is_some_and(|s| s.ready_state() == SourceReadyState::Ended)
	}

	/// Attach a media source (or detach with `None`).
	///
	/// Detaching drops all buffered and decoded media and rejects pending
	/// play promises.
	pub fn set_src_object(&mut self, source: Option<MediaSource>) -> Result<()> {
		if let Some(old) = self.source.take() {
			old.detach();
		}
		self.host_rx = None;

		self.scheduler.reset();
		self.clock.reset();
		self.current_time = 0.0;
		self.duration = f64::NAN;
		self.paused = true;
		self.seeking = false;
		self.seek_target = None;
		self.ready_state = ReadyState::Nothing;
		self.advance_state = AdvanceState::Idle;
		self.loaded_data_fired = false;
		self.fired_ended = false;
		self.played = TimeRanges::new();
		self.reject_play_waiters();
		self.emit(MediaElementEvent::Emptied);

		if let Some(source) = source {
			let (host, rx) = Host::channel();
			source.attach(host)?;
			self.source = Some(source);
			self.host_rx = Some(rx);
		}

		Ok(())
	}

	/// Begin or resume playback.
	pub fn play(&mut self) -> PlayPromise {
		let (tx, rx) = oneshot::channel();

		if self.ended() && Direction::from_rate(self.playback_rate) == Direction::Forward {
			self.start_seek(0.0);
		}

		if self.paused {
			self.paused = false;
			self.fired_ended = false;
			self.clock.reset();
			self.emit(MediaElementEvent::Play);
		}

		self.play_waiters.push(tx);
		self.update_playing_state();
		PlayPromise(rx)
	}

	/// Pause playback; pending play promises reject with `Aborted`.
	pub fn pause(&mut self) {
		if self.paused {
			return;
		}

		self.paused = true;
		self.advance_state = AdvanceState::Idle;
		self.clock.reset();
		self.emit(MediaElementEvent::TimeUpdate);
		self.emit(MediaElementEvent::Pause);
		self.reject_play_waiters();
	}

	/// Seek when metadata is known; otherwise just set the position.
	pub fn set_current_time(&mut self, time: f64) {
		if self.ready_state == ReadyState::Nothing {
			self.current_time = time.max(0.0);
			return;
		}

		self.start_seek(time);
	}

	/// Change the playback rate; negative values play in reverse.
	pub fn set_playback_rate(&mut self, rate: f64) {
		if rate == self.playback_rate {
			return;
		}

		let old = self.playback_rate;
		self.clock.reset();
		self.playback_rate = rate;
		self.fired_ended = false;

		let direction = Direction::from_rate(rate);
		if direction != Direction::from_rate(old) {
			// A direction flip voids everything queued in the old direction.
			self.scheduler.reset();
		} else {
			let now = Timestamp::from_secs_f64(self.current_time);
			self.scheduler.reschedule_audio(now, rate, direction);
		}

		tracing::debug!(rate, "rate change");
		self.emit(MediaElementEvent::RateChange);
	}

	pub fn set_volume(&mut self, volume: f64) {
		let volume = volume.clamp(0.0, 1.0);
		if volume == self.volume {
			return;
		}

		self.volume = volume;
		self.apply_volume();
		self.emit(MediaElementEvent::VolumeChange);
	}

	pub fn set_muted(&mut self, muted: bool) {
		if muted == self.muted {
			return;
		}

		self.muted = muted;
		self.apply_volume();
		self.emit(MediaElementEvent::VolumeChange);
	}

	fn apply_volume(&mut self) {
		let gain = if self.muted { 0.0 } else { self.volume };
		self.scheduler.set_volume(gain);
	}

	/// Drive the element: drain signals and decoder output, advance the
	/// clock, keep the decode queues filled, render, and schedule audio.
	///
	/// `now` must be monotonic; animation-frame cadence is expected.
	pub fn tick(&mut self, now: Instant) {
		self.pump_host_signals();

		let direction = Direction::from_rate(self.playback_rate);

		if self.seeking {
			if !self.try_finish_seek(direction) {
				return;
			}
		}

		if self.potentially_playing() {
			let audio_clock = self.scheduler.audio_clock();
			let elapsed = self.clock.elapsed(now, audio_clock);
			if elapsed > 0.0 {
				self.advance(elapsed);
			}
		} else {
			self.clock.reset();
		}

		if let Some(source) = self.source.clone() {
			let at = Timestamp::from_secs_f64(self.current_time);

			if let Err(err) = self.scheduler.refill(&source, at, direction) {
				tracing::warn!(%err, "decode submission failed");
			}
			self.scheduler.drain(at, direction);

			let resized = self.scheduler.render(at, direction);
			if resized && self.ready_state > ReadyState::Nothing {
				self.emit(MediaElementEvent::Resize);
			}

			self.scheduler.schedule_audio(at, self.playback_rate, direction);
		}

		self.maybe_timeupdate(now);
		self.evaluate_ended();
		self.update_ready_state();
		self.update_playing_state();
	}

	// One blocked-on-seek turn: keep decoding at the target and finish the
	// seek once enough is decoded. Returns whether the seek finished.
	fn try_finish_seek(&mut self, direction: Direction) -> bool {
		let Some(source) = self.source.clone() else {
			return false;
		};
		let target = self.seek_target.unwrap_or(Timestamp::from_secs_f64(self.current_time));

		if let Err(err) = self.scheduler.refill(&source, target, direction) {
			tracing::warn!(%err, "decode submission failed");
		}
		self.scheduler.drain(target, direction);
		self.update_ready_state();

		let video_ready = !source.has_track(MediaKind::Video) || self.scheduler.video_covers(target);
		let audio_ready = !source.has_track(MediaKind::Audio) || self.scheduler.audio_covers(target);

		if self.ready_state < ReadyState::FutureData || !video_ready || !audio_ready {
			return false;
		}

		tracing::debug!(time = self.current_time, "seek complete");
		self.seeking = false;
		self.seek_target = None;
		self.clock.reset();
		self.emit(MediaElementEvent::TimeUpdate);
		self.emit(MediaElementEvent::Seeked);
		true
	}

	fn start_seek(&mut self, target: f64) {
		// A new seek supersedes any pending one.
		let target = if self.duration.is_nan() {
			target.max(0.0)
		} else {
			target.clamp(0.0, self.duration)
		};

		tracing::debug!(target, "seeking");
		self.seeking = true;
		self.fired_ended = false;
		self.current_time = target;
		self.seek_target = Some(Timestamp::from_secs_f64(target));
		self.advance_state = AdvanceState::Idle;

		self.scheduler.reset();
		self.clock.reset();
		self.emit(MediaElementEvent::Seeking);
		self.update_ready_state();
	}

	// Not paused, not ended, not blocked on data, not seeking.
	fn potentially_playing(&self) -> bool {
		!self.paused && !self.seeking && !self.ended() && self.ready_state >= ReadyState::FutureData
	}

	fn advance(&mut self, elapsed: f64) {
		let old = self.current_time;
		let mut new = old + self.playback_rate * elapsed.max(0.0);

		// The playhead must not leave the contiguous buffered window.
		let buffered = self.buffered();
		if let Some(index) = buffered.find(old) {
			new = new.clamp(buffered.start(index), buffered.end(index));
		}
		if self.duration.is_finite() {
			new = new.min(self.duration);
		}
		new = new.max(0.0);

		if new == old {
			return;
		}

		self.current_time = new;
		self.advanced_since_timeupdate = true;

		// `played` grows only while actually advancing.
		let (a, b) = if new >= old { (old, new) } else { (new, old) };
		self.played.add(a, b, 0.0);
	}

	fn maybe_timeupdate(&mut self, now: Instant) {
		if !self.advanced_since_timeupdate {
			return;
		}

		let due = match self.last_timeupdate {
			Some(last) => now.saturating_duration_since(last) >= self.config.timeupdate_interval,
			None => true,
		};
		if due {
			self.last_timeupdate = Some(now);
			self.advanced_since_timeupdate = false;
			self.emit(MediaElementEvent::TimeUpdate);
		}
	}

	fn evaluate_ended(&mut self) {
		if !self.ended() || self.fired_ended {
			return;
		}
		self.fired_ended = true;

		match Direction::from_rate(self.playback_rate) {
			Direction::Forward => {
				tracing::debug!("playback ended");
				self.emit(MediaElementEvent::TimeUpdate);
				self.paused = true;
				self.advance_state = AdvanceState::Idle;
				self.emit(MediaElementEvent::Pause);
				self.emit(MediaElementEvent::Ended);
				self.reject_play_waiters();
			}
			// Reaching zero in reverse only reports the position.
			Direction::Backward => self.emit(MediaElementEvent::TimeUpdate),
		}
	}

	fn pump_host_signals(&mut self) {
		let signals: Vec<HostSignal> = match self.host_rx.as_mut() {
			Some(rx) => std::iter::from_fn(|| rx.try_recv().ok()).collect(),
			None => return,
		};

		for signal in signals {
			match signal {
				HostSignal::HaveMetadata => {
					if self.ready_state == ReadyState::Nothing {
						self.ready_state = ReadyState::Metadata;
						self.emit(MediaElementEvent::LoadedMetadata);
					}
				}
				HostSignal::DurationChanged(duration) => {
					self.duration = duration;
					self.emit(MediaElementEvent::DurationChange);
					if self.ready_state > ReadyState::Nothing && self.current_time > duration {
						self.start_seek(duration);
					}
				}
				HostSignal::BufferedChanged => {
					self.emit(MediaElementEvent::Progress);
				}
				HostSignal::AllDataBuffered => {
					// The ended predicate reads the source state directly.
				}
				HostSignal::Removed { start, end } => {
					if start <= self.current_time && self.current_time < end && self.ready_state > ReadyState::Metadata
					{
						// Data under the playhead is gone: stall until the
						// queues recover.
						self.ready_state = ReadyState::Metadata;
					}
				}
			}
		}
	}

	fn compute_ready_state(&self) -> ReadyState {
		// Only metadata arrival raises the state off the floor.
		if self.ready_state == ReadyState::Nothing {
			return ReadyState::Nothing;
		}
		let Some(source) = &self.source else {
			return self.ready_state.min(ReadyState::Metadata);
		};

		let at = Timestamp::from_secs_f64(self.current_time);
		let video_covered = !source.has_track(MediaKind::Video) || self.scheduler.video_covers(at);
		let audio_covered = !source.has_track(MediaKind::Audio) || self.scheduler.audio_covers(at);
		if !video_covered || !audio_covered {
			return ReadyState::Metadata;
		}

		let buffered = source.buffered();
		let Some(index) = buffered.find(self.current_time) else {
			return ReadyState::CurrentData;
		};
		let end = buffered.end(index);

		let at_stream_end = self.is_end_of_stream() && self.duration.is_finite() && end >= self.duration;
		if end - self.current_time >= self.config.lookahead || at_stream_end {
			ReadyState::FutureData
		} else {
			ReadyState::CurrentData
		}
	}

	fn update_ready_state(&mut self) {
		let new = self.compute_ready_state();
		let old = self.ready_state;
		if new == old {
			return;
		}

		tracing::debug!(?old, ?new, "ready state");
		self.ready_state = new;

		if old < ReadyState::CurrentData && new >= ReadyState::CurrentData && !self.loaded_data_fired {
			self.loaded_data_fired = true;
			self.emit(MediaElementEvent::LoadedData);
		}
		if old < ReadyState::FutureData && new >= ReadyState::FutureData {
			self.emit(MediaElementEvent::CanPlay);
		}
	}

	// Edge-trigger `playing`/`waiting` and settle play promises.
	fn update_playing_state(&mut self) {
		if self.paused || self.seeking {
			return;
		}

		if self.ready_state >= ReadyState::FutureData {
			if self.advance_state != AdvanceState::Playing {
				self.advance_state = AdvanceState::Playing;
				self.emit(MediaElementEvent::Playing);
			}
			for waiter in self.play_waiters.drain(..) {
				let _ = waiter.send(Ok(()));
			}
		} else if self.advance_state != AdvanceState::Waiting {
			self.advance_state = AdvanceState::Waiting;
			self.emit(MediaElementEvent::Waiting);
		}
	}

	fn reject_play_waiters(&mut self) {
		for waiter in self.play_waiters.drain(..) {
			let _ = waiter.send(Err(Error::Aborted));
		}
	}

	fn emit(&mut self, event: MediaElementEvent) {
		self.events.emit(event);
	}
}
