use crate::{AudioConfig, CodedFrame, GroupOfPictures, MediaKind, TimeRanges, Timestamp, TrackConfig, VideoConfig};

/// Playback direction, taken from the sign of the playback rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
	Forward,
	Backward,
}

impl Direction {
	pub fn from_rate(rate: f64) -> Self {
		if rate < 0.0 { Self::Backward } else { Self::Forward }
	}
}

/// Buffered ranges separated by less than a frame at 60fps merge into one.
pub const RANGE_TOLERANCE: f64 = 1.0 / 60.0;

// Neighbouring groups within one microsecond count as temporally adjacent.
const ADJACENCY: Timestamp = Timestamp::from_micros(1);

enum Frames {
	Audio {
		// Sorted by presentation timestamp.
		frames: Vec<CodedFrame>,
		config: AudioConfig,
	},
	Video {
		// Sorted by group start; disjoint in decode dependency.
		gops: Vec<GroupOfPictures>,
		// The group currently receiving delta frames.
		open: Option<usize>,
		config: VideoConfig,
	},
}

/// The per-track ordered store of coded frames.
///
/// Audio tracks keep a flat sorted list; video tracks group frames by their
/// sync frame so removal and reverse playback can reason about decode
/// dependencies. The buffer also carries the coded-frame-processing
/// bookkeeping (continuity state, buffered ranges) its source buffer needs.
pub struct TrackBuffer {
	track_id: u32,
	frames: Frames,

	last_decode_dts: Option<Timestamp>,
	last_frame_duration: Option<Timestamp>,
	highest_end: Timestamp,
	need_random_access_point: bool,
	ranges: TimeRanges,
}

impl TrackBuffer {
	pub fn new_audio(track_id: u32, config: AudioConfig) -> Self {
		Self::new(
			track_id,
			Frames::Audio {
				frames: Vec::new(),
				config,
			},
		)
	}

	pub fn new_video(track_id: u32, config: VideoConfig) -> Self {
		Self::new(
			track_id,
			Frames::Video {
				gops: Vec::new(),
				open: None,
				config,
			},
		)
	}

	fn new(track_id: u32, frames: Frames) -> Self {
		Self {
			track_id,
			frames,
			last_decode_dts: None,
			last_frame_duration: None,
			highest_end: Timestamp::ZERO,
			need_random_access_point: true,
			ranges: TimeRanges::new(),
		}
	}

	pub fn track_id(&self) -> u32 {
		self.track_id
	}

	pub fn kind(&self) -> MediaKind {
		match &self.frames {
			Frames::Audio { .. } => MediaKind::Audio,
			Frames::Video { .. } => MediaKind::Video,
		}
	}

	pub fn config(&self) -> TrackConfig {
		match &self.frames {
			Frames::Audio { config, .. } => config.clone().into(),
			Frames::Video { config, .. } => config.clone().into(),
		}
	}

	pub fn last_decode_dts(&self) -> Option<Timestamp> {
		self.last_decode_dts
	}

	pub fn last_frame_duration(&self) -> Option<Timestamp> {
		self.last_frame_duration
	}

	pub fn needs_random_access_point(&self) -> bool {
		self.need_random_access_point
	}

	/// Clear the random-access gate; the next sync frame arrived.
	pub fn random_access_point_found(&mut self) {
		self.need_random_access_point = false;
	}

	/// The buffered ranges in seconds, merged with [RANGE_TOLERANCE].
	pub fn ranges(&self) -> &TimeRanges {
		&self.ranges
	}

	pub fn is_empty(&self) -> bool {
		match &self.frames {
			Frames::Audio { frames, .. } => frames.is_empty(),
			Frames::Video { gops, .. } => gops.is_empty(),
		}
	}

	/// Insert a coded frame; `dts` is its decode timestamp.
	///
	/// Frames may arrive with a presentation timestamp below the highest one
	/// seen (reorder/overwrite appends). Inserting a frame whose timestamp is
	/// already present is a silent no-op.
	pub fn append(&mut self, frame: CodedFrame, dts: Timestamp) {
		if self.frame_at_exact(frame.timestamp).is_some() {
			tracing::trace!(?frame, "dropping duplicate frame");
			return;
		}

		let start = frame.timestamp;
		let end = frame.end();

		match &mut self.frames {
			Frames::Audio { frames, .. } => {
				let index = frames.partition_point(|f| f.timestamp < start);
				frames.insert(index, frame);
			}
			Frames::Video { gops, open, config } => {
				match open {
					Some(index) if !frame.keyframe => {
						// Extend the open group, keeping presentation order.
						let gop = &mut gops[*index];
						let at = gop.frames.partition_point(|f| f.timestamp < start);
						gop.frames.insert(at, frame);
					}
					_ => {
						// A sync frame, or no group to attach to: start a new
						// group at its sorted position.
						let gop = GroupOfPictures::new(frame, config.clone());
						let index = gops.partition_point(|g| g.start() < start);
						gops.insert(index, gop);
						*open = Some(index);
					}
				}
			}
		}

		self.last_decode_dts = Some(dts);
		self.last_frame_duration = Some(end - start);
		self.highest_end = self.highest_end.max(end);
		self.ranges.add(start.as_secs_f64(), end.as_secs_f64(), RANGE_TOLERANCE);
	}

	/// Require the next appended frame to be a random access point.
	///
	/// Clears the decode-continuity bookkeeping and closes the open group, so
	/// the next sync frame starts fresh.
	pub fn require_random_access_point(&mut self) {
		self.last_decode_dts = None;
		self.last_frame_duration = None;
		self.highest_end = Timestamp::ZERO;
		self.need_random_access_point = true;

		if let Frames::Video { open, .. } = &mut self.frames {
			*open = None;
		}
	}

	/// Adopt a new decoder configuration from a later initialization segment.
	///
	/// For video the open group is closed, so subsequent deltas attach to a
	/// group that records the new configuration.
	pub fn reconfigure(&mut self, config: TrackConfig) {
		match (&mut self.frames, config) {
			(Frames::Audio { config, .. }, TrackConfig::Audio(new)) => *config = new,
			(Frames::Video { config, open, .. }, TrackConfig::Video(new)) => {
				*config = new;
				*open = None;
			}
			_ => debug_assert!(false, "reconfigure with mismatched track kind"),
		}
	}

	/// The frame whose presentation interval contains `time`.
	pub fn find_frame(&self, time: Timestamp) -> Option<&CodedFrame> {
		match &self.frames {
			Frames::Audio { frames, .. } => frames.iter().find(|f| f.contains(time)),
			Frames::Video { gops, .. } => {
				let gop = gops.iter().find(|g| g.contains(time))?;
				gop.frames.iter().find(|f| f.contains(time))
			}
		}
	}

	/// Whether a frame with exactly this presentation timestamp is stored.
	pub fn contains_frame_at(&self, time: Timestamp) -> bool {
		self.frame_at_exact(time).is_some()
	}

	fn frame_at_exact(&self, time: Timestamp) -> Option<(usize, usize)> {
		match &self.frames {
			Frames::Audio { frames, .. } => frames
				.binary_search_by(|f| f.timestamp.cmp(&time))
				.ok()
				.map(|index| (0, index)),
			Frames::Video { gops, .. } => gops.iter().enumerate().find_map(|(g, gop)| {
				let index = gop.frames.binary_search_by(|f| f.timestamp.cmp(&time)).ok()?;
				Some((g, index))
			}),
		}
	}

	/// The frames the decoder needs before it can emit the frame at `time`,
	/// in decode order, with their configuration.
	///
	/// Audio frames decode independently; video frames need their group's
	/// prefix up to and including the requested frame.
	pub fn decode_dependencies(&self, time: Timestamp) -> Option<(Vec<CodedFrame>, TrackConfig)> {
		match &self.frames {
			Frames::Audio { frames, config } => {
				let frame = frames.iter().find(|f| f.contains(time))?;
				Some((vec![frame.clone()], config.clone().into()))
			}
			Frames::Video { gops, .. } => {
				let gop = gops.iter().find(|g| g.contains(time))?;
				let index = gop.frames.iter().position(|f| f.contains(time))?;
				Some((gop.frames[..=index].to_vec(), gop.config.clone().into()))
			}
		}
	}

	/// Up to `max` frames following the frame at `anchor` in rendering order.
	///
	/// Continuation crosses a group boundary only when the neighbouring group
	/// is temporally adjacent (within one microsecond) and carries the same
	/// configuration. `None` means there is no guaranteed continuation: the
	/// anchor is gone, the buffer ends, or a gap follows.
	pub fn next_frames(&self, anchor: Timestamp, max: usize, direction: Direction) -> Option<(Vec<CodedFrame>, TrackConfig)> {
		if max == 0 {
			return None;
		}

		match &self.frames {
			Frames::Audio { frames, config } => {
				let index = frames.binary_search_by(|f| f.timestamp.cmp(&anchor)).ok()?;
				let out = Self::audio_next(frames, index, max, direction);
				if out.is_empty() {
					return None;
				}
				Some((out, config.clone().into()))
			}
			Frames::Video { .. } => {
				let (gop, index) = self.frame_at_exact(anchor)?;
				let Frames::Video { gops, .. } = &self.frames else {
					unreachable!()
				};
				let (out, config) = Self::video_next(gops, gop, index, max, direction)?;
				Some((out, config.into()))
			}
		}
	}

	fn audio_next(frames: &[CodedFrame], index: usize, max: usize, direction: Direction) -> Vec<CodedFrame> {
		let mut out = Vec::new();

		match direction {
			Direction::Forward => {
				let mut prev_end = frames[index].end();
				for frame in &frames[index + 1..] {
					if out.len() == max || frame.timestamp.abs_diff(prev_end) > ADJACENCY {
						break;
					}
					prev_end = frame.end();
					out.push(frame.clone());
				}
			}
			Direction::Backward => {
				let mut prev_start = frames[index].timestamp;
				for frame in frames[..index].iter().rev() {
					if out.len() == max || prev_start.abs_diff(frame.end()) > ADJACENCY {
						break;
					}
					prev_start = frame.timestamp;
					out.push(frame.clone());
				}
			}
		}

		out
	}

	fn video_next(
		gops: &[GroupOfPictures],
		gop: usize,
		index: usize,
		max: usize,
		direction: Direction,
	) -> Option<(Vec<CodedFrame>, VideoConfig)> {
		let mut out = Vec::new();
		let mut config: Option<VideoConfig> = None;

		match direction {
			Direction::Forward => {
				let mut g = gop;
				let mut f = index + 1;
				while out.len() < max {
					let current = &gops[g];
					if f < current.frames.len() {
						match &config {
							None => config = Some(current.config.clone()),
							Some(c) if *c != current.config => break,
							_ => {}
						}
						out.push(current.frames[f].clone());
						f += 1;
						continue;
					}

					let Some(next) = gops.get(g + 1) else { break };
					if next.start().abs_diff(current.end()) > ADJACENCY {
						break;
					}
					g += 1;
					f = 0;
				}
			}
			Direction::Backward => {
				let mut g = gop;
				let mut f = index;
				while out.len() < max {
					let current = &gops[g];
					if f > 0 {
						match &config {
							None => config = Some(current.config.clone()),
							Some(c) if *c != current.config => break,
							_ => {}
						}
						out.push(current.frames[f - 1].clone());
						f -= 1;
						continue;
					}

					if g == 0 {
						break;
					}
					let prev = &gops[g - 1];
					if current.start().abs_diff(prev.end()) > ADJACENCY {
						break;
					}
					g -= 1;
					f = gops[g].frames.len();
				}
			}
		}

		let config = config?;
		if out.is_empty() { None } else { Some((out, config)) }
	}

	/// The earliest random access point at or after `time`.
	pub fn random_access_point_at_or_after(&self, time: Timestamp) -> Option<Timestamp> {
		match &self.frames {
			Frames::Audio { frames, .. } => frames.iter().find(|f| f.timestamp >= time).map(|f| f.timestamp),
			Frames::Video { gops, .. } => gops.iter().map(|g| g.start()).find(|start| *start >= time),
		}
	}

	/// Remove frames whose presentation timestamp falls in `[start, end)`.
	///
	/// Video groups are truncated at the first removed frame: later frames in
	/// the same group depend on the removed deltas, so they are dropped even
	/// when their timestamps fall outside the interval. Buffered ranges are
	/// rebuilt from the survivors.
	pub fn remove(&mut self, start: Timestamp, end: Timestamp) {
		tracing::debug!(track = self.track_id, %start, %end, "removing samples");

		match &mut self.frames {
			Frames::Audio { frames, .. } => {
				frames.retain(|f| !(start <= f.timestamp && f.timestamp < end));
			}
			Frames::Video { gops, open, .. } => {
				for gop in gops.iter_mut() {
					if let Some(index) = gop.frames.iter().position(|f| start <= f.timestamp && f.timestamp < end) {
						gop.frames.truncate(index);
					}
				}
				gops.retain(|g| !g.frames.is_empty());
				*open = None;
			}
		}

		self.ranges = TimeRanges::new();
		for (frame_start, frame_end) in self.frame_spans() {
			self.ranges.add(frame_start, frame_end, RANGE_TOLERANCE);
		}
	}

	fn frame_spans(&self) -> Vec<(f64, f64)> {
		let spans: Box<dyn Iterator<Item = &CodedFrame>> = match &self.frames {
			Frames::Audio { frames, .. } => Box::new(frames.iter()),
			Frames::Video { gops, .. } => Box::new(gops.iter().flat_map(|g| g.frames.iter())),
		};

		spans.map(|f| (f.timestamp.as_secs_f64(), f.end().as_secs_f64())).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{Aac, H264};
	use bytes::Bytes;

	fn video_config() -> VideoConfig {
		VideoConfig {
			codec: H264 {
				profile: 0x64,
				constraints: 0,
				level: 0x28,
			}
			.into(),
			description: None,
			coded_width: Some(1280),
			coded_height: Some(720),
		}
	}

	fn audio_config() -> AudioConfig {
		AudioConfig {
			codec: Aac { profile: 2 }.into(),
			sample_rate: 48_000,
			channel_count: 2,
			description: None,
		}
	}

	fn frame(ms: u64, duration_ms: u64, keyframe: bool) -> CodedFrame {
		CodedFrame {
			timestamp: Timestamp::from_micros(ms * 1_000),
			duration: Timestamp::from_micros(duration_ms * 1_000),
			keyframe,
			payload: Bytes::from_static(b"x"),
		}
	}

	fn at(ms: u64) -> Timestamp {
		Timestamp::from_micros(ms * 1_000)
	}

	// A single 0..800ms group: key at 0, deltas at 200/400/600.
	fn one_gop() -> TrackBuffer {
		let mut track = TrackBuffer::new_video(1, video_config());
		for ms in [0, 200, 400, 600] {
			track.append(frame(ms, 200, ms == 0), at(ms));
		}
		track
	}

	// Two adjacent groups: 0..400 and 400..800.
	fn two_gops() -> TrackBuffer {
		let mut track = TrackBuffer::new_video(1, video_config());
		for ms in [0, 200, 400, 600] {
			track.append(frame(ms, 200, ms % 400 == 0), at(ms));
		}
		track
	}

	#[test]
	fn append_updates_ranges_and_bookkeeping() {
		let mut track = TrackBuffer::new_audio(1, audio_config());
		track.append(frame(0, 20, true), at(0));
		track.append(frame(20, 20, true), at(20));

		assert_eq!(track.ranges().len(), 1);
		assert_eq!(track.ranges().start(0), 0.0);
		assert_eq!(track.ranges().end(0), 0.04);
		assert_eq!(track.last_decode_dts(), Some(at(20)));
		assert_eq!(track.last_frame_duration(), Some(at(20)));
	}

	#[test]
	fn duplicate_append_is_a_no_op() {
		let mut track = TrackBuffer::new_audio(1, audio_config());
		track.append(frame(0, 20, true), at(0));
		track.append(frame(20, 20, true), at(20));
		track.append(frame(0, 20, true), at(0));

		// Bookkeeping still reflects the last real append.
		assert_eq!(track.last_decode_dts(), Some(at(20)));
		assert_eq!(track.ranges().len(), 1);
	}

	#[test]
	fn keyframes_start_new_groups() {
		let track = two_gops();
		let Frames::Video { gops, .. } = &track.frames else {
			unreachable!()
		};

		assert_eq!(gops.len(), 2);
		assert_eq!(gops[0].start(), at(0));
		assert_eq!(gops[0].end(), at(400));
		assert_eq!(gops[1].start(), at(400));
		assert_eq!(gops[1].end(), at(800));
	}

	#[test]
	fn delta_without_group_starts_one() {
		let mut track = TrackBuffer::new_video(1, video_config());
		track.append(frame(100, 200, false), at(100));

		let Frames::Video { gops, .. } = &track.frames else {
			unreachable!()
		};
		assert_eq!(gops.len(), 1);
	}

	#[test]
	fn groups_insert_in_sorted_order() {
		let mut track = TrackBuffer::new_video(1, video_config());
		track.append(frame(1_000, 200, true), at(1_000));
		track.append(frame(0, 200, true), at(0));
		track.append(frame(200, 200, false), at(200));

		let Frames::Video { gops, .. } = &track.frames else {
			unreachable!()
		};
		assert_eq!(gops.len(), 2);
		assert_eq!(gops[0].start(), at(0));
		// The delta followed its keyframe into the earlier group.
		assert_eq!(gops[0].frames.len(), 2);
		assert_eq!(gops[1].start(), at(1_000));
	}

	#[test]
	fn require_rap_closes_the_open_group() {
		let mut track = one_gop();
		track.require_random_access_point();
		assert!(track.needs_random_access_point());
		assert_eq!(track.last_decode_dts(), None);

		// The next delta cannot attach to the old group.
		track.append(frame(800, 200, false), at(800));
		let Frames::Video { gops, .. } = &track.frames else {
			unreachable!()
		};
		assert_eq!(gops.len(), 2);
	}

	#[test]
	fn find_frame_by_containment() {
		let track = one_gop();
		assert_eq!(track.find_frame(at(250)).unwrap().timestamp, at(200));
		assert_eq!(track.find_frame(at(0)).unwrap().timestamp, at(0));
		assert_eq!(track.find_frame(at(799)).unwrap().timestamp, at(600));
		assert!(track.find_frame(at(800)).is_none());
	}

	#[test]
	fn decode_dependencies_prefix_the_group() {
		let track = two_gops();
		let (frames, _) = track.decode_dependencies(at(250)).unwrap();
		assert_eq!(frames.len(), 2);
		assert!(frames[0].keyframe);
		assert_eq!(frames[1].timestamp, at(200));

		// The second group does not depend on the first.
		let (frames, _) = track.decode_dependencies(at(650)).unwrap();
		assert_eq!(frames.len(), 2);
		assert_eq!(frames[0].timestamp, at(400));
	}

	#[test]
	fn audio_dependencies_are_the_frame_itself() {
		let mut track = TrackBuffer::new_audio(1, audio_config());
		track.append(frame(0, 20, true), at(0));
		track.append(frame(20, 20, true), at(20));

		let (frames, _) = track.decode_dependencies(at(30)).unwrap();
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].timestamp, at(20));
	}

	#[test]
	fn next_frames_walks_forward_across_adjacent_groups() {
		let track = two_gops();

		let (frames, _) = track.next_frames(at(200), 10, Direction::Forward).unwrap();
		assert_eq!(
			frames.iter().map(|f| f.timestamp).collect::<Vec<_>>(),
			vec![at(400), at(600)]
		);

		// Capped by max.
		let (frames, _) = track.next_frames(at(0), 2, Direction::Forward).unwrap();
		assert_eq!(frames.len(), 2);

		// Nothing after the last frame.
		assert!(track.next_frames(at(600), 10, Direction::Forward).is_none());
	}

	#[test]
	fn next_frames_walks_backward() {
		let track = two_gops();

		let (frames, _) = track.next_frames(at(600), 10, Direction::Backward).unwrap();
		assert_eq!(
			frames.iter().map(|f| f.timestamp).collect::<Vec<_>>(),
			vec![at(400), at(200), at(0)]
		);

		assert!(track.next_frames(at(0), 10, Direction::Backward).is_none());
	}

	#[test]
	fn next_frames_stops_at_gaps() {
		let mut track = TrackBuffer::new_video(1, video_config());
		track.append(frame(0, 200, true), at(0));
		track.append(frame(200, 200, false), at(200));
		// A second group after a 600ms hole.
		track.append(frame(1_000, 200, true), at(1_000));

		assert!(track.next_frames(at(200), 10, Direction::Forward).is_none());
		assert!(track.next_frames(at(1_000), 10, Direction::Backward).is_none());

		let (frames, _) = track.next_frames(at(0), 10, Direction::Forward).unwrap();
		assert_eq!(frames.len(), 1);
	}

	#[test]
	fn next_frames_requires_a_live_anchor() {
		let track = one_gop();
		assert!(track.next_frames(at(123), 10, Direction::Forward).is_none());
	}

	#[test]
	fn random_access_points() {
		let track = two_gops();
		assert_eq!(track.random_access_point_at_or_after(at(0)), Some(at(0)));
		assert_eq!(track.random_access_point_at_or_after(at(1)), Some(at(400)));
		assert_eq!(track.random_access_point_at_or_after(at(401)), None);
	}

	#[test]
	fn remove_truncates_dependent_tails() {
		// Key at 0 with deltas at 200/400/600; removing [300, 500) hits the
		// frame at 400, and 600 depends on it.
		let mut track = one_gop();
		track.remove(at(300), at(500));

		let Frames::Video { gops, .. } = &track.frames else {
			unreachable!()
		};
		assert_eq!(gops.len(), 1);
		assert_eq!(gops[0].frames.len(), 2);
		assert_eq!(gops[0].end(), at(400));

		assert_eq!(track.ranges().len(), 1);
		assert_eq!(track.ranges().end(0), 0.4);
	}

	#[test]
	fn remove_drops_whole_groups() {
		let mut track = two_gops();
		track.remove(at(400), at(800));

		let Frames::Video { gops, .. } = &track.frames else {
			unreachable!()
		};
		assert_eq!(gops.len(), 1);
		assert_eq!(gops[0].start(), at(0));
	}

	#[test]
	fn remove_is_idempotent() {
		let mut track = one_gop();
		track.remove(at(300), at(500));
		let ranges = track.ranges().clone();

		track.remove(at(300), at(500));
		assert_eq!(track.ranges(), &ranges);
	}

	#[test]
	fn remove_everything_empties_the_track() {
		let mut track = TrackBuffer::new_audio(1, audio_config());
		track.append(frame(0, 20, true), at(0));
		track.remove(at(0), at(100));

		assert!(track.is_empty());
		assert!(track.ranges().is_empty());
	}
}
