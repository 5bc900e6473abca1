use bytes::Bytes;
use derive_more::Debug;

use crate::{Timestamp, VideoConfig};

/// A coded media frame queued in a track buffer.
///
/// Frames are immutable once emitted by the demuxer. Each frame carries:
/// - The presentation timestamp and a strictly positive duration.
/// - A keyframe flag indicating whether this frame can be decoded independently.
/// - A codec-specific payload.
/// The debug implementation shows only the payload length for brevity.
#[derive(Clone, Debug, PartialEq)]
pub struct CodedFrame {
	/// The presentation timestamp for this frame.
	pub timestamp: Timestamp,

	/// How long the frame is presented; always positive.
	pub duration: Timestamp,

	/// Whether this frame is a random access point.
	pub keyframe: bool,

	/// The encoded media data for this frame.
	#[debug("{} bytes", payload.len())]
	pub payload: Bytes,
}

impl CodedFrame {
	/// The end of the frame's presentation interval.
	pub fn end(&self) -> Timestamp {
		self.timestamp + self.duration
	}

	/// Whether `time` falls inside `[timestamp, timestamp + duration)`.
	pub fn contains(&self, time: Timestamp) -> bool {
		self.timestamp <= time && time < self.end()
	}
}

/// A key frame and the delta frames that depend on it.
///
/// Frames are kept in presentation order. Decode dependencies never cross a
/// group boundary: a frame depends only on its group's sync frame and the
/// frames before it in the same group.
#[derive(Clone, Debug)]
pub struct GroupOfPictures {
	/// Frames sorted by presentation timestamp.
	pub frames: Vec<CodedFrame>,

	/// The decoder configuration in effect when the group was started.
	pub config: VideoConfig,
}

impl GroupOfPictures {
	/// Start a group from its first frame.
	pub fn new(frame: CodedFrame, config: VideoConfig) -> Self {
		Self {
			frames: vec![frame],
			config,
		}
	}

	/// The presentation timestamp of the first frame.
	pub fn start(&self) -> Timestamp {
		self.frames.first().map(|f| f.timestamp).unwrap_or_default()
	}

	/// The highest presentation end across the group's frames.
	pub fn end(&self) -> Timestamp {
		self.frames.iter().map(|f| f.end()).max().unwrap_or_default()
	}

	/// Whether `time` falls inside `[start, end)`.
	pub fn contains(&self, time: Timestamp) -> bool {
		self.start() <= time && time < self.end()
	}
}
