use bytes::Bytes;
use derive_more::Debug;
use tokio::sync::mpsc;
use vireo_mse::{AudioConfig, Result, Timestamp, VideoConfig};

/// Decoder lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderState {
	Unconfigured,
	Configured,
	Closed,
}

/// A coded chunk submitted to a decoder.
#[derive(Clone, Debug)]
pub struct EncodedChunk {
	pub timestamp: Timestamp,
	pub duration: Timestamp,
	pub keyframe: bool,
	#[debug("{} bytes", payload.len())]
	pub payload: Bytes,
}

/// A decoded picture delivered by the video decoder.
///
/// The pixel data is opaque to the engine; it flows through to the
/// presenter. Backing buffers are released when the frame is dropped.
#[derive(Clone, Debug)]
pub struct VideoFrame {
	pub timestamp: Timestamp,
	pub duration: Timestamp,
	pub display_width: u32,
	pub display_height: u32,
	#[debug("{} bytes", data.len())]
	pub data: Bytes,
}

impl VideoFrame {
	pub fn end(&self) -> Timestamp {
		self.timestamp + self.duration
	}

	pub fn contains(&self, time: Timestamp) -> bool {
		self.timestamp <= time && time < self.end()
	}
}

/// Decoded PCM delivered by the audio decoder, planar f32.
#[derive(Clone, Debug)]
pub struct AudioData {
	pub timestamp: Timestamp,
	pub duration: Timestamp,
	pub sample_rate: u32,
	/// One plane per channel, all the same length.
	#[debug("{}x{} samples", planes.len(), planes.first().map(|p| p.len()).unwrap_or(0))]
	pub planes: Vec<Vec<f32>>,
}

impl AudioData {
	pub fn channel_count(&self) -> usize {
		self.planes.len()
	}

	pub fn frame_count(&self) -> usize {
		self.planes.first().map(|p| p.len()).unwrap_or(0)
	}

	pub fn end(&self) -> Timestamp {
		self.timestamp + self.duration
	}

	pub fn contains(&self, time: Timestamp) -> bool {
		self.timestamp <= time && time < self.end()
	}
}

/// A PCM buffer handed to the mixer, planar f32.
#[derive(Clone, Debug)]
pub struct PcmBuffer {
	pub sample_rate: u32,
	#[debug("{}x{} samples", planes.len(), planes.first().map(|p| p.len()).unwrap_or(0))]
	pub planes: Vec<Vec<f32>>,
}

/// A scheduled mixer node, so it can be stopped or rescheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

/// A stateful video decoder.
///
/// `configure` hands over the output channel; decoded frames arrive there
/// asynchronously and are drained by the scheduler. Submissions within one
/// group must be in decode order (key frame first).
pub trait VideoDecoder {
	fn configure(&mut self, config: &VideoConfig, output: mpsc::UnboundedSender<VideoFrame>) -> Result<()>;
	fn decode(&mut self, chunk: EncodedChunk) -> Result<()>;
	fn reset(&mut self);
	fn state(&self) -> DecoderState;
}

/// A stateful audio decoder, symmetric to [VideoDecoder].
pub trait AudioDecoder {
	fn configure(&mut self, config: &AudioConfig, output: mpsc::UnboundedSender<AudioData>) -> Result<()>;
	fn decode(&mut self, chunk: EncodedChunk) -> Result<()>;
	fn reset(&mut self);
	fn state(&self) -> DecoderState;
}

/// The audio output device: a buffer-playback mixer with a monotonic clock.
pub trait AudioMixer {
	/// The mixer clock in seconds; `None` while the device is suspended.
	fn now(&self) -> Option<f64>;

	/// Schedule `buffer` to start at mixer time `when`, played at `rate`
	/// (positive; reverse playback reverses the samples instead).
	fn schedule(&mut self, buffer: PcmBuffer, when: f64, rate: f64) -> NodeId;

	/// Stop and discard a scheduled node. Unknown ids are ignored.
	fn stop(&mut self, node: NodeId);

	/// Output gain in `[0, 1]`.
	fn set_volume(&mut self, volume: f64);
}

/// The 2-D surface decoded pictures are drawn to.
pub trait VideoPresenter {
	/// Resize the surface to the frame's display dimensions.
	fn resize(&mut self, width: u32, height: u32);

	/// Draw a decoded frame at the surface's full size.
	fn draw(&mut self, frame: &VideoFrame);
}
