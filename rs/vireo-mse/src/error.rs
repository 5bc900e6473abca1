use std::sync::Arc;

use crate::TimeOverflow;

/// Error types for the vireo buffering core.
///
/// Variants are grouped by kind: state errors surface synchronously at the
/// call site, while parse/init/decode errors route through the source
/// buffer's append-error path.
#[derive(Debug, thiserror::Error, Clone)]
#[non_exhaustive]
pub enum Error {
	/// The object is in the wrong state for the requested operation.
	#[error("invalid state: {0}")]
	InvalidState(&'static str),

	/// The mime string is empty or not an `audio/mp4` / `video/mp4` type.
	#[error("unsupported type: {0}")]
	UnsupportedType(String),

	/// No further source buffers are accepted for this media type.
	#[error("quota exceeded")]
	QuotaExceeded,

	/// A duration or removal range argument is out of domain.
	#[error("invalid range: {0}")]
	InvalidRange(&'static str),

	/// The box parser rejected the byte stream.
	#[error("parse error: {0}")]
	Parse(Arc<mp4_atom::Error>),

	/// The byte stream violates the fragmented MP4 segment format.
	#[error("byte stream violation: {0}")]
	ByteStream(&'static str),

	/// A fragment references data outside its mdat payload.
	#[error("invalid data offset")]
	InvalidDataOffset,

	/// An initialization segment carried no audio and no video tracks.
	#[error("no supported tracks")]
	NoTracks,

	/// The codec entry is invalid or malformed.
	#[error("invalid codec")]
	InvalidCodec,

	/// The codec is not supported by the decoders.
	#[error("unsupported codec: {0}")]
	UnsupportedCodec(String),

	/// A later initialization segment does not match the first one.
	#[error("track structure mismatch")]
	TrackMismatch,

	/// The decoder reported an asynchronous failure.
	#[error("decode error: {0}")]
	Decode(String),

	/// The operation was superseded, or the media was detached.
	#[error("aborted")]
	Aborted,

	/// A timestamp does not fit the microsecond clock.
	#[error("timestamp overflow")]
	TimestampOverflow(#[from] TimeOverflow),

	/// Failed to parse an integer value.
	#[error("expected int")]
	ExpectedInt(#[from] std::num::ParseIntError),
}

/// A Result type alias for vireo operations.
pub type Result<T> = std::result::Result<T, Error>;

// Wrap in an Arc so it is Clone
impl From<mp4_atom::Error> for Error {
	fn from(err: mp4_atom::Error) -> Self {
		Error::Parse(Arc::new(err))
	}
}
