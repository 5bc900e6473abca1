use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::Error;

/// The media type of a track or source buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
	Audio,
	Video,
}

/// H.264 codec parameters, string form `avc1.PPCCLL`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct H264 {
	pub profile: u8,
	pub constraints: u8,
	pub level: u8,
}

impl fmt::Display for H264 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "avc1.{:02x}{:02x}{:02x}", self.profile, self.constraints, self.level)
	}
}

impl FromStr for H264 {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let rest = s.strip_prefix("avc1.").ok_or(Error::InvalidCodec)?;
		if rest.len() != 6 {
			return Err(Error::InvalidCodec);
		}

		Ok(Self {
			profile: u8::from_str_radix(&rest[0..2], 16)?,
			constraints: u8::from_str_radix(&rest[2..4], 16)?,
			level: u8::from_str_radix(&rest[4..6], 16)?,
		})
	}
}

/// AAC codec parameters, string form `mp4a.40.P`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Aac {
	/// The AAC audio object type, ex. 2 for AAC-LC.
	pub profile: u8,
}

impl fmt::Display for Aac {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "mp4a.40.{}", self.profile)
	}
}

impl FromStr for Aac {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let rest = s.strip_prefix("mp4a.40.").ok_or(Error::InvalidCodec)?;
		Ok(Self { profile: rest.parse()? })
	}
}

/// The video codec carried by a track.
#[derive(Clone, Debug, PartialEq, Eq, derive_more::From, derive_more::Display)]
pub enum VideoCodec {
	#[display("{_0}")]
	H264(H264),
	/// A codec string we can parse but not decode.
	#[display("{_0}")]
	Unsupported(String),
}

impl VideoCodec {
	pub fn is_supported(&self) -> bool {
		!matches!(self, Self::Unsupported(_))
	}
}

impl FromStr for VideoCodec {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.starts_with("avc1.") {
			Ok(Self::H264(s.parse()?))
		} else if s.is_empty() {
			Err(Error::InvalidCodec)
		} else {
			Ok(Self::Unsupported(s.to_string()))
		}
	}
}

/// The audio codec carried by a track.
#[derive(Clone, Debug, PartialEq, Eq, derive_more::From, derive_more::Display)]
pub enum AudioCodec {
	#[display("{_0}")]
	Aac(Aac),
	/// A codec string we can parse but not decode.
	#[display("{_0}")]
	Unsupported(String),
}

impl AudioCodec {
	pub fn is_supported(&self) -> bool {
		!matches!(self, Self::Unsupported(_))
	}
}

impl FromStr for AudioCodec {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.starts_with("mp4a.") {
			Ok(Self::Aac(s.parse()?))
		} else if s.is_empty() {
			Err(Error::InvalidCodec)
		} else {
			Ok(Self::Unsupported(s.to_string()))
		}
	}
}

/// Video decoder configuration based on WebCodecs VideoDecoderConfig.
///
/// Reference: <https://w3c.github.io/webcodecs/#video-decoder-config>
#[derive(Clone, Debug, PartialEq)]
pub struct VideoConfig {
	pub codec: VideoCodec,

	/// Information used to initialize the decoder on a per-codec basis.
	///
	/// For H.264 this is the body of the avcC box of the first avc1 sample
	/// entry (sps/pps and friends).
	pub description: Option<Bytes>,

	/// The encoded width/height of the media.
	pub coded_width: Option<u32>,
	pub coded_height: Option<u32>,
}

/// Audio decoder configuration based on WebCodecs AudioDecoderConfig.
///
/// Reference: <https://www.w3.org/TR/webcodecs/#audio-decoder-config>
#[derive(Clone, Debug, PartialEq)]
pub struct AudioConfig {
	pub codec: AudioCodec,

	/// The sample rate of the audio in Hz.
	pub sample_rate: u32,

	/// The number of channels in the audio.
	pub channel_count: u32,

	/// Codec-specific description, when the container provides one.
	pub description: Option<Bytes>,
}

/// The decoder configuration of one track, either flavor.
#[derive(Clone, Debug, PartialEq, derive_more::From)]
pub enum TrackConfig {
	Audio(AudioConfig),
	Video(VideoConfig),
}

impl TrackConfig {
	pub fn kind(&self) -> MediaKind {
		match self {
			Self::Audio(_) => MediaKind::Audio,
			Self::Video(_) => MediaKind::Video,
		}
	}

	pub fn is_supported(&self) -> bool {
		match self {
			Self::Audio(config) => config.codec.is_supported(),
			Self::Video(config) => config.codec.is_supported(),
		}
	}
}

/// A parsed `audio/mp4` / `video/mp4` mime string with an optional codec
/// list, ex. `video/mp4; codecs="avc1.640028"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MimeType {
	pub kind: MediaKind,
	pub codecs: Vec<String>,
}

impl FromStr for MimeType {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut parts = s.split(';');
		let essence = parts.next().unwrap_or_default().trim();

		let kind = match essence {
			"audio/mp4" => MediaKind::Audio,
			"video/mp4" => MediaKind::Video,
			_ => return Err(Error::UnsupportedType(s.to_string())),
		};

		let mut codecs = Vec::new();
		for param in parts {
			let Some((key, value)) = param.split_once('=') else {
				continue;
			};
			if key.trim() != "codecs" {
				continue;
			}

			let value = value.trim().trim_matches('"');
			codecs.extend(value.split(',').map(|c| c.trim().to_string()).filter(|c| !c.is_empty()));
		}

		Ok(Self { kind, codecs })
	}
}
